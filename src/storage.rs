//! Persisted room id, so a restarted client can silently rejoin.

use std::fs;
use std::io;
use std::path::PathBuf;

/// One string of client-local persistent state: the current room id,
/// written on join, removed on leave, read on startup.
pub struct RoomStore {
    path: PathBuf,
}

impl RoomStore {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    /// Room id remembered from a prior session, if any.
    pub fn load(&self) -> Option<String> {
        let contents = fs::read_to_string(&self.path).ok()?;
        let id = contents.trim();
        if id.is_empty() {
            None
        } else {
            Some(id.to_string())
        }
    }

    pub fn save(&self, room_id: &str) -> io::Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&self.path, room_id)
    }

    pub fn clear(&self) -> io::Result<()> {
        match fs::remove_file(&self.path) {
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            other => other,
        }
    }
}
