use anyhow::Result;
use peermesh::{MeshConfig, MeshCoordinator};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let mut config = MeshConfig::default();
    if let Ok(url) = std::env::var("PEERMESH_SIGNALING_URL") {
        config.signaling_url = url;
    }
    config.storage_path = Some(std::env::temp_dir().join("peermesh-room-id"));
    config.capture_audio = std::env::var("PEERMESH_CAPTURE_AUDIO").is_ok();

    let mesh = MeshCoordinator::new(config);

    let room = match std::env::args().nth(1) {
        Some(id) => mesh.join_room(Some(id)).await?,
        None => match mesh.rejoin_stored().await? {
            Some(id) => id,
            None => mesh.join_room(None).await?,
        },
    };
    println!("joined room {} as {}", room, mesh.user_id());
    println!("share the room id to let others join; ctrl-c to leave");

    let mut updates = mesh.subscribe();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            changed = updates.changed() => {
                if changed.is_err() {
                    break;
                }
                let snapshot = updates.borrow().clone();
                println!(
                    "[{}] participants: {} | streams: {} | audio {} | video {}{}",
                    snapshot.lifecycle,
                    snapshot.participant_count(),
                    snapshot.remote_streams.len(),
                    if snapshot.audio_enabled { "on" } else { "off" },
                    if snapshot.video_enabled { "on" } else { "off" },
                    snapshot
                        .last_error
                        .as_deref()
                        .map(|e| format!(" | error: {}", e))
                        .unwrap_or_default(),
                );
            }
        }
    }

    mesh.leave_room().await?;
    Ok(())
}
