//! CLI command implementations

use std::path::PathBuf;
use std::time::Duration;

use ebbtide_core::Result;
use ebbtide_core::config::EbbtideConfig;
use ebbtide_core::session::Session;
use ebbtide_core::torrent::Metainfo;

/// Runs the engine until interrupted.
///
/// Restores the previous session, adds the given torrent files, starts
/// everything and reports status every five seconds until Ctrl-C. The
/// session is saved after adding and again after shutdown.
///
/// # Errors
/// - `EbbtideError::Torrent` - A torrent file could not be read or parsed
/// - `EbbtideError::Session` - The session snapshot could not be written
pub async fn run(
    torrents: Vec<PathBuf>,
    port: Option<u16>,
    session_path: Option<PathBuf>,
) -> Result<()> {
    let mut config = EbbtideConfig::from_env();
    if let Some(port) = port {
        config.session.listen_port = port;
    }
    if let Some(path) = session_path {
        config.session.snapshot_path = path;
    }

    let session = Session::load(config).await;

    for path in torrents {
        let metainfo = Metainfo::load(&path).await?;
        match session.add_torrent(metainfo).await {
            Ok(torrent) => torrent.start(),
            Err(error) => tracing::warn!("skipping {}: {error}", path.display()),
        }
    }
    session.save().await?;

    let mut status = tokio::time::interval(Duration::from_secs(5));
    loop {
        tokio::select! {
            _ = status.tick() => session.debug().await,
            result = tokio::signal::ctrl_c() => {
                if let Err(error) = result {
                    tracing::error!("could not listen for shutdown signal: {error}");
                }
                break;
            }
        }
    }

    session.shutdown().await;
    session.save().await?;
    tracing::info!("session saved");
    Ok(())
}

/// Prints the contents of a torrent file.
///
/// # Errors
/// - `EbbtideError::Torrent` - File could not be read or parsed
pub async fn show(path: PathBuf) -> Result<()> {
    let metainfo = Metainfo::load(&path).await?;

    println!("Name: {}", metainfo.name);
    println!("Info hash: {}", metainfo.info_hash);
    println!(
        "Size: {} bytes in {} pieces of {} bytes",
        metainfo.total_length(),
        metainfo.piece_count(),
        metainfo.piece_length
    );
    println!("Private: {}", if metainfo.private { "yes" } else { "no" });
    if let Some(created_by) = &metainfo.created_by {
        println!("Created by: {created_by}");
    }
    if let Some(creation_date) = metainfo.creation_date {
        println!("Created on: {creation_date}");
    }
    if let Some(comment) = &metainfo.comment {
        println!("Comment: {comment}");
    }

    println!("Trackers:");
    for url in &metainfo.announce_list {
        println!("  {url}");
    }

    println!("Files:");
    for file in &metainfo.files {
        println!("  {} ({} bytes)", file.path.display(), file.length);
    }

    Ok(())
}
