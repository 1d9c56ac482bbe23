// Unix socket server for the line command protocol

use anyhow::{Context, Result};
use std::path::Path;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::task;

use crate::bandwidth::BandwidthController;
use crate::command;
use crate::protocol;

/// Bind `path` (replacing a stale socket file) and serve clients until the
/// listener fails
pub async fn serve(controller: Arc<BandwidthController>, path: &Path) -> Result<()> {
    if path.exists() {
        std::fs::remove_file(path)
            .context(format!("Failed to remove stale socket: {:?}", path))?;
    }

    let listener =
        UnixListener::bind(path).context(format!("Failed to bind socket: {:?}", path))?;
    log::info!("Listening on {:?}", path);

    loop {
        let (stream, _) = listener
            .accept()
            .await
            .context("Failed to accept client")?;
        let controller = controller.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_client(controller, stream).await {
                log::warn!("Client connection ended with error: {:#}", e);
            }
        });
    }
}

/// Execute every line a client sends, replying to each before reading the next
async fn handle_client(controller: Arc<BandwidthController>, stream: UnixStream) -> Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();
    log::debug!("Client connected");

    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }

        let controller = controller.clone();
        let response = task::spawn_blocking(move || {
            protocol::format_response(&command::dispatch(&controller, &line))
        })
        .await
        .context("Command worker panicked")?;

        writer.write_all(response.as_bytes()).await?;
        writer.flush().await?;
    }

    log::debug!("Client disconnected");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeQuota, FakeSink};
    use std::time::Duration;

    #[tokio::test]
    async fn test_serve_round_trip() {
        let path = std::env::temp_dir().join(format!("bwcontrol-test-{}.sock", std::process::id()));
        let sink = Arc::new(FakeSink::default());
        let controller = Arc::new(BandwidthController::new(
            sink.clone(),
            Arc::new(FakeQuota::default()),
        ));

        let server_path = path.clone();
        let server = tokio::spawn(async move { serve(controller, &server_path).await });

        let mut client = None;
        for _ in 0..50 {
            if let Ok(stream) = UnixStream::connect(&path).await {
                client = Some(stream);
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let client = client.expect("server did not come up");
        let (reader, mut writer) = client.into_split();
        let mut lines = BufReader::new(reader).lines();

        writer
            .write_all(b"bandwidth datasaver enable\nbandwidth bogus\n")
            .await
            .unwrap();
        assert_eq!(
            lines.next_line().await.unwrap().unwrap(),
            "200 0 Bandwidth command succeeded"
        );
        assert!(lines.next_line().await.unwrap().unwrap().starts_with("500 0 "));
        assert_eq!(sink.take_calls().len(), 2);

        server.abort();
        let _ = std::fs::remove_file(&path);
    }
}
