use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::registry::SessionRegistry;
use crate::session::{ClientEvent, ServerEvent};

static CONNECTION_SEQ: AtomicU64 = AtomicU64::new(1);

/// Accepts interactive clients until `token` is cancelled
///
/// Every connection is one session. Each line a client sends is one JSON
/// [`ClientEvent`]; each line it receives is one JSON [`ServerEvent`].
pub async fn serve(
    listener: TcpListener,
    registry: Arc<SessionRegistry>,
    token: CancellationToken,
) -> std::io::Result<()> {
    log::info!("Interactive sessions on {}", listener.local_addr()?);

    loop {
        tokio::select! {
            _ = token.cancelled() => {
                log::info!("Session gateway stopping");
                break;
            }
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        log::warn!("Failed to accept connection: {e}");
                        continue;
                    }
                };
                let connection_id = format!("conn-{}", CONNECTION_SEQ.fetch_add(1, Ordering::Relaxed));
                log::info!("Client connected: {connection_id} from {peer}");
                tokio::spawn(handle_connection(stream, connection_id, registry.clone()));
            }
        }
    }
    Ok(())
}

async fn handle_connection(stream: TcpStream, connection_id: String, registry: Arc<SessionRegistry>) {
    let (reader, mut writer) = stream.into_split();
    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<ServerEvent>();
    let session = registry.attach(&connection_id, outbound_tx.clone());

    let writer_task = tokio::spawn(async move {
        while let Some(event) = outbound_rx.recv().await {
            let mut line = match serde_json::to_vec(&event) {
                Ok(line) => line,
                Err(e) => {
                    log::error!("Failed to encode {event:?}: {e}");
                    continue;
                }
            };
            line.push(b'\n');
            if writer.write_all(&line).await.is_err() {
                break;
            }
        }
    });

    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                let parsed = std::str::from_utf8(&buf)
                    .map_err(|e| e.to_string())
                    .map(str::trim)
                    .and_then(|line| {
                        if line.is_empty() {
                            return Ok(None);
                        }
                        serde_json::from_str::<ClientEvent>(line)
                            .map(Some)
                            .map_err(|e| e.to_string())
                    });
                match parsed {
                    Ok(None) => continue,
                    Ok(Some(ClientEvent::Disconnect)) => break,
                    Ok(Some(event)) => {
                        if !session.send(event) {
                            break;
                        }
                    }
                    Err(e) => {
                        let reply = ServerEvent::output(format!("Invalid message: {e}\n"));
                        if outbound_tx.send(reply).is_err() {
                            log::debug!("Connection {connection_id} gone, invalid-message reply dropped");
                        }
                    }
                }
            }
            Err(e) => {
                log::warn!("Read from {connection_id} failed: {e}");
                break;
            }
        }
    }

    log::info!("Client disconnected: {connection_id}");
    registry.detach(&connection_id);
    drop(outbound_tx);
    // the writer ends once the session has sent its last event
    let _ = writer_task.await;
}
