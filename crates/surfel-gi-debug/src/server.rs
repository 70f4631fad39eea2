//! TCP debug server

use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use tokio::sync::Mutex;

use crate::protocol::{DebugCommand, DebugResponse};

/// Implemented by the application to apply remote GI commands
pub trait DebugHandler: Send + Sync + 'static {
    fn handle_command(&mut self, cmd: DebugCommand) -> DebugResponse;
}

/// Debug server handle - keep this alive to keep the server running
pub struct DebugServer {
    _handle: tokio::task::JoinHandle<()>,
}

impl DebugServer {
    /// Start listening on 127.0.0.1:`port`. Must be called from inside a tokio
    /// runtime; returns immediately and serves clients in the background.
    pub fn start(handler: Arc<Mutex<dyn DebugHandler>>, port: u16) -> Self {
        let handle = tokio::spawn(async move {
            let addr = format!("127.0.0.1:{}", port);
            let listener = match TcpListener::bind(&addr).await {
                Ok(l) => {
                    log::info!("GI debug server listening on {}", addr);
                    l
                }
                Err(e) => {
                    log::error!("Failed to bind GI debug server on {}: {}", addr, e);
                    return;
                }
            };
            serve(listener, handler).await;
        });

        Self { _handle: handle }
    }
}

async fn serve(listener: TcpListener, handler: Arc<Mutex<dyn DebugHandler>>) {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                log::info!("GI debug client connected from {}", peer);
                let handler = handler.clone();
                tokio::spawn(async move {
                    handle_connection(stream, handler).await;
                    log::info!("GI debug client disconnected: {}", peer);
                });
            }
            Err(e) => log::error!("GI debug server accept error: {}", e),
        }
    }
}

/// Decode one JSON line, run it through the handler and encode the reply
/// (newline terminated). Returns `None` for blank lines.
async fn respond(line: &str, handler: &Arc<Mutex<dyn DebugHandler>>) -> Option<String> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return None;
    }

    let response = match serde_json::from_str::<DebugCommand>(trimmed) {
        Ok(cmd) => {
            log::debug!("GI debug command: {:?}", cmd);
            handler.lock().await.handle_command(cmd)
        }
        Err(e) => DebugResponse::error(format!("Invalid command JSON: {}", e)),
    };

    let mut json = serde_json::to_string(&response).unwrap_or_else(|e| {
        format!("{{\"status\":\"error\",\"message\":\"Serialize error: {}\"}}", e)
    });
    json.push('\n');
    Some(json)
}

async fn handle_connection(stream: tokio::net::TcpStream, handler: Arc<Mutex<dyn DebugHandler>>) {
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);
    let mut line = String::new();

    loop {
        line.clear();
        match reader.read_line(&mut line).await {
            Ok(0) => break,
            Ok(_) => {
                let Some(reply) = respond(&line, &handler).await else {
                    continue;
                };
                if let Err(e) = writer.write_all(reply.as_bytes()).await {
                    log::error!("GI debug server write error: {}", e);
                    break;
                }
                if let Err(e) = writer.flush().await {
                    log::error!("GI debug server flush error: {}", e);
                    break;
                }
            }
            Err(e) => {
                log::error!("GI debug server read error: {}", e);
                break;
            }
        }
    }
}
