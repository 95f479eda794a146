//! TCP listener and per-connection request cycle.
//!
//! Each accepted connection gets its own task and at most one
//! read→decode→authenticate→dispatch→encode cycle before the socket is
//! half-closed and dropped. Failures stay inside their connection task;
//! the accept loop keeps running regardless.

use crate::auth::{Authenticator, AUTH_FAILED_MESSAGE};
use crate::registry::CommandRegistry;
use anyhow::{Context, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};
use uuid::Uuid;
use warden_proto::{envelope, Request, Response};

/// Requests larger than this are rejected rather than buffered without
/// bound.
const MAX_REQUEST_BYTES: usize = 64 * 1024;

pub const MALFORMED_REQUEST_MESSAGE: &str = "Invalid JSON format.";

pub struct Dispatcher {
    listener: TcpListener,
    auth: Arc<Authenticator>,
    registry: Arc<CommandRegistry>,
    read_timeout: Duration,
}

impl Dispatcher {
    pub async fn bind(
        addr: SocketAddr,
        auth: Arc<Authenticator>,
        registry: Arc<CommandRegistry>,
        read_timeout: Duration,
    ) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("failed to bind listener on {addr}"))?;
        Ok(Self {
            listener,
            auth,
            registry,
            read_timeout,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.listener
            .local_addr()
            .context("listener has no local address")
    }

    /// Accept loop. Runs until the process exits; individual accept
    /// failures are logged and skipped.
    pub async fn serve(self) -> Result<()> {
        info!(addr = %self.local_addr()?, "warden agent listening");
        loop {
            match self.listener.accept().await {
                Ok((stream, peer)) => {
                    let auth = Arc::clone(&self.auth);
                    let registry = Arc::clone(&self.registry);
                    let read_timeout = self.read_timeout;
                    tokio::spawn(async move {
                        handle_connection(stream, peer, auth, registry, read_timeout).await;
                    });
                }
                Err(err) => warn!(error = %err, "accept failed"),
            }
        }
    }
}

async fn handle_connection(
    mut stream: TcpStream,
    peer: SocketAddr,
    auth: Arc<Authenticator>,
    registry: Arc<CommandRegistry>,
    read_timeout: Duration,
) {
    let connection_id = Uuid::new_v4();
    debug!(%connection_id, %peer, "connection accepted");

    let response = match read_request(&mut stream, read_timeout).await {
        Ok(Some(request)) => {
            if auth.verify(&request.token) {
                registry.dispatch(&request.command, request.fields).await
            } else {
                Response::failure(AUTH_FAILED_MESSAGE)
            }
        }
        Ok(None) => {
            debug!(%connection_id, "connection closed before any request");
            return;
        }
        Err(ReadError::Malformed) => Response::failure(MALFORMED_REQUEST_MESSAGE),
        Err(ReadError::Io(err)) => {
            warn!(%connection_id, error = %err, "request read failed");
            return;
        }
    };

    if let Err(err) = send_response(&mut stream, &response).await {
        warn!(%connection_id, error = %err, "response write failed");
    }
    debug!(%connection_id, success = response.success, "connection finished");
}

enum ReadError {
    /// Bytes arrived but never became valid JSON.
    Malformed,
    Io(std::io::Error),
}

/// Accumulates bytes until they parse as a request. The first read waits
/// for the client indefinitely; once data has arrived, the idle timeout
/// bounds each further read.
async fn read_request(
    stream: &mut TcpStream,
    read_timeout: Duration,
) -> Result<Option<Request>, ReadError> {
    let mut buffer = Vec::new();
    let mut chunk = [0u8; 4096];
    loop {
        let read = if buffer.is_empty() {
            stream.read(&mut chunk).await.map_err(ReadError::Io)?
        } else {
            match tokio::time::timeout(read_timeout, stream.read(&mut chunk)).await {
                Ok(result) => result.map_err(ReadError::Io)?,
                // Idle mid-request: whatever arrived is all we will get.
                Err(_) => 0,
            }
        };

        if read == 0 {
            return if buffer.is_empty() {
                Ok(None)
            } else {
                // Either a parse-failed complete payload or a truncated one;
                // indistinguishable here, both are malformed frames.
                Err(ReadError::Malformed)
            };
        }

        buffer.extend_from_slice(&chunk[..read]);
        if buffer.len() > MAX_REQUEST_BYTES {
            warn!(bytes = buffer.len(), "request exceeds size cap");
            return Err(ReadError::Malformed);
        }

        if let Ok(request) = envelope::decode_request(&buffer) {
            return Ok(Some(request));
        }
    }
}

/// Writes the length-prefixed frame, then half-closes the write side so the
/// peer sees a clean end of stream before the socket is dropped.
async fn send_response(stream: &mut TcpStream, response: &Response) -> std::io::Result<()> {
    let frame = envelope::encode(response);
    stream.write_all(&frame).await?;
    stream.shutdown().await
}
