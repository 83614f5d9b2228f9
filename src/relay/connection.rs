//! Per-client connection handling.
//!
//! A TCP stream is split in two. The read half becomes a `Connection`,
//! owned by the client's reader task, which turns incoming bytes into
//! frames and publishes them on the bus. The write half goes into a shared
//! `Client` handle; the broadcaster and the shutdown path only ever write
//! through it.

use crate::error::RelayError;
use crate::relay::bus::{BusSender, Message};
use crate::relay::framing::FrameReader;
use crate::relay::registry::Registry;
use bytes::Bytes;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::TcpStream;
use tokio::sync::{Mutex, Notify};
use tracing::{debug, info, trace, warn};

type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Timing and size limits applied to every connection.
#[derive(Debug, Clone, Copy)]
pub struct ConnectionLimits {
    pub write_timeout: Duration,
    pub publish_timeout: Duration,
    pub max_frame_len: usize,
}

/// Send-side handle of a connected client.
pub struct Client {
    id: Arc<str>,
    writer: Mutex<BoxedWriter>,
    write_timeout: Duration,
    closed: AtomicBool,
    halt: Notify,
}

impl Client {
    pub fn new<W>(id: impl Into<Arc<str>>, writer: W, write_timeout: Duration) -> Self
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self {
            id: id.into(),
            writer: Mutex::new(Box::new(writer)),
            write_timeout,
            closed: AtomicBool::new(false),
            halt: Notify::new(),
        }
    }

    pub fn id(&self) -> &Arc<str> {
        &self.id
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Write one already-framed message.
    ///
    /// Waiting for the writer lock counts against the deadline too.
    pub async fn send(&self, frame: &[u8]) -> Result<(), RelayError> {
        if self.is_closed() {
            return Err(RelayError::Transport(io::ErrorKind::NotConnected.into()));
        }

        let write = async {
            let mut writer = self.writer.lock().await;
            writer.write_all(frame).await?;
            writer.flush().await
        };

        match tokio::time::timeout(self.write_timeout, write).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(RelayError::WriteTimeout(self.write_timeout)),
        }
    }

    /// Close the connection. Only the first call does anything; it returns
    /// `true`, every later call returns `false`.
    pub async fn close(&self) -> bool {
        if self.closed.swap(true, Ordering::AcqRel) {
            return false;
        }

        // Wake the reader task
        self.halt.notify_one();

        let shutdown = async { self.writer.lock().await.shutdown().await };
        match tokio::time::timeout(self.write_timeout, shutdown).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => debug!(client = %self.id, error = %e, "Error while closing client"),
            Err(_) => debug!(client = %self.id, "Timed out closing client"),
        }

        info!(client = %self.id, "Client disconnected");
        true
    }

    /// Resolves once `close` has been called.
    async fn halted(&self) {
        if self.is_closed() {
            return;
        }
        self.halt.notified().await;
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("id", &self.id)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Receive side of a client connection.
pub struct Connection<R> {
    client: Arc<Client>,
    frames: FrameReader<R>,
}

impl Connection<OwnedReadHalf> {
    /// Wrap an accepted stream; the client is identified by its peer address.
    pub fn from_stream(stream: TcpStream, limits: ConnectionLimits) -> io::Result<Self> {
        let id = stream.peer_addr()?.to_string();
        let (reader, writer) = stream.into_split();
        Ok(Self::new(id, reader, writer, limits))
    }
}

impl<R: AsyncRead + Unpin> Connection<R> {
    pub fn new<W>(id: impl Into<Arc<str>>, reader: R, writer: W, limits: ConnectionLimits) -> Self
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self {
            client: Arc::new(Client::new(id, writer, limits.write_timeout)),
            frames: FrameReader::new(reader, limits.max_frame_len),
        }
    }

    pub fn client(&self) -> &Arc<Client> {
        &self.client
    }

    /// Next frame from the peer, `Ok(None)` at end of stream.
    pub async fn read_frame(&mut self) -> Result<Option<Bytes>, RelayError> {
        self.frames.read_frame().await
    }

    /// Reader loop: publish every frame until the peer goes away or the
    /// client is closed, then deregister and close.
    pub async fn run(mut self, bus: BusSender, registry: Registry, publish_timeout: Duration) {
        let client = Arc::clone(&self.client);

        loop {
            let frame = tokio::select! {
                biased;
                _ = client.halted() => break,
                frame = self.read_frame() => frame,
            };

            match frame {
                Ok(Some(payload)) => {
                    trace!(client = %client.id(), len = payload.len(), "Received message");
                    let message = Message::new(Arc::clone(client.id()), payload);
                    if let Err(e) = bus.publish(message, publish_timeout).await {
                        warn!(client = %client.id(), error = %e, "Dropping client");
                        break;
                    }
                }
                Ok(None) => {
                    trace!(client = %client.id(), "Connection closed by client");
                    break;
                }
                Err(e) if e.is_recoverable() => {
                    warn!(client = %client.id(), error = %e, "Discarding frame");
                }
                Err(e) => {
                    warn!(client = %client.id(), error = %e, "Read failed");
                    break;
                }
            }
        }

        registry.remove_client(&client);
        client.close().await;
    }
}
