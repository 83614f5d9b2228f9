//! Listener setup and the accept loop.

use crate::error::RelayError;
use crate::relay::bus::BusSender;
use crate::relay::connection::{Connection, ConnectionLimits};
use crate::relay::registry::Registry;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{watch, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

/// Resolve `address` and bind the first address that accepts.
pub async fn bind(address: &str) -> Result<TcpListener, RelayError> {
    let bind_error = |source| RelayError::Bind {
        address: address.to_string(),
        source,
    };

    let mut last_error = None;
    for addr in tokio::net::lookup_host(address).await.map_err(bind_error)? {
        match create_listener(addr) {
            Ok(listener) => return TcpListener::from_std(listener).map_err(bind_error),
            Err(e) => {
                debug!(addr = %addr, error = %e, "Bind attempt failed");
                last_error = Some(e);
            }
        }
    }

    Err(bind_error(last_error.unwrap_or_else(|| {
        io::Error::new(io::ErrorKind::AddrNotAvailable, "address resolved to nothing")
    })))
}

fn create_listener(addr: SocketAddr) -> io::Result<std::net::TcpListener> {
    let socket = socket2::Socket::new(
        match addr {
            SocketAddr::V4(_) => socket2::Domain::IPV4,
            SocketAddr::V6(_) => socket2::Domain::IPV6,
        },
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(1024)?;

    Ok(socket.into())
}

/// Pause after an accept error that is likely to repeat immediately
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// How long to wait before accepting again after `e`.
///
/// Errors tied to a single incoming connection are retried at once;
/// anything else (e.g. running out of file descriptors) backs off.
fn accept_backoff(e: &io::Error) -> Option<Duration> {
    match e.kind() {
        io::ErrorKind::ConnectionAborted
        | io::ErrorKind::ConnectionReset
        | io::ErrorKind::Interrupted
        | io::ErrorKind::WouldBlock => None,
        _ => Some(ACCEPT_BACKOFF),
    }
}

/// Accepts connections and spawns one reader task per client.
pub struct Acceptor {
    listener: TcpListener,
    registry: Registry,
    bus: BusSender,
    limits: ConnectionLimits,
    connection_limit: Arc<Semaphore>,
    readers: JoinSet<()>,
}

impl Acceptor {
    pub fn new(
        listener: TcpListener,
        registry: Registry,
        bus: BusSender,
        limits: ConnectionLimits,
        max_connections: usize,
    ) -> Self {
        Self {
            listener,
            registry,
            bus,
            limits,
            connection_limit: Arc::new(Semaphore::new(max_connections)),
            readers: JoinSet::new(),
        }
    }

    /// Accept until `shutdown` flips. The listener and this task's bus
    /// sender are dropped on return; the still-running reader tasks are
    /// handed back so the caller can wait for them.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> JoinSet<()> {
        loop {
            // Wait for a connection slot
            let permit = tokio::select! {
                biased;
                _ = shutdown.changed() => break,
                permit = Arc::clone(&self.connection_limit).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            let accepted = tokio::select! {
                biased;
                _ = shutdown.changed() => break,
                accepted = self.listener.accept() => accepted,
            };

            match accepted {
                Ok((stream, addr)) => self.spawn_reader(stream, addr, permit),
                Err(e) => {
                    error!(error = %e, "Failed to accept connection");
                    if let Some(delay) = accept_backoff(&e) {
                        drop(permit);
                        tokio::select! {
                            biased;
                            _ = shutdown.changed() => break,
                            _ = tokio::time::sleep(delay) => {}
                        }
                    }
                }
            }

            self.reap_readers();
        }

        info!("Listener closed");
        self.readers
    }

    fn spawn_reader(&mut self, stream: TcpStream, addr: SocketAddr, permit: OwnedSemaphorePermit) {
        let connection = match Connection::from_stream(stream, self.limits) {
            Ok(connection) => connection,
            Err(e) => {
                warn!(peer = %addr, error = %e, "Dropping connection");
                return;
            }
        };

        let client = Arc::clone(connection.client());
        if !self.registry.add(Arc::clone(&client)) {
            warn!(client = %client.id(), "Duplicate client identity, dropping connection");
            return;
        }
        info!(client = %client.id(), "Client connected");

        let bus = self.bus.clone();
        let registry = self.registry.clone();
        let publish_timeout = self.limits.publish_timeout;
        self.readers.spawn(async move {
            connection.run(bus, registry, publish_timeout).await;
            drop(permit);
        });
    }

    /// Collect finished reader tasks so the set does not grow unbounded.
    fn reap_readers(&mut self) {
        while let Some(joined) = self.readers.try_join_next() {
            if let Err(e) = joined {
                if e.is_panic() {
                    error!(error = %e, "Reader task panicked");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::bus;
    use tokio::io::AsyncWriteExt;

    fn limits() -> ConnectionLimits {
        ConnectionLimits {
            write_timeout: Duration::from_millis(200),
            publish_timeout: Duration::from_millis(200),
            max_frame_len: 1024,
        }
    }

    async fn wait_for_clients(registry: &Registry, n: usize) {
        tokio::time::timeout(Duration::from_secs(2), async {
            while registry.len() != n {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("clients did not register in time");
    }

    #[test]
    fn test_accept_backoff() {
        // EMFILE: retrying at once would spin
        let exhausted = io::Error::from_raw_os_error(24);
        assert_eq!(accept_backoff(&exhausted), Some(ACCEPT_BACKOFF));

        let aborted = io::Error::from(io::ErrorKind::ConnectionAborted);
        assert_eq!(accept_backoff(&aborted), None);
    }

    #[tokio::test]
    async fn test_bind_ephemeral_port() {
        let listener = bind("127.0.0.1:0").await.unwrap();
        assert_ne!(listener.local_addr().unwrap().port(), 0);
    }

    #[tokio::test]
    async fn test_bind_conflict_is_bind_error() {
        let first = bind("127.0.0.1:0").await.unwrap();
        let addr = first.local_addr().unwrap().to_string();

        // Same port while the first listener is still listening
        let err = bind(&addr).await.unwrap_err();
        assert!(matches!(err, RelayError::Bind { .. }));
    }

    #[tokio::test]
    async fn test_accepts_registers_and_stops() {
        let listener = bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let registry = Registry::new();
        let (tx, mut rx) = bus::channel(8);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let acceptor = Acceptor::new(listener, registry.clone(), tx, limits(), 16);
        let task = tokio::spawn(acceptor.run(shutdown_rx));

        let mut stream = TcpStream::connect(addr).await.unwrap();
        wait_for_clients(&registry, 1).await;
        let id = stream.local_addr().unwrap().to_string();
        assert!(registry.contains(&id));

        stream.write_all(b"hello\n").await.unwrap();
        let message = rx.recv().await.unwrap();
        assert_eq!(&*message.sender_id, id);
        assert_eq!(message.payload, "hello");

        shutdown_tx.send(true).unwrap();
        let mut readers = task.await.unwrap();

        // Listener is gone
        assert!(TcpStream::connect(addr).await.is_err());

        // Reader ends once the peer leaves
        drop(stream);
        while readers.join_next().await.is_some() {}
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_connection_limit_defers_accept() {
        let listener = bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let registry = Registry::new();
        let (tx, _rx) = bus::channel(8);
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);

        let acceptor = Acceptor::new(listener, registry.clone(), tx, limits(), 1);
        tokio::spawn(acceptor.run(shutdown_rx));

        let first = TcpStream::connect(addr).await.unwrap();
        wait_for_clients(&registry, 1).await;

        // Completes the handshake in the backlog but is not accepted yet
        let second = TcpStream::connect(addr).await.unwrap();
        let second_id = second.local_addr().unwrap().to_string();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(registry.len(), 1);
        assert!(!registry.contains(&second_id));

        drop(first);
        tokio::time::timeout(Duration::from_secs(2), async {
            while !registry.contains(&second_id) {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("second client should be accepted once a slot frees up");
        assert_eq!(registry.len(), 1);
    }
}
