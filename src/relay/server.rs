//! Relay server lifecycle.
//!
//! `Created -> Listening -> Draining -> Closed`. The server owns the
//! listener, registry, bus and broadcaster; `run` and `stop` are the only
//! operations the process entrypoint needs.

use crate::config::Config;
use crate::error::RelayError;
use crate::relay::acceptor::{self, Acceptor};
use crate::relay::broadcaster::{Broadcaster, FanOut};
use crate::relay::bus;
use crate::relay::connection::{Client, ConnectionLimits};
use crate::relay::framing;
use crate::relay::registry::Registry;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{timeout_at, Instant};
use tracing::{debug, error, info, warn};

/// Server lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    /// Bound, not accepting yet.
    Created,
    Listening,
    /// Stop in progress.
    Draining,
    Closed,
}

impl std::fmt::Display for ServerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ServerState::Created => "created",
            ServerState::Listening => "listening",
            ServerState::Draining => "draining",
            ServerState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Background tasks of a listening server.
struct Running {
    shutdown: watch::Sender<bool>,
    acceptor: JoinHandle<JoinSet<()>>,
    broadcaster: JoinHandle<FanOut>,
}

/// Broadcast relay server
pub struct Server {
    config: Config,
    local_addr: SocketAddr,
    registry: Registry,
    state: watch::Sender<ServerState>,
    listener: Mutex<Option<TcpListener>>,
    running: Mutex<Option<Running>>,
}

impl Server {
    /// Bind the configured address. Bind failure is fatal and returned here.
    pub async fn bind(config: Config) -> Result<Self, RelayError> {
        let address = config.address();
        let listener = acceptor::bind(&address).await?;
        let local_addr = listener.local_addr()?;
        info!(address = %address, local_addr = %local_addr, "Server bound");

        let (state, _) = watch::channel(ServerState::Created);
        Ok(Server {
            config,
            local_addr,
            registry: Registry::new(),
            state,
            listener: Mutex::new(Some(listener)),
            running: Mutex::new(None),
        })
    }

    #[allow(dead_code)]
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    #[allow(dead_code)]
    pub fn state(&self) -> ServerState {
        *self.state.borrow()
    }

    /// Number of currently registered clients.
    #[allow(dead_code)]
    pub fn client_count(&self) -> usize {
        self.registry.len()
    }

    /// Start accepting connections and broadcasting.
    pub fn start(&self) -> Result<(), RelayError> {
        // Held until `Running` is stored, so a concurrent `stop` that sees
        // `Listening` always finds the tasks to drain.
        let mut running = self.running.lock().unwrap_or_else(PoisonError::into_inner);
        self.transition("start", ServerState::Created, ServerState::Listening)?;

        let listener = self
            .listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or(RelayError::Lifecycle {
                operation: "start",
                state: ServerState::Listening,
            })?;

        let limits = ConnectionLimits {
            write_timeout: self.config.write_timeout,
            publish_timeout: self.config.publish_timeout,
            max_frame_len: self.config.max_frame_len,
        };

        let (bus_tx, bus_rx) = bus::channel(self.config.bus_capacity);
        let (shutdown, shutdown_rx) = watch::channel(false);

        let broadcaster =
            tokio::spawn(Broadcaster::new(bus_rx, self.registry.clone()).run());
        let acceptor = Acceptor::new(
            listener,
            self.registry.clone(),
            bus_tx,
            limits,
            self.config.max_connections,
        );
        let acceptor = tokio::spawn(acceptor.run(shutdown_rx));

        *running = Some(Running {
            shutdown,
            acceptor,
            broadcaster,
        });
        drop(running);

        info!(
            address = %self.local_addr,
            bus_capacity = self.config.bus_capacity,
            max_connections = self.config.max_connections,
            "Server listening"
        );
        Ok(())
    }

    /// Start, then block until the server has been stopped.
    pub async fn run(&self) -> Result<(), RelayError> {
        self.start()?;
        self.closed().await;
        Ok(())
    }

    /// Resolves once the server reaches `Closed`.
    pub async fn closed(&self) {
        let mut state = self.state.subscribe();
        // The sender lives in `self`, so this only ends on `Closed`
        let _ = state.wait_for(|s| *s == ServerState::Closed).await;
    }

    /// Graceful shutdown. Returns once every client connection is closed or
    /// the grace period has run out and the stragglers were aborted.
    pub async fn stop(&self) -> Result<(), RelayError> {
        let mut previous = ServerState::Created;
        self.state.send_if_modified(|state| {
            previous = *state;
            match *state {
                ServerState::Listening => *state = ServerState::Draining,
                ServerState::Created => *state = ServerState::Closed,
                ServerState::Draining | ServerState::Closed => return false,
            }
            true
        });

        match previous {
            ServerState::Listening => {}
            ServerState::Created => {
                // Never started: just release the listener
                self.listener
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .take();
                info!("Server stopped");
                return Ok(());
            }
            ServerState::Draining | ServerState::Closed => {
                return Err(RelayError::Lifecycle {
                    operation: "stop",
                    state: previous,
                });
            }
        }

        info!(clients = self.registry.len(), "Server draining");

        let running = self
            .running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        if let Some(running) = running {
            self.drain(running).await;
        }

        self.state.send_replace(ServerState::Closed);
        info!("Server stopped");
        Ok(())
    }

    async fn drain(&self, running: Running) {
        let Running {
            shutdown,
            acceptor,
            mut broadcaster,
        } = running;

        // Stop accepting; the acceptor drops the listener on its way out
        let _ = shutdown.send(true);
        let mut readers = match acceptor.await {
            Ok(readers) => readers,
            Err(e) => {
                error!(error = %e, "Acceptor task failed");
                JoinSet::new()
            }
        };

        let clients = self.notify_and_close().await;

        let deadline = Instant::now() + self.config.shutdown_grace;

        // Readers exit once their connection is closed, releasing their bus
        // senders; the broadcaster then drains what is left and returns.
        loop {
            match timeout_at(deadline, readers.join_next()).await {
                Ok(Some(_)) => continue,
                Ok(None) => break,
                Err(_) => {
                    warn!(remaining = readers.len(), "Grace period elapsed, aborting readers");
                    readers.shutdown().await;
                    break;
                }
            }
        }

        match timeout_at(deadline, &mut broadcaster).await {
            Ok(Ok(totals)) => debug!(failed = totals.failed, "Broadcaster drained"),
            Ok(Err(e)) => error!(error = %e, "Broadcaster task failed"),
            Err(_) => {
                warn!("Grace period elapsed, aborting broadcaster");
                broadcaster.abort();
                let _ = broadcaster.await;
            }
        }

        // Aborted readers never deregistered themselves
        for client in clients {
            if self.registry.remove(client.id()).is_some() {
                debug!(client = %client.id(), "Removed client left by aborted reader");
            }
        }
    }

    /// Send the shutdown notice to every registered client and close each.
    /// Returns the clients that were closed.
    async fn notify_and_close(&self) -> Vec<Arc<Client>> {
        let notice = framing::encode(self.config.shutdown_notice.as_bytes());
        let clients = self.registry.snapshot();
        let mut closing = JoinSet::new();

        for client in clients.iter().cloned() {
            let notice = notice.clone();
            closing.spawn(async move {
                if let Err(e) = client.send(&notice).await {
                    warn!(client = %client.id(), error = %e, "Failed to send shutdown notice");
                }
                client.close().await;
            });
        }

        while closing.join_next().await.is_some() {}
        clients
    }

    fn transition(
        &self,
        operation: &'static str,
        from: ServerState,
        to: ServerState,
    ) -> Result<(), RelayError> {
        let mut current = from;
        let changed = self.state.send_if_modified(|state| {
            current = *state;
            if *state == from {
                *state = to;
                true
            } else {
                false
            }
        });

        if changed {
            Ok(())
        } else {
            Err(RelayError::Lifecycle {
                operation,
                state: current,
            })
        }
    }
}
