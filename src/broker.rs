// MIT License
//
// Copyright (c) 2025 Takatoshi Kondo
//
// Permission is hereby granted, free of charge, to any person obtaining a copy
// of this software and associated documentation files (the "Software"), to deal
// in the Software without restriction, including without limitation the rights
// to use, copy, modify, merge, publish, distribute, sublicense, and/or sell
// copies of the Software, and to permit persons to whom the Software is
// furnished to do so, subject to the following conditions:
//
// The above copyright notice and this permission notice shall be included in all
// copies or substantial portions of the Software.
//
// THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
// IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
// FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
// AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
// LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING FROM,
// OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER DEALINGS IN THE
// SOFTWARE.

//! Server supervisor: accept loop, client registry, events, lifecycle.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc, Mutex, RwLock, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

use crate::auth::{AllowAll, Security};
use crate::bus::{Bus, LocalBus, PublishOptions};
use crate::config::{BrokerConfig, BusBackend};
use crate::connection;
use crate::error::Result;
use crate::packet::{Publish, QoS, Will};
use crate::store::Store;

/// Events emitted by the broker.
#[derive(Debug, Clone)]
pub enum BrokerEvent {
    /// Listener is bound and accepting connections.
    Ready,
    /// Shutdown complete.
    Closed,
    /// A listener-, bus- or hook-level failure.
    Error(String),
    ClientConnected {
        client_id: String,
    },
    ClientDisconnected {
        client_id: String,
    },
    Published {
        topic: String,
        payload: Bytes,
        qos: QoS,
        client_id: String,
    },
}

/// Control messages delivered to a connection task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ControlMessage {
    /// Another CONNECT arrived with this session's client id.
    Takeover,
    /// The broker is shutting down.
    Shutdown,
}

/// Registry entry for a live connection.
pub(crate) struct ClientHandle {
    pub conn_id: u64,
    pub ctrl: mpsc::UnboundedSender<ControlMessage>,
}

pub(crate) struct Shared {
    pub config: BrokerConfig,
    pub store: Store,
    pub bus: Arc<dyn Bus>,
    pub security: Arc<dyn Security>,
    pub registry: RwLock<HashMap<String, ClientHandle>>,
    events: broadcast::Sender<BrokerEvent>,
    next_conn_id: AtomicU64,
    closed: AtomicBool,
    listener_task: Mutex<Option<JoinHandle<()>>>,
    conn_done_tx: Mutex<Option<mpsc::Sender<()>>>,
    conn_done_rx: Mutex<Option<mpsc::Receiver<()>>>,
}

/// The MQTT broker.
///
/// Cheap to clone; every clone shares the same state.
#[derive(Clone)]
pub struct Broker {
    pub(crate) inner: Arc<Shared>,
}

impl Broker {
    /// Initialize the broker: open persistence (rebuilding the matcher from
    /// the stored subscription index) and create the bus. The listener is
    /// bound by [`Broker::listen`].
    pub async fn new(config: BrokerConfig) -> Result<Self> {
        Self::with_security(config, Arc::new(AllowAll)).await
    }

    /// Like [`Broker::new`], with custom authentication/authorization hooks.
    pub async fn with_security(config: BrokerConfig, security: Arc<dyn Security>) -> Result<Self> {
        let store = Store::open(config.store_config()).await?;

        let bus: Arc<dyn Bus> = match config.backend {
            BusBackend::InProcess => Arc::new(LocalBus::new()),
        };

        let (events, _) = broadcast::channel(256);
        let (conn_done_tx, conn_done_rx) = mpsc::channel(1);

        Ok(Self {
            inner: Arc::new(Shared {
                config,
                store,
                bus,
                security,
                registry: RwLock::new(HashMap::new()),
                events,
                next_conn_id: AtomicU64::new(1),
                closed: AtomicBool::new(false),
                listener_task: Mutex::new(None),
                conn_done_tx: Mutex::new(Some(conn_done_tx)),
                conn_done_rx: Mutex::new(Some(conn_done_rx)),
            }),
        })
    }

    /// Bind the listener and start accepting connections. Returns the bound
    /// address (useful with port 0) and emits `Ready`.
    pub async fn listen(&self) -> Result<SocketAddr> {
        let addr = SocketAddr::new(self.inner.config.host, self.inner.config.port);
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        info!("listening on {local_addr}");

        let broker = self.clone();
        let limit = Arc::new(Semaphore::new(self.inner.config.max_connections));
        let done_tx = self.inner.conn_done_tx.lock().await.clone();

        let task = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, peer)) => {
                        let Ok(permit) = limit.clone().try_acquire_owned() else {
                            warn!("connection limit reached, dropping {peer}");
                            continue;
                        };
                        trace!("accepted connection from {peer}");

                        let broker = broker.clone();
                        let done_tx = done_tx.clone();
                        tokio::spawn(async move {
                            let _permit = permit;
                            let _done_tx = done_tx;
                            connection::run(broker, stream, peer).await;
                        });
                    }
                    Err(e) => {
                        error!("failed to accept connection: {e}");
                        broker.emit(BrokerEvent::Error(format!("accept failed: {e}")));
                    }
                }
            }
        });

        *self.inner.listener_task.lock().await = Some(task);
        self.emit(BrokerEvent::Ready);
        Ok(local_addr)
    }

    /// Subscribe to broker events.
    pub fn events(&self) -> broadcast::Receiver<BrokerEvent> {
        self.inner.events.subscribe()
    }

    /// Shut down: stop the listener, close every live connection in
    /// parallel, close the bus, flush persistence, emit `Closed`.
    pub async fn close(&self) -> Result<()> {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        debug!("broker shutting down");

        if let Some(task) = self.inner.listener_task.lock().await.take() {
            task.abort();
        }

        // Signal every connection, then wait for all of them to finish.
        // Every connection task holds a clone of conn_done_tx; recv returns
        // None once the last clone is dropped.
        let handles: Vec<ClientHandle> = {
            let mut registry = self.inner.registry.write().await;
            registry.drain().map(|(_, handle)| handle).collect()
        };
        for handle in &handles {
            let _ = handle.ctrl.send(ControlMessage::Shutdown);
        }

        let done_rx = {
            self.inner.conn_done_tx.lock().await.take();
            self.inner.conn_done_rx.lock().await.take()
        };
        if let Some(mut done_rx) = done_rx {
            let _ = done_rx.recv().await;
        }

        self.inner.bus.close().await;
        self.inner.store.close().await?;
        self.emit(BrokerEvent::Closed);
        Ok(())
    }

    pub(crate) fn emit(&self, event: BrokerEvent) {
        let _ = self.inner.events.send(event);
    }

    pub(crate) fn next_conn_id(&self) -> u64 {
        self.inner.next_conn_id.fetch_add(1, Ordering::SeqCst)
    }

    /// Register a connection under its client id; a prior connection with the
    /// same id is told to close first.
    pub(crate) async fn register(&self, client_id: &str, handle: ClientHandle) {
        let mut registry = self.inner.registry.write().await;
        if let Some(old) = registry.insert(client_id.to_string(), handle) {
            debug!("displacing previous connection for client '{client_id}'");
            let _ = old.ctrl.send(ControlMessage::Takeover);
        }
    }

    /// Remove a connection from the registry if it still owns its entry.
    /// Returns false when a newer connection has taken the client id over.
    pub(crate) async fn deregister(&self, client_id: &str, conn_id: u64) -> bool {
        let mut registry = self.inner.registry.write().await;
        if registry
            .get(client_id)
            .is_some_and(|handle| handle.conn_id == conn_id)
        {
            registry.remove(client_id);
        }
        // Closed-out registries (shutdown) also count as owned
        !registry.contains_key(client_id)
    }

    /// Route a published message: fan out on the bus, queue one copy per
    /// matching offline durable subscriber, emit `Published`.
    pub(crate) async fn publish(&self, packet: &Publish, publisher: &str) -> Result<()> {
        let opts = PublishOptions {
            qos: packet.qos,
            retain: packet.retain,
            publisher: Some(publisher.to_string()),
            packet_id: packet.packet_id,
        };
        self.inner
            .bus
            .publish(&packet.topic, packet.payload.clone(), opts)
            .await?;

        // Offline queueing must not block the publish path
        if let Err(e) = self.inner.store.store_offline_packet(packet).await {
            warn!("offline queueing failed for '{}': {e}", packet.topic);
        }

        self.emit(BrokerEvent::Published {
            topic: packet.topic.clone(),
            payload: packet.payload.clone(),
            qos: packet.qos,
            client_id: publisher.to_string(),
        });
        Ok(())
    }

    /// Publish a session's will on its behalf.
    pub(crate) async fn publish_will(&self, will: &Will, client_id: &str) {
        let packet = Publish {
            dup: false,
            qos: will.qos,
            retain: will.retain,
            topic: will.topic.clone(),
            packet_id: None,
            payload: will.payload.clone(),
        };

        if will.retain {
            if let Err(e) = self.inner.store.store_retained(&packet).await {
                warn!("failed to retain will for client '{client_id}': {e}");
            }
        }

        if let Err(e) = self.publish(&packet, client_id).await {
            warn!("failed to publish will for client '{client_id}': {e}");
            self.emit(BrokerEvent::Error(format!(
                "will publish failed for '{client_id}': {e}"
            )));
        }
    }
}
