//! Outbound connections to storage nodes
//!
//! The runtime only needs to know whether a node is reachable and how to stop
//! talking to it; the request protocol lives elsewhere. [`NodeConnection`] is
//! that capability and [`ConnectionFactory`] creates one per endpoint, so
//! tests can substitute connections whose state they control.

use crate::common::RuntimeConfig;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::task::JoinHandle;

#[async_trait]
pub trait NodeConnection: Send + Sync {
    fn start(&self);

    /// Ask the connection to stop; returns immediately.
    fn shutdown(&self);

    /// Wait until a requested shutdown completed.
    async fn wait_shutdown(&self);

    fn is_connected(&self) -> bool;

    fn conn_info(&self) -> &str;
}

pub trait ConnectionFactory: Send + Sync {
    fn init(&self, endpoint: &str) -> Arc<dyn NodeConnection>;
}

/// Connection to one node at one position of the topology
pub struct OutboundProcessor {
    zone: u32,
    node: u32,
    conn: Arc<dyn NodeConnection>,
}

impl OutboundProcessor {
    pub fn new(zone: u32, node: u32, conn: Arc<dyn NodeConnection>) -> Self {
        Self { zone, node, conn }
    }

    pub fn zone(&self) -> u32 {
        self.zone
    }

    pub fn node(&self) -> u32 {
        self.node
    }

    /// `zone-node`
    pub fn name(&self) -> String {
        format!("{}-{}", self.zone, self.node)
    }

    pub fn conn_info(&self) -> &str {
        self.conn.conn_info()
    }

    pub fn is_connected(&self) -> bool {
        self.conn.is_connected()
    }

    pub fn connection(&self) -> &Arc<dyn NodeConnection> {
        &self.conn
    }
}

impl std::fmt::Debug for OutboundProcessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutboundProcessor")
            .field("zone", &self.zone)
            .field("node", &self.node)
            .field("conn_info", &self.conn_info())
            .field("connected", &self.is_connected())
            .finish()
    }
}

/// TCP connection kept open to observe node liveness, reconnecting while
/// the node is unreachable.
pub struct TcpConnection {
    endpoint: String,
    cfg: RuntimeConfig,
    connected: Arc<AtomicBool>,
    quit: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl TcpConnection {
    pub fn new(endpoint: impl Into<String>, cfg: RuntimeConfig) -> Self {
        let (quit, _) = watch::channel(false);
        Self {
            endpoint: endpoint.into(),
            cfg,
            connected: Arc::new(AtomicBool::new(false)),
            quit,
            task: Mutex::new(None),
        }
    }

    async fn run(
        endpoint: String,
        cfg: RuntimeConfig,
        connected: Arc<AtomicBool>,
        mut quit: watch::Receiver<bool>,
    ) {
        loop {
            if *quit.borrow() {
                break;
            }

            let attempt = tokio::time::timeout(cfg.connect_timeout(), TcpStream::connect(&endpoint));
            let stream = tokio::select! {
                _ = quit.changed() => break,
                result = attempt => result,
            };

            match stream {
                Ok(Ok(stream)) => {
                    tracing::debug!("connected to {}", endpoint);
                    connected.store(true, Ordering::Release);
                    tokio::select! {
                        _ = quit.changed() => {
                            connected.store(false, Ordering::Release);
                            break;
                        }
                        _ = wait_closed(&stream) => {
                            tracing::warn!("connection to {} closed", endpoint);
                        }
                    }
                    connected.store(false, Ordering::Release);
                }
                Ok(Err(e)) => tracing::debug!("connect to {} failed: {}", endpoint, e),
                Err(_) => tracing::debug!("connect to {} timed out", endpoint),
            }

            tokio::select! {
                _ = quit.changed() => break,
                _ = tokio::time::sleep(cfg.reconnect_interval()) => {}
            }
        }
        tracing::debug!("connection to {} shut down", endpoint);
    }
}

/// Resolves once the peer closes the stream or it fails.
async fn wait_closed(stream: &TcpStream) {
    let mut buf = [0u8; 512];
    loop {
        if stream.readable().await.is_err() {
            return;
        }
        match stream.try_read(&mut buf) {
            Ok(0) => return,
            Ok(_) => continue,
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => continue,
            Err(_) => return,
        }
    }
}

#[async_trait]
impl NodeConnection for TcpConnection {
    fn start(&self) {
        let mut task = self.task.lock();
        if task.is_some() {
            return;
        }
        *task = Some(tokio::spawn(Self::run(
            self.endpoint.clone(),
            self.cfg.clone(),
            Arc::clone(&self.connected),
            self.quit.subscribe(),
        )));
    }

    fn shutdown(&self) {
        let _ = self.quit.send(true);
    }

    async fn wait_shutdown(&self) {
        let handle = self.task.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                tracing::warn!("connection task for {} failed: {}", self.endpoint, e);
            }
        }
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    fn conn_info(&self) -> &str {
        &self.endpoint
    }
}

pub struct TcpConnectionFactory {
    cfg: RuntimeConfig,
}

impl TcpConnectionFactory {
    pub fn new(cfg: RuntimeConfig) -> Self {
        Self { cfg }
    }
}

impl ConnectionFactory for TcpConnectionFactory {
    fn init(&self, endpoint: &str) -> Arc<dyn NodeConnection> {
        Arc::new(TcpConnection::new(endpoint, self.cfg.clone()))
    }
}
