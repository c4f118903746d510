use std::sync::{Arc, Weak};
use std::time::Duration;

use anyhow::{anyhow, Result};
use parking_lot::Mutex;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::backend::{ReplySink, RequestToken, SessionCommand, SessionConfig, SessionPool};
use crate::book::{next_request_id, Callback, RequestBook, Settled};
use crate::command::{arg, Command};
use crate::config::{ClientConfig, NodeConfig};
use crate::health::HealthTracker;
use crate::protocol::Reply;
use crate::registry::{Addr, NodeRegistry};
use crate::ring::{HashRing, DEFAULT_WEIGHT};
use crate::share;

/// Federated client over a pool of independent Redis-compatible servers.
///
/// Commands are routed to exactly one backend by consistent hash of their
/// key (or explicit group), gated by per-address health state, and
/// executed asynchronously: `dispatch` registers a completion callback
/// and returns immediately, and [`Client::poll`] waits for everything
/// dispatched since the last `poll` to drain, bounded by the command
/// timeout.
///
/// ```no_run
/// # use shoal::{Client, ClientConfig, NodeConfig};
/// # async fn demo() -> anyhow::Result<()> {
/// let mut nodes = std::collections::HashMap::new();
/// nodes.insert(
///     "redis_0".to_string(),
///     NodeConfig::Single { address: "127.0.0.1:6379".into() },
/// );
/// let client = Client::new(ClientConfig::new(nodes))?;
/// client
///     .set("ducati", "7")
///     .await
///     .get("ducati", |reply| println!("{:?}", reply))
///     .await;
/// client.poll().await;
/// # Ok(())
/// # }
/// ```
pub struct Client {
    self_weak: Weak<Client>,
    ring: Mutex<HashRing>,
    registry: Mutex<NodeRegistry>,
    health: Mutex<HealthTracker>,
    sessions: SessionPool,
    book: RequestBook,
    command_timeout: Mutex<Option<Duration>>,
    debug: bool,
}

impl Client {
    /// Build a client, or return the live instance sharing the
    /// configuration's tag. Configuration errors abort construction;
    /// every later failure is delivered through callbacks instead.
    pub fn new(config: ClientConfig) -> Result<Arc<Self>> {
        config.ensure_valid()?;
        match config.tag.clone() {
            Some(tag) => share::shared(&tag, || Self::build(config)),
            None => Self::build(config),
        }
    }

    fn build(config: ClientConfig) -> Result<Arc<Self>> {
        let mut registry = NodeRegistry::new();
        for (name, node) in &config.nodes {
            registry.insert(name, node);
        }
        let ring = HashRing::new(config.nodes.keys().cloned());
        let sessions = SessionPool::new(
            SessionConfig {
                connect_timeout: config.connect_timeout_duration(),
                persistent: config.persistent,
            },
            config.idle_timeout_duration(),
        );

        Ok(Arc::new_cyclic(|self_weak| Self {
            self_weak: self_weak.clone(),
            ring: Mutex::new(ring),
            registry: Mutex::new(registry),
            health: Mutex::new(HealthTracker::new(config.retry_policy())),
            sessions,
            book: RequestBook::new(),
            command_timeout: Mutex::new(config.command_timeout_duration()),
            debug: config.debug,
        }))
    }

    /// Route and submit a command. The callback fires with the backend's
    /// reply, or with [`Reply::Null`] when the request is refused, fails,
    /// or is cancelled by the batch timeout. Returns the client so calls
    /// chain.
    pub async fn dispatch(&self, command: Command, callback: Option<Callback>) -> &Self {
        let Some(node) = self.ring.lock().lookup(command.hash_key()).cloned() else {
            warn!(verb = command.verb(), "no nodes configured; refusing command");
            if let Some(cb) = callback {
                cb(Reply::Null);
            }
            return self;
        };
        let Some(mut addr) = self.registry.lock().address_of(&node) else {
            warn!(node = %node, "node has no registered address");
            if let Some(cb) = callback {
                cb(Reply::Null);
            }
            return self;
        };

        // A known-down selection is skipped up front when the node has
        // alternates to fall back on.
        if self.registry.lock().has_alternates(&node) && self.health.lock().is_down(&addr) {
            if let Some(next) = self.registry.lock().rotate(&node) {
                addr = next;
            }
        }

        let sink: Weak<dyn ReplySink> = self.self_weak.clone();
        let tx = self.sessions.acquire(&addr, sink);

        {
            let mut health = self.health.lock();
            if health.is_down(&addr) && !health.needs_retry(&addr) {
                drop(health);
                debug!(backend = %addr, "dispatch refused while backend is in backoff");
                if let Some(cb) = callback {
                    cb(Reply::Null);
                }
                return self;
            }
        }

        let id = next_request_id();
        self.book.begin(id, addr.clone(), callback);
        if self.debug {
            debug!(id, node = %node, backend = %addr, verb = command.verb(), "dispatching");
        }

        let token = RequestToken {
            id,
            node: node.clone(),
            addr: addr.clone(),
        };
        if tx.send(SessionCommand { command, token }).await.is_err() {
            self.fail_request(id, &node, &addr, anyhow!("backend session unavailable"));
        }
        self
    }

    /// Wait until every request dispatched since the last poll has
    /// completed, been refused, or been cancelled. With a nonzero command
    /// timeout the wait is bounded: on expiry all still-open requests are
    /// cancelled, their addresses marked down, and their callbacks run
    /// with [`Reply::Null`]. One timeout per call.
    pub async fn poll(&self) {
        if self.book.pending() == 0 {
            return;
        }
        let limit = *self.command_timeout.lock();
        let mut rx = self.book.subscribe();
        let drained = async move {
            loop {
                if *rx.borrow_and_update() == 0 {
                    break;
                }
                if rx.changed().await.is_err() {
                    break;
                }
            }
        };

        match limit {
            Some(limit) => {
                if timeout(limit, drained).await.is_err() {
                    let cancelled = self.book.cancel_open();
                    warn!(
                        count = cancelled.len(),
                        "command timeout; cancelling open requests"
                    );
                    {
                        let mut health = self.health.lock();
                        for (_, addr, _) in &cancelled {
                            health.mark_down(addr);
                        }
                    }
                    for (_, _, callback) in cancelled {
                        if let Some(cb) = callback {
                            cb(Reply::Null);
                        }
                    }
                }
            }
            None => drained.await,
        }
    }

    // Thin verb helpers; the protocol layer accepts arbitrary verbs, so
    // anything not covered here goes through `dispatch` directly.

    pub async fn get(
        &self,
        key: impl AsRef<[u8]>,
        callback: impl FnOnce(Reply) + Send + 'static,
    ) -> &Self {
        let command =
            Command::new("get", vec![arg(key)]).expect("GET command must be valid");
        self.dispatch(command, Some(Box::new(callback))).await
    }

    pub async fn set(&self, key: impl AsRef<[u8]>, value: impl AsRef<[u8]>) -> &Self {
        let command =
            Command::new("set", vec![arg(key), arg(value)]).expect("SET command must be valid");
        self.dispatch(command, None).await
    }

    pub async fn set_with(
        &self,
        key: impl AsRef<[u8]>,
        value: impl AsRef<[u8]>,
        callback: impl FnOnce(Reply) + Send + 'static,
    ) -> &Self {
        let command =
            Command::new("set", vec![arg(key), arg(value)]).expect("SET command must be valid");
        self.dispatch(command, Some(Box::new(callback))).await
    }

    pub async fn del(&self, key: impl AsRef<[u8]>) -> &Self {
        let command = Command::new("del", vec![arg(key)]).expect("DEL command must be valid");
        self.dispatch(command, None).await
    }

    pub async fn incr(
        &self,
        key: impl AsRef<[u8]>,
        callback: impl FnOnce(Reply) + Send + 'static,
    ) -> &Self {
        let command = Command::new("incr", vec![arg(key)]).expect("INCR command must be valid");
        self.dispatch(command, Some(Box::new(callback))).await
    }

    /// Register a node and give it ring buckets.
    pub fn add_node(&self, name: &str, descriptor: NodeConfig) -> Result<()> {
        descriptor.ensure_valid(name)?;
        self.registry.lock().insert(name, &descriptor);
        self.ring.lock().add(name, DEFAULT_WEIGHT);
        Ok(())
    }

    /// Remove a node from the ring and registry, dropping cached
    /// connections to addresses no other node references.
    pub fn remove_node(&self, name: &str) {
        self.ring.lock().remove(name);
        self.registry.lock().remove(name);
        let live = self.registry.lock().addresses();
        self.sessions.retain(&live);
    }

    /// Node that owns `key` under the current ring.
    pub fn key_to_node(&self, key: impl AsRef<[u8]>) -> Option<String> {
        self.ring
            .lock()
            .lookup(key.as_ref())
            .map(|node| node.to_string())
    }

    /// Currently selected address for a node.
    pub fn node_to_host(&self, node: &str) -> Option<Addr> {
        self.registry.lock().address_of(node)
    }

    pub fn is_server_down(&self, addr: impl AsRef<str>) -> bool {
        self.health.lock().is_down(&Addr::new(addr))
    }

    pub fn is_server_up(&self, addr: impl AsRef<str>) -> bool {
        !self.is_server_down(addr)
    }

    pub fn mark_server_down(&self, addr: impl AsRef<str>) {
        self.health.lock().mark_down(&Addr::new(addr));
    }

    pub fn mark_server_up(&self, addr: impl AsRef<str>) {
        self.health.lock().mark_up(&Addr::new(addr));
    }

    /// Current batch timeout; `None` when disabled.
    pub fn command_timeout(&self) -> Option<Duration> {
        *self.command_timeout.lock()
    }

    /// Change the batch timeout. Zero disables it.
    pub fn set_command_timeout(&self, seconds: f64) {
        let limit = if seconds > 0.0 {
            Some(Duration::from_secs_f64(seconds))
        } else {
            None
        };
        *self.command_timeout.lock() = limit;
    }

    /// Number of requests dispatched but not yet drained.
    pub fn pending_requests(&self) -> usize {
        self.book.pending()
    }

    fn fail_request(&self, id: u64, node: &str, addr: &Addr, error: anyhow::Error) {
        match self.book.resolve(id) {
            Settled::Completed { callback, .. } => {
                warn!(backend = %addr, error = %error, "request failed");
                self.health.lock().mark_down(addr);
                self.registry.lock().rotate(node);
                if let Some(cb) = callback {
                    cb(Reply::Null);
                }
                self.book.release();
            }
            // Cancellation already released the barrier and notified the
            // caller; a late failure changes nothing.
            Settled::Cancelled | Settled::Unknown => {}
        }
    }
}

impl ReplySink for Client {
    fn on_reply(&self, token: RequestToken, reply: Reply) {
        match self.book.resolve(token.id) {
            Settled::Completed { callback, .. } => {
                self.health.lock().mark_up(&token.addr);
                self.sessions.touch(&token.addr);
                if let Some(cb) = callback {
                    cb(reply);
                }
                self.book.release();
            }
            Settled::Cancelled => {
                debug!(id = token.id, "dropping reply for cancelled request");
            }
            Settled::Unknown => {}
        }
    }

    fn on_error(&self, token: RequestToken, error: anyhow::Error) {
        self.fail_request(token.id, &token.node, &token.addr, error);
    }
}
