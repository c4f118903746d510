use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use futures::{SinkExt, StreamExt};
use hashbrown::{HashMap, HashSet};
use parking_lot::Mutex;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::codec::Framed;
use tracing::{debug, warn};

use crate::command::Command;
use crate::protocol::{Reply, RespCodec};
use crate::registry::Addr;

/// Queue depth per backend session.
const SESSION_QUEUE_CAPACITY: usize = 1024;

/// Identifies an in-flight request back to the dispatcher.
#[derive(Debug, Clone)]
pub struct RequestToken {
    pub id: u64,
    pub node: Arc<str>,
    pub addr: Addr,
}

/// Work item handed to a session task.
pub struct SessionCommand {
    pub command: Command,
    pub token: RequestToken,
}

/// Receives request outcomes from session tasks. Implemented by the
/// dispatcher; held weakly so sessions never outlive the client.
pub trait ReplySink: Send + Sync + 'static {
    fn on_reply(&self, token: RequestToken, reply: Reply);
    fn on_error(&self, token: RequestToken, error: anyhow::Error);
}

/// Per-session connection behavior.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Bound on establishing a backend connection; `None` leaves the
    /// batch timeout in `poll` as the only limit.
    pub connect_timeout: Option<Duration>,
    /// Reuse the stream across commands; when false it is dropped after
    /// every reply.
    pub persistent: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            connect_timeout: None,
            persistent: true,
        }
    }
}

struct SessionHandle {
    tx: mpsc::Sender<SessionCommand>,
    last_used: Instant,
    #[allow(dead_code)]
    join: JoinHandle<()>,
}

/// Keeps at most one live session per physical address, with optional
/// idle expiry. Dropping a handle closes its channel; the session task
/// drains queued work and exits on its own.
pub struct SessionPool {
    sessions: Mutex<HashMap<Addr, SessionHandle>>,
    config: SessionConfig,
    idle_timeout: Option<Duration>,
}

impl SessionPool {
    pub fn new(config: SessionConfig, idle_timeout: Option<Duration>) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            config,
            idle_timeout,
        }
    }

    /// Sender for the session owning `addr`, spawning one if absent. A
    /// session idle past `idle_timeout` is replaced with a fresh one.
    pub fn acquire(&self, addr: &Addr, sink: Weak<dyn ReplySink>) -> mpsc::Sender<SessionCommand> {
        let mut sessions = self.sessions.lock();
        if let Some(handle) = sessions.get(addr) {
            let expired = self
                .idle_timeout
                .map(|limit| handle.last_used.elapsed() >= limit)
                .unwrap_or(false);
            if !expired && !handle.tx.is_closed() {
                return handle.tx.clone();
            }
            debug!(backend = %addr, expired, "replacing backend session");
            sessions.remove(addr);
        }

        let (tx, rx) = mpsc::channel(SESSION_QUEUE_CAPACITY);
        let join = tokio::spawn(run_session(addr.clone(), self.config.clone(), rx, sink));
        sessions.insert(
            addr.clone(),
            SessionHandle {
                tx: tx.clone(),
                last_used: Instant::now(),
                join,
            },
        );
        tx
    }

    /// Refresh the idle clock after a successful reply.
    pub fn touch(&self, addr: &Addr) {
        if let Some(handle) = self.sessions.lock().get_mut(addr) {
            handle.last_used = Instant::now();
        }
    }

    /// Drop the session for `addr`, if any.
    pub fn evict(&self, addr: &Addr) {
        self.sessions.lock().remove(addr);
    }

    /// Drop every session whose address is not in `live`.
    pub fn retain(&self, live: &HashSet<Addr>) {
        self.sessions.lock().retain(|addr, _| live.contains(addr));
    }

    pub fn len(&self) -> usize {
        self.sessions.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.lock().is_empty()
    }
}

async fn run_session(
    addr: Addr,
    config: SessionConfig,
    mut rx: mpsc::Receiver<SessionCommand>,
    sink: Weak<dyn ReplySink>,
) {
    debug!(backend = %addr, "backend session started");
    let mut connection: Option<Framed<TcpStream, RespCodec>> = None;

    while let Some(SessionCommand { command, token }) = rx.recv().await {
        let Some(sink) = sink.upgrade() else {
            break;
        };

        if connection.is_none() {
            match open_stream(&addr, config.connect_timeout).await {
                Ok(stream) => connection = Some(stream),
                Err(err) => {
                    warn!(backend = %addr, error = %err, "failed to connect to backend");
                    sink.on_error(token, err);
                    continue;
                }
            }
        }

        if let Some(framed) = connection.as_mut() {
            match exchange(framed, &command).await {
                Ok(reply) => {
                    sink.on_reply(token, reply);
                    if !config.persistent {
                        connection = None;
                    }
                }
                Err(err) => {
                    connection = None;
                    sink.on_error(token, err);
                }
            }
        }
    }
    debug!(backend = %addr, "backend session ended");
}

async fn open_stream(
    addr: &Addr,
    connect_timeout: Option<Duration>,
) -> Result<Framed<TcpStream, RespCodec>> {
    let stream = match connect_timeout {
        Some(limit) => timeout(limit, TcpStream::connect(addr.as_str()))
            .await
            .with_context(|| format!("connect to {} timed out", addr))??,
        None => TcpStream::connect(addr.as_str())
            .await
            .with_context(|| format!("connect to {} failed", addr))?,
    };
    stream
        .set_nodelay(true)
        .with_context(|| format!("failed to set TCP_NODELAY on {}", addr))?;
    Ok(Framed::new(stream, RespCodec))
}

async fn exchange(framed: &mut Framed<TcpStream, RespCodec>, command: &Command) -> Result<Reply> {
    framed
        .send(command.to_reply())
        .await
        .context("failed to send command to backend")?;
    match framed.next().await {
        Some(Ok(reply)) => Ok(reply),
        Some(Err(err)) => Err(err),
        None => Err(anyhow!("backend closed connection")),
    }
}
