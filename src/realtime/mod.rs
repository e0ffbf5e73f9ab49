//! Push notifications of remote changes.
//!
//! [`RealtimeChannel`] owns one receive loop and a fixed pool of dispatch
//! workers. The receive loop connects through a [`RealtimeTransport`],
//! subscribes to every configured table on each (re)connect, and forwards
//! change events into a bounded queue. Workers hand each event to every
//! registered [`ChangeHandler`]; a failing handler is logged and does not
//! affect the others. Handlers only signal that something changed; applying
//! changes stays with the sync orchestrator.
//!
//! ```text
//! Disconnected -> Connecting -> Connected
//!      ^              |             |
//!      +--- backoff --+-------------+
//!                     |
//!                     +--> Failed (after max attempts)
//! ```

pub mod backoff;
#[cfg(any(test, feature = "test-utils"))]
pub mod memory;
mod websocket;

pub use websocket::WebSocketTransport;

use std::collections::BTreeSet;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::ClientConfig;
use crate::error::Result;
use crate::gateway::Table;
use backoff::Backoff;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelState {
    Disconnected,
    Connecting,
    Connected,
    /// Retries exhausted; only polling remains until restarted.
    Failed,
}

impl fmt::Display for ChannelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ChannelState::Disconnected => "disconnected",
            ChannelState::Connecting => "connecting",
            ChannelState::Connected => "connected",
            ChannelState::Failed => "failed",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Operation {
    #[serde(rename = "INSERT", alias = "insert")]
    Insert,
    #[serde(rename = "UPDATE", alias = "update")]
    Update,
    #[serde(rename = "DELETE", alias = "delete")]
    Delete,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub table: Table,
    pub operation: Operation,
    #[serde(default)]
    pub record: Value,
}

impl ChangeEvent {
    pub fn new(table: Table, operation: Operation, record: Value) -> Self {
        Self {
            table,
            operation,
            record,
        }
    }
}

/// Establishes connections to the change feed.
#[async_trait]
pub trait RealtimeTransport: Send + Sync {
    async fn connect(&self) -> Result<Box<dyn RealtimeConnection>>;
}

#[async_trait]
pub trait RealtimeConnection: Send {
    async fn subscribe(&mut self, table: Table) -> Result<()>;

    /// Next change event; `Ok(None)` once the connection has closed.
    async fn next_event(&mut self) -> Result<Option<ChangeEvent>>;
}

#[async_trait]
pub trait ChangeHandler: Send + Sync {
    async fn on_event(&self, event: &ChangeEvent) -> Result<()>;
}

#[derive(Debug, Clone, Copy)]
pub struct ChannelOptions {
    pub backoff: backoff::Config,
    pub workers: usize,
    pub queue: usize,
}

impl ChannelOptions {
    #[must_use]
    pub fn from_config(config: &ClientConfig) -> Self {
        Self {
            backoff: backoff::Config {
                base_delay: Duration::from_secs(config.realtime_base_delay_secs),
                max_delay: Duration::from_secs(config.realtime_max_delay_secs),
                max_attempts: config.realtime_max_attempts,
            },
            workers: config.dispatch_workers,
            queue: config.dispatch_queue,
        }
    }
}

impl Default for ChannelOptions {
    fn default() -> Self {
        Self {
            backoff: backoff::Config::default(),
            workers: 2,
            queue: 64,
        }
    }
}

struct Running {
    cancel: CancellationToken,
    receiver: JoinHandle<()>,
    workers: Vec<JoinHandle<()>>,
}

pub struct RealtimeChannel {
    transport: Arc<dyn RealtimeTransport>,
    options: ChannelOptions,
    tables: Arc<Mutex<BTreeSet<Table>>>,
    handlers: Mutex<Vec<Arc<dyn ChangeHandler>>>,
    state: Arc<watch::Sender<ChannelState>>,
    running: Mutex<Option<Running>>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

impl RealtimeChannel {
    pub fn new(transport: Arc<dyn RealtimeTransport>, options: ChannelOptions) -> Self {
        let (state, _) = watch::channel(ChannelState::Disconnected);
        Self {
            transport,
            options,
            tables: Arc::new(Mutex::new(BTreeSet::new())),
            handlers: Mutex::new(Vec::new()),
            state: Arc::new(state),
            running: Mutex::new(None),
        }
    }

    /// Adds tables to watch. They are subscribed on the next (re)connect.
    pub fn subscribe(&self, tables: impl IntoIterator<Item = Table>) {
        lock(&self.tables).extend(tables);
    }

    #[must_use]
    pub fn tables(&self) -> Vec<Table> {
        lock(&self.tables).iter().copied().collect()
    }

    /// Registers a handler. Handlers registered after [`start`](Self::start)
    /// take effect on the next start.
    pub fn on_event(&self, handler: Arc<dyn ChangeHandler>) {
        lock(&self.handlers).push(handler);
    }

    #[must_use]
    pub fn state(&self) -> ChannelState {
        *self.state.borrow()
    }

    #[must_use]
    pub fn watch_state(&self) -> watch::Receiver<ChannelState> {
        self.state.subscribe()
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        lock(&self.running)
            .as_ref()
            .is_some_and(|r| !r.receiver.is_finished())
    }

    /// Spawns the receive loop and dispatch workers. A no-op while running;
    /// restarts a channel that ended in [`ChannelState::Failed`].
    pub fn start(&self) {
        let mut running = lock(&self.running);
        if running.as_ref().is_some_and(|r| !r.receiver.is_finished()) {
            tracing::debug!("Realtime channel already running");
            return;
        }
        if let Some(previous) = running.take() {
            previous.cancel.cancel();
        }

        let cancel = CancellationToken::new();
        let (tx, rx) = mpsc::channel(self.options.queue.max(1));
        let rx = Arc::new(tokio::sync::Mutex::new(rx));
        let handlers: Arc<[Arc<dyn ChangeHandler>]> = lock(&self.handlers).clone().into();

        let workers = (0..self.options.workers.max(1))
            .map(|id| tokio::spawn(dispatch_worker(id, rx.clone(), handlers.clone())))
            .collect();

        let receiver = tokio::spawn(receive_loop(ReceiveLoop {
            transport: self.transport.clone(),
            tables: self.tables.clone(),
            backoff: Backoff::new(self.options.backoff),
            state: self.state.clone(),
            events: tx,
            cancel: cancel.clone(),
        }));

        tracing::info!(tables = ?self.tables(), "Realtime channel started");
        *running = Some(Running {
            cancel,
            receiver,
            workers,
        });
    }

    /// Stops the receive loop, lets workers drain the queue, and waits for all
    /// tasks to finish.
    pub async fn stop(&self) {
        let Some(running) = lock(&self.running).take() else {
            return;
        };

        running.cancel.cancel();
        if let Err(e) = running.receiver.await {
            tracing::warn!("Realtime receive loop ended abnormally: {e}");
        }
        for worker in running.workers {
            if let Err(e) = worker.await {
                tracing::warn!("Realtime worker ended abnormally: {e}");
            }
        }
        self.state.send_replace(ChannelState::Disconnected);
        tracing::info!("Realtime channel stopped");
    }
}

struct ReceiveLoop {
    transport: Arc<dyn RealtimeTransport>,
    tables: Arc<Mutex<BTreeSet<Table>>>,
    backoff: Backoff,
    state: Arc<watch::Sender<ChannelState>>,
    events: mpsc::Sender<ChangeEvent>,
    cancel: CancellationToken,
}

impl ReceiveLoop {
    fn set_state(&self, state: ChannelState) {
        self.state.send_replace(state);
    }

    async fn connect(&self) -> Result<Box<dyn RealtimeConnection>> {
        let mut conn = self.transport.connect().await?;
        let tables: Vec<Table> = lock(&self.tables).iter().copied().collect();
        for table in tables {
            conn.subscribe(table).await?;
        }
        Ok(conn)
    }

    /// Pumps events until the connection ends. Returns `None` when cancelled.
    async fn pump(&self, conn: &mut Box<dyn RealtimeConnection>) -> Option<String> {
        loop {
            let next = tokio::select! {
                _ = self.cancel.cancelled() => return None,
                next = conn.next_event() => next,
            };

            let event = match next {
                Ok(Some(event)) => event,
                Ok(None) => return Some("connection closed".to_string()),
                Err(e) => return Some(e.to_string()),
            };

            tracing::trace!(table = %event.table, operation = ?event.operation, "Realtime event");
            // Waits for queue space, which is where backpressure applies.
            tokio::select! {
                _ = self.cancel.cancelled() => return None,
                sent = self.events.send(event) => {
                    if sent.is_err() {
                        return None;
                    }
                }
            }
        }
    }
}

async fn receive_loop(mut ctx: ReceiveLoop) {
    loop {
        ctx.set_state(ChannelState::Connecting);
        let attempt = tokio::select! {
            _ = ctx.cancel.cancelled() => break,
            attempt = ctx.connect() => attempt,
        };

        match attempt {
            Ok(mut conn) => {
                ctx.backoff.reset();
                ctx.set_state(ChannelState::Connected);
                tracing::info!("Realtime channel connected");

                let Some(reason) = ctx.pump(&mut conn).await else {
                    break;
                };
                tracing::warn!("Realtime connection lost: {reason}");
            }
            Err(e) => tracing::warn!(
                attempt = ctx.backoff.failures() + 1,
                "Realtime connect failed: {e}"
            ),
        }

        ctx.set_state(ChannelState::Disconnected);
        ctx.backoff.increment();
        if ctx.backoff.exhausted() {
            tracing::error!(
                attempts = ctx.backoff.failures(),
                "Realtime channel giving up; falling back to polling"
            );
            ctx.set_state(ChannelState::Failed);
            return;
        }

        tokio::select! {
            _ = ctx.cancel.cancelled() => break,
            _ = ctx.backoff.sleep() => {}
        }
    }
    ctx.set_state(ChannelState::Disconnected);
}

async fn dispatch_worker(
    id: usize,
    queue: Arc<tokio::sync::Mutex<mpsc::Receiver<ChangeEvent>>>,
    handlers: Arc<[Arc<dyn ChangeHandler>]>,
) {
    loop {
        let event = {
            let mut rx = queue.lock().await;
            rx.recv().await
        };
        let Some(event) = event else {
            break;
        };

        for handler in handlers.iter() {
            if let Err(e) = handler.on_event(&event).await {
                tracing::warn!(worker = id, table = %event.table, "Change handler failed: {e}");
            }
        }
    }
    tracing::trace!(worker = id, "Dispatch worker exiting");
}
