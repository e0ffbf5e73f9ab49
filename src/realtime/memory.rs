//! In-process [`RealtimeTransport`] for tests.
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::{ChangeEvent, RealtimeConnection, RealtimeTransport};
use crate::error::{Error, Result};
use crate::gateway::Table;

#[derive(Default)]
struct Inner {
    connects: usize,
    failing_connects: u32,
    refuse: bool,
    subscriptions: Vec<Table>,
    live: Option<mpsc::UnboundedSender<ChangeEvent>>,
}

/// Each `connect` opens a fresh in-memory connection; [`emit`](Self::emit)
/// delivers to the most recent one.
#[derive(Clone, Default)]
pub struct MemoryTransport {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryTransport {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Sends an event on the open connection. `false` if none is open.
    pub fn emit(&self, event: ChangeEvent) -> bool {
        self.lock()
            .live
            .as_ref()
            .is_some_and(|tx| tx.send(event).is_ok())
    }

    /// Closes the open connection as if the server went away.
    pub fn drop_connection(&self) {
        self.lock().live = None;
    }

    /// The next `n` connection attempts fail.
    pub fn fail_next_connects(&self, n: u32) {
        self.lock().failing_connects = n;
    }

    /// Every connection attempt fails while set.
    pub fn set_refusing(&self, refuse: bool) {
        self.lock().refuse = refuse;
    }

    #[must_use]
    pub fn connects(&self) -> usize {
        self.lock().connects
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.lock().live.as_ref().is_some_and(|tx| !tx.is_closed())
    }

    /// Every table subscribed to, across all connections, in call order.
    #[must_use]
    pub fn subscriptions(&self) -> Vec<Table> {
        self.lock().subscriptions.clone()
    }
}

#[async_trait]
impl RealtimeTransport for MemoryTransport {
    async fn connect(&self) -> Result<Box<dyn RealtimeConnection>> {
        let mut inner = self.lock();
        inner.connects += 1;
        if inner.refuse {
            return Err(Error::Network("connection refused".into()));
        }
        if inner.failing_connects > 0 {
            inner.failing_connects -= 1;
            return Err(Error::Network("connection refused".into()));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        inner.live = Some(tx);
        Ok(Box::new(MemoryConnection {
            rx,
            transport: self.clone(),
        }))
    }
}

struct MemoryConnection {
    rx: mpsc::UnboundedReceiver<ChangeEvent>,
    transport: MemoryTransport,
}

#[async_trait]
impl RealtimeConnection for MemoryConnection {
    async fn subscribe(&mut self, table: Table) -> Result<()> {
        self.transport.lock().subscriptions.push(table);
        Ok(())
    }

    async fn next_event(&mut self) -> Result<Option<ChangeEvent>> {
        Ok(self.rx.recv().await)
    }
}
