use std::collections::HashMap;

use futures::future::{self, BoxFuture};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

/// Why a watch set woke up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchEvent {
    /// A table read through this set has a newer index.
    Changed(&'static str),
    /// The store the reads were taken from was replaced and will never change again.
    Abandoned,
}

struct TableWatch {
    table: &'static str,
    seen: u64,
    rx: watch::Receiver<u64>,
}

impl TableWatch {
    async fn changed(mut self) -> WatchEvent {
        loop {
            if *self.rx.borrow_and_update() > self.seen {
                return WatchEvent::Changed(self.table);
            }
            if self.rx.changed().await.is_err() {
                // The store was dropped.
                return WatchEvent::Abandoned;
            }
        }
    }
}

/// Handles gathered while reading a snapshot. Waiting on the set completes as
/// soon as any table it covers moves past the index observed by the read, or
/// the backing store is abandoned.
#[derive(Default)]
pub struct WatchSet {
    tables: Vec<TableWatch>,
    abandon: Option<CancellationToken>,
}

impl WatchSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.tables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }

    pub(crate) fn add(&mut self, table: &'static str, seen: u64, rx: watch::Receiver<u64>) {
        if let Some(existing) = self.tables.iter_mut().find(|w| w.table == table) {
            existing.seen = existing.seen.min(seen);
            return;
        }
        self.tables.push(TableWatch { table, seen, rx });
    }

    pub(crate) fn watch_abandon(&mut self, token: CancellationToken) {
        self.abandon = Some(token);
    }

    /// Wait for the first change. An empty set without an abandon handle
    /// never fires; callers bound the wait with their own deadline.
    pub async fn wait(self) -> WatchEvent {
        let mut waits: Vec<BoxFuture<'static, WatchEvent>> = self
            .tables
            .into_iter()
            .map(|w| Box::pin(w.changed()) as BoxFuture<'static, WatchEvent>)
            .collect();

        if let Some(token) = self.abandon {
            waits.push(Box::pin(async move {
                token.cancelled().await;
                WatchEvent::Abandoned
            }));
        }

        if waits.is_empty() {
            return future::pending().await;
        }

        let (event, _, _) = future::select_all(waits).await;
        event
    }
}

/// One index channel per table, owned by a store.
pub(crate) struct TableWatches {
    senders: HashMap<&'static str, watch::Sender<u64>>,
}

impl TableWatches {
    pub(crate) fn new(tables: &[&'static str]) -> Self {
        let senders = tables
            .iter()
            .map(|t| (*t, watch::channel(0u64).0))
            .collect();
        Self { senders }
    }

    pub(crate) fn subscribe(&self, table: &'static str) -> Option<watch::Receiver<u64>> {
        self.senders.get(table).map(|tx| tx.subscribe())
    }

    pub(crate) fn notify(&self, table: &str, index: u64) {
        if let Some(tx) = self.senders.get(table) {
            tx.send_replace(index);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn fires_when_table_moves_past_seen_index() {
        let watches = TableWatches::new(&["auth_method"]);
        let mut ws = WatchSet::new();
        ws.add("auth_method", 0, watches.subscribe("auth_method").unwrap());

        watches.notify("auth_method", 5);
        let event = tokio::time::timeout(Duration::from_secs(1), ws.wait())
            .await
            .expect("watch should fire");
        assert_eq!(event, WatchEvent::Changed("auth_method"));
    }

    #[tokio::test]
    async fn change_before_subscribe_is_not_lost() {
        let watches = TableWatches::new(&["auth_method"]);
        let rx = watches.subscribe("auth_method").unwrap();
        // A write lands between the read and the wait.
        watches.notify("auth_method", 3);

        let mut ws = WatchSet::new();
        ws.add("auth_method", 2, rx);
        let event = tokio::time::timeout(Duration::from_millis(200), ws.wait()).await;
        assert_eq!(event.unwrap(), WatchEvent::Changed("auth_method"));
    }

    #[tokio::test]
    async fn stale_notification_does_not_fire() {
        let watches = TableWatches::new(&["auth_method"]);
        let mut ws = WatchSet::new();
        ws.add("auth_method", 9, watches.subscribe("auth_method").unwrap());
        watches.notify("auth_method", 9);

        let event = tokio::time::timeout(Duration::from_millis(50), ws.wait()).await;
        assert!(event.is_err(), "index 9 was already observed");
    }

    #[tokio::test]
    async fn abandonment_wakes_waiters() {
        let token = CancellationToken::new();
        let mut ws = WatchSet::new();
        ws.watch_abandon(token.clone());
        token.cancel();
        assert_eq!(ws.wait().await, WatchEvent::Abandoned);
    }
}
