//! Watch handles and the sets blocking queries wait on.

use crate::memdb::IndexKey;
use crossbeam_channel::{bounded, Receiver, Select, TryRecvError};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// What a watch handle is interested in.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum WatchKey {
    /// Any change to the table.
    Table(&'static str),
    /// Any change to a row reachable under `key` in the named index.
    Index {
        table: &'static str,
        index: &'static str,
        key: IndexKey,
    },
}

impl WatchKey {
    pub fn index(table: &'static str, index: &'static str, key: IndexKey) -> Self {
        WatchKey::Index { table, index, key }
    }
}

/// A one-shot notification handle.
///
/// Fires when the sending side is dropped and stays fired forever; a
/// fired handle must be replaced by re-reading. Handles for one key share
/// a receiver; once every clone is dropped the notifier may forget the key.
#[derive(Clone, Debug)]
pub struct WatchCh {
    key: WatchKey,
    rx: Arc<Receiver<()>>,
}

impl WatchCh {
    pub(crate) fn new(key: WatchKey, rx: Receiver<()>) -> Self {
        Self::shared(key, Arc::new(rx))
    }

    pub(crate) fn shared(key: WatchKey, rx: Arc<Receiver<()>>) -> Self {
        Self { key, rx }
    }

    /// A handle that has already fired.
    pub(crate) fn fired_for(key: WatchKey) -> Self {
        let (_tx, rx) = bounded(0);
        Self::new(key, rx)
    }

    pub fn key(&self) -> &WatchKey {
        &self.key
    }

    pub fn is_fired(&self) -> bool {
        matches!(self.rx.try_recv(), Err(TryRecvError::Disconnected))
    }
}

/// A set of watch handles, deduplicated by key.
#[derive(Clone, Debug, Default)]
pub struct WatchSet {
    chans: HashMap<WatchKey, Arc<Receiver<()>>>,
}

impl WatchSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, ch: WatchCh) {
        self.chans.entry(ch.key).or_insert(ch.rx);
    }

    /// Add `ch` while the set holds fewer than `limit` handles, otherwise
    /// add `fallback`, which must cover everything `ch` would.
    pub fn add_with_limit(&mut self, limit: usize, ch: WatchCh, fallback: WatchCh) {
        if self.chans.len() < limit {
            self.add(ch);
        } else {
            self.add(fallback);
        }
    }

    pub fn len(&self) -> usize {
        self.chans.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chans.is_empty()
    }

    pub fn contains(&self, key: &WatchKey) -> bool {
        self.chans.contains_key(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &WatchKey> + '_ {
        self.chans.keys()
    }

    /// Whether any handle in the set has fired, without blocking.
    pub fn is_fired(&self) -> bool {
        self.chans
            .values()
            .any(|rx| matches!(rx.try_recv(), Err(TryRecvError::Disconnected)))
    }

    /// Block until any handle fires or `timeout` elapses. Returns `true`
    /// if a handle fired.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        if self.chans.is_empty() {
            std::thread::sleep(timeout);
            return false;
        }
        let mut sel = Select::new();
        for rx in self.chans.values() {
            sel.recv(&**rx);
        }
        sel.ready_timeout(timeout).is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(name: &str) -> WatchKey {
        WatchKey::index("nodes", "id", IndexKey::exact(name))
    }

    #[test]
    fn test_dedupe() {
        let (_tx, rx) = bounded(0);
        let mut ws = WatchSet::new();
        ws.add(WatchCh::new(key("a"), rx.clone()));
        ws.add(WatchCh::new(key("a"), rx));
        assert_eq!(ws.len(), 1);
    }

    #[test]
    fn test_add_with_limit_uses_fallback() {
        let (_tx, rx) = bounded::<()>(0);
        let mut ws = WatchSet::new();
        let fallback = WatchCh::new(WatchKey::Table("nodes"), rx.clone());

        ws.add_with_limit(2, WatchCh::new(key("a"), rx.clone()), fallback.clone());
        ws.add_with_limit(2, WatchCh::new(key("b"), rx.clone()), fallback.clone());
        ws.add_with_limit(2, WatchCh::new(key("c"), rx.clone()), fallback.clone());
        ws.add_with_limit(2, WatchCh::new(key("d"), rx), fallback);

        assert_eq!(ws.len(), 3);
        assert!(ws.contains(&WatchKey::Table("nodes")));
        assert!(!ws.contains(&key("c")));
    }

    #[test]
    fn test_wait_fires_on_sender_drop() {
        let (tx, rx) = bounded::<()>(0);
        let mut ws = WatchSet::new();
        ws.add(WatchCh::new(key("a"), rx));

        assert!(!ws.wait_timeout(Duration::from_millis(10)));
        drop(tx);
        assert!(ws.wait_timeout(Duration::from_millis(10)));
        assert!(ws.is_fired());
    }

    #[test]
    fn test_pre_fired_handle() {
        let ch = WatchCh::fired_for(key("a"));
        assert!(ch.is_fired());
    }
}
