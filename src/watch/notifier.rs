//! Commit-time watch notification.

use super::set::{WatchCh, WatchKey};
use crossbeam_channel::{bounded, Receiver, Sender};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use tracing::trace;

/// Armed key count below which dead entries are left for the next fire.
const PRUNE_FLOOR: usize = 1024;

struct NotifierState {
    /// The notifier holds only the sender and a weak view of the shared
    /// receiver, so a key whose handles were all dropped can be pruned.
    armed: HashMap<WatchKey, (Sender<()>, Weak<Receiver<()>>)>,
    /// Generation of the last commit whose watches have been fired.
    fired_through: u64,
    /// Armed count at which the next fire sweeps dead entries.
    prune_at: usize,
}

impl NotifierState {
    fn prune(&mut self) -> usize {
        let before = self.armed.len();
        self.armed.retain(|_, (_, rx)| rx.strong_count() > 0);
        self.prune_at = (self.armed.len() * 2).max(PRUNE_FLOOR);
        before - self.armed.len()
    }
}

/// Hands out watch handles and fires them when commits touch their keys.
///
/// Handles are armed against a snapshot generation. If a commit newer
/// than that snapshot has already been fired, the caller may have missed
/// it, so the handle comes back already fired and the caller re-reads.
pub struct Notifier {
    state: Mutex<NotifierState>,
}

impl Notifier {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(NotifierState {
                armed: HashMap::new(),
                fired_through: 0,
                prune_at: PRUNE_FLOOR,
            }),
        }
    }

    /// Arm a handle for `key` as seen by a snapshot at `generation`.
    pub fn watch(&self, key: WatchKey, generation: u64) -> WatchCh {
        let mut state = self.state.lock();
        if state.fired_through > generation {
            return WatchCh::fired_for(key);
        }
        if let Some(rx) = state.armed.get(&key).and_then(|(_, rx)| rx.upgrade()) {
            return WatchCh::shared(key, rx);
        }
        // Nobody holds the previous channel any more, so replacing its
        // sender wakes no one.
        let (tx, rx) = bounded(0);
        let rx = Arc::new(rx);
        state.armed.insert(key.clone(), (tx, Arc::downgrade(&rx)));
        WatchCh::shared(key, rx)
    }

    /// Fire every armed handle whose key is in `keys`. Must be called
    /// after the commit at `generation` is visible to readers.
    pub fn fire<I>(&self, keys: I, generation: u64) -> usize
    where
        I: IntoIterator<Item = WatchKey>,
    {
        let mut state = self.state.lock();
        let mut fired = 0;
        for key in keys {
            if state.armed.remove(&key).is_some() {
                fired += 1;
            }
        }
        if generation > state.fired_through {
            state.fired_through = generation;
        }
        let pruned = if state.armed.len() >= state.prune_at { state.prune() } else { 0 };
        trace!(fired, pruned, generation, armed = state.armed.len(), "fired watches");
        fired
    }

    /// Fire every armed handle, for when the whole state is replaced.
    pub fn fire_all(&self, generation: u64) -> usize {
        let mut state = self.state.lock();
        let fired = state.armed.len();
        state.armed.clear();
        state.prune_at = PRUNE_FLOOR;
        if generation > state.fired_through {
            state.fired_through = generation;
        }
        trace!(fired, generation, "fired all watches");
        fired
    }

    /// Forget keys whose handles have all been dropped. Returns how many
    /// were removed.
    pub fn prune(&self) -> usize {
        self.state.lock().prune()
    }

    /// Number of keys with a handle outstanding, counting any dropped
    /// since the last prune.
    pub fn armed_count(&self) -> usize {
        self.state.lock().armed.len()
    }
}

impl Default for Notifier {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memdb::IndexKey;

    #[test]
    fn test_fire_only_touched_keys() {
        let notifier = Notifier::new();
        let a = notifier.watch(WatchKey::Table("nodes"), 0);
        let b = notifier.watch(WatchKey::Table("checks"), 0);

        notifier.fire(vec![WatchKey::Table("nodes")], 1);
        assert!(a.is_fired());
        assert!(!b.is_fired());
        assert_eq!(notifier.armed_count(), 1);
    }

    #[test]
    fn test_stale_snapshot_gets_fired_handle() {
        let notifier = Notifier::new();
        notifier.fire(vec![], 3);

        assert!(notifier.watch(WatchKey::Table("nodes"), 2).is_fired());
        assert!(!notifier.watch(WatchKey::Table("nodes"), 3).is_fired());
    }

    #[test]
    fn test_fire_all() {
        let notifier = Notifier::new();
        let a = notifier.watch(WatchKey::Table("nodes"), 0);
        let b = notifier.watch(WatchKey::Table("checks"), 0);

        assert_eq!(notifier.fire_all(1), 2);
        assert!(a.is_fired() && b.is_fired());
        assert_eq!(notifier.armed_count(), 0);
    }

    #[test]
    fn test_dropped_handles_are_pruned() {
        let notifier = Notifier::new();
        let kept = notifier.watch(WatchKey::Table("nodes"), 0);
        for i in 0..PRUNE_FLOOR {
            let key = WatchKey::index("nodes", "id", IndexKey::exact(format!("ghost-{}", i)));
            drop(notifier.watch(key, 0));
        }
        assert_eq!(notifier.armed_count(), PRUNE_FLOOR + 1);

        // A commit touching none of the keys still sweeps the dead ones.
        notifier.fire(vec![WatchKey::Table("checks")], 1);
        assert_eq!(notifier.armed_count(), 1);
        assert!(!kept.is_fired());

        notifier.fire(vec![WatchKey::Table("nodes")], 2);
        assert!(kept.is_fired());
        assert_eq!(notifier.armed_count(), 0);
    }

    #[test]
    fn test_rewatch_after_drop_gets_live_handle() {
        let notifier = Notifier::new();
        drop(notifier.watch(WatchKey::Table("nodes"), 0));
        assert_eq!(notifier.prune(), 1);

        let again = notifier.watch(WatchKey::Table("nodes"), 0);
        assert!(!again.is_fired());
        notifier.fire(vec![WatchKey::Table("nodes")], 1);
        assert!(again.is_fired());
    }

    #[test]
    fn test_handles_share_one_channel() {
        let notifier = Notifier::new();
        let a = notifier.watch(WatchKey::Table("nodes"), 0);
        let b = notifier.watch(WatchKey::Table("nodes"), 0);
        assert_eq!(notifier.armed_count(), 1);

        notifier.fire(vec![WatchKey::Table("nodes")], 1);
        assert!(a.is_fired() && b.is_fired());
    }
}
