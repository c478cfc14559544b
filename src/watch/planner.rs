//! Decides which watch handles a joined query arms.

use super::set::{WatchKey, WatchSet};

/// How a joined query will be watched.
#[derive(Debug)]
pub enum JoinWatch {
    /// One narrow key per distinct service name in the result.
    Narrow(Vec<WatchKey>),
    /// Per-row handles, degrading to whole-table handles at the limit.
    Coarse,
}

impl JoinWatch {
    pub fn is_narrow(&self) -> bool {
        matches!(self, JoinWatch::Narrow(_))
    }
}

/// Two-tier interest registration.
///
/// Joined queries first try to cover their result with narrow
/// per-service-name handles. If any name has none, or there would be
/// more than the limit, the query falls back to watching what it reads
/// row by row, and each row handle in turn gives way to a table handle
/// once the set reaches the limit.
#[derive(Clone, Copy, Debug)]
pub struct WatchPlanner {
    limit: usize,
}

impl WatchPlanner {
    pub fn new(limit: usize) -> Self {
        Self { limit: limit.max(1) }
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Plan from the narrow key of each distinct service name in a result
    /// set. An empty result has nothing narrow to watch.
    pub fn plan<I>(&self, handles: I) -> JoinWatch
    where
        I: IntoIterator<Item = Option<WatchKey>>,
    {
        let mut narrow = Vec::new();
        for handle in handles {
            match handle {
                Some(ch) => narrow.push(ch),
                None => return JoinWatch::Coarse,
            }
            if narrow.len() > self.limit {
                return JoinWatch::Coarse;
            }
        }
        if narrow.is_empty() {
            JoinWatch::Coarse
        } else {
            JoinWatch::Narrow(narrow)
        }
    }

    /// Key to arm for one row read: the row's own key, or `fallback` once
    /// the set is full.
    pub fn row_key(&self, ws: &WatchSet, key: WatchKey, fallback: WatchKey) -> WatchKey {
        if ws.len() < self.limit {
            key
        } else {
            fallback
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memdb::IndexKey;
    use crate::watch::WatchCh;
    use crossbeam_channel::bounded;

    fn ch(name: &str) -> WatchKey {
        WatchKey::index("index", "id", IndexKey::exact(name))
    }

    #[test]
    fn test_all_narrow() {
        let planner = WatchPlanner::new(8);
        let plan = planner.plan(vec![Some(ch("service.web")), Some(ch("service.web-proxy"))]);
        match plan {
            JoinWatch::Narrow(handles) => assert_eq!(handles.len(), 2),
            JoinWatch::Coarse => panic!("expected narrow plan"),
        }
    }

    #[test]
    fn test_missing_handle_goes_coarse() {
        let planner = WatchPlanner::new(8);
        assert!(!planner.plan(vec![Some(ch("service.web")), None]).is_narrow());
    }

    #[test]
    fn test_empty_goes_coarse() {
        let planner = WatchPlanner::new(8);
        assert!(!planner.plan(Vec::new()).is_narrow());
    }

    #[test]
    fn test_row_key_falls_back_when_full() {
        let planner = WatchPlanner::new(1);
        let mut ws = WatchSet::new();
        let row = WatchKey::index("nodes", "id", IndexKey::exact("n1"));

        assert_eq!(planner.row_key(&ws, row.clone(), WatchKey::Table("nodes")), row);
        let (_tx, rx) = bounded(0);
        ws.add(WatchCh::new(ch("x"), rx));
        assert_eq!(
            planner.row_key(&ws, row, WatchKey::Table("nodes")),
            WatchKey::Table("nodes")
        );
    }

    #[test]
    fn test_over_limit_goes_coarse() {
        let planner = WatchPlanner::new(1);
        assert!(!planner.plan(vec![Some(ch("a")), Some(ch("b"))]).is_narrow());
    }
}
