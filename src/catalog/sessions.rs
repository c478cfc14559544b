//! Session and coordinate rows.
//!
//! Both belong to other subsystems; the catalog only keeps enough of them
//! to honor node and check deletion.

use super::schema::{check_key, node_key, INDEX_CHECK, INDEX_NODE, TABLE_COORDINATES, TABLE_SESSIONS};
use super::txn::WriteTxn;
use crate::error::{Result, StoreError};
use crate::memdb::IndexKey;
use crate::types::{Coordinate, Session};
use tracing::debug;

impl WriteTxn<'_> {
    /// Create or replace a session. Its node and every check it names
    /// must exist.
    pub fn create_session(&mut self, session: Session) -> Result<()> {
        if session.id.is_empty() {
            return Err(StoreError::Validation("session ID is required".into()));
        }
        let owner = self.node_by_name(&session.node).ok_or(StoreError::MissingNode)?;
        for check_id in session.node_checks.iter().chain(session.service_checks.iter()) {
            if self.check_on_node(&owner.name, check_id).is_none() {
                return Err(StoreError::InvalidOperation(format!(
                    "missing check {:?} registration for session",
                    check_id
                )));
            }
        }

        let idx = self.index();
        let mut session = session;
        session.node = owner.name.clone();
        match self.get::<Session>(&IndexKey::exact(session.id.clone())) {
            Some(existing) => session.create_index = existing.create_index,
            None => session.create_index = idx,
        }
        session.modify_index = idx;
        self.insert(session)?;
        self.index_update_max(TABLE_SESSIONS)
    }

    pub fn delete_session(&mut self, id: &str) -> Result<()> {
        if self.delete::<Session>(&IndexKey::exact(id)).is_some() {
            self.index_update_max(TABLE_SESSIONS)?;
        }
        Ok(())
    }

    /// Invalidate every session held by a node. Returns how many went.
    pub(crate) fn invalidate_node_sessions(&mut self, node: &str) -> Result<usize> {
        let sessions = self.table::<Session>().get_by(INDEX_NODE, &node_key(node))?;
        for session in &sessions {
            self.delete_session(&session.id)?;
        }
        if !sessions.is_empty() {
            debug!(node, count = sessions.len(), "invalidated node sessions");
        }
        Ok(sessions.len())
    }

    /// Invalidate every session pinned to a check.
    pub(crate) fn invalidate_check_sessions(&mut self, node: &str, check_id: &str) -> Result<usize> {
        let sessions = self
            .table::<Session>()
            .get_by(INDEX_CHECK, &check_key(node, check_id))?;
        for session in &sessions {
            self.delete_session(&session.id)?;
        }
        if !sessions.is_empty() {
            debug!(node, check_id, count = sessions.len(), "invalidated check sessions");
        }
        Ok(sessions.len())
    }

    /// Store a network coordinate for an existing node.
    pub fn ensure_coordinate(&mut self, coord: Coordinate) -> Result<()> {
        let owner = self.node_by_name(&coord.node).ok_or(StoreError::MissingNode)?;
        let mut coord = coord;
        coord.node = owner.name.clone();
        self.insert(coord)?;
        self.index_update_max(TABLE_COORDINATES)
    }

    pub(crate) fn delete_coordinate(&mut self, coord: &Coordinate) -> Result<()> {
        let key = node_key(&coord.node).push(coord.segment.clone());
        if self.delete::<Coordinate>(&key).is_some() {
            self.index_update_max(TABLE_COORDINATES)?;
        }
        Ok(())
    }
}
