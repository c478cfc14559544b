//! Atomic node + service + checks registration.

use super::txn::WriteTxn;
use crate::error::{Result, StoreError};
use crate::types::{HealthCheck, RegisterRequest};

impl WriteTxn<'_> {
    /// Apply a registration: the node, then the service, then each check.
    ///
    /// Parts that already match the stored rows are skipped so repeated
    /// anti-entropy syncs do not churn indexes. Any failure aborts the
    /// whole transaction.
    pub fn ensure_registration(&mut self, req: RegisterRequest) -> Result<()> {
        let node_changed = match self.node_by_name(&req.node) {
            Some(existing) => req.changes_node(&existing),
            None => true,
        };
        if node_changed {
            self.ensure_node(req.to_node())?;
        }

        if let Some(svc) = &req.service {
            let mut svc = svc.clone();
            svc.node = req.node.clone();
            let unchanged = self
                .service_on_node(&req.node, &svc.id)
                .map_or(false, |existing| existing.is_same_service(&svc));
            if !unchanged {
                self.ensure_service(&req.node, svc)?;
            }
        }

        let RegisterRequest { node, check, checks, .. } = req;
        for hc in check.into_iter().chain(checks) {
            self.ensure_check_if_node_matches(&node, hc)?;
        }
        Ok(())
    }

    fn ensure_check_if_node_matches(&mut self, node: &str, hc: HealthCheck) -> Result<()> {
        if !hc.node.eq_ignore_ascii_case(node) {
            return Err(StoreError::CheckNodeMismatch {
                check_node: hc.node,
                node: node.to_string(),
            });
        }
        self.ensure_check(hc)
    }
}
