//! Batched catalog operations applied in one write transaction.

use super::txn::WriteTxn;
use crate::error::{Result, StoreError};
use crate::types::{HealthCheck, Node, ServiceInstance};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

/// What to do with the entity an operation names.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TxnVerb {
    Set,
    /// Set only if the stored modify index equals the entity's.
    Cas,
    Get,
    Delete,
    /// Delete only if the stored modify index equals the entity's.
    DeleteCas,
}

/// One operation in a batch.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum TxnOp {
    Node { verb: TxnVerb, node: Node },
    Service { verb: TxnVerb, node: String, service: ServiceInstance },
    Check { verb: TxnVerb, check: HealthCheck },
}

/// An entity returned by a batch operation.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum TxnEntity {
    Node(Arc<Node>),
    Service(Arc<ServiceInstance>),
    Check(Arc<HealthCheck>),
}

/// Per-operation outcome.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum TxnResult {
    /// The operation took effect. Set, CAS and get report the stored row.
    Applied(Option<TxnEntity>),
    /// A CAS precondition did not hold; nothing was written.
    NotApplied,
}

impl TxnResult {
    pub fn applied(&self) -> bool {
        matches!(self, TxnResult::Applied(_))
    }

    pub fn entity(&self) -> Option<&TxnEntity> {
        match self {
            TxnResult::Applied(entity) => entity.as_ref(),
            TxnResult::NotApplied => None,
        }
    }
}

fn outcome(applied: bool, entity: impl FnOnce() -> Option<TxnEntity>) -> TxnResult {
    if applied {
        TxnResult::Applied(entity())
    } else {
        TxnResult::NotApplied
    }
}

impl WriteTxn<'_> {
    /// Apply a batch in order. The first error aborts the batch; the
    /// caller discards the transaction.
    pub fn apply_ops(&mut self, ops: Vec<TxnOp>) -> Result<Vec<TxnResult>> {
        let mut results = Vec::with_capacity(ops.len());
        for (i, op) in ops.into_iter().enumerate() {
            match self.apply_op(op) {
                Ok(result) => results.push(result),
                Err(e) => {
                    debug!(op = i, error = %e, "batch aborted");
                    return Err(e);
                }
            }
        }
        Ok(results)
    }

    fn apply_op(&mut self, op: TxnOp) -> Result<TxnResult> {
        match op {
            TxnOp::Node { verb, node } => self.apply_node_op(verb, node),
            TxnOp::Service { verb, node, service } => self.apply_service_op(verb, &node, service),
            TxnOp::Check { verb, check } => self.apply_check_op(verb, check),
        }
    }

    fn apply_node_op(&mut self, verb: TxnVerb, node: Node) -> Result<TxnResult> {
        let name = node.name.clone();
        let applied = match verb {
            TxnVerb::Set => {
                self.ensure_node(node)?;
                true
            }
            TxnVerb::Cas => self.ensure_node_cas(node)?,
            TxnVerb::Get => true,
            TxnVerb::Delete => {
                self.delete_node(&name)?;
                return Ok(TxnResult::Applied(None));
            }
            TxnVerb::DeleteCas => {
                let applied = self.delete_node_cas(&name, node.modify_index)?;
                return Ok(outcome(applied, || None));
            }
        };
        if !applied {
            return Ok(TxnResult::NotApplied);
        }
        let stored = self
            .node_by_name(&name)
            .ok_or_else(|| StoreError::InvalidOperation(format!("node {:?} doesn't exist", name)))?;
        Ok(TxnResult::Applied(Some(TxnEntity::Node(stored))))
    }

    fn apply_service_op(&mut self, verb: TxnVerb, node: &str, service: ServiceInstance) -> Result<TxnResult> {
        let id = service.id.clone();
        let applied = match verb {
            TxnVerb::Set => {
                self.ensure_service(node, service)?;
                true
            }
            TxnVerb::Cas => self.ensure_service_cas(node, service)?,
            TxnVerb::Get => true,
            TxnVerb::Delete => {
                self.delete_service(node, &id)?;
                return Ok(TxnResult::Applied(None));
            }
            TxnVerb::DeleteCas => {
                let applied = self.delete_service_cas(node, &id, service.modify_index)?;
                return Ok(outcome(applied, || None));
            }
        };
        if !applied {
            return Ok(TxnResult::NotApplied);
        }
        let stored = self.service_on_node(node, &id).ok_or_else(|| {
            StoreError::InvalidOperation(format!("service {:?} on node {:?} doesn't exist", id, node))
        })?;
        Ok(TxnResult::Applied(Some(TxnEntity::Service(stored))))
    }

    fn apply_check_op(&mut self, verb: TxnVerb, check: HealthCheck) -> Result<TxnResult> {
        let node = check.node.clone();
        let check_id = check.check_id.clone();
        let applied = match verb {
            TxnVerb::Set => {
                self.ensure_check(check)?;
                true
            }
            TxnVerb::Cas => self.ensure_check_cas(check)?,
            TxnVerb::Get => true,
            TxnVerb::Delete => {
                self.delete_check(&node, &check_id)?;
                return Ok(TxnResult::Applied(None));
            }
            TxnVerb::DeleteCas => {
                let applied = self.delete_check_cas(&node, &check_id, check.modify_index)?;
                return Ok(outcome(applied, || None));
            }
        };
        if !applied {
            return Ok(TxnResult::NotApplied);
        }
        let stored = self.check_on_node(&node, &check_id).ok_or_else(|| {
            StoreError::InvalidOperation(format!("check {:?} on node {:?} doesn't exist", check_id, node))
        })?;
        Ok(TxnResult::Applied(Some(TxnEntity::Check(stored))))
    }
}
