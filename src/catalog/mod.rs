//! The catalog: table set, transactions, mutation engine and read queries.
//!
//! Writes go through [`WriteTxn`], which works on a private copy of the
//! committed [`Db`] and records every row change. Reads go through
//! [`ReadTxn`] against one published version and report the logical
//! index a blocking caller should wait past.

mod checks;
mod indexes;
mod nodes;
mod queries;
mod registration;
mod schema;
mod services;
mod sessions;
mod txn;
mod txn_ops;

pub use indexes::{
    service_from_index_name, service_index_name, service_kind_index_name, SERVICE_LAST_EXTINCTION,
};
pub use schema::{
    AnyChange, Db, TableRow, INDEX_CHECK, INDEX_CONNECT, INDEX_KIND, INDEX_META, INDEX_NODE,
    INDEX_NODE_SERVICE, INDEX_SERVICE, INDEX_STATUS, INDEX_UUID, TABLE_CHECKS, TABLE_COORDINATES,
    TABLE_INDEX, TABLE_NODES, TABLE_SERVICES, TABLE_SESSIONS,
};
pub use txn::{ReadTxn, WriteTxn};
pub use txn_ops::{TxnEntity, TxnOp, TxnResult, TxnVerb};
