//! Generic indexed in-memory tables.

mod table;

pub use table::{Change, IndexKey, IndexSchema, Row, Table, TableSchema, PRIMARY};
