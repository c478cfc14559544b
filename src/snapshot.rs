//! Point-in-time snapshots and the restore stream.
//!
//! Stream layout:
//! ```text
//! "CAT\0" | version u8 | frame* | end frame
//! frame = kind u8 | len u32 LE | crc32 u32 LE | MessagePack payload
//! ```
//! The end frame carries the number of row frames before it, so a
//! truncated stream is detected rather than silently restored short.

use crate::catalog::{Db, TableRow};
use crate::error::{Result, StoreError};
use crate::types::{Coordinate, HealthCheck, IndexEntry, Node, ServiceInstance, Session};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::io::{ErrorKind, Read, Write};
use std::sync::Arc;
use tracing::info;

const SNAPSHOT_MAGIC: &[u8; 4] = b"CAT\0";
const SNAPSHOT_VERSION: u8 = 1;
const MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
enum FrameKind {
    End = 0,
    Node = 1,
    Service = 2,
    Check = 3,
    Index = 4,
    Coordinate = 5,
    Session = 6,
}

impl FrameKind {
    fn from_u8(b: u8) -> Result<Self> {
        Ok(match b {
            0 => FrameKind::End,
            1 => FrameKind::Node,
            2 => FrameKind::Service,
            3 => FrameKind::Check,
            4 => FrameKind::Index,
            5 => FrameKind::Coordinate,
            6 => FrameKind::Session,
            other => return Err(StoreError::InvalidFormat(format!("unknown frame kind {}", other))),
        })
    }
}

/// A consistent copy of every catalog table at one commit.
#[derive(Clone, Debug)]
pub struct Snapshot {
    db: Arc<Db>,
}

impl Snapshot {
    pub(crate) fn new(db: Arc<Db>) -> Self {
        Self { db }
    }

    /// Highest index entry value in the snapshot.
    pub fn last_index(&self) -> u64 {
        self.db.index().iter().map(|e| e.value).max().unwrap_or(0)
    }

    pub fn nodes(&self) -> impl Iterator<Item = &Arc<Node>> + '_ {
        self.db.nodes().iter()
    }

    pub fn services(&self) -> impl Iterator<Item = &Arc<ServiceInstance>> + '_ {
        self.db.services().iter()
    }

    pub fn checks(&self) -> impl Iterator<Item = &Arc<HealthCheck>> + '_ {
        self.db.checks().iter()
    }

    pub fn index_entries(&self) -> impl Iterator<Item = &Arc<IndexEntry>> + '_ {
        self.db.index().iter()
    }

    pub fn coordinates(&self) -> impl Iterator<Item = &Arc<Coordinate>> + '_ {
        self.db.coordinates().iter()
    }

    pub fn sessions(&self) -> impl Iterator<Item = &Arc<Session>> + '_ {
        self.db.sessions().iter()
    }

    /// Write the snapshot as a framed stream. Returns the number of row
    /// frames written.
    pub fn persist<W: Write>(&self, writer: &mut W) -> Result<u64> {
        writer.write_all(SNAPSHOT_MAGIC)?;
        writer.write_all(&[SNAPSHOT_VERSION])?;

        let mut frames = 0u64;
        // Parents before children, so a stream replays in dependency order.
        frames += write_rows(writer, FrameKind::Node, self.nodes())?;
        frames += write_rows(writer, FrameKind::Service, self.services())?;
        frames += write_rows(writer, FrameKind::Check, self.checks())?;
        frames += write_rows(writer, FrameKind::Coordinate, self.coordinates())?;
        frames += write_rows(writer, FrameKind::Session, self.sessions())?;
        frames += write_rows(writer, FrameKind::Index, self.index_entries())?;
        write_frame(writer, FrameKind::End, &frames)?;
        writer.flush()?;

        info!(frames, last_index = self.last_index(), "persisted snapshot");
        Ok(frames)
    }
}

fn write_rows<'a, W, R, I>(writer: &mut W, kind: FrameKind, rows: I) -> Result<u64>
where
    W: Write,
    R: Serialize + 'a,
    I: Iterator<Item = &'a Arc<R>>,
{
    let mut n = 0;
    for row in rows {
        write_frame(writer, kind, &**row)?;
        n += 1;
    }
    Ok(n)
}

fn write_frame<W: Write, T: Serialize + ?Sized>(writer: &mut W, kind: FrameKind, value: &T) -> Result<()> {
    let encoded = rmp_serde::to_vec_named(value)?;
    let len = u32::try_from(encoded.len())
        .map_err(|_| StoreError::Serialization(format!("frame of {} bytes too large", encoded.len())))?;
    writer.write_all(&[kind as u8])?;
    writer.write_all(&len.to_le_bytes())?;
    writer.write_all(&crc32fast::hash(&encoded).to_le_bytes())?;
    writer.write_all(&encoded)?;
    Ok(())
}

fn read_frame<R: Read>(reader: &mut R) -> Result<(FrameKind, Vec<u8>)> {
    let mut header = [0u8; 9];
    reader.read_exact(&mut header).map_err(|e| match e.kind() {
        ErrorKind::UnexpectedEof => StoreError::Corruption("snapshot stream truncated".into()),
        _ => StoreError::Io(e),
    })?;

    let kind = FrameKind::from_u8(header[0])?;
    let len = u32::from_le_bytes([header[1], header[2], header[3], header[4]]) as usize;
    let expected = u32::from_le_bytes([header[5], header[6], header[7], header[8]]);
    if len > MAX_FRAME_LEN {
        return Err(StoreError::Corruption(format!("frame of {} bytes exceeds limit", len)));
    }

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).map_err(|e| match e.kind() {
        ErrorKind::UnexpectedEof => StoreError::Corruption("snapshot frame truncated".into()),
        _ => StoreError::Io(e),
    })?;

    let got = crc32fast::hash(&payload);
    if got != expected {
        return Err(StoreError::ChecksumMismatch { expected, got });
    }
    Ok((kind, payload))
}

fn decode<T: DeserializeOwned>(payload: &[u8]) -> Result<T> {
    Ok(rmp_serde::from_slice(payload)?)
}

/// Rows counted while restoring.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RestoreStats {
    pub nodes: usize,
    pub services: usize,
    pub checks: usize,
    pub index_entries: usize,
    pub coordinates: usize,
    pub sessions: usize,
}

/// Direct-insert builder for a fresh table set.
///
/// Rows go in exactly as given: indexes are preserved, nothing is
/// suppressed, nothing cascades, and no index entry is bumped. Index
/// entries must be restored explicitly.
pub struct Restore {
    db: Db,
    stats: RestoreStats,
}

impl Restore {
    pub fn new() -> Self {
        Self {
            db: Db::new(),
            stats: RestoreStats::default(),
        }
    }

    fn insert<R: TableRow>(&mut self, row: R) -> Result<()> {
        Arc::make_mut(R::table_mut(&mut self.db)).insert(row)?;
        Ok(())
    }

    pub fn node(&mut self, node: Node) -> Result<()> {
        self.insert(node)?;
        self.stats.nodes += 1;
        Ok(())
    }

    pub fn service(&mut self, svc: ServiceInstance) -> Result<()> {
        self.insert(svc)?;
        self.stats.services += 1;
        Ok(())
    }

    pub fn check(&mut self, check: HealthCheck) -> Result<()> {
        self.insert(check)?;
        self.stats.checks += 1;
        Ok(())
    }

    pub fn index_entry(&mut self, entry: IndexEntry) -> Result<()> {
        self.insert(entry)?;
        self.stats.index_entries += 1;
        Ok(())
    }

    pub fn coordinate(&mut self, coord: Coordinate) -> Result<()> {
        self.insert(coord)?;
        self.stats.coordinates += 1;
        Ok(())
    }

    pub fn session(&mut self, session: Session) -> Result<()> {
        self.insert(session)?;
        self.stats.sessions += 1;
        Ok(())
    }

    pub fn stats(&self) -> RestoreStats {
        self.stats
    }

    /// Read a framed stream written by [`Snapshot::persist`].
    pub fn read_from<R: Read>(reader: &mut R) -> Result<Self> {
        let mut magic = [0u8; 4];
        reader.read_exact(&mut magic)?;
        if &magic != SNAPSHOT_MAGIC {
            return Err(StoreError::InvalidFormat("invalid snapshot magic".into()));
        }
        let mut version = [0u8; 1];
        reader.read_exact(&mut version)?;
        if version[0] != SNAPSHOT_VERSION {
            return Err(StoreError::InvalidFormat(format!(
                "unsupported snapshot version: {}",
                version[0]
            )));
        }

        let mut restore = Restore::new();
        let mut frames = 0u64;
        loop {
            let (kind, payload) = read_frame(reader)?;
            match kind {
                FrameKind::End => {
                    let expected: u64 = decode(&payload)?;
                    if expected != frames {
                        return Err(StoreError::Corruption(format!(
                            "snapshot declares {} frames, read {}",
                            expected, frames
                        )));
                    }
                    break;
                }
                FrameKind::Node => restore.node(decode(&payload)?)?,
                FrameKind::Service => restore.service(decode(&payload)?)?,
                FrameKind::Check => restore.check(decode(&payload)?)?,
                FrameKind::Index => restore.index_entry(decode(&payload)?)?,
                FrameKind::Coordinate => restore.coordinate(decode(&payload)?)?,
                FrameKind::Session => restore.session(decode(&payload)?)?,
            }
            frames += 1;
        }
        Ok(restore)
    }

    pub(crate) fn into_db(self) -> Db {
        self.db
    }
}

impl Default for Restore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::HealthStatus;

    fn sample() -> Snapshot {
        let mut restore = Restore::new();
        let mut node = Node::new("n1", "10.0.0.1");
        node.create_index = 3;
        node.modify_index = 7;
        restore.node(node).unwrap();
        let mut svc = ServiceInstance::new("web", 80);
        svc.node = "n1".into();
        restore.service(svc).unwrap();
        restore
            .check(HealthCheck::service_check("n1", "c1", "web", HealthStatus::Passing))
            .unwrap();
        restore
            .index_entry(IndexEntry {
                key: "service.web".into(),
                value: 7,
            })
            .unwrap();
        Snapshot::new(Arc::new(restore.into_db()))
    }

    #[test]
    fn test_persist_and_read_back() {
        let snap = sample();
        let mut buf = Vec::new();
        assert_eq!(snap.persist(&mut buf).unwrap(), 4);
        assert_eq!(&buf[..4], b"CAT\0");

        let restore = Restore::read_from(&mut buf.as_slice()).unwrap();
        assert_eq!(restore.stats().nodes, 1);
        assert_eq!(restore.stats().index_entries, 1);

        let db = restore.into_db();
        let node = db.nodes().get(&crate::memdb::IndexKey::lower("N1")).unwrap();
        assert_eq!((node.create_index, node.modify_index), (3, 7));
        assert_eq!(db.index_value("service.web"), Some(7));
    }

    #[test]
    fn test_bad_magic() {
        let err = Restore::read_from(&mut &b"NOPE\x01"[..]).err().unwrap();
        assert!(matches!(err, StoreError::InvalidFormat(_)));
    }

    #[test]
    fn test_checksum_mismatch() {
        let mut buf = Vec::new();
        sample().persist(&mut buf).unwrap();
        // First payload byte of the first frame.
        buf[5 + 9] ^= 0xff;
        let err = Restore::read_from(&mut buf.as_slice()).err().unwrap();
        assert!(matches!(err, StoreError::ChecksumMismatch { .. }));
    }

    #[test]
    fn test_truncated_stream() {
        let mut buf = Vec::new();
        sample().persist(&mut buf).unwrap();
        buf.truncate(buf.len() - 3);
        let err = Restore::read_from(&mut buf.as_slice()).err().unwrap();
        assert!(matches!(err, StoreError::Corruption(_)));
    }
}
