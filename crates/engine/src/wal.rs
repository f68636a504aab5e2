//! Write-ahead-log record emission
//!
//! The engine does not own durable storage; it emits fixed-layout records
//! to externally supplied byte sinks, one per log partition. Record layout
//! (little endian): commit version `u64`, class id `u16`, operation `u8`,
//! object id `u64`, property payload in the class's current layout.

use byteorder::{ByteOrder, LittleEndian};
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use velox_concurrency::{CommitLog, LogOperation, LogRecord};
use velox_core::{ClassId, DbError, ObjectId, Result};

/// Byte sink for one log partition (external collaborator).
pub trait LogWriter: Send + Sync {
    /// Append one encoded record. An error leaves the commit outcome
    /// unknown to the caller.
    fn append(&self, bytes: &[u8]) -> Result<()>;
}

/// Header size of an encoded record.
pub const RECORD_HEADER: usize = 8 + 2 + 1 + 8;

/// Encode a record into its wire layout.
pub fn encode_record(record: &LogRecord<'_>) -> Vec<u8> {
    let mut out = vec![0u8; RECORD_HEADER + record.payload.len()];
    LittleEndian::write_u64(&mut out[0..8], record.commit_version);
    LittleEndian::write_u16(&mut out[8..10], record.class.as_u16());
    out[10] = record.op as u8;
    LittleEndian::write_u64(&mut out[11..19], record.id.as_u64());
    out[RECORD_HEADER..].copy_from_slice(record.payload);
    out
}

/// A decoded record header plus payload, for recovery-side consumers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedRecord {
    /// Commit version of the owning transaction.
    pub commit_version: u64,
    /// Class of the object.
    pub class: ClassId,
    /// Operation tag.
    pub op: u8,
    /// The object.
    pub id: ObjectId,
    /// Property payload.
    pub payload: Vec<u8>,
}

/// Decode one record; `None` if truncated.
pub fn decode_record(bytes: &[u8]) -> Option<DecodedRecord> {
    if bytes.len() < RECORD_HEADER {
        return None;
    }
    Some(DecodedRecord {
        commit_version: LittleEndian::read_u64(&bytes[0..8]),
        class: ClassId(LittleEndian::read_u16(&bytes[8..10])),
        op: bytes[10],
        id: ObjectId::from_u64(LittleEndian::read_u64(&bytes[11..19])),
        payload: bytes[RECORD_HEADER..].to_vec(),
    })
}

/// An in-memory [`LogWriter`] backing tests and ephemeral databases.
#[derive(Debug, Default)]
pub struct VecLogWriter {
    records: Mutex<Vec<Vec<u8>>>,
}

impl VecLogWriter {
    /// New empty writer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of the appended records.
    pub fn records(&self) -> Vec<Vec<u8>> {
        self.records.lock().clone()
    }
}

impl LogWriter for VecLogWriter {
    fn append(&self, bytes: &[u8]) -> Result<()> {
        self.records.lock().push(bytes.to_vec());
        Ok(())
    }
}

/// The engine's partitioned log: class records append to the partition the
/// model assigned them. Partitions are created on demand by the factory.
pub struct LogSet {
    partitions: RwLock<Vec<Arc<dyn LogWriter>>>,
    factory: Box<dyn Fn() -> Arc<dyn LogWriter> + Send + Sync>,
}

impl LogSet {
    /// New log set creating partitions with `factory`.
    pub fn new(factory: Box<dyn Fn() -> Arc<dyn LogWriter> + Send + Sync>) -> Self {
        LogSet {
            partitions: RwLock::new(Vec::new()),
            factory,
        }
    }

    /// In-memory log set for tests and ephemeral databases.
    pub fn in_memory() -> Self {
        Self::new(Box::new(|| Arc::new(VecLogWriter::new()) as Arc<dyn LogWriter>))
    }

    /// Make sure at least `count` partitions exist.
    pub fn ensure_partitions(&self, count: u32) {
        let mut partitions = self.partitions.write();
        while partitions.len() < count as usize {
            partitions.push((self.factory)());
        }
    }

    /// The writer of one partition, if it exists.
    pub fn partition(&self, log_index: u32) -> Option<Arc<dyn LogWriter>> {
        self.partitions.read().get(log_index as usize).cloned()
    }
}

impl CommitLog for LogSet {
    fn append(&self, log_index: u32, record: &LogRecord<'_>) -> Result<()> {
        self.ensure_partitions(log_index + 1);
        let writer = self
            .partition(log_index)
            .ok_or(DbError::UnavailableCommitResult)?;
        writer.append(&encode_record(record))
    }
}

impl std::fmt::Debug for LogSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogSet")
            .field("partitions", &self.partitions.read().len())
            .finish()
    }
}
