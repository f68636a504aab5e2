//! Engine layer for the VeloxDB core
//!
//! This crate wires the model, storage, and concurrency layers into a
//! database:
//! - Database / TxHandle: the stored-procedure surface with retrying
//!   transaction execution
//! - LogSet: write-ahead-log record emission over external byte sinks
//! - WorkerPool: parallel job execution for engine maintenance
//! - model_update: the online schema-evolution coordinator

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod database;
pub mod model_update;
pub mod wal;
pub mod workers;

pub use database::{Database, HashIndexReader, ObjectView, TxHandle};
pub use model_update::ClassCopier;
pub use wal::{decode_record, encode_record, DecodedRecord, LogSet, LogWriter, VecLogWriter};
pub use workers::WorkerPool;
