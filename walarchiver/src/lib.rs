//! Standby-side WAL archiver.
//!
//! Streams the physical replication feed of a primary and maintains a
//! local segment archive. Bytes are written to disk as soon as they
//! arrive, but a segment becomes visible in the archive directory only
//! once it is complete and durable, so downstream consumers never see a
//! torn file. All partial state lives in the `inprogress/` subdirectory
//! and is reconciled at the next startup; no error is recovered from
//! in-process.

use camino::Utf8PathBuf;

pub mod archive;
pub mod connection;
pub mod error;
pub mod receive_wal;
pub mod wal_storage;

#[derive(Debug, Clone)]
pub struct WalArchiverConf {
    /// Server location and credentials. The database is chosen per
    /// connection flavor and must not be present here.
    pub conninfo: String,
    /// Existing directory that completed segments are published into.
    pub archive_dir: Utf8PathBuf,
    /// 0 = quiet, 1 = lifecycle events, 2 = per-frame.
    pub verbose: u8,
}
