//! Error taxonomy of the archiver. Every variant is fatal: the receive
//! loop attempts no local recovery, the next startup reconstructs state
//! from the filesystem instead.

use camino::Utf8PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ArchiveError {
    /// Unusable command line or archive directory.
    #[error("config: {0}")]
    Config(String),

    /// `inprogress/` holds something the startup scan cannot explain.
    #[error("unexpected content in {dir}: {reason}")]
    CorruptInprogress { dir: Utf8PathBuf, reason: String },

    /// A `.save` left over from an unresolved recovery; it may hold the
    /// only copy of the newest transactions, so a human has to decide.
    #[error("stale save file {0}: resolve manually before restarting")]
    StaleSaveFile(Utf8PathBuf),

    /// Malformed or unexpected copy-stream frame.
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// The frame's in-segment offset disagrees with the file position.
    #[error("frame for in-segment offset {frame:#x} but segment file is at {file:#x}")]
    FrameMisaligned { frame: u64, file: u64 },

    /// The stream rolled over before the segment reached its full size.
    #[error("segment {name} rolled over at {size:#x} bytes, expected {expected:#x}")]
    ShortSegment { name: String, size: u64, expected: u64 },

    #[error("{op}: {source}")]
    Io {
        op: String,
        #[source]
        source: std::io::Error,
    },

    #[error("replication stream: {0}")]
    Replication(#[source] tokio_postgres::Error),

    #[error("connection: {0}")]
    Connection(#[source] tokio_postgres::Error),
}

impl ArchiveError {
    /// Wrap an I/O failure with the operation it interrupted, for use
    /// with `map_err`.
    pub fn io(op: impl std::fmt::Display) -> impl FnOnce(std::io::Error) -> ArchiveError {
        let op = op.to_string();
        move |source| ArchiveError::Io { op, source }
    }
}
