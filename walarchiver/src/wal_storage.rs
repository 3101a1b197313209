//! The currently-open segment file in `inprogress/`.
//!
//! A segment is created with an exclusive open, appended to in frame
//! order, and leaves `inprogress/` only through [`SegmentFile::finalize`]:
//! fsync, close, atomic rename into the archive directory. After a crash,
//! any segment visible outside `inprogress/` is therefore whole and
//! durable.

use camino::{Utf8Path, Utf8PathBuf};
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tracing::*;

use xlog_utils::WAL_SEGMENT_SIZE;

use crate::archive::Archive;
use crate::error::ArchiveError;

/// Segment files are private to the archiver user.
const SEGMENT_FILE_MODE: u32 = 0o600;

pub struct SegmentFile {
    file: File,
    name: String,
    path: Utf8PathBuf,
    write_offset: u64,
}

impl SegmentFile {
    /// Exclusive-create `inprogress/<name>`. A file already bearing this
    /// name means the startup scan's view of the directory no longer
    /// holds.
    pub async fn create(archive: &Archive, name: String) -> Result<Self, ArchiveError> {
        let path = archive.inprogress_path(&name);
        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .mode(SEGMENT_FILE_MODE)
            .open(&path)
            .await
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::AlreadyExists {
                    ArchiveError::CorruptInprogress {
                        dir: archive.inprogress_dir(),
                        reason: format!("segment {name} already exists"),
                    }
                } else {
                    ArchiveError::io(format!("create {path}"))(e)
                }
            })?;
        info!("opened segment {name}");
        Ok(SegmentFile {
            file,
            name,
            path,
            write_offset: 0,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current size of the file, which is also the offset the next frame
    /// must carry.
    pub fn write_offset(&self) -> u64 {
        self.write_offset
    }

    pub fn is_complete(&self) -> bool {
        self.write_offset == WAL_SEGMENT_SIZE as u64
    }

    /// Whole-buffer append; a short write surfaces as an I/O error from
    /// `write_all`.
    pub async fn append(&mut self, buf: &[u8]) -> Result<(), ArchiveError> {
        self.file
            .write_all(buf)
            .await
            .map_err(ArchiveError::io(format!("write {}", self.path)))?;
        self.write_offset += buf.len() as u64;
        Ok(())
    }

    /// Every frame that does not open a segment must land exactly at the
    /// current end of the file.
    pub fn assert_at(&self, expected: u64) -> Result<(), ArchiveError> {
        if self.write_offset != expected {
            return Err(ArchiveError::FrameMisaligned {
                frame: expected,
                file: self.write_offset,
            });
        }
        Ok(())
    }

    /// Flush, close and publish the finished segment. The fsync happens
    /// before the rename: a completed name in the archive directory
    /// implies durable contents.
    pub async fn finalize(self, archive: &Archive) -> Result<(), ArchiveError> {
        if !self.is_complete() {
            return Err(ArchiveError::ShortSegment {
                name: self.name,
                size: self.write_offset,
                expected: WAL_SEGMENT_SIZE as u64,
            });
        }
        self.file
            .sync_all()
            .await
            .map_err(ArchiveError::io(format!("fsync {}", self.path)))?;
        drop(self.file);

        let target = archive.segment_path(&self.name);
        tokio::fs::rename(&self.path, &target)
            .await
            .map_err(ArchiveError::io(format!("rename {} to {target}", self.path)))?;
        fsync_dir(archive.base()).await?;
        info!("completed segment {}", self.name);
        Ok(())
    }
}

/// Make a rename or unlink in `dir` itself durable.
pub async fn fsync_dir(dir: &Utf8Path) -> Result<(), ArchiveError> {
    let f = File::open(dir)
        .await
        .map_err(ArchiveError::io(format!("open {dir}")))?;
    f.sync_all()
        .await
        .map_err(ArchiveError::io(format!("fsync {dir}")))
}
