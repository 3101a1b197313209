//! Archive directory layout and the startup scan that decides where to
//! resume streaming.
//!
//! The archive directory *is* the persistent state: completed segments
//! live directly under it, the growing segment and at most one `.save`
//! partial from a previous run live under `inprogress/`.

use camino::{Utf8Path, Utf8PathBuf};
use tokio::fs;
use tracing::*;

use xlog_utils::{
    IsSaveFileName, IsXLogFileName, Lsn, XLogFromFileName, XLogSegNoOffsetToRecPtr, SAVE_SUFFIX,
    WAL_SEGMENT_SIZE,
};

use crate::error::ArchiveError;
use crate::wal_storage::fsync_dir;

pub const INPROGRESS_DIR: &str = "inprogress";

#[derive(Debug, Clone)]
pub struct Archive {
    base: Utf8PathBuf,
}

/// What the startup scan found on disk, tried in this order.
#[derive(Debug)]
pub enum ResumeDecision {
    /// A partial segment was saved aside; stream its segment again from
    /// the start.
    RecoverPartial { resume: Lsn, save: SavedPartial },
    /// The archive ends with a completed segment; continue after it.
    ResumeAfterArchived { resume: Lsn },
    /// Nothing on disk; the server decides where we start.
    NoLocalState,
}

impl Archive {
    pub fn new(base: Utf8PathBuf) -> Self {
        Archive { base }
    }

    pub fn base(&self) -> &Utf8Path {
        &self.base
    }

    pub fn inprogress_dir(&self) -> Utf8PathBuf {
        self.base.join(INPROGRESS_DIR)
    }

    pub fn inprogress_path(&self, name: &str) -> Utf8PathBuf {
        self.inprogress_dir().join(name)
    }

    pub fn segment_path(&self, name: &str) -> Utf8PathBuf {
        self.base.join(name)
    }

    /// Create `inprogress/` if missing. A non-directory squatting on the
    /// name is fatal.
    pub async fn ensure_layout(&self) -> Result<(), ArchiveError> {
        let dir = self.inprogress_dir();
        match fs::metadata(&dir).await {
            Ok(meta) if meta.is_dir() => Ok(()),
            Ok(_) => Err(ArchiveError::CorruptInprogress {
                dir,
                reason: "exists but is not a directory".to_owned(),
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                fs::create_dir(&dir)
                    .await
                    .map_err(ArchiveError::io(format!("create {dir}")))
            }
            Err(e) => Err(ArchiveError::io(format!("stat {dir}"))(e)),
        }
    }

    /// Inspect the archive and pick the resume position. Always returns a
    /// segment-aligned position.
    pub async fn scan(&self) -> Result<ResumeDecision, ArchiveError> {
        if let Some(decision) = self.scan_inprogress().await? {
            return Ok(decision);
        }
        self.scan_archived().await
    }

    /// First branch: a partial segment in `inprogress/` from the previous
    /// run. It is renamed aside to `<name>.save` and its segment is
    /// requested again from the start.
    async fn scan_inprogress(&self) -> Result<Option<ResumeDecision>, ArchiveError> {
        let dir = self.inprogress_dir();
        let corrupt = |reason: String| ArchiveError::CorruptInprogress {
            dir: dir.clone(),
            reason,
        };

        let mut entries = fs::read_dir(&dir)
            .await
            .map_err(ArchiveError::io(format!("read {dir}")))?;
        let mut found: Vec<(String, u64)> = Vec::new();
        let mut save: Option<Utf8PathBuf> = None;
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(ArchiveError::io(format!("read {dir}")))?
        {
            let name = match entry.file_name().into_string() {
                Ok(name) => name,
                Err(os) => return Err(corrupt(format!("non-utf8 entry {os:?}"))),
            };
            let meta = entry
                .metadata()
                .await
                .map_err(ArchiveError::io(format!("stat {dir}/{name}")))?;
            if !meta.is_file() {
                return Err(corrupt(format!("non-regular entry '{name}'")));
            }
            if IsSaveFileName(&name) {
                save = Some(dir.join(&name));
            } else if IsXLogFileName(&name) {
                found.push((name, meta.len()));
            } else {
                return Err(corrupt(format!("unrecognized entry '{name}'")));
            }
        }

        // A .save present at startup always means the previous recovery
        // never ran to completion; only a human can tell whether its
        // bytes are still needed.
        if let Some(path) = save {
            return Err(ArchiveError::StaleSaveFile(path));
        }
        if found.len() > 1 {
            return Err(corrupt(format!(
                "{} in-progress segments, expected at most one",
                found.len()
            )));
        }
        let Some((name, size)) = found.pop() else {
            return Ok(None);
        };

        let (segno, _tli) = XLogFromFileName(&name, WAL_SEGMENT_SIZE)
            .map_err(|e| corrupt(e.to_string()))?;
        let save_path = dir.join(format!("{name}{SAVE_SUFFIX}"));
        fs::rename(dir.join(&name), &save_path)
            .await
            .map_err(ArchiveError::io(format!("rename {name} to {save_path}")))?;
        fsync_dir(&dir).await?;

        let resume = XLogSegNoOffsetToRecPtr(segno, 0, WAL_SEGMENT_SIZE);
        info!("found partial segment {name} ({size} bytes), saved aside, resuming at {resume}");
        Ok(Some(ResumeDecision::RecoverPartial {
            resume,
            save: SavedPartial {
                path: save_path,
                segment: name,
                size,
            },
        }))
    }

    /// Second branch: resume right after the highest completed segment.
    /// The raw names are compared as strings; fixed-width uppercase hex
    /// makes that equal to position order.
    async fn scan_archived(&self) -> Result<ResumeDecision, ArchiveError> {
        let mut entries = fs::read_dir(&self.base)
            .await
            .map_err(ArchiveError::io(format!("read {}", self.base)))?;
        let mut last: Option<String> = None;
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(ArchiveError::io(format!("read {}", self.base)))?
        {
            let Ok(name) = entry.file_name().into_string() else {
                continue;
            };
            if !IsXLogFileName(&name) {
                continue;
            }
            let meta = entry
                .metadata()
                .await
                .map_err(ArchiveError::io(format!("stat {}/{name}", self.base)))?;
            if !meta.is_file() {
                continue;
            }
            if last.as_deref() < Some(name.as_str()) {
                last = Some(name);
            }
        }

        match last {
            Some(name) => {
                let (segno, _tli) = XLogFromFileName(&name, WAL_SEGMENT_SIZE)
                    .map_err(|e| ArchiveError::CorruptInprogress {
                        dir: self.base.clone(),
                        reason: e.to_string(),
                    })?;
                let resume = XLogSegNoOffsetToRecPtr(segno + 1, 0, WAL_SEGMENT_SIZE);
                info!("archive ends with {name}, resuming at {resume}");
                Ok(ResumeDecision::ResumeAfterArchived { resume })
            }
            None => {
                info!("archive is empty, asking the server where to start");
                Ok(ResumeDecision::NoLocalState)
            }
        }
    }
}

/// The partial segment saved aside at startup. Until the new stream has
/// re-covered its bytes it may be the only copy of the newest
/// transactions, so it is deleted at the earlier of: the new write offset
/// in the same segment passing its size, or that segment being finalized.
#[derive(Debug)]
pub struct SavedPartial {
    path: Utf8PathBuf,
    segment: String,
    size: u64,
}

impl SavedPartial {
    /// Segment name (24 hex characters) this partial belongs to.
    pub fn is_for(&self, segment: &str) -> bool {
        self.segment == segment
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn path(&self) -> &Utf8Path {
        &self.path
    }

    /// Delete the file; its bytes are no longer the only copy.
    pub async fn retire(self, why: &str) -> Result<(), ArchiveError> {
        fs::remove_file(&self.path)
            .await
            .map_err(ArchiveError::io(format!("remove {}", self.path)))?;
        info!("retired {}: {why}", self.path);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use camino_tempfile::tempdir;

    fn write_file(path: &Utf8Path, len: usize) {
        std::fs::write(path, vec![0u8; len]).unwrap();
    }

    async fn archive_in(dir: &Utf8Path) -> Archive {
        let archive = Archive::new(dir.to_owned());
        archive.ensure_layout().await.unwrap();
        archive
    }

    #[tokio::test]
    async fn empty_archive_has_no_local_state() {
        let dir = tempdir().unwrap();
        let archive = archive_in(dir.path()).await;
        assert!(archive.inprogress_dir().is_dir());
        assert!(matches!(
            archive.scan().await.unwrap(),
            ResumeDecision::NoLocalState
        ));
    }

    #[tokio::test]
    async fn ensure_layout_rejects_file_in_the_way() {
        let dir = tempdir().unwrap();
        write_file(&dir.path().join(INPROGRESS_DIR), 0);
        let archive = Archive::new(dir.path().to_owned());
        assert!(matches!(
            archive.ensure_layout().await,
            Err(ArchiveError::CorruptInprogress { .. })
        ));
    }

    #[tokio::test]
    async fn resumes_after_highest_archived_segment() {
        let dir = tempdir().unwrap();
        let archive = archive_in(dir.path()).await;
        write_file(&archive.segment_path("000000010000000000000005"), 16);
        write_file(&archive.segment_path("000000010000000000000003"), 16);
        // not a segment name, must be ignored
        write_file(&dir.path().join("archive_status"), 0);

        match archive.scan().await.unwrap() {
            ResumeDecision::ResumeAfterArchived { resume } => {
                assert_eq!(resume, Lsn(0x600_0000));
            }
            other => panic!("unexpected decision {other:?}"),
        }
    }

    #[tokio::test]
    async fn archived_name_order_spans_log_boundary() {
        let dir = tempdir().unwrap();
        let archive = archive_in(dir.path()).await;
        write_file(&archive.segment_path("0000000100000000000000FF"), 16);
        write_file(&archive.segment_path("000000010000000100000000"), 16);

        match archive.scan().await.unwrap() {
            ResumeDecision::ResumeAfterArchived { resume } => {
                assert_eq!(resume, Lsn(0x1_0100_0000));
            }
            other => panic!("unexpected decision {other:?}"),
        }
    }

    #[tokio::test]
    async fn partial_segment_is_saved_aside() {
        let dir = tempdir().unwrap();
        let archive = archive_in(dir.path()).await;
        write_file(
            &archive.inprogress_path("000000010000000000000009"),
            0x8000,
        );

        match archive.scan().await.unwrap() {
            ResumeDecision::RecoverPartial { resume, save } => {
                assert_eq!(resume, Lsn(0x900_0000));
                assert_eq!(resume.segment_offset(WAL_SEGMENT_SIZE), 0);
                assert_eq!(save.size(), 0x8000);
                assert!(save.is_for("000000010000000000000009"));
                assert!(save.path().is_file());
            }
            other => panic!("unexpected decision {other:?}"),
        }
        // the bare name is gone, only the .save remains
        assert!(!archive
            .inprogress_path("000000010000000000000009")
            .exists());
        assert!(archive
            .inprogress_path("000000010000000000000009.save")
            .is_file());
    }

    #[tokio::test]
    async fn stale_save_file_is_rejected() {
        let dir = tempdir().unwrap();
        let archive = archive_in(dir.path()).await;
        write_file(
            &archive.inprogress_path("000000010000000000000009.save"),
            0x8000,
        );

        assert!(matches!(
            archive.scan().await,
            Err(ArchiveError::StaleSaveFile(_))
        ));
    }

    #[tokio::test]
    async fn save_file_beats_partial_when_both_present() {
        // Second startup after an aborted recovery: the stale .save wins
        // over the new partial and forces human inspection.
        let dir = tempdir().unwrap();
        let archive = archive_in(dir.path()).await;
        write_file(
            &archive.inprogress_path("000000010000000000000009.save"),
            0x80_0000,
        );
        write_file(
            &archive.inprogress_path("000000010000000000000009"),
            0x40_0000,
        );

        assert!(matches!(
            archive.scan().await,
            Err(ArchiveError::StaleSaveFile(_))
        ));
    }

    #[tokio::test]
    async fn two_partials_are_corrupt() {
        let dir = tempdir().unwrap();
        let archive = archive_in(dir.path()).await;
        write_file(&archive.inprogress_path("000000010000000000000009"), 16);
        write_file(&archive.inprogress_path("00000001000000000000000A"), 16);

        assert!(matches!(
            archive.scan().await,
            Err(ArchiveError::CorruptInprogress { .. })
        ));
    }

    #[tokio::test]
    async fn unrecognized_inprogress_entry_is_corrupt() {
        let dir = tempdir().unwrap();
        let archive = archive_in(dir.path()).await;
        write_file(&archive.inprogress_path("segment.tmp"), 16);

        assert!(matches!(
            archive.scan().await,
            Err(ArchiveError::CorruptInprogress { .. })
        ));
    }

    #[tokio::test]
    async fn lowercase_inprogress_name_is_corrupt() {
        let dir = tempdir().unwrap();
        let archive = archive_in(dir.path()).await;
        write_file(&archive.inprogress_path("0000000100000000000000ff"), 16);

        assert!(matches!(
            archive.scan().await,
            Err(ArchiveError::CorruptInprogress { .. })
        ));
    }

    #[tokio::test]
    async fn saved_partial_retire_removes_file() {
        let dir = tempdir().unwrap();
        let archive = archive_in(dir.path()).await;
        write_file(&archive.inprogress_path("000000010000000000000009"), 16);

        let ResumeDecision::RecoverPartial { save, .. } = archive.scan().await.unwrap() else {
            panic!("expected partial");
        };
        let path = save.path().to_owned();
        save.retire("test").await.unwrap();
        assert!(!path.exists());
    }
}
