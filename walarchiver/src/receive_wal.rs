//! The replication receive loop.
//!
//! Drives one streaming session: startup scan, session setup, then a
//! frame-at-a-time state machine over the copy stream. Frame order is
//! write order; the only mutator of segment and save-file state is this
//! task.

use std::pin::pin;

use bytes::{Buf, Bytes};
use futures::StreamExt;
use tracing::*;

use xlog_utils::{Lsn, TimeLineID, XLogFileName, WAL_SEGMENT_SIZE};

use crate::archive::{Archive, ResumeDecision, SavedPartial};
use crate::connection::{ConnectionKind, PgConnection};
use crate::error::ArchiveError;
use crate::wal_storage::SegmentFile;
use crate::WalArchiverConf;

/// Copy-stream tag of a WAL data frame, the only frame kind accepted.
const XLOG_DATA_TAG: u8 = b'w';
/// Header bytes following the tag: start, end and send-time positions,
/// 8 bytes each, big-endian. Only the start position is consumed.
const XLOG_DATA_HDR_LEN: usize = 24;

/// One decoded WAL data frame.
pub struct WalFrame {
    pub start: Lsn,
    pub data: Bytes,
}

/// Decode a raw copy-stream message. Anything that is not a well-formed,
/// non-empty `'w'` frame is fatal.
pub fn decode_frame(mut buf: Bytes) -> Result<WalFrame, ArchiveError> {
    if buf.is_empty() {
        return Err(ArchiveError::Protocol("empty copy frame".to_owned()));
    }
    let tag = buf.get_u8();
    if tag != XLOG_DATA_TAG {
        return Err(ArchiveError::Protocol(format!(
            "unexpected copy frame tag '{}'",
            tag.escape_ascii()
        )));
    }
    if buf.remaining() < XLOG_DATA_HDR_LEN {
        return Err(ArchiveError::Protocol(format!(
            "short wal frame header: {} bytes after tag",
            buf.remaining()
        )));
    }
    let start = Lsn(buf.get_u64());
    // end position and send time
    buf.advance(16);
    if buf.is_empty() {
        return Err(ArchiveError::Protocol(format!(
            "wal frame at {start} carries no data"
        )));
    }
    Ok(WalFrame { start, data: buf })
}

/// The segment state machine. Owns the open segment file and the `.save`
/// partial left by the previous run, if any.
pub struct WalReceiver {
    archive: Archive,
    timeline: TimeLineID,
    seg: Option<SegmentFile>,
    save: Option<SavedPartial>,
}

impl WalReceiver {
    pub fn new(archive: Archive, timeline: TimeLineID, save: Option<SavedPartial>) -> Self {
        WalReceiver {
            archive,
            timeline,
            seg: None,
            save,
        }
    }

    /// Apply one WAL frame to the on-disk state.
    ///
    /// An in-segment offset of zero either opens the first segment or
    /// rolls the current one over; any other offset must match the open
    /// file's size exactly.
    pub async fn handle_frame(&mut self, frame: WalFrame) -> Result<(), ArchiveError> {
        let xlogoff = frame.start.segment_offset(WAL_SEGMENT_SIZE) as u64;
        debug!("wal frame at {}, {} bytes", frame.start, frame.data.len());

        if frame.data.len() as u64 > WAL_SEGMENT_SIZE as u64 - xlogoff {
            return Err(ArchiveError::Protocol(format!(
                "frame at {} ({} bytes) crosses a segment boundary",
                frame.start,
                frame.data.len()
            )));
        }

        if xlogoff == 0 {
            if let Some(finished) = self.seg.take() {
                let name = finished.name().to_owned();
                finished.finalize(&self.archive).await?;
                self.retire_save_on_rollover(&name).await?;
            }
            self.open_segment(frame.start).await?;
        }
        let Some(seg) = self.seg.as_mut() else {
            return Err(ArchiveError::Protocol(format!(
                "stream needs to start at a segment boundary, got {}",
                frame.start
            )));
        };
        if xlogoff > 0 {
            seg.assert_at(xlogoff)?;
        }
        seg.append(&frame.data).await?;

        let (name, write_offset) = (seg.name().to_owned(), seg.write_offset());
        self.retire_save_if_covered(&name, write_offset).await
    }

    /// The server closed the stream. A segment that is exactly full is
    /// published; anything shorter stays in `inprogress/` for the next
    /// startup to recover.
    pub async fn finish(mut self) -> Result<(), ArchiveError> {
        if let Some(seg) = self.seg.take() {
            if seg.is_complete() {
                let name = seg.name().to_owned();
                seg.finalize(&self.archive).await?;
                self.retire_save_on_rollover(&name).await?;
            } else {
                info!(
                    "leaving partial segment {} at {:#x} bytes",
                    seg.name(),
                    seg.write_offset()
                );
            }
        }
        Ok(())
    }

    async fn open_segment(&mut self, start: Lsn) -> Result<(), ArchiveError> {
        let segno = start.segment_number(WAL_SEGMENT_SIZE);
        let name = XLogFileName(self.timeline, segno, WAL_SEGMENT_SIZE);
        self.seg = Some(SegmentFile::create(&self.archive, name).await?);
        Ok(())
    }

    /// Retirement on rollover: the segment the `.save` belongs to has
    /// been finalized, so the partial is strictly dominated.
    async fn retire_save_on_rollover(&mut self, finalized: &str) -> Result<(), ArchiveError> {
        if self.save.as_ref().map_or(false, |s| s.is_for(finalized)) {
            if let Some(save) = self.save.take() {
                save.retire("its segment is complete in the archive").await?;
            }
        }
        Ok(())
    }

    /// In-segment catch-up: the new write offset has passed the old
    /// partial's size, strictly, so every byte it held has been
    /// re-received.
    async fn retire_save_if_covered(
        &mut self,
        segment: &str,
        write_offset: u64,
    ) -> Result<(), ArchiveError> {
        if self
            .save
            .as_ref()
            .map_or(false, |s| s.is_for(segment) && write_offset > s.size())
        {
            if let Some(save) = self.save.take() {
                save.retire("its bytes have been re-received").await?;
            }
        }
        Ok(())
    }
}

/// Run one streaming session to completion: scan the archive, pick the
/// resume position, stream until the server ends the copy or an
/// interrupt arrives.
pub async fn run(conf: WalArchiverConf) -> Result<(), ArchiveError> {
    let archive = Archive::new(conf.archive_dir.clone());
    archive.ensure_layout().await?;

    let (resume, save) = match archive.scan().await? {
        ResumeDecision::RecoverPartial { resume, save } => (resume, Some(save)),
        ResumeDecision::ResumeAfterArchived { resume } => (resume, None),
        ResumeDecision::NoLocalState => {
            let conn = PgConnection::connect(&conf.conninfo, ConnectionKind::Plain).await?;
            let current = conn.current_wal_location().await?;
            info!("server reports current wal location {current}");
            (current.segment_lsn(WAL_SEGMENT_SIZE), None)
        }
    };
    assert_eq!(resume.segment_offset(WAL_SEGMENT_SIZE), 0);

    let conn = PgConnection::connect(&conf.conninfo, ConnectionKind::Replication).await?;
    let ident = conn.identify().await?;
    info!(
        "connected to system {}, timeline {}, streaming from {resume}",
        ident.system_id, ident.timeline
    );

    let stream = conn.start_replication(resume).await?;
    let mut stream = pin!(stream);
    let mut receiver = WalReceiver::new(archive, ident.timeline, save);

    loop {
        tokio::select! {
            message = stream.next() => match message {
                Some(Ok(buf)) => receiver.handle_frame(decode_frame(buf)?).await?,
                // A failure the server reported is a replication error;
                // anything else means the stream itself broke mid-read.
                Some(Err(e)) if e.as_db_error().is_some() => {
                    return Err(ArchiveError::Replication(e))
                }
                Some(Err(e)) => {
                    return Err(ArchiveError::Protocol(format!(
                        "copy stream read failed: {e}"
                    )))
                }
                // Copy done with a success result: the primary shut down
                // or ended the stream cleanly.
                None => break,
            },
            _ = tokio::signal::ctrl_c() => {
                info!("interrupted, leaving in-progress state for the next run");
                return Ok(());
            }
        }
    }
    info!("replication stream ended");
    receiver.finish().await
}
