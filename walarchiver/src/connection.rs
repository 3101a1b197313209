//! Thin wrapper over the two connection flavors the archiver uses: a
//! plain SQL session for one-off queries and a physical replication
//! session for the copy stream.

use std::str::FromStr;

use bytes::Bytes;
use tokio_postgres::config::ReplicationMode;
use tokio_postgres::{Client, Config, CopyBothDuplex, NoTls, SimpleQueryMessage, SimpleQueryRow};
use tracing::*;

use xlog_utils::{Lsn, TimeLineID};

use crate::error::ArchiveError;

/// Which session flavor to establish.
#[derive(Clone, Copy, Debug)]
pub enum ConnectionKind {
    /// Regular SQL session against the `postgres` database.
    Plain,
    /// Physical replication session, for IDENTIFY_SYSTEM and
    /// START_REPLICATION.
    Replication,
}

pub struct PgConnection {
    client: Client,
}

/// The IDENTIFY_SYSTEM response fields the archiver cares about.
#[derive(Debug)]
pub struct SystemIdentity {
    pub system_id: String,
    pub timeline: TimeLineID,
}

impl PgConnection {
    /// Connect with the caller-supplied connection string. The string
    /// names the server and credentials only; the database is chosen
    /// here, per flavor.
    pub async fn connect(conninfo: &str, kind: ConnectionKind) -> Result<Self, ArchiveError> {
        let mut config = Config::from_str(conninfo).map_err(ArchiveError::Connection)?;
        if config.get_dbname().is_some() {
            return Err(ArchiveError::Config(
                "connection string must not specify a database".to_owned(),
            ));
        }
        match kind {
            ConnectionKind::Plain => {
                config.dbname("postgres");
            }
            ConnectionKind::Replication => {
                config.replication_mode(ReplicationMode::Physical);
            }
        }

        let (client, connection) = config
            .connect(NoTls)
            .await
            .map_err(ArchiveError::Connection)?;
        // The connection object performs the actual communication with
        // the server; it runs on its own so the client side can stay
        // sequential.
        tokio::spawn(async move {
            if let Err(e) = connection.await {
                error!("connection error: {e}");
            }
        });
        debug!("established {kind:?} connection");
        Ok(PgConnection { client })
    }

    /// One-off `SELECT pg_current_xlog_location()` on a plain session;
    /// used when the local archive carries no state at all.
    pub async fn current_wal_location(&self) -> Result<Lsn, ArchiveError> {
        let row = self.query_one("SELECT pg_current_xlog_location()").await?;
        let text = row.get(0).ok_or_else(|| {
            ArchiveError::Protocol("null wal location in server response".to_owned())
        })?;
        text.parse().map_err(|e| {
            ArchiveError::Protocol(format!("unparseable wal location '{text}': {e}"))
        })
    }

    /// IDENTIFY_SYSTEM. The timeline in the second column is held
    /// constant for the whole session.
    pub async fn identify(&self) -> Result<SystemIdentity, ArchiveError> {
        let row = self.query_one("IDENTIFY_SYSTEM").await?;
        let system_id = row
            .get(0)
            .ok_or_else(|| ArchiveError::Protocol("IDENTIFY_SYSTEM without systemid".to_owned()))?
            .to_owned();
        let timeline = row
            .get(1)
            .ok_or_else(|| ArchiveError::Protocol("IDENTIFY_SYSTEM without timeline".to_owned()))?
            .parse::<TimeLineID>()
            .map_err(|e| ArchiveError::Protocol(format!("unparseable timeline: {e}")))?;
        Ok(SystemIdentity {
            system_id,
            timeline,
        })
    }

    /// Enter the copy stream at `start`, which must be segment-aligned.
    /// Works against servers answering with either copy-out or copy-both.
    pub async fn start_replication(
        &self,
        start: Lsn,
    ) -> Result<CopyBothDuplex<Bytes>, ArchiveError> {
        let cmd = format!("START_REPLICATION {start}");
        info!("issuing {cmd}");
        self.client
            .copy_both_simple(&cmd)
            .await
            .map_err(ArchiveError::Replication)
    }

    async fn query_one(&self, sql: &str) -> Result<SimpleQueryRow, ArchiveError> {
        let messages = self
            .client
            .simple_query(sql)
            .await
            .map_err(ArchiveError::Connection)?;
        for message in messages {
            if let SimpleQueryMessage::Row(row) = message {
                return Ok(row);
            }
        }
        Err(ArchiveError::Protocol(format!(
            "no row in response to '{sql}'"
        )))
    }
}
