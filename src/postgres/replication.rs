use tokio_postgres::error::SqlState;
use tokio_postgres::Client;
use tracing::{debug, info};

use super::connection::{ReplicationConnection, SimpleRow};
use crate::checkpoint::Checkpoint;
use crate::lsn::Lsn;
use crate::{Error, Result};

/// Logical decoding output plugin the slot is bound to.
pub const OUTPUT_PLUGIN: &str = "pglogical_output";

/// Negotiation parameters passed to the output plugin. The decoder reads
/// payloads in exactly this format: protocol 1, binary base types from a
/// 9.6 server, big-endian.
pub const PGLOGICAL_PARAMS: [&str; 6] = [
    "min_proto_version '1'",
    "max_proto_version '1'",
    "startup_params_format '1'",
    "\"binary.want_binary_basetypes\" '1'",
    "\"binary.basetypes_major_version\" '906'",
    "\"binary.bigendian\" '1'",
];

pub const INSTALL_EXTENSION: &str = "CREATE EXTENSION IF NOT EXISTS pgcapture";
pub const CREATE_LOGICAL_SLOT: &str = "SELECT pg_create_logical_replication_slot($1, $2)";

/// Result of `IDENTIFY_SYSTEM`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SystemInfo {
    pub system_id: String,
    pub timeline: i32,
    pub xlogpos: Lsn,
    pub dbname: Option<String>,
}

impl SystemInfo {
    pub fn from_row(row: &SimpleRow) -> Result<Self> {
        let field = |name: &str| {
            row.get(name)
                .ok_or_else(|| Error::Protocol(format!("IDENTIFY_SYSTEM: missing {}", name)))
        };

        let timeline = field("timeline")?;
        Ok(Self {
            system_id: field("systemid")?.to_string(),
            timeline: timeline.parse().map_err(|_| {
                Error::Protocol(format!("IDENTIFY_SYSTEM: invalid timeline {:?}", timeline))
            })?,
            xlogpos: field("xlogpos")?.parse()?,
            dbname: row.get("dbname").map(str::to_string),
        })
    }
}

/// An active streaming session, valid for one capture.
#[derive(Debug, Clone)]
pub struct ReplicationSession {
    pub slot: String,
    pub start_lsn: Lsn,
    pub system: SystemInfo,
}

/// Identifies the server and puts the replication connection into
/// streaming mode on a slot.
#[derive(Debug, Clone)]
pub struct ReplicationStarter {
    slot: String,
}

impl ReplicationStarter {
    pub fn new(slot: impl Into<String>) -> Self {
        Self { slot: slot.into() }
    }

    pub fn slot(&self) -> &str {
        &self.slot
    }

    pub async fn identify(&self, conn: &mut ReplicationConnection) -> Result<SystemInfo> {
        let rows = conn.simple_query("IDENTIFY_SYSTEM").await?;
        let row = rows
            .first()
            .ok_or_else(|| Error::Protocol("IDENTIFY_SYSTEM returned no rows".to_string()))?;
        let info = SystemInfo::from_row(row)?;

        info!(
            system_id = %info.system_id,
            timeline = info.timeline,
            xlogpos = %info.xlogpos,
            dbname = ?info.dbname,
            "Identified system"
        );
        Ok(info)
    }

    /// A nonzero checkpoint resumes exactly at its LSN; zero starts at the
    /// server's current position.
    pub fn determine_start(checkpoint: &Checkpoint, current: Lsn) -> Lsn {
        if checkpoint.lsn != 0 {
            checkpoint.lsn()
        } else {
            current
        }
    }

    pub fn start_query(&self, lsn: Lsn) -> String {
        format!(
            "START_REPLICATION SLOT {} LOGICAL {} ({})",
            self.slot,
            lsn,
            PGLOGICAL_PARAMS.join(", ")
        )
    }

    pub async fn start_replication(&self, conn: &mut ReplicationConnection, lsn: Lsn) -> Result<()> {
        conn.start_copy_both(&self.start_query(lsn)).await
    }

    /// Identifies the server, resolves the start position and begins
    /// streaming.
    pub async fn start(
        &self,
        conn: &mut ReplicationConnection,
        checkpoint: &Checkpoint,
    ) -> Result<ReplicationSession> {
        let system = self.identify(conn).await?;
        let start_lsn = Self::determine_start(checkpoint, system.xlogpos);

        if checkpoint.lsn != 0 {
            info!("Starting logical replication on slot {} at requested position {}", self.slot, start_lsn);
        } else {
            info!("Starting logical replication on slot {} at server position {}", self.slot, start_lsn);
        }
        self.start_replication(conn, start_lsn).await?;

        Ok(ReplicationSession {
            slot: self.slot.clone(),
            start_lsn,
            system,
        })
    }
}

pub async fn install_extension(client: &Client) -> Result<()> {
    debug!("Installing server extension");
    client.batch_execute(INSTALL_EXTENSION).await?;
    Ok(())
}

/// Creates the logical slot bound to [`OUTPUT_PLUGIN`]. An existing slot
/// with the same name is kept.
pub async fn create_slot(client: &Client, slot: &str) -> Result<()> {
    match client.query(CREATE_LOGICAL_SLOT, &[&slot, &OUTPUT_PLUGIN]).await {
        Ok(_) => {
            info!("Created replication slot '{}'", slot);
            Ok(())
        }
        Err(e) if e.code() == Some(&SqlState::DUPLICATE_OBJECT) => {
            debug!("Replication slot '{}' already exists", slot);
            Ok(())
        }
        Err(e) => Err(Error::Postgres(e)),
    }
}
