//! The fetch loop: turns the replication stream into ordered [`Change`]s.
//!
//! Each iteration first checks whether a standby status report is due,
//! then waits for the next message until that report deadline. A deadline
//! expiry is a normal tick. WAL data is decoded and forwarded on a bounded
//! channel, so a slow consumer stalls the replication stream itself.
//!
//! Stop requests are honoured at the report step, after a final status
//! report. A pending receive or a blocked channel send is woken by the
//! request, so shutdown does not wait out the report interval.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, error, info, trace};

use crate::checkpoint::{Change, Checkpoint, CheckpointTracker};
use crate::decode::{Classify, Decoder, MessageClass, SchemaLoader};
use crate::lifecycle::{LifecycleController, StopSignal};
use crate::lsn::Lsn;
use crate::postgres::connection::{ConnectionManager, ReplicationTransport, StreamFrame};
use crate::postgres::protocol::{ReplicationMessage, StandbyStatusUpdate};
use crate::postgres::types::{now_pg_micros, pg_time_to_datetime};
use crate::{Error, Result};

pub const DEFAULT_REPORT_INTERVAL: Duration = Duration::from_secs(5);
pub const DEFAULT_CHANNEL_CAPACITY: usize = 100;

pub struct FetchLoop<S, D> {
    schema: S,
    decoder: D,
    tracker: Arc<CheckpointTracker>,
    report_interval: Duration,
    commit_time: DateTime<Utc>,
    /// End offset of the last record handed to the consumer.
    last_forwarded: u64,
    /// End offset of the furthest record dropped without forwarding.
    furthest_skipped: u64,
    /// Highest position sent in a status report.
    reported: u64,
}

impl<S: SchemaLoader, D: Decoder> FetchLoop<S, D> {
    pub fn new(schema: S, decoder: D, tracker: Arc<CheckpointTracker>) -> Self {
        Self {
            schema,
            decoder,
            tracker,
            report_interval: DEFAULT_REPORT_INTERVAL,
            commit_time: DateTime::<Utc>::default(),
            last_forwarded: 0,
            furthest_skipped: 0,
            reported: 0,
        }
    }

    pub fn with_report_interval(mut self, interval: Duration) -> Self {
        self.report_interval = interval;
        self
    }

    /// Moves the loop and the connections onto a background task.
    ///
    /// Returns the controller for stopping it and the receiving end of the
    /// change channel. On exit the task closes the connections, then the
    /// channel, then reports `Stopped`.
    pub fn spawn<T>(
        mut self,
        mut connections: ConnectionManager<T>,
        capacity: usize,
    ) -> (LifecycleController, mpsc::Receiver<Change<D::Message>>)
    where
        T: ReplicationTransport + 'static,
    {
        let (tx, rx) = mpsc::channel(capacity);

        let controller = LifecycleController::spawn(move |mut stop| async move {
            let result = match connections.replication_mut() {
                Some(transport) => self.run(transport, &tx, &mut stop).await,
                None => Err(Error::Replication {
                    message: "replication connection is not open".to_string(),
                }),
            };

            match &result {
                Ok(()) => info!("Fetch loop stopped"),
                Err(e) => error!("Logical replication failed: {}", e),
            }

            connections.close().await;
            drop(tx);
            result
        });

        (controller, rx)
    }

    /// Runs until a stop is observed, the consumer goes away, or a fatal
    /// error occurs.
    pub async fn run<T: ReplicationTransport>(
        &mut self,
        transport: &mut T,
        changes: &mpsc::Sender<Change<D::Message>>,
        stop: &mut StopSignal,
    ) -> Result<()> {
        match self.fetch(transport, changes, stop).await {
            Err(Error::Shutdown) => {
                info!("Change receiver dropped, leaving fetch loop");
                Ok(())
            }
            other => other,
        }
    }

    async fn fetch<T: ReplicationTransport>(
        &mut self,
        transport: &mut T,
        changes: &mpsc::Sender<Change<D::Message>>,
        stop: &mut StopSignal,
    ) -> Result<()> {
        let mut next_report = Instant::now() + self.report_interval;

        loop {
            if Instant::now() >= next_report {
                send_status(transport, self.report_position()).await?;
                next_report = Instant::now() + self.report_interval;
                if stop.is_requested() {
                    info!("Stop observed, leaving fetch loop");
                    return Ok(());
                }
            }

            let frame = tokio::select! {
                biased;
                _ = stop.requested() => {
                    next_report = Instant::now();
                    continue;
                }
                received = tokio::time::timeout_at(next_report, transport.recv()) => match received {
                    Ok(frame) => frame?,
                    Err(_) => continue,
                },
            };

            let payload = match frame {
                StreamFrame::CopyData(payload) => payload,
                StreamFrame::Unexpected(kind) => {
                    return Err(Error::Protocol(format!("unexpected message: {}", kind)))
                }
            };

            match ReplicationMessage::parse(payload)? {
                ReplicationMessage::Keepalive {
                    wal_end,
                    reply_requested,
                    ..
                } => {
                    trace!(wal_end = %wal_end, reply_requested, "Primary keepalive");
                    if reply_requested {
                        next_report = Instant::now();
                    }
                }
                ReplicationMessage::XLogData {
                    wal_start, data, ..
                } => {
                    let Some(change) = self.process_wal(wal_start, &data).await? else {
                        continue;
                    };

                    tokio::select! {
                        biased;
                        sent = changes.send(change) => {
                            if sent.is_err() {
                                return Err(Error::Shutdown);
                            }
                        }
                        _ = stop.requested() => {
                            next_report = Instant::now();
                        }
                    }
                }
            }
        }
    }

    /// Decodes one WAL record and decides whether it becomes a change.
    async fn process_wal(
        &mut self,
        wal_start: Lsn,
        data: &[u8],
    ) -> Result<Option<Change<D::Message>>> {
        let lsn = wal_start
            .0
            .checked_add(data.len() as u64)
            .ok_or_else(|| Error::InvalidMessage {
                message: format!("WAL record at {} overflows the LSN range", wal_start),
            })?;

        let message = match self.decoder.decode(data) {
            Ok(Some(message)) => message,
            Ok(None) => {
                trace!("Record at {} filtered by decoder", wal_start);
                self.skip(lsn);
                return Ok(None);
            }
            Err(e @ Error::Decode(_)) => return Err(e),
            Err(e) => return Err(Error::Decode(e.to_string())),
        };

        match message.class() {
            MessageClass::Begin { commit_time } => {
                self.commit_time =
                    pg_time_to_datetime(commit_time).ok_or_else(|| Error::InvalidMessage {
                        message: format!("commit time out of range: {}", commit_time),
                    })?;
            }
            MessageClass::Change { ignore, ddl } => {
                if ddl {
                    debug!("DDL change at {}, refreshing type metadata", wal_start);
                    self.schema
                        .refresh_type()
                        .await
                        .map_err(|e| Error::SchemaRefresh(Box::new(e)))?;
                }
                if ignore {
                    trace!("Ignoring change at {}", wal_start);
                    self.skip(lsn);
                    return Ok(None);
                }
            }
            MessageClass::Other => {}
        }

        self.last_forwarded = lsn;
        Ok(Some(Change {
            checkpoint: Checkpoint::new(lsn, self.commit_time),
            message,
        }))
    }

    fn skip(&mut self, lsn: u64) {
        self.furthest_skipped = self.furthest_skipped.max(lsn);
    }

    /// The position acknowledged to the server.
    ///
    /// Normally the consumer's committed LSN. Once the consumer has
    /// committed everything forwarded so far, records dropped after that
    /// point hold nothing back, so the position moves past them. Reports
    /// never move backwards.
    fn report_position(&mut self) -> Lsn {
        let acked = self.tracker.committed_lsn();
        let candidate = if acked.0 >= self.last_forwarded && self.furthest_skipped > acked.0 {
            self.furthest_skipped
        } else {
            acked.0
        };
        self.reported = self.reported.max(candidate);
        Lsn(self.reported)
    }
}

async fn send_status<T: ReplicationTransport>(transport: &mut T, position: Lsn) -> Result<()> {
    transport
        .send_status(&StandbyStatusUpdate::acknowledge(position, now_pg_micros()))
        .await?;
    debug!("Sent standby status update at {}", position);
    Ok(())
}
