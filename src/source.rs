//! The capture source: setup, capture, commit and stop over one
//! PostgreSQL logical replication slot.

use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};

use crate::checkpoint::{Change, Checkpoint, CheckpointTracker};
use crate::config::SourceConfig;
use crate::decode::{Decoder, SchemaLoader};
use crate::fetch::FetchLoop;
use crate::lifecycle::{LifecycleController, LoopState};
use crate::postgres::connection::{ConnectionManager, ControlClient};
use crate::postgres::replication::{self, ReplicationSession, ReplicationStarter};
use crate::{Error, Result};

/// Streams changes from a pglogical slot through a decoder.
///
/// ```text
/// setup ──▶ capture ──▶ (consume + commit)* ──▶ stop
/// ```
///
/// `setup` opens the control connection and provisions the server,
/// `capture` starts a background fetch loop and returns its change channel.
/// Both connections then belong to that loop until it exits.
pub struct PgLogicalSource<S, D: Decoder> {
    config: SourceConfig,
    connections: Option<ConnectionManager>,
    collaborators: Option<(S, D)>,
    tracker: Arc<CheckpointTracker>,
    controller: Option<LifecycleController>,
    session: Option<ReplicationSession>,
}

impl<S: SchemaLoader, D: Decoder> PgLogicalSource<S, D> {
    pub fn new(config: SourceConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            connections: None,
            collaborators: None,
            tracker: Arc::new(CheckpointTracker::default()),
            controller: None,
            session: None,
        })
    }

    /// Opens the control connection, loads type metadata and makes sure the
    /// extension and, if configured, the slot exist.
    ///
    /// `build` receives the control client and returns the schema loader and
    /// the decoder that shares its metadata. On failure the connection is
    /// closed before returning.
    pub async fn setup<F>(&mut self, build: F) -> Result<()>
    where
        F: FnOnce(ControlClient) -> Result<(S, D)>,
    {
        if self.is_capturing() {
            return Err(Error::Replication {
                message: "cannot run setup while capture is active".to_string(),
            });
        }

        let mut connections = ConnectionManager::default();
        match self.provision(&mut connections, build).await {
            Ok(collaborators) => {
                self.collaborators = Some(collaborators);
                if let Some(mut previous) = self.connections.replace(connections) {
                    previous.close().await;
                }
                Ok(())
            }
            Err(e) => {
                connections.close().await;
                Err(e)
            }
        }
    }

    async fn provision<F>(&self, connections: &mut ConnectionManager, build: F) -> Result<(S, D)>
    where
        F: FnOnce(ControlClient) -> Result<(S, D)>,
    {
        let client = connections
            .open_control(&self.config.setup_conn_str, self.config.connect_timeout())
            .await?;

        let (mut schema, decoder) = build(client.clone())?;
        schema.refresh_type().await?;

        replication::install_extension(&client).await?;
        if self.config.create_slot {
            replication::create_slot(&client, &self.config.repl_slot).await?;
        }

        info!("Setup complete for slot '{}'", self.config.repl_slot);
        Ok((schema, decoder))
    }

    /// Starts streaming from `checkpoint` and returns the change channel
    /// without waiting for any data.
    ///
    /// The channel closes when the loop exits. After that,
    /// [`stop`](Self::stop) returns the reason.
    pub async fn capture(&mut self, checkpoint: Checkpoint) -> Result<mpsc::Receiver<Change<D::Message>>> {
        if self.is_capturing() {
            return Err(Error::Replication {
                message: "capture is already running".to_string(),
            });
        }
        let (Some(mut connections), Some((schema, decoder))) =
            (self.connections.take(), self.collaborators.take())
        else {
            return Err(Error::Replication {
                message: "setup must complete before capture".to_string(),
            });
        };

        let starter = ReplicationStarter::new(&self.config.repl_slot);
        let started = async {
            let conn = connections
                .open_replication(&self.config.repl_conn_str, self.config.connect_timeout())
                .await?;
            starter.start(conn, &checkpoint).await
        }
        .await;

        let session = match started {
            Ok(session) => session,
            Err(e) => {
                connections.close().await;
                return Err(e);
            }
        };

        self.tracker.reset(session.start_lsn.0);
        let (controller, changes) = FetchLoop::new(schema, decoder, self.tracker.clone())
            .with_report_interval(self.config.report_interval())
            .spawn(connections, self.config.channel_capacity);

        self.controller = Some(controller);
        self.session = Some(session);
        Ok(changes)
    }

    /// Acknowledges everything up to and including `checkpoint`. Callable
    /// from any task once capture started.
    pub fn commit(&self, checkpoint: &Checkpoint) {
        self.tracker.commit(checkpoint);
    }

    /// Shared handle for committing from a consumer task.
    pub fn tracker(&self) -> Arc<CheckpointTracker> {
        self.tracker.clone()
    }

    pub fn session(&self) -> Option<&ReplicationSession> {
        self.session.as_ref()
    }

    /// State of the current fetch loop, if capture was started.
    pub fn state(&self) -> Option<LoopState> {
        self.controller.as_ref().map(LifecycleController::state)
    }

    pub fn subscribe(&self) -> Option<watch::Receiver<LoopState>> {
        self.controller.as_ref().map(LifecycleController::subscribe)
    }

    /// Stops the fetch loop and waits until it has exited, its connections
    /// are closed and the change channel is closed.
    ///
    /// Returns the error that ended the loop if it failed on its own.
    /// Without an active capture this only releases the setup connection.
    pub async fn stop(&mut self) -> Result<()> {
        self.collaborators = None;
        if let Some(mut connections) = self.connections.take() {
            connections.close().await;
        }

        let Some(controller) = self.controller.as_mut() else {
            return Ok(());
        };
        let result = controller.stop().await;
        if let Err(e) = &result {
            warn!("Capture ended with error: {}", e);
        }
        self.session = None;
        result
    }

    fn is_capturing(&self) -> bool {
        self.controller
            .as_ref()
            .is_some_and(|c| c.state() != LoopState::Stopped)
    }
}
