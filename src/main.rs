use anyhow::Context;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use clap::Parser;
use pglogical_capture::raw::{RawDecoder, RawMessage, TypeCatalog};
use pglogical_capture::{
    Change, Checkpoint, CheckpointManager, CheckpointTracker, Config, PgLogicalSource,
};
use std::future::Future;
use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

#[derive(Parser, Debug)]
#[command(name = "pglogical-capture")]
#[command(about = "Stream PostgreSQL logical replication changes as JSON lines", long_about = None)]
struct Args {
    #[arg(short, long, value_name = "FILE", default_value = "config.toml")]
    config: PathBuf,

    #[arg(short, long, help = "Enable JSON output for logs")]
    json_logs: bool,

    #[arg(short, long, help = "Verbose logging")]
    verbose: bool,

    #[arg(long, help = "Ignore any saved checkpoint and start at the server's current position")]
    from_current: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    init_logging(args.json_logs, args.verbose);

    info!("Starting pglogical-capture");
    info!("Loading configuration from {:?}", args.config);

    let config = Config::from_file(&args.config)
        .with_context(|| format!("failed to load configuration from {:?}", args.config))?;

    info!(
        repl_slot = %config.source.repl_slot,
        create_slot = config.source.create_slot,
        report_interval_secs = config.source.report_interval_secs,
        channel_capacity = config.source.channel_capacity,
        checkpoint_file = ?config.checkpoint.file,
        "Configuration summary"
    );

    let checkpoints = config.checkpoint.file.as_ref().map(CheckpointManager::new);
    let start = match &checkpoints {
        Some(manager) if !args.from_current => manager.load().await?.unwrap_or_default(),
        _ => Checkpoint::default(),
    };

    let mut source: PgLogicalSource<TypeCatalog, RawDecoder> =
        PgLogicalSource::new(config.source.clone())?;

    source
        .setup(|client| Ok((TypeCatalog::new(client), RawDecoder::new())))
        .await
        .context("setup failed")?;

    let mut changes = match source.capture(start).await {
        Ok(changes) => changes,
        Err(e) => {
            source.stop().await.ok();
            return Err(e).context("failed to start capture");
        }
    };
    if let Some(session) = source.session() {
        info!(
            slot = %session.slot,
            start_lsn = %session.start_lsn,
            timeline = session.system.timeline,
            "Capture started"
        );
    }

    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for shutdown signal: {}", e);
            std::future::pending::<()>().await;
        }
        info!("Received shutdown signal");
    };
    let save_interval = Duration::from_secs(config.checkpoint.save_interval_secs.max(1));
    let forwarded = forward(
        &mut changes,
        &source.tracker(),
        shutdown,
        &mut std::io::stdout(),
        checkpoints.as_ref(),
        save_interval,
    )
    .await;

    let result = source.stop().await;
    let committed = forwarded.context("failed to write change")?;
    save_checkpoint(checkpoints.as_ref(), committed, &mut None).await;

    match result {
        Ok(()) => {
            info!("pglogical-capture stopped");
            Ok(())
        }
        Err(e) => {
            error!("Capture failed: {}", e);
            Err(e.into())
        }
    }
}

/// Writes each change as a JSON line and commits it once written, until the
/// stream closes or `shutdown` resolves. Returns the last committed
/// checkpoint.
async fn forward<W: Write>(
    changes: &mut mpsc::Receiver<Change<RawMessage>>,
    tracker: &CheckpointTracker,
    shutdown: impl Future<Output = ()>,
    out: &mut W,
    checkpoints: Option<&CheckpointManager>,
    save_interval: Duration,
) -> anyhow::Result<Option<Checkpoint>> {
    tokio::pin!(shutdown);
    let mut save_tick = tokio::time::interval(save_interval);
    let mut committed: Option<Checkpoint> = None;
    let mut saved: Option<Checkpoint> = None;

    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            _ = save_tick.tick() => {
                save_checkpoint(checkpoints, committed, &mut saved).await;
            }
            change = changes.recv() => {
                let Some(change) = change else {
                    warn!("Change stream closed");
                    break;
                };
                writeln!(out, "{}", render(&change))?;
                tracker.commit(&change.checkpoint);
                committed = Some(change.checkpoint);
            }
        }
    }
    out.flush()?;
    Ok(committed)
}

fn render(change: &Change<RawMessage>) -> serde_json::Value {
    let message = &change.message;
    serde_json::json!({
        "lsn": change.checkpoint.lsn().to_string(),
        "commit_time": change.checkpoint.time.to_rfc3339(),
        "tag": (message.tag as char).to_string(),
        "relation": message
            .relation
            .as_ref()
            .map(|r| format!("{}.{}", r.schema, r.table)),
        "payload": BASE64.encode(&message.payload),
    })
}

async fn save_checkpoint(
    manager: Option<&CheckpointManager>,
    committed: Option<Checkpoint>,
    saved: &mut Option<Checkpoint>,
) {
    let (Some(manager), Some(checkpoint)) = (manager, committed) else {
        return;
    };
    if *saved == Some(checkpoint) {
        return;
    }
    match manager.save(&checkpoint).await {
        Ok(()) => *saved = Some(checkpoint),
        Err(e) => error!("Failed to save checkpoint: {}", e),
    }
}

fn init_logging(json: bool, verbose: bool) {
    let env_filter = if verbose {
        EnvFilter::new("pglogical_capture=debug,info")
    } else {
        EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("pglogical_capture=info,warn"))
    };

    let fmt_layer = if json {
        tracing_subscriber::fmt::layer()
            .json()
            .flatten_event(true)
            .with_current_span(false)
            .with_span_list(false)
            .with_writer(std::io::stderr)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer()
            .with_target(false)
            .with_thread_ids(false)
            .with_thread_names(false)
            .with_writer(std::io::stderr)
            .boxed()
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .init();
}
