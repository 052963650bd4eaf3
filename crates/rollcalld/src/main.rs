use anyhow::{Context, Result};
use rollcall_core::{
    CandidateResolver, EncodingStore, SessionDebouncer, Shutdown, TokenVerifier,
};
use rollcall_hw::{FrameSource, JsonLinesSource, SerialTokenReader};
use std::io::BufReader;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

mod config;
mod engine;
mod sink;

use config::Config;
use engine::{collect_stats, spawn_engine, Engine};

/// How long to wait for the engine to release the reader after ctrl-c.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(3);

fn open_frame_source(path: &str) -> Result<Box<dyn FrameSource + Send>> {
    if path == "-" {
        return Ok(Box::new(JsonLinesSource::new(BufReader::new(std::io::stdin()))));
    }
    let file = std::fs::File::open(path)
        .with_context(|| format!("cannot open frame source {path}"))?;
    Ok(Box::new(JsonLinesSource::new(BufReader::new(file))))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    tracing::info!("rollcalld starting");

    let config = Config::load().context("invalid configuration")?;
    let rule = config.match_rule()?;

    // Without reference data there is nothing to verify against.
    let store = EncodingStore::load(&config.encodings_path).with_context(|| {
        format!(
            "cannot load reference encodings from {}",
            config.encodings_path.display()
        )
    })?;

    let shutdown = Shutdown::new();
    let sink = sink::open(&config).context("cannot open attendance sink")?;
    let reader = SerialTokenReader::new(
        config.reader_device.clone(),
        config.reader_baud,
        shutdown.clone(),
    );
    let source = open_frame_source(&config.frame_source)?;

    tracing::info!(
        reader = %config.reader_device,
        frames = %config.frame_source,
        policy = ?config.confirm_policy,
        max_attempts = config.max_attempts,
        "pipeline configured"
    );

    let engine = Engine::new(
        CandidateResolver::new(Arc::new(store), rule),
        SessionDebouncer::new(config.confirm_policy),
        TokenVerifier::new(config.verify_policy(), shutdown.clone()),
        Box::new(reader),
        sink,
        shutdown.clone(),
    );
    let mut done = spawn_engine(engine, source)?;

    tracing::info!("rollcalld ready");

    let finished = tokio::select! {
        finished = &mut done => finished,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("rollcalld shutting down");
            shutdown.trigger();
            match tokio::time::timeout(SHUTDOWN_GRACE, &mut done).await {
                Ok(finished) => finished,
                Err(_) => {
                    tracing::warn!("engine still blocked waiting for a frame; exiting without stats");
                    return Ok(());
                }
            }
        }
    };

    collect_stats(finished)?.log();

    Ok(())
}
