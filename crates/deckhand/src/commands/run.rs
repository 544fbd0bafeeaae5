//! Run command - the long-running agent.

use std::sync::Arc;

use anyhow::{Context as _, Result};
use clap::Args;
use deckhand_agent::{
    FileResultStore, JobPipeline, ManifestLoader, PipelineSettings, Poller, SignatureVerifier,
    SpoolQueue,
};
use deckhand_config::resolve_signing_key;
use tokio_util::sync::CancellationToken;

use super::Context;

/// Arguments for the run command.
///
/// CLI arguments override config file values.
#[derive(Args, Debug)]
pub struct RunArgs {
    /// Agent identity (overrides config and DECKHAND_AGENT_ID)
    #[arg(long)]
    pub agent_id: Option<String>,
}

pub async fn run(args: RunArgs, ctx: &Context) -> Result<()> {
    let mut config = ctx.config.clone();
    if let Some(id) = args.agent_id {
        config.agent.id = id;
    }

    let (key, key_source) =
        resolve_signing_key(&config.security).context("the agent cannot start without a signing key")?;
    let verifier = SignatureVerifier::new(key).with_max_age(config.security.max_envelope_age());

    let loader = Arc::new(ManifestLoader::new(&config.paths.installers));
    let pipeline = Arc::new(JobPipeline::new(
        PipelineSettings::from_config(&config),
        verifier,
        loader,
    ));
    let store = Arc::new(FileResultStore::new(&config.paths.results));
    let queue = SpoolQueue::new(
        &config.paths.spool,
        &config.agent.id,
        config.queue.poll_interval(),
    );

    tracing::info!(
        agent_id = %config.agent.id,
        config = ?ctx.config_source,
        signing_key = %key_source,
        installers = %config.paths.installers.display(),
        spool = %queue.dir().display(),
        results = %store.dir().display(),
        host = ?pipeline.host().map(|h| h.id.as_str()),
        "Agent starting"
    );

    let cancel = CancellationToken::new();
    let poller = Poller::new(config.agent.id.clone(), queue, pipeline, store)
        .with_retry_interval(config.queue.poll_interval());
    let mut handle = tokio::spawn(poller.run(cancel.clone()));

    let stats = tokio::select! {
        joined = &mut handle => joined.context("agent loop panicked")?,
        () = shutdown_signal() => {
            tracing::info!("Shutdown requested, waiting for the current job to stop");
            cancel.cancel();
            handle.await.context("agent loop panicked")?
        }
    };

    tracing::info!(
        processed = stats.processed,
        succeeded = stats.succeeded,
        failed = stats.failed,
        duplicates = stats.duplicates,
        malformed = stats.malformed,
        "Agent stopped"
    );
    Ok(())
}

/// Resolves on ctrl-c or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %e, "Cannot listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "Cannot listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
}
