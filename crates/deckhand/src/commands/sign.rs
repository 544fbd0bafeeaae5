//! Sign command - issue a signed job envelope.
//!
//! Used by operators and tests to hand the agent work: the envelope is either
//! printed as JSON or dropped straight into an agent's spool.

use anyhow::{Context as _, Result};
use chrono::Utc;
use clap::Args;
use deckhand_agent::{SignatureVerifier, SpoolQueue};
use deckhand_config::resolve_signing_key;
use deckhand_types::{EnvelopeBody, JobId};

use super::Context;

/// Arguments for the sign command.
#[derive(Args, Debug)]
pub struct SignArgs {
    /// Application id (installer directory name)
    #[arg(long)]
    pub app: String,

    /// Target server id
    #[arg(long)]
    pub server: String,

    /// Requesting user id
    #[arg(long)]
    pub user: String,

    /// Input value (can be specified multiple times)
    #[arg(long = "input", value_name = "KEY=VALUE", value_parser = parse_input)]
    pub inputs: Vec<(String, String)>,

    /// Job id (default: random UUID)
    #[arg(long)]
    pub job_id: Option<String>,

    /// Write the envelope into the agent's spool instead of printing it
    #[arg(long)]
    pub enqueue: bool,

    /// Spool to write into (default: the configured agent id)
    #[arg(long, requires = "enqueue")]
    pub agent: Option<String>,
}

fn parse_input(raw: &str) -> std::result::Result<(String, String), String> {
    match raw.split_once('=') {
        Some((key, value)) if !key.trim().is_empty() => {
            Ok((key.trim().to_string(), value.to_string()))
        }
        _ => Err(format!("expected KEY=VALUE, got '{raw}'")),
    }
}

pub async fn run(args: SignArgs, ctx: &Context) -> Result<()> {
    let (key, _) = resolve_signing_key(&ctx.config.security)?;

    let job_id = JobId::new(
        args.job_id
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
    )?;
    let body = EnvelopeBody {
        job_id,
        app_id: args.app,
        server_id: args.server,
        user_id: args.user,
        inputs: args.inputs.into_iter().collect(),
        created_at: Utc::now(),
    };
    let envelope = SignatureVerifier::new(key).seal(body)?;

    if args.enqueue {
        let agent = args.agent.as_deref().unwrap_or(&ctx.config.agent.id);
        let path = SpoolQueue::enqueue(&ctx.config.paths.spool, agent, &envelope)
            .with_context(|| format!("cannot enqueue for agent '{agent}'"))?;
        tracing::info!(job_id = %envelope.job_id(), path = %path.display(), "Envelope enqueued");
        println!("{}", path.display());
    } else {
        println!("{}", envelope.to_json()?);
    }
    Ok(())
}
