//! Check command - dry-run admission for one installer.
//!
//! Loads the contract, runs the path guard and platform check, and prints the
//! input fields the installer accepts. Nothing is executed.

use anyhow::{Context as _, Result, bail};
use clap::Args;
use console::style;
use deckhand_agent::{ContractLoader, HostPlatform, ManifestLoader, PathGuard, PlatformError};
use deckhand_types::{Contract, FieldSpec};

use super::Context;

/// Arguments for the check command.
#[derive(Args, Debug)]
pub struct CheckArgs {
    /// Application id (installer directory name)
    pub app_id: String,

    /// Output as JSON (for scripting)
    #[arg(long)]
    pub json: bool,
}

/// Platform check outcome.
enum PlatformStatus {
    Ok(HostPlatform),
    Failed(PlatformError),
    NotEnforced,
    Unknown,
}

pub async fn run(args: CheckArgs, ctx: &Context) -> Result<()> {
    let paths = &ctx.config.paths;
    let execution = &ctx.config.execution;

    PathGuard::check_segment("app_id", &args.app_id)?;
    let loader = ManifestLoader::new(&paths.installers);
    let contract = loader
        .load_contract(&args.app_id)
        .await
        .with_context(|| format!("under {}", paths.installers.display()))?;

    let guard = PathGuard::new(&paths.installers, &execution.script_extension);
    let script = guard.resolve(&args.app_id, &contract.install_script)?;

    let platform = if !execution.enforce_os_requirements {
        PlatformStatus::NotEnforced
    } else {
        match HostPlatform::detect() {
            Some(host) => match host.check(&contract.os_requirements) {
                Ok(()) => PlatformStatus::Ok(host),
                Err(e) => PlatformStatus::Failed(e),
            },
            None => PlatformStatus::Unknown,
        }
    };

    if args.json {
        let output = serde_json::json!({
            "id": contract.id,
            "name": contract.name,
            "version": contract.version,
            "script": script.path,
            "timeout_seconds": contract.timeout.as_secs(),
            "idempotent": contract.idempotent,
            "platform": match &platform {
                PlatformStatus::Ok(_) => "ok".to_string(),
                PlatformStatus::Failed(e) => e.to_string(),
                PlatformStatus::NotEnforced => "not enforced".to_string(),
                PlatformStatus::Unknown => "unknown".to_string(),
            },
            "inputs": contract.inputs.iter().map(|f| serde_json::json!({
                "name": f.name,
                "type": f.kind.name(),
                "required": f.required,
                "default": f.default,
                "sensitive": f.is_sensitive(),
                "env": f.env_name(),
            })).collect::<Vec<_>>(),
        });
        println!("{}", serde_json::to_string_pretty(&output)?);
    } else {
        print_summary(&contract, &script.path.display().to_string(), &platform, ctx.verbose);
    }

    if let PlatformStatus::Failed(e) = platform {
        bail!("{} cannot run on this host: {e}", contract.id);
    }
    Ok(())
}

fn print_summary(contract: &Contract, script: &str, platform: &PlatformStatus, verbose: bool) {
    let dim = console::Style::new().dim();

    println!();
    println!(
        "{} {} ({})",
        style(&contract.id).bold(),
        contract.version,
        contract.name
    );
    println!("{}", dim.apply_to("─".repeat(40)));
    println!("  {} {}", dim.apply_to("Script:    "), script);
    println!("  {} {}s", dim.apply_to("Timeout:   "), contract.timeout.as_secs());
    println!(
        "  {} {}",
        dim.apply_to("Idempotent:"),
        if contract.idempotent { "yes" } else { "no" }
    );
    let platform_line = match platform {
        PlatformStatus::Ok(host) => format!(
            "{} ({} {})",
            style("ok").green(),
            host.id,
            host.version_id.as_deref().unwrap_or("?")
        ),
        PlatformStatus::Failed(e) => style(e.to_string()).red().to_string(),
        PlatformStatus::NotEnforced => "not enforced".to_string(),
        PlatformStatus::Unknown => style("unknown (no os-release)").yellow().to_string(),
    };
    println!("  {} {}", dim.apply_to("Platform:  "), platform_line);

    println!();
    if contract.inputs.is_empty() {
        println!("  {}", dim.apply_to("(no inputs)"));
    }
    for field in &contract.inputs {
        println!("  {}", describe_field(field, verbose));
    }
    println!();
}

fn describe_field(field: &FieldSpec, verbose: bool) -> String {
    let mut notes = Vec::new();
    if field.required && field.default.is_none() {
        notes.push("required".to_string());
    }
    if let Some(default) = &field.default {
        notes.push(format!("default {default}"));
    }
    if field.is_sensitive() {
        notes.push("sensitive".to_string());
    }
    if field.visible_if.is_some() {
        notes.push("conditional".to_string());
    }
    if verbose {
        notes.push(format!("env {}", field.env_name()));
    }

    format!(
        "{:<20} {:<8} {}",
        style(&field.name).cyan(),
        field.kind.name(),
        notes.join(", ")
    )
}
