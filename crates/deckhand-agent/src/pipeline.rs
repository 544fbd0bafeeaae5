//! Per-envelope pipeline.
//!
//! [`JobPipeline::admit`] runs every check that happens before a process is
//! started; [`JobPipeline::execute`] runs the installer under the retry
//! controller. [`JobPipeline::process`] does both.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use deckhand_config::AgentConfig;
use deckhand_sandbox::{
    ChildEnv, EngineConfig, ExecSpec, ExecutionEngine, ExitKind, JobLog, RunOutcome, SandboxError,
};
use deckhand_types::{Contract, ExecutionResult, JobEnvelope, JobId};
use tokio_util::sync::CancellationToken;

use crate::contract::ContractLoader;
use crate::path_guard::{PathGuard, SafeScript};
use crate::platform::HostPlatform;
use crate::retry::{AttemptRunner, RetryController, RetryOutcome, RetryPolicy};
use crate::signature::SignatureVerifier;
use crate::validator::{InputValidator, ResolvedInputs};
use crate::{PipelineError, Result};

/// Tracing target for authentication and path-safety events.
pub const SECURITY_TARGET: &str = "deckhand::security";

// ─────────────────────────────────────────────────────────────────────────────
// Settings
// ─────────────────────────────────────────────────────────────────────────────

/// Everything the pipeline needs from the agent configuration.
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub installers: PathBuf,
    pub logs: PathBuf,
    pub interpreter: PathBuf,
    pub script_extension: String,
    pub env_allowlist: Vec<String>,
    pub max_output_bytes: usize,
    pub termination_grace: Duration,
    pub enforce_os_requirements: bool,
    pub retry: RetryPolicy,
}

impl PipelineSettings {
    pub fn from_config(config: &AgentConfig) -> Self {
        Self {
            installers: config.paths.installers.clone(),
            logs: config.paths.logs.clone(),
            interpreter: config.execution.interpreter.clone(),
            script_extension: config.execution.script_extension.clone(),
            env_allowlist: config.execution.env_allowlist.clone(),
            max_output_bytes: config.execution.max_output_bytes,
            termination_grace: config.execution.termination_grace(),
            enforce_os_requirements: config.execution.enforce_os_requirements,
            retry: RetryPolicy::from_config(&config.retry),
        }
    }
}

/// An envelope that passed every pre-execution check.
#[derive(Debug, Clone)]
pub struct AdmittedJob {
    pub job_id: JobId,
    pub app_id: String,
    pub contract: Contract,
    pub inputs: ResolvedInputs,
    pub script: SafeScript,
    pub admitted_at: DateTime<Utc>,
}

// ─────────────────────────────────────────────────────────────────────────────
// Pipeline
// ─────────────────────────────────────────────────────────────────────────────

/// Authenticates, validates, and runs jobs.
pub struct JobPipeline {
    settings: PipelineSettings,
    verifier: SignatureVerifier,
    loader: Arc<dyn ContractLoader>,
    guard: PathGuard,
    host: Option<HostPlatform>,
    engine: ExecutionEngine,
    retry: RetryController,
}

impl std::fmt::Debug for JobPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobPipeline")
            .field("settings", &self.settings)
            .field("host", &self.host)
            .finish_non_exhaustive()
    }
}

impl JobPipeline {
    /// Build a pipeline; the host platform is detected once here.
    pub fn new(
        settings: PipelineSettings,
        verifier: SignatureVerifier,
        loader: Arc<dyn ContractLoader>,
    ) -> Self {
        let host = if settings.enforce_os_requirements {
            let host = HostPlatform::detect();
            if host.is_none() {
                tracing::warn!("Could not read os-release, OS requirements will not be checked");
            }
            host
        } else {
            None
        };

        let guard = PathGuard::new(&settings.installers, &settings.script_extension);
        let engine = ExecutionEngine::new(EngineConfig::default().with_grace(settings.termination_grace));
        let retry = RetryController::new(settings.retry.clone());

        Self {
            settings,
            verifier,
            loader,
            guard,
            host,
            engine,
            retry,
        }
    }

    /// Replace the detected host platform.
    pub fn with_host(mut self, host: Option<HostPlatform>) -> Self {
        self.host = host;
        self
    }

    /// Replace the engine settings (termination grace, output drain).
    pub fn with_engine(mut self, config: EngineConfig) -> Self {
        self.engine = ExecutionEngine::new(config);
        self
    }

    pub fn settings(&self) -> &PipelineSettings {
        &self.settings
    }

    pub fn host(&self) -> Option<&HostPlatform> {
        self.host.as_ref()
    }

    pub fn path_guard(&self) -> &PathGuard {
        &self.guard
    }

    /// Run every pre-execution check, in order: signature, contract, inputs,
    /// path safety, platform.
    pub async fn admit(&self, envelope: &JobEnvelope) -> Result<AdmittedJob> {
        let body = envelope.body();

        if let Err(e) = self.verifier.verify(envelope) {
            tracing::warn!(
                target: SECURITY_TARGET,
                job_id = %body.job_id,
                app_id = %body.app_id,
                server_id = %body.server_id,
                user_id = %body.user_id,
                error = %e,
                "Envelope failed authentication"
            );
            return Err(e.into());
        }

        if let Err(e) = PathGuard::check_segment("app_id", &body.app_id) {
            tracing::warn!(
                target: SECURITY_TARGET,
                job_id = %body.job_id,
                user_id = %body.user_id,
                error = %e,
                "Authenticated envelope names an unsafe application id"
            );
            return Err(e.into());
        }

        let contract = self.loader.load_contract(&body.app_id).await?;
        let inputs = InputValidator::new(&contract).validate(&body.inputs)?;

        let script = match self.guard.resolve(&body.app_id, &contract.install_script) {
            Ok(script) => script,
            Err(e) => {
                tracing::warn!(
                    target: SECURITY_TARGET,
                    job_id = %body.job_id,
                    app_id = %body.app_id,
                    error = %e,
                    "Installer path rejected"
                );
                return Err(e.into());
            }
        };

        if self.settings.enforce_os_requirements
            && let Some(host) = &self.host
        {
            host.check(&contract.os_requirements)?;
        }

        tracing::info!(
            job_id = %body.job_id,
            app_id = %body.app_id,
            inputs = ?inputs.names(),
            "Job admitted"
        );
        Ok(AdmittedJob {
            job_id: body.job_id.clone(),
            app_id: body.app_id.clone(),
            contract,
            inputs,
            script,
            admitted_at: Utc::now(),
        })
    }

    /// Result for an envelope that failed admission.
    pub fn reject(
        &self,
        job_id: JobId,
        error: PipelineError,
        started_at: DateTime<Utc>,
    ) -> ExecutionResult {
        let kind = error.kind();
        if !kind.is_security_relevant() {
            tracing::info!(job_id = %job_id, kind = kind.label(), error = %error, "Job rejected");
        }
        error.into_result(job_id, started_at)
    }

    /// Run an admitted job to its final result.
    pub async fn execute(&self, job: AdmittedJob, cancel: &CancellationToken) -> ExecutionResult {
        let log = match JobLog::open(&self.settings.logs, &job.job_id, self.settings.max_output_bytes) {
            Ok(log) => log,
            Err(e) => {
                tracing::error!(job_id = %job.job_id, error = %e, "Cannot open job log");
                return PipelineError::Internal(e.to_string()).into_result(job.job_id, job.admitted_at);
            }
        };

        let mut env = ChildEnv::builder(&self.settings.env_allowlist).job(&job.job_id, 1);
        for input in job.inputs.iter() {
            env = env.input(&input.name, input.value.clone(), input.sensitive);
        }
        let spec = ExecSpec::new(&self.settings.interpreter, &job.script.dir, env.build())
            .arg(job.script.path.display().to_string())
            .with_timeout(job.contract.timeout);

        let runner = EngineAttempt {
            engine: &self.engine,
            spec,
            log: &log,
            max_attempts: self.retry.policy().max_attempts,
        };

        let result = match self.retry.run(&runner, job.contract.idempotent, cancel).await {
            Ok(outcome) => self.finish(&job, &log, outcome),
            Err(e) => {
                tracing::error!(job_id = %job.job_id, error = %e, "Installer could not be run");
                let mut result =
                    PipelineError::Internal(e.to_string()).into_result(job.job_id.clone(), job.admitted_at);
                result.output = log.output();
                result
            }
        };

        tracing::info!(
            job_id = %result.job_id,
            app_id = %job.app_id,
            status = %result.status,
            exit_code = result.exit_code,
            attempts = result.attempts,
            "Job finished"
        );
        result
    }

    fn finish(&self, job: &AdmittedJob, log: &JobLog, outcome: RetryOutcome) -> ExecutionResult {
        if outcome.abandoned {
            log.note("retries abandoned: agent shutting down");
        }
        let error = outcome
            .outcome
            .error(job.contract.timeout)
            .map(|e| format!("{}: {e}", e.kind().label()));

        ExecutionResult {
            job_id: job.job_id.clone(),
            status: outcome.outcome.status,
            failure: outcome.outcome.failure,
            exit_code: outcome.outcome.exit_code(),
            output: log.output(),
            started_at: outcome.started_at,
            completed_at: outcome.completed_at,
            attempts: outcome.attempts,
            error,
        }
    }

    /// Admit and execute one envelope.
    pub async fn process(&self, envelope: &JobEnvelope, cancel: &CancellationToken) -> ExecutionResult {
        let started_at = Utc::now();
        match self.admit(envelope).await {
            Ok(job) => self.execute(job, cancel).await,
            Err(e) => self.reject(envelope.job_id().clone(), e, started_at),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Engine Attempts
// ─────────────────────────────────────────────────────────────────────────────

struct EngineAttempt<'a> {
    engine: &'a ExecutionEngine,
    spec: ExecSpec,
    log: &'a JobLog,
    max_attempts: u32,
}

fn describe(exit: ExitKind) -> String {
    match exit {
        ExitKind::Exited(code) => format!("exit code {code}"),
        ExitKind::Signaled(signal) => format!("killed by signal {signal}"),
        ExitKind::TimedOut => "timed out".to_string(),
        ExitKind::Cancelled => "cancelled".to_string(),
    }
}

#[async_trait]
impl<'a> AttemptRunner for EngineAttempt<'a> {
    async fn run_attempt(
        &self,
        attempt: u32,
        cancel: &CancellationToken,
    ) -> std::result::Result<RunOutcome, SandboxError> {
        self.log.section(&format!(
            "attempt {attempt} of {} started {}",
            self.max_attempts,
            Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
        ));

        let spec = ExecSpec {
            env: self.spec.env.for_attempt(attempt),
            ..self.spec.clone()
        };
        let outcome = self.engine.run(&spec, self.log, cancel).await?;

        self.log.note(&format!(
            "attempt {attempt} finished: {} after {:.1}s",
            describe(outcome.exit),
            outcome.elapsed.as_secs_f64()
        ));
        Ok(outcome)
    }
}
