//! Job orchestrator
//!
//! Sequences one instruction through the five pipeline stages:
//!
//! ```text
//! analyze -> generate -> validate -> verify (+ repair) -> commit + PR
//! ```
//!
//! Request problems (empty instruction, unknown provider, missing
//! credentials) are rejected before a job exists. Everything after that is
//! recorded on the job: the active step turns `error`, the job turns
//! `failed`, and nothing further runs. Branches and commits that already
//! reached the host are left in place unless `delete_branch_on_failure` is
//! set.

use crate::github::{
    branch_name, CommitRequest, PullRequest, PullRequestInput, RepoError, RepoHost, UpsertFile,
};
use crate::guard::{validate_phase, GuardError, PatchSet, ValidationLimits, ValidationPhase};
use crate::jobs::{AgentJob, AgentMode, JobError, JobRegistry, Stage, StepStatus, EXECUTION_PLAN};
use crate::llm::{
    extract_json_payload, with_retry, GenerationError, Provider, RetryPolicy, TextGenerator,
    UnknownProvider,
};
use crate::prompt::{build_execution_prompt, build_repair_prompt, system_instruction};
use crate::trace::{ExecutionTrace, TraceStatus};
use crate::util::truncate;
use crate::verify::{
    default_commands, RepairRequest, VerifyCommand, VerifyError, VerifyOutcome, VerifyRunner,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

const DEFAULT_REPO_TIMEOUT_SECS: u64 = 60;
const PR_TITLE_MAX_CHARS: usize = 72;
const FAILURE_CONTEXT_MAX_CHARS: usize = 500;

/// How verified files reach the branch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CommitMode {
    /// One contents-API write per file, in patch order
    #[default]
    PerFile,
    /// A single tree + commit
    Atomic,
}

/// Inbound request body.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobRequest {
    #[serde(default)]
    pub instruction: String,
    #[serde(default)]
    pub mode: Option<AgentMode>,
    #[serde(default)]
    pub provider: Option<String>,
    /// Pre-computed retrieval context folded into the prompt
    #[serde(default)]
    pub context: Option<String>,
}

impl JobRequest {
    pub fn new(instruction: impl Into<String>) -> Self {
        Self {
            instruction: instruction.into(),
            ..Self::default()
        }
    }
}

/// Rejections that happen before a job is created.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RequestError {
    #[error("instruction is required")]
    InstructionRequired,
    #[error(transparent)]
    UnknownProvider(#[from] UnknownProvider),
    #[error("{0}")]
    ConfigMissing(String),
}

impl RequestError {
    pub fn code(&self) -> &'static str {
        match self {
            RequestError::InstructionRequired => "INSTRUCTION_REQUIRED",
            RequestError::UnknownProvider(_) => "UNKNOWN_PROVIDER",
            RequestError::ConfigMissing(_) => "CONFIG_MISSING",
        }
    }

    /// HTTP status for the request envelope
    pub fn status(&self) -> u16 {
        match self {
            RequestError::InstructionRequired | RequestError::UnknownProvider(_) => 400,
            RequestError::ConfigMissing(_) => 412,
        }
    }
}

#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub limits: ValidationLimits,
    pub commands: Vec<VerifyCommand>,
    /// Feed verification failures back to the generator
    pub repair: bool,
    pub branch_prefix: String,
    pub commit_mode: CommitMode,
    /// Applied to each repository call
    pub repo_timeout: Duration,
    pub retry: RetryPolicy,
    pub delete_branch_on_failure: bool,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            limits: ValidationLimits::default(),
            commands: default_commands(),
            repair: true,
            branch_prefix: crate::github::DEFAULT_BRANCH_PREFIX.to_string(),
            commit_mode: CommitMode::default(),
            repo_timeout: Duration::from_secs(DEFAULT_REPO_TIMEOUT_SECS),
            retry: RetryPolicy::default(),
            delete_branch_on_failure: false,
        }
    }
}

/// Everything a run needs, resolved at submit time.
struct JobPlan {
    instruction: String,
    mode: AgentMode,
    provider: Provider,
    context: Option<String>,
    generator: Arc<dyn TextGenerator>,
    repo: Arc<dyn RepoHost>,
}

pub struct Orchestrator {
    registry: Arc<JobRegistry>,
    generators: HashMap<Provider, Arc<dyn TextGenerator>>,
    default_provider: Provider,
    verifier: VerifyRunner,
    repo: Option<Arc<dyn RepoHost>>,
    settings: OrchestratorSettings,
}

impl Orchestrator {
    pub fn new(
        registry: Arc<JobRegistry>,
        verifier: VerifyRunner,
        settings: OrchestratorSettings,
    ) -> Self {
        Self {
            registry,
            generators: HashMap::new(),
            default_provider: Provider::Gemini,
            verifier,
            repo: None,
            settings,
        }
    }

    /// Register a backend under its own provider.
    pub fn with_generator(mut self, generator: Arc<dyn TextGenerator>) -> Self {
        self.generators.insert(generator.provider(), generator);
        self
    }

    pub fn with_default_provider(mut self, provider: Provider) -> Self {
        self.default_provider = provider;
        self
    }

    pub fn with_repo_host(mut self, repo: Arc<dyn RepoHost>) -> Self {
        self.repo = Some(repo);
        self
    }

    pub fn registry(&self) -> &Arc<JobRegistry> {
        &self.registry
    }

    pub fn default_provider(&self) -> Provider {
        self.default_provider
    }

    pub fn configured_providers(&self) -> Vec<Provider> {
        Provider::ALL
            .into_iter()
            .filter(|p| self.generators.contains_key(p))
            .collect()
    }

    fn prepare(&self, request: JobRequest) -> Result<JobPlan, RequestError> {
        let instruction = request.instruction.trim().to_string();
        if instruction.is_empty() {
            return Err(RequestError::InstructionRequired);
        }

        let provider = match request.provider.as_deref().map(str::trim) {
            Some(name) if !name.is_empty() => name.parse::<Provider>()?,
            _ => self.default_provider,
        };

        let generator = self.generators.get(&provider).cloned().ok_or_else(|| {
            RequestError::ConfigMissing(format!(
                "{} is not configured; provide its API key or pick another provider",
                provider
            ))
        })?;

        let repo = self.repo.clone().ok_or_else(|| {
            RequestError::ConfigMissing(
                "repository host is not configured; set GITHUB_TOKEN and a target repository"
                    .to_string(),
            )
        })?;

        Ok(JobPlan {
            instruction,
            mode: request.mode.unwrap_or_default(),
            provider,
            context: request.context,
            generator,
            repo,
        })
    }

    /// Create a queued job and run it in the background.
    ///
    /// The spawned run is not tied to the caller: dropping the returned
    /// snapshot or the HTTP request never cuts a repository write in half.
    pub fn submit(self: &Arc<Self>, request: JobRequest) -> Result<AgentJob, RequestError> {
        self.submit_with_trace(request, Arc::new(ExecutionTrace::new()))
    }

    pub fn submit_with_trace(
        self: &Arc<Self>,
        request: JobRequest,
        trace: Arc<ExecutionTrace>,
    ) -> Result<AgentJob, RequestError> {
        let plan = self.prepare(request)?;
        let job = self.enqueue(&plan);

        let this = Arc::clone(self);
        let job_id = job.job_id.clone();
        tokio::spawn(async move {
            let worker = {
                let this = Arc::clone(&this);
                let job_id = job_id.clone();
                tokio::spawn(async move { this.run_to_completion(&job_id, plan, &trace).await })
            };
            if let Err(err) = worker.await {
                tracing::error!(job_id = %job_id, error = %err, "job task aborted");
                this.registry.update(&job_id, |job| {
                    job.fail(JobError::new("INTERNAL", format!("job task aborted: {}", err)))
                });
            }
        });

        Ok(job)
    }

    /// Create a job and drive it to a terminal state on the current task.
    pub async fn execute(
        &self,
        request: JobRequest,
        trace: &ExecutionTrace,
    ) -> Result<AgentJob, RequestError> {
        let plan = self.prepare(request)?;
        let job = self.enqueue(&plan);
        let finished = self.run_to_completion(&job.job_id, plan, trace).await;
        Ok(finished.unwrap_or(job))
    }

    fn enqueue(&self, plan: &JobPlan) -> AgentJob {
        let job = AgentJob::new(plan.mode, plan.provider);
        self.registry.insert(job.clone());
        tracing::info!(
            job_id = %job.job_id,
            provider = %plan.provider,
            mode = ?plan.mode,
            "job queued"
        );
        job
    }

    /// Returns the terminal snapshot.
    async fn run_to_completion(
        &self,
        job_id: &str,
        plan: JobPlan,
        trace: &ExecutionTrace,
    ) -> Option<AgentJob> {
        self.registry.update(job_id, |job| job.mark_running());

        let outcome = self.run_pipeline(job_id, &plan, trace).await;

        match outcome {
            Ok(()) => {
                tracing::info!(job_id, status = "completed", "job finished");
                self.registry.update(job_id, |job| job.complete())
            }
            Err(error) => {
                let step = self
                    .registry
                    .get(job_id)
                    .and_then(|job| {
                        job.steps
                            .iter()
                            .position(|s| s.status == StepStatus::Active)
                    })
                    .map(|index| EXECUTION_PLAN[index].phase)
                    .unwrap_or("job");
                trace.push(step, TraceStatus::Error, error.message.clone());
                tracing::warn!(
                    job_id,
                    step,
                    status = "failed",
                    code = %error.code,
                    error = %error.message,
                    "job failed"
                );
                self.registry.update(job_id, |job| job.fail(error))
            }
        }
    }

    fn begin(&self, job_id: &str, stage: Stage, trace: &ExecutionTrace, detail: impl Into<String>) {
        let phase = stage.plan().phase;
        self.registry.update(job_id, |job| job.start_step(stage));
        trace.push(phase, TraceStatus::Start, detail);
        tracing::info!(job_id, step = phase, status = "active", "step started");
    }

    fn finish(&self, job_id: &str, stage: Stage, trace: &ExecutionTrace, detail: impl Into<String>) {
        let phase = stage.plan().phase;
        self.registry.update(job_id, |job| job.complete_step(stage));
        trace.push(phase, TraceStatus::Success, detail);
        tracing::info!(job_id, step = phase, status = "complete", "step finished");
    }

    async fn run_pipeline(
        &self,
        job_id: &str,
        plan: &JobPlan,
        trace: &ExecutionTrace,
    ) -> Result<(), JobError> {
        let generator = plan.generator.as_ref();

        // 1. Analyze
        self.begin(job_id, Stage::Analyze, trace, plan.provider.as_str());
        let system = system_instruction(&self.settings.limits);
        let prompt = build_execution_prompt(&plan.instruction, plan.context.as_deref(), plan.mode);
        let context_note = match plan.context.as_deref().map(str::trim) {
            Some(ctx) if !ctx.is_empty() => format!("{} chars of context", ctx.chars().count()),
            _ => "no retrieval context".to_string(),
        };
        self.finish(job_id, Stage::Analyze, trace, context_note);

        // 2. Generate
        self.begin(job_id, Stage::Generate, trace, format!("provider {}", plan.provider));
        let payload = self
            .generate_payload(generator, &prompt, &system)
            .await
            .map_err(generation_job_error)?;
        self.finish(job_id, Stage::Generate, trace, "model returned a JSON payload");

        // 3. Validate
        self.begin(job_id, Stage::Validate, trace, "patch guard");
        let patch = validate_phase(&payload, &self.settings.limits, ValidationPhase::Response)
            .map_err(guard_job_error)?;
        self.finish(
            job_id,
            Stage::Validate,
            trace,
            format!("{} file(s), {} bytes", patch.files.len(), patch.total_bytes()),
        );

        // 4. Verify (+ repair)
        self.begin(job_id, Stage::Verify, trace, self.verifier.backend_name());
        let outcome = self
            .verify(job_id, generator, &plan.instruction, &system, patch, trace)
            .await
            .map_err(verify_job_error)?;
        self.registry
            .update(job_id, |job| job.verify_attempts = outcome.attempts);
        if !outcome.summary.ok {
            return Err(verification_failed(&outcome));
        }
        self.finish(
            job_id,
            Stage::Verify,
            trace,
            format!("passed after {} attempt(s)", outcome.attempts),
        );

        // 5. Commit + PR
        self.begin(job_id, Stage::Publish, trace, format!("{:?}", self.settings.commit_mode));
        let pr = self
            .publish(job_id, plan.repo.as_ref(), &plan.instruction, &outcome)
            .await?;
        self.finish(job_id, Stage::Publish, trace, pr.url.clone());
        Ok(())
    }

    async fn generate_payload(
        &self,
        generator: &dyn TextGenerator,
        prompt: &str,
        system: &str,
    ) -> Result<Value, GenerationError> {
        let text = with_retry(self.settings.retry, generator.provider(), || {
            generator.generate_text(prompt, system)
        })
        .await?;
        extract_json_payload(&text)
    }

    async fn verify(
        &self,
        job_id: &str,
        generator: &dyn TextGenerator,
        instruction: &str,
        system: &str,
        patch: PatchSet,
        trace: &ExecutionTrace,
    ) -> Result<VerifyOutcome, VerifyError> {
        let commands = &self.settings.commands;
        if !self.settings.repair {
            let summary = self.verifier.run(commands, &patch).await?;
            return Ok(VerifyOutcome {
                summary,
                patch,
                attempts: 1,
                repairs: 0,
            });
        }

        self.verifier
            .run_with_repair_loop(commands, patch, move |request| {
                self.repair(job_id, generator, instruction, system, request, trace)
            })
            .await
    }

    /// Ask for a corrected patch. `None` keeps the previous candidate.
    async fn repair(
        &self,
        job_id: &str,
        generator: &dyn TextGenerator,
        instruction: &str,
        system: &str,
        request: RepairRequest,
        trace: &ExecutionTrace,
    ) -> Option<PatchSet> {
        self.registry
            .update(job_id, |job| job.verify_attempts = request.attempt);
        trace.push(
            "repair",
            TraceStatus::Start,
            format!("attempt {} failed", request.attempt),
        );

        let prompt = build_repair_prompt(instruction, &request.error_context, &request.current);
        let candidate = match self.generate_payload(generator, &prompt, system).await {
            Ok(payload) => {
                validate_phase(&payload, &self.settings.limits, ValidationPhase::Response)
                    .map_err(|err| err.to_string())
            }
            Err(err) => Err(err.to_string()),
        };

        match candidate {
            Ok(patch) => {
                trace.push(
                    "repair",
                    TraceStatus::Success,
                    format!("{} file(s)", patch.files.len()),
                );
                Some(patch)
            }
            Err(message) => {
                tracing::warn!(job_id, attempt = request.attempt, error = %message, "repair produced no usable patch");
                trace.push("repair", TraceStatus::Error, message);
                None
            }
        }
    }

    async fn repo_call<T, F>(&self, call: F) -> Result<T, RepoError>
    where
        F: Future<Output = Result<T, RepoError>>,
    {
        match tokio::time::timeout(self.settings.repo_timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(RepoError::Timeout),
        }
    }

    async fn publish(
        &self,
        job_id: &str,
        repo: &dyn RepoHost,
        instruction: &str,
        outcome: &VerifyOutcome,
    ) -> Result<PullRequest, JobError> {
        let name = branch_name(&self.settings.branch_prefix, Utc::now());
        let created = self
            .repo_call(repo.create_branch_from_default(&name))
            .await
            .map_err(repo_job_error)?;
        tracing::info!(job_id, branch = %created.branch, base_sha = %created.base_sha, "branch created");
        self.registry
            .update(job_id, |job| job.branch = created.branch.clone());

        let result = self
            .write_and_open(job_id, repo, &created.branch, instruction, outcome)
            .await;

        if result.is_err() && self.settings.delete_branch_on_failure {
            match self.repo_call(repo.delete_branch(&created.branch)).await {
                Ok(()) => tracing::info!(job_id, branch = %created.branch, "deleted partially written branch"),
                Err(err) => tracing::warn!(job_id, branch = %created.branch, error = %err, "branch cleanup failed"),
            }
        }

        let pr = result.map_err(repo_job_error)?;
        self.registry.update(job_id, |job| {
            job.pr_url = Some(pr.url.clone());
            job.pr_number = Some(pr.number);
        });
        Ok(pr)
    }

    async fn write_and_open(
        &self,
        job_id: &str,
        repo: &dyn RepoHost,
        branch: &str,
        instruction: &str,
        outcome: &VerifyOutcome,
    ) -> Result<PullRequest, RepoError> {
        let patch = &outcome.patch;
        match self.settings.commit_mode {
            CommitMode::PerFile => {
                for file in &patch.files {
                    let sha = self.repo_call(repo.get_file_sha(&file.path, branch)).await?;
                    let input = UpsertFile {
                        path: file.path.clone(),
                        content: file.content.clone(),
                        branch: branch.to_string(),
                        message: format!("patchflow: update {}", file.path),
                        sha,
                    };
                    self.repo_call(repo.upsert_file(&input)).await?;
                    self.registry
                        .update(job_id, |job| job.changed_files.push(file.path.clone()));
                }
            }
            CommitMode::Atomic => {
                let input = CommitRequest {
                    branch: branch.to_string(),
                    message: format!("patchflow: {}", truncate(instruction, PR_TITLE_MAX_CHARS)),
                    files: patch.files.clone(),
                };
                let sha = self.repo_call(repo.create_commit(&input)).await?;
                tracing::debug!(job_id, commit = %sha, "atomic commit written");
                self.registry
                    .update(job_id, |job| job.changed_files = patch.paths());
            }
        }

        let input = PullRequestInput {
            branch: branch.to_string(),
            title: format!("AI: {}", truncate(instruction, PR_TITLE_MAX_CHARS)),
            body: pull_request_body(instruction, outcome, self.verifier.backend_name()),
        };
        self.repo_call(repo.open_pull_request(&input)).await
    }
}

fn pull_request_body(instruction: &str, outcome: &VerifyOutcome, backend: &str) -> String {
    let files = outcome
        .patch
        .files
        .iter()
        .map(|f| format!("- `{}`", f.path))
        .collect::<Vec<_>>()
        .join("\n");
    let checks = outcome
        .summary
        .results
        .iter()
        .map(|r| format!("- {}: {}", r.command.name, if r.ok { "passed" } else { "failed" }))
        .collect::<Vec<_>>()
        .join("\n");
    format!(
        "Automated change for:\n\n> {}\n\n### Files\n{}\n\n### Checks ({}, {} attempt(s))\n{}\n",
        instruction.trim(),
        files,
        backend,
        outcome.attempts,
        checks
    )
}

// ============================================================================
// Error mapping
// ============================================================================

fn generation_job_error(err: GenerationError) -> JobError {
    JobError::new(err.code(), err.to_string())
}

fn guard_job_error(err: GuardError) -> JobError {
    JobError::new(err.code.as_str(), err.message).with_details(err.details)
}

fn verify_job_error(err: VerifyError) -> JobError {
    JobError::new(err.code(), err.to_string())
}

fn verification_failed(outcome: &VerifyOutcome) -> JobError {
    let context = outcome.summary.failure_context();
    JobError::new(
        "VERIFICATION_FAILED",
        format!(
            "checks still failing after {} attempt(s): {}",
            outcome.attempts,
            truncate(&context, FAILURE_CONTEXT_MAX_CHARS)
        ),
    )
    .with_details(Some(json!({
        "attempts": outcome.attempts,
        "results": outcome.summary.results,
    })))
}

fn repo_job_error(err: RepoError) -> JobError {
    let code = match &err {
        RepoError::Timeout => "GITHUB_TIMEOUT",
        RepoError::Api { status: 409, .. } => "GITHUB_CONFLICT",
        RepoError::Api { status: 401, .. } => "GITHUB_AUTH_INVALID",
        _ => "GITHUB_API_ERROR",
    };
    let details = err.status().map(|status| json!({ "status": status }));
    JobError::new(code, err.to_string()).with_details(details)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::github::BranchRef;
    use crate::guard::FilePatch;
    use crate::jobs::JobStatus;
    use crate::verify::{CheckBackend, SandboxBackend, VerifyResult, VerifySummary};
    use futures::future::BoxFuture;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    // ========================================================================
    // Fakes
    // ========================================================================

    /// Replays scripted responses; the last one repeats.
    struct FakeGenerator {
        provider: Provider,
        script: Mutex<VecDeque<Result<String, GenerationError>>>,
        prompts: Mutex<Vec<String>>,
    }

    impl FakeGenerator {
        fn new(provider: Provider, script: Vec<Result<String, GenerationError>>) -> Arc<Self> {
            Arc::new(Self {
                provider,
                script: Mutex::new(script.into()),
                prompts: Mutex::new(Vec::new()),
            })
        }

        fn returning(paths: &[&str]) -> Arc<Self> {
            Self::new(Provider::Gemini, vec![Ok(patch_text(paths))])
        }

        fn prompts(&self) -> Vec<String> {
            self.prompts.lock().unwrap().clone()
        }
    }

    impl TextGenerator for FakeGenerator {
        fn provider(&self) -> Provider {
            self.provider
        }

        fn generate_text<'a>(
            &'a self,
            prompt: &'a str,
            _system_instruction: &'a str,
        ) -> BoxFuture<'a, Result<String, GenerationError>> {
            self.prompts.lock().unwrap().push(prompt.to_string());
            let mut script = self.script.lock().unwrap();
            let next = if script.len() > 1 {
                script.pop_front()
            } else {
                script.front().cloned()
            };
            let result = next.unwrap_or(Err(GenerationError::Empty {
                provider: self.provider,
            }));
            Box::pin(async move { result })
        }
    }

    fn patch_text(paths: &[&str]) -> String {
        let files: Vec<Value> = paths
            .iter()
            .map(|p| json!({ "path": p, "content": "export const Footer = () => null;\n" }))
            .collect();
        format!(
            "Here is the patch:\n```json\n{}\n```",
            json!({ "files": files })
        )
    }

    #[derive(Default)]
    struct FakeRepo {
        conflict_on_branch: bool,
        fail_upsert_status: Option<u16>,
        calls: Mutex<Vec<String>>,
        pr_inputs: Mutex<Vec<PullRequestInput>>,
    }

    impl FakeRepo {
        fn record(&self, call: String) {
            self.calls.lock().unwrap().push(call);
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    impl RepoHost for FakeRepo {
        fn create_branch_from_default<'a>(
            &'a self,
            name: &'a str,
        ) -> BoxFuture<'a, Result<BranchRef, RepoError>> {
            self.record(format!("branch {}", name));
            let result = if self.conflict_on_branch {
                Err(RepoError::Api {
                    status: 409,
                    message: "Reference already exists".into(),
                })
            } else {
                Ok(BranchRef {
                    branch: name.to_string(),
                    base_sha: "base123".into(),
                })
            };
            Box::pin(async move { result })
        }

        fn get_file_sha<'a>(
            &'a self,
            path: &'a str,
            _branch: &'a str,
        ) -> BoxFuture<'a, Result<Option<String>, RepoError>> {
            self.record(format!("sha {}", path));
            Box::pin(async { Ok(None) })
        }

        fn upsert_file<'a>(
            &'a self,
            input: &'a UpsertFile,
        ) -> BoxFuture<'a, Result<String, RepoError>> {
            self.record(format!("upsert {}", input.path));
            let result = match self.fail_upsert_status {
                Some(status) => Err(RepoError::Api {
                    status,
                    message: "Bad credentials".into(),
                }),
                None => Ok("blob".to_string()),
            };
            Box::pin(async move { result })
        }

        fn create_commit<'a>(
            &'a self,
            input: &'a CommitRequest,
        ) -> BoxFuture<'a, Result<String, RepoError>> {
            self.record(format!("commit {}", input.files.len()));
            Box::pin(async { Ok("commit123".to_string()) })
        }

        fn open_pull_request<'a>(
            &'a self,
            input: &'a PullRequestInput,
        ) -> BoxFuture<'a, Result<PullRequest, RepoError>> {
            self.record(format!("pr {}", input.branch));
            self.pr_inputs.lock().unwrap().push(input.clone());
            Box::pin(async {
                Ok(PullRequest {
                    number: 7,
                    url: "https://github.com/acme/widgets/pull/7".into(),
                })
            })
        }

        fn delete_branch<'a>(&'a self, name: &'a str) -> BoxFuture<'a, Result<(), RepoError>> {
            self.record(format!("delete {}", name));
            Box::pin(async { Ok(()) })
        }
    }

    /// Passes or fails every check according to a script; the last entry repeats.
    struct ScriptedChecks {
        script: Vec<bool>,
        calls: AtomicU32,
    }

    impl ScriptedChecks {
        fn new(script: Vec<bool>) -> Arc<Self> {
            Arc::new(Self {
                script,
                calls: AtomicU32::new(0),
            })
        }
    }

    impl CheckBackend for ScriptedChecks {
        fn name(&self) -> &'static str {
            "scripted"
        }

        fn run<'a>(
            &'a self,
            commands: &'a [VerifyCommand],
            _files: &'a [FilePatch],
        ) -> BoxFuture<'a, Result<VerifySummary, VerifyError>> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) as usize;
            let ok = *self
                .script
                .get(call)
                .or(self.script.last())
                .unwrap_or(&true);
            let results = commands
                .iter()
                .map(|command| VerifyResult {
                    ok,
                    command: command.clone(),
                    output: if ok { "ok".into() } else { "error TS1005".into() },
                })
                .collect();
            Box::pin(async move { Ok(VerifySummary::from_results(results)) })
        }
    }

    fn settings() -> OrchestratorSettings {
        OrchestratorSettings {
            retry: RetryPolicy {
                max_attempts: 2,
                initial_backoff: Duration::from_millis(1),
                attempt_timeout: Duration::from_secs(5),
            },
            ..OrchestratorSettings::default()
        }
    }

    fn orchestrator(
        generator: Arc<FakeGenerator>,
        checks: Arc<dyn CheckBackend>,
        repo: Arc<FakeRepo>,
        settings: OrchestratorSettings,
    ) -> Orchestrator {
        Orchestrator::new(
            Arc::new(JobRegistry::default()),
            VerifyRunner::new(checks, 2),
            settings,
        )
        .with_generator(generator)
        .with_repo_host(repo)
    }

    fn all_steps(job: &AgentJob) -> Vec<StepStatus> {
        job.steps.iter().map(|s| s.status).collect()
    }

    // ========================================================================
    // Pipeline scenarios
    // ========================================================================

    #[tokio::test]
    async fn test_footer_job_completes_with_pull_request() {
        let repo = Arc::new(FakeRepo::default());
        let orch = orchestrator(
            FakeGenerator::returning(&["src/Footer.ts"]),
            ScriptedChecks::new(vec![true]),
            repo.clone(),
            settings(),
        );
        let trace = ExecutionTrace::new();

        let job = orch
            .execute(JobRequest::new("Add a footer component"), &trace)
            .await
            .unwrap();

        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.steps.len(), 5);
        assert!(job.steps.iter().all(|s| s.status == StepStatus::Complete));
        assert!(job.branch.starts_with("ai-"));
        assert_eq!(job.changed_files, vec!["src/Footer.ts".to_string()]);
        assert_eq!(job.pr_url.as_deref(), Some("https://github.com/acme/widgets/pull/7"));
        assert_eq!(job.pr_number, Some(7));
        assert_eq!(job.verify_attempts, 1);
        assert!(job.error.is_none());

        let calls = repo.calls();
        assert!(calls[0].starts_with("branch ai-"));
        assert_eq!(calls[1], "sha src/Footer.ts");
        assert_eq!(calls[2], "upsert src/Footer.ts");
        assert!(calls[3].starts_with("pr ai-"));

        let pr = repo.pr_inputs.lock().unwrap()[0].clone();
        assert_eq!(pr.title, "AI: Add a footer component");
        assert!(pr.body.contains("- `src/Footer.ts`"));

        let entries = trace.all();
        assert_eq!(entries.first().unwrap().step, "analyze");
        assert_eq!(entries.last().unwrap().step, "pr");
        assert_eq!(entries.last().unwrap().status, TraceStatus::Success);

        // Registry holds the same terminal snapshot
        assert_eq!(orch.registry().get(&job.job_id).unwrap(), job);
    }

    #[tokio::test]
    async fn test_branch_conflict_fails_publish_step() {
        let repo = Arc::new(FakeRepo {
            conflict_on_branch: true,
            ..FakeRepo::default()
        });
        let orch = orchestrator(
            FakeGenerator::returning(&["src/Footer.ts"]),
            ScriptedChecks::new(vec![true]),
            repo.clone(),
            settings(),
        );

        let job = orch
            .execute(JobRequest::new("Add a footer component"), &ExecutionTrace::new())
            .await
            .unwrap();

        assert_eq!(job.status, JobStatus::Failed);
        let error = job.error.as_ref().unwrap();
        assert_eq!(error.code, "GITHUB_CONFLICT");
        assert_eq!(error.details, Some(json!({ "status": 409 })));
        assert_eq!(
            all_steps(&job),
            vec![
                StepStatus::Complete,
                StepStatus::Complete,
                StepStatus::Complete,
                StepStatus::Complete,
                StepStatus::Error,
            ]
        );
        assert!(job.branch.is_empty());
        assert!(job.pr_url.is_none());
        assert_eq!(repo.calls().len(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_jobs_stay_independent() {
        let orch = Arc::new(orchestrator(
            FakeGenerator::returning(&["src/Footer.ts"]),
            ScriptedChecks::new(vec![true]),
            Arc::new(FakeRepo::default()),
            settings(),
        ));

        let a = orch.submit(JobRequest::new("Add a footer component")).unwrap();
        let b = orch.submit(JobRequest::new("Add a header component")).unwrap();
        assert_ne!(a.job_id, b.job_id);
        assert_eq!(a.status, JobStatus::Queued);

        let mut done = Vec::new();
        for id in [&a.job_id, &b.job_id] {
            let mut snapshot = None;
            for _ in 0..200 {
                let job = orch.registry().get(id).unwrap();
                if job.status.is_terminal() {
                    snapshot = Some(job);
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            done.push(snapshot.expect("job should finish"));
        }

        for job in &done {
            assert_eq!(job.status, JobStatus::Completed);
            assert_eq!(job.steps.len(), 5);
            assert!(job.steps.iter().all(|s| s.status == StepStatus::Complete));
        }
        assert_ne!(done[0].branch, done[1].branch);
        assert_eq!(orch.registry().len(), 2);
    }

    #[tokio::test]
    async fn test_repair_loop_replaces_patch_before_publishing() {
        let generator = FakeGenerator::new(
            Provider::Gemini,
            vec![
                Ok(patch_text(&["src/Footer.ts"])),
                Ok(patch_text(&["src/Footer.ts", "src/footer.css.ts"])),
            ],
        );
        let orch = orchestrator(
            generator.clone(),
            ScriptedChecks::new(vec![false, true]),
            Arc::new(FakeRepo::default()),
            settings(),
        );
        let trace = ExecutionTrace::new();

        let job = orch
            .execute(JobRequest::new("Add a footer component"), &trace)
            .await
            .unwrap();

        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.verify_attempts, 2);
        assert_eq!(
            job.changed_files,
            vec!["src/Footer.ts".to_string(), "src/footer.css.ts".to_string()]
        );
        let prompts = generator.prompts();
        assert_eq!(prompts.len(), 2);
        assert!(prompts[1].contains("Verification Errors:"));
        assert!(trace.all().iter().any(|e| e.step == "repair"));
    }

    #[tokio::test]
    async fn test_exhausted_repairs_fail_verification() {
        let generator = FakeGenerator::returning(&["src/Footer.ts"]);
        let repo = Arc::new(FakeRepo::default());
        let orch = orchestrator(
            generator.clone(),
            ScriptedChecks::new(vec![false]),
            repo.clone(),
            settings(),
        );

        let job = orch
            .execute(JobRequest::new("Add a footer component"), &ExecutionTrace::new())
            .await
            .unwrap();

        assert_eq!(job.status, JobStatus::Failed);
        let error = job.error.as_ref().unwrap();
        assert_eq!(error.code, "VERIFICATION_FAILED");
        assert_eq!(error.details.as_ref().unwrap()["attempts"], 3);
        assert_eq!(job.verify_attempts, 3);
        assert_eq!(job.step(Stage::Verify).status, StepStatus::Error);
        assert_eq!(job.step(Stage::Publish).status, StepStatus::Pending);
        // One generation plus two repairs
        assert_eq!(generator.prompts().len(), 3);
        assert!(repo.calls().is_empty());
    }

    #[tokio::test]
    async fn test_sandbox_fallback_without_repair_fails_on_lint() {
        let orch = orchestrator(
            FakeGenerator::returning(&["src/Footer.ts"]),
            Arc::new(SandboxBackend),
            Arc::new(FakeRepo::default()),
            OrchestratorSettings {
                repair: false,
                ..settings()
            },
        );

        let job = orch
            .execute(JobRequest::new("Add a footer component"), &ExecutionTrace::new())
            .await
            .unwrap();

        let error = job.error.unwrap();
        assert_eq!(error.code, "VERIFICATION_FAILED");
        assert!(error.message.contains("lint: sandbox-runner"));
        assert_eq!(job.verify_attempts, 1);
    }

    #[tokio::test]
    async fn test_guard_failure_records_code_and_details() {
        let orch = orchestrator(
            FakeGenerator::returning(&["../etc/passwd"]),
            ScriptedChecks::new(vec![true]),
            Arc::new(FakeRepo::default()),
            settings(),
        );

        let job = orch
            .execute(JobRequest::new("Add a footer component"), &ExecutionTrace::new())
            .await
            .unwrap();

        let error = job.error.as_ref().unwrap();
        assert_eq!(error.code, "PATH_TRAVERSAL");
        assert!(error.message.starts_with("RESPONSE_VALIDATION_FAILED"));
        assert_eq!(job.step(Stage::Validate).status, StepStatus::Error);
        assert_eq!(job.step(Stage::Generate).status, StepStatus::Complete);

        let orch = orchestrator(
            FakeGenerator::returning(&["lib/Footer.ts"]),
            ScriptedChecks::new(vec![true]),
            Arc::new(FakeRepo::default()),
            settings(),
        );
        let job = orch
            .execute(JobRequest::new("Add a footer component"), &ExecutionTrace::new())
            .await
            .unwrap();
        let error = job.error.unwrap();
        assert_eq!(error.code, "PATH_NOT_ALLOWED");
        assert_eq!(error.details.unwrap()["allowlist"], json!(["src/"]));
    }

    #[tokio::test]
    async fn test_unparseable_output_is_generation_parse_failure() {
        let generator = FakeGenerator::new(Provider::Gemini, vec![Ok("I cannot help with that.".into())]);
        let orch = orchestrator(
            generator,
            ScriptedChecks::new(vec![true]),
            Arc::new(FakeRepo::default()),
            settings(),
        );

        let job = orch
            .execute(JobRequest::new("Add a footer component"), &ExecutionTrace::new())
            .await
            .unwrap();

        assert_eq!(job.error.unwrap().code, "GENERATION_PARSE_FAILED");
        assert_eq!(job.steps[1].status, StepStatus::Error);
        assert_eq!(job.steps[2].status, StepStatus::Pending);
    }

    #[tokio::test]
    async fn test_transient_generation_errors_are_retried() {
        let generator = FakeGenerator::new(
            Provider::Gemini,
            vec![
                Err(GenerationError::Http {
                    provider: Provider::Gemini,
                    status: 503,
                    body: "overloaded".into(),
                }),
                Ok(patch_text(&["src/Footer.ts"])),
            ],
        );
        let orch = orchestrator(
            generator.clone(),
            ScriptedChecks::new(vec![true]),
            Arc::new(FakeRepo::default()),
            settings(),
        );

        let job = orch
            .execute(JobRequest::new("Add a footer component"), &ExecutionTrace::new())
            .await
            .unwrap();

        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(generator.prompts().len(), 2);
    }

    #[tokio::test]
    async fn test_auth_failure_deletes_branch_when_enabled() {
        let repo = Arc::new(FakeRepo {
            fail_upsert_status: Some(401),
            ..FakeRepo::default()
        });
        let orch = orchestrator(
            FakeGenerator::returning(&["src/Footer.ts"]),
            ScriptedChecks::new(vec![true]),
            repo.clone(),
            OrchestratorSettings {
                delete_branch_on_failure: true,
                ..settings()
            },
        );

        let job = orch
            .execute(JobRequest::new("Add a footer component"), &ExecutionTrace::new())
            .await
            .unwrap();

        assert_eq!(job.error.as_ref().unwrap().code, "GITHUB_AUTH_INVALID");
        assert!(job.branch.starts_with("ai-"));
        assert!(job.changed_files.is_empty());
        assert!(repo.calls().last().unwrap().starts_with("delete ai-"));
    }

    #[tokio::test]
    async fn test_atomic_mode_writes_one_commit() {
        let repo = Arc::new(FakeRepo::default());
        let orch = orchestrator(
            FakeGenerator::returning(&["src/Footer.ts", "src/App.ts"]),
            ScriptedChecks::new(vec![true]),
            repo.clone(),
            OrchestratorSettings {
                commit_mode: CommitMode::Atomic,
                ..settings()
            },
        );

        let job = orch
            .execute(JobRequest::new("Add a footer component"), &ExecutionTrace::new())
            .await
            .unwrap();

        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.changed_files.len(), 2);
        let calls = repo.calls();
        assert_eq!(calls.len(), 3);
        assert_eq!(calls[1], "commit 2");
    }

    #[tokio::test]
    async fn test_multi_mode_prompt_carries_plan_and_context() {
        let generator = FakeGenerator::returning(&["src/Footer.ts"]);
        let orch = orchestrator(
            generator.clone(),
            ScriptedChecks::new(vec![true]),
            Arc::new(FakeRepo::default()),
            settings(),
        );
        let request = JobRequest {
            instruction: "Add a footer component".into(),
            mode: Some(AgentMode::Multi),
            provider: Some("gemini".into()),
            context: Some("src/App.ts renders <Layout/>".into()),
        };

        let job = orch.execute(request, &ExecutionTrace::new()).await.unwrap();

        assert_eq!(job.mode, AgentMode::Multi);
        let prompt = &generator.prompts()[0];
        assert!(prompt.contains("Execution Plan"));
        assert!(prompt.contains("src/App.ts renders <Layout/>"));
    }

    // ========================================================================
    // Request validation
    // ========================================================================

    #[tokio::test]
    async fn test_request_errors_create_no_job() {
        let orch = orchestrator(
            FakeGenerator::returning(&["src/Footer.ts"]),
            ScriptedChecks::new(vec![true]),
            Arc::new(FakeRepo::default()),
            settings(),
        );
        let trace = ExecutionTrace::new();

        let err = orch.execute(JobRequest::new("   "), &trace).await.unwrap_err();
        assert_eq!(err, RequestError::InstructionRequired);
        assert_eq!(err.status(), 400);

        let request = JobRequest {
            provider: Some("claude".into()),
            ..JobRequest::new("Add a footer")
        };
        let err = orch.execute(request, &trace).await.unwrap_err();
        assert_eq!(err.code(), "UNKNOWN_PROVIDER");
        assert_eq!(err.status(), 400);

        let request = JobRequest {
            provider: Some("openai".into()),
            ..JobRequest::new("Add a footer")
        };
        let err = orch.execute(request, &trace).await.unwrap_err();
        assert_eq!(err.code(), "CONFIG_MISSING");
        assert_eq!(err.status(), 412);

        assert!(orch.registry().is_empty());
        assert!(trace.all().is_empty());
    }

    #[tokio::test]
    async fn test_missing_repo_host_is_config_error() {
        let orch = Orchestrator::new(
            Arc::new(JobRegistry::default()),
            VerifyRunner::new(Arc::new(SandboxBackend), 0),
            settings(),
        )
        .with_generator(FakeGenerator::returning(&["src/Footer.ts"]));

        let err = orch
            .execute(JobRequest::new("Add a footer"), &ExecutionTrace::new())
            .await
            .unwrap_err();
        assert_eq!(err.code(), "CONFIG_MISSING");
        assert_eq!(orch.configured_providers(), vec![Provider::Gemini]);
    }

    #[test]
    fn test_repo_error_mapping() {
        assert_eq!(repo_job_error(RepoError::Timeout).code, "GITHUB_TIMEOUT");
        let err = repo_job_error(RepoError::Api {
            status: 422,
            message: "Validation Failed".into(),
        });
        assert_eq!(err.code, "GITHUB_API_ERROR");
        assert_eq!(err.details, Some(json!({ "status": 422 })));
        assert_eq!(
            repo_job_error(RepoError::Transport("reset".into())).details,
            None
        );
    }

    #[test]
    fn test_job_request_deserializes_camel_case() {
        let request: JobRequest = serde_json::from_value(json!({
            "instruction": "Add a footer",
            "mode": "MULTI",
            "provider": "ollama"
        }))
        .unwrap();
        assert_eq!(request.mode, Some(AgentMode::Multi));
        assert_eq!(request.provider.as_deref(), Some("ollama"));
        assert!(request.context.is_none());
    }
}
