use anyhow::{anyhow, bail, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use patchflow::config::{Config, VerificationConfig};
use patchflow::credentials::{self, CredentialKind, Credentials};
use patchflow::github::{get_remote_info, GitHubClient, RepoTarget};
use patchflow::guard::{validate_phase, ValidationPhase};
use patchflow::jobs::{AgentMode, JobRegistry, JobStatus};
use patchflow::llm::client::create_http_client;
use patchflow::llm::{GeminiGenerator, OllamaGenerator, OpenAiGenerator, Provider};
use patchflow::orchestrator::{JobRequest, Orchestrator, OrchestratorSettings};
use patchflow::server;
use patchflow::trace::ExecutionTrace;
use patchflow::verify::{
    CheckBackend, LocalBackend, PreflightBackend, SandboxBackend, VerifyRunner,
};
use serde_json::json;
use std::io::{self, BufRead};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(
    name = "patchflow",
    about = "Turn a change request into a verified pull request",
    version
)]
struct Cli {
    /// Config file (defaults to the user config directory)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Local checkout whose `origin` remote names the target repository
    #[arg(long, global = true)]
    repo_path: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the HTTP job API
    Serve(ServeArgs),
    /// Run one instruction to completion and print the job
    Run(RunArgs),
    /// Check a patch payload file against the guard
    Validate(ValidateArgs),
    /// Store a secret in the system keychain (read from stdin)
    SetCredential(SetCredentialArgs),
}

#[derive(Args, Debug)]
struct ServeArgs {
    #[arg(long)]
    bind: Option<String>,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum ModeArg {
    Solo,
    Multi,
}

impl From<ModeArg> for AgentMode {
    fn from(mode: ModeArg) -> Self {
        match mode {
            ModeArg::Solo => AgentMode::Solo,
            ModeArg::Multi => AgentMode::Multi,
        }
    }
}

#[derive(Args, Debug)]
struct RunArgs {
    instruction: String,
    #[arg(long, value_enum)]
    mode: Option<ModeArg>,
    #[arg(long)]
    provider: Option<String>,
    /// Retrieval context passed to the model as-is
    #[arg(long, conflicts_with = "context_file")]
    context: Option<String>,
    #[arg(long)]
    context_file: Option<PathBuf>,
}

#[derive(Args, Debug)]
struct ValidateArgs {
    /// JSON file shaped like `{"files": [{"path", "content"}]}`
    file: PathBuf,
}

#[derive(Args, Debug)]
struct SetCredentialArgs {
    /// gemini, openai or github
    kind: CredentialKind,
}

fn init_tracing() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("patchflow=info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing();

    match cli.command {
        Commands::Validate(args) => {
            let config = Config::load(cli.config.as_deref())?;
            run_validate(&config, &args.file)
        }
        Commands::SetCredential(args) => run_set_credential(args.kind),
        Commands::Serve(args) => {
            let config = Config::load(cli.config.as_deref())?;
            let bind = args.bind.unwrap_or_else(|| config.server.bind.clone());
            let orchestrator =
                build_orchestrator(&config, &Credentials::resolve(), cli.repo_path.as_deref())?;
            server::serve(&bind, Arc::new(orchestrator)).await
        }
        Commands::Run(args) => {
            let config = Config::load(cli.config.as_deref())?;
            let orchestrator =
                build_orchestrator(&config, &Credentials::resolve(), cli.repo_path.as_deref())?;
            run_once(&orchestrator, args).await
        }
    }
}

fn run_validate(config: &Config, file: &Path) -> Result<()> {
    let raw = std::fs::read_to_string(file)
        .with_context(|| format!("Failed to read {}", file.display()))?;
    let payload: serde_json::Value = serde_json::from_str(&raw)
        .with_context(|| format!("{} is not valid JSON", file.display()))?;

    match validate_phase(&payload, &config.limits, ValidationPhase::Request) {
        Ok(patch) => {
            println!("{}", serde_json::to_string_pretty(&patch)?);
            Ok(())
        }
        Err(err) => {
            let report = json!({
                "code": err.code.as_str(),
                "message": err.message,
                "details": err.details,
            });
            println!("{}", serde_json::to_string_pretty(&report)?);
            Err(anyhow!("{}", err.code))
        }
    }
}

fn run_set_credential(kind: CredentialKind) -> Result<()> {
    eprintln!("Paste the {} secret and press Enter:", kind);
    let mut line = String::new();
    io::stdin()
        .lock()
        .read_line(&mut line)
        .context("Failed to read secret from stdin")?;
    let secret = line.trim();
    if secret.is_empty() {
        bail!("no secret given");
    }
    credentials::store(kind, secret).map_err(|e| anyhow!("Failed to save {}: {}", kind, e))?;
    eprintln!(
        "Saved {} to the system keychain ({} still takes precedence when set).",
        kind,
        kind.env_var()
    );
    Ok(())
}

async fn run_once(orchestrator: &Orchestrator, args: RunArgs) -> Result<()> {
    let context = match &args.context_file {
        Some(path) => Some(
            std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read {}", path.display()))?,
        ),
        None => args.context,
    };
    let request = JobRequest {
        instruction: args.instruction,
        mode: args.mode.map(AgentMode::from),
        provider: args.provider,
        context,
    };

    let trace = ExecutionTrace::new();
    let job = orchestrator
        .execute(request, &trace)
        .await
        .map_err(|err| anyhow!("{}: {}", err.code(), err))?;

    let report = json!({ "job": job, "trace": trace.all() });
    println!("{}", serde_json::to_string_pretty(&report)?);

    if job.status == JobStatus::Failed {
        let code = job.error.as_ref().map(|e| e.code.as_str()).unwrap_or("INTERNAL");
        bail!("job {} failed with {}", job.job_id, code);
    }
    Ok(())
}

fn resolve_target(config: &Config, repo_path: Option<&Path>) -> Result<Option<RepoTarget>> {
    if let Some(target) = config.repository.target.as_deref() {
        return RepoTarget::parse(target)
            .map(Some)
            .ok_or_else(|| anyhow!("Invalid repository target: {} (expected owner/repo)", target));
    }
    match repo_path.or(config.repository.path.as_deref()) {
        Some(path) => get_remote_info(path).map(Some),
        None => Ok(None),
    }
}

/// Preflight endpoint first, then a local checkout, then the sandbox.
fn check_backend(verification: &VerificationConfig) -> Result<Arc<dyn CheckBackend>> {
    let secs = verification.timeout_secs.max(1);
    let timeout = Duration::from_secs(secs);
    if let Some(url) = &verification.preflight_url {
        let http = create_http_client(secs)?;
        return Ok(Arc::new(PreflightBackend::new(http, url.clone(), timeout)));
    }
    if let Some(root) = &verification.local_root {
        return Ok(Arc::new(LocalBackend::new(root.clone(), timeout)));
    }
    Ok(Arc::new(SandboxBackend))
}

fn build_orchestrator(
    config: &Config,
    credentials: &Credentials,
    repo_path: Option<&Path>,
) -> Result<Orchestrator> {
    let generation = &config.generation;
    let model_http = create_http_client(generation.timeout_secs.max(1))?;

    let backend = check_backend(&config.verification)?;
    if backend.name() == "sandbox" {
        tracing::warn!("no preflight endpoint or local checkout configured; only `build` can pass");
    }

    let settings = OrchestratorSettings {
        limits: config.limits.clone(),
        commands: config.verification.commands.clone(),
        repair: config.verification.repair,
        branch_prefix: config.repository.branch_prefix.clone(),
        commit_mode: config.repository.commit_mode,
        repo_timeout: Duration::from_secs(config.repository.timeout_secs.max(1)),
        retry: generation.retry_policy(),
        delete_branch_on_failure: config.repository.delete_branch_on_failure,
    };

    let mut orchestrator = Orchestrator::new(
        Arc::new(JobRegistry::new(config.server.job_retention)),
        VerifyRunner::new(backend, config.verification.max_retries),
        settings,
    )
    .with_default_provider(generation.default_provider);

    if let Some(key) = credentials.api_key(Provider::Gemini) {
        orchestrator = orchestrator.with_generator(Arc::new(
            GeminiGenerator::new(model_http.clone(), key, &generation.gemini_model)
                .with_base_url(&generation.gemini_base_url),
        ));
    }
    if let Some(key) = credentials.api_key(Provider::OpenAi) {
        orchestrator = orchestrator.with_generator(Arc::new(
            OpenAiGenerator::new(model_http.clone(), key, &generation.openai_model)
                .with_base_url(&generation.openai_base_url),
        ));
    }
    orchestrator = orchestrator.with_generator(Arc::new(OllamaGenerator::new(
        model_http,
        &generation.ollama_host,
        &generation.ollama_model,
    )));

    match (resolve_target(config, repo_path)?, credentials.github_token.as_deref()) {
        (Some(target), Some(token)) => {
            let repo_http = create_http_client(config.repository.timeout_secs.max(1))?;
            tracing::info!(%target, "publishing pull requests");
            let client =
                GitHubClient::new(repo_http, target, token, &config.repository.api_base_url)?;
            orchestrator = orchestrator.with_repo_host(Arc::new(client));
        }
        (None, _) => tracing::warn!("no target repository configured; jobs will be rejected"),
        (Some(_), None) => tracing::warn!("GITHUB_TOKEN is not set; jobs will be rejected"),
    }

    Ok(orchestrator)
}
