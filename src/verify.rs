//! Verification runner
//!
//! Runs lint/test/build checks against a candidate patch and drives the
//! bounded repair loop. Where the checks run is a [`CheckBackend`]:
//! a remote preflight service, a local scratch checkout, or a sandbox that
//! only reports what it cannot do.

use crate::guard::{FilePatch, PatchSet};
use crate::llm::client::sanitize_api_response;
use crate::util::{resolve_under_root, run_command_with_timeout, tail_chars};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;
use std::time::Duration;

const OUTPUT_TAIL_MAX_CHARS: usize = 8_000;
pub const DEFAULT_MAX_RETRIES: u32 = 2;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerifyCommand {
    /// `lint`, `test`, `build`, or any custom label
    pub name: String,
    pub command: String,
}

impl VerifyCommand {
    pub fn new(name: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            command: command.into(),
        }
    }
}

pub fn default_commands() -> Vec<VerifyCommand> {
    vec![
        VerifyCommand::new("lint", "npm run lint"),
        VerifyCommand::new("test", "npm test"),
        VerifyCommand::new("build", "npm run build"),
    ]
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerifyResult {
    pub ok: bool,
    pub command: VerifyCommand,
    pub output: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerifySummary {
    pub ok: bool,
    pub results: Vec<VerifyResult>,
}

impl VerifySummary {
    pub fn from_results(results: Vec<VerifyResult>) -> Self {
        Self {
            ok: results.iter().all(|r| r.ok),
            results,
        }
    }

    /// One `name: output` line per failing check.
    pub fn failure_context(&self) -> String {
        self.results
            .iter()
            .filter(|r| !r.ok)
            .map(|r| format!("{}: {}", r.command.name, r.output))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum VerifyError {
    #[error("Preflight endpoint failed ({status}): {body}")]
    Preflight { status: u16, body: String },
    #[error("Preflight request failed: {0}")]
    Transport(String),
    #[error("Checks timed out after {secs}s")]
    Timeout { secs: u64 },
    #[error("Could not prepare local checkout: {0}")]
    Io(String),
}

impl VerifyError {
    pub fn code(&self) -> &'static str {
        "PREFLIGHT_FAILED"
    }
}

/// Somewhere checks can run.
pub trait CheckBackend: Send + Sync {
    fn name(&self) -> &'static str;

    fn run<'a>(
        &'a self,
        commands: &'a [VerifyCommand],
        files: &'a [FilePatch],
    ) -> BoxFuture<'a, Result<VerifySummary, VerifyError>>;
}

// ============================================================================
// Backends
// ============================================================================

/// Fallback used when nothing real is configured: `build` passes, everything
/// else reports that it cannot run here.
pub struct SandboxBackend;

impl CheckBackend for SandboxBackend {
    fn name(&self) -> &'static str {
        "sandbox"
    }

    fn run<'a>(
        &'a self,
        commands: &'a [VerifyCommand],
        _files: &'a [FilePatch],
    ) -> BoxFuture<'a, Result<VerifySummary, VerifyError>> {
        let results = commands
            .iter()
            .map(|command| {
                let ok = command.name == "build";
                VerifyResult {
                    ok,
                    command: command.clone(),
                    output: if ok {
                        "sandbox-runner: build passed".to_string()
                    } else {
                        "sandbox-runner: command unavailable in sandbox runtime".to_string()
                    },
                }
            })
            .collect();
        Box::pin(futures::future::ready(Ok(VerifySummary::from_results(results))))
    }
}

#[derive(Serialize)]
struct PreflightRequest<'a> {
    commands: &'a [VerifyCommand],
    files: &'a [FilePatch],
}

/// Remote check service: one POST per attempt, answering with a summary.
pub struct PreflightBackend {
    http: reqwest::Client,
    endpoint: String,
    timeout: Duration,
}

impl PreflightBackend {
    pub fn new(http: reqwest::Client, endpoint: impl Into<String>, timeout: Duration) -> Self {
        Self {
            http,
            endpoint: endpoint.into(),
            timeout,
        }
    }

    async fn call(
        &self,
        commands: &[VerifyCommand],
        files: &[FilePatch],
    ) -> Result<VerifySummary, VerifyError> {
        let request = self
            .http
            .post(&self.endpoint)
            .json(&PreflightRequest { commands, files })
            .send();

        let response = tokio::time::timeout(self.timeout, request)
            .await
            .map_err(|_| VerifyError::Timeout {
                secs: self.timeout.as_secs(),
            })?
            .map_err(|e| VerifyError::Transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(VerifyError::Preflight {
                status: status.as_u16(),
                body: sanitize_api_response(&body),
            });
        }

        response
            .json::<VerifySummary>()
            .await
            .map_err(|e| VerifyError::Transport(format!("invalid preflight response: {}", e)))
    }
}

impl CheckBackend for PreflightBackend {
    fn name(&self) -> &'static str {
        "preflight"
    }

    fn run<'a>(
        &'a self,
        commands: &'a [VerifyCommand],
        files: &'a [FilePatch],
    ) -> BoxFuture<'a, Result<VerifySummary, VerifyError>> {
        Box::pin(self.call(commands, files))
    }
}

/// Files a candidate overwrote, and directories it created, so the scratch
/// checkout can be put back once the checks are done.
#[derive(Default)]
struct Overlay {
    originals: Vec<(PathBuf, Option<Vec<u8>>)>,
    created_dirs: Vec<PathBuf>,
}

impl Overlay {
    fn apply(&mut self, root: &Path, files: &[FilePatch]) -> Result<(), VerifyError> {
        for file in files {
            let target = resolve_under_root(root, Path::new(&file.path)).map_err(VerifyError::Io)?;
            if let Some(parent) = target.parent() {
                self.create_dirs(parent)?;
            }
            let original = match std::fs::read(&target) {
                Ok(bytes) => Some(bytes),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
                Err(e) => return Err(VerifyError::Io(format!("{}: {}", target.display(), e))),
            };
            self.originals.push((target.clone(), original));
            std::fs::write(&target, &file.content)
                .map_err(|e| VerifyError::Io(format!("{}: {}", target.display(), e)))?;
        }
        Ok(())
    }

    fn create_dirs(&mut self, dir: &Path) -> Result<(), VerifyError> {
        let missing: Vec<PathBuf> = dir
            .ancestors()
            .take_while(|p| !p.exists())
            .map(Path::to_path_buf)
            .collect();
        std::fs::create_dir_all(dir)
            .map_err(|e| VerifyError::Io(format!("{}: {}", dir.display(), e)))?;
        // Outermost first, so restore can remove innermost first
        self.created_dirs.extend(missing.into_iter().rev());
        Ok(())
    }

    /// Undo in reverse order. Failures are logged; the next run still starts
    /// from whatever could be restored.
    fn restore(self) {
        for (path, original) in self.originals.into_iter().rev() {
            let result = match original {
                Some(bytes) => std::fs::write(&path, bytes),
                None => std::fs::remove_file(&path),
            };
            if let Err(err) = result {
                tracing::warn!(path = %path.display(), error = %err, "could not restore scratch file");
            }
        }
        for dir in self.created_dirs.iter().rev() {
            let _ = std::fs::remove_dir(dir);
        }
    }
}

/// Writes the candidate files into a scratch checkout and runs each command
/// there through `sh -c`. Runs are serialized and the checkout is restored
/// after each one.
pub struct LocalBackend {
    root: PathBuf,
    timeout: Duration,
    lock: Arc<tokio::sync::Mutex<()>>,
}

impl LocalBackend {
    pub fn new(root: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            root: root.into(),
            timeout,
            lock: Arc::new(tokio::sync::Mutex::new(())),
        }
    }

    fn run_one(root: &Path, command: &VerifyCommand, timeout: Duration) -> VerifyResult {
        let mut cmd = Command::new("sh");
        cmd.current_dir(root).arg("-c").arg(&command.command);

        match run_command_with_timeout(&mut cmd, timeout) {
            Ok(outcome) => {
                let mut output = tail_chars(&outcome.combined_output(), OUTPUT_TAIL_MAX_CHARS);
                if outcome.timed_out {
                    output = format!("timed out after {}s\n{}", timeout.as_secs(), output)
                        .trim_end()
                        .to_string();
                }
                VerifyResult {
                    ok: outcome.success(),
                    command: command.clone(),
                    output,
                }
            }
            Err(error) => VerifyResult {
                ok: false,
                command: command.clone(),
                output: error,
            },
        }
    }

    async fn execute(
        &self,
        commands: &[VerifyCommand],
        files: &[FilePatch],
    ) -> Result<VerifySummary, VerifyError> {
        let root = self.root.clone();
        let commands = commands.to_vec();
        let files = files.to_vec();
        let timeout = self.timeout;

        // Owned so the checkout stays locked even if this future is dropped
        let guard = self.lock.clone().lock_owned().await;
        tokio::task::spawn_blocking(move || -> Result<VerifySummary, VerifyError> {
            let _guard = guard;
            let mut overlay = Overlay::default();
            let summary = overlay.apply(&root, &files).map(|()| {
                let results = commands
                    .iter()
                    .map(|command| Self::run_one(&root, command, timeout))
                    .collect();
                VerifySummary::from_results(results)
            });
            overlay.restore();
            summary
        })
        .await
        .map_err(|e| VerifyError::Io(format!("check task failed: {}", e)))?
    }
}

impl CheckBackend for LocalBackend {
    fn name(&self) -> &'static str {
        "local"
    }

    fn run<'a>(
        &'a self,
        commands: &'a [VerifyCommand],
        files: &'a [FilePatch],
    ) -> BoxFuture<'a, Result<VerifySummary, VerifyError>> {
        Box::pin(self.execute(commands, files))
    }
}

// ============================================================================
// Runner
// ============================================================================

/// Handed to the repair callback after a failing attempt.
#[derive(Debug, Clone)]
pub struct RepairRequest {
    /// `name: output` per failing check
    pub error_context: String,
    /// 1-based number of the attempt that just failed
    pub attempt: u32,
    /// The candidate that failed
    pub current: PatchSet,
}

#[derive(Debug, Clone)]
pub struct VerifyOutcome {
    pub summary: VerifySummary,
    /// The candidate that was verified last
    pub patch: PatchSet,
    pub attempts: u32,
    pub repairs: u32,
}

pub struct VerifyRunner {
    backend: Arc<dyn CheckBackend>,
    max_retries: u32,
}

impl VerifyRunner {
    pub fn new(backend: Arc<dyn CheckBackend>, max_retries: u32) -> Self {
        Self {
            backend,
            max_retries,
        }
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    pub async fn run(
        &self,
        commands: &[VerifyCommand],
        patch: &PatchSet,
    ) -> Result<VerifySummary, VerifyError> {
        self.backend.run(commands, &patch.files).await
    }

    /// Verify `patch`, asking `on_failure` for a replacement after each failing
    /// attempt that still has retries left.
    ///
    /// Makes at most `max_retries + 1` attempts and stops at the first passing
    /// one. When the callback yields `None` the previous candidate is checked
    /// again. Running out of attempts is reported through `summary.ok`, not
    /// as an error.
    pub async fn run_with_repair_loop<F, Fut>(
        &self,
        commands: &[VerifyCommand],
        patch: PatchSet,
        mut on_failure: F,
    ) -> Result<VerifyOutcome, VerifyError>
    where
        F: FnMut(RepairRequest) -> Fut,
        Fut: Future<Output = Option<PatchSet>>,
    {
        let mut current = patch;
        let mut repairs = 0u32;
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            let summary = self.run(commands, &current).await?;
            tracing::info!(
                backend = self.backend.name(),
                attempt,
                ok = summary.ok,
                "verification attempt finished"
            );

            if summary.ok || attempt > self.max_retries {
                return Ok(VerifyOutcome {
                    summary,
                    patch: current,
                    attempts: attempt,
                    repairs,
                });
            }

            repairs += 1;
            let request = RepairRequest {
                error_context: summary.failure_context(),
                attempt,
                current: current.clone(),
            };
            if let Some(next) = on_failure(request).await {
                current = next;
            }
        }
    }
}
