//! Job records and the shared registry
//!
//! A job is the self-describing record of one instruction's trip through the
//! pipeline. Only the orchestrator mutates jobs; everyone else reads cloned
//! snapshots out of [`JobRegistry`].

use crate::llm::Provider;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

pub const DEFAULT_JOB_RETENTION: usize = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Running,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    Pending,
    Active,
    Complete,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AgentRole {
    Architect,
    Frontend,
    GitManager,
    Debugger,
    Devops,
}

impl AgentRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentRole::Architect => "ARCHITECT",
            AgentRole::Frontend => "FRONTEND",
            AgentRole::GitManager => "GIT_MANAGER",
            AgentRole::Debugger => "DEBUGGER",
            AgentRole::Devops => "DEVOPS",
        }
    }
}

/// SOLO prompts a single implementer; MULTI spells out the role plan.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum AgentMode {
    #[default]
    Solo,
    Multi,
}

/// The five pipeline stages, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Analyze,
    Generate,
    Validate,
    Verify,
    Publish,
}

pub struct PlannedStep {
    pub stage: Stage,
    pub phase: &'static str,
    pub title: &'static str,
    pub details: &'static str,
    pub role: AgentRole,
}

pub const EXECUTION_PLAN: [PlannedStep; 5] = [
    PlannedStep {
        stage: Stage::Analyze,
        phase: "analyze",
        title: "Analyze scope",
        details: "Parse requirements and collect repository context",
        role: AgentRole::Architect,
    },
    PlannedStep {
        stage: Stage::Generate,
        phase: "generate",
        title: "Generate patch",
        details: "Ask the model for a structured file patch",
        role: AgentRole::Frontend,
    },
    PlannedStep {
        stage: Stage::Validate,
        phase: "validate",
        title: "Validate patch",
        details: "Check file paths, allowlist and size limits",
        role: AgentRole::Devops,
    },
    PlannedStep {
        stage: Stage::Verify,
        phase: "verify",
        title: "Verify changes",
        details: "Run lint/test/build checks and feed failures back for repair",
        role: AgentRole::Debugger,
    },
    PlannedStep {
        stage: Stage::Publish,
        phase: "pr",
        title: "Commit + PR",
        details: "Create branch, commit files and open a pull request",
        role: AgentRole::GitManager,
    },
];

impl Stage {
    pub fn index(&self) -> usize {
        match self {
            Stage::Analyze => 0,
            Stage::Generate => 1,
            Stage::Validate => 2,
            Stage::Verify => 3,
            Stage::Publish => 4,
        }
    }

    pub fn plan(&self) -> &'static PlannedStep {
        &EXECUTION_PLAN[self.index()]
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentStep {
    pub id: String,
    pub label: String,
    pub details: String,
    pub role: AgentRole,
    pub status: StepStatus,
    /// Epoch milliseconds of the last status change
    pub timestamp: i64,
}

fn plan_steps(now: i64) -> Vec<AgentStep> {
    EXECUTION_PLAN
        .iter()
        .enumerate()
        .map(|(index, step)| AgentStep {
            id: (index + 1).to_string(),
            label: format!("{} ({})", step.title, step.phase.to_uppercase()),
            details: step.details.to_string(),
            role: step.role,
            status: StepStatus::Pending,
            timestamp: now,
        })
        .collect()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobError {
    pub code: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

impl JobError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: Option<Value>) -> Self {
        self.details = details;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentJob {
    pub job_id: String,
    pub status: JobStatus,
    pub mode: AgentMode,
    pub provider: Provider,
    pub steps: Vec<AgentStep>,
    pub branch: String,
    pub changed_files: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pr_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pr_number: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<JobError>,
    pub verify_attempts: u32,
    pub created_at: i64,
    pub updated_at: i64,
}

pub(crate) fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

impl AgentJob {
    pub fn new(mode: AgentMode, provider: Provider) -> Self {
        let now = now_millis();
        Self {
            job_id: uuid::Uuid::new_v4().to_string(),
            status: JobStatus::Queued,
            mode,
            provider,
            steps: plan_steps(now),
            branch: String::new(),
            changed_files: Vec::new(),
            pr_url: None,
            pr_number: None,
            error: None,
            verify_attempts: 0,
            created_at: now,
            updated_at: now,
        }
    }

    fn set_step(&mut self, stage: Stage, status: StepStatus) {
        let now = now_millis();
        if let Some(step) = self.steps.get_mut(stage.index()) {
            step.status = status;
            step.timestamp = now;
        }
        self.updated_at = now;
    }

    pub fn mark_running(&mut self) {
        self.status = JobStatus::Running;
        self.updated_at = now_millis();
    }

    pub fn start_step(&mut self, stage: Stage) {
        self.set_step(stage, StepStatus::Active);
    }

    pub fn complete_step(&mut self, stage: Stage) {
        self.set_step(stage, StepStatus::Complete);
    }

    /// Mark the active step (if any) as errored and the job as failed.
    pub fn fail(&mut self, error: JobError) {
        let now = now_millis();
        for step in self.steps.iter_mut().filter(|s| s.status == StepStatus::Active) {
            step.status = StepStatus::Error;
            step.timestamp = now;
        }
        self.status = JobStatus::Failed;
        self.error = Some(error);
        self.updated_at = now;
    }

    pub fn complete(&mut self) {
        self.status = JobStatus::Completed;
        self.updated_at = now_millis();
    }

    pub fn step(&self, stage: Stage) -> &AgentStep {
        &self.steps[stage.index()]
    }
}

// ============================================================================
// Registry
// ============================================================================

#[derive(Default)]
struct RegistryInner {
    jobs: HashMap<String, AgentJob>,
    /// Insertion order, oldest first
    order: VecDeque<String>,
}

/// Shared, bounded store of recent jobs.
///
/// Every operation takes the lock for one read-modify-write and never holds
/// it across an await.
pub struct JobRegistry {
    inner: Mutex<RegistryInner>,
    capacity: usize,
}

impl Default for JobRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_JOB_RETENTION)
    }
}

impl JobRegistry {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(RegistryInner::default()),
            capacity: capacity.max(1),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, RegistryInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn insert(&self, job: AgentJob) {
        let mut inner = self.lock();
        let id = job.job_id.clone();
        if inner.jobs.insert(id.clone(), job).is_none() {
            inner.order.push_back(id);
        }

        // Evict oldest finished jobs; in-flight jobs always stay
        while inner.jobs.len() > self.capacity {
            let victim = inner.order.iter().position(|id| {
                inner
                    .jobs
                    .get(id)
                    .map(|job| job.status.is_terminal())
                    .unwrap_or(true)
            });
            let Some(position) = victim else {
                break;
            };
            if let Some(id) = inner.order.remove(position) {
                inner.jobs.remove(&id);
            }
        }
    }

    pub fn get(&self, job_id: &str) -> Option<AgentJob> {
        self.lock().jobs.get(job_id).cloned()
    }

    /// The most recently submitted job still retained.
    pub fn latest(&self) -> Option<AgentJob> {
        let inner = self.lock();
        inner
            .order
            .back()
            .and_then(|id| inner.jobs.get(id))
            .cloned()
    }

    /// Apply `f` to the job under the lock and return the updated snapshot.
    pub fn update<F>(&self, job_id: &str, f: F) -> Option<AgentJob>
    where
        F: FnOnce(&mut AgentJob),
    {
        let mut inner = self.lock();
        let job = inner.jobs.get_mut(job_id)?;
        f(job);
        Some(job.clone())
    }

    pub fn len(&self) -> usize {
        self.lock().jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
