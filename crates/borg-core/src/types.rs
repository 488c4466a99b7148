use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ── Transport / Messaging ────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    Telegram,
    WhatsApp,
    Discord,
    Web,
}

/// Identifies the originating chat for reply routing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Sender {
    pub transport: Transport,
    /// Chat JID / channel ID / user ID depending on transport.
    pub chat_id: String,
    /// Optional message ID to reply to.
    pub reply_to: Option<String>,
}

// ── Pipeline Mode Enums ──────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseType {
    /// No-op setup phase; transitions immediately to next.
    Setup,
    /// Runs an AI agent (direct or in Docker).
    Agent,
    /// Runs a git rebase operation with optional agent fix.
    Rebase,
    /// Runs a lint command; spawns an agent to fix errors if any.
    LintFix,
}

impl Default for PhaseType {
    fn default() -> Self {
        Self::Agent
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntegrationType {
    /// Creates GitHub PRs and manages merge queue.
    GitPr,
    /// No VCS integration (e.g. legal/document pipelines).
    None,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SeedOutputType {
    Task,
    Proposal,
}

// ── Pipeline Task ────────────────────────────────────────────────────────

/// A pipeline task as stored in the database.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: i64,
    pub title: String,
    pub description: String,
    pub repo_path: String,
    /// Git branch name for this task's worktree.
    pub branch: String,
    /// Current pipeline phase / status (e.g. "backlog", "spec", "impl", "done").
    pub status: String,
    pub attempt: i64,
    pub max_attempts: i64,
    /// Output from the last failed phase, passed as context to the next attempt.
    pub last_error: String,
    /// Who created the task (chat JID, "pipeline", "seed", etc.).
    pub created_by: String,
    /// Chat to notify on completion (may be empty).
    pub notify_chat: String,
    pub created_at: DateTime<Utc>,
    /// Claude Code session ID for resumption.
    pub session_id: String,
    /// Pipeline mode name (e.g. "sweborg").
    pub mode: String,
    /// Agent backend override (e.g. "claude", "codex"). Empty = use global default.
    pub backend: String,
    /// Set iff a phase is currently running for this task; also the lease
    /// timestamp used for dispatch recovery after a crash.
    pub dispatched_at: Option<DateTime<Utc>>,
}

/// A user-facing proposal that can be promoted to a Task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Proposal {
    pub id: i64,
    pub repo_path: String,
    pub title: String,
    pub description: String,
    pub rationale: String,
    /// "proposed" | "approved" | "dismissed"
    pub status: String,
    pub created_at: DateTime<Utc>,
    pub triage_score: i64,
    pub triage_impact: i64,
    pub triage_feasibility: i64,
    pub triage_risk: i64,
    pub triage_effort: i64,
    pub triage_reasoning: String,
}

/// A pending merge-queue entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueEntry {
    pub id: i64,
    pub task_id: i64,
    pub branch: String,
    pub repo_path: String,
    /// "queued" | "merging" | "merged" | "excluded"
    pub status: String,
    pub queued_at: DateTime<Utc>,
    pub pr_number: i64,
    /// Last error observed while attempting integration, if any.
    pub error: String,
    /// Consecutive "unknown" (undiagnosable) integration-check failures.
    pub unknown_retries: i64,
}

// ── Config Types ─────────────────────────────────────────────────────────

/// Per-repository pipeline configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepoConfig {
    pub path: String,
    pub test_cmd: String,
    pub prompt_file: String,
    /// Pipeline mode name (default: "sweborg").
    pub mode: String,
    /// Is this the primary self-hosted repo (triggers self-update on merge)?
    pub is_self: bool,
    /// Auto-merge PRs when tests pass (false = manual merge mode).
    pub auto_merge: bool,
    /// Optional lint command for the lint_fix phase. Falls back to `.borg/lint.sh`.
    pub lint_cmd: String,
    /// Agent backend override for this repo. Empty = use global default.
    pub backend: String,
}

// ── Phase Config ─────────────────────────────────────────────────────────

/// Configuration for a single pipeline phase.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseConfig {
    pub name: String,
    pub label: String,
    #[serde(default)]
    pub phase_type: PhaseType,

    // Agent config
    pub system_prompt: String,
    pub instruction: String,
    /// Appended when task.last_error is set; supports `{ERROR}` placeholder.
    pub error_instruction: String,
    pub allowed_tools: String,
    pub use_docker: bool,

    // Prompt composition
    pub include_task_context: bool,
    pub include_file_listing: bool,

    // Post-agent actions
    pub runs_tests: bool,
    pub commits: bool,
    pub commit_message: String,
    /// File that must exist after phase completes.
    pub check_artifact: Option<String>,
    pub allow_no_changes: bool,

    // Transitions
    pub next: String,
    /// On test failure, check if error is in test files → route to qa_fix.
    pub has_qa_fix_routing: bool,
    /// Start with a fresh session (no resume).
    pub fresh_session: bool,

    // Rebase-specific
    pub fix_instruction: String,
    pub fix_error_instruction: String,

    /// Lower = processed first.
    pub priority: u8,
}

/// Configuration for a seed scan mode.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SeedConfig {
    pub name: String,
    pub label: String,
    pub prompt: String,
    pub output_type: SeedOutputType,
    pub allowed_tools: String,
    /// If true, this seed always targets the primary self-hosted repo
    /// regardless of which repo's cooldown triggered the scan.
    pub target_primary_repo: bool,
}

/// A complete pipeline mode definition (e.g. "sweborg").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineMode {
    pub name: String,
    pub label: String,
    pub category: String,
    pub phases: Vec<PhaseConfig>,
    pub seed_modes: Vec<SeedConfig>,
    pub initial_status: String,
    pub uses_git_worktrees: bool,
    pub uses_docker: bool,
    pub uses_test_cmd: bool,
    pub integration: IntegrationType,
    pub default_max_attempts: u8,
}

impl PipelineMode {
    pub fn get_phase(&self, name: &str) -> Option<&PhaseConfig> {
        self.phases.iter().find(|p| p.name == name)
    }

    pub fn get_phase_index(&self, name: &str) -> Option<usize> {
        self.phases.iter().position(|p| p.name == name)
    }

    /// A terminal status is one from which no further phase dispatch occurs
    /// and the worktree (if any) has been or is about to be torn down.
    /// `failed` is deliberately excluded: it is recyclable via operator retry.
    pub fn is_terminal(&self, status: &str) -> bool {
        matches!(status, "done" | "merged" | "failed_terminal" | "cancelled" | "excluded")
    }

    /// Validity checks run at registration time (§4.D):
    /// - every phase's `next` is another phase in this mode or the sentinel `done`
    /// - exactly one phase named `initial_status`, or `initial_status == "backlog"`
    ///   with the first phase of type `Setup`
    /// - if `uses_docker` is false, no phase may set `use_docker` true
    /// - at most one phase of type `Rebase`
    pub fn validate(&self) -> Result<(), String> {
        for phase in &self.phases {
            if phase.next != "done" && self.get_phase(&phase.next).is_none() {
                return Err(format!(
                    "mode {}: phase {} has unknown next {}",
                    self.name, phase.name, phase.next
                ));
            }
        }

        let has_initial = self.phases.iter().any(|p| p.name == self.initial_status);
        if !has_initial {
            let first_is_setup_backlog = self.initial_status == "backlog"
                && self.phases.first().map(|p| p.phase_type) == Some(PhaseType::Setup);
            if !first_is_setup_backlog {
                return Err(format!(
                    "mode {}: no phase named initial_status {} and first phase isn't a backlog setup",
                    self.name, self.initial_status
                ));
            }
        }

        if !self.uses_docker {
            for phase in &self.phases {
                if phase.use_docker {
                    return Err(format!(
                        "mode {}: phase {} sets use_docker but mode.uses_docker is false",
                        self.name, phase.name
                    ));
                }
            }
        }

        let rebase_count = self
            .phases
            .iter()
            .filter(|p| p.phase_type == PhaseType::Rebase)
            .count();
        if rebase_count > 1 {
            return Err(format!(
                "mode {}: {rebase_count} rebase phases, at most one allowed",
                self.name
            ));
        }

        Ok(())
    }
}

impl Default for PhaseConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            label: String::new(),
            phase_type: PhaseType::Agent,
            system_prompt: String::new(),
            instruction: String::new(),
            error_instruction: String::new(),
            allowed_tools: "Read,Glob,Grep,Write".into(),
            use_docker: false,
            include_task_context: false,
            include_file_listing: false,
            runs_tests: false,
            commits: false,
            commit_message: String::new(),
            check_artifact: None,
            allow_no_changes: false,
            next: "done".into(),
            has_qa_fix_routing: false,
            fresh_session: false,
            fix_instruction: String::new(),
            fix_error_instruction: String::new(),
            priority: 100,
        }
    }
}

// ── Phase Execution ──────────────────────────────────────────────────────

/// Runtime context passed to a phase executor.
#[derive(Debug, Clone)]
pub struct PhaseContext {
    pub task: Task,
    pub repo_config: RepoConfig,
    pub session_dir: String,
    pub worktree_path: String,
    pub oauth_token: String,
    pub model: String,
    /// Pending messages (role, content) to inject into this phase's instruction.
    pub pending_messages: Vec<(String, String)>,
    /// Extra system prompt appended to every agent run (co-author instructions etc.).
    pub system_prompt_suffix: String,
    /// If non-empty, append as Co-Authored-By trailer on git commits.
    pub user_coauthor: String,
    /// Broadcast sender for the task's live NDJSON stream (dashboard SSE tail).
    pub stream_tx: Option<tokio::sync::broadcast::Sender<String>>,
    /// Optional shell script run once before the first phase of a fresh
    /// worktree (e.g. `npm install`); empty = none.
    pub setup_script: String,
}

/// Output produced by a phase executor.
#[derive(Debug, Clone)]
pub struct PhaseOutput {
    pub output: String,
    pub new_session_id: Option<String>,
    pub raw_stream: String,
    pub success: bool,
    /// Lines in the raw stream that did not parse as a known event.
    pub malformed_lines: u64,
}

impl PhaseOutput {
    pub fn failed(output: impl Into<String>) -> Self {
        Self {
            output: output.into(),
            new_session_id: None,
            raw_stream: String::new(),
            success: false,
            malformed_lines: 0,
        }
    }
}

// ── Pipeline-wide event stream (dashboard SSE + in-process notify) ────────

/// A live pipeline event, broadcast in-process for the dashboard SSE stream
/// and for chat-transport notifications. Distinct from the durable `Event`
/// rows the Store appends (§3 "Event") — this is the live-tail signal.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PipelineEvent {
    /// A task-lifecycle or phase-lifecycle notice for display in the UI.
    Phase { task_id: Option<i64>, message: String },
    /// Agent narrative output produced by a phase, for live tail.
    Output { task_id: i64, phase: String, content: String },
    /// A message destined for a chat transport (task completion, errors).
    Notify { chat_id: String, message: String },
}

/// One entry in a task's phase-history (for the dashboard detail view and
/// for crash-recovery diagnostics).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseHistoryEntry {
    pub phase: String,
    pub attempt: i64,
    pub exit_code: i64,
    pub success: bool,
    pub created_at: DateTime<Utc>,
}

/// A point-in-time summary of the pipeline engine's state, persisted
/// periodically to the `config` table (key `pipeline_state_snapshot`) so the
/// dashboard can render engine health without querying every table on each
/// request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineStateSnapshot {
    pub active_tasks: i64,
    pub merged_tasks: i64,
    pub failed_tasks: i64,
    pub total_tasks: i64,
    pub queued_integrations: i64,
    pub untriaged_proposals: i64,
    pub taken_at: DateTime<Utc>,
}
