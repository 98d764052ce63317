//! Swarmd configuration types and loading

use eyre::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

/// Main swarmd configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SwarmConfig {
    /// LLM provider configuration (orchestrator-internal calls)
    pub provider: ProviderConfig,

    /// Swarm-wide execution limits
    pub swarm: SwarmLimits,

    /// Retry policy knobs
    pub retry: RetryConfig,

    /// Quality gate configuration
    pub quality: QualityConfig,

    /// Capability probe configuration
    pub probes: ProbeConfig,

    /// Optional pipeline phases
    pub phases: PhaseConfig,

    /// Checkpoint persistence
    pub persistence: PersistenceConfig,

    /// Request throttle in front of the shared provider
    pub throttle: ThrottleSettings,

    /// Worker model roster
    pub workers: Vec<WorkerSpec>,

    /// Hierarchy roles (manager plans/reviews, judge grades)
    pub hierarchy: HierarchyConfig,

    /// Per-task-type overrides keyed by type name
    #[serde(rename = "task-types")]
    pub task_types: HashMap<String, TaskTypeConfig>,

    /// Worker economics tuning
    pub economics: EconomicsConfig,

    /// Tool access policy passed through to worker definitions
    pub tools: ToolPolicyConfig,

    /// External agent runtime the pool spawns workers through
    pub spawner: SpawnerConfig,
}

impl SwarmConfig {
    /// Load configuration with fallback chain
    pub fn load(config_path: Option<&PathBuf>) -> Result<Self> {
        // If explicit config path provided, try to load it
        if let Some(path) = config_path {
            return Self::load_from_file(path).context(format!("Failed to load config from {}", path.display()));
        }

        // Try project-local config: .swarmd.yml
        let local_config = PathBuf::from(".swarmd.yml");
        if local_config.exists() {
            match Self::load_from_file(&local_config) {
                Ok(config) => return Ok(config),
                Err(e) => {
                    tracing::warn!("Failed to load config from {}: {}", local_config.display(), e);
                }
            }
        }

        // Try user config: ~/.config/swarmd/swarmd.yml
        if let Some(config_dir) = dirs::config_dir() {
            let user_config = config_dir.join("swarmd").join("swarmd.yml");
            if user_config.exists() {
                match Self::load_from_file(&user_config) {
                    Ok(config) => return Ok(config),
                    Err(e) => {
                        tracing::warn!("Failed to load config from {}: {}", user_config.display(), e);
                    }
                }
            }
        }

        // No config file found, use defaults
        tracing::info!("No config file found, using defaults");
        Ok(Self::default())
    }

    fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path).context("Failed to read config file")?;

        let config: Self = serde_yaml::from_str(&content).context("Failed to parse config file")?;

        tracing::info!("Loaded config from: {}", path.as_ref().display());
        Ok(config)
    }

    /// Worker roster, falling back to a single default worker when the
    /// config names none
    pub fn worker_roster(&self) -> Vec<WorkerSpec> {
        if self.workers.is_empty() {
            vec![WorkerSpec::default()]
        } else {
            self.workers.clone()
        }
    }

    /// Effective per-type settings for a task type name
    pub fn task_type(&self, name: &str) -> TaskTypeConfig {
        self.task_types.get(name).cloned().unwrap_or_default()
    }
}

/// LLM provider configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    /// Provider name (currently only "anthropic" supported)
    pub provider: String,

    /// Default model identifier
    pub model: String,

    /// Environment variable containing the API key
    #[serde(rename = "api-key-env")]
    pub api_key_env: String,

    /// API base URL
    #[serde(rename = "base-url")]
    pub base_url: String,

    /// Maximum tokens per response
    #[serde(rename = "max-tokens")]
    pub max_tokens: u32,

    /// Request timeout in milliseconds
    #[serde(rename = "timeout-ms")]
    pub timeout_ms: u64,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            provider: "anthropic".to_string(),
            model: "claude-sonnet-4-20250514".to_string(),
            api_key_env: "ANTHROPIC_API_KEY".to_string(),
            base_url: "https://api.anthropic.com".to_string(),
            max_tokens: 16384,
            timeout_ms: 300_000,
        }
    }
}

/// Swarm-wide execution limits
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SwarmLimits {
    /// Maximum concurrent workers
    #[serde(rename = "max-concurrency")]
    pub max_concurrency: usize,

    /// Aggregate token budget for the whole run
    #[serde(rename = "total-budget")]
    pub total_budget: u64,

    /// Aggregate cost ceiling in USD
    #[serde(rename = "max-cost")]
    pub max_cost: f64,

    /// Base worker timeout in seconds (floor 240 applied at derivation)
    #[serde(rename = "worker-timeout-secs")]
    pub worker_timeout_secs: u64,

    /// Base iteration budget per worker
    #[serde(rename = "worker-max-iterations")]
    pub worker_max_iterations: u32,

    /// Milliseconds between successive dispatches (adaptive baseline)
    #[serde(rename = "dispatch-stagger-ms")]
    pub dispatch_stagger_ms: u64,

    /// Seconds after which a dispatched task with no live worker is stale
    #[serde(rename = "worker-stuck-threshold-secs")]
    pub worker_stuck_threshold_secs: u64,

    /// Fraction of the token budget reserved for orchestrator-internal
    /// calls; grows with subtask count up to 0.40
    #[serde(rename = "orchestrator-reserve-ratio")]
    pub orchestrator_reserve_ratio: f64,

    /// Model used for orchestrator-internal calls (decompose, synthesize)
    #[serde(rename = "orchestrator-model")]
    pub orchestrator_model: Option<String>,
}

impl Default for SwarmLimits {
    fn default() -> Self {
        Self {
            max_concurrency: 4,
            total_budget: 2_000_000,
            max_cost: 20.0,
            worker_timeout_secs: 240,
            worker_max_iterations: 30,
            dispatch_stagger_ms: 500,
            worker_stuck_threshold_secs: 600,
            orchestrator_reserve_ratio: 0.15,
            orchestrator_model: None,
        }
    }
}

/// Retry policy knobs
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Retries for ordinary worker failures
    #[serde(rename = "worker-retries")]
    pub worker_retries: u32,

    /// Retries for rate-limit failures
    #[serde(rename = "rate-limit-retries")]
    pub rate_limit_retries: u32,

    /// Base delay for the rate-limit retry backoff, in milliseconds
    #[serde(rename = "retry-base-delay-ms")]
    pub retry_base_delay_ms: u64,

    /// Minimum completed-dependency ratio for partial rescue
    #[serde(rename = "partial-dependency-threshold")]
    pub partial_dependency_threshold: f64,

    /// Per-dependency cap on injected context characters
    #[serde(rename = "dependency-context-max-length")]
    pub dependency_context_max_length: usize,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            worker_retries: 2,
            rate_limit_retries: 3,
            retry_base_delay_ms: 1_000,
            partial_dependency_threshold: 1.0,
            dependency_context_max_length: 1_500,
        }
    }
}

/// Quality gate configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QualityConfig {
    /// Master switch for quality gating
    #[serde(rename = "quality-gates")]
    pub enabled: bool,

    /// Judge score needed to pass, in [1, 5]
    pub threshold: u8,

    /// Model for judge calls (defaults to hierarchy judge, then provider)
    pub model: Option<String>,

    /// Phrases in a closure report that admit failure
    #[serde(rename = "failure-phrases")]
    pub failure_phrases: Vec<String>,

    /// Consecutive non-pre-flight rejections that trip the breaker
    #[serde(rename = "breaker-threshold")]
    pub breaker_threshold: u32,
}

impl Default for QualityConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            threshold: 3,
            model: None,
            failure_phrases: vec![
                "budget exhausted".to_string(),
                "unable to complete".to_string(),
                "could not complete".to_string(),
                "ran out of".to_string(),
                "gave up".to_string(),
                "cannot proceed".to_string(),
                "failed to complete".to_string(),
            ],
            breaker_threshold: 8,
        }
    }
}

/// Capability probe configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProbeConfig {
    /// Probe worker models before execution
    #[serde(rename = "probe-models")]
    pub enabled: bool,

    /// Per-probe timeout in milliseconds
    #[serde(rename = "probe-timeout-ms")]
    pub timeout_ms: u64,

    /// What to do when every probe fails
    #[serde(rename = "probe-failure-strategy")]
    pub failure_strategy: ProbeFailureStrategy,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            timeout_ms: 20_000,
            failure_strategy: ProbeFailureStrategy::Warn,
        }
    }
}

/// Policy when no worker model passes the capability probe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProbeFailureStrategy {
    /// Abort the swarm with a clear reason
    Abort,
    /// Continue with a warning; the first real failure decides
    Warn,
}

/// Optional pipeline phases
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PhaseConfig {
    /// Manager produces acceptance criteria + verification plan
    #[serde(rename = "enable-planning")]
    pub planning: bool,

    /// Manager reviews each wave and may emit fix-up tasks
    #[serde(rename = "enable-wave-review")]
    pub wave_review: bool,

    /// Execute the planned verification steps after the DAG drains
    #[serde(rename = "enable-verification")]
    pub verification: bool,

    /// Fix-up/re-verify cycles allowed
    #[serde(rename = "max-verification-retries")]
    pub max_verification_retries: u32,

    /// Switch assigned models on repeated per-model failures
    #[serde(rename = "enable-model-failover")]
    pub model_failover: bool,
}

impl Default for PhaseConfig {
    fn default() -> Self {
        Self {
            planning: false,
            wave_review: false,
            verification: false,
            max_verification_retries: 2,
            model_failover: true,
        }
    }
}

/// Checkpoint persistence
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistenceConfig {
    /// Write checkpoints at wave boundaries
    #[serde(rename = "enable-persistence")]
    pub enabled: bool,

    /// Root directory for session state
    #[serde(rename = "state-dir")]
    pub state_dir: PathBuf,

    /// Session to resume instead of starting fresh
    #[serde(rename = "resume-session-id")]
    pub resume_session_id: Option<String>,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            state_dir: PathBuf::from(".swarmd/sessions"),
            resume_session_id: None,
        }
    }
}

/// Request throttle settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ThrottleSettings {
    /// Virtual token capacity (concurrent in-flight requests)
    #[serde(rename = "max-concurrent")]
    pub max_concurrent: u32,

    /// Continuous refill rate in requests per second
    #[serde(rename = "refill-per-second")]
    pub refill_per_second: f64,

    /// Minimum wall-clock spacing between consumptions, in milliseconds
    #[serde(rename = "min-spacing-ms")]
    pub min_spacing_ms: u64,
}

impl Default for ThrottleSettings {
    fn default() -> Self {
        Self {
            max_concurrent: 4,
            refill_per_second: 1.0,
            min_spacing_ms: 250,
        }
    }
}

/// A worker model the pool can dispatch to
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerSpec {
    /// Short name used in agent registration
    pub name: String,

    /// Model identifier
    pub model: String,

    /// Capabilities this worker covers (code, research, reasoning, ...)
    pub capabilities: Vec<String>,

    /// Treat as a lightweight model (reduced prompt tier)
    pub lightweight: bool,
}

impl Default for WorkerSpec {
    fn default() -> Self {
        Self {
            name: "coder".to_string(),
            model: "claude-sonnet-4-20250514".to_string(),
            capabilities: vec!["code".to_string(), "research".to_string(), "reasoning".to_string()],
            lightweight: false,
        }
    }
}

impl WorkerSpec {
    pub fn supports(&self, capability: &str) -> bool {
        self.capabilities.iter().any(|c| c == capability)
    }
}

/// Hierarchy roles
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HierarchyConfig {
    /// Manager model (planning, wave review, replanning)
    pub manager: Option<String>,

    /// Judge model (quality gate)
    pub judge: Option<String>,

    /// Planner model (verification plan); falls back to manager
    #[serde(rename = "planner-model")]
    pub planner_model: Option<String>,
}

/// Per-task-type overrides
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskTypeConfig {
    /// Prompt template override name
    #[serde(rename = "prompt-template")]
    pub prompt_template: Option<String>,

    /// Capability requirement override
    pub capability: Option<String>,

    /// Fixed token budget (overrides the range)
    #[serde(rename = "token-budget")]
    pub token_budget: Option<u64>,

    /// Token budget range [min, max] scaled by complexity
    #[serde(rename = "token-budget-range")]
    pub token_budget_range: Option<(u64, u64)>,

    /// Iteration budget override
    #[serde(rename = "max-iterations")]
    pub max_iterations: Option<u32>,

    /// Timeout override in seconds
    #[serde(rename = "timeout-secs")]
    pub timeout_secs: Option<u64>,

    /// Idle timeout passed to the worker definition, in seconds
    #[serde(rename = "idle-timeout-secs")]
    pub idle_timeout_secs: Option<u64>,
}

/// Worker economics tuning, forwarded opaquely into agent definitions
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EconomicsConfig {
    /// Consecutive no-progress iterations before the worker self-aborts
    #[serde(rename = "doom-loop-threshold")]
    pub doom_loop_threshold: u32,
}

impl Default for EconomicsConfig {
    fn default() -> Self {
        Self { doom_loop_threshold: 3 }
    }
}

/// Tool access policy for workers
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolPolicyConfig {
    /// Tools denied to every worker
    #[serde(rename = "global-denied-tools")]
    pub global_denied_tools: Vec<String>,

    /// Whether workers get all tools or only a whitelist
    #[serde(rename = "tool-access-mode")]
    pub tool_access_mode: ToolAccessMode,

    /// Whitelisted tools when the mode is `whitelist`
    pub whitelist: Vec<String>,
}

impl Default for ToolPolicyConfig {
    fn default() -> Self {
        Self {
            global_denied_tools: Vec::new(),
            tool_access_mode: ToolAccessMode::All,
            whitelist: Vec::new(),
        }
    }
}

/// Tool access mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolAccessMode {
    All,
    Whitelist,
}

/// External agent runtime invocation
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SpawnerConfig {
    /// Command the pool runs per worker; the agent name is appended
    pub command: Vec<String>,
}

impl Default for SpawnerConfig {
    fn default() -> Self {
        Self {
            command: vec!["swarm-agent".to_string()],
        }
    }
}
