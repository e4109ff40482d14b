use std::env;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Load .env file (silently ignores if missing).
pub fn load_dotenv() {
    dotenvy::dotenv().ok();
}

fn env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_opt(key: &str) -> Option<String> {
    env::var(key).ok().filter(|s| !s.is_empty())
}

/// Read a profiled env var: tries {PROFILE}_{KEY} first, falls back to {KEY}.
fn profiled_env_opt(profile: &str, key: &str) -> Option<String> {
    if !profile.is_empty() {
        let prefixed = format!("{}_{}", profile, key);
        if let Some(v) = env_opt(&prefixed) {
            return Some(v);
        }
    }
    env_opt(key)
}

fn profiled_env_or(profile: &str, key: &str, default: &str) -> String {
    profiled_env_opt(profile, key).unwrap_or_else(|| default.to_string())
}

fn profiled_env_u32(profile: &str, key: &str, default: u32) -> u32 {
    profiled_env_opt(profile, key)
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn profiled_env_u64(profile: &str, key: &str, default: u64) -> u64 {
    profiled_env_opt(profile, key)
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn profiled_env_usize(profile: &str, key: &str, default: usize) -> usize {
    profiled_env_opt(profile, key)
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

// ── Top-level config ──────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Active profile name (empty = default).
    pub profile: String,
    pub api: ApiConfig,
    pub store: StoreConfig,
    pub rate: RateConfig,
    pub fetch: FetchConfig,
    pub job: JobConfig,
    pub reconcile: ReconcileConfig,
    pub workers: WorkerPoolConfig,
}

impl Config {
    /// Build config from environment variables (call `load_dotenv()` first).
    /// Profile is read from `MATCHFAN_PROFILE`. When set (e.g. `PROD`),
    /// every key is first looked up as `{PROFILE}_{KEY}`, falling back to `{KEY}`.
    pub fn from_env() -> Self {
        let profile = env_or("MATCHFAN_PROFILE", "").to_uppercase();
        Self::for_profile(&profile)
    }

    /// Build config for a specific named profile (empty string = default).
    pub fn for_profile(profile: &str) -> Self {
        let p = profile.to_uppercase();
        let p = p.as_str();
        Self {
            profile: p.to_string(),
            api: ApiConfig::from_env_profiled(p),
            store: StoreConfig::from_env_profiled(p),
            rate: RateConfig::from_env_profiled(p),
            fetch: FetchConfig::from_env_profiled(p),
            job: JobConfig::from_env_profiled(p),
            reconcile: ReconcileConfig::from_env_profiled(p),
            workers: WorkerPoolConfig::from_env_profiled(p),
        }
    }

    pub fn profile_label(&self) -> &str {
        if self.profile.is_empty() { "default" } else { &self.profile }
    }

    /// Print a redacted summary for startup logs.
    pub fn log_summary(&self) {
        tracing::info!("Config loaded (profile: {}):", self.profile_label());
        tracing::info!(
            "  api:        key={}, games_to_fetch={}, queue={}",
            if self.api.is_configured() { "set" } else { "(none)" },
            self.api.games_to_fetch,
            self.api.queue_id
        );
        tracing::info!(
            "  store:      backend={}, redis={}",
            self.store.backend,
            self.store.redis_url
        );
        tracing::info!(
            "  rate:       interval={}ms, default_backoff={}s",
            self.rate.min_interval_ms,
            self.rate.default_backoff_secs
        );
        tracing::info!(
            "  fetch:      timeout={}ms, max_retries={}, backoff={}..{}ms",
            self.fetch.timeout_ms,
            self.fetch.max_retries,
            self.fetch.backoff_base_ms,
            self.fetch.backoff_max_ms
        );
        tracing::info!(
            "  job:        cooldown={}s, cache_ttl={}s, lock_ttl={}s, page_size={}",
            self.job.cooldown_secs,
            self.job.cache_ttl_secs,
            self.job.lock_ttl_secs,
            self.job.artifact_page_size
        );
        tracing::info!(
            "  reconcile:  stale_after={}s, sweep_every={}s, max_resumes={}, strictness={}",
            self.reconcile.stale_after_secs,
            self.reconcile.sweep_interval_secs,
            self.reconcile.max_resumes,
            self.reconcile.strictness
        );
        tracing::info!(
            "  workers:    pool={}, count={}",
            self.workers.pool_name,
            self.workers.count
        );
    }
}

impl Default for Config {
    /// Built-in defaults, ignoring the environment.
    fn default() -> Self {
        Self {
            profile: String::new(),
            api: ApiConfig::default(),
            store: StoreConfig::default(),
            rate: RateConfig::default(),
            fetch: FetchConfig::default(),
            job: JobConfig::default(),
            reconcile: ReconcileConfig::default(),
            workers: WorkerPoolConfig::default(),
        }
    }
}

// ── Remote API ────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    pub api_key: Option<String>,
    /// Upper bound on match ids enumerated per job.
    pub games_to_fetch: u32,
    /// Match ids requested per enumeration page (the API caps at 100).
    pub ids_page_size: u32,
    /// Queue filter applied to enumeration (420 = ranked solo).
    pub queue_id: u32,
}

impl ApiConfig {
    fn from_env_profiled(p: &str) -> Self {
        let d = Self::default();
        Self {
            api_key: profiled_env_opt(p, "RIOT_API_KEY"),
            games_to_fetch: profiled_env_u32(p, "GAMES_TO_FETCH", d.games_to_fetch),
            ids_page_size: profiled_env_u32(p, "IDS_PAGE_SIZE", d.ids_page_size).clamp(1, 100),
            queue_id: profiled_env_u32(p, "MATCH_QUEUE_ID", d.queue_id),
        }
    }

    pub fn is_configured(&self) -> bool {
        self.api_key.is_some()
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            games_to_fetch: 500,
            ids_page_size: 100,
            queue_id: 420,
        }
    }
}

// ── Store ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// "memory" or "redis"
    pub backend: String,
    pub redis_url: String,
    pub key_prefix: Option<String>,
}

impl StoreConfig {
    fn from_env_profiled(p: &str) -> Self {
        let d = Self::default();
        Self {
            backend: profiled_env_or(p, "STORE_BACKEND", &d.backend).to_lowercase(),
            redis_url: profiled_env_or(p, "REDIS_URL", &d.redis_url),
            key_prefix: profiled_env_opt(p, "STORE_KEY_PREFIX"),
        }
    }

    pub fn is_redis(&self) -> bool {
        self.backend == "redis"
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: "memory".to_string(),
            redis_url: "redis://127.0.0.1:6379/0".to_string(),
            key_prefix: None,
        }
    }
}

// ── Rate gate ─────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateConfig {
    /// Minimum spacing between any two outbound calls.
    pub min_interval_ms: u64,
    /// Backoff applied on a 429 without a usable Retry-After header.
    pub default_backoff_secs: u64,
}

impl RateConfig {
    fn from_env_profiled(p: &str) -> Self {
        let d = Self::default();
        Self {
            min_interval_ms: profiled_env_u64(p, "RATE_INTERVAL_MS", d.min_interval_ms),
            default_backoff_secs: profiled_env_u64(
                p,
                "RATE_DEFAULT_BACKOFF_SECS",
                d.default_backoff_secs,
            ),
        }
    }

    pub fn min_interval(&self) -> Duration {
        Duration::from_millis(self.min_interval_ms)
    }

    pub fn default_backoff(&self) -> Duration {
        Duration::from_secs(self.default_backoff_secs)
    }
}

impl Default for RateConfig {
    fn default() -> Self {
        Self {
            min_interval_ms: 1250,
            default_backoff_secs: 10,
        }
    }
}

// ── Per-item fetch ────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchConfig {
    pub timeout_ms: u64,
    /// Retries after the first attempt before an item is tombstoned.
    pub max_retries: u32,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
}

impl FetchConfig {
    fn from_env_profiled(p: &str) -> Self {
        let d = Self::default();
        Self {
            timeout_ms: profiled_env_u64(p, "FETCH_TIMEOUT_MS", d.timeout_ms),
            max_retries: profiled_env_u32(p, "FETCH_MAX_RETRIES", d.max_retries),
            backoff_base_ms: profiled_env_u64(p, "FETCH_BACKOFF_BASE_MS", d.backoff_base_ms),
            backoff_max_ms: profiled_env_u64(p, "FETCH_BACKOFF_MAX_MS", d.backoff_max_ms),
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 15_000,
            max_retries: 3,
            backoff_base_ms: 500,
            backoff_max_ms: 30_000,
        }
    }
}

// ── Job lifecycle ─────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobConfig {
    pub cooldown_secs: u64,
    pub cache_ttl_secs: u64,
    /// Safety TTL on the dispatch lock; extended on every progress step.
    pub lock_ttl_secs: u64,
    /// Page size for chunked artifact delivery.
    pub artifact_page_size: usize,
}

impl JobConfig {
    fn from_env_profiled(p: &str) -> Self {
        let d = Self::default();
        Self {
            cooldown_secs: profiled_env_u64(p, "COOLDOWN_SECS", d.cooldown_secs),
            cache_ttl_secs: profiled_env_u64(p, "CACHE_TTL_SECS", d.cache_ttl_secs),
            lock_ttl_secs: profiled_env_u64(p, "LOCK_TTL_SECS", d.lock_ttl_secs),
            artifact_page_size: profiled_env_usize(p, "ARTIFACT_PAGE_SIZE", d.artifact_page_size)
                .max(1),
        }
    }

    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown_secs)
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }

    pub fn lock_ttl(&self) -> Duration {
        Duration::from_secs(self.lock_ttl_secs)
    }
}

impl Default for JobConfig {
    fn default() -> Self {
        Self {
            cooldown_secs: 60,
            cache_ttl_secs: 15_552_000, // 180 days
            lock_ttl_secs: 300,
            artifact_page_size: 20,
        }
    }
}

// ── Reconciliation ────────────────────────────────────────────

/// How much a resumed job trusts entries already in its result set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strictness {
    /// Recorded entries are accepted as-is.
    Trust,
    /// Entries that fail to decode or name unknown items are dropped,
    /// and tombstoned items get one more attempt.
    Verify,
}

impl std::fmt::Display for Strictness {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Strictness::Trust => write!(f, "trust"),
            Strictness::Verify => write!(f, "verify"),
        }
    }
}

impl std::str::FromStr for Strictness {
    type Err = crate::error::CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "trust" => Ok(Strictness::Trust),
            "verify" => Ok(Strictness::Verify),
            other => Err(crate::error::CoreError::Config(format!(
                "invalid reconcile strictness '{other}', expected 'trust' or 'verify'"
            ))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconcileConfig {
    /// A job with no progress for this long is considered abandoned.
    pub stale_after_secs: u64,
    pub sweep_interval_secs: u64,
    /// Resumes allowed before a stalled job is failed.
    pub max_resumes: u32,
    pub strictness: Strictness,
}

impl ReconcileConfig {
    fn from_env_profiled(p: &str) -> Self {
        let d = Self::default();
        let strictness = match profiled_env_opt(p, "RECONCILE_STRICTNESS") {
            Some(v) => v.parse().unwrap_or_else(|e| {
                tracing::warn!(error = %e, "Falling back to default reconcile strictness");
                d.strictness
            }),
            None => d.strictness,
        };
        Self {
            stale_after_secs: profiled_env_u64(p, "RECONCILE_STALE_AFTER_SECS", d.stale_after_secs),
            sweep_interval_secs: profiled_env_u64(p, "RECONCILE_SWEEP_SECS", d.sweep_interval_secs),
            max_resumes: profiled_env_u32(p, "RECONCILE_MAX_RESUMES", d.max_resumes),
            strictness,
        }
    }

    pub fn stale_after(&self) -> Duration {
        Duration::from_secs(self.stale_after_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            stale_after_secs: 120,
            sweep_interval_secs: 30,
            max_resumes: 1,
            strictness: Strictness::Trust,
        }
    }
}

// ── Worker pool ───────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerPoolConfig {
    pub pool_name: String,
    pub count: usize,
    /// How long an idle worker blocks on the queue before re-checking shutdown.
    pub poll_timeout_ms: u64,
    pub heartbeat_secs: u64,
}

impl WorkerPoolConfig {
    fn from_env_profiled(p: &str) -> Self {
        let d = Self::default();
        Self {
            pool_name: profiled_env_or(p, "WORKER_POOL_NAME", &d.pool_name),
            count: profiled_env_usize(p, "WORKER_COUNT", d.count).max(1),
            poll_timeout_ms: profiled_env_u64(p, "WORKER_POLL_TIMEOUT_MS", d.poll_timeout_ms),
            heartbeat_secs: profiled_env_u64(p, "WORKER_HEARTBEAT_SECS", d.heartbeat_secs),
        }
    }

    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_secs)
    }
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            pool_name: "match-history".to_string(),
            count: 32,
            poll_timeout_ms: 1000,
            heartbeat_secs: 30,
        }
    }
}
