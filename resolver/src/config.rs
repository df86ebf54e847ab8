use crate::error::ResolverError;
use crate::error::Result;
use crate::tier::Tier;
use crate::tier::TierPlan;
use chrono::Weekday;
use serde::Deserialize;
use serde::Serialize;
use std::fs;
use std::path::Path;
use std::path::PathBuf;
use std::time::Duration;

/// How the requested date range is turned into the list of days to resolve.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RangePolicy {
    /// Every non-rest day of the requested range.
    #[default]
    Exact,
    /// Clamp the requested range to the span covered by OVERRIDE files.
    ClampToOverrides,
    /// Only days covered by at least one OVERRIDE file.
    OverrideDaysOnly,
}

#[derive(Clone, Debug)]
pub struct CacheConfig {
    pub result_ttl: Duration,
    pub popular_result_ttl: Duration,
    /// TTL for answers produced by a tier that ran out of budget.
    pub partial_result_ttl: Duration,
    pub document_capacity: usize,
    pub document_ttl: Duration,
    pub monitor_interval: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            result_ttl: Duration::from_secs(30 * 60),
            popular_result_ttl: Duration::from_secs(60 * 60),
            partial_result_ttl: Duration::from_secs(2 * 60),
            document_capacity: 30,
            document_ttl: Duration::from_secs(30 * 60),
            monitor_interval: Duration::from_secs(60),
        }
    }
}

#[derive(Clone, Debug)]
pub struct PoolConfig {
    pub workers: usize,
    pub task_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            workers: 20,
            task_timeout: Duration::from_secs(15),
        }
    }
}

#[derive(Clone, Debug)]
pub struct CoordinatorConfig {
    pub join_timeout: Duration,
    pub hang_threshold: Duration,
    pub release_grace: Duration,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            join_timeout: Duration::from_secs(30),
            hang_threshold: Duration::from_secs(45),
            release_grace: Duration::from_secs(5),
        }
    }
}

#[derive(Clone, Debug)]
pub struct PopularityConfig {
    pub threshold: u64,
    /// JSON list of promoted entity names; `None` keeps promotion in memory only.
    pub store_path: Option<PathBuf>,
}

impl Default for PopularityConfig {
    fn default() -> Self {
        Self {
            threshold: 3,
            store_path: None,
        }
    }
}

#[derive(Clone, Debug)]
pub struct RefreshConfig {
    pub interval: Duration,
    pub window_days: u32,
    pub index_max_age: Duration,
    pub max_entities: Option<usize>,
    pub concurrency: usize,
}

impl Default for RefreshConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60 * 60),
            window_days: 14,
            index_max_age: Duration::from_secs(60 * 60),
            max_entities: None,
            concurrency: 4,
        }
    }
}

#[derive(Clone, Debug)]
pub struct IndexConfig {
    pub scan_rows: usize,
    pub scan_cols: usize,
    pub entity_pattern: String,
    /// How long the indexed tier waits for an in-progress build.
    pub ready_wait: Duration,
    pub build_concurrency: usize,
}

pub const DEFAULT_ENTITY_PATTERN: &str =
    r"[A-Za-zА-Яа-яЁё-]+\s+[A-ZА-ЯЁ]\.\s?[A-ZА-ЯЁ]\.";

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            scan_rows: 50,
            scan_cols: 12,
            entity_pattern: DEFAULT_ENTITY_PATTERN.to_string(),
            ready_wait: Duration::from_secs(5),
            build_concurrency: 8,
        }
    }
}

#[derive(Clone, Debug)]
pub struct CalendarConfig {
    pub rest_day: Weekday,
    pub range_policy: RangePolicy,
}

impl Default for CalendarConfig {
    fn default() -> Self {
        Self {
            rest_day: Weekday::Sun,
            range_policy: RangePolicy::Exact,
        }
    }
}

/// Runtime configuration of the resolution engine.
#[derive(Clone, Debug)]
pub struct EngineConfig {
    pub cache: CacheConfig,
    pub pool: PoolConfig,
    /// Ordered fallback chain.
    pub tiers: Vec<TierPlan>,
    pub coordinator: CoordinatorConfig,
    pub popularity: PopularityConfig,
    pub refresh: RefreshConfig,
    pub index: IndexConfig,
    pub calendar: CalendarConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            cache: CacheConfig::default(),
            pool: PoolConfig::default(),
            tiers: TierPlan::default_chain(),
            coordinator: CoordinatorConfig::default(),
            popularity: PopularityConfig::default(),
            refresh: RefreshConfig::default(),
            index: IndexConfig::default(),
            calendar: CalendarConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Load a TOML file and layer it over the built-in defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        let parsed: ConfigToml = toml::from_str(&content)?;
        let config = Self::default().with_overrides(parsed);
        config.validate()?;
        Ok(config)
    }

    pub fn with_overrides(mut self, toml: ConfigToml) -> Self {
        if let Some(cache) = toml.cache {
            apply_secs(&mut self.cache.result_ttl, cache.result_ttl_secs);
            apply_secs(&mut self.cache.popular_result_ttl, cache.popular_result_ttl_secs);
            apply_secs(&mut self.cache.partial_result_ttl, cache.partial_result_ttl_secs);
            apply_secs(&mut self.cache.document_ttl, cache.document_ttl_secs);
            apply_secs(&mut self.cache.monitor_interval, cache.monitor_interval_secs);
            if let Some(capacity) = cache.document_capacity {
                self.cache.document_capacity = capacity;
            }
        }
        if let Some(pool) = toml.pool {
            if let Some(workers) = pool.workers {
                self.pool.workers = workers;
            }
            apply_millis(&mut self.pool.task_timeout, pool.task_timeout_ms);
        }
        if let Some(tiers) = toml.tiers {
            if let Some(order) = tiers.order {
                self.tiers = order
                    .into_iter()
                    .map(|tier| match tier {
                        Tier::Indexed => TierPlan::indexed(),
                        Tier::Optimized => TierPlan::optimized(),
                        Tier::Simple => TierPlan::simple(),
                    })
                    .collect();
            }
            for plan in &mut self.tiers {
                let overrides = match plan.tier {
                    Tier::Indexed => tiers.indexed.as_ref(),
                    Tier::Optimized => tiers.optimized.as_ref(),
                    Tier::Simple => tiers.simple.as_ref(),
                };
                if let Some(overrides) = overrides {
                    overrides.apply(plan);
                }
            }
        }
        if let Some(coordinator) = toml.coordinator {
            apply_millis(&mut self.coordinator.join_timeout, coordinator.join_timeout_ms);
            apply_millis(
                &mut self.coordinator.hang_threshold,
                coordinator.hang_threshold_ms,
            );
            apply_millis(
                &mut self.coordinator.release_grace,
                coordinator.release_grace_ms,
            );
        }
        if let Some(popularity) = toml.popularity {
            if let Some(threshold) = popularity.threshold {
                self.popularity.threshold = threshold;
            }
            if popularity.store_path.is_some() {
                self.popularity.store_path = popularity.store_path;
            }
        }
        if let Some(refresh) = toml.refresh {
            apply_secs(&mut self.refresh.interval, refresh.interval_secs);
            apply_secs(&mut self.refresh.index_max_age, refresh.index_max_age_secs);
            if let Some(days) = refresh.window_days {
                self.refresh.window_days = days;
            }
            if refresh.max_entities.is_some() {
                self.refresh.max_entities = refresh.max_entities;
            }
            if let Some(concurrency) = refresh.concurrency {
                self.refresh.concurrency = concurrency;
            }
        }
        if let Some(index) = toml.index {
            if let Some(rows) = index.scan_rows {
                self.index.scan_rows = rows;
            }
            if let Some(cols) = index.scan_cols {
                self.index.scan_cols = cols;
            }
            if let Some(pattern) = index.entity_pattern {
                self.index.entity_pattern = pattern;
            }
            apply_millis(&mut self.index.ready_wait, index.ready_wait_ms);
            if let Some(concurrency) = index.build_concurrency {
                self.index.build_concurrency = concurrency;
            }
        }
        if let Some(calendar) = toml.calendar {
            if let Some(rest_day) = calendar.rest_day {
                self.calendar.rest_day = rest_day;
            }
            if let Some(policy) = calendar.range_policy {
                self.calendar.range_policy = policy;
            }
        }
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.pool.workers == 0 {
            return Err(ResolverError::Config("pool.workers must be > 0".to_string()));
        }
        if self.cache.document_capacity == 0 {
            return Err(ResolverError::Config(
                "cache.document_capacity must be > 0".to_string(),
            ));
        }
        if self.tiers.is_empty() {
            return Err(ResolverError::Config(
                "at least one resolution tier is required".to_string(),
            ));
        }
        if self.tiers.iter().any(|plan| plan.batch_size == Some(0)) {
            return Err(ResolverError::Config("tier batch_size must be > 0".to_string()));
        }
        if self.index.build_concurrency == 0 || self.refresh.concurrency == 0 {
            return Err(ResolverError::Config(
                "index.build_concurrency and refresh.concurrency must be > 0".to_string(),
            ));
        }
        regex::Regex::new(&self.index.entity_pattern).map_err(|err| {
            ResolverError::Config(format!("index.entity_pattern is not a valid regex: {err}"))
        })?;
        Ok(())
    }
}

fn apply_secs(target: &mut Duration, secs: Option<u64>) {
    if let Some(secs) = secs {
        *target = Duration::from_secs(secs);
    }
}

fn apply_millis(target: &mut Duration, millis: Option<u64>) {
    if let Some(millis) = millis {
        *target = Duration::from_millis(millis);
    }
}

/// On-disk form of [`EngineConfig`]; every field is optional.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConfigToml {
    pub cache: Option<CacheToml>,
    pub pool: Option<PoolToml>,
    pub tiers: Option<TiersToml>,
    pub coordinator: Option<CoordinatorToml>,
    pub popularity: Option<PopularityToml>,
    pub refresh: Option<RefreshToml>,
    pub index: Option<IndexToml>,
    pub calendar: Option<CalendarToml>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CacheToml {
    pub result_ttl_secs: Option<u64>,
    pub popular_result_ttl_secs: Option<u64>,
    pub partial_result_ttl_secs: Option<u64>,
    pub document_capacity: Option<usize>,
    pub document_ttl_secs: Option<u64>,
    pub monitor_interval_secs: Option<u64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PoolToml {
    pub workers: Option<usize>,
    pub task_timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TiersToml {
    pub order: Option<Vec<Tier>>,
    pub indexed: Option<TierToml>,
    pub optimized: Option<TierToml>,
    pub simple: Option<TierToml>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TierToml {
    pub overall_budget_ms: Option<u64>,
    pub batch_size: Option<usize>,
    pub batch_timeout_ms: Option<u64>,
    pub file_timeout_ms: Option<u64>,
}

impl TierToml {
    fn apply(&self, plan: &mut TierPlan) {
        if let Some(ms) = self.overall_budget_ms {
            plan.overall_budget = Some(Duration::from_millis(ms));
        }
        if let Some(size) = self.batch_size {
            plan.batch_size = Some(size);
        }
        if let Some(ms) = self.batch_timeout_ms {
            plan.batch_timeout = Some(Duration::from_millis(ms));
        }
        apply_millis(&mut plan.file_timeout, self.file_timeout_ms);
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CoordinatorToml {
    pub join_timeout_ms: Option<u64>,
    pub hang_threshold_ms: Option<u64>,
    pub release_grace_ms: Option<u64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PopularityToml {
    pub threshold: Option<u64>,
    pub store_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RefreshToml {
    pub interval_secs: Option<u64>,
    pub window_days: Option<u32>,
    pub index_max_age_secs: Option<u64>,
    pub max_entities: Option<usize>,
    pub concurrency: Option<usize>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct IndexToml {
    pub scan_rows: Option<usize>,
    pub scan_cols: Option<usize>,
    pub entity_pattern: Option<String>,
    pub ready_wait_ms: Option<u64>,
    pub build_concurrency: Option<usize>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CalendarToml {
    pub rest_day: Option<Weekday>,
    pub range_policy: Option<RangePolicy>,
}
