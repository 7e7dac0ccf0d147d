//! Configuration resolution for relink-matcher
//!
//! Priority per knob: CLI flag → `RELINK_*` environment variable → TOML
//! config file → compiled default. Every knob has a default, so the daemon
//! runs with zero configuration.

use clap::Parser;
use relink_common::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::info;

/// Command-line arguments for relink-matcher
#[derive(Parser, Debug, Default)]
#[command(name = "relink-matcher")]
#[command(about = "Record reconciliation matching pipeline for the Relink knowledge base")]
#[command(version)]
pub struct CliArgs {
    /// Root folder holding relink.db
    #[arg(short, long, env = "RELINK_ROOT_FOLDER")]
    pub root_folder: Option<String>,

    /// Path to a TOML config file (default: ~/.config/relink/relink-matcher.toml)
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// HTTP listen port
    #[arg(short, long, env = "RELINK_MATCHER_PORT")]
    pub port: Option<u16>,

    /// Worker pool size
    #[arg(short, long, env = "RELINK_WORKER_COUNT")]
    pub workers: Option<usize>,
}

/// On-disk TOML shape; everything optional so a partial file works
#[derive(Debug, Clone, Default, Deserialize)]
pub struct MatcherConfigFile {
    pub root_folder: Option<String>,
    pub log_level: Option<String>,
    pub listen_port: Option<u16>,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub search: SearchConfig,
    #[serde(default)]
    pub scoring: ScoringConfig,
}

/// Pipeline tunables: fan-out, retry, sweeper
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct PipelineConfig {
    /// Worker pool size
    pub worker_count: usize,
    /// Coordinator fan-out batch size
    pub chunk_size: usize,
    /// Per-job delivery budget
    pub max_attempts: u32,
    /// Transient retry backoff base (doubles per attempt)
    pub backoff_base_secs: u64,
    /// Backoff ceiling
    pub backoff_cap_secs: u64,
    /// Broker in-flight reclaim deadline
    pub visibility_timeout_secs: u64,
    /// Idle dequeue poll interval
    pub dequeue_poll_secs: u64,
    /// Sweeper cadence
    pub sweep_interval_secs: u64,
    /// Tasks in-flight longer than this get re-enqueued
    pub staleness_threshold_secs: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        PipelineConfig {
            worker_count: 4,
            chunk_size: 1000,
            max_attempts: 3,
            backoff_base_secs: 2,
            backoff_cap_secs: 60,
            visibility_timeout_secs: 120,
            dequeue_poll_secs: 1,
            sweep_interval_secs: 60,
            staleness_threshold_secs: 600,
        }
    }
}

/// Knowledge-base search client settings
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct SearchConfig {
    pub endpoint: String,
    /// Label language requested from the knowledge base
    pub language: String,
    /// Results per query, clamped to the API's 1..=50 window
    pub limit: u32,
    /// Global token bucket shared by all workers
    pub rate_limit_per_sec: u32,
    /// Bounded wait for a rate-limit token; timeout is a transient failure
    pub rate_acquire_timeout_secs: u64,
    pub request_timeout_secs: u64,
}

impl Default for SearchConfig {
    fn default() -> Self {
        SearchConfig {
            endpoint: "https://www.wikidata.org/w/api.php".to_string(),
            language: "en".to_string(),
            limit: 10,
            rate_limit_per_sec: 5,
            rate_acquire_timeout_secs: 10,
            request_timeout_secs: 30,
        }
    }
}

/// Scoring weights and rules
///
/// `property_rules` maps an entry attribute key to the knowledge-base
/// property compared against it, e.g. `place_of_birth = "P19"`. All
/// property rules together share `property_weight`.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct ScoringConfig {
    pub name_weight: f64,
    pub date_weight: f64,
    pub property_weight: f64,
    /// Fuzzy name ratios below this score 0
    pub name_fuzzy_threshold: i64,
    /// Dates this many days apart still count as near-matches
    pub date_tolerance_days: i64,
    /// Auto-accept hook; disabled when unset
    pub auto_accept_threshold: Option<i64>,
    /// Entry attribute carrying the comparison date
    pub date_attribute: String,
    /// Knowledge-base property the date is compared against
    pub date_property: String,
    pub property_rules: BTreeMap<String, String>,
}

impl Default for ScoringConfig {
    fn default() -> Self {
        ScoringConfig {
            name_weight: 0.5,
            date_weight: 0.3,
            property_weight: 0.2,
            name_fuzzy_threshold: 70,
            date_tolerance_days: 3,
            auto_accept_threshold: None,
            date_attribute: "date_of_birth".to_string(),
            date_property: "P569".to_string(),
            property_rules: BTreeMap::new(),
        }
    }
}

/// Field-wise project override of [`ScoringConfig`]; absent fields inherit
/// the daemon's values
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ScoringOverrides {
    pub name_weight: Option<f64>,
    pub date_weight: Option<f64>,
    pub property_weight: Option<f64>,
    pub name_fuzzy_threshold: Option<i64>,
    pub date_tolerance_days: Option<i64>,
    pub auto_accept_threshold: Option<i64>,
    pub date_attribute: Option<String>,
    pub date_property: Option<String>,
    pub property_rules: Option<BTreeMap<String, String>>,
}

impl ScoringConfig {
    /// Apply a project's `scoring_config` JSON on top of this config
    pub fn with_overrides(&self, value: &serde_json::Value) -> Result<ScoringConfig> {
        let overrides: ScoringOverrides = serde_json::from_value(value.clone())?;
        let mut merged = self.clone();
        if let Some(v) = overrides.name_weight {
            merged.name_weight = v;
        }
        if let Some(v) = overrides.date_weight {
            merged.date_weight = v;
        }
        if let Some(v) = overrides.property_weight {
            merged.property_weight = v;
        }
        if let Some(v) = overrides.name_fuzzy_threshold {
            merged.name_fuzzy_threshold = v;
        }
        if let Some(v) = overrides.date_tolerance_days {
            merged.date_tolerance_days = v;
        }
        if let Some(v) = overrides.auto_accept_threshold {
            merged.auto_accept_threshold = Some(v);
        }
        if let Some(v) = overrides.date_attribute {
            merged.date_attribute = v;
        }
        if let Some(v) = overrides.date_property {
            merged.date_property = v;
        }
        if let Some(v) = overrides.property_rules {
            merged.property_rules = v;
        }
        Ok(merged)
    }
}

/// Fully resolved daemon configuration
#[derive(Debug, Clone)]
pub struct MatcherConfig {
    pub root_folder: PathBuf,
    pub listen_port: u16,
    pub log_level: String,
    pub pipeline: PipelineConfig,
    pub search: SearchConfig,
    pub scoring: ScoringConfig,
}

impl MatcherConfig {
    /// Resolve configuration from CLI args, environment, and config file
    pub fn resolve(args: &CliArgs) -> Result<Self> {
        let file = load_config_file(args.config.as_deref())?;

        // clap already applied the RELINK_ROOT_FOLDER env tier
        let root_folder = relink_common::config::resolve_root_folder(
            args.root_folder.as_deref(),
            "RELINK_ROOT_FOLDER",
            file.root_folder.as_deref(),
        );

        let mut pipeline = file.pipeline.clone();
        if let Some(workers) = args.workers {
            pipeline.worker_count = workers;
        }

        Ok(MatcherConfig {
            root_folder,
            listen_port: args.port.or(file.listen_port).unwrap_or(5810),
            log_level: file.log_level.unwrap_or_else(|| "info".to_string()),
            pipeline,
            search: file.search,
            scoring: file.scoring,
        })
    }

    pub fn database_path(&self) -> PathBuf {
        self.root_folder.join("relink.db")
    }
}

fn load_config_file(explicit: Option<&Path>) -> Result<MatcherConfigFile> {
    if let Some(path) = explicit {
        if !path.exists() {
            return Err(Error::Config(format!(
                "config file not found: {}",
                path.display()
            )));
        }
        info!("Loading config file: {}", path.display());
        return relink_common::config::load_toml(path);
    }

    match relink_common::config::find_config_file("relink-matcher") {
        Some(path) => {
            info!("Loading config file: {}", path.display());
            relink_common::config::load_toml(&path)
        }
        None => Ok(MatcherConfigFile::default()),
    }
}
