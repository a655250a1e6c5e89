//! Runtime configuration for block-budget.
//!
//! Configuration can be loaded from a JSON file or constructed programmatically.
//! Pool sizing, batch limits and the synthetic workload replayed by the binary
//! all live here.

use std::path::PathBuf;

use clap::Parser;
use serde::{Deserialize, Serialize};

/// Command-line arguments.
#[derive(Parser, Debug, Clone)]
#[command(
    name = "block-budget",
    about = "Replay a synthetic workload through the KV block allocator"
)]
pub struct Cli {
    /// Path to configuration file (JSON).
    #[arg(short, long, default_value = "config.json")]
    pub config: PathBuf,

    /// Maximum scheduling passes to run (overrides the config file).
    #[arg(long)]
    pub passes: Option<usize>,

    /// Enable verbose logging.
    #[arg(short, long)]
    pub verbose: bool,
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Block pool sizing.
    pub pool: PoolConfig,

    /// Batch limits.
    pub scheduler: SchedulerConfig,

    /// Synthetic workload for the binary.
    pub workload: WorkloadConfig,
}

/// Block pool sizing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Blocks in the pool, including the reserved null block.
    pub num_blocks: usize,

    /// Tokens per block.
    pub block_size: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            num_blocks: 1024,
            block_size: 16,
        }
    }
}

/// Per-pass batch limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Maximum requests in one batch.
    pub max_num_seqs: usize,

    /// Maximum new tokens in one batch.
    pub max_batched_tokens: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_num_seqs: 64,
            max_batched_tokens: 4096,
        }
    }
}

/// Synthetic workload replayed by the binary.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkloadConfig {
    /// Number of requests submitted.
    pub num_requests: usize,

    /// Prompt length of every request.
    pub prompt_tokens: usize,

    /// Tokens generated per request.
    pub max_tokens: usize,

    /// Upper bound on scheduling passes.
    pub max_passes: usize,
}

impl Default for WorkloadConfig {
    fn default() -> Self {
        Self {
            num_requests: 128,
            prompt_tokens: 512,
            max_tokens: 128,
            max_passes: 10_000,
        }
    }
}

impl Config {
    /// Load configuration from a JSON file, falling back to defaults for missing fields.
    pub fn load(path: &std::path::Path) -> anyhow::Result<Self> {
        if path.exists() {
            let data = std::fs::read_to_string(path)?;
            let config: Config = serde_json::from_str(&data)?;
            Ok(config)
        } else {
            tracing::warn!("Config file not found at {:?}, using defaults", path);
            Ok(Config::default())
        }
    }

    /// Tokens the pool can hold once the null block is set aside.
    pub fn tokens_capacity(&self) -> usize {
        self.pool.num_blocks.saturating_sub(1) * self.pool.block_size
    }

    /// Tokens one workload request holds at completion.
    pub fn tokens_per_request(&self) -> usize {
        self.workload.prompt_tokens + self.workload.max_tokens
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let cfg = Config::default();
        assert_eq!(cfg.pool.num_blocks, 1024);
        assert_eq!(cfg.pool.block_size, 16);
        assert_eq!(cfg.scheduler.max_num_seqs, 64);
    }

    #[test]
    fn test_tokens_capacity() {
        let mut cfg = Config::default();
        cfg.pool.num_blocks = 9;
        cfg.pool.block_size = 4;
        assert_eq!(cfg.tokens_capacity(), 32);

        cfg.pool.num_blocks = 0;
        assert_eq!(cfg.tokens_capacity(), 0);
    }

    #[test]
    fn test_tokens_per_request() {
        let mut cfg = Config::default();
        assert_eq!(cfg.tokens_per_request(), 640);
        assert!(cfg.tokens_per_request() <= cfg.tokens_capacity());

        cfg.pool.num_blocks = 9;
        cfg.pool.block_size = 4;
        assert!(cfg.tokens_per_request() > cfg.tokens_capacity());
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let cfg: Config = serde_json::from_str(r#"{"pool": {"num_blocks": 9}}"#).unwrap();
        assert_eq!(cfg.pool.num_blocks, 9);
        assert_eq!(cfg.pool.block_size, 16);
        assert_eq!(cfg.workload.max_tokens, 128);
    }
}
