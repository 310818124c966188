//! Harness configuration.

use serde::{Deserialize, Serialize};

use crate::fixtures::{MAX_PORT, NUM_PROCESSES, START_PORT};
use crate::{HarnessError, Result};

/// Settings for a [`crate::MetricTester`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HarnessConfig {
    /// Worker ranks in the distributed pool.
    pub num_processes: usize,
    /// Absolute comparison tolerance.
    pub atol: f64,
    pub master_addr: String,
    pub start_port: u16,
    pub max_port: u16,
    /// Whether an accelerator device is available for non-distributed runs.
    pub accelerator: bool,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            num_processes: NUM_PROCESSES,
            atol: 1e-8,
            master_addr: "localhost".to_string(),
            start_port: START_PORT,
            max_port: MAX_PORT,
            accelerator: false,
        }
    }
}

impl HarnessConfig {
    /// Defaults overridden by `MTEST_*` environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Defaults overridden by whatever `lookup` returns for each `MTEST_*` key.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut cfg = Self::default();
        if let Some(v) = lookup("MTEST_NUM_PROCESSES") {
            cfg.num_processes = parse("MTEST_NUM_PROCESSES", &v)?;
        }
        if let Some(v) = lookup("MTEST_ATOL") {
            cfg.atol = parse("MTEST_ATOL", &v)?;
        }
        if let Some(v) = lookup("MTEST_MASTER_ADDR") {
            cfg.master_addr = v;
        }
        if let Some(v) = lookup("MTEST_START_PORT") {
            cfg.start_port = parse("MTEST_START_PORT", &v)?;
        }
        if let Some(v) = lookup("MTEST_MAX_PORT") {
            cfg.max_port = parse("MTEST_MAX_PORT", &v)?;
        }
        if let Some(v) = lookup("MTEST_ACCELERATOR") {
            cfg.accelerator = match v.to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" | "gpu" | "cuda" => true,
                "0" | "false" | "no" | "cpu" | "" => false,
                other => {
                    return Err(HarnessError::Config(format!(
                        "MTEST_ACCELERATOR: unrecognised value `{other}`"
                    )));
                }
            };
        }
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        if self.num_processes == 0 {
            return Err(HarnessError::Config("num_processes must be at least 1".into()));
        }
        if self.atol.is_nan() || self.atol < 0.0 {
            return Err(HarnessError::Config(format!(
                "atol must be a non-negative number, got {}",
                self.atol
            )));
        }
        if self.start_port > self.max_port {
            return Err(HarnessError::Config(format!(
                "start_port {} exceeds max_port {}",
                self.start_port, self.max_port
            )));
        }
        Ok(())
    }
}

fn parse<T: std::str::FromStr>(key: &str, value: &str) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e| HarnessError::Config(format!("{key}: {e}")))
}
