// Licensed to the Apache Software Foundation (ASF) under one
// or more contributor license agreements.  See the NOTICE file
// distributed with this work for additional information
// regarding copyright ownership.  The ASF licenses this file
// to you under the Apache License, Version 2.0 (the
// "License"); you may not use this file except in compliance
// with the License.  You may obtain a copy of the License at
//
//   http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing,
// software distributed under the License is distributed on an
// "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied.  See the License for the
// specific language governing permissions and limitations
// under the License.
//! Engine configuration.
//!
//! `EngineConfig` is an immutable record threaded through planning and
//! execution; nothing in the core reads process-wide state at runtime. The
//! toml loader exists for embedding hosts and caches the parsed file once
//! per process.

use anyhow::{Context, Result, anyhow};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

static CONFIG: OnceLock<BasaltConfig> = OnceLock::new();

fn default_log_level() -> String {
    "info".to_string()
}

fn default_max_groups_buffer_entry_count() -> usize {
    131_072
}

fn default_small_groups_buffer_entry_count() -> usize {
    4_096
}

fn default_block_size() -> usize {
    1_024
}

fn default_grid_size() -> usize {
    16
}

fn default_warp_size() -> usize {
    32
}

fn default_allow_multifrag() -> bool {
    true
}

/// Knobs consumed by the group-by core.
///
/// `enable_watchdog` gates the slow-path rejections in range analysis,
/// COUNT DISTINCT planning and descriptor construction.
#[derive(Clone, Debug, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub enable_watchdog: bool,

    #[serde(default = "default_max_groups_buffer_entry_count")]
    pub max_groups_buffer_entry_count: usize,

    #[serde(default = "default_small_groups_buffer_entry_count")]
    pub small_groups_buffer_entry_count: usize,

    #[serde(default = "default_block_size")]
    pub block_size: usize,

    #[serde(default = "default_grid_size")]
    pub grid_size: usize,

    #[serde(default = "default_warp_size")]
    pub warp_size: usize,

    /// True when no accelerator is present; affects block memory sharing.
    #[serde(default)]
    pub cpu_only: bool,

    /// Per-block shared memory budget for the fast direct-addressed path.
    /// Zero disables the shared fast path entirely.
    #[serde(default)]
    pub shared_mem_budget_bytes: usize,

    #[serde(default = "default_allow_multifrag")]
    pub allow_multifrag: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            enable_watchdog: false,
            max_groups_buffer_entry_count: default_max_groups_buffer_entry_count(),
            small_groups_buffer_entry_count: default_small_groups_buffer_entry_count(),
            block_size: default_block_size(),
            grid_size: default_grid_size(),
            warp_size: default_warp_size(),
            cpu_only: false,
            shared_mem_budget_bytes: 0,
            allow_multifrag: true,
        }
    }
}

#[derive(Clone, Deserialize)]
pub struct BasaltConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Optional full tracing EnvFilter expression; takes precedence over
    /// `log_level` when set.
    #[serde(default)]
    pub log_filter: Option<String>,

    #[serde(default)]
    pub engine: EngineConfig,
}

impl Default for BasaltConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_filter: None,
            engine: EngineConfig::default(),
        }
    }
}

impl BasaltConfig {
    fn load_from_file(path: &Path) -> Result<Self> {
        let s = std::fs::read_to_string(path)
            .with_context(|| format!("read config: {}", path.display()))?;
        let cfg: BasaltConfig =
            toml::from_str(&s).with_context(|| format!("parse toml: {}", path.display()))?;
        Ok(cfg)
    }
}

pub fn init_from_path(path: impl AsRef<Path>) -> Result<&'static BasaltConfig> {
    if let Some(cfg) = CONFIG.get() {
        return Ok(cfg);
    }
    let cfg = BasaltConfig::load_from_file(path.as_ref())?;
    let _ = CONFIG.set(cfg);
    Ok(CONFIG.get().expect("CONFIG set"))
}

pub fn init_from_env_or_default() -> Result<&'static BasaltConfig> {
    if let Some(cfg) = CONFIG.get() {
        return Ok(cfg);
    }
    let path = config_path_from_env_or_default()?;
    let cfg = BasaltConfig::load_from_file(&path)?;
    let _ = CONFIG.set(cfg);
    Ok(CONFIG.get().expect("CONFIG set"))
}

pub fn config() -> Result<&'static BasaltConfig> {
    init_from_env_or_default()
}

fn config_path_from_env_or_default() -> Result<PathBuf> {
    if let Ok(p) = std::env::var("BASALT_CONFIG") {
        if !p.trim().is_empty() {
            return Ok(PathBuf::from(p));
        }
    }

    let candidates = [PathBuf::from("basalt.toml")];
    for p in candidates {
        if p.exists() {
            return Ok(p);
        }
    }

    Err(anyhow!(
        "missing config file: set $BASALT_CONFIG or create ./basalt.toml"
    ))
}

#[cfg(test)]
mod tests {
    use super::BasaltConfig;

    #[test]
    fn test_defaults() {
        let cfg = BasaltConfig::default();
        assert!(!cfg.engine.enable_watchdog);
        assert_eq!(cfg.engine.max_groups_buffer_entry_count, 131_072);
        assert_eq!(cfg.engine.small_groups_buffer_entry_count, 4_096);
        assert_eq!(cfg.engine.shared_mem_budget_bytes, 0);
        assert!(cfg.engine.allow_multifrag);
    }

    #[test]
    fn test_parse_engine_section() {
        let cfg: BasaltConfig = toml::from_str(
            r#"
            log_level = "debug"

            [engine]
            enable_watchdog = true
            max_groups_buffer_entry_count = 1024
            block_size = 128
            grid_size = 2
            "#,
        )
        .unwrap();
        assert!(cfg.engine.enable_watchdog);
        assert_eq!(cfg.engine.max_groups_buffer_entry_count, 1024);
        assert_eq!(cfg.engine.block_size, 128);
        assert_eq!(cfg.engine.grid_size, 2);
        assert_eq!(cfg.engine.warp_size, 32);
    }
}
