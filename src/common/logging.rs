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
//! Logging for the group-by core.
//!
//! Events render one per line in a glog-flavoured layout keyed by the
//! tracing target, which is how the buffer-lifecycle, launch and readback
//! logs from the execution context and the software device are meant to be
//! read:
//!
//! ```text
//! D0802 14:31:02.123456 basalt::exec::groupby::context:640] host kernel complete: ...
//! ```
//!
//! The filter comes from `BasaltConfig`: a full `log_filter` expression when
//! set (per-target control, e.g. `basalt::runtime::device=debug`), the plain
//! `log_level` otherwise.

use std::fmt;
use std::sync::OnceLock;

use chrono::Utc;
use tracing::Level;
use tracing_subscriber::fmt::format::{FormatEvent, FormatFields, Writer};
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::{EnvFilter, fmt as tracing_fmt};

use crate::common::config::{self, BasaltConfig};

static INIT: OnceLock<()> = OnceLock::new();

fn level_char(level: Level) -> char {
    match level {
        Level::ERROR => 'E',
        Level::WARN => 'W',
        Level::INFO => 'I',
        Level::DEBUG => 'D',
        Level::TRACE => 'T',
    }
}

fn filter_for(config: &BasaltConfig) -> EnvFilter {
    match &config.log_filter {
        Some(filter) => EnvFilter::new(filter),
        None => EnvFilter::new(&config.log_level),
    }
}

struct GlogEvents;

impl<S, N> FormatEvent<S, N> for GlogEvents
where
    S: tracing::Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &tracing_fmt::FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &tracing::Event<'_>,
    ) -> fmt::Result {
        let metadata = event.metadata();

        // Lmmdd hh:mm:ss.uuuuuu target:line] message
        //
        // UTC wall clock: these lines get interleaved with logs from other
        // hosts of the same query, so no local offsets. The target replaces
        // glog's file path; module paths are what this crate filters on.
        write!(
            writer,
            "{}{} {}:{}] ",
            level_char(*metadata.level()),
            Utc::now().format("%m%d %H:%M:%S%.6f"),
            metadata.target(),
            metadata.line().unwrap_or(0),
        )?;
        ctx.field_format().format_fields(writer.by_ref(), event)?;
        writeln!(writer)
    }
}

/// Install the subscriber once per process; later calls are no-ops.
pub fn init_from_config(config: &BasaltConfig) {
    let env_filter = filter_for(config);
    INIT.get_or_init(|| {
        // Color only when stderr is a terminal; redirected logs would pick
        // up escape garbage otherwise.
        let use_ansi = atty::is(atty::Stream::Stderr);
        let _ = tracing_fmt()
            .with_env_filter(env_filter)
            .with_writer(std::io::stderr)
            .with_ansi(use_ansi)
            .event_format(GlogEvents)
            .try_init();
    });
}

pub fn init_with_level(level: &str) {
    init_from_config(&BasaltConfig {
        log_level: level.to_string(),
        ..BasaltConfig::default()
    });
}

/// Init from `$BASALT_CONFIG` / `./basalt.toml` when present, defaults
/// otherwise.
pub fn init() {
    match config::config() {
        Ok(cfg) => init_from_config(cfg),
        Err(_) => init_from_config(&BasaltConfig::default()),
    }
}

pub use tracing::instrument;
pub use tracing::{debug, error, info, trace, warn};

#[cfg(test)]
mod tests {
    use super::{filter_for, level_char};
    use crate::common::config::BasaltConfig;
    use tracing::Level;

    #[test]
    fn test_level_chars() {
        assert_eq!(level_char(Level::ERROR), 'E');
        assert_eq!(level_char(Level::WARN), 'W');
        assert_eq!(level_char(Level::INFO), 'I');
        assert_eq!(level_char(Level::DEBUG), 'D');
        assert_eq!(level_char(Level::TRACE), 'T');
    }

    #[test]
    fn test_filter_prefers_full_expression() {
        let cfg = BasaltConfig {
            log_level: "info".to_string(),
            log_filter: Some("basalt::runtime::device=debug".to_string()),
            ..BasaltConfig::default()
        };
        assert_eq!(
            filter_for(&cfg).to_string(),
            "basalt::runtime::device=debug"
        );

        let cfg = BasaltConfig {
            log_level: "warn".to_string(),
            ..BasaltConfig::default()
        };
        assert_eq!(filter_for(&cfg).to_string(), "warn");
    }
}
