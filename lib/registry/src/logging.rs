// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Tracing subscriber setup for processes embedding the registry.
//!
//! Settings come from, lowest priority first:
//! 1. Built-in defaults: `info`, with transport crates quieted to `error`.
//! 2. A TOML file named by `MERIDIAN_LOGGING_CONFIG_PATH`.
//! 3. `MERIDIAN_LOG`, an `EnvFilter` directive string.
//!
//! Output is compact human-readable lines on stderr, or one JSON object per
//! line when `MERIDIAN_LOGGING_JSONL=1`.
//!
//! ```toml
//! level = "warn"
//!
//! [targets]
//! "meridian_registry::registry" = "debug"
//! ```

use figment::{
    Figment,
    providers::{Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Once;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::filter::Directive;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, fmt};

const LOG_ENV: &str = "MERIDIAN_LOG";
const JSONL_ENV: &str = "MERIDIAN_LOGGING_JSONL";
const SETTINGS_PATH_ENV: &str = "MERIDIAN_LOGGING_CONFIG_PATH";

/// Crates whose chatter is limited to errors unless overridden.
const QUIET_TARGETS: [&str; 4] = ["h2", "hyper_util", "tonic", "tower"];

static INSTALL: Once = Once::new();

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LogFormat {
    Readable,
    Jsonl,
}

impl LogFormat {
    fn from_env() -> Self {
        match std::env::var(JSONL_ENV).as_deref() {
            Ok("1" | "true" | "TRUE") => LogFormat::Jsonl,
            _ => LogFormat::Readable,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct LogSettings {
    /// Default level for targets without an entry in `targets`.
    level: String,
    /// Per-target level overrides.
    targets: BTreeMap<String, String>,
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            targets: QUIET_TARGETS
                .iter()
                .map(|target| (target.to_string(), "error".to_string()))
                .collect(),
        }
    }
}

impl LogSettings {
    fn load() -> Self {
        let path = std::env::var(SETTINGS_PATH_ENV).unwrap_or_default();
        Figment::from(Serialized::defaults(LogSettings::default()))
            .merge(Toml::file(path))
            .extract()
            .unwrap_or_else(|e| {
                eprintln!("ignoring unreadable logging settings: {e}");
                LogSettings::default()
            })
    }

    /// Build the filter. `env` is the `MERIDIAN_LOG` value; its directives
    /// come last so they replace any settings for the same target.
    fn env_filter(&self, env: Option<&str>) -> EnvFilter {
        let level = self.level.parse::<LevelFilter>().unwrap_or_else(|e| {
            eprintln!("invalid log level {:?} ({e}); using info", self.level);
            LevelFilter::INFO
        });

        let mut directives = Vec::with_capacity(self.targets.len() + 2);
        directives.push(level.to_string());
        for (target, target_level) in &self.targets {
            let directive = format!("{target}={target_level}");
            match directive.parse::<Directive>() {
                Ok(_) => directives.push(directive),
                Err(e) => eprintln!("invalid level {target_level:?} for {target:?}: {e}"),
            }
        }
        if let Some(env) = env.filter(|env| !env.trim().is_empty()) {
            directives.push(env.to_string());
        }

        EnvFilter::builder()
            .with_default_directive(Directive::from(level))
            .parse_lossy(directives.join(","))
    }
}

/// Install the global subscriber. Only the first call has any effect, and an
/// already-installed subscriber from elsewhere is left in place.
pub fn init() {
    INSTALL.call_once(install);
}

fn install() {
    let env = std::env::var(LOG_ENV).ok();
    let filter = LogSettings::load().env_filter(env.as_deref());

    // each layer builder is its own type, so the two arms cannot share a binding
    let installed = match LogFormat::from_env() {
        LogFormat::Jsonl => tracing_subscriber::registry()
            .with(
                fmt::layer()
                    .json()
                    .with_current_span(true)
                    .with_writer(std::io::stderr)
                    .with_filter(filter),
            )
            .try_init(),
        LogFormat::Readable => tracing_subscriber::registry()
            .with(
                fmt::layer()
                    .compact()
                    .with_writer(std::io::stderr)
                    .with_filter(filter),
            )
            .try_init(),
    };

    if installed.is_err() {
        tracing::debug!("global subscriber already set; keeping it");
    }
}
