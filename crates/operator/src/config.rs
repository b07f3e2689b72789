// Copyright 2025 Policyward Maintainers
// SPDX-License-Identifier: Apache-2.0

//! Operator configuration loaded from environment variables

use std::{env, fmt, time::Duration};

use anyhow::{Context, Result};

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    /// Human readable lines
    Text,
    /// One JSON object per line
    Json,
}

/// Operator configuration
#[derive(Clone)]
pub struct Config {
    /// Base URL of the policy API; policies are kept in memory when unset
    pub policy_api_url: Option<String>,
    /// Bearer token for the policy API
    pub policy_api_token: Option<String>,
    /// `EnvFilter` directives
    pub log_level: String,
    /// Log output format
    pub log_format: LogFormat,
    /// Address of the health and diagnostics server
    pub bind_address: String,
    /// Requeue delay after a successful reconciliation
    pub reconcile_interval: Duration,
    /// Requeue delay after a failed reconciliation
    pub error_requeue: Duration,
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("policy_api_url", &self.policy_api_url)
            .field(
                "policy_api_token",
                &self.policy_api_token.as_ref().map(|_| "<redacted>"),
            )
            .field("log_level", &self.log_level)
            .field("log_format", &self.log_format)
            .field("bind_address", &self.bind_address)
            .field("reconcile_interval", &self.reconcile_interval)
            .field("error_requeue", &self.error_requeue)
            .finish()
    }
}

fn non_empty(name: &str) -> Option<String> {
    env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn seconds(name: &str, default: u64) -> Result<Duration> {
    let secs = match non_empty(name) {
        Some(v) => v
            .trim()
            .parse::<u64>()
            .ok()
            .filter(|secs| *secs > 0)
            .with_context(|| format!("{name} must be a positive number of seconds, got {v:?}"))?,
        None => default,
    };
    Ok(Duration::from_secs(secs))
}

impl Config {
    /// Load configuration from environment variables
    ///
    /// # Errors
    ///
    /// Returns an error when a duration variable is not a positive number.
    pub fn from_env() -> Result<Self> {
        let log_format = match non_empty("LOG_FORMAT").as_deref() {
            Some("json") => LogFormat::Json,
            _ => LogFormat::Text,
        };

        Ok(Config {
            policy_api_url: non_empty("POLICY_API_URL"),
            policy_api_token: non_empty("POLICY_API_TOKEN"),
            log_level: non_empty("LOG_LEVEL").unwrap_or_else(|| "info".to_string()),
            log_format,
            bind_address: non_empty("BIND_ADDRESS").unwrap_or_else(|| "0.0.0.0:8080".to_string()),
            reconcile_interval: seconds("RECONCILE_INTERVAL_SECS", 300)?,
            error_requeue: seconds("ERROR_REQUEUE_SECS", 60)?,
        })
    }
}
