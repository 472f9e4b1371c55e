//! Environment-driven gate settings.
//!
//! Shell gates execute arbitrary commands and are therefore disabled unless
//! the host explicitly opts in via `OPENSKELO_ALLOW_SHELL_GATES=true`. The
//! companion `OPENSKELO_SHELL_GATE_TIMEOUT_MS` bounds each invocation.

use anyhow::Context;
use figment::providers::{Env, Serialized};
use figment::Figment;
use serde::{Deserialize, Serialize};

/// Host-level gate toggles.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GateSettings {
    /// Shell gates fail closed unless this is set.
    pub allow_shell_gates: bool,
    /// Per-invocation timeout for shell gates.
    pub shell_gate_timeout_ms: u64,
}

impl Default for GateSettings {
    fn default() -> Self {
        Self {
            allow_shell_gates: false,
            shell_gate_timeout_ms: 5000,
        }
    }
}

impl GateSettings {
    /// Load from the environment, falling back to defaults.
    ///
    /// Recognized variables: `OPENSKELO_ALLOW_SHELL_GATES`,
    /// `OPENSKELO_SHELL_GATE_TIMEOUT_MS`.
    pub fn from_env() -> anyhow::Result<Self> {
        Figment::from(Serialized::defaults(Self::default()))
            .merge(Env::prefixed("OPENSKELO_"))
            .extract()
            .context("Failed to extract gate settings from environment")
    }

    /// Settings with shell gates enabled (tests and trusted hosts).
    pub fn with_shell_enabled() -> Self {
        Self {
            allow_shell_gates: true,
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_fail_closed() {
        let settings = GateSettings::default();
        assert!(!settings.allow_shell_gates);
        assert_eq!(settings.shell_gate_timeout_ms, 5000);
    }
}
