// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.

use std::sync::OnceLock;

/// Behaviour flags for the operator dispatcher.
#[derive(Clone, Debug)]
pub struct DispatchConfig {
    /// Emit a warning when a kernel registration shadows an existing one
    /// for the same operator and dispatch key.
    pub warn_on_override: bool,
    /// Re-derive the full dispatch table after every registration change
    /// and compare it against the live table. Expensive; intended for
    /// debugging registration machinery.
    pub paranoid_checks: bool,
}

impl DispatchConfig {
    /// Builds a configuration snapshot from environment variables.
    fn from_env() -> Self {
        let warn_on_override = std::env::var("SPIRAL_DISPATCH_WARN_OVERRIDE")
            .ok()
            .map(|v| !matches!(v.as_str(), "0" | "false" | "False" | "off" | "OFF"))
            .unwrap_or(true);

        let paranoid_checks = std::env::var("SPIRAL_DISPATCH_PARANOID")
            .ok()
            .map(|v| matches!(v.as_str(), "1" | "true" | "True" | "on" | "ON"))
            .unwrap_or(false);

        Self {
            warn_on_override,
            paranoid_checks,
        }
    }
}

static CONFIG: OnceLock<DispatchConfig> = OnceLock::new();

/// Returns the lazily initialised dispatcher configuration.
pub fn config() -> &'static DispatchConfig {
    CONFIG.get_or_init(DispatchConfig::from_env)
}

/// Overrides the dispatcher configuration. Intended for tests; has no
/// effect once the snapshot has been taken.
pub fn configure(cfg: DispatchConfig) -> &'static DispatchConfig {
    CONFIG.get_or_init(|| cfg)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::panic::{catch_unwind, resume_unwind, AssertUnwindSafe};
    use std::sync::{Mutex, OnceLock};

    fn with_env(vars: &[(&str, Option<&str>)], test: impl FnOnce()) {
        static GUARD: OnceLock<Mutex<()>> = OnceLock::new();
        let _lock = GUARD.get_or_init(|| Mutex::new(())).lock().unwrap();

        let snapshot: Vec<(String, Option<String>)> = vars
            .iter()
            .map(|(key, value)| {
                let previous = std::env::var(key).ok();
                match value {
                    Some(val) => std::env::set_var(key, val),
                    None => std::env::remove_var(key),
                }
                ((*key).to_string(), previous)
            })
            .collect();

        let result = catch_unwind(AssertUnwindSafe(test));

        for (key, value) in snapshot {
            match value {
                Some(val) => std::env::set_var(&key, val),
                None => std::env::remove_var(&key),
            }
        }

        if let Err(err) = result {
            resume_unwind(err);
        }
    }

    #[test]
    fn defaults_warn_and_trust() {
        with_env(
            &[
                ("SPIRAL_DISPATCH_WARN_OVERRIDE", None),
                ("SPIRAL_DISPATCH_PARANOID", None),
            ],
            || {
                let cfg = DispatchConfig::from_env();
                assert!(cfg.warn_on_override);
                assert!(!cfg.paranoid_checks);
            },
        );
    }

    #[test]
    fn override_warning_can_be_silenced() {
        with_env(&[("SPIRAL_DISPATCH_WARN_OVERRIDE", Some("off"))], || {
            let cfg = DispatchConfig::from_env();
            assert!(!cfg.warn_on_override);
        });
    }

    #[test]
    fn paranoid_checks_opt_in() {
        with_env(&[("SPIRAL_DISPATCH_PARANOID", Some("1"))], || {
            let cfg = DispatchConfig::from_env();
            assert!(cfg.paranoid_checks);
        });
    }
}
