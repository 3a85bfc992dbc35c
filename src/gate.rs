//! Process-wide switch deciding whether queries are captured and reported.

use std::ffi::OsStr;

/// Name of the variable read by [`EnvGate::default`].
pub const DEFAULT_DEBUG_VAR: &str = "APP_DEBUG";

/// Decides whether debugging is active.
///
/// Implementations are consulted at request start and again before the
/// response is decorated, so they must reflect the current configuration
/// rather than a value cached at startup.
pub trait ActivationGate: Send + Sync {
    fn is_active(&self) -> bool;
}

/// Reads an environment variable on every call.
///
/// `1`, `true`, `yes` and `on` (case-insensitive, optionally wrapped in
/// parentheses) are active. Anything else, including a missing or
/// non-UTF-8 value, is inactive.
#[derive(Debug, Clone)]
pub struct EnvGate {
    var: String,
}

impl EnvGate {
    pub fn new(var: impl Into<String>) -> Self {
        Self { var: var.into() }
    }

    pub fn var(&self) -> &str {
        &self.var
    }
}

impl Default for EnvGate {
    fn default() -> Self {
        Self::new(DEFAULT_DEBUG_VAR)
    }
}

impl ActivationGate for EnvGate {
    fn is_active(&self) -> bool {
        std::env::var_os(&self.var)
            .map(|value| parse_flag(&value))
            .unwrap_or(false)
    }
}

/// A fixed answer.
#[derive(Debug, Clone, Copy)]
pub struct StaticGate(pub bool);

impl ActivationGate for StaticGate {
    fn is_active(&self) -> bool {
        self.0
    }
}

impl<F> ActivationGate for F
where
    F: Fn() -> bool + Send + Sync,
{
    fn is_active(&self) -> bool {
        self()
    }
}

fn parse_flag(value: &OsStr) -> bool {
    let Some(value) = value.to_str() else {
        return false;
    };
    let value = value.trim();
    let value = value
        .strip_prefix('(')
        .and_then(|v| v.strip_suffix(')'))
        .unwrap_or(value);

    matches!(
        value.to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_parse_flag() {
        for on in ["1", "true", "TRUE", " yes ", "On", "(true)"] {
            assert!(parse_flag(OsStr::new(on)), "{on:?} should be active");
        }
        for off in ["", "0", "false", "(false)", "no", "off", "null", "debug"] {
            assert!(!parse_flag(OsStr::new(off)), "{off:?} should be inactive");
        }
    }

    #[test]
    fn test_env_gate_missing_var_is_inactive() {
        let gate = EnvGate::new("SEA_ORM_DEBUGGER_TEST_UNSET_VARIABLE");
        assert!(!gate.is_active());
    }

    #[test]
    fn test_env_gate_reads_fresh_value() {
        let gate = EnvGate::new("SEA_ORM_DEBUGGER_TEST_GATE");
        std::env::set_var(gate.var(), "true");
        assert!(gate.is_active());
        std::env::set_var(gate.var(), "false");
        assert!(!gate.is_active());
        std::env::remove_var(gate.var());
        assert!(!gate.is_active());
    }

    #[test]
    fn test_closure_gate_follows_switch() {
        let flag = Arc::new(AtomicBool::new(false));
        let switch = flag.clone();
        let gate = move || switch.load(Ordering::Relaxed);

        assert!(!gate.is_active());
        flag.store(true, Ordering::Relaxed);
        assert!(gate.is_active());
    }
}
