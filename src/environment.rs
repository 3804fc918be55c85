//! Task environment: the variable mapping every step runs under, plus the
//! set of sensitive values that must never leave the agent unmasked.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};

/// Shared handle to the sensitive-value set, cloned into every log sink.
pub type SensitiveValues = Arc<RwLock<HashSet<String>>>;

#[derive(Clone, Default)]
pub struct Environment {
    items: HashMap<String, String>,
    sensitive: SensitiveValues,
}

impl Environment {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lookup(&self, name: &str) -> Option<String> {
        self.items.get(name).cloned()
    }

    /// Like `lookup`, but with an empty-string default.
    pub fn get(&self, name: &str) -> String {
        self.lookup(name).unwrap_or_default()
    }

    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.items.insert(name.into(), value.into());
    }

    pub fn merge(&mut self, items: HashMap<String, String>, mark_sensitive: bool) {
        if mark_sensitive {
            self.add_sensitive_values(items.values().cloned());
        }
        self.items.extend(items);
    }

    pub fn items(&self) -> &HashMap<String, String> {
        &self.items
    }

    /// Shell-style `${VAR}` and `$VAR` substitution against this mapping
    /// only; the ambient process environment is never consulted.
    pub fn expand_text(&self, text: &str) -> String {
        shellexpand::env_with_context_no_errors(text, |var| self.items.get(var).cloned())
            .into_owned()
    }

    pub fn add_sensitive_values<I>(&mut self, values: I)
    where
        I: IntoIterator<Item = String>,
    {
        let mut sensitive = match self.sensitive.write() {
            Ok(guard) => guard,
            Err(poisoned) => {
                tracing::warn!("sensitive-values lock was poisoned, recovering");
                poisoned.into_inner()
            }
        };
        for value in values {
            if !value.is_empty() {
                sensitive.insert(value);
            }
        }
    }

    /// Handle shared with log sinks so later additions are retroactively
    /// honoured by every filter.
    pub fn sensitive_values(&self) -> SensitiveValues {
        Arc::clone(&self.sensitive)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn get_defaults_to_empty_string() {
        let env = Environment::new();
        assert_eq!(env.get("MISSING"), "");
        assert!(env.lookup("MISSING").is_none());
    }

    #[test]
    fn merge_overwrites_and_tracks_sensitivity() {
        let mut env = Environment::new();
        env.set("A", "old");

        let mut incoming = HashMap::new();
        incoming.insert("A".to_string(), "new".to_string());
        incoming.insert("TOKEN".to_string(), "hunter2".to_string());
        env.merge(incoming, true);

        assert_eq!(env.get("A"), "new");
        let sensitive = env.sensitive_values();
        let guard = sensitive.read().unwrap();
        assert!(guard.contains("hunter2"));
        assert!(guard.contains("new"));
    }

    #[test]
    fn expand_text_substitutes_both_syntaxes() {
        let mut env = Environment::new();
        env.set("CIRRUS_WORKING_DIR", "/tmp/build");
        env.set("NAME", "agent");

        assert_eq!(
            env.expand_text("${CIRRUS_WORKING_DIR}/out/$NAME.txt"),
            "/tmp/build/out/agent.txt"
        );
    }

    #[test]
    fn expand_text_ignores_process_environment() {
        std::env::set_var("CIRRUS_AGENT_TEST_ONLY_VAR", "leaked");
        let env = Environment::new();
        assert_eq!(
            env.expand_text("$CIRRUS_AGENT_TEST_ONLY_VAR"),
            "$CIRRUS_AGENT_TEST_ONLY_VAR"
        );
    }

    #[test]
    fn empty_values_are_never_marked_sensitive() {
        let mut env = Environment::new();
        env.add_sensitive_values(vec!["".to_string(), "real".to_string()]);
        let sensitive = env.sensitive_values();
        let guard = sensitive.read().unwrap();
        assert_eq!(guard.len(), 1);
        assert!(guard.contains("real"));
    }
}
