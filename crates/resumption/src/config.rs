//! Naming configuration for synthesized units.

use serde::{Deserialize, Serialize};

/// Default prefix of synthesized unit names.
pub const DEFAULT_NAME_PREFIX: &str = "__resume_in";

/// Default prefix of stack-slot parameters.
pub const DEFAULT_STACK_PREFIX: &str = "___stack";

/// Default prefix of locals holding re-entered resources.
pub const DEFAULT_CONTEXT_PREFIX: &str = "___context_manager_";

/// Default global holding the mode-stack helpers.
pub const DEFAULT_MODE_STACK_HELPER: &str = "__import_runtime_utils";

/// Default attribute of the helper that restores a saved mode stack.
pub const DEFAULT_MODE_STACK_RESTORE: &str = "set_mode_stack";

/// Names used when synthesizing resume units.
///
/// Use `ResumeConfig::default()` for the conventional names, or adjust them with
/// the builder methods.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResumeConfig {
    /// Prefix of synthesized unit names (`<prefix>_<name>_at_<line>`).
    pub name_prefix: String,
    /// Prefix of stack-slot parameters (`<prefix><i>`).
    pub stack_prefix: String,
    /// Prefix of locals introduced by try/finally re-entry.
    pub context_prefix: String,
    /// Global holding the mode-stack helpers.
    pub mode_stack_helper: String,
    /// Helper attribute that restores a saved mode stack.
    pub mode_stack_restore: String,
}

impl Default for ResumeConfig {
    fn default() -> Self {
        Self {
            name_prefix: DEFAULT_NAME_PREFIX.to_owned(),
            stack_prefix: DEFAULT_STACK_PREFIX.to_owned(),
            context_prefix: DEFAULT_CONTEXT_PREFIX.to_owned(),
            mode_stack_helper: DEFAULT_MODE_STACK_HELPER.to_owned(),
            mode_stack_restore: DEFAULT_MODE_STACK_RESTORE.to_owned(),
        }
    }
}

impl ResumeConfig {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the prefix of synthesized unit names.
    #[must_use]
    pub fn name_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.name_prefix = prefix.into();
        self
    }

    /// Sets the prefix of stack-slot parameters.
    #[must_use]
    pub fn stack_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.stack_prefix = prefix.into();
        self
    }

    /// Sets the prefix of locals introduced by try/finally re-entry.
    #[must_use]
    pub fn context_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.context_prefix = prefix.into();
        self
    }

    /// Sets the global and attribute used to restore a saved mode stack.
    #[must_use]
    pub fn mode_stack_restore(mut self, helper: impl Into<String>, restore: impl Into<String>) -> Self {
        self.mode_stack_helper = helper.into();
        self.mode_stack_restore = restore.into();
        self
    }

    /// Name of the continuation of `name` resuming at `line`.
    #[must_use]
    pub fn resume_name(&self, name: &str, line: u32) -> String {
        format!("{}_{name}_at_{line}", self.name_prefix)
    }

    /// Qualified name of the continuation: only the last dotted component is renamed.
    #[must_use]
    pub fn resume_qualname(&self, qualname: &str, line: u32) -> String {
        match qualname.rsplit_once('.') {
            Some((scope, name)) => format!("{scope}.{}", self.resume_name(name, line)),
            None => self.resume_name(qualname, line),
        }
    }

    /// Parameter receiving stack slot `index`.
    #[must_use]
    pub fn stack_slot(&self, index: usize) -> String {
        format!("{}{index}", self.stack_prefix)
    }

    /// The `serial`-th candidate local for the resource re-entered at `stack_index`.
    #[must_use]
    pub fn context_local(&self, stack_index: usize, serial: usize) -> String {
        format!("{}{stack_index}_{serial}", self.context_prefix)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn qualname_keeps_enclosing_scope() {
        let config = ResumeConfig::default();
        assert_eq!(config.resume_name("f", 12), "__resume_in_f_at_12");
        assert_eq!(config.resume_qualname("Outer.f", 12), "Outer.__resume_in_f_at_12");
        assert_eq!(config.resume_qualname("a.b.f", 3), "a.b.__resume_in_f_at_3");
        assert_eq!(config.resume_qualname("f", 3), "__resume_in_f_at_3");
    }

    #[test]
    fn builder_overrides_prefixes() {
        let config = ResumeConfig::new().name_prefix("cont").stack_prefix("s");
        assert_eq!(config.resume_name("g", 1), "cont_g_at_1");
        assert_eq!(config.stack_slot(2), "s2");
        assert_eq!(config.context_local(1, 0), "___context_manager_1_0");
    }
}
