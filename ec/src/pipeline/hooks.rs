//! Pre/post step hooks

use eyre::{Result, eyre};
use historystore::Evaluation;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

use super::context::PipelineContext;
use crate::error::{CoordError, CoordResult};

/// What a hook wants the runner to do next
#[derive(Debug, Clone, PartialEq)]
pub enum HookOutcome {
    /// Carry on with the (possibly modified) context
    Continue,
    /// Stop the chain and report this payload as the result
    Halt { payload: Evaluation, code: i32 },
}

/// Logic run before or after a step
///
/// A hook may mutate the context in place. Returning an error fails the
/// sample; returning `Halt` ends the chain without an error.
pub trait Hook: Send + Sync {
    fn name(&self) -> &str;

    fn call(&self, ctx: &mut PipelineContext) -> Result<HookOutcome>;
}

/// Configured hook
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum HookConfig {
    /// Halt with `value` if the step left `file` in its directory
    HaltIfExists {
        file: String,
        value: Evaluation,
        #[serde(default)]
        code: i32,
    },
    /// Derive setting `to` from setting or parameter `from`
    CopySetting { from: String, to: String },
    /// A hook registered in code under `name`
    Named { name: String },
}

/// Halts the chain when a marker file exists
#[derive(Debug, Clone)]
pub struct HaltIfExists {
    pub file: String,
    pub value: Evaluation,
    pub code: i32,
}

impl Hook for HaltIfExists {
    fn name(&self) -> &str {
        "halt-if-exists"
    }

    fn call(&self, ctx: &mut PipelineContext) -> Result<HookOutcome> {
        let marker = ctx.current_dir().join(&self.file);
        debug!(?marker, "HaltIfExists::call: called");
        if marker.exists() {
            info!(sample_id = ctx.sample_id, file = %self.file, "Marker found, halting pipeline");
            return Ok(HookOutcome::Halt {
                payload: self.value.clone(),
                code: self.code,
            });
        }
        Ok(HookOutcome::Continue)
    }
}

/// Copies one setting (or parameter) into another setting
#[derive(Debug, Clone)]
pub struct CopySetting {
    pub from: String,
    pub to: String,
}

impl Hook for CopySetting {
    fn name(&self) -> &str {
        "copy-setting"
    }

    fn call(&self, ctx: &mut PipelineContext) -> Result<HookOutcome> {
        debug!(from = %self.from, to = %self.to, "CopySetting::call: called");
        let value = ctx
            .lookup(&self.from)
            .ok_or_else(|| eyre!("no setting or parameter named '{}'", self.from))?;
        ctx.settings.insert(self.to.clone(), value);
        Ok(HookOutcome::Continue)
    }
}

/// Hooks registered in code, looked up by name from configuration
#[derive(Clone, Default)]
pub struct HookRegistry {
    hooks: HashMap<String, Arc<dyn Hook>>,
}

impl HookRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `hook` under `name`, replacing any previous entry
    pub fn register(&mut self, name: impl Into<String>, hook: Arc<dyn Hook>) {
        let name = name.into();
        debug!(%name, "HookRegistry::register: called");
        self.hooks.insert(name, hook);
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.hooks.keys().map(String::as_str).collect();
        names.sort();
        names
    }

    /// Turn a configured hook into a callable one
    pub fn resolve(&self, config: &HookConfig) -> CoordResult<Arc<dyn Hook>> {
        debug!(?config, "HookRegistry::resolve: called");
        match config {
            HookConfig::HaltIfExists { file, value, code } => {
                if file.trim().is_empty() {
                    return Err(CoordError::config("halt-if-exists needs a file name"));
                }
                Ok(Arc::new(HaltIfExists {
                    file: file.clone(),
                    value: value.clone(),
                    code: *code,
                }))
            }
            HookConfig::CopySetting { from, to } => Ok(Arc::new(CopySetting {
                from: from.clone(),
                to: to.clone(),
            })),
            HookConfig::Named { name } => self.hooks.get(name).cloned().ok_or_else(|| {
                CoordError::config(format!(
                    "unknown hook '{}' (registered: {})",
                    name,
                    self.names().join(", ")
                ))
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use tempfile::tempdir;

    fn context(dir: &std::path::Path) -> PipelineContext {
        let params = BTreeMap::from([("gap".to_string(), 0.01)]);
        PipelineContext::new(0, 0, params, BTreeMap::new(), dir)
    }

    #[test]
    fn test_halt_if_exists() {
        let temp = tempdir().unwrap();
        let mut ctx = context(temp.path());
        let hook = HaltIfExists {
            file: "LOST".to_string(),
            value: Evaluation::Scalar(7.0),
            code: 2,
        };

        assert_eq!(hook.call(&mut ctx).unwrap(), HookOutcome::Continue);
        std::fs::write(temp.path().join("LOST"), "").unwrap();
        assert_eq!(
            hook.call(&mut ctx).unwrap(),
            HookOutcome::Halt {
                payload: Evaluation::Scalar(7.0),
                code: 2
            }
        );
    }

    #[test]
    fn test_copy_setting_from_parameter() {
        let temp = tempdir().unwrap();
        let mut ctx = context(temp.path());
        let hook = CopySetting {
            from: "gap".to_string(),
            to: "gap_copy".to_string(),
        };
        hook.call(&mut ctx).unwrap();
        assert_eq!(ctx.settings["gap_copy"], serde_json::json!(0.01));

        let missing = CopySetting {
            from: "nope".to_string(),
            to: "x".to_string(),
        };
        assert!(missing.call(&mut ctx).is_err());
    }

    #[test]
    fn test_registry_resolves_named_hooks() {
        let mut registry = HookRegistry::new();
        registry.register(
            "copy",
            Arc::new(CopySetting {
                from: "a".to_string(),
                to: "b".to_string(),
            }),
        );

        let hook = registry
            .resolve(&HookConfig::Named {
                name: "copy".to_string(),
            })
            .unwrap();
        assert_eq!(hook.name(), "copy-setting");

        let err = registry
            .resolve(&HookConfig::Named {
                name: "ghost".to_string(),
            })
            .err()
            .unwrap();
        assert!(matches!(err, CoordError::Config(_)));
    }

    #[test]
    fn test_hook_config_yaml() {
        let config: HookConfig = serde_yaml::from_str("type: copy-setting\nfrom: a\nto: b\n").unwrap();
        assert_eq!(
            config,
            HookConfig::CopySetting {
                from: "a".to_string(),
                to: "b".to_string()
            }
        );
    }
}
