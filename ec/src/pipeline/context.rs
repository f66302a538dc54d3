//! Shared per-sample pipeline context

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::debug;

use super::step::StepState;

/// Data format of a step artifact
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ArtifactFormat {
    /// Self-describing data set (elegant)
    Sdds,
    /// HDF5 particle/statistics output (opal)
    Hdf5,
    /// Genesis output file
    Genesis,
    /// Plain text / whitespace separated numbers
    Text,
    Json,
}

impl fmt::Display for ArtifactFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Sdds => "sdds",
            Self::Hdf5 => "hdf5",
            Self::Genesis => "genesis",
            Self::Text => "text",
            Self::Json => "json",
        };
        write!(f, "{}", s)
    }
}

/// A file produced by a step
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Artifact {
    pub path: PathBuf,
    pub format: ArtifactFormat,
}

/// What happened to one step of this sample
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StepRecord {
    pub name: String,
    pub state: StepState,
    pub elapsed_ms: u64,
}

/// Mutable state threaded through the steps of one sample
///
/// Hooks may change `settings`; only the output of the immediately
/// preceding step is carried forward.
#[derive(Debug, Clone)]
pub struct PipelineContext {
    pub sample_id: u64,
    pub worker: u32,
    /// Named parameter values in native units
    pub params: BTreeMap<String, f64>,
    /// Non-optimized settings; hooks may add or overwrite entries
    pub settings: BTreeMap<String, serde_json::Value>,
    /// Per-sample working directory
    pub run_dir: PathBuf,
    /// Directory of the current (or last) step
    pub step_dir: Option<PathBuf>,
    /// Converted output of the preceding step
    pub previous: Option<Artifact>,
    pub steps: Vec<StepRecord>,
}

impl PipelineContext {
    pub fn new(
        sample_id: u64,
        worker: u32,
        params: BTreeMap<String, f64>,
        settings: BTreeMap<String, serde_json::Value>,
        run_dir: impl Into<PathBuf>,
    ) -> Self {
        let run_dir = run_dir.into();
        debug!(sample_id, worker, ?run_dir, "PipelineContext::new: called");
        Self {
            sample_id,
            worker,
            params,
            settings,
            run_dir,
            step_dir: None,
            previous: None,
            steps: Vec::new(),
        }
    }

    /// Look up a setting, falling back to a parameter of the same name
    pub fn lookup(&self, name: &str) -> Option<serde_json::Value> {
        self.settings
            .get(name)
            .cloned()
            .or_else(|| self.params.get(name).map(|v| serde_json::json!(v)))
    }

    /// Directory of the current step, or the sample directory before any step ran
    pub fn current_dir(&self) -> &Path {
        self.step_dir.as_deref().unwrap_or(&self.run_dir)
    }

    /// Data visible to input templates and templated arguments
    pub fn template_data(&self) -> serde_json::Value {
        serde_json::json!({
            "params": self.params,
            "settings": self.settings,
            "sample_id": self.sample_id,
            "worker": self.worker,
            "run_dir": self.run_dir,
            "step_dir": self.current_dir(),
            "previous_output": self.previous.as_ref().map(|a| &a.path),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context() -> PipelineContext {
        let params = BTreeMap::from([("k1".to_string(), 2.5)]);
        let settings = BTreeMap::from([("energy".to_string(), serde_json::json!(6.0))]);
        PipelineContext::new(7, 0, params, settings, "/tmp/run")
    }

    #[test]
    fn test_lookup_prefers_settings() {
        let mut ctx = context();
        assert_eq!(ctx.lookup("k1"), Some(serde_json::json!(2.5)));
        ctx.settings.insert("k1".to_string(), serde_json::json!("override"));
        assert_eq!(ctx.lookup("k1"), Some(serde_json::json!("override")));
        assert_eq!(ctx.lookup("missing"), None);
    }

    #[test]
    fn test_template_data_first_step_has_no_previous() {
        let data = context().template_data();
        assert_eq!(data["sample_id"], 7);
        assert_eq!(data["params"]["k1"], 2.5);
        assert_eq!(data["settings"]["energy"], 6.0);
        assert!(data["previous_output"].is_null());
        assert_eq!(data["step_dir"], "/tmp/run");
    }
}
