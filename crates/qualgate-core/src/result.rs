//! Per-check run records produced by the executors and consumed by the
//! result aggregator.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::model::{Item, Status};

/// How a check was answered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckType {
    Manual,
    Automation,
}

/// Record of one executed step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepRun {
    pub id: String,
    #[serde(default)]
    pub title: String,
    pub work_dir: PathBuf,
    pub output_dir: PathBuf,
    /// Ordered `files` directories of this step's dependencies.
    #[serde(default)]
    pub input_dirs: Vec<PathBuf>,
    pub exit_code: i32,
    #[serde(default)]
    pub logs: Vec<String>,
    /// Path of the produced result file, when the step wrote one.
    #[serde(default)]
    pub result_file: Option<PathBuf>,
}

/// Record of one autopilot run: the steps actually executed, in order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutopilotRun {
    pub name: String,
    #[serde(default)]
    pub steps: Vec<StepRun>,
}

/// One criterion reported by an evaluator.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EvalResult {
    #[serde(default)]
    pub criterion: String,
    #[serde(default)]
    pub fulfilled: bool,
    #[serde(default)]
    pub justification: String,
    /// Flattened metadata: nested objects re-serialized to JSON text.
    #[serde(default)]
    pub metadata: IndexMap<String, String>,
}

/// Outcome of a check's evaluation stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Evaluation {
    pub status: Status,
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub results: Vec<EvalResult>,
    #[serde(default)]
    pub logs: Vec<String>,
    pub exit_code: i32,
}

impl Evaluation {
    /// Synthetic evaluation for checks that never ran an evaluator.
    pub fn synthetic(status: Status, reason: impl Into<String>) -> Self {
        Self {
            status,
            reason: reason.into(),
            results: Vec::new(),
            logs: Vec::new(),
            exit_code: 0,
        }
    }
}

/// Completed result of one manual or automated check.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckResult {
    pub item: Item,
    #[serde(rename = "type")]
    pub check_type: CheckType,
    /// Autopilot run records; empty for manual checks.
    #[serde(default)]
    pub autopilots: Vec<AutopilotRun>,
    /// Resolved application references of the executed check.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub app_refs: Vec<String>,
    pub evaluation: Evaluation,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{CheckId, Section};

    #[test]
    fn test_check_type_serialization() {
        assert_eq!(
            serde_json::to_string(&CheckType::Automation).unwrap(),
            "\"automation\""
        );
        assert_eq!(serde_json::to_string(&CheckType::Manual).unwrap(), "\"manual\"");
    }

    #[test]
    fn test_check_result_round_trips() {
        let result = CheckResult {
            item: Item {
                chapter: Section {
                    id: "1".to_string(),
                    title: "Chapter".to_string(),
                    text: String::new(),
                },
                requirement: Section {
                    id: "1".to_string(),
                    ..Default::default()
                },
                check: CheckId {
                    id: "1".to_string(),
                    title: "check".to_string(),
                },
            },
            check_type: CheckType::Automation,
            autopilots: vec![AutopilotRun {
                name: "ap".to_string(),
                steps: vec![StepRun {
                    id: "fetch".to_string(),
                    title: String::new(),
                    work_dir: PathBuf::from("/w"),
                    output_dir: PathBuf::from("/o"),
                    input_dirs: vec![],
                    exit_code: 0,
                    logs: vec!["line".to_string()],
                    result_file: None,
                }],
            }],
            app_refs: vec!["scanner@1.2".to_string()],
            evaluation: Evaluation::synthetic(Status::Green, "ok"),
        };
        let json = serde_json::to_string(&result).unwrap();
        let back: CheckResult = serde_json::from_str(&json).unwrap();
        assert_eq!(back.autopilots[0].steps[0].id, "fetch");
        assert_eq!(back.app_refs, vec!["scanner@1.2"]);
        assert_eq!(back.evaluation.status, Status::Green);
    }
}
