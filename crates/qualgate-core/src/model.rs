//! Execution plan data model.
//!
//! The plan is produced by an external configuration loader, mutated in place
//! by the variable replacement passes and pre-execution transforms (config
//! materialization, single-check filtering), and read-only once orchestration
//! starts.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::PathBuf;

use crate::error::ExecutionError;

/// Ordered key → value environment layer. Insertion order is preserved both
/// in memory and through serialization.
pub type Environment = IndexMap<String, String>;

/// Closed set of check statuses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Status {
    Error,
    Red,
    Yellow,
    Green,
    Skipped,
    Unanswered,
    Na,
}

impl Status {
    /// Fixed roll-up priority: lower value wins when two statuses combine.
    fn priority(self) -> u8 {
        match self {
            Status::Error => 0,
            Status::Red => 1,
            Status::Yellow => 2,
            Status::Green => 3,
            Status::Skipped => 4,
            Status::Unanswered => 5,
            Status::Na => 6,
        }
    }

    /// Combine two statuses, keeping the higher-priority one.
    ///
    /// Commutative and independent of evaluation order.
    pub fn combine(self, other: Status) -> Status {
        if other.priority() < self.priority() {
            other
        } else {
            self
        }
    }

    /// Parse an evaluator-reported status string. Only RED, GREEN and YELLOW
    /// are valid automation outcomes.
    pub fn from_evaluator(raw: &str) -> Option<Status> {
        match raw {
            "RED" => Some(Status::Red),
            "GREEN" => Some(Status::Green),
            "YELLOW" => Some(Status::Yellow),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Status::Error => "ERROR",
            Status::Red => "RED",
            Status::Yellow => "YELLOW",
            Status::Green => "GREEN",
            Status::Skipped => "SKIPPED",
            Status::Unanswered => "UNANSWERED",
            Status::Na => "NA",
        }
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Plan-level metadata carried through to the result document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Metadata {
    pub version: String,
}

/// Name and version of the quality gate configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Header {
    pub name: String,
    pub version: String,
}

/// A repository a check's applications may be fetched from.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Repository {
    pub name: String,
    #[serde(default)]
    pub url: String,
    /// Repository-type specific settings, order preserved.
    #[serde(default)]
    pub config: IndexMap<String, serde_json::Value>,
}

/// Chapter or requirement identity (id, title, text).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Section {
    pub id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub text: String,
}

/// Check identity (id, title).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CheckId {
    pub id: String,
    #[serde(default)]
    pub title: String,
}

/// Identity triple locating a check inside the chapter/requirement tree.
///
/// Ids are caller-supplied and unique only within their parent collection;
/// the composite (chapter, requirement, check) is the de facto unique key
/// used for directory naming and result placement.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Item {
    pub chapter: Section,
    pub requirement: Section,
    pub check: CheckId,
}

impl Item {
    /// Composite key used for directory naming and duplicate collapsing.
    pub fn composite_id(&self) -> String {
        format!(
            "{}_{}_{}",
            self.chapter.id, self.requirement.id, self.check.id
        )
    }
}

/// One external script execution within an autopilot.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Step {
    #[serde(default)]
    pub title: String,
    /// Non-empty and unique within the autopilot. Generated from the title
    /// (or step index) when the configuration does not supply one.
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub env: Environment,
    /// Names of config files to materialize into the step's work directory.
    #[serde(default)]
    pub config_files: Vec<String>,
    /// Script executed through `/bin/bash`.
    pub run: String,
    /// Ids of steps whose output this step consumes.
    #[serde(default)]
    pub depends: Vec<String>,
}

/// The final stage of an autopilot: inspects step outputs and reports
/// status, reason and a result set.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Evaluate {
    #[serde(default)]
    pub env: Environment,
    #[serde(default)]
    pub config_files: Vec<String>,
    pub run: String,
}

/// A named automation pipeline: dependency-ordered step levels plus one
/// evaluation stage.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Autopilot {
    pub name: String,
    #[serde(default)]
    pub env: Environment,
    /// Ordered list of step levels. Steps within one level are mutually
    /// independent; ordering across levels is the scheduling invariant.
    #[serde(default)]
    pub steps: Vec<Vec<Step>>,
    pub evaluate: Evaluate,
}

impl Autopilot {
    /// All steps across levels, flattened in level order.
    pub fn all_steps(&self) -> impl Iterator<Item = &Step> {
        self.steps.iter().flatten()
    }
}

/// A check answered by an autopilot.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AutopilotCheck {
    pub item: Item,
    pub autopilot: Autopilot,
    /// Check-local environment layer.
    #[serde(default)]
    pub env: Environment,
    /// Resolved application references (informational, recorded in results).
    #[serde(default)]
    pub app_refs: Vec<String>,
    /// Directories prepended to PATH and exposed as APPS.
    #[serde(default)]
    pub app_search_path: Vec<PathBuf>,
    /// Errors accumulated while building the check from configuration
    /// (unresolved autopilot, invalid app reference, unknown repository,
    /// dependency cycle). A check with any entry here is never executed.
    #[serde(default)]
    pub validation_errors: Vec<String>,
}

/// A check answered by a human, carried as a fixed status/reason pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManualCheck {
    pub item: Item,
    pub status: Status,
    #[serde(default)]
    pub reason: String,
}

/// Single post-run script, independent of any check's outcome.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Finalize {
    #[serde(default)]
    pub env: Environment,
    #[serde(default)]
    pub config_files: Vec<String>,
    pub run: String,
}

/// Root aggregate: everything one run executes.
///
/// Owned exclusively by one run. A check is exactly one of manual or
/// automated by construction: the two kinds are distinct types in distinct
/// lists, so "both" or "neither" cannot be represented.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecutionPlan {
    #[serde(default)]
    pub metadata: Metadata,
    #[serde(default)]
    pub header: Header,
    /// Default variables resolved by the `vars` scope.
    #[serde(default)]
    pub default_vars: IndexMap<String, String>,
    /// Global run environment, lowest-precedence layer for every script.
    #[serde(default)]
    pub env: Environment,
    #[serde(default)]
    pub repositories: Vec<Repository>,
    #[serde(default)]
    pub autopilot_checks: Vec<AutopilotCheck>,
    #[serde(default)]
    pub manual_checks: Vec<ManualCheck>,
    #[serde(default)]
    pub finalize: Option<Finalize>,
}

impl ExecutionPlan {
    /// Reduce the plan to a single (chapter, requirement, check) before
    /// execution. Checks not matching the triple are dropped.
    pub fn filter_single_check(&mut self, chapter: &str, requirement: &str, check: &str) {
        let matches = |item: &Item| {
            item.chapter.id == chapter && item.requirement.id == requirement && item.check.id == check
        };
        self.autopilot_checks.retain(|c| matches(&c.item));
        self.manual_checks.retain(|c| matches(&c.item));
    }
}

/// Maximum numeric-suffix attempts when disambiguating a generated step id.
const STEP_ID_ATTEMPTS: usize = 1000;

/// Derive a deterministic id slug from a step title: lowercase, alphanumerics
/// kept, every other run of characters collapsed to a single `-`.
fn sanitize_title(title: &str) -> String {
    let mut out = String::with_capacity(title.len());
    let mut dash_pending = false;
    for c in title.chars() {
        if c.is_ascii_alphanumeric() {
            if dash_pending && !out.is_empty() {
                out.push('-');
            }
            dash_pending = false;
            out.push(c.to_ascii_lowercase());
        } else {
            dash_pending = true;
        }
    }
    out
}

/// Fill in missing step ids for one autopilot, deterministically.
///
/// Supplied ids are kept as-is. Generated ids come from the sanitized title,
/// or from the 1-based step index when no usable title exists, with numeric
/// suffixes (`-2`, `-3`, ...) for collisions. Exhausting the suffix bound is
/// a hard error.
pub fn assign_step_ids(autopilot: &mut Autopilot) -> Result<(), ExecutionError> {
    let mut taken: HashSet<String> = autopilot
        .all_steps()
        .filter(|s| !s.id.is_empty())
        .map(|s| s.id.clone())
        .collect();

    let mut index = 0usize;
    for level in &mut autopilot.steps {
        for step in level {
            index += 1;
            if !step.id.is_empty() {
                continue;
            }
            let base = {
                let slug = sanitize_title(&step.title);
                if slug.is_empty() {
                    format!("step-{}", index)
                } else {
                    slug
                }
            };
            let mut candidate = base.clone();
            let mut attempt = 1usize;
            while taken.contains(&candidate) {
                attempt += 1;
                if attempt > STEP_ID_ATTEMPTS {
                    return Err(ExecutionError::StepIdExhausted {
                        title: step.title.clone(),
                        attempts: STEP_ID_ATTEMPTS,
                    });
                }
                candidate = format!("{}-{}", base, attempt);
            }
            taken.insert(candidate.clone());
            step.id = candidate;
        }
    }
    Ok(())
}

/// Validate that step ids within one autopilot are non-empty and unique.
pub fn validate_step_ids(autopilot: &Autopilot) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut errors = Vec::new();
    for step in autopilot.all_steps() {
        if step.id.is_empty() {
            errors.push(format!(
                "autopilot '{}' has a step without an id (title: '{}')",
                autopilot.name, step.title
            ));
        } else if !seen.insert(step.id.as_str()) {
            errors.push(format!(
                "autopilot '{}' has duplicate step id '{}'",
                autopilot.name, step.id
            ));
        }
    }
    errors
}
