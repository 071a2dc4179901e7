//! Result aggregation.
//!
//! Folds completed check results into the Chapter → Requirement → Check
//! tree, rolls statuses up at every level with the fixed priority order
//! (ERROR > RED > YELLOW > GREEN > SKIPPED > UNANSWERED > NA) and computes
//! run statistics. Key order in the emitted document follows first
//! insertion.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::model::{Header, Metadata, Status};
use crate::result::{AutopilotRun, CheckResult, CheckType, Evaluation};

/// Identity of one run, stamped into the result document by the caller.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunInfo {
    pub run_id: String,
    pub date: String,
    pub tool_version: String,
    /// SHA-256 hex digest of the serialized plan the run executed.
    pub plan_digest: String,
}

impl RunInfo {
    /// Stamp a fresh run identity from the serialized plan bytes.
    pub fn generate(plan_bytes: &[u8]) -> Self {
        use sha2::Digest;
        Self {
            run_id: uuid::Uuid::new_v4().to_string(),
            date: chrono::Utc::now().to_rfc3339(),
            tool_version: crate::VERSION.to_string(),
            plan_digest: hex::encode(sha2::Sha256::digest(plan_bytes)),
        }
    }
}

/// The complete result document written at the end of a run.
#[derive(Debug, Serialize, Deserialize)]
pub struct RunDocument {
    pub metadata: Metadata,
    pub header: Header,
    pub run: RunInfo,
    pub overall_status: Status,
    pub statistics: Statistics,
    pub chapters: IndexMap<String, ChapterNode>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ChapterNode {
    pub title: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub text: String,
    pub status: Status,
    pub requirements: IndexMap<String, RequirementNode>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RequirementNode {
    pub title: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub text: String,
    pub status: Status,
    pub checks: IndexMap<String, CheckNode>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CheckNode {
    pub title: String,
    pub status: Status,
    #[serde(rename = "type")]
    pub check_type: CheckType,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub autopilots: Vec<AutopilotRun>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub app_refs: Vec<String>,
    pub evaluation: Evaluation,
}

/// Running counts plus derived percentages, rounded to two decimals.
/// Percentages stay zero while no checks have been counted.
#[derive(Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct Statistics {
    pub total_checks: u32,
    pub automated_checks: u32,
    pub manual_checks: u32,
    pub skipped_checks: u32,
    pub unanswered_checks: u32,
    pub automation_percent: f64,
    pub completion_percent: f64,
}

#[derive(Debug, Default)]
pub struct Aggregator {
    chapters: IndexMap<String, ChapterNode>,
}

impl Aggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert one completed check. The first occurrence of a chapter or
    /// requirement id fixes its title/text; a duplicate composite
    /// (chapter, requirement, check) id is ignored entirely.
    pub fn insert(&mut self, result: CheckResult) {
        let item = &result.item;
        let chapter = self
            .chapters
            .entry(item.chapter.id.clone())
            .or_insert_with(|| ChapterNode {
                title: item.chapter.title.clone(),
                text: item.chapter.text.clone(),
                status: result.evaluation.status,
                requirements: IndexMap::new(),
            });
        let requirement = chapter
            .requirements
            .entry(item.requirement.id.clone())
            .or_insert_with(|| RequirementNode {
                title: item.requirement.title.clone(),
                text: item.requirement.text.clone(),
                status: result.evaluation.status,
                checks: IndexMap::new(),
            });
        if requirement.checks.contains_key(&item.check.id) {
            return;
        }
        requirement.checks.insert(
            item.check.id.clone(),
            CheckNode {
                title: item.check.title.clone(),
                status: result.evaluation.status,
                check_type: result.check_type,
                autopilots: result.autopilots,
                app_refs: result.app_refs,
                evaluation: result.evaluation,
            },
        );
    }

    /// Roll statuses up and assemble the final document.
    pub fn finish(
        mut self,
        metadata: Metadata,
        header: Header,
        run: RunInfo,
    ) -> RunDocument {
        let mut overall = None;
        for chapter in self.chapters.values_mut() {
            let mut chapter_status = None;
            for requirement in chapter.requirements.values_mut() {
                let mut requirement_status = None;
                for check in requirement.checks.values() {
                    requirement_status = Some(combine_into(requirement_status, check.status));
                }
                if let Some(status) = requirement_status {
                    requirement.status = status;
                    chapter_status = Some(combine_into(chapter_status, status));
                }
            }
            if let Some(status) = chapter_status {
                chapter.status = status;
                overall = Some(combine_into(overall, status));
            }
        }

        let statistics = compute_statistics(&self.chapters);
        RunDocument {
            metadata,
            header,
            run,
            // An empty run has answered nothing.
            overall_status: overall.unwrap_or(Status::Unanswered),
            statistics,
            chapters: self.chapters,
        }
    }
}

fn combine_into(current: Option<Status>, next: Status) -> Status {
    match current {
        Some(status) => status.combine(next),
        None => next,
    }
}

fn compute_statistics(chapters: &IndexMap<String, ChapterNode>) -> Statistics {
    let mut stats = Statistics::default();
    let checks = chapters
        .values()
        .flat_map(|c| c.requirements.values())
        .flat_map(|r| r.checks.values());
    for check in checks {
        stats.total_checks += 1;
        match check.check_type {
            CheckType::Automation => stats.automated_checks += 1,
            CheckType::Manual => stats.manual_checks += 1,
        }
        match check.status {
            Status::Skipped => stats.skipped_checks += 1,
            Status::Unanswered => stats.unanswered_checks += 1,
            _ => {}
        }
    }
    if stats.total_checks > 0 {
        let total = f64::from(stats.total_checks);
        stats.automation_percent = round2(f64::from(stats.automated_checks) / total * 100.0);
        stats.completion_percent =
            round2(f64::from(stats.total_checks - stats.unanswered_checks) / total * 100.0);
    }
    stats
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Fold a full run into a result document.
pub fn aggregate(
    results: Vec<CheckResult>,
    metadata: Metadata,
    header: Header,
    run: RunInfo,
) -> RunDocument {
    let mut aggregator = Aggregator::new();
    for result in results {
        aggregator.insert(result);
    }
    aggregator.finish(metadata, header, run)
}
