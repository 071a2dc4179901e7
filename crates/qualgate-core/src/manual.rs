//! Manual check execution.
//!
//! Manual answers carry their status and reason directly in the plan, so
//! "executing" one is a pure transformation into a [`CheckResult`] with a
//! synthetic evaluation and no autopilot runs.

use crate::logging::CheckLogger;
use crate::model::ManualCheck;
use crate::result::{CheckResult, CheckType, Evaluation};

pub fn execute_manual_check(check: &ManualCheck, logger: &mut CheckLogger) -> CheckResult {
    logger.info(&format!(
        "manual check '{}' answered {}",
        check.item.composite_id(),
        check.status
    ));
    CheckResult {
        item: check.item.clone(),
        check_type: CheckType::Manual,
        autopilots: Vec::new(),
        app_refs: Vec::new(),
        evaluation: Evaluation::synthetic(check.status, check.reason.clone()),
    }
}
