//! Concurrent run orchestration.
//!
//! Launches two independent task groups, one per check kind, with one task
//! per check. Tasks share no mutable state; each gets its own redacting
//! logger whose buffer is flushed only after the task completes, so console
//! output from concurrent checks never interleaves.
//!
//! Group collection is all-or-nothing: a single failed task discards the
//! whole group's results and surfaces one joined error. The two groups fail
//! or succeed independently of each other.

use std::path::Path;
use std::sync::Arc;

use tokio::task::JoinSet;
use tracing::info;

use crate::error::{ExecutionError, ExecutionResult, RunError};
use crate::executor::CheckExecutor;
use crate::fsutil;
use crate::logging::CheckLogger;
use crate::manual::execute_manual_check;
use crate::model::{Environment, ExecutionPlan, Finalize};
use crate::replacer::{replace_config_content, Sources};
use crate::result::CheckResult;
use crate::runner::{ScriptOutput, ScriptRunner};

/// Everything one run produced: per-check results plus the combined,
/// already-redacted log buffer of all check tasks.
///
/// A group that failed contributes no results; its joined error lands in
/// `group_errors` while the other group's results stay intact.
#[derive(Debug, Default)]
pub struct RunResult {
    pub results: Vec<CheckResult>,
    pub log_lines: Vec<String>,
    pub group_errors: Vec<RunError>,
}

pub struct Orchestrator {
    pub executor: Arc<CheckExecutor>,
}

impl Orchestrator {
    pub fn new(executor: CheckExecutor) -> Self {
        Self {
            executor: Arc::new(executor),
        }
    }

    /// Run every check in the plan. The plan must already be prepared
    /// (placeholders replaced, step ids assigned, levels computed).
    ///
    /// The two task groups fail or succeed independently: a failed group is
    /// recorded in [`RunResult::group_errors`] and the surviving group still
    /// contributes every result.
    pub async fn run(&self, plan: &ExecutionPlan) -> RunResult {
        let autopilot = self.run_autopilot_group(plan);
        let manual = self.run_manual_group(plan);
        let (autopilot, manual) = tokio::join!(autopilot, manual);

        let mut run = RunResult::default();
        match autopilot {
            Ok((mut results, mut log_lines)) => {
                run.results.append(&mut results);
                run.log_lines.append(&mut log_lines);
            }
            Err(err) => run.group_errors.push(err),
        }
        match manual {
            Ok((mut results, mut log_lines)) => {
                run.results.append(&mut results);
                run.log_lines.append(&mut log_lines);
            }
            Err(err) => run.group_errors.push(err),
        }
        info!(
            checks = run.results.len(),
            failed_groups = run.group_errors.len(),
            "run complete"
        );
        run
    }

    async fn run_autopilot_group(
        &self,
        plan: &ExecutionPlan,
    ) -> Result<(Vec<CheckResult>, Vec<String>), RunError> {
        let mut set = JoinSet::new();
        for (idx, check) in plan.autopilot_checks.iter().enumerate() {
            let executor = Arc::clone(&self.executor);
            let check = check.clone();
            set.spawn(async move {
                let mut logger =
                    CheckLogger::new(check.item.composite_id(), executor.secrets.clone());
                let outcome = executor.execute(&check, &mut logger).await;
                (idx, outcome, logger)
            });
        }

        let mut completed: Vec<(usize, CheckResult)> = Vec::new();
        let mut log_lines = Vec::new();
        let mut failures: Vec<ExecutionError> = Vec::new();
        while let Some(joined) = set.join_next().await {
            let (idx, outcome, logger) = joined?;
            logger.flush();
            log_lines.extend(logger.lines().map(str::to_string));
            match outcome {
                Ok(result) => completed.push((idx, result)),
                Err(err) => failures.push(err),
            }
        }

        if !failures.is_empty() {
            return Err(RunError::TaskGroup {
                group: "autopilot",
                message: failures
                    .iter()
                    .map(|e| e.to_string())
                    .collect::<Vec<_>>()
                    .join("; "),
            });
        }

        completed.sort_by_key(|(idx, _)| *idx);
        Ok((completed.into_iter().map(|(_, r)| r).collect(), log_lines))
    }

    async fn run_manual_group(
        &self,
        plan: &ExecutionPlan,
    ) -> Result<(Vec<CheckResult>, Vec<String>), RunError> {
        let mut set = JoinSet::new();
        for (idx, check) in plan.manual_checks.iter().enumerate() {
            let secrets = self.executor.secrets.clone();
            let check = check.clone();
            set.spawn(async move {
                let mut logger = CheckLogger::new(check.item.composite_id(), secrets);
                let result = execute_manual_check(&check, &mut logger);
                (idx, result, logger)
            });
        }
        let mut completed = Vec::new();
        let mut log_lines = Vec::new();
        while let Some(joined) = set.join_next().await {
            let (idx, result, logger) = joined?;
            logger.flush();
            log_lines.extend(logger.lines().map(str::to_string));
            completed.push((idx, result));
        }
        completed.sort_by_key(|(idx, _)| *idx);
        Ok((completed.into_iter().map(|(_, r)| r).collect(), log_lines))
    }
}

/// Execute the plan's `Finalize` step once, after the main run.
///
/// Runs in the root working directory with its config files materialized
/// there; logs go to a dedicated `finalize-logs.txt`.
pub async fn run_finalizer(
    finalize: &Finalize,
    root_dir: &Path,
    executor: &CheckExecutor,
) -> ExecutionResult<ScriptOutput> {
    for name in &finalize.config_files {
        let content = executor.resolver.content(name).await.map_err(|err| {
            ExecutionError::ConfigResolve {
                name: name.clone(),
                reason: err.to_string(),
            }
        })?;
        let sources = Sources {
            vars: vec![&executor.vars],
            secrets: vec![&executor.secrets],
            env: vec![&finalize.env, &executor.global_env],
        };
        let resolved = replace_config_content(&content, name, sources)?;
        fsutil::write_file(&root_dir.join(name), &resolved)?;
    }

    let mut env: Environment = executor.global_env.clone();
    for (k, v) in &finalize.env {
        env.insert(k.clone(), v.clone());
    }
    if !env.contains_key("PATH") {
        if let Ok(path) = std::env::var("PATH") {
            env.insert("PATH".to_string(), path);
        }
    }

    let runner = ScriptRunner::new(executor.timeout, executor.secrets.clone());
    let output = runner.run(&finalize.run, root_dir, &env).await;
    let mut text = output.log_texts().join("\n");
    if !text.is_empty() {
        text.push('\n');
    }
    fsutil::write_file(&root_dir.join("finalize-logs.txt"), &text)?;
    if output.exit_code != 0 {
        info!(exit_code = output.exit_code, "finalizer exited non-zero");
    }
    Ok(output)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MemoryConfigResolver;
    use crate::model::{
        Autopilot, AutopilotCheck, CheckId, Evaluate, Item, ManualCheck, Section, Status,
    };
    use crate::result::CheckType;
    use indexmap::IndexMap;
    use std::time::Duration;

    fn item(ch: &str, req: &str, id: &str) -> Item {
        Item {
            chapter: Section {
                id: ch.to_string(),
                ..Default::default()
            },
            requirement: Section {
                id: req.to_string(),
                ..Default::default()
            },
            check: CheckId {
                id: id.to_string(),
                ..Default::default()
            },
        }
    }

    fn executor(root: &Path) -> CheckExecutor {
        CheckExecutor {
            root_dir: root.to_path_buf(),
            timeout: Duration::from_secs(30),
            strict: false,
            vars: IndexMap::new(),
            global_env: IndexMap::new(),
            secrets: IndexMap::new(),
            resolver: Arc::new(MemoryConfigResolver::new()),
        }
    }

    fn green_autopilot(name: &str) -> Autopilot {
        Autopilot {
            name: name.to_string(),
            evaluate: Evaluate {
                run: concat!(
                    "echo '{\"status\": \"GREEN\"}'\n",
                    "echo '{\"reason\": \"all good\"}'\n",
                    "echo '{\"result\": {\"criterion\": \"c\", \"fulfilled\": true, ",
                    "\"justification\": \"j\"}}'",
                )
                .to_string(),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_both_groups_contribute_results_in_plan_order() {
        let root = tempfile::tempdir().unwrap();
        let plan = ExecutionPlan {
            autopilot_checks: vec![
                AutopilotCheck {
                    item: item("1", "1", "1"),
                    autopilot: green_autopilot("a"),
                    ..Default::default()
                },
                AutopilotCheck {
                    item: item("1", "1", "2"),
                    autopilot: green_autopilot("b"),
                    ..Default::default()
                },
            ],
            manual_checks: vec![ManualCheck {
                item: item("2", "1", "1"),
                status: Status::Na,
                reason: "not applicable here".to_string(),
            }],
            ..Default::default()
        };
        let orchestrator = Orchestrator::new(executor(root.path()));
        let run = orchestrator.run(&plan).await;
        assert!(run.group_errors.is_empty());
        assert_eq!(run.results.len(), 3);
        assert_eq!(run.results[0].item.composite_id(), "1_1_1");
        assert_eq!(run.results[1].item.composite_id(), "1_1_2");
        assert_eq!(run.results[2].item.composite_id(), "2_1_1");
        assert_eq!(run.results[0].evaluation.status, Status::Green);
        assert_eq!(run.results[2].check_type, CheckType::Manual);
        // Every manual task logged through its own scoped logger.
        assert!(run.log_lines.iter().any(|l| l.contains("2_1_1")));
    }

    #[tokio::test]
    async fn test_autopilot_group_failure_leaves_manual_results_intact() {
        let root = tempfile::tempdir().unwrap();
        // Second check fails with an infrastructure error: its config file
        // cannot be resolved.
        let mut broken = AutopilotCheck {
            item: item("1", "1", "2"),
            autopilot: green_autopilot("b"),
            ..Default::default()
        };
        broken.autopilot.evaluate.config_files = vec!["missing.cfg".to_string()];
        let plan = ExecutionPlan {
            autopilot_checks: vec![
                AutopilotCheck {
                    item: item("1", "1", "1"),
                    autopilot: green_autopilot("a"),
                    ..Default::default()
                },
                broken,
            ],
            manual_checks: vec![ManualCheck {
                item: item("2", "1", "1"),
                status: Status::Green,
                reason: "reviewed".to_string(),
            }],
            ..Default::default()
        };
        let orchestrator = Orchestrator::new(executor(root.path()));
        let run = orchestrator.run(&plan).await;
        assert_eq!(run.group_errors.len(), 1);
        let msg = run.group_errors[0].to_string();
        assert!(msg.contains("autopilot check group failed"));
        assert!(msg.contains("missing.cfg"));
        // The manual group is unaffected and still contributes its result.
        assert_eq!(run.results.len(), 1);
        assert_eq!(run.results[0].item.composite_id(), "2_1_1");
        assert_eq!(run.results[0].evaluation.status, Status::Green);
    }

    #[tokio::test]
    async fn test_validation_errors_do_not_fail_the_group() {
        let root = tempfile::tempdir().unwrap();
        let plan = ExecutionPlan {
            autopilot_checks: vec![AutopilotCheck {
                item: item("1", "1", "1"),
                autopilot: green_autopilot("a"),
                validation_errors: vec!["autopilot 'a' has a step dependency cycle".to_string()],
                ..Default::default()
            }],
            ..Default::default()
        };
        let orchestrator = Orchestrator::new(executor(root.path()));
        let run = orchestrator.run(&plan).await;
        assert!(run.group_errors.is_empty());
        assert_eq!(run.results.len(), 1);
        assert_eq!(run.results[0].evaluation.status, Status::Error);
        assert!(run.results[0]
            .evaluation
            .reason
            .contains("dependency cycle"));
    }

    #[tokio::test]
    async fn test_finalizer_runs_and_writes_log_file() {
        let root = tempfile::tempdir().unwrap();
        let finalize = Finalize {
            env: IndexMap::new(),
            config_files: Vec::new(),
            run: "echo finishing up".to_string(),
        };
        let exec = executor(root.path());
        let output = run_finalizer(&finalize, root.path(), &exec).await.unwrap();
        assert_eq!(output.exit_code, 0);
        let log = std::fs::read_to_string(root.path().join("finalize-logs.txt")).unwrap();
        assert!(log.contains("finishing up"));
    }
}
