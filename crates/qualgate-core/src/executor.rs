//! Autopilot check executor.
//!
//! Drives one automated check end to end: sandbox directory layout, step
//! execution in dependency-level order, evaluation, and result-contract
//! validation.
//!
//! Directory layout per check, rooted in the shared run directory:
//!
//! ```text
//! <root>/<chapter>_<requirement>_<check>/
//!   steps/<stepID>/work/     step sandbox (configs + root-dir symlinks)
//!   steps/<stepID>/files/    step output, consumed by dependents
//!   steps/<stepID>/logs.txt
//!   evaluation/
//! ```

use indexmap::IndexMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::config::ConfigResolver;
use crate::error::{ExecutionError, ExecutionResult};
use crate::fsutil;
use crate::logging::CheckLogger;
use crate::model::{AutopilotCheck, Environment, Status, Step};
use crate::replacer::{replace_config_content, Sources};
use crate::result::{AutopilotRun, CheckResult, CheckType, EvalResult, Evaluation, StepRun};
use crate::runner::{ScriptOutput, ScriptRunner, TIMEOUT_EXIT_CODE};

/// Name of the result file a step may produce in its output directory.
pub const RESULT_FILE_NAME: &str = "data.json";

/// Name of the file the evaluator is asked to write its result to.
pub const EVALUATOR_RESULT_FILE_NAME: &str = "result.json";

const PATH_LIST_SEPARATOR: &str = ":";

/// Executes one [`AutopilotCheck`] and produces its [`CheckResult`].
pub struct CheckExecutor {
    /// Root working directory, shared read-only input across checks.
    pub root_dir: PathBuf,
    /// Deadline per script execution.
    pub timeout: Duration,
    /// Strict result-contract mode: violations force ERROR.
    pub strict: bool,
    pub vars: IndexMap<String, String>,
    pub global_env: Environment,
    pub secrets: IndexMap<String, String>,
    pub resolver: Arc<dyn ConfigResolver>,
}

impl CheckExecutor {
    pub async fn execute(
        &self,
        check: &AutopilotCheck,
        logger: &mut CheckLogger,
    ) -> ExecutionResult<CheckResult> {
        // Checks with configuration problems are never executed.
        if !check.validation_errors.is_empty() {
            logger.error(&format!(
                "skipping check '{}': {}",
                check.item.composite_id(),
                check.validation_errors.join("; ")
            ));
            return Ok(CheckResult {
                item: check.item.clone(),
                check_type: CheckType::Automation,
                autopilots: Vec::new(),
                app_refs: check.app_refs.clone(),
                evaluation: Evaluation::synthetic(
                    Status::Error,
                    check.validation_errors.join("; "),
                ),
            });
        }

        let check_dir = self.root_dir.join(check.item.composite_id());
        fsutil::create_dir(&check_dir).map_err(|source| ExecutionError::WorkdirCreate {
            dir: check_dir.display().to_string(),
            source,
        })?;

        let runner = ScriptRunner::new(self.timeout, self.secrets.clone());
        let mut steps = Vec::new();
        for level in &check.autopilot.steps {
            for step in level {
                logger.info(&format!(
                    "autopilot '{}': running step '{}'",
                    check.autopilot.name, step.id
                ));
                let run = self
                    .execute_step(check, step, &check_dir, &runner, logger)
                    .await?;
                if run.exit_code != 0 {
                    logger.warn(&format!(
                        "step '{}' exited with code {}",
                        step.id, run.exit_code
                    ));
                }
                steps.push(run);
            }
        }

        let evaluation = self
            .evaluate(check, &check_dir, &steps, &runner, logger)
            .await?;

        Ok(CheckResult {
            item: check.item.clone(),
            check_type: CheckType::Automation,
            autopilots: vec![AutopilotRun {
                name: check.autopilot.name.clone(),
                steps,
            }],
            app_refs: check.app_refs.clone(),
            evaluation,
        })
    }

    async fn execute_step(
        &self,
        check: &AutopilotCheck,
        step: &Step,
        check_dir: &Path,
        runner: &ScriptRunner,
        logger: &mut CheckLogger,
    ) -> ExecutionResult<StepRun> {
        let step_dir = check_dir.join("steps").join(&step.id);
        let work_dir = step_dir.join("work");
        let output_dir = step_dir.join("files");
        for dir in [&work_dir, &output_dir] {
            fsutil::create_dir(dir).map_err(|source| ExecutionError::WorkdirCreate {
                dir: dir.display().to_string(),
                source,
            })?;
        }

        // Every declared dependency must have produced its output directory.
        let mut input_dirs = Vec::new();
        for dep in &step.depends {
            let dir = check_dir.join("steps").join(dep).join("files");
            if !dir.is_dir() {
                return Err(ExecutionError::MissingDependencyDir {
                    step: step.id.clone(),
                    dependency: dep.clone(),
                    dir: dir.display().to_string(),
                });
            }
            input_dirs.push(dir);
        }

        for name in &step.config_files {
            let content = self.resolver.content(name).await.map_err(|err| {
                ExecutionError::ConfigResolve {
                    name: name.clone(),
                    reason: err.to_string(),
                }
            })?;
            let sources = Sources {
                vars: vec![&self.vars],
                secrets: vec![&self.secrets],
                env: vec![&step.env, &check.autopilot.env, &check.env, &self.global_env],
            };
            let resolved = replace_config_content(&content, name, sources)?;
            fsutil::write_file(&work_dir.join(name), &resolved)?;
        }

        fsutil::link_files(&self.root_dir, &work_dir)?;
        let env = self.step_env(check, step, &output_dir, &input_dirs);
        let output = runner.run(&step.run, &work_dir, &env).await;
        // Symlinks go away whatever the script did.
        if let Err(err) = fsutil::unlink_files(&work_dir) {
            logger.warn(&format!(
                "failed to clean symlinks in {}: {err}",
                work_dir.display()
            ));
        }

        let logs = output.log_texts();
        fsutil::write_file(&step_dir.join("logs.txt"), &join_lines(&logs))?;

        let result_path = output_dir.join(RESULT_FILE_NAME);
        Ok(StepRun {
            id: step.id.clone(),
            title: step.title.clone(),
            work_dir,
            output_dir,
            input_dirs,
            exit_code: output.exit_code,
            logs,
            result_file: result_path.is_file().then_some(result_path),
        })
    }

    /// Step runtime environment, lowest to highest precedence: global run
    /// environment, step environment, autopilot environment, then the fixed
    /// special variables.
    fn step_env(
        &self,
        check: &AutopilotCheck,
        step: &Step,
        output_dir: &Path,
        input_dirs: &[PathBuf],
    ) -> Environment {
        let mut env = self.global_env.clone();
        for (k, v) in &step.env {
            env.insert(k.clone(), v.clone());
        }
        for (k, v) in &check.autopilot.env {
            env.insert(k.clone(), v.clone());
        }
        let apps = join_paths(&check.app_search_path);
        env.insert("APPS".to_string(), apps.clone());
        env.insert("PATH".to_string(), prefixed_path(&env, &apps));
        env.insert(
            "AUTOPILOT_OUTPUT_DIR".to_string(),
            output_dir.display().to_string(),
        );
        env.insert("AUTOPILOT_INPUT_DIRS".to_string(), join_paths(input_dirs));
        env.insert(
            "AUTOPILOT_RESULT_FILE".to_string(),
            output_dir.join(RESULT_FILE_NAME).display().to_string(),
        );
        env
    }

    async fn evaluate(
        &self,
        check: &AutopilotCheck,
        check_dir: &Path,
        steps: &[StepRun],
        runner: &ScriptRunner,
        logger: &mut CheckLogger,
    ) -> ExecutionResult<Evaluation> {
        let evaluate = &check.autopilot.evaluate;
        let eval_dir = check_dir.join("evaluation");
        fsutil::create_dir(&eval_dir).map_err(|source| ExecutionError::WorkdirCreate {
            dir: eval_dir.display().to_string(),
            source,
        })?;

        for name in &evaluate.config_files {
            let content = self.resolver.content(name).await.map_err(|err| {
                ExecutionError::ConfigResolve {
                    name: name.clone(),
                    reason: err.to_string(),
                }
            })?;
            let sources = Sources {
                vars: vec![&self.vars],
                secrets: vec![&self.secrets],
                env: vec![&evaluate.env, &check.autopilot.env, &check.env, &self.global_env],
            };
            let resolved = replace_config_content(&content, name, sources)?;
            fsutil::write_file(&eval_dir.join(name), &resolved)?;
        }

        // Only steps that actually produced a result file feed the evaluator.
        let input_files: Vec<PathBuf> = steps
            .iter()
            .filter_map(|s| s.result_file.clone())
            .collect();

        let mut env = self.global_env.clone();
        for (k, v) in &evaluate.env {
            env.insert(k.clone(), v.clone());
        }
        let apps = join_paths(&check.app_search_path);
        env.insert("PATH".to_string(), prefixed_path(&env, &apps));
        env.insert("EVALUATOR_INPUT_FILES".to_string(), join_paths(&input_files));
        env.insert(
            "EVALUATOR_RESULT_FILE".to_string(),
            eval_dir.join(EVALUATOR_RESULT_FILE_NAME).display().to_string(),
        );

        let output = runner.run(&evaluate.run, &eval_dir, &env).await;
        fsutil::write_file(&eval_dir.join("logs.txt"), &join_lines(&output.log_texts()))?;

        Ok(self.validate_contract(&check.autopilot.name, &output, logger))
    }

    /// Enforce the evaluator result contract.
    fn validate_contract(
        &self,
        name: &str,
        output: &ScriptOutput,
        logger: &mut CheckLogger,
    ) -> Evaluation {
        let (status_raw, reason, results) = parse_evaluator_output(output);
        let logs = output.log_texts();

        if output.exit_code == TIMEOUT_EXIT_CODE {
            return Evaluation {
                status: Status::Error,
                reason: format!(
                    "autopilot '{name}' timed out after {}s",
                    self.timeout.as_secs()
                ),
                results,
                logs,
                exit_code: output.exit_code,
            };
        }
        if output.exit_code != 0 {
            return Evaluation {
                status: Status::Error,
                reason: format!(
                    "autopilot '{name}' exited with code {}",
                    output.exit_code
                ),
                results,
                logs,
                exit_code: output.exit_code,
            };
        }

        let status = match &status_raw {
            None => {
                return Evaluation {
                    status: Status::Error,
                    reason: format!("autopilot '{name}' did not provide a 'status'"),
                    results,
                    logs,
                    exit_code: output.exit_code,
                };
            }
            Some(raw) => match Status::from_evaluator(raw) {
                Some(status) => status,
                None => {
                    return Evaluation {
                        status: Status::Error,
                        reason: format!(
                            "autopilot '{name}' provided an invalid 'status': '{raw}'"
                        ),
                        results,
                        logs,
                        exit_code: output.exit_code,
                    };
                }
            },
        };

        let mut violations = Vec::new();
        if reason.is_none() {
            violations.push(format!("autopilot '{name}' did not provide a 'reason'"));
        }
        if results.is_empty() {
            violations.push(format!("autopilot '{name}' did not provide any 'results'"));
        }
        for result in &results {
            if result.criterion.is_empty() {
                violations.push(format!(
                    "autopilot '{name}' provided a 'result' without 'criterion'"
                ));
            }
            if result.justification.is_empty() {
                violations.push(format!(
                    "autopilot '{name}' provided a 'result' without 'justification'"
                ));
            }
        }

        if !violations.is_empty() {
            if self.strict {
                return Evaluation {
                    status: Status::Error,
                    reason: violations.join("; "),
                    results,
                    logs,
                    exit_code: output.exit_code,
                };
            }
            for violation in &violations {
                logger.warn(violation);
            }
        }

        Evaluation {
            status,
            reason: reason.unwrap_or_default(),
            results,
            logs,
            exit_code: output.exit_code,
        }
    }
}

/// Extract `status`, `reason` and `result` objects from the evaluator's
/// structured stdout lines.
fn parse_evaluator_output(
    output: &ScriptOutput,
) -> (Option<String>, Option<String>, Vec<EvalResult>) {
    let mut status = None;
    let mut reason = None;
    let mut results = Vec::new();
    for value in &output.json_stdout {
        let Some(object) = value.as_object() else {
            continue;
        };
        if let Some(s) = object.get("status").and_then(|v| v.as_str()) {
            status = Some(s.to_string());
        }
        if let Some(r) = object.get("reason").and_then(|v| v.as_str()) {
            reason = Some(r.to_string());
        }
        if let Some(result) = object.get("result") {
            results.push(parse_eval_result(result));
        }
    }
    (status, reason, results)
}

fn parse_eval_result(value: &serde_json::Value) -> EvalResult {
    EvalResult {
        criterion: value
            .get("criterion")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string(),
        fulfilled: value
            .get("fulfilled")
            .and_then(|v| v.as_bool())
            .unwrap_or_default(),
        justification: value
            .get("justification")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string(),
        metadata: value
            .get("metadata")
            .and_then(|v| v.as_object())
            .map(flatten_metadata)
            .unwrap_or_default(),
    }
}

/// Flatten metadata values to strings; nested objects and arrays are
/// re-serialized to JSON text.
fn flatten_metadata(map: &serde_json::Map<String, serde_json::Value>) -> IndexMap<String, String> {
    map.iter()
        .map(|(k, v)| {
            let text = match v {
                serde_json::Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            (k.clone(), text)
        })
        .collect()
}

fn join_paths(paths: &[PathBuf]) -> String {
    paths
        .iter()
        .map(|p| p.display().to_string())
        .collect::<Vec<_>>()
        .join(PATH_LIST_SEPARATOR)
}

/// Prefix the layered PATH (falling back to the process PATH) with the
/// application search path.
fn prefixed_path(env: &Environment, prefix: &str) -> String {
    let base = env
        .get("PATH")
        .cloned()
        .or_else(|| std::env::var("PATH").ok())
        .unwrap_or_default();
    match (prefix.is_empty(), base.is_empty()) {
        (true, _) => base,
        (false, true) => prefix.to_string(),
        (false, false) => format!("{prefix}{PATH_LIST_SEPARATOR}{base}"),
    }
}

fn join_lines(lines: &[String]) -> String {
    let mut text = lines.join("\n");
    if !text.is_empty() {
        text.push('\n');
    }
    text
}
