//! Quality gate runner CLI.
//!
//! ## Commands
//!
//! - `run`: execute every check of an execution plan and write the result
//!   document
//! - `finalize`: execute the plan's finalize step on an existing run
//!   directory

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use indexmap::IndexMap;
use tracing::{info, warn, Level};

use qualgate_core::{
    aggregate, init_tracing, prepare_plan, replace_initial, run_finalizer, CheckExecutor,
    DirConfigResolver, ExecutionPlan, Orchestrator, RunInfo, RunResult,
};

#[derive(Parser)]
#[command(name = "qualgate")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Quality gate execution engine", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute an execution plan and write qg-result.json
    Run {
        /// Path to the execution plan (JSON)
        #[arg(short, long)]
        plan: PathBuf,

        /// Run a single check: chapter id, requirement id, check id
        #[arg(long, num_args = 3, value_names = ["CHAPTER", "REQUIREMENT", "CHECK"])]
        check: Option<Vec<String>>,

        /// Treat evaluator contract violations as errors
        #[arg(long)]
        strict: bool,

        /// Per-script timeout in seconds
        #[arg(long, default_value_t = 600)]
        timeout: u64,

        /// JSON file with a name→value secret map
        #[arg(long)]
        secrets: Option<PathBuf>,

        /// Directory to resolve named config files from
        /// (defaults to the plan file's directory)
        #[arg(long)]
        configs: Option<PathBuf>,

        /// Run directory; also receives the result document
        #[arg(short, long)]
        output: PathBuf,
    },

    /// Execute the plan's finalize step
    Finalize {
        /// Path to the execution plan (JSON)
        #[arg(short, long)]
        plan: PathBuf,

        /// JSON file with a name→value secret map
        #[arg(long)]
        secrets: Option<PathBuf>,

        /// Directory to resolve named config files from
        #[arg(long)]
        configs: Option<PathBuf>,

        /// Run directory of an existing run
        #[arg(short, long)]
        output: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let level = if cli.verbose { Level::DEBUG } else { Level::INFO };
    init_tracing(level);

    match cli.command {
        Commands::Run {
            plan,
            check,
            strict,
            timeout,
            secrets,
            configs,
            output,
        } => {
            run(RunArgs {
                plan,
                check,
                strict,
                timeout: Duration::from_secs(timeout),
                secrets,
                configs,
                output,
            })
            .await
        }
        Commands::Finalize {
            plan,
            secrets,
            configs,
            output,
        } => finalize(&plan, secrets.as_deref(), configs.as_deref(), &output).await,
    }
}

struct RunArgs {
    plan: PathBuf,
    check: Option<Vec<String>>,
    strict: bool,
    timeout: Duration,
    secrets: Option<PathBuf>,
    configs: Option<PathBuf>,
    output: PathBuf,
}

async fn run(args: RunArgs) -> Result<()> {
    let (mut plan, run_info) = load_plan(&args.plan)?;
    let secrets = load_secrets(args.secrets.as_deref())?;

    if let Some(filter) = &args.check {
        let [chapter, requirement, check] = filter.as_slice() else {
            bail!("--check expects exactly three values");
        };
        plan.filter_single_check(chapter, requirement, check);
        if plan.autopilot_checks.is_empty() && plan.manual_checks.is_empty() {
            bail!("no check matches {chapter}/{requirement}/{check}");
        }
    }

    replace_initial(&mut plan, &secrets).context("variable replacement failed")?;
    prepare_plan(&mut plan);

    std::fs::create_dir_all(&args.output)
        .with_context(|| format!("failed to create run directory {}", args.output.display()))?;

    let executor = build_executor(&plan, &secrets, &args.output, args.configs.as_deref(), &args.plan, args.strict, args.timeout);
    let orchestrator = Orchestrator::new(executor);
    let RunResult {
        results,
        log_lines,
        group_errors,
    } = orchestrator.run(&plan).await;

    let mut log_text = log_lines.join("\n");
    if !log_text.is_empty() {
        log_text.push('\n');
    }
    std::fs::write(args.output.join("logs.txt"), log_text)
        .context("failed to write run log file")?;

    let document = aggregate(
        results,
        plan.metadata.clone(),
        plan.header.clone(),
        run_info,
    );

    // The surviving group's results are persisted even when a group failed.
    let result_path = args.output.join("qg-result.json");
    let json = serde_json::to_string_pretty(&document).context("failed to serialize result")?;
    std::fs::write(&result_path, json)
        .with_context(|| format!("failed to write {}", result_path.display()))?;
    info!(
        status = %document.overall_status,
        path = %result_path.display(),
        "result document written"
    );

    if !group_errors.is_empty() {
        bail!(
            "run incomplete: {}",
            group_errors
                .iter()
                .map(|e| e.to_string())
                .collect::<Vec<_>>()
                .join("; ")
        );
    }
    Ok(())
}

async fn finalize(
    plan_path: &Path,
    secrets_path: Option<&Path>,
    configs: Option<&Path>,
    output: &Path,
) -> Result<()> {
    let (mut plan, _) = load_plan(plan_path)?;
    let secrets = load_secrets(secrets_path)?;
    replace_initial(&mut plan, &secrets).context("variable replacement failed")?;

    let Some(finalize) = plan.finalize.clone() else {
        warn!("plan has no finalize step, nothing to do");
        return Ok(());
    };
    let executor = build_executor(
        &plan,
        &secrets,
        output,
        configs,
        plan_path,
        false,
        Duration::from_secs(600),
    );
    let result = run_finalizer(&finalize, output, &executor)
        .await
        .context("finalize failed")?;
    info!(exit_code = result.exit_code, "finalize step complete");
    Ok(())
}

fn build_executor(
    plan: &ExecutionPlan,
    secrets: &IndexMap<String, String>,
    output: &Path,
    configs: Option<&Path>,
    plan_path: &Path,
    strict: bool,
    timeout: Duration,
) -> CheckExecutor {
    let config_dir = configs
        .map(Path::to_path_buf)
        .or_else(|| plan_path.parent().map(Path::to_path_buf))
        .unwrap_or_else(|| PathBuf::from("."));
    CheckExecutor {
        root_dir: output.to_path_buf(),
        timeout,
        strict,
        vars: plan.default_vars.clone(),
        global_env: plan.env.clone(),
        secrets: secrets.clone(),
        resolver: Arc::new(DirConfigResolver::new(config_dir)),
    }
}

fn load_plan(path: &Path) -> Result<(ExecutionPlan, RunInfo)> {
    let bytes = std::fs::read(path)
        .with_context(|| format!("failed to read plan file {}", path.display()))?;
    let run_info = RunInfo::generate(&bytes);
    let plan: ExecutionPlan = serde_json::from_slice(&bytes)
        .with_context(|| format!("failed to parse plan file {}", path.display()))?;
    Ok((plan, run_info))
}

fn load_secrets(path: Option<&Path>) -> Result<IndexMap<String, String>> {
    let Some(path) = path else {
        return Ok(IndexMap::new());
    };
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read secrets file {}", path.display()))?;
    serde_json::from_str(&content)
        .with_context(|| format!("failed to parse secrets file {}", path.display()))
}
