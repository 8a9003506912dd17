use anyhow::{bail, Context, Result};
use clap::Parser;
use patchpilot::adapters::{
    BenchmarkAdapter, Defects4jAdapter, HarnessRequest, SweBenchAdapter,
};
use patchpilot::config::{DatasetConfig, VariantBundle};
use patchpilot::providers::create_provider;
use patchpilot::tools::{setup_tools, ToolSetupParams};
use patchpilot::{run_repair_loop, LoopHandles};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

const READ_LOG_HINT: &str = "IMPORTANT: For test failure details, read red.log (NOT \
test.full.log). The red.log file contains focused failure information (assertion errors, \
stack traces). The test.full.log file is very large and contains all test outputs - avoid \
reading it for efficiency.";

/// LLM-driven automated program repair runner.
#[derive(Parser, Debug)]
#[command(name = "patchpilot", version, about)]
struct Cli {
    /// Benchmark dataset (defects4j, swebench_verified)
    #[arg(long, default_value = "defects4j")]
    dataset: String,

    /// Working directory override (default: from the dataset config)
    #[arg(long)]
    workdir: Option<PathBuf>,

    /// Project ID (e.g. Lang, Math)
    #[arg(long)]
    pid: String,

    /// Bug ID
    #[arg(long)]
    bid: u32,

    /// Ablation variant
    #[arg(long, default_value = "G0", value_parser = ["G0", "G1", "G2", "G3", "TRACE"])]
    variant: String,

    /// Maximum repair iterations (0 = harness/verify only, no patch loop)
    #[arg(long, default_value_t = 0)]
    max_iters: u32,

    /// Model name (resolved via models/<name>.json)
    #[arg(long, default_value = "gpt-4o")]
    model: String,

    /// Root directory holding variants/, models/ and datasets/
    #[arg(long, default_value = ".")]
    apr_dir: PathBuf,
}

fn build_adapter(
    dataset: &str,
    config: &DatasetConfig,
) -> Result<Arc<dyn BenchmarkAdapter>> {
    match dataset {
        "defects4j" => Ok(Arc::new(Defects4jAdapter::new(config.environment.clone()))),
        "swebench_verified" | "swebench" => Ok(Arc::new(SweBenchAdapter::from_environment(
            &config.environment,
        ))),
        other => bail!("unknown dataset: {other}"),
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match run(cli).await {
        Ok(ok) => {
            if ok {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            }
        }
        Err(e) => {
            tracing::error!("{e:#}");
            eprintln!("error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<bool> {
    let bundle = VariantBundle::load(&cli.apr_dir, &cli.variant)?;
    tracing::info!(variant = %bundle.name, "loaded variant");

    let models_dir = cli.apr_dir.join("models");
    let (provider, api_model) = create_provider(&models_dir, &cli.model)?;
    if api_model != cli.model {
        tracing::info!(api_model = %api_model, config = %cli.model, "using served model id");
    }

    let dataset_path = cli.apr_dir.join("datasets").join(format!("{}.json", cli.dataset));
    let dataset = DatasetConfig::load(&dataset_path)?;
    let paths = dataset.resolve(&cli.apr_dir, &cli.pid, cli.bid);

    let workdir = cli.workdir.unwrap_or(paths.workdir);
    let index_dir = if bundle.config.enable_index_retrieval {
        paths.index_dir
    } else {
        None
    };
    let meta_dir = paths.meta_dir;
    let log_dir = paths.log_dir.join(&bundle.name);
    std::fs::create_dir_all(&meta_dir)
        .with_context(|| format!("cannot create meta dir: {}", meta_dir.display()))?;
    std::fs::create_dir_all(&log_dir)
        .with_context(|| format!("cannot create log dir: {}", log_dir.display()))?;

    let full_log = log_dir.join("test.full.log");
    let trig_log = log_dir.join("test.trigger.log");
    let red_log = log_dir.join("red.log");
    let green_log = log_dir.join("green.log");

    let adapter = build_adapter(&cli.dataset, &dataset)?;

    let red_test_name = if bundle.config.enable_tdd_gate {
        patchpilot::tools::read_trigger_test(&meta_dir)
    } else {
        None
    };

    let tools = setup_tools(ToolSetupParams {
        workdir: &workdir,
        meta_dir: &meta_dir,
        red_log: &red_log,
        green_log: &green_log,
        red_test_name,
        adapter: adapter.clone(),
        config: &bundle.config,
    });

    let request = HarnessRequest {
        pid: cli.pid.clone(),
        bid: cli.bid,
        workdir,
        meta_dir,
        full_log,
        trig_log,
        index_dir,
    };

    let outcome = run_repair_loop(LoopHandles {
        provider,
        api_model,
        prompts: bundle.prompts,
        adapter,
        tools,
        request,
        config: bundle.config,
        max_iters: cli.max_iters,
        read_log_hint: READ_LOG_HINT.to_string(),
        red_log,
        cancel: CancellationToken::new(),
    })
    .await;

    println!("{}", serde_json::to_string_pretty(&outcome)?);
    Ok(outcome.ok)
}
