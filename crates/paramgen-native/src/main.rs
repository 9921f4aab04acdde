use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use paramgen_core::result::UNSET_MODEL;
use paramgen_core::{compile_grammar, evaluate_raw, InferenceResult, Schema};
use paramgen_native::{
    default_loader, load_schema, run_worker, runtime_defaults, AppConfig, CancelPolicy,
    Coordinator, EngineHandle, ModelCatalog, Outcome, RuntimeOverrides, WorkerCommand,
};
use serde::Serialize;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const DEFAULT_MODELS_DIR: &str = "models";

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "Turn a text prompt into validated parameters with a local LLM",
    long_about = None
)]
struct Cli {
    /// YAML config file; command-line flags take precedence over it
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Debug logging, including llama.cpp's own output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Generate parameters for a prompt and print the result as JSON
    Generate(GenerateArgs),

    /// Print the GBNF grammar compiled from a schema
    Grammar {
        #[arg(short, long)]
        schema: Option<PathBuf>,
    },

    /// Validate raw model output read from a file or stdin
    Validate {
        #[arg(short, long)]
        schema: Option<PathBuf>,

        /// Raw text file; stdin when omitted
        input: Option<PathBuf>,
    },

    /// Show which manifest models are present
    Models {
        #[arg(long)]
        models_dir: Option<PathBuf>,
    },

    /// Run one isolated inference request (used internally)
    #[command(hide = true)]
    Worker { args_file: PathBuf },
}

#[derive(Args, Debug)]
struct GenerateArgs {
    /// What to generate parameters for
    prompt: String,

    #[arg(short, long)]
    schema: Option<PathBuf>,

    /// GGUF model file; defaults to the manifest's first model
    #[arg(short, long)]
    model: Option<PathBuf>,

    #[arg(long)]
    models_dir: Option<PathBuf>,

    #[arg(long, value_enum)]
    cancel_policy: Option<CancelPolicy>,

    /// Cancel the request if it has not finished after this many seconds
    #[arg(long)]
    timeout_secs: Option<u64>,

    #[command(flatten)]
    runtime: RuntimeArgs,
}

#[derive(Args, Debug)]
struct RuntimeArgs {
    #[arg(long)]
    n_ctx: Option<u32>,

    #[arg(long)]
    n_threads: Option<u32>,

    #[arg(long)]
    n_gpu_layers: Option<u32>,

    #[arg(long)]
    n_batch: Option<u32>,

    /// Do not reuse the KV cache of a shared prompt prefix
    #[arg(long)]
    no_cache_prompt: bool,
}

impl RuntimeArgs {
    fn overrides(&self) -> RuntimeOverrides {
        RuntimeOverrides {
            n_ctx: self.n_ctx,
            n_threads: self.n_threads,
            n_gpu_layers: self.n_gpu_layers,
            n_batch: self.n_batch,
            cache_prompt: self.no_cache_prompt.then_some(false),
        }
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let config = match &cli.config {
        Some(path) => AppConfig::load(path)?,
        None => AppConfig::default(),
    };

    match cli.command {
        Command::Generate(args) => generate(args, &config, cli.verbose),
        Command::Grammar { schema } => {
            let schema = resolve_schema(schema.as_deref(), &config)?;
            println!("{}", compile_grammar(&schema));
            Ok(())
        }
        Command::Validate { schema, input } => {
            let schema = resolve_schema(schema.as_deref(), &config)?;
            let raw = read_input(input.as_deref())?;
            let result = evaluate_raw(&raw, &schema, 0.0, UNSET_MODEL)
                .unwrap_or_else(|e| InferenceResult::failure(e.to_string(), 0.0, UNSET_MODEL));
            print_json(&result)?;
            exit_on_failure(&result)
        }
        Command::Models { models_dir } => {
            let catalog = ModelCatalog::load(&models_dir_of(models_dir, &config));
            print_json(&catalog.status())
        }
        Command::Worker { args_file } => {
            // stdout carries exactly one reply line; logs go to stderr
            let reply = run_worker(&args_file, default_loader(cli.verbose).as_ref());
            println!("{}", serde_json::to_string(&reply)?);
            Ok(())
        }
    }
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .with_target(false)
        .init();
}

fn generate(args: GenerateArgs, config: &AppConfig, verbose: bool) -> Result<()> {
    let schema = resolve_schema(args.schema.as_deref(), config)?;
    let settings = args.runtime.overrides().apply(config.runtime.apply(runtime_defaults()));
    let policy = args.cancel_policy.or(config.cancel_policy).unwrap_or_default();

    let model_path = args
        .model
        .or_else(|| config.model_path.clone())
        .or_else(|| {
            ModelCatalog::load(&models_dir_of(args.models_dir, config)).default_model_path()
        })
        .unwrap_or_default();

    let engine = Arc::new(EngineHandle::new(default_loader(verbose), settings));
    let worker = WorkerCommand::current_exe().context("Failed to locate the worker executable")?;
    let coordinator = Coordinator::with_policy(engine, policy, worker);

    let handle = coordinator
        .submit(&args.prompt, model_path, &schema)
        .context("Request rejected")?;

    let completion = match args.timeout_secs {
        None => handle.wait(),
        Some(secs) => match handle.wait_timeout(Duration::from_secs(secs)) {
            Some(completion) => completion,
            None => {
                warn!(timeout_secs = secs, "timed out, canceling");
                coordinator.cancel();
                handle.wait()
            }
        },
    };

    let result = completion.result.clone();
    match coordinator.finish(&handle, completion, |_| print_json(&result)) {
        Outcome::Applied { value, timings, .. } => {
            value?;
            info!(ttv_secs = timings.ttv.as_secs_f64(), "done");
            Ok(())
        }
        Outcome::Failed(result) => {
            print_json(&result)?;
            exit_on_failure(&result)
        }
        Outcome::Canceled => {
            let result = if result.is_canceled() {
                result
            } else {
                InferenceResult::canceled(result.elapsed, result.model)
            };
            print_json(&result)?;
            exit_on_failure(&result)
        }
    }
}

fn resolve_schema(flag: Option<&Path>, config: &AppConfig) -> Result<Schema> {
    let Some(path) = flag.or(config.schema_path.as_deref()) else {
        bail!("no schema given: pass --schema or set schema_path in the config file");
    };
    Ok(load_schema(path)?)
}

fn models_dir_of(flag: Option<PathBuf>, config: &AppConfig) -> PathBuf {
    flag.or_else(|| config.models_dir.clone())
        .unwrap_or_else(|| PathBuf::from(DEFAULT_MODELS_DIR))
}

fn read_input(path: Option<&Path>) -> Result<String> {
    match path {
        Some(path) => std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display())),
        None => {
            let mut text = String::new();
            io::stdin()
                .read_to_string(&mut text)
                .context("Failed to read stdin")?;
            Ok(text)
        }
    }
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    let mut stdout = io::stdout().lock();
    serde_json::to_writer_pretty(&mut stdout, value)?;
    writeln!(stdout)?;
    Ok(())
}

fn exit_on_failure(result: &InferenceResult) -> Result<()> {
    if !result.ok {
        std::process::exit(1);
    }
    Ok(())
}
