//! secpipe command line.

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use tracing::{error, info, warn};

use secpipe::PipelineError;
use secpipe::config::{self, Settings, TokenPolicy};
use secpipe::docker::{self, DockerCli};
use secpipe::logging::{self, DetailedLog};
use secpipe::pipeline::{self, Orchestrator, RunRequest, StorageStrategy};

#[derive(Parser)]
#[command(name = "secpipe")]
#[command(about = "Run multi-stage security tool pipelines in containers", long_about = None)]
struct Cli {
    /// Directory holding the catalogs and an optional secpipe.yaml
    #[arg(long, global = true, env = "SECPIPE_CONFIG_DIR", default_value = ".")]
    config_dir: PathBuf,

    /// Where leveled, detailed and summary logs are written
    #[arg(long, global = true, env = "SECPIPE_LOG_DIR")]
    log_dir: Option<PathBuf>,

    /// Log filter, e.g. `info` or `secpipe=debug` (RUST_LOG wins when set)
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run a pipeline profile against an application
    Run(RunArgs),
    /// Check that catalog profiles resolve, without running anything
    Validate(ValidateArgs),
}

#[derive(Args)]
struct RunArgs {
    /// Pipeline profile from the pipeline catalog
    #[arg(long)]
    profile: String,

    /// Application under test
    #[arg(long)]
    app_name: String,

    /// Free-form target description, recorded in the summary
    #[arg(long)]
    target: Option<String>,

    /// Print what would run without touching the container runtime
    #[arg(long)]
    dry_run: bool,

    /// Keep tool containers after they exit
    #[arg(long)]
    keep: bool,

    /// Host directory to use instead of an ephemeral volume
    #[arg(long, value_name = "PATH")]
    volume: Option<PathBuf>,

    /// Host source tree mounted at <mount_root>/source
    #[arg(long, value_name = "PATH")]
    source: Option<PathBuf>,

    /// Host directory mounted at <mount_root>/reports
    #[arg(long, value_name = "PATH")]
    report: Option<PathBuf>,

    /// Use this tool profile wherever the tool declares it
    #[arg(long, value_name = "NAME")]
    tool_profile: Option<String>,

    /// Space separated NAME=value parameters
    #[arg(long, default_value = "")]
    params: String,

    /// Fail on unresolved `{token}` placeholders
    #[arg(long)]
    strict: bool,
}

#[derive(Args)]
struct ValidateArgs {
    /// Only validate this profile
    #[arg(long)]
    profile: Option<String>,

    /// Application whose overlays should be applied
    #[arg(long)]
    app_name: Option<String>,

    /// Parameters used while binding
    #[arg(long, default_value = "")]
    params: String,

    /// Fail on unresolved `{token}` placeholders
    #[arg(long)]
    strict: bool,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    match execute(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e:#}");
            ExitCode::from(exit_code(&e))
        }
    }
}

fn exit_code(err: &anyhow::Error) -> u8 {
    err.downcast_ref::<PipelineError>()
        .map_or(1, PipelineError::exit_code)
}

fn execute(cli: Cli) -> Result<()> {
    let mut settings = config::load_settings(&cli.config_dir)?;
    if let Some(dir) = cli.log_dir {
        settings.log_dir = dir;
    }
    logging::init(&cli.log_level, &settings.log_dir)?;

    match cli.command {
        Command::Run(args) => run(&cli.config_dir, settings, args),
        Command::Validate(args) => validate(&cli.config_dir, settings, args),
    }
}

fn run(config_dir: &Path, mut settings: Settings, args: RunArgs) -> Result<()> {
    if args.strict {
        settings.token_policy = TokenPolicy::Strict;
    }

    config::check_catalog_files(config_dir, &settings)?;
    if !args.dry_run {
        docker::ensure_available(&settings.docker_binary)?;
    }
    let catalogs = config::load_catalogs(config_dir, &settings, Some(&args.app_name))?;

    let request = RunRequest {
        profile: args.profile,
        app_name: args.app_name,
        target: args.target,
        dry_run: args.dry_run,
        keep: args.keep,
        storage: args
            .volume
            .map_or(StorageStrategy::Ephemeral, StorageStrategy::External),
        source: args.source,
        report: args.report,
        tool_profile: args.tool_profile,
        params: args.params,
    };
    let mut ctx = pipeline::resolve(request, &catalogs, settings.token_policy)?;

    let log = DetailedLog::open(&settings.log_dir, &ctx.run_id.to_string())
        .context("failed to open detailed log")?;
    if let Some(path) = log.path() {
        info!("detailed output in {}", path.display());
    }
    ctx.attach_log(log);

    let log_dir = settings.log_dir.clone();
    let binary = settings.docker_binary.clone();
    let orchestrator = Orchestrator::new(DockerCli::new(&binary), settings);
    let outcome = orchestrator.run(&mut ctx);

    match pipeline::write_summary(&log_dir, &outcome.summary) {
        Ok(path) => info!("run summary written to {}", path.display()),
        Err(e) => warn!("{e:#}"),
    }
    let hints = ctx.cleanup_hints(&binary);
    if !hints.is_empty() {
        info!("to clean up after this run:");
        for hint in &hints {
            info!("  {hint}");
        }
    }

    let summary = outcome.into_result()?;
    println!("{} {:?}", summary.run_id, summary.state);
    Ok(())
}

fn validate(config_dir: &Path, mut settings: Settings, args: ValidateArgs) -> Result<()> {
    if args.strict {
        settings.token_policy = TokenPolicy::Strict;
    }

    config::check_catalog_files(config_dir, &settings)?;
    let catalogs = config::load_catalogs(config_dir, &settings, args.app_name.as_deref())?;

    let profiles: Vec<String> = match args.profile {
        Some(profile) => vec![profile],
        None => catalogs.pipelines.keys().cloned().collect(),
    };

    let mut failures: Vec<PipelineError> = Vec::new();
    for profile in &profiles {
        let request = RunRequest {
            profile: profile.clone(),
            app_name: args.app_name.clone().unwrap_or_else(|| "validate".to_string()),
            dry_run: true,
            params: args.params.clone(),
            ..RunRequest::default()
        };
        match pipeline::resolve(request, &catalogs, settings.token_policy) {
            Ok(_) => println!("ok      {profile}"),
            Err(e) => {
                error!("{profile}: {e}");
                println!("failed  {profile}: {e}");
                failures.push(e);
            }
        }
    }

    if failures.is_empty() {
        return Ok(());
    }
    let count = failures.len();
    let first = failures.swap_remove(0);
    Err(anyhow::Error::new(first).context(format!(
        "{count} of {} profiles failed validation",
        profiles.len()
    )))
}
