mod cli;
mod report;

use std::fs::OpenOptions;
use std::path::PathBuf;

use anyhow::{Result, anyhow};
use cli::{Cli, Commands};
use tracing::info;
use tracing_appender::non_blocking;
use tracing_subscriber::{EnvFilter, prelude::*};
use whalebars_rs::pipeline::{run_all, run_baseline, run_build_bars, run_ingest, run_label, run_sweep};

fn init_tracing(log_file: Option<PathBuf>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let stdout_layer = tracing_subscriber::fmt::layer().with_writer(std::io::stdout);

    if let Some(path) = log_file {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|err| anyhow!("failed to create log directory {parent:?}: {err}"))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|err| anyhow!("failed to open log file {path:?}: {err}"))?;
        let (non_blocking_writer, guard) = non_blocking(file);
        // Leaked so buffered lines are flushed for the whole process lifetime.
        let _guard = Box::leak(Box::new(guard));
        let file_layer = tracing_subscriber::fmt::layer()
            .with_ansi(false)
            .with_writer(non_blocking_writer);
        tracing_subscriber::registry()
            .with(filter)
            .with(stdout_layer)
            .with(file_layer)
            .try_init()
            .map_err(|err| anyhow!("failed to initialize tracing: {err}"))
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(stdout_layer)
            .try_init()
            .map_err(|err| anyhow!("failed to initialize tracing: {err}"))
    }
}

fn log_invocation(command: &str, log_file: Option<&PathBuf>) {
    let cwd = std::env::current_dir().ok();
    let argv: Vec<String> = std::env::args_os()
        .map(|arg| arg.to_string_lossy().into_owned())
        .collect();

    info!("==================== new whalebars {command} run ====================");
    info!(
        version = env!("CARGO_PKG_VERSION"),
        cwd = ?cwd,
        log_file = ?log_file,
        argv = ?argv,
        started_at = %chrono::Utc::now().to_rfc3339(),
        "whalebars invoked"
    );
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let log_file = cli.global.log_file();

    init_tracing(log_file.clone())?;
    log_invocation(cli.command.name(), log_file.as_ref());

    let global = cli.global;
    match cli.command {
        Commands::Ingest(args) => {
            let raw_dir = args
                .raw_dir
                .unwrap_or_else(|| global.data_dir.join("raw"));
            let config = whalebars_rs::Config {
                data_dir: global.data_dir.clone(),
                ..whalebars_rs::Config::default()
            };
            let summary = run_ingest(&config, &raw_dir)?;
            info!("{}", report::format_ingest(&summary));
        }
        Commands::Build(args) => {
            let config = args.into_config(&global)?;
            run_build_bars(&config)?;
        }
        Commands::Label(args) => {
            let config = args.into_config(&global)?;
            run_label(&config)?;
        }
        Commands::Baseline(args) => {
            let (config, signal) = args.into_config(&global)?;
            let outcome = run_baseline(
                &config,
                &signal.horizon,
                signal.imb,
                signal.min_count,
                signal.peek,
            )?;
            info!("{}", report::format_baseline(&outcome));
        }
        Commands::Sweep(args) => {
            let horizon = args.horizon;
            let config = args.stage.into_config(&global)?;
            let tags: Vec<String> = match horizon {
                Some(tag) => vec![config.horizon(&tag)?.tag.clone()],
                None => config.horizons.iter().map(|h| h.tag.clone()).collect(),
            };
            for tag in tags {
                let outcome = run_sweep(&config, &tag)?;
                info!("{}", report::format_sweep(&outcome, config.report_top));
            }
        }
        Commands::Run(args) => {
            let config = args.into_config(&global)?;
            for outcome in run_all(&config)? {
                info!("{}", report::format_sweep(&outcome, config.report_top));
            }
        }
    }
    Ok(())
}
