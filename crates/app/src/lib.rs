use std::ffi::OsString;
use std::io::Write;
use std::path::{Path, PathBuf};

use clap::error::ErrorKind;
use clap::{ArgAction, Args, Parser, Subcommand};
use tracing::{error, info, warn};
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

use octlens_core::annotation::{process_annotation, AnnotationOverlayCompositor};
use octlens_core::backend::InferenceBackend;
use octlens_core::config::{config_path, data_dir, initialize_data_dir, AppConfig};
use octlens_core::logging::{self, LogFilters, DEFAULT_LOG_FILTER};
use octlens_core::model::{load_classifier, ModelHandle};
use octlens_core::pipeline::{PredictOutcome, SaliencyPipeline};
use octlens_core::runtime;
use octlens_core::PipelineError;

const EXIT_SUCCESS: i32 = 0;
const EXIT_FAILURE: i32 = 1;

#[derive(Parser, Debug)]
#[command(
    name = "octlens",
    about = "Grad-CAM saliency and mask annotation for retinal OCT scans"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    #[arg(
        short = 'v',
        long = "verbose",
        action = ArgAction::Count,
        global = true,
        help = "Increase log verbosity (-v: debug, -vv: trace)"
    )]
    verbose: u8,

    #[arg(
        long = "log-filter",
        value_name = "FILTER",
        global = true,
        help = "Explicit tracing filter (overrides RUST_LOG and -v)"
    )]
    log_filter: Option<String>,

    #[arg(long, global = true, help = "Data directory holding config.toml, models and logs")]
    data_dir: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Classify a scan and print the prediction with its saliency overlay as JSON.
    Predict(PredictArgs),
    /// Outline a region mask on a scan and write the result.
    Annotate(AnnotateArgs),
}

#[derive(Args, Debug)]
struct PredictArgs {
    #[arg(help = "Path to the OCT scan")]
    image: PathBuf,
}

#[derive(Args, Debug)]
struct AnnotateArgs {
    #[arg(help = "Path to the OCT scan")]
    scan: PathBuf,
    #[arg(help = "Path to the single-channel region mask")]
    mask: PathBuf,
    #[arg(help = "Destination image; the format follows the extension")]
    output: PathBuf,
}

/// Parse the process arguments, run the command, and return its exit code.
pub fn run_from_env() -> i32 {
    run(std::env::args_os())
}

pub fn run<I, T>(args: I) -> i32
where
    I: IntoIterator<Item = T>,
    T: Into<OsString> + Clone,
{
    let cli = match Cli::try_parse_from(args) {
        Ok(cli) => cli,
        Err(error) => return usage_exit(&error),
    };

    let resolved_data_dir = data_dir(cli.data_dir.as_deref());
    // Only prediction bootstraps the data directory; annotation leaves no
    // trace outside its output unless the directory is already there.
    let (init_result, persist) = match &cli.command {
        Commands::Predict(_) => (initialize_data_dir(&resolved_data_dir), true),
        Commands::Annotate(_) => (Ok(()), resolved_data_dir.is_dir()),
    };
    let config_result = AppConfig::load_from_path(&config_path(&resolved_data_dir));

    let preloaded = match (&cli.command, &config_result) {
        (Commands::Predict(_), Ok(config)) => runtime::setup_runtime_libs(
            Some(resolved_data_dir.as_path()),
            config.model.backend == InferenceBackend::Cuda,
        ),
        (Commands::Predict(_), Err(_)) => {
            runtime::setup_runtime_libs(Some(resolved_data_dir.as_path()), false)
        }
        (Commands::Annotate(_), _) => 0,
    };

    let filters = LogFilters::select(
        cli.log_filter.as_deref(),
        cli.verbose,
        std::env::var("RUST_LOG").ok().as_deref(),
    );
    let log_dir = persist.then(|| logging::log_dir(&resolved_data_dir));
    let file_error = init_logging(log_dir.as_deref(), &filters);
    if persist {
        logging::install_crash_reporter(logging::crash_dir(&resolved_data_dir));
    }
    log_startup_metadata(command_name(&cli.command), &resolved_data_dir);

    if let Some(reason) = file_error {
        warn!(%reason, "Log file unavailable, logging to the console only");
    }
    if let Err(err) = init_result {
        warn!(error = %format!("{err:#}"), "Failed to initialize data directory");
    }

    let config = config_result.unwrap_or_else(|err| {
        warn!(error = %format!("{err:#}"), "Failed to load config file, using defaults");
        AppConfig::default()
    });

    match cli.command {
        Commands::Predict(args) => {
            runtime::log_runtime_lib_status(preloaded);
            run_predict(&args.image, &resolved_data_dir, &config)
        }
        Commands::Annotate(args) => process_annotation(
            &AnnotationOverlayCompositor::from_config(&config.annotation),
            &args.scan,
            &args.mask,
            &args.output,
        ),
    }
}

/// Help and version requests succeed; every other parse failure exits with 1.
fn usage_exit(error: &clap::Error) -> i32 {
    let _ = error.print();
    match error.kind() {
        ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => EXIT_SUCCESS,
        _ => EXIT_FAILURE,
    }
}

fn run_predict(image: &Path, data_dir: &Path, config: &AppConfig) -> i32 {
    let outcome = predict_outcome(image, data_dir, config);
    if let PredictOutcome::Error { error } = &outcome {
        error!(image = %image.display(), %error, "Prediction failed");
    }
    emit_json(&outcome)
}

fn predict_outcome(image: &Path, data_dir: &Path, config: &AppConfig) -> PredictOutcome {
    // Report a missing image before paying for the model load.
    if !image.is_file() {
        return PredictOutcome::from_result(Err(PipelineError::InputNotFound {
            role: "image",
            path: image.to_path_buf(),
        }));
    }

    match load_classifier(config, data_dir) {
        Ok(classifier) => {
            SaliencyPipeline::new(ModelHandle::new(classifier), config).predict_outcome(image)
        }
        Err(err) => PredictOutcome::Error {
            error: format!("{err:#}"),
        },
    }
}

fn emit_json(outcome: &PredictOutcome) -> i32 {
    let encoded = match serde_json::to_string(outcome) {
        Ok(encoded) => encoded,
        Err(err) => {
            error!(error = %err, "Failed to serialize prediction");
            return EXIT_FAILURE;
        }
    };

    let mut stdout = std::io::stdout().lock();
    if let Err(err) = writeln!(stdout, "{encoded}").and_then(|()| stdout.flush()) {
        error!(error = %err, "Failed to write prediction to stdout");
        return EXIT_FAILURE;
    }

    if outcome.is_error() {
        EXIT_FAILURE
    } else {
        EXIT_SUCCESS
    }
}

fn command_name(command: &Commands) -> &'static str {
    match command {
        Commands::Predict(_) => "predict",
        Commands::Annotate(_) => "annotate",
    }
}

/// Console output goes to stderr, since stdout carries the prediction JSON.
/// Returns why the log file could not be attached, if it was requested.
fn init_logging(log_dir: Option<&Path>, filters: &LogFilters) -> Option<String> {
    let (appender, file_error) = match log_dir.map(logging::rolling_log_file) {
        Some(Ok(appender)) => (Some(appender), None),
        Some(Err(err)) => (None, Some(format!("{err:#}"))),
        None => (None, None),
    };

    let console = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_filter(env_filter(&filters.console, "console"));
    let file = appender.map(|appender| {
        tracing_subscriber::fmt::layer()
            .with_ansi(false)
            .with_writer(appender)
            .with_filter(env_filter(&filters.file, "file"))
    });

    let subscriber = tracing_subscriber::registry().with(console).with(file);
    if let Err(error) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("Failed to initialize tracing subscriber: {error}");
    }
    file_error
}

fn env_filter(filter: &str, sink: &str) -> EnvFilter {
    EnvFilter::try_new(filter).unwrap_or_else(|error| {
        eprintln!("Invalid {sink} log filter '{filter}': {error}. Using '{DEFAULT_LOG_FILTER}'.");
        EnvFilter::new(DEFAULT_LOG_FILTER)
    })
}

fn log_startup_metadata(command: &'static str, data_dir: &Path) {
    info!(
        command,
        pid = std::process::id(),
        data_dir = %data_dir.display(),
        config_path = %config_path(data_dir).display(),
        "Runtime startup metadata"
    );
}
