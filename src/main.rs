use std::fs::File;
use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex};

use clap::{Args, Parser, Subcommand};
use tracing::{error, info};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use jakarta_pm25::config::{Config, IntervalTiePolicy, OutputFormat};
use jakarta_pm25::errors::EngineError;
use jakarta_pm25::pipeline::{run_pipeline, PipelineOptions};

#[derive(Parser, Debug)]
#[command(name = "jakarta-pm25", version, about = "Spatio-temporal PM2.5 interpolation over Jakarta kelurahan", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Interpolate sensor measurements onto the kelurahan polygon grid
    Interpolate(InterpolateArgs),
}

#[derive(Args, Debug)]
struct InterpolateArgs {
    /// Prepared measurement table (CSV: sensor_id, longitude, latitude, datetime, pm25)
    #[arg(long)]
    input: PathBuf,

    /// Kelurahan polygon shapefile (WGS84)
    #[arg(long)]
    shapefile: PathBuf,

    /// Directory for result tables and the run log
    #[arg(long)]
    output_dir: PathBuf,

    /// Optional station table (CSV: sensor_id, longitude, latitude) that
    /// overrides measurement-table coordinates
    #[arg(long)]
    stations: Option<PathBuf>,

    /// Minimum active sensors for a timestamp to be interpolated
    #[arg(long, default_value_t = 50)]
    s_min: usize,

    /// IDW neighbor cap (recorded in the output filename)
    #[arg(long, default_value_t = 10)]
    neighbors: usize,

    /// IDW power
    #[arg(long, default_value_t = 2.0)]
    power: f64,

    /// Grid spacing in degrees
    #[arg(long, default_value_t = 0.005)]
    cell_size_deg: f64,

    /// Sensor validity box as lon_min lon_max lat_min lat_max
    #[arg(long, num_args = 4, value_names = ["LON_MIN", "LON_MAX", "LAT_MIN", "LAT_MAX"])]
    bbox: Option<Vec<f64>>,

    /// Readings above this are treated as missing
    #[arg(long, default_value_t = 500.0)]
    pm25_cap: f64,

    /// Tie resolution between 30-minute and hourly sensor majorities
    #[arg(long, value_enum, default_value_t = IntervalTiePolicy::PreferHourly)]
    interval_tie_policy: IntervalTiePolicy,

    /// Worker threads (default: hardware threads minus one)
    #[arg(long)]
    workers: Option<usize>,

    /// Soft per-timestamp budget in seconds
    #[arg(long, default_value_t = 60)]
    task_timeout_seconds: u64,

    /// Output table format
    #[arg(long, value_enum, default_value_t = OutputFormat::Csv)]
    format: OutputFormat,
}

fn main() {
    let cli = Cli::parse();
    let code = match cli.command {
        Command::Interpolate(args) => run_interpolate(args),
    };
    std::process::exit(code);
}

fn run_interpolate(args: InterpolateArgs) -> i32 {
    let defaults = Config::default();
    let mut config = Config {
        s_min: args.s_min,
        neighbors: args.neighbors,
        power: args.power,
        cell_size_deg: args.cell_size_deg,
        pm25_cap: args.pm25_cap,
        interval_tie_policy: args.interval_tie_policy,
        workers: args.workers.unwrap_or(defaults.workers),
        task_timeout_seconds: args.task_timeout_seconds,
        output_format: args.format,
        ..defaults
    };
    if let Some(bbox) = &args.bbox {
        config.bbox.lon_min = bbox[0];
        config.bbox.lon_max = bbox[1];
        config.bbox.lat_min = bbox[2];
        config.bbox.lat_max = bbox[3];
    }

    if let Err(e) = std::fs::create_dir_all(&args.output_dir) {
        eprintln!("Cannot create output directory {:?}: {}", args.output_dir, e);
        return 2;
    }
    init_logging(&args.input, &args.output_dir);

    if let Err(e) = config.validate() {
        error!("{}", e);
        return e.exit_code();
    }

    let opts = PipelineOptions {
        input: args.input,
        shapefile: args.shapefile,
        output_dir: args.output_dir,
        stations: args.stations,
        config,
    };
    let cancel = Arc::new(AtomicBool::new(false));

    match run_pipeline(&opts, cancel) {
        Ok(report) => {
            info!(
                "Wrote {} result rows to {:?} and distances to {:?}",
                report.result_rows, report.results_path, report.distances_path
            );
            if report.summary.task_failures > 0 || report.summary.timestamps_cancelled > 0 {
                1
            } else {
                0
            }
        }
        Err(e) => {
            error!("{:#}", e);
            match e.downcast_ref::<EngineError>() {
                Some(engine) => engine.exit_code(),
                None => 3,
            }
        }
    }
}

/// Stdout layer plus a log file mirroring the input basename with a
/// timestamped suffix, under the output directory.
fn init_logging(input: &PathBuf, output_dir: &PathBuf) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let stdout_layer = tracing_subscriber::fmt::layer();

    let basename = input
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| "run".to_string());
    let stamp = chrono::Local::now().format("%Y%m%d_%H%M%S");
    let log_path = output_dir.join(format!("{}_{}.log", basename, stamp));

    match File::create(&log_path) {
        Ok(file) => {
            let file_layer = tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(Mutex::new(file));
            tracing_subscriber::registry()
                .with(filter)
                .with(stdout_layer)
                .with(file_layer)
                .init();
            info!("Logging to {:?}", log_path);
        }
        Err(e) => {
            tracing_subscriber::registry()
                .with(filter)
                .with(stdout_layer)
                .init();
            error!("Cannot create log file {:?}: {}; logging to stdout only", log_path, e);
        }
    }
}
