mod collectors;
mod config;
mod exec;
mod render;
mod state;

use clap::Parser;
use collectors::Collector;
use config::{Config, DisplayConfig};
use exec::SystemRunner;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "gpustat")]
#[command(version, disable_version_flag = true)]
#[command(about = "One-shot NVIDIA GPU status with per-process owners")]
struct Cli {
    /// Suppress colored output
    #[arg(long)]
    no_color: bool,
    /// Display cmd name of running process
    #[arg(short = 'c', long)]
    show_cmd: bool,
    /// Display username of running process
    #[arg(short = 'u', long)]
    show_user: bool,
    /// Display PID of running process
    #[arg(short = 'p', long)]
    show_pid: bool,
    /// The minimum column width of GPU names, defaults to 16
    #[arg(long, value_name = "WIDTH")]
    gpuname_width: Option<usize>,
    /// Print the snapshot as JSON instead of the colored table
    #[arg(long)]
    json: bool,
    /// Optional YAML configuration file
    #[arg(long, value_name = "PATH")]
    config: Option<String>,
    #[arg(long)]
    print_default_config: bool,
    /// Print version
    #[arg(short = 'v', long, action = clap::ArgAction::Version)]
    version: Option<bool>,
}

impl Cli {
    fn apply(&self, display: &mut DisplayConfig) {
        if self.no_color {
            display.color = false;
        }
        if self.show_cmd {
            display.show_cmd = true;
        }
        if self.show_user {
            display.show_user = true;
        }
        if self.show_pid {
            display.show_pid = true;
        }
        if let Some(width) = self.gpuname_width {
            display.gpuname_width = width;
        }
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    init_tracing();

    let cli = Cli::parse();
    if cli.print_default_config {
        print!("{}", Config::example_yaml());
        return;
    }

    let mut cfg = match &cli.config {
        Some(path) => match Config::load_from_file(path) {
            Ok(cfg) => cfg,
            Err(err) => {
                error!(error = %err, "failed to load configuration");
                eprintln!("gpustat: {err}");
                std::process::exit(1);
            }
        },
        None => Config::default(),
    };
    cli.apply(&mut cfg.display);
    if let Err(err) = cfg.validate() {
        eprintln!("gpustat: {err}");
        std::process::exit(1);
    }

    info!(
        nvidia_smi = %cfg.query.nvidia_smi,
        timeout = %humantime::format_duration(cfg.query.command_timeout),
        "querying gpus"
    );

    let collector = Collector::new(SystemRunner::new(cfg.query.command_timeout), &cfg.query);
    let snapshot = match collector.build_snapshot().await {
        Ok(snapshot) => snapshot,
        Err(err) => {
            error!(error = %err, "gpu query failed");
            eprintln!("Error on calling nvidia-smi: {err}");
            std::process::exit(1);
        }
    };

    if snapshot.is_empty() {
        warn!("nvidia-smi reported no GPUs");
    }
    info!(gpus = snapshot.len(), host = %snapshot.hostname, "snapshot ready");

    if cli.json {
        match serde_json::to_string_pretty(&snapshot) {
            Ok(text) => println!("{text}"),
            Err(err) => {
                error!(error = %err, "failed to serialize snapshot");
                std::process::exit(1);
            }
        }
    } else {
        print!("{}", render::render(&snapshot, &cfg.display));
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}
