use clap::Parser;
use sparsim::simulator::config::{load_and_merge_configs, CliOverrides};
use sparsim::simulator::utils::log::init_log;
use sparsim::simulator::Simulator;
use std::path::PathBuf;

/// Sparsim - cycle-level model of a sparse accelerator memory subsystem
#[derive(Parser, Debug)]
#[command(name = "sparsim")]
#[command(version = "0.1.0")]
#[command(about = "Bitmap decoder, hash-CAM pairing and banked DMA/DRAM simulator", long_about = None)]
struct Args {
  /// Custom TOML configuration layered over the defaults
  #[arg(short, long, value_name = "FILE")]
  config: Option<PathBuf>,

  /// Enable step mode (interactive stepping)
  #[arg(short, long)]
  step: bool,

  /// Quiet mode (warnings and errors only)
  #[arg(short, long)]
  quiet: bool,

  /// Output JSON-lines trace file path
  #[arg(long, value_name = "FILE")]
  trace_file: Option<String>,

  /// Stop after this many cycles
  #[arg(long, value_name = "N")]
  max_cycles: Option<u64>,

  /// Number of decoder banks / DMA channels
  #[arg(short, long, value_name = "N")]
  banks: Option<usize>,

  /// Write the final statistics as JSON
  #[arg(short, long, value_name = "FILE")]
  report: Option<String>,
}

fn main() -> std::io::Result<()> {
  let args = Args::parse();

  let cli = CliOverrides {
    quiet: args.quiet,
    step: args.step,
    trace_file: args.trace_file,
    report_file: args.report,
    max_cycles: args.max_cycles,
    banks: args.banks,
  };
  let config = load_and_merge_configs(args.config.as_deref(), &cli)?;
  init_log(config.simulation.quiet);

  let mut simulator = Simulator::from_app_config(&config)?;
  let summary = simulator.run()?;
  log::debug!("run outcome: {:?}", summary.outcome);
  Ok(())
}
