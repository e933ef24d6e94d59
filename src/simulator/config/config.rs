use config::{Config, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::Path;

use crate::arch::sparse::decoder::params::{llama_7b_params, LayerParam};
use crate::arch::sparse::define::{CAM_AGGRESSIVE_THRESHOLD, CAM_CAPACITY, CHANNEL_NUM};
use crate::arch::sparse::SubsystemConfig;
use crate::simulator::sim::mode::{SimConfig, StepMode};

/// Shipped defaults, the lowest configuration layer.
pub const DEFAULT_CONFIG: &str = include_str!("default.toml");

/// Environment variables `SPARSIM__<SECTION>__<KEY>` override file values.
pub const ENV_PREFIX: &str = "SPARSIM";

/// Run control.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct SimulationSection {
  #[serde(default)]
  pub quiet: bool,
  #[serde(default)]
  pub step_mode: bool,
  #[serde(default)]
  pub trace_file: String,
  #[serde(default)]
  pub report_file: String,
  #[serde(default = "default_max_cycles")]
  pub max_cycles: u64,
}

fn default_max_cycles() -> u64 {
  50_000_000
}

impl Default for SimulationSection {
  fn default() -> Self {
    Self {
      quiet: false,
      step_mode: false,
      trace_file: String::new(),
      report_file: String::new(),
      max_cycles: default_max_cycles(),
    }
  }
}

/// DMA engines, arbiter and write-back buffer.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct MemorySection {
  #[serde(default = "default_banks")]
  pub banks: usize,
  #[serde(default = "default_burst_lines")]
  pub burst_lines: usize,
  #[serde(default = "default_arbiter_capacity")]
  pub arbiter_capacity: usize,
  #[serde(default = "default_write_buffer_capacity")]
  pub write_buffer_capacity: usize,
  /// Commands per bank after which the bitmap engine stops.
  #[serde(default)]
  pub bitmap_commands: Option<u64>,
}

fn default_banks() -> usize {
  CHANNEL_NUM
}

fn default_burst_lines() -> usize {
  32
}

fn default_arbiter_capacity() -> usize {
  4
}

fn default_write_buffer_capacity() -> usize {
  8
}

impl Default for MemorySection {
  fn default() -> Self {
    Self {
      banks: default_banks(),
      burst_lines: default_burst_lines(),
      arbiter_capacity: default_arbiter_capacity(),
      write_buffer_capacity: default_write_buffer_capacity(),
      bitmap_commands: None,
    }
  }
}

/// Fixed-latency DRAM model and the synthetic contents it serves.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct DramSection {
  #[serde(default = "default_banks")]
  pub channels: usize,
  #[serde(default = "default_queue_depth")]
  pub queue_depth: usize,
  #[serde(default = "default_latency")]
  pub read_latency: u64,
  #[serde(default = "default_latency")]
  pub write_latency: u64,
  #[serde(default = "default_seed")]
  pub seed: u64,
  #[serde(default = "default_density")]
  pub density: f64,
}

fn default_queue_depth() -> usize {
  16
}

fn default_latency() -> u64 {
  20
}

fn default_seed() -> u64 {
  24301
}

fn default_density() -> f64 {
  0.5
}

impl Default for DramSection {
  fn default() -> Self {
    Self {
      channels: default_banks(),
      queue_depth: default_queue_depth(),
      read_latency: default_latency(),
      write_latency: default_latency(),
      seed: default_seed(),
      density: default_density(),
    }
  }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct DecoderSection {
  #[serde(default = "default_cam_capacity")]
  pub cam_capacity: usize,
  #[serde(default = "default_aggressive_threshold")]
  pub aggressive_threshold: usize,
  /// Empty selects the built-in LLaMA-7B table.
  #[serde(default)]
  pub params: Vec<LayerParam>,
}

fn default_cam_capacity() -> usize {
  CAM_CAPACITY
}

fn default_aggressive_threshold() -> usize {
  CAM_AGGRESSIVE_THRESHOLD
}

impl Default for DecoderSection {
  fn default() -> Self {
    Self {
      cam_capacity: default_cam_capacity(),
      aggressive_threshold: default_aggressive_threshold(),
      params: Vec::new(),
    }
  }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct AppConfig {
  #[serde(default)]
  pub simulation: SimulationSection,
  #[serde(default)]
  pub memory: MemorySection,
  #[serde(default)]
  pub dram: DramSection,
  #[serde(default)]
  pub decoder: DecoderSection,
}

impl AppConfig {
  pub fn subsystem_config(&self) -> SubsystemConfig {
    let params = if self.decoder.params.is_empty() {
      llama_7b_params()
    } else {
      self.decoder.params.clone()
    };
    SubsystemConfig {
      banks: self.memory.banks,
      burst_lines: self.memory.burst_lines,
      arbiter_capacity: self.memory.arbiter_capacity,
      write_buffer_capacity: self.memory.write_buffer_capacity,
      bitmap_commands: self.memory.bitmap_commands,
      dram_channels: self.dram.channels,
      dram_queue_depth: self.dram.queue_depth,
      dram_read_latency: self.dram.read_latency,
      dram_write_latency: self.dram.write_latency,
      cam_capacity: self.decoder.cam_capacity,
      aggressive_threshold: self.decoder.aggressive_threshold,
      seed: self.dram.seed,
      density: self.dram.density,
      params,
      max_cycles: self.simulation.max_cycles,
    }
  }

  pub fn sim_config(&self) -> SimConfig {
    let path = |s: &str| if s.is_empty() { None } else { Some(s.to_string()) };
    SimConfig {
      quiet: self.simulation.quiet,
      step_mode: if self.simulation.step_mode {
        StepMode::Step
      } else {
        StepMode::Continuous
      },
      trace_file: path(&self.simulation.trace_file),
      report_file: path(&self.simulation.report_file),
    }
  }
}

/// Command-line values that win over every file and environment layer.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CliOverrides {
  pub quiet: bool,
  pub step: bool,
  pub trace_file: Option<String>,
  pub report_file: Option<String>,
  pub max_cycles: Option<u64>,
  pub banks: Option<usize>,
}

fn invalid(msg: impl Into<String>) -> io::Error {
  io::Error::new(io::ErrorKind::InvalidData, msg.into())
}

/// Parse the shipped `default.toml`.
pub fn load_default_config() -> io::Result<AppConfig> {
  toml::from_str::<AppConfig>(DEFAULT_CONFIG).map_err(|e| invalid(format!("failed to parse default config: {}", e)))
}

/// Parse one TOML file on its own; missing keys take their serde defaults.
pub fn load_config_file(path: &Path) -> io::Result<AppConfig> {
  let content = fs::read_to_string(path)
    .map_err(|e| io::Error::new(io::ErrorKind::NotFound, format!("cannot read config file {:?}: {}", path, e)))?;

  toml::from_str::<AppConfig>(&content).map_err(|e| invalid(format!("failed to parse {:?}: {}", path, e)))
}

/// Defaults, then the optional custom file, then `SPARSIM__*` environment variables.
pub fn load_layered_config(custom: Option<&Path>) -> io::Result<AppConfig> {
  let mut builder = Config::builder().add_source(File::from_str(DEFAULT_CONFIG, FileFormat::Toml));
  if let Some(path) = custom {
    if !path.exists() {
      return Err(io::Error::new(
        io::ErrorKind::NotFound,
        format!("config file {:?} does not exist", path),
      ));
    }
    builder = builder.add_source(File::from(path).format(FileFormat::Toml));
  }
  builder
    .add_source(Environment::with_prefix(ENV_PREFIX).separator("__").try_parsing(true))
    .build()
    .and_then(|c| c.try_deserialize::<AppConfig>())
    .map_err(|e| invalid(format!("failed to load configuration: {}", e)))
}

pub fn apply_cli_overrides(config: &mut AppConfig, cli: &CliOverrides) {
  if cli.quiet {
    config.simulation.quiet = true;
  }
  if cli.step {
    config.simulation.step_mode = true;
  }
  if let Some(file) = &cli.trace_file {
    config.simulation.trace_file = file.clone();
  }
  if let Some(file) = &cli.report_file {
    config.simulation.report_file = file.clone();
  }
  if let Some(cycles) = cli.max_cycles {
    config.simulation.max_cycles = cycles;
  }
  if let Some(banks) = cli.banks {
    config.memory.banks = banks;
  }
}

pub fn validate_config(config: &AppConfig) -> io::Result<()> {
  let memory = &config.memory;
  if memory.banks == 0 || memory.banks > CHANNEL_NUM {
    return Err(invalid(format!(
      "memory.banks must be within 1..={}, got {}",
      CHANNEL_NUM, memory.banks
    )));
  }
  if memory.arbiter_capacity == 0 || memory.write_buffer_capacity == 0 {
    return Err(invalid("memory capacities cannot be 0"));
  }
  if config.dram.channels == 0 || config.dram.queue_depth == 0 {
    return Err(invalid("dram.channels and dram.queue_depth cannot be 0"));
  }
  if config.simulation.max_cycles == 0 {
    return Err(invalid("simulation.max_cycles cannot be 0"));
  }
  for param in &config.decoder.params {
    param.validate().map_err(io::Error::from)?;
  }
  config.subsystem_config().validate().map_err(io::Error::from)
}

/// Layered load, then CLI overrides, then validation.
pub fn load_and_merge_configs(custom_config_path: Option<&Path>, cli: &CliOverrides) -> io::Result<AppConfig> {
  let mut config = load_layered_config(custom_config_path)?;
  apply_cli_overrides(&mut config, cli);
  validate_config(&config)?;
  Ok(config)
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_default_file_matches_serde_defaults() {
    let shipped = load_default_config().unwrap();
    assert_eq!(shipped, AppConfig::default());
    assert_eq!(shipped.subsystem_config().params.len(), 14);
  }

  #[test]
  fn test_partial_file_keeps_defaults() {
    let dir = std::env::temp_dir().join(format!("sparsim-config-{}", std::process::id()));
    fs::create_dir_all(&dir).unwrap();
    let path = dir.join("partial.toml");
    fs::write(
      &path,
      r#"
[memory]
banks = 2

[[decoder.params]]
name = "tiny"
total_row = 32
total_col = 256
slice_row = 16
"#,
    )
    .unwrap();

    let cfg = load_config_file(&path).unwrap();
    assert_eq!(cfg.memory.banks, 2);
    assert_eq!(cfg.memory.arbiter_capacity, 4);
    assert_eq!(cfg.decoder.params[0].slice_col, 32);
    assert_eq!(cfg.decoder.params[0].final_slice_row, 0);
    assert!(validate_config(&cfg).is_ok());
    fs::remove_file(&path).unwrap();
  }

  #[test]
  fn test_cli_overrides_win() {
    let mut cfg = AppConfig::default();
    apply_cli_overrides(
      &mut cfg,
      &CliOverrides {
        quiet: true,
        step: true,
        trace_file: Some("trace.jsonl".to_string()),
        max_cycles: Some(1000),
        banks: Some(3),
        ..CliOverrides::default()
      },
    );
    let sim = cfg.sim_config();
    assert!(sim.quiet);
    assert_eq!(sim.step_mode, StepMode::Step);
    assert_eq!(sim.trace_file.as_deref(), Some("trace.jsonl"));
    assert_eq!(sim.report_file, None);
    assert_eq!(cfg.subsystem_config().banks, 3);
    assert_eq!(cfg.subsystem_config().max_cycles, 1000);
  }

  #[test]
  fn test_invalid_values_are_rejected() {
    let mut cfg = AppConfig::default();
    cfg.memory.banks = 0;
    assert_eq!(validate_config(&cfg).unwrap_err().kind(), io::ErrorKind::InvalidData);

    let mut cfg = AppConfig::default();
    cfg.memory.banks = CHANNEL_NUM + 1;
    assert!(validate_config(&cfg).is_err());

    let mut cfg = AppConfig::default();
    cfg.memory.write_buffer_capacity = 0;
    assert!(validate_config(&cfg).is_err());

    let mut cfg = AppConfig::default();
    cfg.decoder.params = vec![LayerParam::new("bad", 8, 0, 256, 8)];
    assert!(validate_config(&cfg).is_err());
  }

  #[test]
  fn test_missing_custom_file_is_not_found() {
    let err = load_layered_config(Some(Path::new("/nonexistent/sparsim.toml"))).unwrap_err();
    assert_eq!(err.kind(), io::ErrorKind::NotFound);
  }
}
