use std::fs::File;
use std::io::{self, BufWriter, Result, Write};
use std::path::Path;

use sim::simulator::Simulation;

use super::config::AppConfig;
use super::sim::inject::inject_message;
use super::sim::mode::{SimConfig, StepMode};
use super::sim::model::{is_quiescent, model_step};
use super::sim::shell::{Command, Shell};
use super::utils::log::set_log;
use super::utils::report::{model_status, print_report, print_simulation_records, write_report};
use crate::arch::sparse::model::{create_simulation, SharedSubsystem, CONTROL_PORT, SUBSYSTEM_ID};
use crate::arch::sparse::{Report, RunOutcome, SubsystemConfig};
use crate::log_info;

/// How a run ended.
#[derive(Debug, Clone)]
pub struct RunSummary {
  /// `None` when the user quit the step shell early.
  pub outcome: Option<RunOutcome>,
  pub report: Report,
}

/// Drives the DEVS simulation that hosts the memory subsystem.
pub struct Simulator {
  config: SimConfig,
  simulation: Simulation,
  subsystem: SharedSubsystem,
  trace_writer: Option<BufWriter<File>>,
  started: bool,
}

impl Simulator {
  pub fn new(config: SimConfig, subsystem_config: &SubsystemConfig) -> Result<Self> {
    let (simulation, subsystem) = create_simulation(subsystem_config, config.trace_file.is_some())?;
    let trace_writer = match &config.trace_file {
      Some(path) => Some(BufWriter::new(File::create(path)?)),
      None => None,
    };
    log_info!(
      "sparse memory subsystem: {} banks, {} parameters, max {} cycles",
      subsystem_config.banks,
      subsystem_config.params.len(),
      subsystem_config.max_cycles
    );
    Ok(Self {
      config,
      simulation,
      subsystem,
      trace_writer,
      started: false,
    })
  }

  pub fn from_app_config(app: &AppConfig) -> Result<Self> {
    Self::new(app.sim_config(), &app.subsystem_config())
  }

  pub fn subsystem(&self) -> SharedSubsystem {
    SharedSubsystem::clone(&self.subsystem)
  }

  pub fn run(&mut self) -> Result<RunSummary> {
    if self.config.quiet {
      set_log(false);
    }
    self.start();
    match self.config.step_mode {
      StepMode::Continuous => self.run_continuous()?,
      StepMode::Step => self.run_step_mode()?,
    }
    self.finish()
  }

  fn start(&mut self) {
    if !self.started {
      self.started = true;
      inject_message(&mut self.simulation, SUBSYSTEM_ID, CONTROL_PORT, "start");
    }
  }

  /// One model step. False once the simulation has nothing left to do.
  pub fn advance(&mut self) -> Result<bool> {
    self.start();
    if is_quiescent(&mut self.simulation) {
      return Ok(false);
    }
    if let Err(e) = model_step(&mut self.simulation, &mut self.trace_writer) {
      return Err(self.fault_or(e));
    }
    Ok(true)
  }

  /// Prefer the subsystem's own fault over the opaque DEVS error.
  fn fault_or(&self, err: io::Error) -> io::Error {
    match self.subsystem.lock() {
      Ok(sys) => sys.fault().cloned().map(io::Error::from).unwrap_or(err),
      Err(_) => err,
    }
  }

  fn run_continuous(&mut self) -> Result<()> {
    log_info!("continuous mode");
    while self.advance()? {}
    Ok(())
  }

  fn run_step_mode(&mut self) -> Result<()> {
    let mut shell = Shell::new()?;
    println!("Step mode - Enter steps one tick, 'si N' steps N, 's' status, 'c' continue, 'q' quit");
    loop {
      match shell.read_command()? {
        Command::Step(n) => {
          for _ in 0..n {
            if !self.advance()? {
              println!("simulation is idle");
              return Ok(());
            }
          }
          self.print_status();
        },
        Command::Status => self.print_status(),
        Command::Continue => return self.run_continuous(),
        Command::Quit => return Ok(()),
      }
    }
  }

  fn print_status(&mut self) {
    for line in model_status(&mut self.simulation) {
      println!("{}", line);
    }
  }

  fn finish(&mut self) -> Result<RunSummary> {
    if let Some(writer) = &mut self.trace_writer {
      writer.flush()?;
    }
    let (outcome, report) = {
      let sys = self
        .subsystem
        .lock()
        .map_err(|_| io::Error::new(io::ErrorKind::Other, "subsystem lock poisoned"))?;
      (sys.outcome(), sys.report())
    };

    match outcome {
      Some(RunOutcome::Finished) => log_info!("run finished after {} cycles", report.cycles),
      Some(RunOutcome::CycleLimit) => log_info!("cycle limit reached at {} cycles", report.cycles),
      Some(RunOutcome::Stalled) => log::warn!("run stalled at cycle {}: no event left to fire", report.cycles),
      None => log_info!("run interrupted at cycle {}", report.cycles),
    }
    if !self.config.quiet {
      print_report(&report);
      print_simulation_records(&mut self.simulation);
    }
    if let Some(path) = &self.config.report_file {
      write_report(Path::new(path), &report)?;
      log_info!("report written to {}", path);
    }
    Ok(RunSummary { outcome, report })
  }
}
