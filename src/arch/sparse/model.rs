use serde::Serialize;
use sim::models::model_trait::{DevsModel, Reportable, ReportableModel, SerializableModel};
use sim::models::{Model, ModelMessage, ModelRecord};
use sim::simulator::{Connector, Services, Simulation};
use sim::utils::errors::SimulationError;
use std::f64::INFINITY;
use std::sync::{Arc, Mutex, MutexGuard};

use super::error::SimResult;
use super::event::Event;
use super::subsystem::{MemSubsystem, RunOutcome, SubsystemConfig};
use crate::model_record;

/// Handle shared between the DEVS model and whoever drives the simulation.
pub type SharedSubsystem = Arc<Mutex<MemSubsystem>>;

pub const SUBSYSTEM_ID: &str = "subsystem";
pub const MILESTONE_ID: &str = "milestones";
pub const CONTROL_PORT: &str = "control";
pub const PROGRESS_PORT: &str = "progress";

/// Content of the messages on the progress port.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Progress {
  Tick { tick: u64, events: Vec<Event> },
  ParamComplete { index: usize, name: String, tick: u64 },
  Stopped { outcome: RunOutcome, tick: u64 },
}

fn lock(shared: &SharedSubsystem) -> Result<MutexGuard<'_, MemSubsystem>, SimulationError> {
  shared.lock().map_err(|_| SimulationError::InvalidModelState)
}

/// The memory subsystem as one DEVS atomic model.
///
/// Idle until a `start` arrives on the control port; afterwards every internal
/// event handles one subsystem tick and the time advance is the distance to the
/// next scheduled tick.
#[derive(Debug, Clone)]
pub struct SubsystemModel {
  subsystem: SharedSubsystem,
  control_port: String,
  progress_port: String,
  /// Also publish every handled tick on the progress port.
  trace_ticks: bool,
  param_names: Vec<String>,
  params_seen: u64,
  running: bool,
  until_next_event: f64,
  records: Vec<ModelRecord>,
}

impl SubsystemModel {
  pub fn new(
    subsystem: SharedSubsystem,
    param_names: Vec<String>,
    control_port: String,
    progress_port: String,
    trace_ticks: bool,
  ) -> Self {
    Self {
      subsystem,
      control_port,
      progress_port,
      trace_ticks,
      param_names,
      params_seen: 0,
      running: false,
      until_next_event: INFINITY,
      records: Vec::new(),
    }
  }

  pub fn is_running(&self) -> bool {
    self.running
  }

  fn message(&self, progress: &Progress) -> Result<ModelMessage, SimulationError> {
    let content = serde_json::to_string(progress).map_err(|_| SimulationError::InvalidModelState)?;
    Ok(ModelMessage {
      content,
      port_name: self.progress_port.clone(),
    })
  }
}

impl DevsModel for SubsystemModel {
  fn events_ext(&mut self, incoming_message: &ModelMessage, services: &mut Services) -> Result<(), SimulationError> {
    if incoming_message.port_name != self.control_port {
      return Ok(());
    }
    match incoming_message.content.trim() {
      "start" => {
        let shared = Arc::clone(&self.subsystem);
        let mut sys = lock(&shared)?;
        sys.start();
        self.running = sys.outcome().is_none();
        self.until_next_event = if self.running { 0.0 } else { INFINITY };
        model_record!(self, services, "start", "params={}", self.param_names.len());
      },
      "stop" => {
        self.running = false;
        self.until_next_event = INFINITY;
        model_record!(self, services, "stop", "control");
      },
      other => log::warn!("subsystem model ignores control message '{}'", other),
    }
    Ok(())
  }

  fn events_int(&mut self, services: &mut Services) -> Result<Vec<ModelMessage>, SimulationError> {
    let mut messages = Vec::new();
    if !self.running {
      self.until_next_event = INFINITY;
      return Ok(messages);
    }

    let shared = Arc::clone(&self.subsystem);
    let mut sys = lock(&shared)?;
    let handled = sys.step()?;
    if let (true, Some(record)) = (self.trace_ticks, handled) {
      messages.push(self.message(&Progress::Tick {
        tick: record.tick,
        events: record.events,
      })?);
    }

    let completed = sys.stats().params_completed;
    while self.params_seen < completed {
      let index = self.params_seen as usize;
      let name = self.param_names.get(index).cloned().unwrap_or_default();
      model_record!(self, services, "param_complete", name);
      messages.push(self.message(&Progress::ParamComplete {
        index,
        name,
        tick: sys.now(),
      })?);
      self.params_seen += 1;
    }

    match sys.outcome() {
      Some(outcome) => {
        self.running = false;
        self.until_next_event = INFINITY;
        model_record!(self, services, "stopped", "{:?} at tick {}", outcome, sys.now());
        messages.push(self.message(&Progress::Stopped {
          outcome,
          tick: sys.now(),
        })?);
      },
      None => {
        let next = sys.next_tick().unwrap_or(sys.now());
        self.until_next_event = next.saturating_sub(sys.now()) as f64;
      },
    }
    Ok(messages)
  }

  fn time_advance(&mut self, time_delta: f64) {
    self.until_next_event -= time_delta;
  }

  fn until_next_event(&self) -> f64 {
    self.until_next_event
  }
}

impl Reportable for SubsystemModel {
  fn status(&self) -> String {
    match self.subsystem.lock() {
      Ok(sys) => {
        let stats = sys.stats();
        format!(
          "t={} param={}/{} ({}) slices={} mac_ops={} dram_bursts={} dropped_writes={}",
          sys.now(),
          sys.decoder().param_index() + 1,
          self.param_names.len(),
          sys.decoder().current_param().name,
          stats.slices_completed,
          stats.mac_ops,
          stats.dram_bursts,
          stats.dropped_writes
        )
      },
      Err(_) => String::from("poisoned"),
    }
  }

  fn records(&self) -> &Vec<ModelRecord> {
    &self.records
  }
}

impl ReportableModel for SubsystemModel {}

impl SerializableModel for SubsystemModel {
  fn get_type(&self) -> &'static str {
    "SubsystemModel"
  }
}

/// Keeps the milestones published on the progress port; tick traces are only counted.
#[derive(Debug, Clone)]
pub struct MilestoneLog {
  progress_port: String,
  ticks: u64,
  records: Vec<ModelRecord>,
}

impl MilestoneLog {
  pub fn new(progress_port: String) -> Self {
    Self {
      progress_port,
      ticks: 0,
      records: Vec::new(),
    }
  }
}

impl DevsModel for MilestoneLog {
  fn events_ext(&mut self, incoming_message: &ModelMessage, services: &mut Services) -> Result<(), SimulationError> {
    if incoming_message.port_name != self.progress_port {
      return Ok(());
    }
    let value: serde_json::Value =
      serde_json::from_str(&incoming_message.content).map_err(|_| SimulationError::InvalidModelState)?;
    let kind = value.get("kind").and_then(|k| k.as_str()).unwrap_or("unknown");
    if kind == "tick" {
      self.ticks += 1;
      return Ok(());
    }
    model_record!(self, services, kind, incoming_message.content);
    Ok(())
  }

  fn events_int(&mut self, _services: &mut Services) -> Result<Vec<ModelMessage>, SimulationError> {
    Ok(Vec::new())
  }

  fn time_advance(&mut self, _time_delta: f64) {}

  fn until_next_event(&self) -> f64 {
    INFINITY
  }
}

impl Reportable for MilestoneLog {
  fn status(&self) -> String {
    format!("milestones={} traced_ticks={}", self.records.len(), self.ticks)
  }

  fn records(&self) -> &Vec<ModelRecord> {
    &self.records
  }
}

impl ReportableModel for MilestoneLog {}

impl SerializableModel for MilestoneLog {
  fn get_type(&self) -> &'static str {
    "MilestoneLog"
  }
}

/// Post the subsystem and its milestone log into a fresh DEVS simulation.
pub fn create_simulation(cfg: &SubsystemConfig, trace_ticks: bool) -> SimResult<(Simulation, SharedSubsystem)> {
  let subsystem = Arc::new(Mutex::new(MemSubsystem::new(cfg)?));
  let param_names = cfg.params.iter().map(|p| p.name.clone()).collect();

  let models = vec![
    Model::new(
      String::from(SUBSYSTEM_ID),
      Box::new(SubsystemModel::new(
        Arc::clone(&subsystem),
        param_names,
        String::from(CONTROL_PORT),
        String::from(PROGRESS_PORT),
        trace_ticks,
      )),
    ),
    Model::new(
      String::from(MILESTONE_ID),
      Box::new(MilestoneLog::new(String::from(PROGRESS_PORT))),
    ),
  ];

  let connectors = vec![Connector::new(
    String::from("subsystem_milestones"),
    String::from(SUBSYSTEM_ID),
    String::from(MILESTONE_ID),
    String::from(PROGRESS_PORT),
    String::from(PROGRESS_PORT),
  )];

  Ok((Simulation::post(models, connectors), subsystem))
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::arch::sparse::decoder::params::LayerParam;
  use sim::simulator::Message;

  fn tiny() -> SubsystemConfig {
    SubsystemConfig {
      banks: 2,
      burst_lines: 2,
      dram_channels: 2,
      dram_read_latency: 3,
      dram_write_latency: 2,
      params: vec![LayerParam::new("first", 32, 0, 256, 16), LayerParam::new("second", 16, 0, 256, 16)],
      max_cycles: 50_000,
      ..SubsystemConfig::default()
    }
  }

  fn quiescent(simulation: &mut Simulation) -> bool {
    simulation.get_messages().is_empty()
      && simulation
        .models()
        .iter()
        .all(|m| m.until_next_event() == INFINITY)
  }

  fn start(simulation: &mut Simulation) {
    simulation.inject_input(Message::new(
      String::from("host"),
      String::from("default"),
      String::from(SUBSYSTEM_ID),
      String::from(CONTROL_PORT),
      simulation.get_global_time(),
      String::from("start"),
    ));
  }

  #[test]
  fn test_model_is_idle_until_started() {
    let (mut simulation, shared) = create_simulation(&tiny(), false).unwrap();
    assert!(quiescent(&mut simulation));
    assert_eq!(shared.lock().unwrap().now(), 0);
  }

  #[test]
  fn test_devs_run_reaches_the_end_and_logs_milestones() {
    let (mut simulation, shared) = create_simulation(&tiny(), false).unwrap();
    start(&mut simulation);
    for _ in 0..100_000 {
      simulation.step().unwrap();
      if quiescent(&mut simulation) {
        break;
      }
    }
    let sys = shared.lock().unwrap();
    assert_eq!(sys.outcome(), Some(RunOutcome::Finished));
    assert_eq!(sys.stats().params_completed, 2);

    let log = simulation
      .models()
      .into_iter()
      .find(|m| m.id() == MILESTONE_ID)
      .unwrap();
    let actions: Vec<&str> = log.records().iter().map(|r| r.action.as_str()).collect();
    assert_eq!(actions, vec!["param_complete", "param_complete", "stopped"]);
  }
}
