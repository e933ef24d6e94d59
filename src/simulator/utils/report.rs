use sim::models::model_trait::Reportable;
use sim::models::Model;
use sim::simulator::Simulation;
use std::fs;
use std::io;
use std::path::Path;

use crate::arch::sparse::Report;
use crate::log_info;

pub fn print_simulation_records(simulation: &mut Simulation) {
  println!("\n--- Simulation Records ---");

  for model in simulation.models().iter() {
    print_model_records(model);
  }

  println!("--- End Records ---\n");
}

fn print_model_records(model: &Model) {
  let records = model.records();
  if !records.is_empty() {
    println!("\n[{}]", model.id());
    for record in records {
      println!("  Time {:.1}: {} {}", record.time, record.action, record.subject);
    }
  }
}

/// One status line per model.
pub fn model_status(simulation: &mut Simulation) -> Vec<String> {
  simulation
    .models()
    .iter()
    .map(|model| format!("[{}] {}", model.id(), model.status()))
    .collect()
}

pub fn print_report(report: &Report) {
  let totals = &report.totals;
  log_info!("cycles            {}", report.cycles);
  log_info!("mac_ops           {}", report.stats.mac_ops);
  log_info!("mac utilisation   {:.4}", report.mac_utilization);
  log_info!("dram bursts       {}", report.stats.dram_bursts);
  log_info!("dram utilisation  {:.4}", report.dram_utilization);
  log_info!("pairing ratio     {:.4}", report.pairing_ratio);
  log_info!(
    "emissions         single={} paired_full={} paired_partial={} cam_full={}",
    totals.emit_single,
    totals.emit_paired_full,
    totals.emit_paired_partial,
    totals.cam_full
  );
  log_info!(
    "writes            enqueued={} dropped={} completed={}",
    report.stats.writes_enqueued,
    report.stats.dropped_writes,
    report.stats.dram_writes
  );
  log_info!(
    "progress          slices={} params={}",
    report.stats.slices_completed,
    report.stats.params_completed
  );
}

/// Pretty JSON report.
pub fn write_report(path: &Path, report: &Report) -> io::Result<()> {
  let json = serde_json::to_string_pretty(report).map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
  fs::write(path, json)
}
