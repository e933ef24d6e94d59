use serde_json;
use sim::models::model_trait::DevsModel;
use sim::simulator::Simulation;
use std::fs::File;
use std::io::{self, BufWriter, Result, Write};

/// No message in flight and every model waiting forever.
pub fn is_quiescent(simulation: &mut Simulation) -> bool {
  simulation.get_messages().is_empty()
    && simulation
      .models()
      .iter()
      .all(|model| model.until_next_event() == f64::INFINITY)
}

fn trace_messages(simulation: &Simulation, trace_writer: &mut Option<BufWriter<File>>) -> Result<()> {
  let messages = simulation.get_messages();
  for msg in messages.iter() {
    log::debug!(
      "[MSG] t={:.1} {}:{} -> {}:{} | {}",
      msg.time(),
      msg.source_id(),
      msg.source_port(),
      msg.target_id(),
      msg.target_port(),
      msg.content()
    );
  }

  if let Some(writer) = trace_writer {
    for msg in messages.iter() {
      let content = serde_json::from_str::<serde_json::Value>(msg.content())
        .unwrap_or_else(|_| serde_json::Value::String(msg.content().to_string()));
      let trace_entry = serde_json::json!({
        "time": msg.time(),
        "source": msg.source_id(),
        "source_port": msg.source_port(),
        "target": msg.target_id(),
        "target_port": msg.target_port(),
        "content": content
      });
      writeln!(writer, "{}", trace_entry)?;
    }
    if !messages.is_empty() {
      writer.flush()?;
    }
  }
  Ok(())
}

/// Advance the simulation until its global time moves or nothing is left to do.
///
/// Messages are logged and traced just before they are delivered.
pub fn model_step(simulation: &mut Simulation, trace_writer: &mut Option<BufWriter<File>>) -> Result<()> {
  let time0 = simulation.get_global_time();
  loop {
    if is_quiescent(simulation) {
      return Ok(());
    }
    trace_messages(simulation, trace_writer)?;

    if let Err(e) = simulation.step() {
      return Err(io::Error::new(io::ErrorKind::Other, format!("simulation error: {:?}", e)));
    }
    if simulation.get_global_time() > time0 {
      return Ok(());
    }
  }
}
