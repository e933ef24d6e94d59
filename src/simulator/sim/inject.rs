use sim::simulator::{Message, Simulation};

/// Deliver `content` to `target_port` of `target_model` at the current time.
pub fn inject_message(simulation: &mut Simulation, target_model: &str, target_port: &str, content: &str) {
  let msg = Message::new(
    String::from("host"),
    String::from("default"),
    target_model.to_string(),
    target_port.to_string(),
    simulation.get_global_time(),
    content.to_string(),
  );
  simulation.inject_input(msg);
}
