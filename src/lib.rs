pub mod arch;
pub mod simulator;

pub use arch::sparse::{MemSubsystem, RunOutcome, SubsystemConfig};
pub use simulator::sim::mode::{SimConfig, StepMode};
pub use simulator::utils::log;
