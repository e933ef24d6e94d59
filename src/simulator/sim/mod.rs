pub mod inject;
pub mod mode;
pub mod model;
pub mod records;
pub mod shell;

pub use inject::inject_message;
pub use mode::{SimConfig, StepMode};
pub use model::{is_quiescent, model_step};
pub use shell::{Command, Shell};
