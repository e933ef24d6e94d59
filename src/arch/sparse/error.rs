use sim::utils::errors::SimulationError;
use std::fmt;
use std::io;

/// Fatal conditions raised by the memory subsystem.
///
/// Recoverable back-pressure never shows up here: it travels through the
/// retry protocol instead.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SimError {
  /// A component broke the port or ownership contract (double free,
  /// response for an unknown address, bad bank id, ...).
  Protocol(String),
  /// Bad construction parameters.
  Config(String),
}

pub type SimResult<T> = Result<T, SimError>;

impl SimError {
  pub fn protocol(msg: impl Into<String>) -> Self {
    SimError::Protocol(msg.into())
  }

  pub fn config(msg: impl Into<String>) -> Self {
    SimError::Config(msg.into())
  }
}

impl fmt::Display for SimError {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      SimError::Protocol(msg) => write!(f, "protocol violation: {}", msg),
      SimError::Config(msg) => write!(f, "invalid configuration: {}", msg),
    }
  }
}

impl std::error::Error for SimError {}

impl From<SimError> for io::Error {
  fn from(err: SimError) -> Self {
    let kind = match err {
      SimError::Protocol(_) => io::ErrorKind::Other,
      SimError::Config(_) => io::ErrorKind::InvalidData,
    };
    io::Error::new(kind, err.to_string())
  }
}

impl From<SimError> for SimulationError {
  fn from(err: SimError) -> Self {
    log::error!("{}", err);
    SimulationError::InvalidModelState
  }
}
