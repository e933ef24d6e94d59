//! Memory subsystem of the sparse accelerator.
//!
//! Components talk only through timing ports and scheduler events; every
//! callback receives the shared [`SimContext`].

pub mod arbiter;
pub mod decoder;
pub mod define;
pub mod dma;
pub mod dram;
pub mod error;
pub mod event;
pub mod hash_cam;
pub mod model;
pub mod packet;
pub mod port;
pub mod source;
pub mod stats;
pub mod subsystem;
pub mod write_buffer;

pub use error::{SimError, SimResult};
pub use event::{BankKind, Event, EventScheduler};
pub use model::{create_simulation, SubsystemModel};
pub use packet::{Packet, PacketLedger};
pub use stats::{Report, Stats};
pub use subsystem::{MemSubsystem, RunOutcome, SubsystemConfig};

/// State shared by every component of one subsystem.
#[derive(Debug)]
pub struct SimContext {
  pub sched: EventScheduler,
  pub stats: Stats,
  ledger: PacketLedger,
  fault: Option<SimError>,
}

impl SimContext {
  pub fn new(banks: usize) -> Self {
    Self {
      sched: EventScheduler::new(),
      stats: Stats::new(banks),
      ledger: PacketLedger::default(),
      fault: None,
    }
  }

  pub fn now(&self) -> u64 {
    self.sched.now()
  }

  /// Register a packet created inside the subsystem.
  pub fn issue(&mut self, pkt: Packet) -> Packet {
    self.ledger.issue(pkt)
  }

  /// Hand a packet to its final consumer.
  pub fn retire(&mut self, pkt: Packet) {
    if let Err(e) = self.ledger.retire(pkt) {
      self.raise(e);
    }
  }

  pub fn retired(&self) -> u64 {
    self.ledger.retired()
  }

  /// Record a fatal fault; the first one wins.
  pub fn raise(&mut self, err: SimError) {
    log::error!("t={} {}", self.now(), err);
    if self.fault.is_none() {
      self.fault = Some(err);
    }
  }

  pub fn raise_protocol(&mut self, msg: impl Into<String>) {
    self.raise(SimError::protocol(msg));
  }

  pub fn has_fault(&self) -> bool {
    self.fault.is_some()
  }

  pub fn take_fault(&mut self) -> Option<SimError> {
    self.fault.take()
  }
}
