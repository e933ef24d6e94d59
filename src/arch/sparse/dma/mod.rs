//! Per-bank double-buffered DMA.

pub mod engine;
pub mod policy;

pub use engine::{DmaEngine, SlotState, TransferState};
pub use policy::{BankPolicy, DmaCommand};
