use serde::{Deserialize, Serialize};

use crate::arch::sparse::define::INST_ADDR_STRIDE;
use crate::arch::sparse::event::BankKind;
use crate::arch::sparse::packet::PacketTags;

/// One DMA transfer: `lines` bursts for a single bank.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DmaCommand {
  pub bank: usize,
  pub base_addr: u64,
  pub lines: usize,
  pub cmd_id: u64,
}

impl DmaCommand {
  /// The `n`-th sequential command of a self-driving bank.
  pub fn sequential(bank: usize, region_base: u64, n: u64, lines: usize) -> Self {
    Self {
      bank,
      base_addr: region_base + n * INST_ADDR_STRIDE * lines as u64,
      lines,
      cmd_id: n,
    }
  }
}

/// What each bank kind does with its filled slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BankPolicy {
  /// Hands out the buffered lines themselves; a slot is released once drained.
  Bitmap { max_commands: Option<u64> },
  /// Echoes the request; releases when the consumer marks the buffer clear.
  Weight,
  /// Echoes the request once every bank is readable; all banks release together.
  Feature,
}

impl BankPolicy {
  pub fn kind(&self) -> BankKind {
    match self {
      BankPolicy::Bitmap { .. } => BankKind::Bitmap,
      BankPolicy::Weight => BankKind::Weight,
      BankPolicy::Feature => BankKind::Feature,
    }
  }

  pub fn for_kind(kind: BankKind, max_commands: Option<u64>) -> Self {
    match kind {
      BankKind::Bitmap => BankPolicy::Bitmap { max_commands },
      BankKind::Weight => BankPolicy::Weight,
      BankKind::Feature => BankPolicy::Feature,
    }
  }

  /// Whether the bank may self-issue its `issued`-th command.
  pub fn may_issue(&self, issued: u64) -> bool {
    match self {
      BankPolicy::Bitmap { max_commands: Some(max) } => issued < *max,
      _ => true,
    }
  }

  pub fn is_barrier(&self) -> bool {
    matches!(self, BankPolicy::Feature)
  }

  pub fn returns_data(&self) -> bool {
    matches!(self, BankPolicy::Bitmap { .. })
  }

  /// Release rule applied after a response was accepted.
  pub fn releases_after_send(&self, tags: &PacketTags, slot_drained: bool) -> bool {
    match self {
      BankPolicy::Bitmap { .. } => slot_drained,
      BankPolicy::Weight => tags.weight_clear,
      BankPolicy::Feature => false,
    }
  }
}
