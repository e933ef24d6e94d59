use serde::{Deserialize, Serialize};

use super::define::{CHANNEL_NUM, FW_ROW_SIZE, MAC_NUM};
use super::error::{SimError, SimResult};

/// Per decoder bank pairing counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LaneStats {
  /// Steps in which a lane refused an insert because it was full.
  pub cam_full: u64,
  pub emit_single: u64,
  pub emit_paired_full: u64,
  pub emit_paired_partial: u64,
}

impl LaneStats {
  pub fn emissions(&self) -> u64 {
    self.emit_single + self.emit_paired_full + self.emit_paired_partial
  }
}

/// Counters shared by every component of one subsystem instance.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Stats {
  pub lanes: Vec<LaneStats>,
  /// Sum of all emitted values.
  pub mac_ops: u64,
  pub dram_bursts: u64,
  /// Write bursts that completed in DRAM.
  pub dram_writes: u64,
  pub writes_enqueued: u64,
  pub dropped_writes: u64,
  pub rejected_commands: u64,
  pub slices_completed: u64,
  pub params_completed: u64,
}

impl Stats {
  pub fn new(banks: usize) -> Self {
    Self {
      lanes: vec![LaneStats::default(); banks],
      ..Self::default()
    }
  }

  pub fn lane_mut(&mut self, bank: usize) -> SimResult<&mut LaneStats> {
    let banks = self.lanes.len();
    self
      .lanes
      .get_mut(bank)
      .ok_or_else(|| SimError::protocol(format!("lane stats for bank {} of {}", bank, banks)))
  }

  pub fn totals(&self) -> LaneStats {
    self.lanes.iter().fold(LaneStats::default(), |acc, s| LaneStats {
      cam_full: acc.cam_full + s.cam_full,
      emit_single: acc.emit_single + s.emit_single,
      emit_paired_full: acc.emit_paired_full + s.emit_paired_full,
      emit_paired_partial: acc.emit_paired_partial + s.emit_paired_partial,
    })
  }

  pub fn mac_utilization(&self, cycles: u64) -> f64 {
    if cycles == 0 {
      return 0.0;
    }
    (FW_ROW_SIZE * self.mac_ops) as f64 / cycles as f64 / CHANNEL_NUM as f64 / MAC_NUM as f64
  }

  pub fn dram_utilization(&self, cycles: u64) -> f64 {
    if cycles == 0 {
      return 0.0;
    }
    (self.dram_bursts * 2 / 8) as f64 / cycles as f64
  }

  /// Share of emitted values that left as part of a pair.
  pub fn pairing_ratio(&self) -> f64 {
    let t = self.totals();
    let paired = 2 * (t.emit_paired_full + t.emit_paired_partial);
    let all = paired + t.emit_single;
    if all == 0 {
      0.0
    } else {
      paired as f64 / all as f64
    }
  }

  pub fn report(&self, cycles: u64) -> Report {
    Report {
      cycles,
      totals: self.totals(),
      mac_utilization: self.mac_utilization(cycles),
      dram_utilization: self.dram_utilization(cycles),
      pairing_ratio: self.pairing_ratio(),
      stats: self.clone(),
    }
  }
}

/// End of run summary, serialised into the report file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Report {
  pub cycles: u64,
  pub totals: LaneStats,
  pub mac_utilization: f64,
  pub dram_utilization: f64,
  pub pairing_ratio: f64,
  pub stats: Stats,
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_utilization_formulas() {
    let mut stats = Stats::new(2);
    stats.mac_ops = 1024;
    stats.dram_bursts = 400;
    // 4 * 1024 / 64 / 8 / 16
    assert!((stats.mac_utilization(64) - 0.5).abs() < 1e-9);
    // 400 * 2 / 8 / 100
    assert!((stats.dram_utilization(100) - 1.0).abs() < 1e-9);
    assert_eq!(stats.mac_utilization(0), 0.0);
  }

  #[test]
  fn test_unknown_bank_is_a_protocol_fault() {
    let mut stats = Stats::new(2);
    assert!(stats.lane_mut(1).is_ok());
    assert!(matches!(stats.lane_mut(2), Err(SimError::Protocol(_))));
    assert_eq!(stats.lanes.len(), 2);
  }

  #[test]
  fn test_pairing_ratio_counts_both_values_of_a_pair() {
    let mut stats = Stats::new(1);
    stats.lanes[0].emit_paired_full = 1;
    stats.lanes[0].emit_single = 2;
    assert!((stats.pairing_ratio() - 0.5).abs() < 1e-9);
  }
}
