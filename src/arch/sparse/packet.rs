use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};

use super::error::{SimError, SimResult};

static NEXT_GENERATION: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MemCmd {
  Read,
  Write,
}

/// Routing and control tags carried next to the payload.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PacketTags {
  pub bank: Option<usize>,
  pub slot: Option<usize>,
  pub cmd_id: Option<u64>,
  pub weight_clear: bool,
  pub feature_clear: bool,
}

/// Unit of transfer between ports.
///
/// A packet has exactly one owner. Handing it to a port moves it; a port that
/// refuses it hands it back untouched through `Err(pkt)`.
#[derive(Debug, PartialEq, Eq)]
pub struct Packet {
  addr: u64,
  size: usize,
  cmd: MemCmd,
  payload: Vec<u16>,
  pub tags: PacketTags,
  generation: u64,
}

impl Packet {
  pub fn read(addr: u64, size: usize) -> Self {
    Self::build(addr, size, MemCmd::Read, Vec::new())
  }

  pub fn write(addr: u64, payload: Vec<u16>) -> Self {
    let size = payload.len();
    Self::build(addr, size, MemCmd::Write, payload)
  }

  fn build(addr: u64, size: usize, cmd: MemCmd, payload: Vec<u16>) -> Self {
    Self {
      addr,
      size,
      cmd,
      payload,
      tags: PacketTags::default(),
      generation: NEXT_GENERATION.fetch_add(1, Ordering::Relaxed),
    }
  }

  pub fn addr(&self) -> u64 {
    self.addr
  }

  /// Size in storage words.
  pub fn size(&self) -> usize {
    self.size
  }

  pub fn cmd(&self) -> MemCmd {
    self.cmd
  }

  pub fn is_write(&self) -> bool {
    self.cmd == MemCmd::Write
  }

  pub fn payload(&self) -> &[u16] {
    &self.payload
  }

  pub fn generation(&self) -> u64 {
    self.generation
  }

  /// Turn a read request into its response by attaching the data.
  pub fn fill(&mut self, data: Vec<u16>) {
    self.payload = data;
  }

  /// Append another packet's payload, accumulating its size.
  ///
  /// The absorbed packet is returned so the caller can retire it.
  pub fn merge(&mut self, other: Packet) -> Packet {
    self.size += other.size;
    self.payload.extend_from_slice(&other.payload);
    Packet { payload: Vec::new(), ..other }
  }
}

/// Tracks packet generations for double-free detection.
///
/// Packets created inside the subsystem are issued here and every final
/// consumer retires its packet; retiring the same generation twice is a double
/// free. Retired generations older than the oldest live packet are forgotten.
/// Only checked in debug builds.
#[derive(Debug, Clone, Default)]
pub struct PacketLedger {
  live: BTreeSet<u64>,
  retired: BTreeSet<u64>,
  /// One past the newest issued generation.
  high_water: u64,
  count: u64,
}

impl PacketLedger {
  pub fn issue(&mut self, pkt: Packet) -> Packet {
    if cfg!(debug_assertions) {
      self.live.insert(pkt.generation);
      self.high_water = self.high_water.max(pkt.generation + 1);
    }
    pkt
  }

  pub fn retire(&mut self, pkt: Packet) -> SimResult<()> {
    self.count += 1;
    if !cfg!(debug_assertions) {
      return Ok(());
    }
    self.live.remove(&pkt.generation);
    if !self.retired.insert(pkt.generation) {
      return Err(SimError::protocol(format!(
        "packet generation {} (addr={:#x}) freed twice",
        pkt.generation, pkt.addr
      )));
    }
    self.prune();
    Ok(())
  }

  fn prune(&mut self) {
    let floor = self.live.first().copied().unwrap_or(self.high_water);
    if self.retired.first().map_or(false, |g| *g < floor) {
      self.retired = self.retired.split_off(&floor);
    }
  }

  pub fn retired(&self) -> u64 {
    self.count
  }

  /// Packets issued and not yet retired.
  pub fn live(&self) -> usize {
    self.live.len()
  }

  /// Retired generations still remembered.
  pub fn remembered(&self) -> usize {
    self.retired.len()
  }
}
