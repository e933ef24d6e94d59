use std::collections::{BTreeMap, HashMap, VecDeque};

use super::error::{SimError, SimResult};
use super::port::PortRef;

/// Bank kinds served by a DMA engine; the discriminant is the arbiter upstream id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
pub enum BankKind {
  Bitmap = 0,
  Weight = 1,
  Feature = 2,
}

impl BankKind {
  pub const ALL: [BankKind; 3] = [BankKind::Bitmap, BankKind::Weight, BankKind::Feature];

  pub fn upstream(self) -> usize {
    self as usize
  }

  pub fn from_upstream(upstream: usize) -> Option<Self> {
    Self::ALL.get(upstream).copied()
  }
}

/// Callbacks the subsystem knows how to dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
pub enum Event {
  DmaTick(BankKind),
  DmaRespond(BankKind),
  Arbitrate,
  ArbiterRespond,
  DramTick,
  WriteDrain,
  DecoderTick,
  CamRetry,
  CamClear,
  /// `sendRetryReq` towards a requester port.
  ReqRetry(PortRef),
  /// `sendRetryResp` towards a responder port.
  RespRetry(PortRef),
}

/// Tick-ordered callback queue.
///
/// Events sharing a tick fire in the order they were scheduled.
#[derive(Debug, Clone, Default)]
pub struct EventScheduler {
  now: u64,
  queue: BTreeMap<u64, VecDeque<Event>>,
  pending: HashMap<Event, usize>,
}

impl EventScheduler {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn now(&self) -> u64 {
    self.now
  }

  pub fn schedule(&mut self, event: Event, tick: u64) -> SimResult<()> {
    if tick < self.now {
      return Err(SimError::protocol(format!(
        "{:?} scheduled at tick {} but now is {}",
        event, tick, self.now
      )));
    }
    self.queue.entry(tick).or_default().push_back(event);
    *self.pending.entry(event).or_insert(0) += 1;
    Ok(())
  }

  /// Schedule unless an equal event is already waiting to fire.
  pub fn schedule_once(&mut self, event: Event, tick: u64) -> SimResult<()> {
    if self.is_scheduled(&event) {
      return Ok(());
    }
    self.schedule(event, tick)
  }

  /// `schedule_once` at the current tick.
  pub fn schedule_now(&mut self, event: Event) {
    if !self.is_scheduled(&event) {
      self.push(event, self.now);
    }
  }

  /// `schedule_once` one tick from now.
  pub fn schedule_next(&mut self, event: Event) {
    if !self.is_scheduled(&event) {
      self.push(event, self.now + 1);
    }
  }

  fn push(&mut self, event: Event, tick: u64) {
    self.queue.entry(tick).or_default().push_back(event);
    *self.pending.entry(event).or_insert(0) += 1;
  }

  pub fn is_scheduled(&self, event: &Event) -> bool {
    self.pending.get(event).copied().unwrap_or(0) > 0
  }

  pub fn is_empty(&self) -> bool {
    self.queue.is_empty()
  }

  pub fn next_tick(&self) -> Option<u64> {
    self.queue.keys().next().copied()
  }

  pub fn len(&self) -> usize {
    self.queue.values().map(VecDeque::len).sum()
  }

  /// Pop the earliest event, advancing `now` to its tick.
  pub fn pop(&mut self) -> Option<(u64, Event)> {
    let mut entry = self.queue.first_entry()?;
    let tick = *entry.key();
    let event = entry.get_mut().pop_front()?;
    if entry.get().is_empty() {
      entry.remove();
    }
    if let Some(count) = self.pending.get_mut(&event) {
      *count -= 1;
      if *count == 0 {
        self.pending.remove(&event);
      }
    }
    self.now = tick;
    Some((tick, event))
  }
}
