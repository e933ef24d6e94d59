//! Hash-CAM pairing engine.
//!
//! Each lane buckets waiting values by value and tries to pack two of them
//! into one `target`-wide MAC slot.

use std::collections::{BTreeMap, VecDeque};

use super::stats::LaneStats;

/// One decoded row segment waiting in a lane.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CamEntry {
  pub value: u32,
  pub bits: u32,
}

/// What a lane hands to the MAC array.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Emission {
  Single(CamEntry),
  Paired(CamEntry, CamEntry),
}

impl Emission {
  pub fn total(&self) -> u32 {
    match self {
      Emission::Single(a) => a.value,
      Emission::Paired(a, b) => a.value + b.value,
    }
  }

  /// Count this emission into the lane counters.
  pub fn record(&self, target: u32, stats: &mut LaneStats) {
    match self {
      Emission::Single(a) if a.value == target => stats.emit_paired_full += 1,
      Emission::Single(_) => stats.emit_single += 1,
      Emission::Paired(..) if self.total() == target => stats.emit_paired_full += 1,
      Emission::Paired(..) => stats.emit_paired_partial += 1,
    }
  }
}

#[derive(Debug, Clone)]
pub struct CamLane {
  buckets: BTreeMap<u32, VecDeque<CamEntry>>,
  size: usize,
  capacity: usize,
  target: u32,
  aggressive_threshold: usize,
}

impl CamLane {
  pub fn new(target: u32, capacity: usize, aggressive_threshold: usize) -> Self {
    Self {
      buckets: BTreeMap::new(),
      size: 0,
      capacity,
      target,
      aggressive_threshold,
    }
  }

  pub fn len(&self) -> usize {
    self.size
  }

  pub fn is_empty(&self) -> bool {
    self.size == 0
  }

  pub fn is_full(&self) -> bool {
    self.size >= self.capacity
  }

  pub fn target(&self) -> u32 {
    self.target
  }

  /// Under pressure: at or above the aggressive threshold.
  pub fn is_aggressive(&self) -> bool {
    self.size >= self.aggressive_threshold
  }

  fn pop_bucket(&mut self, key: u32) -> Option<CamEntry> {
    let bucket = self.buckets.get_mut(&key)?;
    let entry = bucket.pop_front();
    if bucket.is_empty() {
      self.buckets.remove(&key);
    }
    if entry.is_some() {
      self.size -= 1;
    }
    entry
  }

  fn push(&mut self, entry: CamEntry) {
    self.buckets.entry(entry.value).or_default().push_back(entry);
    self.size += 1;
  }

  /// Smallest-key bucket whose front entry fits next to `value`.
  fn partner_within(&self, value: u32) -> Option<u32> {
    self
      .buckets
      .keys()
      .copied()
      .find(|k| value.saturating_add(*k) <= self.target)
  }

  /// Pair with the exact complement if one is waiting.
  pub fn try_pair(&mut self, entry: CamEntry) -> Option<Emission> {
    let need = self.target.checked_sub(entry.value)?;
    self.pop_bucket(need).map(|partner| Emission::Paired(entry, partner))
  }

  /// Pair with any waiting value that still fits, or leave alone.
  ///
  /// Always emits; used once the lane is past the aggressive threshold.
  pub fn pair_aggressive(&mut self, entry: CamEntry) -> Emission {
    match self.partner_within(entry.value).and_then(|k| self.pop_bucket(k)) {
      Some(partner) => Emission::Paired(entry, partner),
      None => Emission::Single(entry),
    }
  }

  pub fn insert(&mut self, entry: CamEntry) -> bool {
    if self.is_full() {
      return false;
    }
    self.push(entry);
    true
  }

  /// Force one entry out of the fullest bucket.
  pub fn evict(&mut self) -> Option<Emission> {
    let key = self
      .buckets
      .iter()
      .fold(None::<(u32, usize)>, |best, (k, q)| match best {
        Some((_, n)) if n >= q.len() => best,
        _ => Some((*k, q.len())),
      })
      .map(|(k, _)| k)?;
    let entry = self.pop_bucket(key)?;

    if entry.value == self.target {
      return Some(Emission::Single(entry));
    }
    if entry.value > self.target {
      self.push(CamEntry {
        value: entry.value - self.target,
        bits: entry.bits,
      });
      return Some(Emission::Single(CamEntry {
        value: self.target,
        bits: entry.bits,
      }));
    }
    Some(self.pair_aggressive(entry))
  }

  /// `size` equals the sum of bucket lengths and no bucket is empty.
  pub fn check_invariant(&self) -> bool {
    let sum: usize = self.buckets.values().map(VecDeque::len).sum();
    sum == self.size && self.buckets.values().all(|q| !q.is_empty())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn e(value: u32) -> CamEntry {
    CamEntry { value, bits: value }
  }

  #[test]
  fn test_complement_pairs_into_full_slot() {
    let mut lane = CamLane::new(32, 64, 59);
    assert!(lane.try_pair(e(20)).is_none());
    assert!(lane.insert(e(20)));
    let out = lane.try_pair(e(12)).unwrap();
    assert_eq!(out, Emission::Paired(e(12), e(20)));
    assert_eq!(out.total(), 32);

    let mut stats = LaneStats::default();
    out.record(32, &mut stats);
    assert_eq!(stats.emit_paired_full, 1);
    assert!(lane.is_empty());
    assert!(lane.check_invariant());
  }

  #[test]
  fn test_full_lane_refuses_and_eviction_frees_a_slot() {
    let mut lane = CamLane::new(32, 4, 3);
    for _ in 0..4 {
      assert!(lane.insert(e(30)));
    }
    assert!(!lane.insert(e(30)));
    assert!(lane.try_pair(e(30)).is_none());

    let out = lane.evict().unwrap();
    assert_eq!(out, Emission::Single(e(30)));
    assert_eq!(lane.len(), 3);
    assert!(lane.insert(e(30)));
    assert!(lane.check_invariant());
  }

  #[test]
  fn test_eviction_splits_values_above_target() {
    let mut lane = CamLane::new(16, 8, 6);
    lane.insert(CamEntry { value: 20, bits: 0xF });
    let out = lane.evict().unwrap();
    assert_eq!(out, Emission::Single(CamEntry { value: 16, bits: 0xF }));
    assert_eq!(lane.len(), 1);
    assert_eq!(lane.evict(), Some(Emission::Single(CamEntry { value: 4, bits: 0xF })));
    assert_eq!(lane.evict(), None);
  }

  #[test]
  fn test_eviction_prefers_the_fullest_bucket_and_pairs_within_target() {
    let mut lane = CamLane::new(16, 8, 6);
    lane.insert(e(3));
    lane.insert(e(9));
    lane.insert(e(9));
    let out = lane.evict().unwrap();
    assert_eq!(out, Emission::Paired(e(9), e(3)));
    assert_eq!(lane.len(), 1);
  }

  #[test]
  fn test_aggressive_pairing_accepts_any_fit() {
    let mut lane = CamLane::new(16, 8, 2);
    lane.insert(e(10));
    lane.insert(e(4));
    assert!(lane.is_aggressive());
    assert_eq!(lane.pair_aggressive(e(7)), Emission::Paired(e(7), e(4)));
    assert_eq!(lane.pair_aggressive(e(7)), Emission::Single(e(7)));
  }

  #[test]
  fn test_every_value_leaves_exactly_once() {
    let target = 16;
    let mut lane = CamLane::new(target, 8, 6);
    let values: Vec<u32> = (0..200u32).map(|i| (i * 7 + 3) % 17).filter(|v| *v > 0).collect();
    let mut emitted = Vec::new();
    let collect = |em: Emission, out: &mut Vec<u32>| {
      if let Emission::Paired(a, b) = em {
        assert!(a.value + b.value <= target);
      }
      match em {
        Emission::Single(a) => out.push(a.value),
        Emission::Paired(a, b) => out.extend([a.value, b.value]),
      }
    };

    for v in values.iter().copied() {
      let entry = e(v);
      let em = if lane.is_aggressive() {
        Some(lane.pair_aggressive(entry))
      } else {
        lane.try_pair(entry)
      };
      match em {
        Some(em) => collect(em, &mut emitted),
        None => {
          while !lane.insert(entry) {
            let em = lane.evict().unwrap();
            collect(em, &mut emitted);
          }
        },
      }
      assert!(lane.check_invariant());
    }
    while let Some(em) = lane.evict() {
      collect(em, &mut emitted);
    }

    let mut expected = values.clone();
    expected.sort();
    emitted.sort();
    assert_eq!(emitted, expected);
  }
}
