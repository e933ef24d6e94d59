use std::collections::HashMap;
use std::fmt;

/// Supplies the storage words a DRAM read returns.
pub trait WordSource: fmt::Debug + Send {
  fn read_words(&self, addr: u64, words: usize) -> Vec<u16>;
}

/// Deterministic pseudo-random words; each bit is set with probability `density`.
#[derive(Debug, Clone)]
pub struct SyntheticWords {
  seed: u64,
  threshold: u64,
}

impl SyntheticWords {
  pub fn new(seed: u64, density: f64) -> Self {
    let density = density.clamp(0.0, 1.0);
    Self {
      seed,
      threshold: (density * 65536.0) as u64,
    }
  }

  fn mix(&self, word_addr: u64, bit: u64) -> u64 {
    // splitmix64
    let mut z = self.seed ^ word_addr.wrapping_mul(0x9E37_79B9_7F4A_7C15) ^ (bit << 56);
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^ (z >> 31)
  }

  fn word_at(&self, word_addr: u64) -> u16 {
    (0..16u64).fold(0u16, |word, bit| {
      if self.mix(word_addr, bit) & 0xFFFF < self.threshold {
        word | (1 << bit)
      } else {
        word
      }
    })
  }
}

impl WordSource for SyntheticWords {
  fn read_words(&self, addr: u64, words: usize) -> Vec<u16> {
    let base = addr / 2;
    (0..words as u64).map(|i| self.word_at(base + i)).collect()
  }
}

/// Explicit memory image, zero outside the written ranges.
#[derive(Debug, Clone, Default)]
pub struct WordImage {
  words: HashMap<u64, u16>,
}

impl WordImage {
  pub fn new() -> Self {
    Self::default()
  }

  /// Store `data` starting at byte address `addr`.
  pub fn store(&mut self, addr: u64, data: &[u16]) {
    for (i, w) in data.iter().enumerate() {
      self.words.insert(addr / 2 + i as u64, *w);
    }
  }

  /// Fill the same burst contents at every address in `addrs`.
  pub fn with_burst(mut self, addrs: impl IntoIterator<Item = u64>, data: &[u16]) -> Self {
    for addr in addrs {
      self.store(addr, data);
    }
    self
  }
}

impl WordSource for WordImage {
  fn read_words(&self, addr: u64, words: usize) -> Vec<u16> {
    let base = addr / 2;
    (0..words as u64)
      .map(|i| self.words.get(&(base + i)).copied().unwrap_or(0))
      .collect()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_synthetic_words_are_deterministic() {
    let a = SyntheticWords::new(7, 0.3);
    let b = SyntheticWords::new(7, 0.3);
    assert_eq!(a.read_words(0x1000, 32), b.read_words(0x1000, 32));
  }

  #[test]
  fn test_synthetic_density_extremes() {
    assert!(SyntheticWords::new(1, 0.0).read_words(0, 8).iter().all(|w| *w == 0));
    assert!(SyntheticWords::new(1, 1.0).read_words(0, 8).iter().all(|w| *w == 0xFFFF));
  }

  #[test]
  fn test_word_image_reads_back() {
    let mut img = WordImage::new();
    img.store(0x40, &[0xAAAA, 0x5555]);
    assert_eq!(img.read_words(0x40, 3), vec![0xAAAA, 0x5555, 0]);
    assert_eq!(img.read_words(0x42, 1), vec![0x5555]);
  }
}
