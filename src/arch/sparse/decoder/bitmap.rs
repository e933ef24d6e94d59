use crate::arch::sparse::define::{BITMAP_READ_BITS, BITMAP_WORD_BITS, SEG_NUM};
use crate::arch::sparse::hash_cam::CamEntry;

const READ_MASK: u64 = (1 << BITMAP_READ_BITS) - 1;
const ROW_MASK: u64 = (1 << BITMAP_WORD_BITS) - 1;

/// Rows extracted from one bitmap burst.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DecodedBitmap {
  pub rows: Vec<u32>,
  pub counts: Vec<u32>,
}

impl DecodedBitmap {
  pub fn len(&self) -> usize {
    self.rows.len()
  }

  pub fn is_empty(&self) -> bool {
    self.rows.is_empty()
  }

  pub fn ones(&self) -> u64 {
    self.counts.iter().map(|c| *c as u64).sum()
  }

  fn push(&mut self, row: u32) {
    self.rows.push(row);
    self.counts.push(row.count_ones());
  }
}

/// Unpack `BITMAP_READ_BITS`-wide sub-words MSB first into `BITMAP_WORD_BITS`-wide rows.
///
/// A trailing partial row is left aligned and still emitted.
pub fn decode_rows(words: &[u16]) -> DecodedBitmap {
  let mut out = DecodedBitmap::default();
  let mut buffer: u64 = 0;
  let mut valid: u32 = 0;

  for word in words {
    buffer = (buffer << BITMAP_READ_BITS) | (*word as u64 & READ_MASK);
    valid += BITMAP_READ_BITS;
    while valid >= BITMAP_WORD_BITS {
      valid -= BITMAP_WORD_BITS;
      out.push(((buffer >> valid) & ROW_MASK) as u32);
      buffer &= (1u64 << valid) - 1;
    }
  }
  if valid > 0 {
    out.push(((buffer << (BITMAP_WORD_BITS - valid)) & ROW_MASK) as u32);
  }
  out
}

/// Segment `seg` of a row as a CAM entry, bits shifted down to the segment start.
pub fn segment(row: u32, seg: usize) -> CamEntry {
  let width = BITMAP_WORD_BITS / SEG_NUM as u32;
  let start = seg as u32 * width;
  let mask = if width >= 32 { u32::MAX } else { (1u32 << width) - 1 };
  let bits = (row >> start) & mask;
  CamEntry {
    value: bits.count_ones(),
    bits,
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn pack(rows: &[u32], tail_bits: u32) -> Vec<u16> {
    let mut words = Vec::new();
    for row in rows {
      words.push((row >> 16) as u16);
      words.push(*row as u16);
    }
    if tail_bits > 0 {
      words.push(0xA5C3);
    }
    words
  }

  #[test]
  fn test_rows_round_trip_with_partial_tail() {
    let rows = [0xFFFF_0000u32, 0x0000_0001, 0x8000_0000, 0x1234_5678];
    let decoded = decode_rows(&pack(&rows, 16));

    assert_eq!(decoded.len(), 5);
    assert_eq!(&decoded.rows[..4], &rows);
    assert_eq!(decoded.counts[..4], [16, 1, 1, 13]);
    // a lone 16-bit tail lands in the upper half
    assert_eq!(decoded.rows[4], 0xA5C3_0000);
    assert_eq!(decoded.counts[4], 0xA5C3u16.count_ones());
    assert_eq!(decoded.ones(), 31 + 8);
  }

  #[test]
  fn test_burst_decodes_into_sixteen_rows() {
    let decoded = decode_rows(&[0xFFFF; 32]);
    assert_eq!(decoded.len(), 16);
    assert!(decoded.counts.iter().all(|c| *c == 32));
    assert!(decode_rows(&[]).is_empty());
  }

  #[test]
  fn test_segments_split_low_half_first() {
    let row = 0x0003_8001;
    assert_eq!(segment(row, 0), CamEntry { value: 2, bits: 0x8001 });
    assert_eq!(segment(row, 1), CamEntry { value: 2, bits: 0x0003 });
    assert_eq!(segment(0, 1).value, 0);
  }
}
