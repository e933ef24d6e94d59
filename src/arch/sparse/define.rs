//! Fixed accelerator geometry.

/// Segments per bitmap row; each segment feeds its own CAM lane.
pub const SEG_NUM: usize = 2;
pub const MAC_NUM: u32 = 16;

/// Bits per storage word.
pub const WORD_SIZE: u32 = 16;
/// Width of one decoded bitmap row.
pub const BITMAP_WORD_BITS: u32 = 32;
/// Width of the sub-words a bitmap payload is packed in.
pub const BITMAP_READ_BITS: u32 = 16;

pub const BURST_BITS: u64 = 512;
/// Storage words per DRAM burst.
pub const BURST_WORDS: usize = (BURST_BITS / WORD_SIZE as u64) as usize;

pub const INST_ADDR_STRIDE: u64 = 512;
/// Address distance between two neighbouring channels.
pub const CHANNEL_ADDR_DIF: u64 = 64;
pub const CHANNEL_NUM: usize = 8;

pub const SRAM_CAPACITY: u64 = 262_144;
pub const FW_ROW_SIZE: u64 = 4;
pub const WT_SIZE: u64 = 2048;

/// Sum a full pair of rows packs into; each lane targets `PAIRING_VALUE / SEG_NUM`.
pub const PAIRING_VALUE: u32 = 32;
pub const CAM_CAPACITY: usize = 64;
pub const CAM_AGGRESSIVE_THRESHOLD: usize = 59;

/// Lanes per decoder bank: two rows, `SEG_NUM` segments each.
pub const CAM_LANES: usize = 2 * SEG_NUM;

pub const BITMAP_BASE: u64 = 0x0;
pub const WEIGHT_BASE: u64 = 0x100_0000;
pub const FEATURE_BASE: u64 = 0x1500_0000;

/// Consumer-side request addresses the decoder uses towards each bank kind.
pub const BITMAP_REQ_ADDR: u64 = 0x0;
pub const WEIGHT_REQ_ADDR: u64 = 0x100_0000;
pub const FEATURE_REQ_ADDR: u64 = 0x200_0000;

/// Arbiter upstream id of the write-back buffer; DMA engines use their bank kind index.
pub const WRITE_BUFFER_UPSTREAM: usize = 3;
pub const ARBITER_UPSTREAMS: usize = 4;
