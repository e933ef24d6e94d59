use serde::{Deserialize, Serialize};

use crate::arch::sparse::define::{BITMAP_WORD_BITS, BURST_BITS, CHANNEL_ADDR_DIF, CHANNEL_NUM, INST_ADDR_STRIDE};
use crate::arch::sparse::error::{SimError, SimResult};

/// One weight matrix the decoder walks through.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LayerParam {
  pub name: String,
  /// Feature dimension.
  pub total_row: u32,
  /// Rows of the last feature slice, 0 when it is a full slice.
  #[serde(default)]
  pub final_slice_row: u32,
  pub total_col: u32,
  pub slice_row: u32,
  #[serde(default = "default_slice_col")]
  pub slice_col: u32,
}

fn default_slice_col() -> u32 {
  BITMAP_WORD_BITS
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BlockConfig {
  pub total_feature_blocks: u32,
  pub total_weight_blocks: u32,
  pub weight_block_rows: u32,
}

impl LayerParam {
  pub fn new(name: &str, total_row: u32, final_slice_row: u32, total_col: u32, slice_row: u32) -> Self {
    Self {
      name: name.to_string(),
      total_row,
      final_slice_row,
      total_col,
      slice_row,
      slice_col: BITMAP_WORD_BITS,
    }
  }

  pub fn block_config(&self) -> BlockConfig {
    let col_span = self.slice_col * CHANNEL_NUM as u32;
    BlockConfig {
      total_feature_blocks: self.total_row.div_ceil(self.slice_row),
      total_weight_blocks: self.total_col.div_ceil(col_span),
      weight_block_rows: self.slice_row,
    }
  }

  /// Bitmap bursts one slice takes.
  pub fn addr_count(&self, last_feature_block: bool) -> u32 {
    let rows = if last_feature_block && self.final_slice_row > 0 {
      self.final_slice_row
    } else {
      self.slice_row
    };
    (rows as u64 * self.slice_col as u64 / BURST_BITS) as u32
  }

  pub fn validate(&self) -> SimResult<()> {
    if self.slice_row == 0 || self.slice_col == 0 || self.total_row == 0 || self.total_col == 0 {
      return Err(SimError::config(format!("parameter '{}' has a zero dimension", self.name)));
    }
    if self.addr_count(false) == 0 || self.addr_count(true) == 0 {
      return Err(SimError::config(format!(
        "parameter '{}' slice is smaller than one {}-bit burst",
        self.name, BURST_BITS
      )));
    }
    Ok(())
  }
}

/// Two LLaMA-7B layers in compute order.
pub fn llama_7b_params() -> Vec<LayerParam> {
  let mut table = Vec::with_capacity(14);
  for layer in 0..2 {
    let p = |m: &str, rows: u32, fin: u32, cols: u32| LayerParam::new(&format!("layer_{}_{}", layer, m), rows, fin, cols, 4096);
    table.extend([
      p("mlp_down", 11008, 2816, 4096),
      p("mlp_gate", 4096, 0, 11008),
      p("attention_k", 4096, 0, 4096),
      p("attention_out", 4096, 0, 4096),
      p("attention_q", 4096, 0, 4096),
      p("mlp_up", 4096, 0, 11008),
      p("attention_v", 4096, 0, 4096),
    ]);
  }
  table
}

/// Feature and weight block cursors of one bank.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BlockState {
  pub current_feature_block: u32,
  pub current_weight_block: u32,
  pub config: BlockConfig,
}

impl BlockState {
  pub fn new(config: BlockConfig) -> Self {
    Self {
      config,
      ..Self::default()
    }
  }

  pub fn in_last_feature_block(&self) -> bool {
    self.current_feature_block + 1 >= self.config.total_feature_blocks
  }

  /// Close one weight slice. Returns true once every feature block is done.
  pub fn finish_slice(&mut self) -> bool {
    self.current_weight_block += 1;
    if self.current_weight_block < self.config.total_weight_blocks {
      return false;
    }
    self.current_weight_block = 0;
    if self.in_last_feature_block() {
      return true;
    }
    self.current_feature_block += 1;
    false
  }
}

/// Bitmap burst counter of the slice a bank is reading.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SliceProgress {
  pub total_addr_count: u32,
  pub current_addr_count: u32,
  pub final_addr: u64,
  /// Slice fully fetched; no more bitmaps until progression.
  pub decoder_stall: bool,
}

impl SliceProgress {
  pub fn new(bank: usize, total_addr_count: u32) -> Self {
    Self {
      total_addr_count,
      current_addr_count: 0,
      final_addr: total_addr_count as u64 * INST_ADDR_STRIDE + bank as u64 * CHANNEL_ADDR_DIF,
      decoder_stall: false,
    }
  }

  pub fn is_complete(&self) -> bool {
    self.current_addr_count >= self.total_addr_count
  }
}
