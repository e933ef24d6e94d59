//! Bitmap decoder and the pairing stage behind it.
//!
//! Every bank pulls a bitmap burst, decodes it into rows, then walks the rows
//! two at a time: one weight and one feature pull per row pair, after which
//! the row segments are offered to the bank's CAM lanes. Bitmap fetches are
//! counted against the current slice; a bank that completes its slice stalls
//! until the CAM-clear pass has drained every lane and moved the block cursors.

pub mod bitmap;
pub mod params;

use serde::Serialize;

use self::bitmap::{decode_rows, segment, DecodedBitmap};
use self::params::{BlockState, LayerParam, SliceProgress};
use super::define::{
  BITMAP_REQ_ADDR, BURST_WORDS, CAM_AGGRESSIVE_THRESHOLD, CAM_CAPACITY, CAM_LANES, CHANNEL_ADDR_DIF, FEATURE_REQ_ADDR,
  INST_ADDR_STRIDE, PAIRING_VALUE, SEG_NUM, WEIGHT_REQ_ADDR, WT_SIZE,
};
use super::error::{SimError, SimResult};
use super::event::{BankKind, Event};
use super::hash_cam::{CamEntry, CamLane, Emission};
use super::packet::Packet;
use super::write_buffer::WriteBuffer;
use super::SimContext;

/// Request side of the decoder's three bank ports.
pub trait BankLink {
  fn send_req(&mut self, kind: BankKind, bank: usize, pkt: Packet, ctx: &mut SimContext) -> Result<(), Packet>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum DecodeState {
  Idle,
  BitmapWait,
  DecodeStart,
  WfWait,
}

/// One request stream of a bank.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
enum Leg {
  #[default]
  Ready,
  /// Refused; waiting for the retry.
  Blocked,
  InFlight,
}

#[derive(Debug, Clone)]
pub struct DecoderConfig {
  pub banks: usize,
  pub params: Vec<LayerParam>,
  pub cam_capacity: usize,
  pub aggressive_threshold: usize,
}

impl DecoderConfig {
  pub fn new(banks: usize, params: Vec<LayerParam>) -> Self {
    Self {
      banks,
      params,
      cam_capacity: CAM_CAPACITY,
      aggressive_threshold: CAM_AGGRESSIVE_THRESHOLD,
    }
  }
}

#[derive(Debug)]
struct DecoderBank {
  state: DecodeState,
  decoded: DecodedBitmap,
  processed: usize,
  bitmap: Option<Packet>,
  bitmap_leg: Leg,
  weight_leg: Leg,
  feature_leg: Leg,
  weight_received: bool,
  feature_received: bool,
  rows_read: u64,
  ones_read: u64,
  weight_clear: bool,
  feature_clear: bool,
  lanes: Vec<CamLane>,
  pending: [CamEntry; CAM_LANES],
  handled: [bool; CAM_LANES],
  cam_retry: bool,
  blocks: BlockState,
  slice: SliceProgress,
  param_done: bool,
  results: Vec<u16>,
  next_write: u64,
}

impl DecoderBank {
  fn new(bank: usize, param: &LayerParam, cfg: &DecoderConfig) -> Self {
    let blocks = BlockState::new(param.block_config());
    let target = PAIRING_VALUE / SEG_NUM as u32;
    Self {
      state: DecodeState::Idle,
      decoded: DecodedBitmap::default(),
      processed: 0,
      bitmap: None,
      bitmap_leg: Leg::Ready,
      weight_leg: Leg::Ready,
      feature_leg: Leg::Ready,
      weight_received: false,
      feature_received: false,
      rows_read: 0,
      ones_read: 0,
      weight_clear: false,
      feature_clear: false,
      lanes: (0..CAM_LANES)
        .map(|_| CamLane::new(target, cfg.cam_capacity, cfg.aggressive_threshold))
        .collect(),
      pending: [CamEntry { value: 0, bits: 0 }; CAM_LANES],
      handled: [true; CAM_LANES],
      cam_retry: false,
      slice: SliceProgress::new(bank, param.addr_count(blocks.in_last_feature_block())),
      blocks,
      param_done: false,
      results: Vec::new(),
      next_write: bank as u64 * CHANNEL_ADDR_DIF,
    }
  }

  /// Load the next parameter; CAM contents and the write cursor survive.
  fn reset_for(&mut self, bank: usize, param: &LayerParam) {
    self.blocks = BlockState::new(param.block_config());
    self.slice = SliceProgress::new(bank, param.addr_count(self.blocks.in_last_feature_block()));
    self.param_done = false;
    self.rows_read = 0;
    self.ones_read = 0;
  }

  fn all_handled(&self) -> bool {
    self.handled.iter().all(|h| *h)
  }

  fn cam_empty(&self) -> bool {
    self.lanes.iter().all(CamLane::is_empty)
  }
}

/// Snapshot of one bank for status lines and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BankStatus {
  pub state: DecodeState,
  pub feature_block: u32,
  pub weight_block: u32,
  pub addr_count: u32,
  pub stalled: bool,
  pub cam_entries: usize,
}

#[derive(Debug)]
pub struct Decoder {
  banks: Vec<DecoderBank>,
  params: Vec<LayerParam>,
  param_idx: usize,
  target: u32,
  finished: bool,
}

impl Decoder {
  pub fn new(cfg: DecoderConfig) -> SimResult<Self> {
    let Some(first) = cfg.params.first() else {
      return Err(SimError::config("decoder needs at least one parameter"));
    };
    for param in &cfg.params {
      param.validate()?;
    }
    if cfg.cam_capacity == 0 {
      return Err(SimError::config("CAM capacity must be positive"));
    }
    let banks = (0..cfg.banks).map(|b| DecoderBank::new(b, first, &cfg)).collect();
    Ok(Self {
      banks,
      params: cfg.params,
      param_idx: 0,
      target: PAIRING_VALUE / SEG_NUM as u32,
      finished: false,
    })
  }

  pub fn start(&mut self, ctx: &mut SimContext) {
    log::info!("decoder: {} banks, parameter '{}'", self.banks.len(), self.params[0].name);
    ctx.sched.schedule_now(Event::DecoderTick);
  }

  pub fn is_finished(&self) -> bool {
    self.finished
  }

  pub fn param_index(&self) -> usize {
    self.param_idx
  }

  pub fn current_param(&self) -> &LayerParam {
    &self.params[self.param_idx.min(self.params.len() - 1)]
  }

  pub fn bank_status(&self, bank: usize) -> Option<BankStatus> {
    let b = self.banks.get(bank)?;
    Some(BankStatus {
      state: b.state,
      feature_block: b.blocks.current_feature_block,
      weight_block: b.blocks.current_weight_block,
      addr_count: b.slice.current_addr_count,
      stalled: b.slice.decoder_stall,
      cam_entries: b.lanes.iter().map(CamLane::len).sum(),
    })
  }

  pub fn lanes_valid(&self) -> bool {
    self.banks.iter().all(|b| b.lanes.iter().all(CamLane::check_invariant))
  }

  /// Issue whatever each bank is waiting to send.
  pub fn tick(&mut self, link: &mut dyn BankLink, ctx: &mut SimContext) {
    if self.finished {
      return;
    }
    for bank in 0..self.banks.len() {
      match self.banks[bank].state {
        DecodeState::Idle => self.request_bitmap(bank, link, ctx),
        DecodeState::DecodeStart => self.request_operands(bank, link, ctx),
        DecodeState::BitmapWait | DecodeState::WfWait => {},
      }
    }
  }

  fn request_bitmap(&mut self, bank: usize, link: &mut dyn BankLink, ctx: &mut SimContext) {
    let b = &mut self.banks[bank];
    // the previous burst's segments must all be placed first
    if b.slice.decoder_stall || b.param_done || b.cam_retry || b.bitmap_leg != Leg::Ready {
      return;
    }
    let req = ctx.issue(Packet::read(BITMAP_REQ_ADDR, BURST_WORDS));
    match link.send_req(BankKind::Bitmap, bank, req, ctx) {
      Ok(()) => {
        b.bitmap_leg = Leg::InFlight;
        b.state = DecodeState::BitmapWait;
      },
      Err(pkt) => {
        ctx.retire(pkt);
        b.bitmap_leg = Leg::Blocked;
      },
    }
  }

  fn request_operands(&mut self, bank: usize, link: &mut dyn BankLink, ctx: &mut SimContext) {
    if self.banks[bank].cam_retry {
      return;
    }
    if self.banks[bank].processed >= self.banks[bank].decoded.len() {
      self.finish_bitmap(bank, ctx);
      return;
    }
    let b = &mut self.banks[bank];

    if !b.weight_received && b.weight_leg == Leg::Ready {
      let mut req = ctx.issue(Packet::read(WEIGHT_REQ_ADDR, BURST_WORDS));
      req.tags.weight_clear = b.weight_clear;
      match link.send_req(BankKind::Weight, bank, req, ctx) {
        Ok(()) => {
          b.weight_clear = false;
          b.weight_leg = Leg::InFlight;
        },
        Err(pkt) => {
          ctx.retire(pkt);
          b.weight_leg = Leg::Blocked;
        },
      }
    }
    if !b.feature_received && b.feature_leg == Leg::Ready {
      let mut req = ctx.issue(Packet::read(FEATURE_REQ_ADDR, BURST_WORDS));
      req.tags.feature_clear = b.feature_clear;
      match link.send_req(BankKind::Feature, bank, req, ctx) {
        Ok(()) => {
          b.feature_clear = false;
          b.feature_leg = Leg::InFlight;
        },
        Err(pkt) => {
          ctx.retire(pkt);
          b.feature_leg = Leg::Blocked;
        },
      }
    }

    let weight_out = b.weight_received || b.weight_leg == Leg::InFlight;
    let feature_out = b.feature_received || b.feature_leg == Leg::InFlight;
    if weight_out && feature_out {
      log::trace!("t={} decoder bank {} row pair {} requested", ctx.now(), bank, b.processed / 2);
      b.state = DecodeState::WfWait;
    }
  }

  /// Response from one of the bank ports. The decoder never refuses.
  pub fn recv_timing_resp(
    &mut self,
    kind: BankKind,
    bank: usize,
    pkt: Packet,
    wb: &mut WriteBuffer,
    ctx: &mut SimContext,
  ) -> Result<(), Packet> {
    let Some(b) = self.banks.get_mut(bank) else {
      ctx.raise_protocol(format!("decoder response for unknown bank {}", bank));
      return Err(pkt);
    };
    match kind {
      BankKind::Bitmap => {
        if b.state != DecodeState::BitmapWait {
          ctx.raise_protocol(format!("decoder bank {} got a bitmap in state {:?}", bank, b.state));
          return Err(pkt);
        }
        b.bitmap_leg = Leg::Ready;
        b.decoded = decode_rows(pkt.payload());
        b.processed = 0;
        b.slice.current_addr_count += 1;
        log::debug!(
          "t={} decoder bank {} bitmap {:#x}: {} rows, {} ones, slice {}/{}",
          ctx.now(),
          bank,
          pkt.addr(),
          b.decoded.len(),
          b.decoded.ones(),
          b.slice.current_addr_count,
          b.slice.total_addr_count
        );
        b.bitmap = Some(pkt);
        b.state = DecodeState::DecodeStart;
        ctx.sched.schedule_now(Event::DecoderTick);
      },
      BankKind::Weight | BankKind::Feature => {
        let (leg, received) = if kind == BankKind::Weight {
          (&mut b.weight_leg, &mut b.weight_received)
        } else {
          (&mut b.feature_leg, &mut b.feature_received)
        };
        if *leg != Leg::InFlight {
          ctx.raise_protocol(format!("decoder bank {} got an unrequested {:?} response", bank, kind));
          return Err(pkt);
        }
        *leg = Leg::Ready;
        *received = true;
        ctx.retire(pkt);
        if b.weight_received && b.feature_received {
          self.consume_row_pair(bank, wb, ctx);
        }
      },
    }
    Ok(())
  }

  pub fn recv_req_retry(&mut self, kind: BankKind, bank: usize, ctx: &mut SimContext) {
    let Some(b) = self.banks.get_mut(bank) else {
      return;
    };
    let leg = match kind {
      BankKind::Bitmap => &mut b.bitmap_leg,
      BankKind::Weight => &mut b.weight_leg,
      BankKind::Feature => &mut b.feature_leg,
    };
    if *leg == Leg::Blocked {
      *leg = Leg::Ready;
    }
    ctx.sched.schedule_next(Event::DecoderTick);
  }

  fn consume_row_pair(&mut self, bank: usize, wb: &mut WriteBuffer, ctx: &mut SimContext) {
    let b = &mut self.banks[bank];
    b.weight_received = false;
    b.feature_received = false;

    let start = b.processed;
    let rows: Vec<(u32, u32)> = (start..(start + 2).min(b.decoded.len()))
      .map(|i| (b.decoded.rows[i], b.decoded.counts[i]))
      .collect();
    b.processed += rows.len();
    b.rows_read += rows.len() as u64;
    b.ones_read += rows.iter().map(|(_, c)| *c as u64).sum::<u64>();

    let cfg = b.blocks.config;
    if b.rows_read >= cfg.weight_block_rows as u64 * cfg.total_weight_blocks as u64 {
      b.rows_read = 0;
      b.feature_clear = true;
      log::debug!("t={} decoder bank {} feature buffer consumed", ctx.now(), bank);
    }
    if b.ones_read >= WT_SIZE * BURST_WORDS as u64 {
      b.ones_read = 0;
      b.weight_clear = true;
      log::debug!("t={} decoder bank {} weight buffer consumed", ctx.now(), bank);
    }

    for row in 0..2 {
      let bits = rows.get(row).map_or(0, |(r, _)| *r);
      for seg in 0..SEG_NUM {
        let lane = row * SEG_NUM + seg;
        b.pending[lane] = segment(bits, seg);
        b.handled[lane] = b.pending[lane].value == 0;
      }
    }

    if b.processed < b.decoded.len() {
      b.state = DecodeState::DecodeStart;
    } else {
      self.finish_bitmap(bank, ctx);
    }
    self.drive_cam(bank, wb, ctx);
  }

  fn finish_bitmap(&mut self, bank: usize, ctx: &mut SimContext) {
    let b = &mut self.banks[bank];
    if let Some(pkt) = b.bitmap.take() {
      ctx.retire(pkt);
    }
    b.state = DecodeState::Idle;
    if b.slice.is_complete() {
      b.slice.decoder_stall = true;
      log::debug!(
        "t={} decoder bank {} slice done ({} bursts, feature block {}, weight block {})",
        ctx.now(),
        bank,
        b.slice.current_addr_count,
        b.blocks.current_feature_block,
        b.blocks.current_weight_block
      );
    }
  }

  /// One pairing attempt for the bank's pending segments.
  fn drive_cam(&mut self, bank: usize, wb: &mut WriteBuffer, ctx: &mut SimContext) {
    let emissions = self.process_cam(bank, ctx);
    for em in emissions {
      self.emit(bank, em, wb, ctx);
    }
    let b = &mut self.banks[bank];
    if b.all_handled() {
      b.cam_retry = false;
      if b.slice.decoder_stall {
        ctx.sched.schedule_next(Event::CamClear);
      } else {
        ctx.sched.schedule_next(Event::DecoderTick);
      }
    } else {
      b.cam_retry = true;
      ctx.sched.schedule_next(Event::CamRetry);
    }
  }

  fn process_cam(&mut self, bank: usize, ctx: &mut SimContext) -> Vec<Emission> {
    let b = &mut self.banks[bank];
    let mut out = Vec::new();

    for seg in 0..SEG_NUM {
      // the two rows of one segment share a MAC slot per step
      let mut segment_paired = false;
      for row in 0..2 {
        let lane = row * SEG_NUM + seg;
        if segment_paired || b.handled[lane] || b.pending[lane].value == 0 {
          continue;
        }
        if let Some(em) = b.lanes[lane].try_pair(b.pending[lane]) {
          b.handled[lane] = true;
          segment_paired = true;
          out.push(em);
        }
      }
      for row in 0..2 {
        let lane = row * SEG_NUM + seg;
        if segment_paired || b.handled[lane] || b.pending[lane].value == 0 || !b.lanes[lane].is_aggressive() {
          continue;
        }
        out.push(b.lanes[lane].pair_aggressive(b.pending[lane]));
        b.handled[lane] = true;
        segment_paired = true;
      }
    }

    for lane in 0..CAM_LANES {
      if b.pending[lane].value == 0 {
        b.handled[lane] = true;
        continue;
      }
      if b.handled[lane] {
        continue;
      }
      if b.lanes[lane].insert(b.pending[lane]) {
        b.handled[lane] = true;
      } else {
        match ctx.stats.lane_mut(bank) {
          Ok(stats) => stats.cam_full += 1,
          Err(e) => ctx.raise(e),
        }
        log::trace!("t={} decoder bank {} lane {} full", ctx.now(), bank, lane);
      }
    }
    out
  }

  fn emit(&mut self, bank: usize, em: Emission, wb: &mut WriteBuffer, ctx: &mut SimContext) {
    match ctx.stats.lane_mut(bank) {
      Ok(stats) => em.record(self.target, stats),
      Err(e) => {
        ctx.raise(e);
        return;
      },
    }
    ctx.stats.mac_ops += em.total() as u64;
    let b = &mut self.banks[bank];
    match em {
      Emission::Single(a) => b.results.extend([a.value as u16, a.bits as u16]),
      Emission::Paired(a, c) => b.results.extend([a.value as u16, c.value as u16, a.bits as u16, c.bits as u16]),
    }
    if b.results.len() >= BURST_WORDS {
      self.flush_results(bank, false, wb, ctx);
    }
  }

  /// Write accumulated result words back one burst at a time.
  fn flush_results(&mut self, bank: usize, partial: bool, wb: &mut WriteBuffer, ctx: &mut SimContext) {
    let b = &mut self.banks[bank];
    while b.results.len() >= BURST_WORDS || (partial && !b.results.is_empty()) {
      let take = b.results.len().min(BURST_WORDS);
      let payload: Vec<u16> = b.results.drain(..take).collect();
      if wb.enqueue_write(bank, b.next_write, payload, ctx) {
        b.next_write += INST_ADDR_STRIDE;
      }
    }
  }

  /// CamRetry: re-offer the segments that found no room last time.
  pub fn cam_retry(&mut self, wb: &mut WriteBuffer, ctx: &mut SimContext) {
    for bank in 0..self.banks.len() {
      if !self.banks[bank].cam_retry {
        continue;
      }
      self.banks[bank].cam_retry = false;
      self.drive_cam(bank, wb, ctx);
    }
  }

  /// CamClear: evict one entry per idle bank; once every lane is empty, move
  /// the stalled banks to their next slice.
  pub fn clear_cam(&mut self, wb: &mut WriteBuffer, ctx: &mut SimContext) {
    if self.finished {
      return;
    }
    for bank in 0..self.banks.len() {
      let b = &mut self.banks[bank];
      if !b.all_handled() {
        continue;
      }
      let fullest = (0..CAM_LANES)
        .filter(|l| !b.lanes[*l].is_empty())
        .max_by_key(|l| (b.lanes[*l].len(), std::cmp::Reverse(*l)));
      if let Some(em) = fullest.and_then(|l| b.lanes[l].evict()) {
        self.emit(bank, em, wb, ctx);
      }
    }
    if !self.banks.iter().all(DecoderBank::cam_empty) {
      ctx.sched.schedule_next(Event::CamClear);
      return;
    }
    self.advance_slices(wb, ctx);
    if !self.finished {
      ctx.sched.schedule_next(Event::DecoderTick);
    }
  }

  fn advance_slices(&mut self, wb: &mut WriteBuffer, ctx: &mut SimContext) {
    let param = self.current_param().clone();
    for (bank, b) in self.banks.iter_mut().enumerate() {
      if !b.slice.decoder_stall {
        continue;
      }
      ctx.stats.slices_completed += 1;
      if b.blocks.finish_slice() {
        b.param_done = true;
        log::debug!("t={} decoder bank {} finished parameter '{}'", ctx.now(), bank, param.name);
      }
      b.slice = SliceProgress::new(bank, param.addr_count(b.blocks.in_last_feature_block()));
    }

    if !self.banks.iter().all(|b| b.param_done) {
      return;
    }
    ctx.stats.params_completed += 1;
    log::info!("t={} parameter '{}' complete", ctx.now(), param.name);
    if self.param_idx + 1 >= self.params.len() {
      self.finished = true;
      for bank in 0..self.banks.len() {
        self.flush_results(bank, true, wb, ctx);
      }
      return;
    }
    self.param_idx += 1;
    let next = self.params[self.param_idx].clone();
    for (bank, b) in self.banks.iter_mut().enumerate() {
      b.reset_for(bank, &next);
    }
    log::info!("t={} advancing to parameter '{}'", ctx.now(), next.name);
  }
}
