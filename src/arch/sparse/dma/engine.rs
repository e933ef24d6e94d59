use serde::Serialize;
use std::collections::{BTreeMap, VecDeque};

use super::policy::{BankPolicy, DmaCommand};
use crate::arch::sparse::define::{BURST_WORDS, CHANNEL_ADDR_DIF};
use crate::arch::sparse::event::{BankKind, Event};
use crate::arch::sparse::packet::Packet;
use crate::arch::sparse::port::{send_retry_req, send_retry_resp, PortRef, RetryFlag, TimingReqPort, TimingRespPort};
use crate::arch::sparse::SimContext;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SlotState {
  Filling,
  Full,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TransferState {
  Idle,
  Config,
  Streaming,
}

/// One half of a bank's ping-pong buffer.
#[derive(Debug)]
struct BankBuffer {
  state: SlotState,
  /// DRAM range `[start, end)` the owning command streams from.
  range: (u64, u64),
  lines: usize,
  words_written: usize,
  data: BTreeMap<usize, Packet>,
  cmd_id: Option<u64>,
  completed: bool,
  stalled: bool,
}

impl Default for BankBuffer {
  fn default() -> Self {
    Self {
      state: SlotState::Filling,
      range: (0, 0),
      lines: 0,
      words_written: 0,
      data: BTreeMap::new(),
      cmd_id: None,
      completed: false,
      stalled: false,
    }
  }
}

impl BankBuffer {
  fn contains(&self, addr: u64) -> bool {
    addr >= self.range.0 && addr < self.range.1
  }

  fn claim(&mut self, cmd: &DmaCommand, start: u64, end: u64) {
    self.range = (start, end);
    self.lines = cmd.lines;
    self.words_written = 0;
    self.cmd_id = Some(cmd.cmd_id);
    self.completed = false;
    self.stalled = false;
  }

  fn reset(&mut self, ctx: &mut SimContext) {
    for (_, pkt) in std::mem::take(&mut self.data) {
      ctx.retire(pkt);
    }
    *self = Self::default();
  }
}

#[derive(Debug)]
struct BankController {
  queue: VecDeque<DmaCommand>,
  in_flight: usize,
  state: TransferState,
  current: Option<DmaCommand>,
  cur_slot: usize,
  next_read: usize,
  slots: [BankBuffer; 2],
  rd_addr: u64,
  lines_fetched: usize,
  transfer_active: bool,
  req_fifo: VecDeque<Packet>,
  /// Downstream refused a read; wait for its retry.
  req_blocked: RetryFlag,
  /// A consumer request was refused for lack of data.
  owe_consumer_retry: RetryFlag,
  /// A DRAM response hit a FULL slot.
  owe_downstream_retry: RetryFlag,
  /// The consumer refused our response.
  resp_blocked: RetryFlag,
  request: Option<Packet>,
  outgoing: Option<Packet>,
  feature_clear: bool,
  issued: u64,
  completed: u64,
  last_completed: Option<u64>,
}

impl Default for BankController {
  fn default() -> Self {
    Self {
      queue: VecDeque::new(),
      in_flight: 0,
      state: TransferState::Idle,
      current: None,
      cur_slot: 1,
      next_read: 0,
      slots: [BankBuffer::default(), BankBuffer::default()],
      rd_addr: 0,
      lines_fetched: 0,
      transfer_active: false,
      req_fifo: VecDeque::new(),
      req_blocked: RetryFlag::default(),
      owe_consumer_retry: RetryFlag::default(),
      owe_downstream_retry: RetryFlag::default(),
      resp_blocked: RetryFlag::default(),
      request: None,
      outgoing: None,
      feature_clear: false,
      issued: 0,
      completed: 0,
      last_completed: None,
    }
  }
}

impl BankController {
  fn has_work(&self) -> bool {
    self.state != TransferState::Idle
      || (!self.queue.is_empty() && self.in_flight < 2)
      || (!self.req_fifo.is_empty() && !self.req_blocked.is_set())
  }
}

/// Double-buffered DMA engine serving one bank kind across all banks.
///
/// Every bank runs its own `Idle -> Config -> Streaming` machine over a
/// private command queue and fills the two slots of its ping-pong buffer in
/// turn. A consumer may pull only from a FULL slot.
#[derive(Debug)]
pub struct DmaEngine {
  policy: BankPolicy,
  region_base: u64,
  lines: usize,
  line_words: usize,
  line_stride: u64,
  banks: Vec<BankController>,
}

impl DmaEngine {
  pub fn new(policy: BankPolicy, banks: usize, region_base: u64, lines: usize) -> Self {
    Self {
      policy,
      region_base,
      lines,
      line_words: BURST_WORDS,
      line_stride: banks as u64 * CHANNEL_ADDR_DIF,
      banks: (0..banks).map(|_| BankController::default()).collect(),
    }
  }

  /// Override the address step between two lines of one bank.
  pub fn with_line_stride(mut self, stride: u64) -> Self {
    self.line_stride = stride;
    self
  }

  pub fn kind(&self) -> BankKind {
    self.policy.kind()
  }

  pub fn banks(&self) -> usize {
    self.banks.len()
  }

  pub fn in_flight(&self, bank: usize) -> usize {
    self.banks.get(bank).map_or(0, |b| b.in_flight)
  }

  pub fn transfer_state(&self, bank: usize) -> Option<TransferState> {
    self.banks.get(bank).map(|b| b.state)
  }

  pub fn slot_state(&self, bank: usize, slot: usize) -> Option<SlotState> {
    self.banks.get(bank)?.slots.get(slot).map(|s| s.state)
  }

  /// Commands whose slot has gone FULL on this bank.
  pub fn completed_commands(&self, bank: usize) -> u64 {
    self.banks.get(bank).map_or(0, |b| b.completed)
  }

  pub fn last_completion(&self, bank: usize) -> Option<u64> {
    self.banks.get(bank).and_then(|b| b.last_completed)
  }

  pub fn readable_slot(&self, bank: usize) -> Option<usize> {
    let b = self.banks.get(bank)?;
    (b.slots[b.next_read].state == SlotState::Full).then_some(b.next_read)
  }

  pub fn is_idle(&self) -> bool {
    self.banks.iter().all(|b| {
      b.state == TransferState::Idle
        && b.queue.is_empty()
        && b.req_fifo.is_empty()
        && b.request.is_none()
        && b.outgoing.is_none()
    })
  }

  /// Queue the first two commands of every bank.
  pub fn start(&mut self, ctx: &mut SimContext) {
    for bank in 0..self.banks.len() {
      self.issue_next(bank, ctx);
      self.issue_next(bank, ctx);
    }
  }

  /// Admit a command unless its bank already has two outstanding.
  pub fn enqueue_command(&mut self, cmd: DmaCommand, ctx: &mut SimContext) -> bool {
    let kind = self.kind();
    match self.banks.get_mut(cmd.bank) {
      Some(b) if b.in_flight + b.queue.len() < 2 => {
        log::debug!(
          "t={} {:?} bank {} queued cmd {} addr={:#x} lines={}",
          ctx.now(),
          kind,
          cmd.bank,
          cmd.cmd_id,
          cmd.base_addr,
          cmd.lines
        );
        b.queue.push_back(cmd);
        ctx.sched.schedule_next(Event::DmaTick(kind));
        true
      },
      _ => {
        log::warn!("t={} {:?} dropped cmd {} for bank {}", ctx.now(), kind, cmd.cmd_id, cmd.bank);
        ctx.stats.rejected_commands += 1;
        false
      },
    }
  }

  fn issue_next(&mut self, bank: usize, ctx: &mut SimContext) {
    let issued = self.banks[bank].issued;
    if !self.policy.may_issue(issued) {
      return;
    }
    let cmd = DmaCommand::sequential(bank, self.region_base, issued, self.lines);
    if self.enqueue_command(cmd, ctx) {
      self.banks[bank].issued += 1;
    }
  }

  /// One DMA cycle: advance every bank, then offer one read per bank downstream.
  pub fn tick(&mut self, mem: &mut dyn TimingReqPort, ctx: &mut SimContext) {
    for bank in 0..self.banks.len() {
      self.advance(bank, ctx);
    }
    for (bank, b) in self.banks.iter_mut().enumerate() {
      if b.req_blocked.is_set() {
        continue;
      }
      let Some(pkt) = b.req_fifo.pop_front() else {
        continue;
      };
      if let Err(pkt) = mem.send_timing_req(bank, pkt, ctx) {
        b.req_fifo.push_front(pkt);
        b.req_blocked.set();
      }
    }
    if self.banks.iter().any(BankController::has_work) {
      ctx.sched.schedule_next(Event::DmaTick(self.kind()));
    }
  }

  fn advance(&mut self, bank: usize, ctx: &mut SimContext) {
    let kind = self.kind();
    let banks = self.banks.len();
    let line_stride = self.line_stride;
    let line_words = self.line_words;
    let b = &mut self.banks[bank];

    if b.state == TransferState::Idle && b.in_flight < 2 {
      if let Some(cmd) = b.queue.pop_front() {
        b.current = Some(cmd);
        b.lines_fetched = 0;
        b.state = TransferState::Config;
      }
    }

    if b.state == TransferState::Config {
      let Some(cmd) = b.current else {
        b.state = TransferState::Idle;
        return;
      };
      b.in_flight += 1;
      b.cur_slot ^= 1;
      let origin = ((cmd.base_addr % 0x100) / CHANNEL_ADDR_DIF) as usize % banks;
      let bias = ((bank + banks - origin) % banks) as u64 * CHANNEL_ADDR_DIF;
      b.rd_addr = cmd.base_addr + bias;
      let end = b.rd_addr + cmd.lines as u64 * line_stride;
      let cur = b.cur_slot;
      if b.slots[cur].state == SlotState::Filling {
        b.slots[cur].claim(&cmd, b.rd_addr, end);
        b.transfer_active = true;
        log::debug!(
          "t={} {:?} bank {} cmd {} -> slot {} [{:#x}, {:#x})",
          ctx.now(),
          kind,
          bank,
          cmd.cmd_id,
          cur,
          b.rd_addr,
          end
        );
      } else {
        ctx.raise_protocol(format!("{:?} bank {} claimed slot {} while it is FULL", kind, bank, cur));
      }
      b.state = TransferState::Streaming;
    }

    if b.state == TransferState::Streaming {
      let Some(cmd) = b.current else {
        b.state = TransferState::Idle;
        return;
      };
      if b.lines_fetched >= cmd.lines {
        b.state = TransferState::Idle;
        return;
      }
      let cur = b.cur_slot;
      if b.transfer_active && !b.slots[cur].stalled {
        let mut pkt = ctx.issue(Packet::read(b.rd_addr, line_words));
        pkt.tags.bank = Some(bank);
        pkt.tags.slot = Some(cur);
        pkt.tags.cmd_id = Some(cmd.cmd_id);
        b.req_fifo.push_back(pkt);
        b.rd_addr += line_stride;
        if b.rd_addr >= cmd.base_addr + cmd.lines as u64 * line_stride {
          b.transfer_active = false;
        }
      }
      b.lines_fetched += 1;
    }
  }

  /// DRAM response for one of the bank's slots.
  pub fn recv_timing_resp(&mut self, bank: usize, pkt: Packet, ctx: &mut SimContext) -> Result<(), Packet> {
    let kind = self.kind();
    let line_stride = self.line_stride;
    let Some(b) = self.banks.get_mut(bank) else {
      ctx.raise_protocol(format!("{:?} response for unknown bank {}", kind, bank));
      return Err(pkt);
    };
    let addr = pkt.addr();
    let Some(idx) = (0..2).find(|i| b.slots[*i].contains(addr)) else {
      ctx.raise_protocol(format!("{:?} bank {} response {:#x} matches no slot", kind, bank, addr));
      return Err(pkt);
    };
    let slot = &mut b.slots[idx];
    if slot.state == SlotState::Full {
      b.owe_downstream_retry.set();
      return Err(pkt);
    }

    let line = ((addr - slot.range.0) / line_stride) as usize;
    if let Some(dup) = slot.data.insert(line, pkt) {
      ctx.raise_protocol(format!("{:?} bank {} line {:#x} delivered twice", kind, bank, dup.addr()));
      ctx.retire(dup);
    }
    slot.words_written += 1;
    if slot.words_written < slot.lines {
      return Ok(());
    }

    slot.state = SlotState::Full;
    slot.stalled = true;
    if !slot.completed {
      slot.completed = true;
      if let Some(id) = slot.cmd_id {
        log::debug!("t={} {:?} bank {} slot {} FULL for cmd {}", ctx.now(), kind, bank, idx, id);
        b.completed += 1;
        b.last_completed = Some(id);
      }
    }

    if self.policy.is_barrier() {
      for (i, b) in self.banks.iter_mut().enumerate() {
        send_retry_req(&mut b.owe_consumer_retry, PortRef::Decoder { kind, bank: i }, ctx);
      }
    } else {
      send_retry_req(&mut self.banks[bank].owe_consumer_retry, PortRef::Decoder { kind, bank }, ctx);
    }
    Ok(())
  }

  pub fn recv_req_retry(&mut self, bank: usize, ctx: &mut SimContext) {
    if let Some(b) = self.banks.get_mut(bank) {
      b.req_blocked.take();
    }
    ctx.sched.schedule_next(Event::DmaTick(self.kind()));
  }

  /// Consumer pull; accepted only while the bank (every bank, for a barrier) has a FULL slot.
  pub fn recv_timing_req(&mut self, bank: usize, pkt: Packet, ctx: &mut SimContext) -> Result<(), Packet> {
    let kind = self.kind();
    if bank >= self.banks.len() {
      ctx.raise_protocol(format!("{:?} consumer request on unknown bank {}", kind, bank));
      return Err(pkt);
    }
    let readable = if self.policy.is_barrier() {
      (0..self.banks.len()).all(|i| self.readable_slot(i).is_some())
    } else {
      self.readable_slot(bank).is_some()
    };

    let b = &mut self.banks[bank];
    if b.request.is_some() || b.outgoing.is_some() {
      ctx.raise_protocol(format!("{:?} bank {} got a request while one is pending", kind, bank));
      return Err(pkt);
    }
    if !readable {
      b.owe_consumer_retry.set();
      return Err(pkt);
    }
    if self.policy.is_barrier() && pkt.tags.feature_clear {
      b.feature_clear = true;
    }
    b.request = Some(pkt);
    ctx.sched.schedule_now(Event::DmaRespond(kind));
    Ok(())
  }

  pub fn send_responses(&mut self, up: &mut dyn TimingRespPort, ctx: &mut SimContext) {
    for bank in 0..self.banks.len() {
      self.respond(bank, up, ctx);
    }
    self.check_barrier(ctx);
  }

  pub fn recv_resp_retry(&mut self, bank: usize, up: &mut dyn TimingRespPort, ctx: &mut SimContext) {
    let Some(b) = self.banks.get_mut(bank) else {
      return;
    };
    b.resp_blocked.take();
    self.respond(bank, up, ctx);
    self.check_barrier(ctx);
  }

  fn respond(&mut self, bank: usize, up: &mut dyn TimingRespPort, ctx: &mut SimContext) {
    if self.banks[bank].resp_blocked.is_set() {
      return;
    }
    if self.banks[bank].outgoing.is_none() {
      let Some(idx) = self.readable_slot(bank) else {
        return;
      };
      let Some(req) = self.banks[bank].request.take() else {
        return;
      };
      match self.build_response(bank, idx, req, ctx) {
        Ok(pkt) => self.banks[bank].outgoing = Some(pkt),
        Err(req) => {
          self.banks[bank].request = Some(req);
          return;
        },
      }
    }

    let b = &mut self.banks[bank];
    let Some(pkt) = b.outgoing.take() else {
      return;
    };
    let tags = pkt.tags;
    match up.send_timing_resp(bank, pkt, ctx) {
      Ok(()) => {
        let slot = tags.slot.unwrap_or(b.next_read);
        let drained = b.slots[slot].data.is_empty();
        if self.policy.releases_after_send(&tags, drained) {
          self.release(bank, slot, ctx);
        }
      },
      Err(pkt) => {
        b.outgoing = Some(pkt);
        b.resp_blocked.set();
      },
    }
  }

  /// Bitmap banks hand out up to one request's worth of buffered lines as a
  /// single packet; other kinds echo the request.
  fn build_response(&mut self, bank: usize, idx: usize, req: Packet, ctx: &mut SimContext) -> Result<Packet, Packet> {
    let slot = &mut self.banks[bank].slots[idx];
    let cmd_id = slot.cmd_id;
    let mut pkt = if self.policy.returns_data() {
      let want = (req.size() / self.line_words).max(1);
      let mut out: Option<Packet> = None;
      for _ in 0..want {
        let Some((_, line)) = slot.data.pop_first() else {
          break;
        };
        out = Some(match out.take() {
          None => line,
          Some(mut head) => {
            let absorbed = head.merge(line);
            ctx.retire(absorbed);
            head
          },
        });
      }
      let Some(out) = out else {
        return Err(req);
      };
      ctx.retire(req);
      out
    } else {
      req
    };
    pkt.tags.bank = Some(bank);
    pkt.tags.slot = Some(idx);
    pkt.tags.cmd_id = cmd_id;
    Ok(pkt)
  }

  fn check_barrier(&mut self, ctx: &mut SimContext) {
    if !self.policy.is_barrier() || !self.banks.iter().all(|b| b.feature_clear) {
      return;
    }
    log::debug!("t={} {:?} all banks clear, releasing", ctx.now(), self.kind());
    for bank in 0..self.banks.len() {
      self.banks[bank].feature_clear = false;
      if let Some(idx) = self.readable_slot(bank) {
        self.release(bank, idx, ctx);
      }
    }
  }

  /// Consumer is done with a FULL slot: recycle it and start the next command.
  pub fn release(&mut self, bank: usize, slot: usize, ctx: &mut SimContext) {
    let kind = self.kind();
    let Some(b) = self.banks.get_mut(bank) else {
      return;
    };
    if b.slots.get(slot).map(|s| s.state) != Some(SlotState::Full) {
      return;
    }
    b.slots[slot].reset(ctx);
    b.next_read ^= 1;
    b.in_flight = b.in_flight.saturating_sub(1);
    log::debug!("t={} {:?} bank {} released slot {}", ctx.now(), kind, bank, slot);
    send_retry_resp(
      &mut b.owe_downstream_retry,
      PortRef::Upstream {
        upstream: kind.upstream(),
        bank,
      },
      ctx,
    );
    self.issue_next(bank, ctx);
    ctx.sched.schedule_next(Event::DmaTick(kind));
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[derive(Default)]
  struct Dram(Vec<(usize, Packet)>);

  impl TimingReqPort for Dram {
    fn send_timing_req(&mut self, bank: usize, pkt: Packet, _ctx: &mut SimContext) -> Result<(), Packet> {
      self.0.push((bank, pkt));
      Ok(())
    }
  }

  #[derive(Default)]
  struct Consumer(Vec<Packet>);

  impl TimingRespPort for Consumer {
    fn send_timing_resp(&mut self, _bank: usize, pkt: Packet, _ctx: &mut SimContext) -> Result<(), Packet> {
      self.0.push(pkt);
      Ok(())
    }
  }

  fn cmd(bank: usize, base_addr: u64, lines: usize, cmd_id: u64) -> DmaCommand {
    DmaCommand {
      bank,
      base_addr,
      lines,
      cmd_id,
    }
  }

  fn ticks(dma: &mut DmaEngine, dram: &mut Dram, ctx: &mut SimContext, n: usize) {
    for _ in 0..n {
      dma.tick(dram, ctx);
    }
  }

  fn deliver(dma: &mut DmaEngine, dram: &mut Dram, ctx: &mut SimContext) {
    for (bank, pkt) in dram.0.drain(..) {
      dma.recv_timing_resp(bank, pkt, ctx).unwrap();
    }
  }

  #[test]
  fn test_command_streams_four_lines_and_fills_on_the_fourth() {
    let mut dma = DmaEngine::new(BankPolicy::Bitmap { max_commands: None }, 1, 0, 4);
    let mut ctx = SimContext::new(1);
    let mut dram = Dram::default();
    assert!(dma.enqueue_command(cmd(0, 0x1000, 4, 7), &mut ctx));
    ticks(&mut dma, &mut dram, &mut ctx, 6);

    let addrs: Vec<u64> = dram.0.iter().map(|(_, p)| p.addr()).collect();
    assert_eq!(addrs, vec![0x1000, 0x1040, 0x1080, 0x10C0]);
    assert_eq!(dma.transfer_state(0), Some(TransferState::Idle));

    let mut responses = dram.0.drain(..);
    for _ in 0..3 {
      let (bank, pkt) = responses.next().unwrap();
      dma.recv_timing_resp(bank, pkt, &mut ctx).unwrap();
      assert_eq!(dma.slot_state(0, 0), Some(SlotState::Filling));
    }
    let (bank, pkt) = responses.next().unwrap();
    dma.recv_timing_resp(bank, pkt, &mut ctx).unwrap();
    assert_eq!(dma.slot_state(0, 0), Some(SlotState::Full));
    assert_eq!(dma.completed_commands(0), 1);
    assert_eq!(dma.last_completion(0), Some(7));
    assert_eq!(dma.readable_slot(0), Some(0));
  }

  #[test]
  fn test_admission_caps_a_bank_at_two_commands() {
    let mut dma = DmaEngine::new(BankPolicy::Weight, 2, 0, 2);
    let mut ctx = SimContext::new(2);
    let mut dram = Dram::default();
    assert!(dma.enqueue_command(cmd(0, 0x0, 2, 0), &mut ctx));
    assert!(dma.enqueue_command(cmd(0, 0x400, 2, 1), &mut ctx));
    assert!(!dma.enqueue_command(cmd(0, 0x800, 2, 2), &mut ctx));
    assert!(!dma.enqueue_command(cmd(5, 0x0, 2, 0), &mut ctx));
    assert_eq!(ctx.stats.rejected_commands, 2);

    for _ in 0..10 {
      dma.tick(&mut dram, &mut ctx);
      assert!(dma.in_flight(0) <= 2);
    }
    assert_eq!(dma.in_flight(0), 2);
    assert!(!dma.enqueue_command(cmd(0, 0x800, 2, 2), &mut ctx));
  }

  #[test]
  fn test_bank_offset_follows_origin_channel() {
    let mut dma = DmaEngine::new(BankPolicy::Weight, 4, 0, 1);
    let mut ctx = SimContext::new(4);
    let mut dram = Dram::default();
    // origin channel 1: bank 0 wraps to the last channel
    dma.enqueue_command(cmd(0, 0x40, 1, 0), &mut ctx);
    dma.enqueue_command(cmd(1, 0x40, 1, 0), &mut ctx);
    ticks(&mut dma, &mut dram, &mut ctx, 2);
    let mut addrs: Vec<(usize, u64)> = dram.0.iter().map(|(b, p)| (*b, p.addr())).collect();
    addrs.sort();
    assert_eq!(addrs, vec![(0, 0x40 + 3 * 64), (1, 0x40)]);
  }

  #[test]
  fn test_unknown_range_is_rejected_as_a_fault() {
    let mut dma = DmaEngine::new(BankPolicy::Weight, 1, 0, 4);
    let mut ctx = SimContext::new(1);
    let mut dram = Dram::default();
    dma.enqueue_command(cmd(0, 0x1000, 4, 0), &mut ctx);
    dma.tick(&mut dram, &mut ctx);
    assert!(dma.recv_timing_resp(0, Packet::read(0x9000, 32), &mut ctx).is_err());
    assert!(ctx.take_fault().is_some());
  }

  #[test]
  fn test_consumer_waits_for_full_slot_and_drains_it() {
    let mut dma = DmaEngine::new(BankPolicy::Bitmap { max_commands: Some(1) }, 1, 0, 2);
    let mut ctx = SimContext::new(1);
    let mut dram = Dram::default();
    let mut consumer = Consumer::default();
    dma.start(&mut ctx);

    assert!(dma.recv_timing_req(0, Packet::read(0, BURST_WORDS), &mut ctx).is_err());
    ticks(&mut dma, &mut dram, &mut ctx, 3);
    deliver(&mut dma, &mut dram, &mut ctx);
    let retry = Event::ReqRetry(PortRef::Decoder {
      kind: BankKind::Bitmap,
      bank: 0,
    });
    assert!(ctx.sched.is_scheduled(&retry));

    for line in 0..2u64 {
      dma.recv_timing_req(0, Packet::read(0, BURST_WORDS), &mut ctx).unwrap();
      dma.send_responses(&mut consumer, &mut ctx);
      let got = consumer.0.last().unwrap();
      assert_eq!(got.addr(), line * 64);
      assert_eq!(got.tags.cmd_id, Some(0));
    }
    assert_eq!(dma.in_flight(0), 0);
    assert_eq!(dma.readable_slot(0), None);
    assert_eq!(dma.slot_state(0, 0), Some(SlotState::Filling));
  }

  #[test]
  fn test_full_slot_refuses_response_and_retries_after_release() {
    let mut dma = DmaEngine::new(BankPolicy::Weight, 1, 0, 1);
    let mut ctx = SimContext::new(1);
    let mut dram = Dram::default();
    let mut consumer = Consumer::default();
    dma.enqueue_command(cmd(0, 0x0, 1, 0), &mut ctx);
    dma.tick(&mut dram, &mut ctx);
    deliver(&mut dma, &mut dram, &mut ctx);

    assert!(dma.recv_timing_resp(0, Packet::read(0x0, 32), &mut ctx).is_err());
    assert!(!ctx.has_fault());

    let mut req = Packet::read(0x100_0000, 0);
    req.tags.weight_clear = true;
    dma.recv_timing_req(0, req, &mut ctx).unwrap();
    dma.send_responses(&mut consumer, &mut ctx);
    assert!(consumer.0[0].tags.weight_clear);
    assert_eq!(dma.in_flight(0), 0);
    assert!(ctx.sched.is_scheduled(&Event::RespRetry(PortRef::Upstream { upstream: 1, bank: 0 })));
  }

  #[test]
  fn test_completion_counter_tracks_a_long_command_stream() {
    let mut dma = DmaEngine::new(BankPolicy::Weight, 1, 0, 1);
    let mut ctx = SimContext::new(1);
    let mut dram = Dram::default();
    let mut consumer = Consumer::default();
    dma.start(&mut ctx);

    for round in 1..=20u64 {
      ticks(&mut dma, &mut dram, &mut ctx, 6);
      deliver(&mut dma, &mut dram, &mut ctx);
      assert_eq!(dma.completed_commands(0), round + 1);
      assert_eq!(dma.last_completion(0), Some(round));

      let mut req = Packet::read(0x100_0000, 0);
      req.tags.weight_clear = true;
      dma.recv_timing_req(0, req, &mut ctx).unwrap();
      dma.send_responses(&mut consumer, &mut ctx);
    }
    assert_eq!(consumer.0.len(), 20);
  }

  #[test]
  fn test_feature_banks_release_together() {
    let mut dma = DmaEngine::new(BankPolicy::Feature, 2, 0, 1);
    let mut ctx = SimContext::new(2);
    let mut dram = Dram::default();
    let mut consumer = Consumer::default();
    dma.enqueue_command(cmd(0, 0x0, 1, 0), &mut ctx);
    dma.enqueue_command(cmd(1, 0x0, 1, 0), &mut ctx);
    dma.tick(&mut dram, &mut ctx);

    let (b0, p0) = dram.0.remove(0);
    dma.recv_timing_resp(b0, p0, &mut ctx).unwrap();
    assert!(dma.recv_timing_req(0, Packet::read(0, 0), &mut ctx).is_err(), "bank 1 not ready");
    deliver(&mut dma, &mut dram, &mut ctx);
    assert!(ctx.sched.is_scheduled(&Event::ReqRetry(PortRef::Decoder {
      kind: BankKind::Feature,
      bank: 0,
    })));

    for bank in 0..2 {
      let mut req = Packet::read(0x200_0000, 0);
      req.tags.feature_clear = bank == 1;
      dma.recv_timing_req(bank, req, &mut ctx).unwrap();
      dma.send_responses(&mut consumer, &mut ctx);
    }
    assert_eq!(dma.in_flight(0), 1, "bank 0 has not cleared yet");

    let mut req = Packet::read(0x200_0000, 0);
    req.tags.feature_clear = true;
    dma.recv_timing_req(0, req, &mut ctx).unwrap();
    dma.send_responses(&mut consumer, &mut ctx);
    assert_eq!(dma.in_flight(0), 0);
    assert_eq!(dma.in_flight(1), 0);
    assert_eq!(consumer.0.len(), 3);
  }
}
