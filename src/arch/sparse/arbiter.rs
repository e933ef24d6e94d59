use std::collections::{HashMap, VecDeque};

use super::event::Event;
use super::packet::Packet;
use super::port::{send_retry_req, PortRef, RetryFlag, TimingReqPort, TimingRespPort};
use super::SimContext;

/// Where the arbiter delivers read responses.
pub trait Upstreams {
  fn send_timing_resp(&mut self, upstream: usize, bank: usize, pkt: Packet, ctx: &mut SimContext) -> Result<(), Packet>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
  Read,
  Write,
}

/// Request FIFOs of one direction, one per upstream, plus the upstream being drained.
#[derive(Debug)]
struct DirectionQueues {
  fifos: Vec<VecDeque<Packet>>,
  serving: Option<usize>,
}

impl DirectionQueues {
  fn new(upstreams: usize) -> Self {
    Self {
      fifos: (0..upstreams).map(|_| VecDeque::new()).collect(),
      serving: None,
    }
  }

  /// Keep draining the current upstream, else take the lowest id with work.
  fn select(&self) -> Option<usize> {
    self
      .serving
      .filter(|up| !self.fifos[*up].is_empty())
      .or_else(|| self.fifos.iter().position(|f| !f.is_empty()))
  }

  fn is_empty(&self) -> bool {
    self.fifos.iter().all(VecDeque::is_empty)
  }
}

#[derive(Debug)]
struct ArbiterBank {
  reads: DirectionQueues,
  writes: DirectionQueues,
  outstanding_reads: usize,
  outstanding_writes: usize,
  /// Upstreams waiting on each in-flight read address, oldest first.
  waiting: HashMap<u64, VecDeque<usize>>,
  responses: Vec<VecDeque<Packet>>,
  owe_req_retry: Vec<RetryFlag>,
  resp_blocked: Vec<RetryFlag>,
  /// Downstream refused a send; both directions wait for its retry.
  mem_blocked: RetryFlag,
}

impl ArbiterBank {
  fn new(upstreams: usize) -> Self {
    Self {
      reads: DirectionQueues::new(upstreams),
      writes: DirectionQueues::new(upstreams),
      outstanding_reads: 0,
      outstanding_writes: 0,
      waiting: HashMap::new(),
      responses: (0..upstreams).map(|_| VecDeque::new()).collect(),
      owe_req_retry: vec![RetryFlag::default(); upstreams],
      resp_blocked: vec![RetryFlag::default(); upstreams],
      mem_blocked: RetryFlag::default(),
    }
  }

  fn outstanding(&self) -> usize {
    self.outstanding_reads + self.outstanding_writes
  }

  fn queues(&mut self, dir: Direction) -> &mut DirectionQueues {
    match dir {
      Direction::Read => &mut self.reads,
      Direction::Write => &mut self.writes,
    }
  }
}

/// Multi-bank, multi-upstream DRAM arbiter.
///
/// Each bank admits requests while its joint read+write occupancy is below
/// `capacity`. Arbitration sends at most one request per bank per step,
/// writes first, and keeps serving one upstream until its FIFO is empty.
#[derive(Debug)]
pub struct DramArbiter {
  banks: Vec<ArbiterBank>,
  upstreams: usize,
  capacity: usize,
}

impl DramArbiter {
  pub fn new(banks: usize, upstreams: usize, capacity: usize) -> Self {
    Self {
      banks: (0..banks).map(|_| ArbiterBank::new(upstreams)).collect(),
      upstreams,
      capacity,
    }
  }

  pub fn banks(&self) -> usize {
    self.banks.len()
  }

  pub fn outstanding(&self, bank: usize) -> usize {
    self.banks.get(bank).map_or(0, ArbiterBank::outstanding)
  }

  pub fn is_idle(&self) -> bool {
    self
      .banks
      .iter()
      .all(|b| b.outstanding() == 0 && b.responses.iter().all(VecDeque::is_empty))
  }

  pub fn recv_timing_req(
    &mut self,
    bank: usize,
    upstream: usize,
    pkt: Packet,
    ctx: &mut SimContext,
  ) -> Result<(), Packet> {
    if bank >= self.banks.len() || upstream >= self.upstreams {
      ctx.raise_protocol(format!("arbiter request on bank {} upstream {}", bank, upstream));
      return Err(pkt);
    }
    let capacity = self.capacity;
    let b = &mut self.banks[bank];
    if b.outstanding() >= capacity {
      log::trace!("t={} arbiter bank {} refuses upstream {}", ctx.now(), bank, upstream);
      b.owe_req_retry[upstream].set();
      return Err(pkt);
    }
    if pkt.is_write() {
      b.outstanding_writes += 1;
      b.writes.fifos[upstream].push_back(pkt);
    } else {
      b.outstanding_reads += 1;
      b.waiting.entry(pkt.addr()).or_default().push_back(upstream);
      b.reads.fifos[upstream].push_back(pkt);
    }
    ctx.sched.schedule_next(Event::Arbitrate);
    Ok(())
  }

  /// One arbitration step over all banks in ascending order.
  pub fn arbitrate(&mut self, mem: &mut dyn TimingReqPort, ctx: &mut SimContext) {
    for bank in 0..self.banks.len() {
      if self.banks[bank].mem_blocked.is_set() {
        continue;
      }
      if !self.serve(bank, Direction::Write, mem, ctx) && !self.banks[bank].mem_blocked.is_set() {
        self.serve(bank, Direction::Read, mem, ctx);
      }
    }
    let more = self
      .banks
      .iter()
      .any(|b| !b.mem_blocked.is_set() && (!b.reads.is_empty() || !b.writes.is_empty()));
    if more {
      ctx.sched.schedule_next(Event::Arbitrate);
    }
  }

  fn serve(&mut self, bank: usize, dir: Direction, mem: &mut dyn TimingReqPort, ctx: &mut SimContext) -> bool {
    let b = &mut self.banks[bank];
    let q = b.queues(dir);
    let Some(up) = q.select() else {
      return false;
    };
    let Some(pkt) = q.fifos[up].pop_front() else {
      return false;
    };
    match mem.send_timing_req(bank, pkt, ctx) {
      Ok(()) => {
        q.serving = Some(up);
        let drained = q.fifos[up].is_empty();
        if drained {
          q.serving = None;
        }
        match dir {
          Direction::Read => b.outstanding_reads -= 1,
          Direction::Write => b.outstanding_writes -= 1,
        }
        if drained {
          // wake every refused upstream, not only the one drained
          for (upstream, owed) in b.owe_req_retry.iter_mut().enumerate() {
            send_retry_req(owed, PortRef::Upstream { upstream, bank }, ctx);
          }
        }
        true
      },
      Err(pkt) => {
        q.fifos[up].push_front(pkt);
        q.serving = Some(up);
        b.mem_blocked.set();
        false
      },
    }
  }

  /// Downstream retry: unblock the bank.
  pub fn recv_req_retry(&mut self, bank: usize, ctx: &mut SimContext) {
    if let Some(b) = self.banks.get_mut(bank) {
      b.mem_blocked.take();
      ctx.sched.schedule_next(Event::Arbitrate);
    }
  }

  fn accept_mem_resp(&mut self, bank: usize, pkt: Packet, ctx: &mut SimContext) -> Result<(), Packet> {
    let Some(b) = self.banks.get_mut(bank) else {
      ctx.raise_protocol(format!("dram response on unknown arbiter bank {}", bank));
      return Err(pkt);
    };
    if pkt.is_write() {
      ctx.retire(pkt);
      return Ok(());
    }
    let Some(up) = b.waiting.get_mut(&pkt.addr()).and_then(VecDeque::pop_front) else {
      ctx.raise_protocol(format!("bank {} read response for {:#x} has no requester", bank, pkt.addr()));
      return Err(pkt);
    };
    if b.waiting.get(&pkt.addr()).map_or(false, VecDeque::is_empty) {
      b.waiting.remove(&pkt.addr());
    }
    b.responses[up].push_back(pkt);
    ctx.sched.schedule_next(Event::ArbiterRespond);
    Ok(())
  }

  /// Send at most one queued response per (bank, upstream).
  pub fn send_responses(&mut self, ups: &mut dyn Upstreams, ctx: &mut SimContext) {
    let mut more = false;
    for bank in 0..self.banks.len() {
      for up in 0..self.upstreams {
        if self.banks[bank].resp_blocked[up].is_set() {
          continue;
        }
        self.send_one(bank, up, ups, ctx);
        let b = &self.banks[bank];
        more |= !b.resp_blocked[up].is_set() && !b.responses[up].is_empty();
      }
    }
    if more {
      ctx.sched.schedule_next(Event::ArbiterRespond);
    }
  }

  fn send_one(&mut self, bank: usize, up: usize, ups: &mut dyn Upstreams, ctx: &mut SimContext) {
    let b = &mut self.banks[bank];
    let Some(pkt) = b.responses[up].pop_front() else {
      return;
    };
    if let Err(pkt) = ups.send_timing_resp(up, bank, pkt, ctx) {
      b.responses[up].push_front(pkt);
      b.resp_blocked[up].set();
    }
  }

  /// Upstream retry: resend the refused response right away.
  pub fn recv_resp_retry(&mut self, bank: usize, up: usize, ups: &mut dyn Upstreams, ctx: &mut SimContext) {
    if bank >= self.banks.len() || up >= self.upstreams {
      return;
    }
    self.banks[bank].resp_blocked[up].take();
    self.send_one(bank, up, ups, ctx);
    if !self.banks[bank].responses[up].is_empty() {
      ctx.sched.schedule_next(Event::ArbiterRespond);
    }
  }
}

impl TimingRespPort for DramArbiter {
  fn send_timing_resp(&mut self, bank: usize, pkt: Packet, ctx: &mut SimContext) -> Result<(), Packet> {
    self.accept_mem_resp(bank, pkt, ctx)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  /// Downstream that accepts everything, or refuses while `refuse` is set.
  #[derive(Default)]
  struct Mem {
    sent: Vec<(usize, u64, bool)>,
    refuse: bool,
  }

  impl TimingReqPort for Mem {
    fn send_timing_req(&mut self, bank: usize, pkt: Packet, ctx: &mut SimContext) -> Result<(), Packet> {
      if self.refuse {
        return Err(pkt);
      }
      self.sent.push((bank, pkt.addr(), pkt.is_write()));
      ctx.retire(pkt);
      Ok(())
    }
  }

  #[derive(Default)]
  struct Ups(Vec<(usize, usize, u64)>);

  impl Upstreams for Ups {
    fn send_timing_resp(&mut self, up: usize, bank: usize, pkt: Packet, _ctx: &mut SimContext) -> Result<(), Packet> {
      self.0.push((up, bank, pkt.addr()));
      Ok(())
    }
  }

  fn drain_events(arb: &mut DramArbiter, mem: &mut Mem, ctx: &mut SimContext) -> Vec<Event> {
    let mut other = Vec::new();
    while let Some((_, ev)) = ctx.sched.pop() {
      match ev {
        Event::Arbitrate => arb.arbitrate(mem, ctx),
        e => other.push(e),
      }
    }
    other
  }

  #[test]
  fn test_capacity_one_refuses_read_until_write_drains() {
    let mut arb = DramArbiter::new(1, 4, 1);
    let mut ctx = SimContext::new(1);
    let mut mem = Mem::default();

    assert!(arb.recv_timing_req(0, 0, Packet::write(0x40, vec![1]), &mut ctx).is_ok());
    assert!(arb.recv_timing_req(0, 0, Packet::read(0x80, 32), &mut ctx).is_err());
    assert!(!ctx.sched.is_scheduled(&Event::ReqRetry(PortRef::Upstream { upstream: 0, bank: 0 })));

    let (_, ev) = ctx.sched.pop().unwrap();
    assert_eq!(ev, Event::Arbitrate);
    arb.arbitrate(&mut mem, &mut ctx);
    assert_eq!(mem.sent, vec![(0, 0x40, true)]);
    assert!(ctx.sched.is_scheduled(&Event::ReqRetry(PortRef::Upstream { upstream: 0, bank: 0 })));
  }

  #[test]
  fn test_writes_go_before_reads() {
    let mut arb = DramArbiter::new(1, 4, 8);
    let mut ctx = SimContext::new(1);
    let mut mem = Mem::default();
    arb.recv_timing_req(0, 1, Packet::read(0x100, 32), &mut ctx).unwrap();
    arb.recv_timing_req(0, 2, Packet::write(0x200, vec![0]), &mut ctx).unwrap();
    drain_events(&mut arb, &mut mem, &mut ctx);
    assert_eq!(mem.sent, vec![(0, 0x200, true), (0, 0x100, false)]);
  }

  #[test]
  fn test_continue_until_empty_then_lowest_id() {
    let mut arb = DramArbiter::new(1, 4, 16);
    let mut ctx = SimContext::new(1);
    let mut mem = Mem::default();
    arb.recv_timing_req(0, 2, Packet::read(0x2000, 32), &mut ctx).unwrap();
    arb.arbitrate(&mut mem, &mut ctx);
    // upstream 2 is now idle; queue more for 2, then for 0 and 1
    arb.recv_timing_req(0, 2, Packet::read(0x2040, 32), &mut ctx).unwrap();
    arb.recv_timing_req(0, 2, Packet::read(0x2080, 32), &mut ctx).unwrap();
    arb.arbitrate(&mut mem, &mut ctx);
    arb.recv_timing_req(0, 1, Packet::read(0x1000, 32), &mut ctx).unwrap();
    arb.recv_timing_req(0, 0, Packet::read(0x0, 32), &mut ctx).unwrap();
    drain_events(&mut arb, &mut mem, &mut ctx);
    let order: Vec<u64> = mem.sent.iter().map(|s| s.1).collect();
    assert_eq!(order, vec![0x2000, 0x2040, 0x2080, 0x0, 0x1000]);
  }

  #[test]
  fn test_downstream_refusal_blocks_bank_until_retry() {
    let mut arb = DramArbiter::new(2, 4, 16);
    let mut ctx = SimContext::new(2);
    let mut mem = Mem { refuse: true, ..Mem::default() };
    arb.recv_timing_req(0, 0, Packet::read(0x0, 32), &mut ctx).unwrap();
    arb.recv_timing_req(0, 0, Packet::write(0x40, vec![1]), &mut ctx).unwrap();
    arb.arbitrate(&mut mem, &mut ctx);
    assert!(mem.sent.is_empty());

    mem.refuse = false;
    arb.arbitrate(&mut mem, &mut ctx);
    assert!(mem.sent.is_empty(), "blocked bank must wait for the retry");

    arb.recv_req_retry(0, &mut ctx);
    drain_events(&mut arb, &mut mem, &mut ctx);
    assert_eq!(mem.sent.len(), 2);
    assert_eq!(arb.outstanding(0), 0);
  }

  #[test]
  fn test_same_address_responses_follow_request_order() {
    let mut arb = DramArbiter::new(1, 4, 16);
    let mut ctx = SimContext::new(1);
    let mut ups = Ups::default();
    // upstream 2 asks first, so it is answered before the lower id
    arb.recv_timing_req(0, 2, Packet::read(0x40, 32), &mut ctx).unwrap();
    arb.recv_timing_req(0, 0, Packet::read(0x40, 32), &mut ctx).unwrap();

    arb.send_timing_resp(0, Packet::read(0x40, 32), &mut ctx).unwrap();
    arb.send_responses(&mut ups, &mut ctx);
    assert_eq!(ups.0, vec![(2, 0, 0x40)]);

    arb.send_timing_resp(0, Packet::read(0x40, 32), &mut ctx).unwrap();
    arb.send_responses(&mut ups, &mut ctx);
    assert_eq!(ups.0, vec![(2, 0, 0x40), (0, 0, 0x40)]);

    assert!(arb.send_timing_resp(0, Packet::read(0x40, 32), &mut ctx).is_err());
    assert!(ctx.take_fault().is_some());
  }
}
