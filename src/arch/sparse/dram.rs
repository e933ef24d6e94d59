use std::collections::{HashMap, VecDeque};
use std::fmt;

use super::define::CHANNEL_ADDR_DIF;
use super::event::Event;
use super::packet::Packet;
use super::port::{send_retry_req, PortRef, RetryFlag, TimingReqPort, TimingRespPort};
use super::source::WordSource;
use super::SimContext;

/// A finished DRAM access.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Completion {
  pub channel: usize,
  pub addr: u64,
  pub is_write: bool,
}

/// Opaque DRAM timing model.
///
/// Every accepted request completes exactly once, in no particular order.
pub trait DramBackend: fmt::Debug + Send {
  fn can_accept(&self, addr: u64, is_write: bool) -> bool;

  fn send_request(&mut self, addr: u64, is_write: bool);

  /// Advance to `now` and return the accesses that finished.
  fn tick(&mut self, now: u64) -> Vec<Completion>;

  fn is_idle(&self) -> bool;
}

#[derive(Debug, Clone, Copy)]
struct InFlight {
  ready_at: u64,
  addr: u64,
  is_write: bool,
}

/// Per-channel queues with a fixed access latency.
#[derive(Debug, Clone)]
pub struct FixedLatencyDram {
  channels: Vec<VecDeque<InFlight>>,
  queue_depth: usize,
  read_latency: u64,
  write_latency: u64,
  now: u64,
}

impl FixedLatencyDram {
  pub fn new(channels: usize, queue_depth: usize, read_latency: u64, write_latency: u64) -> Self {
    Self {
      channels: vec![VecDeque::new(); channels.max(1)],
      queue_depth,
      read_latency,
      write_latency,
      now: 0,
    }
  }

  pub fn channel_of(&self, addr: u64) -> usize {
    ((addr / CHANNEL_ADDR_DIF) % self.channels.len() as u64) as usize
  }
}

impl DramBackend for FixedLatencyDram {
  fn can_accept(&self, addr: u64, _is_write: bool) -> bool {
    self.channels[self.channel_of(addr)].len() < self.queue_depth
  }

  fn send_request(&mut self, addr: u64, is_write: bool) {
    let latency = if is_write { self.write_latency } else { self.read_latency };
    let ch = self.channel_of(addr);
    self.channels[ch].push_back(InFlight {
      ready_at: self.now + latency.max(1),
      addr,
      is_write,
    });
  }

  fn tick(&mut self, now: u64) -> Vec<Completion> {
    self.now = now;
    let mut done = Vec::new();
    for (channel, queue) in self.channels.iter_mut().enumerate() {
      while queue.front().map_or(false, |r| r.ready_at <= now) {
        if let Some(r) = queue.pop_front() {
          done.push(Completion {
            channel,
            addr: r.addr,
            is_write: r.is_write,
          });
        }
      }
    }
    done
  }

  fn is_idle(&self) -> bool {
    self.channels.iter().all(VecDeque::is_empty)
  }
}

#[derive(Debug, Default)]
struct MemPort {
  owe_retry: RetryFlag,
  resp_blocked: RetryFlag,
  responses: VecDeque<Packet>,
}

/// Bridges arbiter bank ports onto a [`DramBackend`].
///
/// A refused request is answered with a retry on the following DRAM tick.
/// Read completions are filled from the word source and returned on the port
/// the request arrived on; write completions are only counted.
#[derive(Debug)]
pub struct DramFrontend {
  backend: Box<dyn DramBackend>,
  source: Box<dyn WordSource>,
  ports: Vec<MemPort>,
  in_flight: HashMap<(u64, bool), VecDeque<(usize, Packet)>>,
  outstanding: usize,
}

impl DramFrontend {
  pub fn new(ports: usize, backend: Box<dyn DramBackend>, source: Box<dyn WordSource>) -> Self {
    Self {
      backend,
      source,
      ports: (0..ports).map(|_| MemPort::default()).collect(),
      in_flight: HashMap::new(),
      outstanding: 0,
    }
  }

  pub fn outstanding(&self) -> usize {
    self.outstanding
  }

  pub fn is_idle(&self) -> bool {
    self.outstanding == 0 && self.ports.iter().all(|p| p.responses.is_empty())
  }

  fn recv_timing_req(&mut self, port: usize, pkt: Packet, ctx: &mut SimContext) -> Result<(), Packet> {
    if port >= self.ports.len() {
      ctx.raise_protocol(format!("dram request on unknown port {}", port));
      return Err(pkt);
    }
    if !self.backend.can_accept(pkt.addr(), pkt.is_write()) {
      self.ports[port].owe_retry.set();
      ctx.sched.schedule_next(Event::DramTick);
      return Err(pkt);
    }
    self.backend.send_request(pkt.addr(), pkt.is_write());
    self
      .in_flight
      .entry((pkt.addr(), pkt.is_write()))
      .or_default()
      .push_back((port, pkt));
    self.outstanding += 1;
    ctx.sched.schedule_next(Event::DramTick);
    Ok(())
  }

  /// One DRAM cycle: pay owed retries, collect completions, return read data.
  pub fn tick(&mut self, upstream: &mut dyn TimingRespPort, ctx: &mut SimContext) {
    for (bank, port) in self.ports.iter_mut().enumerate() {
      send_retry_req(&mut port.owe_retry, PortRef::Memory { bank }, ctx);
    }

    for done in self.backend.tick(ctx.now()) {
      let Some((port, mut pkt)) = self
        .in_flight
        .get_mut(&(done.addr, done.is_write))
        .and_then(VecDeque::pop_front)
      else {
        ctx.raise_protocol(format!("dram completion for unknown address {:#x}", done.addr));
        continue;
      };
      self.outstanding -= 1;
      ctx.stats.dram_bursts += 1;
      if done.is_write {
        ctx.stats.dram_writes += 1;
        ctx.retire(pkt);
      } else {
        pkt.fill(self.source.read_words(pkt.addr(), pkt.size()));
        self.ports[port].responses.push_back(pkt);
      }
    }
    self.in_flight.retain(|_, q| !q.is_empty());

    for bank in 0..self.ports.len() {
      self.send_responses(bank, upstream, ctx);
    }

    if self.outstanding > 0 || !self.backend.is_idle() || self.ports.iter().any(|p| !p.responses.is_empty()) {
      ctx.sched.schedule_next(Event::DramTick);
    }
  }

  fn send_responses(&mut self, bank: usize, upstream: &mut dyn TimingRespPort, ctx: &mut SimContext) {
    let port = &mut self.ports[bank];
    if port.resp_blocked.is_set() {
      return;
    }
    while let Some(pkt) = port.responses.pop_front() {
      if let Err(pkt) = upstream.send_timing_resp(bank, pkt, ctx) {
        port.responses.push_front(pkt);
        port.resp_blocked.set();
        break;
      }
    }
  }

  pub fn recv_resp_retry(&mut self, bank: usize, upstream: &mut dyn TimingRespPort, ctx: &mut SimContext) {
    if let Some(port) = self.ports.get_mut(bank) {
      port.resp_blocked.take();
      self.send_responses(bank, upstream, ctx);
    }
  }
}

impl TimingReqPort for DramFrontend {
  fn send_timing_req(&mut self, bank: usize, pkt: Packet, ctx: &mut SimContext) -> Result<(), Packet> {
    self.recv_timing_req(bank, pkt, ctx)
  }
}
