use std::collections::VecDeque;

use super::arbiter::DramArbiter;
use super::define::WRITE_BUFFER_UPSTREAM;
use super::event::Event;
use super::packet::Packet;
use super::port::RetryFlag;
use super::SimContext;

#[derive(Debug, Default)]
struct WriteChannel {
  queue: VecDeque<Packet>,
  /// The arbiter refused our head packet; wait for its retry.
  blocked: RetryFlag,
}

/// Result write-back path into DRAM.
///
/// A full channel drops the write; callers only learn about it from the
/// return value.
#[derive(Debug)]
pub struct WriteBuffer {
  channels: Vec<WriteChannel>,
  capacity: usize,
}

impl WriteBuffer {
  pub fn new(channels: usize, capacity: usize) -> Self {
    Self {
      channels: (0..channels).map(|_| WriteChannel::default()).collect(),
      capacity,
    }
  }

  pub fn pending(&self) -> usize {
    self.channels.iter().map(|c| c.queue.len()).sum()
  }

  pub fn is_idle(&self) -> bool {
    self.pending() == 0
  }

  pub fn enqueue_write(&mut self, channel: usize, addr: u64, payload: Vec<u16>, ctx: &mut SimContext) -> bool {
    let capacity = self.capacity;
    match self.channels.get_mut(channel) {
      Some(ch) if ch.queue.len() < capacity => {
        ch.queue.push_back(ctx.issue(Packet::write(addr, payload)));
        ctx.stats.writes_enqueued += 1;
        ctx.sched.schedule_next(Event::WriteDrain);
        true
      },
      _ => {
        ctx.stats.dropped_writes += 1;
        log::warn!("t={} write buffer channel {} dropped write to {:#x}", ctx.now(), channel, addr);
        false
      },
    }
  }

  /// Offer the head write of every unblocked channel to the arbiter.
  pub fn drain(&mut self, arbiter: &mut DramArbiter, ctx: &mut SimContext) {
    for channel in 0..self.channels.len() {
      self.send_head(channel, arbiter, ctx);
    }
    if self.channels.iter().any(|c| !c.blocked.is_set() && !c.queue.is_empty()) {
      ctx.sched.schedule_next(Event::WriteDrain);
    }
  }

  fn send_head(&mut self, channel: usize, arbiter: &mut DramArbiter, ctx: &mut SimContext) {
    let ch = &mut self.channels[channel];
    if ch.blocked.is_set() {
      return;
    }
    let Some(pkt) = ch.queue.pop_front() else {
      return;
    };
    if let Err(pkt) = arbiter.recv_timing_req(channel, WRITE_BUFFER_UPSTREAM, pkt, ctx) {
      ch.queue.push_front(pkt);
      ch.blocked.set();
    }
  }

  pub fn recv_req_retry(&mut self, channel: usize, arbiter: &mut DramArbiter, ctx: &mut SimContext) {
    let Some(ch) = self.channels.get_mut(channel) else {
      return;
    };
    ch.blocked.take();
    self.send_head(channel, arbiter, ctx);
    if !self.channels[channel].queue.is_empty() {
      ctx.sched.schedule_next(Event::WriteDrain);
    }
  }

  /// Writes never carry a response past the arbiter, but a routed one is accepted and retired.
  pub fn recv_timing_resp(&mut self, pkt: Packet, ctx: &mut SimContext) -> Result<(), Packet> {
    ctx.retire(pkt);
    Ok(())
  }
}
