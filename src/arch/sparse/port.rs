//! Timing-port retry protocol.
//!
//! A requester hands a packet to `send_timing_req`; the responder either takes
//! it (`Ok`) or hands it back (`Err`). After a refusal the responder owes the
//! requester exactly one retry, delivered as an [`Event::ReqRetry`], and the
//! requester must not resend until that retry arrives. Responses travel the
//! same way in reverse with [`Event::RespRetry`].

use serde::Serialize;

use super::event::{BankKind, Event};
use super::packet::Packet;
use super::SimContext;

/// Addresses one end of a port binding.
///
/// `ReqRetry` targets the requester named here, `RespRetry` the responder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum PortRef {
  /// Decoder bank port bound to a DMA engine bank.
  Decoder { kind: BankKind, bank: usize },
  /// Arbiter upstream port (a DMA engine bank or a write-buffer channel).
  Upstream { upstream: usize, bank: usize },
  /// Arbiter bank port bound to the DRAM frontend.
  Memory { bank: usize },
}

/// One direction of a port's retry bookkeeping.
///
/// On a responder it records an owed retry; on a requester it records that
/// sending is paused until the retry arrives. Setting it twice still leaves a
/// single obligation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RetryFlag(bool);

impl RetryFlag {
  pub fn set(&mut self) {
    self.0 = true;
  }

  pub fn is_set(&self) -> bool {
    self.0
  }

  /// Clear the flag, reporting whether it was set.
  pub fn take(&mut self) -> bool {
    std::mem::take(&mut self.0)
  }
}

/// Request side of a banked port binding, seen from the requester.
pub trait TimingReqPort {
  fn send_timing_req(&mut self, bank: usize, pkt: Packet, ctx: &mut SimContext) -> Result<(), Packet>;
}

/// Response side of a banked port binding, seen from the responder.
pub trait TimingRespPort {
  fn send_timing_resp(&mut self, bank: usize, pkt: Packet, ctx: &mut SimContext) -> Result<(), Packet>;
}

/// Pay an owed request retry, if any.
pub fn send_retry_req(owed: &mut RetryFlag, target: PortRef, ctx: &mut SimContext) {
  if owed.take() {
    log::trace!("t={} retry req -> {:?}", ctx.now(), target);
    ctx.sched.schedule_now(Event::ReqRetry(target));
  }
}

/// Pay an owed response retry, if any.
pub fn send_retry_resp(owed: &mut RetryFlag, target: PortRef, ctx: &mut SimContext) {
  if owed.take() {
    log::trace!("t={} retry resp -> {:?}", ctx.now(), target);
    ctx.sched.schedule_now(Event::RespRetry(target));
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_retry_flag_holds_one_obligation() {
    let mut flag = RetryFlag::default();
    flag.set();
    flag.set();
    assert!(flag.take());
    assert!(!flag.take());
  }

  #[test]
  fn test_retry_is_delivered_once() {
    let mut ctx = SimContext::new(1);
    let mut owed = RetryFlag::default();
    let target = PortRef::Memory { bank: 0 };
    send_retry_req(&mut owed, target, &mut ctx);
    assert!(ctx.sched.is_empty());
    owed.set();
    send_retry_req(&mut owed, target, &mut ctx);
    send_retry_req(&mut owed, target, &mut ctx);
    assert_eq!(ctx.sched.len(), 1);
    assert_eq!(ctx.sched.pop(), Some((0, Event::ReqRetry(target))));
  }
}
