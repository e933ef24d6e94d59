use serde::{Deserialize, Serialize};

use super::arbiter::{DramArbiter, Upstreams};
use super::decoder::params::{llama_7b_params, LayerParam};
use super::decoder::{BankLink, Decoder, DecoderConfig};
use super::define::{
  ARBITER_UPSTREAMS, BITMAP_BASE, BURST_WORDS, CAM_AGGRESSIVE_THRESHOLD, CAM_CAPACITY, CHANNEL_NUM, FEATURE_BASE,
  WEIGHT_BASE, WRITE_BUFFER_UPSTREAM,
};
use super::dma::{BankPolicy, DmaEngine};
use super::dram::{DramFrontend, FixedLatencyDram};
use super::error::{SimError, SimResult};
use super::event::{BankKind, Event};
use super::packet::Packet;
use super::port::{PortRef, TimingReqPort, TimingRespPort};
use super::source::{SyntheticWords, WordSource};
use super::stats::{Report, Stats};
use super::write_buffer::WriteBuffer;
use super::SimContext;

/// Construction parameters of one subsystem instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubsystemConfig {
  pub banks: usize,
  /// Bursts per DMA command.
  pub burst_lines: usize,
  pub arbiter_capacity: usize,
  pub write_buffer_capacity: usize,
  /// Stop the bitmap engine after this many commands per bank.
  pub bitmap_commands: Option<u64>,
  pub dram_channels: usize,
  pub dram_queue_depth: usize,
  pub dram_read_latency: u64,
  pub dram_write_latency: u64,
  pub cam_capacity: usize,
  pub aggressive_threshold: usize,
  pub seed: u64,
  /// Share of set bits in synthetic bitmaps.
  pub density: f64,
  pub params: Vec<LayerParam>,
  pub max_cycles: u64,
}

impl Default for SubsystemConfig {
  fn default() -> Self {
    Self {
      banks: CHANNEL_NUM,
      burst_lines: BURST_WORDS,
      arbiter_capacity: 4,
      write_buffer_capacity: 8,
      bitmap_commands: None,
      dram_channels: CHANNEL_NUM,
      dram_queue_depth: 16,
      dram_read_latency: 20,
      dram_write_latency: 20,
      cam_capacity: CAM_CAPACITY,
      aggressive_threshold: CAM_AGGRESSIVE_THRESHOLD,
      seed: 0x5EED,
      density: 0.5,
      params: llama_7b_params(),
      max_cycles: 1_000_000,
    }
  }
}

impl SubsystemConfig {
  pub fn validate(&self) -> SimResult<()> {
    if self.banks == 0 || self.banks > CHANNEL_NUM {
      return Err(SimError::config(format!("banks must be within 1..={}, got {}", CHANNEL_NUM, self.banks)));
    }
    if self.burst_lines == 0 {
      return Err(SimError::config("burst_lines must be positive"));
    }
    if self.arbiter_capacity == 0 || self.write_buffer_capacity == 0 || self.dram_queue_depth == 0 {
      return Err(SimError::config("queue capacities must be positive"));
    }
    if self.dram_channels == 0 {
      return Err(SimError::config("dram_channels must be positive"));
    }
    if !(0.0..=1.0).contains(&self.density) {
      return Err(SimError::config(format!("density {} outside [0, 1]", self.density)));
    }
    if self.aggressive_threshold > self.cam_capacity {
      return Err(SimError::config("aggressive_threshold exceeds cam_capacity"));
    }
    Ok(())
  }
}

/// Why a run stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunOutcome {
  /// The last parameter completed.
  Finished,
  CycleLimit,
  /// Nothing left to schedule: some retry obligation was never paid.
  Stalled,
}

/// Events handled at one tick.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TickRecord {
  pub tick: u64,
  pub events: Vec<Event>,
}

/// The DMA engines seen as the arbiter's upstream 0..=2 and the write buffer as 3.
struct UpstreamPorts<'a> {
  dma: &'a mut [DmaEngine; 3],
  write_buffer: &'a mut WriteBuffer,
}

impl Upstreams for UpstreamPorts<'_> {
  fn send_timing_resp(&mut self, upstream: usize, bank: usize, pkt: Packet, ctx: &mut SimContext) -> Result<(), Packet> {
    match BankKind::from_upstream(upstream) {
      Some(kind) => self.dma[kind as usize].recv_timing_resp(bank, pkt, ctx),
      None if upstream == WRITE_BUFFER_UPSTREAM => self.write_buffer.recv_timing_resp(pkt, ctx),
      None => {
        ctx.raise_protocol(format!("response for unknown upstream {}", upstream));
        Err(pkt)
      },
    }
  }
}

/// One DMA engine's request port into the arbiter.
struct ArbiterPort<'a> {
  arbiter: &'a mut DramArbiter,
  upstream: usize,
}

impl TimingReqPort for ArbiterPort<'_> {
  fn send_timing_req(&mut self, bank: usize, pkt: Packet, ctx: &mut SimContext) -> Result<(), Packet> {
    self.arbiter.recv_timing_req(bank, self.upstream, pkt, ctx)
  }
}

/// A DMA engine's consumer-side response port into the decoder.
struct DecoderPort<'a> {
  decoder: &'a mut Decoder,
  write_buffer: &'a mut WriteBuffer,
  kind: BankKind,
}

impl TimingRespPort for DecoderPort<'_> {
  fn send_timing_resp(&mut self, bank: usize, pkt: Packet, ctx: &mut SimContext) -> Result<(), Packet> {
    self.decoder.recv_timing_resp(self.kind, bank, pkt, self.write_buffer, ctx)
  }
}

/// The decoder's request ports into the three DMA engines.
struct DmaLink<'a> {
  dma: &'a mut [DmaEngine; 3],
}

impl BankLink for DmaLink<'_> {
  fn send_req(&mut self, kind: BankKind, bank: usize, pkt: Packet, ctx: &mut SimContext) -> Result<(), Packet> {
    self.dma[kind as usize].recv_timing_req(bank, pkt, ctx)
  }
}

/// Decoder, DMA engines, arbiter, DRAM and write-back buffer of one accelerator.
#[derive(Debug)]
pub struct MemSubsystem {
  ctx: SimContext,
  dma: [DmaEngine; 3],
  arbiter: DramArbiter,
  frontend: DramFrontend,
  write_buffer: WriteBuffer,
  decoder: Decoder,
  max_cycles: u64,
  started: bool,
  fault: Option<SimError>,
}

impl MemSubsystem {
  pub fn new(cfg: &SubsystemConfig) -> SimResult<Self> {
    let source = SyntheticWords::new(cfg.seed, cfg.density);
    Self::with_source(cfg, Box::new(source))
  }

  pub fn with_source(cfg: &SubsystemConfig, source: Box<dyn WordSource>) -> SimResult<Self> {
    cfg.validate()?;
    let banks = cfg.banks;
    let dma = BankKind::ALL.map(|kind| {
      let base = match kind {
        BankKind::Bitmap => BITMAP_BASE,
        BankKind::Weight => WEIGHT_BASE,
        BankKind::Feature => FEATURE_BASE,
      };
      DmaEngine::new(BankPolicy::for_kind(kind, cfg.bitmap_commands), banks, base, cfg.burst_lines)
    });
    let backend = FixedLatencyDram::new(
      cfg.dram_channels,
      cfg.dram_queue_depth,
      cfg.dram_read_latency,
      cfg.dram_write_latency,
    );
    let decoder = Decoder::new(DecoderConfig {
      banks,
      params: cfg.params.clone(),
      cam_capacity: cfg.cam_capacity,
      aggressive_threshold: cfg.aggressive_threshold,
    })?;
    Ok(Self {
      ctx: SimContext::new(banks),
      dma,
      arbiter: DramArbiter::new(banks, ARBITER_UPSTREAMS, cfg.arbiter_capacity),
      frontend: DramFrontend::new(banks, Box::new(backend), source),
      write_buffer: WriteBuffer::new(banks, cfg.write_buffer_capacity),
      decoder,
      max_cycles: cfg.max_cycles,
      started: false,
      fault: None,
    })
  }

  /// Queue the initial DMA commands and the first decoder tick.
  pub fn start(&mut self) {
    if self.started {
      return;
    }
    self.started = true;
    for dma in self.dma.iter_mut() {
      dma.start(&mut self.ctx);
    }
    self.decoder.start(&mut self.ctx);
  }

  pub fn now(&self) -> u64 {
    self.ctx.now()
  }

  pub fn stats(&self) -> &Stats {
    &self.ctx.stats
  }

  pub fn decoder(&self) -> &Decoder {
    &self.decoder
  }

  pub fn dma(&self, kind: BankKind) -> &DmaEngine {
    &self.dma[kind as usize]
  }

  pub fn arbiter(&self) -> &DramArbiter {
    &self.arbiter
  }

  pub fn write_buffer(&self) -> &WriteBuffer {
    &self.write_buffer
  }

  pub fn retired_packets(&self) -> u64 {
    self.ctx.retired()
  }

  /// Every parameter is done and every accepted write has reached DRAM.
  pub fn is_finished(&self) -> bool {
    self.decoder.is_finished() && self.is_drained()
  }

  /// Write-back buffer, arbiter and DRAM frontend hold nothing.
  pub fn is_drained(&self) -> bool {
    self.write_buffer.is_idle() && self.arbiter.is_idle() && self.frontend.is_idle()
  }

  pub fn next_tick(&self) -> Option<u64> {
    self.ctx.sched.next_tick()
  }

  /// The fault that aborted the run, if any.
  pub fn fault(&self) -> Option<&SimError> {
    self.fault.as_ref()
  }

  pub fn max_cycles(&self) -> u64 {
    self.max_cycles
  }

  pub fn report(&self) -> Report {
    self.ctx.stats.report(self.now())
  }

  /// Why the run would stop right now, if it would.
  pub fn outcome(&self) -> Option<RunOutcome> {
    if self.is_finished() {
      return Some(RunOutcome::Finished);
    }
    match self.ctx.sched.next_tick() {
      None => Some(RunOutcome::Stalled),
      Some(t) if t > self.max_cycles => Some(RunOutcome::CycleLimit),
      Some(_) => None,
    }
  }

  /// Handle every event of the earliest pending tick.
  pub fn step(&mut self) -> SimResult<Option<TickRecord>> {
    if let Some(err) = &self.fault {
      return Err(err.clone());
    }
    self.start();
    let Some(tick) = self.ctx.sched.next_tick() else {
      return Ok(None);
    };
    let mut events = Vec::new();
    while self.ctx.sched.next_tick() == Some(tick) {
      let Some((_, event)) = self.ctx.sched.pop() else {
        break;
      };
      self.dispatch(event);
      events.push(event);
      if let Some(err) = self.ctx.take_fault() {
        self.fault = Some(err.clone());
        return Err(err);
      }
    }
    Ok(Some(TickRecord { tick, events }))
  }

  /// Run until finished, stalled or past `max_cycles`.
  ///
  /// The last parameter only ends the run once its write-back has drained.
  pub fn run(&mut self) -> SimResult<RunOutcome> {
    self.run_with(|_| {})
  }

  pub fn run_with(&mut self, mut on_tick: impl FnMut(&TickRecord)) -> SimResult<RunOutcome> {
    self.start();
    loop {
      if let Some(outcome) = self.outcome() {
        log::info!("t={} run stopped: {:?}", self.now(), outcome);
        return Ok(outcome);
      }
      if let Some(record) = self.step()? {
        on_tick(&record);
      }
    }
  }

  fn dispatch(&mut self, event: Event) {
    let ctx = &mut self.ctx;
    match event {
      Event::DmaTick(kind) => {
        let mut port = ArbiterPort {
          arbiter: &mut self.arbiter,
          upstream: kind.upstream(),
        };
        self.dma[kind as usize].tick(&mut port, ctx);
      },
      Event::DmaRespond(kind) => {
        let mut port = DecoderPort {
          decoder: &mut self.decoder,
          write_buffer: &mut self.write_buffer,
          kind,
        };
        self.dma[kind as usize].send_responses(&mut port, ctx);
      },
      Event::Arbitrate => self.arbiter.arbitrate(&mut self.frontend, ctx),
      Event::ArbiterRespond => {
        let mut ups = UpstreamPorts {
          dma: &mut self.dma,
          write_buffer: &mut self.write_buffer,
        };
        self.arbiter.send_responses(&mut ups, ctx);
      },
      Event::DramTick => self.frontend.tick(&mut self.arbiter, ctx),
      Event::WriteDrain => self.write_buffer.drain(&mut self.arbiter, ctx),
      Event::DecoderTick => self.decoder.tick(&mut DmaLink { dma: &mut self.dma }, ctx),
      Event::CamRetry => self.decoder.cam_retry(&mut self.write_buffer, ctx),
      Event::CamClear => self.decoder.clear_cam(&mut self.write_buffer, ctx),
      Event::ReqRetry(target) => match target {
        PortRef::Decoder { kind, bank } => self.decoder.recv_req_retry(kind, bank, ctx),
        PortRef::Upstream { upstream, bank } => match BankKind::from_upstream(upstream) {
          Some(kind) => self.dma[kind as usize].recv_req_retry(bank, ctx),
          None => self.write_buffer.recv_req_retry(bank, &mut self.arbiter, ctx),
        },
        PortRef::Memory { bank } => self.arbiter.recv_req_retry(bank, ctx),
      },
      Event::RespRetry(target) => match target {
        PortRef::Decoder { kind, bank } => {
          let mut port = DecoderPort {
            decoder: &mut self.decoder,
            write_buffer: &mut self.write_buffer,
            kind,
          };
          self.dma[kind as usize].recv_resp_retry(bank, &mut port, ctx);
        },
        PortRef::Upstream { upstream, bank } => {
          let mut ups = UpstreamPorts {
            dma: &mut self.dma,
            write_buffer: &mut self.write_buffer,
          };
          self.arbiter.recv_resp_retry(bank, upstream, &mut ups, ctx);
        },
        PortRef::Memory { bank } => self.frontend.recv_resp_retry(bank, &mut self.arbiter, ctx),
      },
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::arch::sparse::source::WordImage;

  fn tiny_config(banks: usize) -> SubsystemConfig {
    SubsystemConfig {
      banks,
      burst_lines: 2,
      dram_channels: banks,
      dram_read_latency: 3,
      dram_write_latency: 2,
      params: vec![LayerParam::new("tiny", 32, 0, 256, 16)],
      max_cycles: 20_000,
      ..SubsystemConfig::default()
    }
  }

  #[test]
  fn test_tiny_table_runs_to_completion() {
    let mut sys = MemSubsystem::new(&tiny_config(2)).unwrap();
    assert_eq!(sys.run().unwrap(), RunOutcome::Finished);
    let stats = sys.stats();
    assert_eq!(stats.params_completed, 1);
    assert_eq!(stats.slices_completed, 4, "two slices per bank");
    assert!(stats.dram_bursts > 0);
    assert!(stats.mac_ops > 0);
    assert!(sys.decoder().lanes_valid());
    assert!(sys.retired_packets() > 0);
    assert!(sys.is_drained());
    assert_eq!(stats.dram_writes, stats.writes_enqueued);
  }

  #[test]
  fn test_empty_bitmaps_emit_nothing() {
    let mut sys = MemSubsystem::with_source(&tiny_config(1), Box::new(WordImage::new())).unwrap();
    assert_eq!(sys.run().unwrap(), RunOutcome::Finished);
    assert_eq!(sys.stats().mac_ops, 0);
    assert_eq!(sys.stats().totals().emissions(), 0);
  }

  #[test]
  fn test_cycle_limit_stops_the_run() {
    let cfg = SubsystemConfig {
      max_cycles: 50,
      ..tiny_config(1)
    };
    let mut sys = MemSubsystem::new(&cfg).unwrap();
    assert_eq!(sys.run().unwrap(), RunOutcome::CycleLimit);
    assert!(sys.now() <= 50);
  }

  #[test]
  fn test_run_is_deterministic() {
    let run = || {
      let mut sys = MemSubsystem::new(&tiny_config(2)).unwrap();
      let mut ticks = Vec::new();
      sys.run_with(|r| ticks.push(r.clone())).unwrap();
      (sys.report(), ticks)
    };
    assert_eq!(run(), run());
  }

  #[test]
  fn test_bad_config_fails_fast() {
    assert!(MemSubsystem::new(&SubsystemConfig {
      banks: 0,
      ..SubsystemConfig::default()
    })
    .is_err());
    assert!(MemSubsystem::new(&SubsystemConfig {
      density: 1.5,
      ..SubsystemConfig::default()
    })
    .is_err());
  }
}
