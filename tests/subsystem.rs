use sparsim::arch::sparse::decoder::params::LayerParam;
use sparsim::arch::sparse::event::BankKind;
use sparsim::{MemSubsystem, RunOutcome, SubsystemConfig};
use std::sync::Mutex;

// Runs are deterministic but heavy; keep them one at a time.
static TEST_MUTEX: Mutex<()> = Mutex::new(());

fn tiny_param(name: &str) -> LayerParam {
  // two feature blocks of one 512-bit burst each, one weight block
  LayerParam::new(name, 32, 0, 256, 16)
}

fn config(banks: usize, params: Vec<LayerParam>) -> SubsystemConfig {
  SubsystemConfig {
    banks,
    burst_lines: 2,
    dram_channels: banks,
    dram_read_latency: 4,
    dram_write_latency: 3,
    params,
    max_cycles: 200_000,
    ..SubsystemConfig::default()
  }
}

macro_rules! test_case {
  ($name:ident, $cfg:expr, $expected:expr, |$sys:ident| $check:block) => {
    #[test]
    fn $name() {
      let _guard = TEST_MUTEX.lock().unwrap();
      let _ = env_logger::builder().is_test(true).try_init();

      let mut $sys = MemSubsystem::new(&$cfg).expect("valid configuration");
      let outcome = $sys.run().expect("run without protocol faults");
      assert_eq!(outcome, $expected);
      assert!($sys.decoder().lanes_valid());
      $check
    }
  };
}

test_case!(test_single_bank_tiny_table, config(1, vec![tiny_param("tiny")]), RunOutcome::Finished, |sys| {
  let stats = sys.stats();
  assert_eq!(stats.params_completed, 1);
  assert_eq!(stats.slices_completed, 2);
  assert!(sys.decoder().is_finished());
});

test_case!(test_all_eight_banks, config(8, vec![tiny_param("tiny")]), RunOutcome::Finished, |sys| {
  assert_eq!(sys.stats().slices_completed, 16);
  for bank in 0..8 {
    let status = sys.decoder().bank_status(bank).unwrap();
    assert_eq!(status.cam_entries, 0);
  }
});

test_case!(
  test_parameters_run_in_order,
  config(2, vec![tiny_param("first"), tiny_param("second"), tiny_param("third")]),
  RunOutcome::Finished,
  |sys| {
    assert_eq!(sys.stats().params_completed, 3);
    assert_eq!(sys.decoder().current_param().name, "third");
  }
);

test_case!(
  test_dense_bitmaps_conserve_mac_work,
  SubsystemConfig {
    density: 1.0,
    ..config(2, vec![tiny_param("dense")])
  },
  RunOutcome::Finished,
  |sys| {
    // 2 banks x 2 bursts x 16 rows x 32 ones, all evicted by the end
    assert_eq!(sys.stats().mac_ops, 2 * 2 * 16 * 32);
    assert!(sys.stats().totals().emissions() > 0);
  }
);

test_case!(
  test_empty_bitmaps_do_no_mac_work,
  SubsystemConfig {
    density: 0.0,
    ..config(2, vec![tiny_param("empty")])
  },
  RunOutcome::Finished,
  |sys| {
    assert_eq!(sys.stats().mac_ops, 0);
    assert_eq!(sys.stats().writes_enqueued, 0);
  }
);

test_case!(
  test_exhausted_bitmap_engine_stalls,
  SubsystemConfig {
    bitmap_commands: Some(1),
    // four bursts per slice, one command only carries two
    ..config(1, vec![LayerParam::new("wide", 64, 0, 256, 64)])
  },
  RunOutcome::Stalled,
  |sys| {
    assert_eq!(sys.stats().params_completed, 0);
    let status = sys.decoder().bank_status(0).unwrap();
    assert_eq!(status.addr_count, 2);
    assert!(!status.stalled);
    assert_eq!(sys.dma(BankKind::Bitmap).completed_commands(0), 1);
    assert_eq!(sys.dma(BankKind::Bitmap).last_completion(0), Some(0));
  }
);

test_case!(
  test_final_write_back_reaches_dram,
  config(2, vec![tiny_param("tiny")]),
  RunOutcome::Finished,
  |sys| {
    let stats = sys.stats();
    assert!(stats.writes_enqueued > 0);
    assert_eq!(sys.write_buffer().pending(), 0);
    assert!(sys.arbiter().is_idle());
    assert!(sys.is_drained());
    // dropped writes never enter the buffer; every accepted one completes
    assert_eq!(stats.dram_writes, stats.writes_enqueued);
  }
);

test_case!(
  test_cycle_limit,
  SubsystemConfig {
    max_cycles: 40,
    ..config(2, vec![tiny_param("tiny")])
  },
  RunOutcome::CycleLimit,
  |sys| {
    assert!(sys.now() <= 40);
    assert!(!sys.decoder().is_finished());
  }
);

test_case!(
  test_narrow_arbiter_and_slow_dram_still_finish,
  SubsystemConfig {
    arbiter_capacity: 1,
    dram_queue_depth: 1,
    dram_read_latency: 30,
    write_buffer_capacity: 1,
    ..config(4, vec![tiny_param("tiny")])
  },
  RunOutcome::Finished,
  |sys| {
    assert_eq!(sys.stats().params_completed, 1);
    assert!(sys.stats().dram_bursts > 0);
    assert_eq!(sys.stats().rejected_commands, 0);
    assert_eq!(sys.stats().dram_writes, sys.stats().writes_enqueued);
  }
);

#[test]
fn test_same_seed_same_report() {
  let _guard = TEST_MUTEX.lock().unwrap();
  let cfg = config(2, vec![tiny_param("tiny")]);
  let mut a = MemSubsystem::new(&cfg).unwrap();
  let mut b = MemSubsystem::new(&cfg).unwrap();
  a.run().unwrap();
  b.run().unwrap();
  assert_eq!(a.report(), b.report());

  let other = SubsystemConfig { seed: 99, ..cfg };
  let mut c = MemSubsystem::new(&other).unwrap();
  c.run().unwrap();
  assert_eq!(c.stats().params_completed, 1);
}
