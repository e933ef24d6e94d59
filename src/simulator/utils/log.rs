use log::LevelFilter;
use std::sync::atomic::{AtomicBool, Ordering};

static ENABLE_LOG: AtomicBool = AtomicBool::new(true);

/// Turn the `log_info!` console banner on or off.
pub fn set_log(enabled: bool) {
  ENABLE_LOG.store(enabled, Ordering::Relaxed);
}

/// Default is true
pub fn is_log_enabled() -> bool {
  ENABLE_LOG.load(Ordering::Relaxed)
}

/// Install `env_logger` once. `RUST_LOG` wins; otherwise info, or warn when quiet.
pub fn init_log(quiet: bool) {
  let default_level = if quiet { LevelFilter::Warn } else { LevelFilter::Info };
  let _ = env_logger::Builder::new()
    .filter_level(default_level)
    .parse_default_env()
    .format_timestamp(None)
    .try_init();
  if quiet {
    log::set_max_level(LevelFilter::Warn);
    set_log(false);
  }
}

/// Print a user-facing line with a blue [Log] prefix
#[macro_export]
macro_rules! log_info {
  ($($arg:tt)*) => {
    if $crate::simulator::utils::log::is_log_enabled() {
      println!("\x1b[34m[Log]\x1b[0m {}", format!($($arg)*));
    }
  };
}
