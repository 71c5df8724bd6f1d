//! Logging setup for rosie processes.
//!
//! Nodes usually run unattended, so besides the compact console format there
//! is a JSON-lines format for shipping logs off the Pi.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tracing::Level;
use tracing_subscriber::{
    EnvFilter,
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
};

use crate::config::AppConfig;

#[derive(Debug, Clone, Copy, Default)]
pub struct LogConfig {
    pub json: bool,
    /// DEBUG for rosie's own targets instead of INFO
    pub verbose: bool,
}

impl From<&AppConfig> for LogConfig {
    fn from(config: &AppConfig) -> Self {
        Self {
            json: config.json_logs,
            verbose: config.verbose,
        }
    }
}

impl LogConfig {
    fn level(&self) -> Level {
        if self.verbose { Level::DEBUG } else { Level::INFO }
    }

    /// `RUST_LOG` wins when set; otherwise only rosie's targets are shown.
    fn filter(&self) -> EnvFilter {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new(format!("rosie={}", self.level().as_str().to_lowercase()))
        })
    }
}

/// Install the global subscriber. Fails if one is already installed.
pub fn init(config: LogConfig) -> Result<()> {
    let registry = tracing_subscriber::registry().with(config.filter());

    if config.json {
        registry
            .with(
                fmt::layer()
                    .json()
                    .with_span_events(FmtSpan::CLOSE)
                    .with_current_span(true),
            )
            .try_init()
    } else {
        registry
            .with(fmt::layer().compact().with_target(false))
            .try_init()
    }
    .context("Failed to install log subscriber")
}

const UNSET: u64 = 0;

/// Lets a repeated message through at most once per interval.
///
/// Used by the agent's poll loop so an idle node or a lost queue store does
/// not write a line every poll.
pub struct LogThrottle {
    interval: Duration,
    epoch: Instant,
    /// Millis since `epoch` (offset by one) before which nothing is logged.
    quiet_until: AtomicU64,
}

impl LogThrottle {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            epoch: Instant::now(),
            quiet_until: AtomicU64::new(UNSET),
        }
    }

    pub fn should_log(&self) -> bool {
        let now = self.millis_since_epoch();
        let quiet_until = self.quiet_until.load(Ordering::Relaxed);
        if quiet_until != UNSET && now < quiet_until {
            return false;
        }

        let next = now.saturating_add(self.interval.as_millis() as u64);
        self.quiet_until
            .compare_exchange(quiet_until, next, Ordering::Relaxed, Ordering::Relaxed)
            .is_ok()
    }

    /// The condition cleared; log the next occurrence straight away.
    pub fn reset(&self) {
        self.quiet_until.store(UNSET, Ordering::Relaxed);
    }

    fn millis_since_epoch(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64 + 1
    }
}
