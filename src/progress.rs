//! Progress reporting and logging setup.
//!
//! Each long phase (CUE splitting, analysis) gets a `PhaseProgress`: an
//! indicatif bar on a terminal, or periodic `tracing` lines when the binary
//! runs with `--log-only` and the output is tailed from a log file.

use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

static LOG_ONLY: AtomicBool = AtomicBool::new(false);

const BAR_TEMPLATE: &str =
    "{msg} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({per_sec}, ETA: {eta})";

/// Lines logged per phase in log-only mode, roughly.
const LOG_LINES_PER_PHASE: u64 = 20;

pub fn set_log_only(value: bool) {
    LOG_ONLY.store(value, Ordering::Relaxed);
}

pub fn is_log_only() -> bool {
    LOG_ONLY.load(Ordering::Relaxed)
}

/// Install the fmt subscriber. `RUST_LOG` wins over `level` when set.
pub fn init_logging(level: &str) {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level)),
        )
        .with_target(false)
        .init();
}

/// "12.5s", "3.2m" or "1.1h".
pub fn format_duration(d: Duration) -> String {
    let secs = d.as_secs_f64();
    match secs {
        s if s < 60.0 => format!("{:.1}s", s),
        s if s < 3600.0 => format!("{:.1}m", s / 60.0),
        s => format!("{:.1}h", s / 3600.0),
    }
}

/// Progress of one batch phase. Safe to tick from worker threads.
pub struct PhaseProgress {
    phase: String,
    total: u64,
    done: AtomicU64,
    log_every: u64,
    bar: ProgressBar,
}

impl PhaseProgress {
    pub fn new(phase: &str, total: u64) -> Self {
        let bar = ProgressBar::new(total);
        if is_log_only() || total == 0 {
            bar.set_draw_target(ProgressDrawTarget::hidden());
        } else {
            bar.set_style(
                ProgressStyle::default_bar()
                    .template(BAR_TEMPLATE)
                    .unwrap_or_else(|_| ProgressStyle::default_bar())
                    .progress_chars("=> "),
            );
        }
        bar.set_message(phase.to_string());

        Self {
            phase: phase.to_string(),
            total,
            done: AtomicU64::new(0),
            log_every: (total / LOG_LINES_PER_PHASE).max(1),
            bar,
        }
    }

    pub fn tick(&self) {
        self.bar.inc(1);
        let done = self.done.fetch_add(1, Ordering::Relaxed) + 1;
        if is_log_only() && (done % self.log_every == 0 || done == self.total) {
            let pct = 100.0 * done as f64 / self.total as f64;
            tracing::info!("[{}] {}/{} ({:.1}%)", self.phase, done, self.total, pct);
        }
    }

    pub fn finish(&self, summary: &str) {
        if self.bar.is_hidden() {
            return;
        }
        self.bar.finish_with_message(format!("{}: {}", self.phase, summary));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(Duration::from_millis(1500)), "1.5s");
        assert_eq!(format_duration(Duration::from_secs(90)), "1.5m");
        assert_eq!(format_duration(Duration::from_secs(5400)), "1.5h");
    }

    #[test]
    fn test_phase_counts_ticks() {
        let progress = PhaseProgress::new("Testing", 3);
        for _ in 0..3 {
            progress.tick();
        }
        assert_eq!(progress.done.load(Ordering::Relaxed), 3);
        assert_eq!(progress.log_every, 1);
        progress.finish("done");
    }

    #[test]
    fn test_empty_phase_is_hidden() {
        assert!(PhaseProgress::new("Nothing", 0).bar.is_hidden());
    }
}
