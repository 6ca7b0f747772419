use std::time::{Duration, Instant};

use tracing::info;

use crate::entity::EntityType;

const BAR_WIDTH: usize = 20;
/// Records between progress events.
pub const PROGRESS_EVERY: u64 = 100;

/// Periodic progress events for one entity import.
#[derive(Debug)]
pub struct ProgressLog {
    entity: EntityType,
    total: u64,
    done: u64,
    started: Instant,
}

impl ProgressLog {
    pub fn new(entity: EntityType, total: usize) -> Self {
        Self {
            entity,
            total: total as u64,
            done: 0,
            started: Instant::now(),
        }
    }

    /// Count `n` processed records, logging every [`PROGRESS_EVERY`] and at the end.
    pub fn advance(&mut self, n: usize) {
        let before = self.done / PROGRESS_EVERY;
        self.done += n as u64;
        let crossed = self.done / PROGRESS_EVERY != before;
        if crossed || self.done == self.total {
            self.emit();
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Records per second since construction.
    pub fn throughput(&self) -> f64 {
        rate(self.done, self.elapsed())
    }

    fn emit(&self) {
        let percent = percent(self.done, self.total);
        info!(
            target: "transit_migrate",
            event = "import_progress",
            entity = %self.entity,
            done = self.done,
            total = self.total,
            percent = format!("{percent:.1}"),
            records_per_sec = format!("{:.0}", self.throughput()),
            bar = %render_bar(percent)
        );
    }
}

fn percent(done: u64, total: u64) -> f64 {
    if total == 0 {
        100.0
    } else {
        (done.min(total) as f64 / total as f64) * 100.0
    }
}

fn rate(done: u64, elapsed: Duration) -> f64 {
    let secs = elapsed.as_secs_f64();
    if secs <= f64::EPSILON {
        done as f64
    } else {
        done as f64 / secs
    }
}

fn render_bar(percent: f64) -> String {
    let filled = ((percent / 100.0) * BAR_WIDTH as f64).round() as usize;
    let filled = filled.min(BAR_WIDTH);
    format!("[{}{}]", "#".repeat(filled), "-".repeat(BAR_WIDTH - filled))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bar_is_fixed_width() {
        assert_eq!(render_bar(0.0), "[--------------------]");
        assert_eq!(render_bar(50.0), "[##########----------]");
        assert_eq!(render_bar(100.0), "[####################]");
        assert_eq!(render_bar(250.0).len(), BAR_WIDTH + 2);
    }

    #[test]
    fn percent_of_empty_input_is_complete() {
        assert_eq!(percent(0, 0), 100.0);
        assert_eq!(percent(25, 100), 25.0);
        assert_eq!(percent(150, 100), 100.0);
    }
}
