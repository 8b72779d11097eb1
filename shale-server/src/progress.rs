use std::io::IsTerminal;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

const MIN_DRAW_DELAY: Duration = Duration::from_millis(100);

/// Counts completed work items and repaints a status line on stderr.
/// Silent when stderr is not a terminal. Dropping it prints the final rate.
pub struct Progress {
    total: usize,
    description: &'static str,
    value: AtomicUsize,
    start: Instant,
    last_draw: Mutex<Instant>,
    interactive: bool,
}

impl Progress {
    pub fn new(total: usize, description: &'static str) -> Self {
        let start = Instant::now();
        Self {
            total,
            description,
            value: AtomicUsize::new(0),
            start,
            last_draw: Mutex::new(start.checked_sub(MIN_DRAW_DELAY).unwrap_or(start)),
            interactive: std::io::stderr().is_terminal(),
        }
    }

    pub fn put(&self, n: usize) {
        if n == 0 {
            return;
        }
        let value = (self.value.fetch_add(n, Ordering::Relaxed) + n).min(self.total);
        if !self.interactive {
            return;
        }

        {
            let mut last_draw = self.last_draw.lock().expect("progress lock poisoned");
            if last_draw.elapsed() < MIN_DRAW_DELAY && value < self.total {
                return;
            }
            *last_draw = Instant::now();
        }

        let elapsed = self.start.elapsed().as_secs_f64();
        let percentage = 100.0 * value as f64 / self.total.max(1) as f64;
        let mut status = format!(
            "{} / {} {}.  {:.1}% in {}.",
            value,
            self.total,
            self.description,
            percentage,
            seconds_to_text(elapsed as u64)
        );

        if value > 0 && value < self.total {
            let interval = elapsed / value as f64;
            let remaining = ((self.total - value) as f64 * interval).round() as u64;
            status.push_str(&format!("  {} remaining.", seconds_to_text(remaining)));
        }

        eprint!("\r{}\x1b[K", status);
    }
}

impl Drop for Progress {
    fn drop(&mut self) {
        if !self.interactive {
            return;
        }
        let value = self.value.load(Ordering::Relaxed).min(self.total);
        let rate = value as f64 / self.start.elapsed().as_secs_f64().max(f64::EPSILON);
        eprintln!("\rDone: {} {}, {:.1} / second\x1b[K", value, self.description, rate);
    }
}

fn seconds_to_text(seconds: u64) -> String {
    if seconds == 1 {
        "1 second".to_string()
    } else if seconds < 2 * 60 {
        format!("{} seconds", seconds)
    } else if seconds < 2 * 60 * 60 {
        format!("{}:{:02} minutes", seconds / 60, seconds % 60)
    } else if seconds < 2 * 60 * 60 * 24 {
        format!("{}:{:02} hours", seconds / 3600, (seconds / 60) % 60)
    } else {
        format!(
            "{} days and {} hours",
            seconds / 86400,
            (seconds / 3600) % 24
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_durations() {
        assert_eq!(seconds_to_text(1), "1 second");
        assert_eq!(seconds_to_text(90), "90 seconds");
        assert_eq!(seconds_to_text(150), "2:30 minutes");
        assert_eq!(seconds_to_text(2 * 3600 + 120), "2:02 hours");
        assert_eq!(seconds_to_text(3 * 86400 + 5 * 3600), "3 days and 5 hours");
    }

    #[test]
    fn put_accumulates_and_ignores_zero() {
        let progress = Progress::new(5, "items");
        progress.put(3);
        progress.put(0);
        progress.put(2);
        assert_eq!(progress.value.load(Ordering::Relaxed), 5);
    }
}
