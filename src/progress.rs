//! Progress reporting for transfers
//!
//! A [`ProgressSink`] is told `(bytes_so_far, total_bytes)` after every
//! chunk. A total of `0` means the size is not known yet and consumers
//! should show indeterminate progress. Sinks observe only; they cannot
//! stop a transfer and must return quickly.

use indicatif::{ProgressBar, ProgressStyle};

/// Receives cumulative byte counts from the transfer engine
pub trait ProgressSink: Send + Sync {
    fn report(&self, bytes_so_far: u64, total_bytes: u64);
}

impl<F> ProgressSink for F
where
    F: Fn(u64, u64) + Send + Sync,
{
    fn report(&self, bytes_so_far: u64, total_bytes: u64) {
        self(bytes_so_far, total_bytes)
    }
}

/// Discards every report
#[derive(Debug, Default, Clone, Copy)]
pub struct NoProgress;

impl ProgressSink for NoProgress {
    fn report(&self, _bytes_so_far: u64, _total_bytes: u64) {}
}

/// Terminal progress bar
///
/// Starts as a spinner and becomes a bar once a non-zero total arrives.
pub struct BarProgress {
    bar: ProgressBar,
}

impl BarProgress {
    pub fn new(message: impl Into<String>) -> Self {
        Self::from_bar(ProgressBar::new_spinner(), message)
    }

    /// Wrap a bar that already belongs to a `MultiProgress`
    pub fn from_bar(bar: ProgressBar, message: impl Into<String>) -> Self {
        bar.set_style(spinner_style());
        bar.set_message(message.into());
        Self { bar }
    }

    pub fn finish(&self, message: impl Into<String>) {
        self.bar.finish_with_message(message.into());
    }

    pub fn abandon(&self, message: impl Into<String>) {
        self.bar.abandon_with_message(message.into());
    }
}

impl ProgressSink for BarProgress {
    fn report(&self, bytes_so_far: u64, total_bytes: u64) {
        if total_bytes > 0 && self.bar.length() != Some(total_bytes) {
            self.bar.set_length(total_bytes);
            self.bar.set_style(bar_style());
        }
        self.bar.set_position(bytes_so_far);
    }
}

fn bar_style() -> ProgressStyle {
    ProgressStyle::default_bar()
        .template("{spinner:.green} {msg} [{elapsed_precise}] [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({bytes_per_sec}, {eta})")
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("#>-")
}

fn spinner_style() -> ProgressStyle {
    ProgressStyle::default_spinner()
        .template("{spinner:.green} {msg} [{elapsed_precise}] {bytes} ({bytes_per_sec})")
        .unwrap_or_else(|_| ProgressStyle::default_spinner())
}

/// Turns per-file reports into running totals for a whole mirror.
///
/// `base` is the number of bytes already moved by earlier files and
/// `total` the overall size (or `0` if unknown).
pub struct OffsetProgress<'a> {
    inner: &'a dyn ProgressSink,
    base: u64,
    total: u64,
}

impl<'a> OffsetProgress<'a> {
    pub fn new(inner: &'a dyn ProgressSink, base: u64, total: u64) -> Self {
        Self { inner, base, total }
    }
}

impl ProgressSink for OffsetProgress<'_> {
    fn report(&self, bytes_so_far: u64, _total_bytes: u64) {
        self.inner.report(self.base + bytes_so_far, self.total);
    }
}

/// Format a byte count for display
pub fn format_size(size: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if size >= GB {
        format!("{:.2} GB", size as f64 / GB as f64)
    } else if size >= MB {
        format!("{:.2} MB", size as f64 / MB as f64)
    } else if size >= KB {
        format!("{:.2} KB", size as f64 / KB as f64)
    } else {
        format!("{} B", size)
    }
}

/// Format a Unix timestamp as `YYYY-MM-DD HH:MM` (UTC)
pub fn format_timestamp(timestamp: u64) -> String {
    let days = timestamp / 86_400;
    let secs = timestamp % 86_400;

    // Civil date from day count, proleptic Gregorian calendar
    let z = days + 719_468;
    let era = z / 146_097;
    let doe = z - era * 146_097;
    let yoe = (doe - doe / 1_460 + doe / 36_524 - doe / 146_096) / 365;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let day = doy - (153 * mp + 2) / 5 + 1;
    let month = if mp < 10 { mp + 3 } else { mp - 9 };
    let year = yoe + era * 400 + u64::from(month <= 2);

    format!(
        "{}-{:02}-{:02} {:02}:{:02}",
        year,
        month,
        day,
        secs / 3_600,
        secs % 3_600 / 60
    )
}
