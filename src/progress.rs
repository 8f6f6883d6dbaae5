//! Progress bar construction shared by the pipeline stages.
//!
//! Byte bars for downloads and local hashing, a spinner for remote hashing.
//! Bars are removed once their operation completes so the display only shows
//! in-flight work.

use std::borrow::Cow;
use std::time::Duration;

use indicatif::{MultiProgress, ProgressBar, ProgressStyle};

// Bar labels wider than this get elided so the columns stay aligned.
const NAME_WIDTH: usize = 33;

pub fn trim_name(name: &str) -> Cow<'_, str> {
    if name.chars().count() > NAME_WIDTH {
        let head: String = name.chars().take(NAME_WIDTH - 3).collect();
        Cow::Owned(format!("{head}..."))
    } else {
        Cow::Borrowed(name)
    }
}

fn byte_style() -> ProgressStyle {
    ProgressStyle::with_template(
        "{spinner:.green} {msg} [{bar:30.cyan/blue}] {percent:>3}% {bytes}/{total_bytes} ({bytes_per_sec}, {eta})",
    )
    .unwrap_or_else(|_| ProgressStyle::default_bar())
    .progress_chars("=> ")
}

fn spinner_style() -> ProgressStyle {
    ProgressStyle::with_template("{spinner:.green} {msg} {elapsed}")
        .unwrap_or_else(|_| ProgressStyle::default_spinner())
}

/// A byte-counting bar for a transfer or hash of known length.
pub fn transfer_bar(progress: &MultiProgress, name: &str, total: u64) -> ProgressBar {
    let bar = progress.add(ProgressBar::new(total));
    bar.set_style(byte_style());
    bar.set_message(trim_name(name).into_owned());
    bar
}

/// A spinner with elapsed time for operations of unknown length.
pub fn spinner(progress: &MultiProgress, name: &str) -> ProgressBar {
    let bar = progress.add(ProgressBar::new_spinner());
    bar.set_style(spinner_style());
    bar.set_message(trim_name(name).into_owned());
    bar.enable_steady_tick(Duration::from_millis(100));
    bar
}

/// Finish a bar and drop it from the display.
pub fn remove(progress: &MultiProgress, bar: &ProgressBar) {
    bar.finish_and_clear();
    progress.remove(bar);
}
