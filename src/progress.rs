//! Progress bar on stderr. stdout carries the binary stream, so the bar must
//! never touch it.

use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};

/// Byte-counting progress display. Hidden unless enabled.
pub struct Progress {
    bar: ProgressBar,
}

impl Progress {
    /// `total` is `None` when the length is not known up front (the applier
    /// only knows the source length, not how much will change).
    pub fn new(enabled: bool, label: &str, total: Option<u64>) -> Self {
        if !enabled {
            return Self {
                bar: ProgressBar::hidden(),
            };
        }

        let bar = match total {
            Some(len) => {
                let bar = ProgressBar::with_draw_target(Some(len), ProgressDrawTarget::stderr());
                bar.set_style(
                    ProgressStyle::with_template(concat!(
                        "{prefix:>8} [{elapsed_precise}] [{bar:40.cyan/blue}] ",
                        "{bytes}/{total_bytes} ({bytes_per_sec}, {eta})",
                    ))
                    .unwrap_or_else(|_| ProgressStyle::default_bar())
                    .progress_chars("=> "),
                );
                bar
            }
            None => {
                let bar = ProgressBar::with_draw_target(None, ProgressDrawTarget::stderr());
                bar.set_style(
                    ProgressStyle::with_template(
                        "{prefix:>8} [{elapsed_precise}] {spinner} {bytes} ({bytes_per_sec})",
                    )
                    .unwrap_or_else(|_| ProgressStyle::default_spinner()),
                );
                bar
            }
        };
        bar.set_prefix(label.to_string());
        Self { bar }
    }

    pub fn advance(&self, bytes: u64) {
        self.bar.inc(bytes);
    }

    pub fn finish(&self) {
        self.bar.finish();
    }
}
