//! Terminal progress bar fed by the engine's status callbacks.

use indicatif::{ProgressBar, ProgressStyle};
use resumable_fetch::download::StatusController;

/// Byte progress bar; switches from spinner to bar once the length is known.
pub(crate) struct BarStatus {
    bar: ProgressBar,
}

impl BarStatus {
    pub(crate) fn new() -> Self {
        let bar = ProgressBar::new(0);
        bar.set_style(
            ProgressStyle::with_template(
                "{spinner} [{elapsed_precise}] [{bar:40}] {bytes}/{total_bytes} ({bytes_per_sec}, {eta})",
            )
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("=> "),
        );
        Self { bar }
    }

    pub(crate) fn hidden() -> Self {
        Self {
            bar: ProgressBar::hidden(),
        }
    }

    pub(crate) fn finish(&self) {
        self.bar.finish_and_clear();
    }
}

impl StatusController for BarStatus {
    fn reset(&self, progress: u64, total: u64) {
        if total > 0 {
            self.bar.set_length(total);
        }
        self.bar.set_position(progress);
    }

    fn on_progress(&self, _url: &str, _chunk_size: u64, progress: u64) {
        self.bar.set_position(progress);
    }
}
