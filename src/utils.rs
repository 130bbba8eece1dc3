use std::time::Duration;

use indicatif::{MultiProgress, ProgressBar, ProgressStyle};

pub static PROGRESS_TEMPLATE: &str = "[{elapsed_precise}] {bar:40.cyan/blue} {human_pos:>7}/{human_len:7} {msg}";
pub static SPINNER_TEMPLATE: &str = "[{elapsed_precise}] {spinner:2.cyan/blue} {msg}";
pub static SPINNER_TOTALS_TEMPLATE: &str = "{spinner:2.cyan/blue} {msg}: {human_pos}";

pub fn new_spinner(message: &str) -> ProgressBar {
    let style = ProgressStyle::with_template(SPINNER_TEMPLATE).expect("Invalid spinner template");
    ProgressBar::new_spinner().with_message(message.to_string()).with_style(style)
}

pub fn new_progress_bar(total: usize, message: &str) -> ProgressBar {
    let style = ProgressStyle::with_template(PROGRESS_TEMPLATE).expect("Invalid progress bar template");
    ProgressBar::new(total as u64).with_message(message.to_string()).with_style(style)
}

pub fn new_spinner_totals(message: &str) -> ProgressBar {
    let style = ProgressStyle::with_template(SPINNER_TOTALS_TEMPLATE).expect("Invalid spinner template");
    ProgressBar::new_spinner().with_message(message.to_string()).with_style(style)
}

/// The bar set shown while an import runs: the current phase plus running
/// totals for inserted and skipped rows.
#[derive(Clone)]
pub struct ImportBars {
    _bars: MultiProgress,
    pub phase: ProgressBar,
    pub inserted: ProgressBar,
    pub skipped: ProgressBar,
}

impl ImportBars {
    pub fn new(message: &str) -> ImportBars {
        let bars = MultiProgress::new();
        let phase = new_spinner(message);
        let inserted = new_spinner_totals("Rows inserted");
        let skipped = new_spinner_totals("Duplicates skipped");
        bars.add(phase.clone());
        bars.add(inserted.clone());
        bars.add(skipped.clone());

        // the tick has to be enabled after adding to the multiprogress or the
        // bar renders against the old target and corrupts the screen
        phase.enable_steady_tick(Duration::from_millis(200));
        inserted.enable_steady_tick(Duration::from_millis(200));
        skipped.enable_steady_tick(Duration::from_millis(200));

        ImportBars {
            _bars: bars,
            phase,
            inserted,
            skipped,
        }
    }

    pub fn finish(&self) {
        self.phase.finish();
        self.inserted.finish();
        self.skipped.finish();
    }
}
