//! Progress indicators for long-running steps.
//!
//! Downloads and data copies are the only steps that take noticeable wall
//! clock time. Bars are drawn on stderr and are hidden when stderr is not a
//! terminal, when `PROMUP_NO_PROGRESS` is set or after [`disable`], so logs
//! and CI output stay clean.

use indicatif::{ProgressBar, ProgressStyle};
use std::io::IsTerminal;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

static DISABLED: AtomicBool = AtomicBool::new(false);

/// Hide every bar created from now on (`--quiet`).
pub fn disable() {
    DISABLED.store(true, Ordering::Relaxed);
}

fn is_progress_disabled() -> bool {
    DISABLED.load(Ordering::Relaxed)
        || std::env::var_os("PROMUP_NO_PROGRESS").is_some()
        || !std::io::stderr().is_terminal()
}

/// Byte progress bar for a download of (possibly) known length.
pub fn download_bar(total: Option<u64>, label: &str) -> ProgressBar {
    if is_progress_disabled() {
        return ProgressBar::hidden();
    }

    let bar = match total {
        Some(total) => {
            let bar = ProgressBar::new(total);
            bar.set_style(
                ProgressStyle::with_template(
                    "{msg} [{bar:30.cyan/blue}] {bytes}/{total_bytes} ({eta})",
                )
                .unwrap_or_else(|_| ProgressStyle::default_bar())
                .progress_chars("=> "),
            );
            bar
        }
        None => {
            let bar = ProgressBar::new_spinner();
            bar.enable_steady_tick(Duration::from_millis(120));
            bar
        }
    };
    bar.set_message(label.to_string());
    bar
}

/// Spinner for work of unknown length (data copies).
pub fn spinner(label: &str) -> ProgressBar {
    if is_progress_disabled() {
        return ProgressBar::hidden();
    }

    let bar = ProgressBar::new_spinner();
    bar.set_style(
        ProgressStyle::with_template("{spinner} {msg} ({elapsed})")
            .unwrap_or_else(|_| ProgressStyle::default_spinner()),
    );
    bar.enable_steady_tick(Duration::from_millis(120));
    bar.set_message(label.to_string());
    bar
}
