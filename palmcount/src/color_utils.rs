//! Color and styling utilities for the diagnostic stream.
//!
//! Diagnostics go to stderr and may be read by a human or captured by the
//! supervising process. Colors are used only when:
//! - the `--no-color` CLI flag is absent
//! - `NO_COLOR` (https://no-color.org/) and `PALMCOUNT_NO_COLOR` are unset or empty
//! - `TERM` is not `dumb`
//! - stderr is a TTY

use colored::ColoredString;
use std::io::{stderr, IsTerminal};
use std::sync::OnceLock;

static COLOR_CONFIG: OnceLock<ColorConfig> = OnceLock::new();

fn should_disable_colors_from_env() -> bool {
    !std::env::var("NO_COLOR").unwrap_or_default().is_empty()
        || !std::env::var("PALMCOUNT_NO_COLOR")
            .unwrap_or_default()
            .is_empty()
        || std::env::var("TERM").unwrap_or_default() == "dumb"
        || !stderr().is_terminal()
}

#[derive(Debug, Clone)]
struct ColorConfig {
    colors_enabled: bool,
}

impl ColorConfig {
    fn new(no_color_flag: bool) -> Self {
        let colors_enabled = !no_color_flag && !should_disable_colors_from_env();
        Self { colors_enabled }
    }

    fn is_enabled(&self) -> bool {
        self.colors_enabled
    }
}

/// Initialize the color configuration with the CLI flag state.
/// Call once at startup, before the logger is built.
pub fn init_color_config(no_color_flag: bool) {
    let config = ColorConfig::new(no_color_flag);
    if COLOR_CONFIG.set(config).is_err() {
        log::debug!("Color configuration already initialized");
    }
}

pub(crate) fn colors_enabled() -> bool {
    COLOR_CONFIG
        .get()
        .map(|config| config.is_enabled())
        .unwrap_or_else(|| !should_disable_colors_from_env())
}

/// Apply color to a string only if colors are enabled for stderr output
pub fn maybe_color_stderr<F>(text: &str, color_fn: F) -> String
where
    F: FnOnce(&str) -> ColoredString,
{
    if colors_enabled() {
        color_fn(text).to_string()
    } else {
        text.to_string()
    }
}

/// Semantic color functions for log level tags
pub mod colors {
    use super::maybe_color_stderr;
    use colored::Colorize;

    pub fn error_level(text: &str) -> String {
        maybe_color_stderr(text, |s| s.red().bold())
    }

    pub fn warning_level(text: &str) -> String {
        maybe_color_stderr(text, |s| s.yellow())
    }

    pub fn info_level(text: &str) -> String {
        maybe_color_stderr(text, |s| s.green())
    }

    pub fn debug_level(text: &str) -> String {
        maybe_color_stderr(text, |s| s.blue())
    }

    pub fn trace_level(text: &str) -> String {
        maybe_color_stderr(text, |s| s.magenta())
    }
}

/// Semantic symbols for the per-image narrative on stderr
pub mod symbols {
    use super::colors_enabled;

    /// Model loaded and ready
    pub fn model_loaded() -> &'static str {
        if colors_enabled() {
            "✅"
        } else {
            "[MODEL]"
        }
    }

    /// Start of one image's processing
    pub fn image_start() -> &'static str {
        if colors_enabled() {
            "🌴"
        } else {
            "[IMAGE]"
        }
    }

    pub fn operation_failed() -> &'static str {
        if colors_enabled() {
            "❌"
        } else {
            "[FAILED]"
        }
    }

    /// Device selection and session setup
    pub fn system_setup() -> &'static str {
        if colors_enabled() {
            "⚙️ "
        } else {
            "[SETUP]"
        }
    }

    /// An artifact was written
    pub fn artifact_saved() -> &'static str {
        if colors_enabled() {
            "✓"
        } else {
            "[SAVED]"
        }
    }

    /// An artifact or stage was skipped on purpose
    pub fn skipped() -> &'static str {
        if colors_enabled() {
            "⏭️ "
        } else {
            "[SKIP]"
        }
    }

    pub fn completed_successfully() -> &'static str {
        if colors_enabled() {
            "✅"
        } else {
            "[SUCCESS]"
        }
    }

    /// Some images succeeded, some failed
    pub fn completed_partially_successfully() -> &'static str {
        if colors_enabled() {
            "⚠️ "
        } else {
            "[PARTIAL-SUCCESS]"
        }
    }

    pub fn warning() -> &'static str {
        if colors_enabled() {
            "⚠️ "
        } else {
            "[WARN]"
        }
    }
}

/// Progress bar utilities that respect TTY state
pub mod progress {
    use super::colors_enabled;
    use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
    use std::io::{stderr, IsTerminal};

    /// Create a stderr progress bar for a batch.
    ///
    /// The bar is hidden unless stderr is interactive, so a supervising process
    /// that captures stderr only ever sees plain log lines.
    pub fn create_batch_progress_bar(total: usize) -> ProgressBar {
        if total <= 1 || !stderr().is_terminal() {
            return ProgressBar::hidden();
        }

        let pb = ProgressBar::with_draw_target(Some(total as u64), ProgressDrawTarget::stderr());
        let template = if colors_enabled() {
            "[{elapsed_precise}] [{bar:30.green/black}] {pos}/{len} {msg}"
        } else {
            "[{elapsed_precise}] [{bar:30}] {pos}/{len} {msg}"
        };
        let style = ProgressStyle::default_bar()
            .template(template)
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("#> ");
        pb.set_style(style);
        pb
    }
}
