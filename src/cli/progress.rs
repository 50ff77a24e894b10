//! Progress display utilities for CLI output
//!
//! Enumeration is lazy, so the number of files in a cycle is not known up
//! front. The export display is a spinner with running counters rather than
//! a bar with a length.
//!
//! Key features:
//! - Spinner that suspends cleanly when printing per-file lines
//! - Consistent visual styling across commands
//! - A tee writer so log output can go to the console and a file

use crate::core::exporter::ExportEvent;
use indicatif::{ProgressBar, ProgressStyle};
use std::io::Write;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

// ============================================================================
// Styles - Consistent visual appearance
// ============================================================================

/// Spinner style for export cycles
fn spinner_style() -> ProgressStyle {
    ProgressStyle::default_spinner()
        .template("{spinner:.cyan} {msg}")
        .unwrap_or_else(|_| ProgressStyle::default_spinner())
        .tick_chars("⣾⣽⣻⢿⡿⣟⣯⣷")
}

// ============================================================================
// Console output helpers
// ============================================================================

/// Print a header section with a box
pub fn print_header(title: &str) {
    let width = 68;
    let title_padded = format!("{:^width$}", title, width = width - 4);
    println!();
    println!("╔{}╗", "═".repeat(width - 2));
    println!("║{}║", title_padded);
    println!("╚{}╝", "═".repeat(width - 2));
    println!();
}

/// Print a success message with checkmark
pub fn print_success(msg: &str) {
    println!("  ✓ {}", msg);
}

/// Print an info message with bullet
pub fn print_info(msg: &str) {
    println!("  • {}", msg);
}

/// Print a warning message
pub fn print_warning(msg: &str) {
    println!("  ⚠ {}", msg);
}

/// Print an error message
pub fn print_error(msg: &str) {
    println!("  ✗ {}", msg);
}

// ============================================================================
// Export progress
// ============================================================================

/// Renders [`ExportEvent`]s from the poll loop
pub struct ExportProgress {
    spinner: ProgressBar,
    verbose: bool,
    committed: AtomicUsize,
    rolled_back: AtomicUsize,
    bytes: AtomicU64,
}

impl ExportProgress {
    pub fn new(verbose: bool) -> Self {
        let spinner = ProgressBar::new_spinner();
        spinner.set_style(spinner_style());
        spinner.enable_steady_tick(Duration::from_millis(100));
        spinner.set_message("Connecting to camera...");

        Self {
            spinner,
            verbose,
            committed: AtomicUsize::new(0),
            rolled_back: AtomicUsize::new(0),
            bytes: AtomicU64::new(0),
        }
    }

    fn log(&self, msg: &str) {
        self.spinner.suspend(|| {
            println!("  {}", msg);
        });
    }

    fn totals(&self) -> String {
        format!(
            "{} exported ({}), {} rolled back",
            self.committed.load(Ordering::Relaxed),
            format_bytes(self.bytes.load(Ordering::Relaxed)),
            self.rolled_back.load(Ordering::Relaxed)
        )
    }

    pub fn handle(&self, event: ExportEvent) {
        match event {
            ExportEvent::CycleStarted { cycle } => {
                self.spinner
                    .set_message(format!("Cycle {}: connecting... [{}]", cycle, self.totals()));
            }
            ExportEvent::FileStarted { file, index } => {
                self.spinner.set_message(format!(
                    "#{} {} ({}) [{}]",
                    index + 1,
                    file.remote_path(),
                    format_bytes(file.declared_size),
                    self.totals()
                ));
            }
            ExportEvent::FileCommitted { file, local_path } => {
                self.committed.fetch_add(1, Ordering::Relaxed);
                self.bytes.fetch_add(file.declared_size, Ordering::Relaxed);
                if self.verbose {
                    self.log(&format!("✓ {} -> {}", file.remote_path(), local_path.display()));
                }
            }
            ExportEvent::FileRolledBack { file, transferred } => {
                self.rolled_back.fetch_add(1, Ordering::Relaxed);
                self.log(&format!(
                    "⚠ {} size mismatch: listed {}, copied {}; kept on camera",
                    file.remote_path(),
                    file.declared_size,
                    transferred
                ));
            }
            ExportEvent::CycleFinished { cycle, report } => {
                if self.verbose || report.files_found > 0 {
                    self.log(&format!("Cycle {}: {}", cycle, report));
                }
            }
            ExportEvent::CycleFailed { cycle, error } => {
                self.log(&format!("✗ Cycle {} failed: {}", cycle, error));
            }
            ExportEvent::Waiting { delay } => {
                self.spinner.set_message(format!(
                    "Next poll in {} [{}]",
                    format_duration(delay),
                    self.totals()
                ));
            }
        }
    }

    pub fn finish(&self) {
        self.spinner.finish_with_message(format!("✓ {}", self.totals()));
    }
}

// ============================================================================
// Formatting
// ============================================================================

/// Format bytes into human-readable format
pub fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes >= GB {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.1} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} bytes", bytes)
    }
}

/// Format a duration as `1h 02m`, `3m 05s` or `12s`
pub fn format_duration(duration: Duration) -> String {
    let secs = duration.as_secs();
    if secs >= 3600 {
        format!("{}h {:02}m", secs / 3600, (secs % 3600) / 60)
    } else if secs >= 60 {
        format!("{}m {:02}s", secs / 60, secs % 60)
    } else {
        format!("{}s", secs)
    }
}

// ============================================================================
// Log tee
// ============================================================================

/// Writer that duplicates log output to stderr and a file
pub struct DualWriter {
    pub console: std::io::Stderr,
    pub file: std::fs::File,
}

impl Write for DualWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let _ = self.console.write(buf);
        self.file.write(buf)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        let _ = self.console.flush();
        self.file.flush()
    }
}

// ============================================================================
// Tests
// ============================================================================
