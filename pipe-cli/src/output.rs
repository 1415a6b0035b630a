// Output formatting helpers for CLI commands

/// Print a success message with a checkmark
pub fn success(message: &str) {
    eprintln!("\x1b[32m\u{2713}\x1b[0m {message}");
}

/// Print a warning message
pub fn warning(message: &str) {
    eprintln!("\x1b[33m!\x1b[0m {message}");
}

/// Print a dim/muted message
pub fn dim(message: &str) {
    eprintln!("\x1b[2m{message}\x1b[0m");
}
