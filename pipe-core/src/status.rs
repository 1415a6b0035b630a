// Status reporting seam between the engine and a terminal display

/// Row state as shown by a status display.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Waiting,
    Running,
    Done,
    Failed,
}

/// Callbacks a terminal status display receives from the engine.
///
/// Row ids are `step-id` for single steps, `step-id/run_<i>` for plain
/// parallel commands, and `step-id/sub-run-id` for named sub-runs. Output
/// lines sent through `add_output` are expected to be rendered near the
/// owning row once it finishes.
pub trait StatusSink: Send + Sync {
    fn set_status(&self, id: &str, status: Status);
    fn add_output(&self, id: &str, line: &str);
    /// Final render; no further callbacks arrive after this.
    fn finish(&self);
}

/// Human-friendly duration suffix for status rows, e.g. `(1.3s)` or
/// `(2m 5s)`.
pub fn format_duration(d: std::time::Duration) -> String {
    let secs = d.as_secs_f64();
    if secs < 60.0 {
        format!("({secs:.1}s)")
    } else {
        let m = d.as_secs() / 60;
        let s = d.as_secs() % 60;
        format!("({m}m {s}s)")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn duration_formatting() {
        assert_eq!(format_duration(Duration::from_millis(1340)), "(1.3s)");
        assert_eq!(format_duration(Duration::from_secs(59)), "(59.0s)");
        assert_eq!(format_duration(Duration::from_secs(125)), "(2m 5s)");
    }
}
