// Compact status display
// A live-updating block of one row per child process, pinned to the bottom
// of the terminal. Output collected during execution is flushed into
// scrollback once its row finishes, preserving pipeline order.

use std::collections::HashMap;
use std::io::Write;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use pipe_core::{format_duration, RunField, Status, StatusSink, Step};

const RESET: &str = "\x1b[0m";
const GREEN: &str = "\x1b[32m";
const RED: &str = "\x1b[31m";
const YELLOW: &str = "\x1b[33m";
const DIM: &str = "\x1b[2m";

struct Row {
    id: String,
    status: Status,
    started_at: Option<Instant>,
    duration: Duration,
    /// Output collected while running; rendered only after the row
    /// finishes.
    output: Vec<String>,
    /// Set once the row's final line has scrolled into history.
    flushed: bool,
}

struct Ui {
    rows: Vec<Row>,
    index: HashMap<String, usize>,
    /// Lines rendered in the previous frame, for the cursor-up rewind.
    lines: usize,
    max_width: usize,
}

/// Renders the engine's status callbacks as a compact ANSI block on
/// stderr. Used only when stderr is a terminal and verbosity is 0.
pub struct StatusUi {
    inner: Mutex<Ui>,
}

impl StatusUi {
    /// Build rows from the pipeline's steps. Parallel steps expand into
    /// one row per child; the interactive step has no row.
    pub fn new(steps: &[Step]) -> StatusUi {
        let mut ui = Ui {
            rows: Vec::new(),
            index: HashMap::new(),
            lines: 0,
            max_width: 0,
        };

        for step in steps {
            if step.interactive {
                continue;
            }
            match &step.run {
                RunField::Strings(cmds) => {
                    for i in 0..cmds.len() {
                        ui.add_row(format!("{}/run_{i}", step.id));
                    }
                }
                RunField::SubRuns(subs) => {
                    for sub in subs {
                        ui.add_row(format!("{}/{}", step.id, sub.id));
                    }
                }
                _ => ui.add_row(step.id.clone()),
            }
        }

        StatusUi {
            inner: Mutex::new(ui),
        }
    }
}

impl StatusSink for StatusUi {
    fn set_status(&self, id: &str, status: Status) {
        let mut ui = self.inner.lock().expect("status ui poisoned");
        let Some(&idx) = ui.index.get(id) else { return };

        {
            let row = &mut ui.rows[idx];
            row.status = status;
            match status {
                Status::Running => row.started_at = Some(Instant::now()),
                Status::Done | Status::Failed => {
                    if let Some(started) = row.started_at {
                        row.duration = started.elapsed();
                    }
                }
                Status::Waiting => {}
            }
        }

        // Finished rows with collected output scroll it into history.
        if matches!(status, Status::Done | Status::Failed) && !ui.rows[idx].output.is_empty() {
            ui.flush_output(idx);
        }

        ui.render();
    }

    fn add_output(&self, id: &str, line: &str) {
        let mut ui = self.inner.lock().expect("status ui poisoned");
        let Some(&idx) = ui.index.get(id) else { return };
        ui.rows[idx].output.push(line.to_string());
    }

    fn finish(&self) {
        self.inner.lock().expect("status ui poisoned").render();
    }
}

impl Ui {
    fn add_row(&mut self, id: String) {
        self.index.insert(id.clone(), self.rows.len());
        self.max_width = self.max_width.max(id.len());
        self.rows.push(Row {
            id,
            status: Status::Waiting,
            started_at: None,
            duration: Duration::ZERO,
            output: Vec::new(),
            flushed: false,
        });
    }

    /// Scroll the target row (and any finished, unflushed rows before it,
    /// so scrollback keeps pipeline order) into history above the block.
    fn flush_output(&mut self, target: usize) {
        let mut err = std::io::stderr().lock();
        if self.lines > 0 {
            let _ = write!(err, "\x1b[{}A", self.lines);
        }

        for i in 0..=target {
            let finished = matches!(self.rows[i].status, Status::Done | Status::Failed);
            if i == target || (finished && !self.rows[i].flushed) {
                flush_row(&mut err, &mut self.rows[i], self.max_width);
            }
        }

        self.lines = 0;
        drop(err);
        let _ = std::io::stderr().flush();
    }

    /// Redraw every unflushed row, overwriting the previous frame.
    fn render(&mut self) {
        let mut err = std::io::stderr().lock();
        if self.lines > 0 {
            let _ = write!(err, "\x1b[{}A", self.lines);
        }

        let mut n = 0;
        for row in &self.rows {
            if row.flushed {
                continue;
            }
            let _ = writeln!(
                err,
                "\x1b[2K{} {:<width$}  {}",
                icon(row.status),
                row.id,
                suffix(row),
                width = self.max_width
            );
            n += 1;
        }

        self.lines = n;
        drop(err);
        let _ = std::io::stderr().flush();
    }
}

fn flush_row(err: &mut impl Write, row: &mut Row, width: usize) {
    let _ = writeln!(
        err,
        "\x1b[2K{} {:<width$}  {}",
        icon(row.status),
        row.id,
        suffix(row),
    );

    if !row.output.is_empty() {
        let pipe = match row.status {
            Status::Done => format!("{GREEN}\u{2502}{RESET}"),
            Status::Failed => format!("{RED}\u{2502}{RESET}"),
            _ => format!("{DIM}\u{2502}{RESET}"),
        };
        for line in &row.output {
            let _ = writeln!(err, "\x1b[2K{pipe} {line}");
        }
    }

    row.output.clear();
    row.flushed = true;
}

fn icon(status: Status) -> String {
    match status {
        Status::Waiting => format!("{DIM}\u{25cb}{RESET}"),
        Status::Running => format!("{YELLOW}\u{25cf}{RESET}"),
        Status::Done => format!("{GREEN}\u{2713}{RESET}"),
        Status::Failed => format!("{RED}\u{2717}{RESET}"),
    }
}

fn suffix(row: &Row) -> String {
    match row.status {
        Status::Waiting => format!("{DIM}waiting{RESET}"),
        Status::Running => format!("{YELLOW}running...{RESET}"),
        Status::Done => format!("{DIM}{}{RESET}", format_duration(row.duration)),
        Status::Failed => format!("{RED}{}{RESET}", format_duration(row.duration)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn step(id: &str) -> Step {
        Step {
            id: id.to_string(),
            run: RunField::Single("true".into()),
            ..Default::default()
        }
    }

    #[test]
    fn rows_expand_parallel_steps_and_skip_interactive() {
        let mut fan = step("fan");
        fan.run = RunField::Strings(vec!["a".into(), "b".into()]);
        let mut shell = step("shell");
        shell.interactive = true;

        let ui = StatusUi::new(&[step("one"), fan, shell]);
        let inner = ui.inner.lock().unwrap();
        let ids: Vec<&str> = inner.rows.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["one", "fan/run_0", "fan/run_1"]);
    }

    #[test]
    fn unknown_row_ids_are_ignored() {
        let ui = StatusUi::new(&[step("only")]);
        // must not panic
        ui.set_status("ghost", Status::Running);
        ui.add_output("ghost", "line");
    }

    #[test]
    fn column_width_tracks_longest_id() {
        let ui = StatusUi::new(&[step("a"), step("much-longer-id")]);
        assert_eq!(ui.inner.lock().unwrap().max_width, "much-longer-id".len());
    }
}
