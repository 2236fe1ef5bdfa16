use std::io::Write;
use std::sync::{Arc, Mutex, PoisonError};

const FRAMES: [&str; 10] = ["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"];

enum Sink {
    Stdout,
    Buffer(Arc<Mutex<Vec<String>>>),
}

/// Where the master writes forwarded worker lines and its progress spinner.
pub struct Console {
    sink: Sink,
    spinner: bool,
    frame: usize,
    spinning: bool,
}

impl Console {
    /// Stdout console; the spinner only renders on a decorated, non-CI terminal.
    pub fn stdout(decorated: bool, ci: bool) -> Self {
        Self {
            sink: Sink::Stdout,
            spinner: decorated && !ci,
            frame: 0,
            spinning: false,
        }
    }

    /// Console collecting lines in memory.
    pub fn buffer() -> (Self, Arc<Mutex<Vec<String>>>) {
        let lines = Arc::new(Mutex::new(Vec::new()));
        let console = Self {
            sink: Sink::Buffer(Arc::clone(&lines)),
            spinner: false,
            frame: 0,
            spinning: false,
        };
        (console, lines)
    }

    pub fn writeln(&mut self, line: &str) {
        match &self.sink {
            Sink::Stdout => {
                let mut out = std::io::stdout().lock();
                if self.spinning {
                    let _ = write!(out, "    \r");
                    self.spinning = false;
                }
                let _ = writeln!(out, "{line}");
            }
            Sink::Buffer(lines) => lines
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(line.to_string()),
        }
    }

    /// Render the next indeterminate-progress frame.
    pub fn spin(&mut self) {
        if !self.spinner {
            return;
        }
        if let Sink::Stdout = self.sink {
            let frame = FRAMES[self.frame % FRAMES.len()];
            self.frame = self.frame.wrapping_add(1);
            let mut out = std::io::stdout().lock();
            let _ = write!(out, "  {frame} \r");
            let _ = out.flush();
            self.spinning = true;
        }
    }

    pub fn clear_spinner(&mut self) {
        if !self.spinning {
            return;
        }
        let mut out = std::io::stdout().lock();
        let _ = write!(out, "    \r");
        let _ = out.flush();
        self.spinning = false;
    }
}
