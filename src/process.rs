use std::ffi::OsString;
use std::io::{BufRead, BufReader, Read};
use std::path::PathBuf;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::mpsc::{self, Receiver, Sender};
use std::thread::{self, JoinHandle};

use anyhow::{anyhow, Context, Result};
use tracing::debug;

/// Arguments for spawning one worker process.
#[derive(Debug, Clone)]
pub struct WorkerCommand {
    pub program: PathBuf,
    pub port: u16,
    pub task: String,
    pub host: String,
    pub verbosity: u8,
    pub decorated: bool,
    /// Appended verbatim, e.g. the inventory location.
    pub extra_args: Vec<OsString>,
}

impl WorkerCommand {
    pub fn args(&self) -> Vec<OsString> {
        let mut args: Vec<OsString> = vec![
            "worker".into(),
            "--port".into(),
            self.port.to_string().into(),
            "--task".into(),
            self.task.clone().into(),
            "--host".into(),
            self.host.clone().into(),
        ];
        args.push(OsString::from(if self.decorated {
            "--ansi"
        } else {
            "--no-ansi"
        }));
        if self.verbosity > 0 {
            args.push(format!("-{}", "v".repeat(self.verbosity.into())).into());
        }
        args.extend(self.extra_args.iter().cloned());
        args
    }

    pub fn command(&self) -> Command {
        let mut command = Command::new(&self.program);
        command.args(self.args());
        command
    }
}

/// A running worker whose output is drained without blocking.
///
/// Reader threads push complete lines from stdout and stderr into a channel;
/// the master polls it every tick.
pub struct WorkerProcess {
    host: String,
    child: Child,
    lines: Receiver<String>,
    readers: Vec<JoinHandle<()>>,
    status: Option<ExitStatus>,
    terminated: bool,
}

impl WorkerProcess {
    pub fn spawn(host: impl Into<String>, mut command: Command) -> Result<Self> {
        let host = host.into();
        let mut child = command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .with_context(|| format!("failed to spawn worker for host '{host}'"))?;

        let stdout = child
            .stdout
            .take()
            .context("failed to open worker stdout")?;
        let stderr = child
            .stderr
            .take()
            .context("failed to open worker stderr")?;

        let (tx, rx) = mpsc::channel();
        let readers = vec![pump(stdout, tx.clone()), pump(stderr, tx)];
        debug!(host = %host, pid = child.id(), "worker started");

        Ok(Self {
            host,
            child,
            lines: rx,
            readers,
            status: None,
            terminated: false,
        })
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    /// Lines that arrived since the last call.
    pub fn drain(&mut self) -> Vec<String> {
        self.lines.try_iter().collect()
    }

    /// Non-blocking check; true once the process has exited.
    pub fn poll(&mut self) -> Result<bool> {
        if self.status.is_some() {
            return Ok(true);
        }
        let status = self
            .child
            .try_wait()
            .with_context(|| format!("failed waiting for worker '{}'", self.host))?;
        if let Some(status) = status {
            debug!(host = %self.host, ?status, "worker exited");
            self.status = Some(status);
        }
        Ok(self.status.is_some())
    }

    /// Kill a still-running worker and reap it. Such a worker is not reported as failed.
    pub fn terminate(&mut self) -> Result<()> {
        if self.poll()? {
            return Ok(());
        }
        self.terminated = true;
        self.child
            .kill()
            .with_context(|| format!("failed to terminate worker '{}'", self.host))?;
        let status = self
            .child
            .wait()
            .with_context(|| format!("failed to reap worker '{}'", self.host))?;
        self.status = Some(status);
        Ok(())
    }

    /// Wait for the output readers and return whatever they still hold.
    ///
    /// Readers of a terminated worker are detached instead: grandchildren may
    /// keep its pipes open.
    pub fn finish(&mut self) -> Result<Vec<String>> {
        if self.terminated {
            self.readers.clear();
            return Ok(self.drain());
        }
        for reader in self.readers.drain(..) {
            reader
                .join()
                .map_err(|_| anyhow!("output reader for '{}' panicked", self.host))?;
        }
        Ok(self.drain())
    }

    /// Exit code of a finished worker; `None` while running or when terminated by us.
    pub fn exit_code(&self) -> Option<i32> {
        if self.terminated {
            return None;
        }
        self.status.map(status_code)
    }
}

impl Drop for WorkerProcess {
    /// A worker must never outlive its handle, whatever path dropped it.
    fn drop(&mut self) {
        if self.status.is_some() {
            return;
        }
        if let Ok(None) = self.child.try_wait() {
            debug!(host = %self.host, "killing orphaned worker");
            let _ = self.child.kill();
            let _ = self.child.wait();
        }
    }
}

fn pump<R: Read + Send + 'static>(stream: R, tx: Sender<String>) -> JoinHandle<()> {
    thread::spawn(move || {
        let mut reader = BufReader::new(stream);
        let mut buf = Vec::new();
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf) {
                Ok(0) | Err(_) => break,
                Ok(_) => {
                    let line = String::from_utf8_lossy(&buf);
                    let line = line.trim_end_matches(['\n', '\r']);
                    if tx.send(line.to_string()).is_err() {
                        break;
                    }
                }
            }
        }
    })
}

#[cfg(unix)]
fn status_code(status: ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;
    status
        .code()
        .or_else(|| status.signal().map(|sig| 128 + sig))
        .unwrap_or(1)
}

#[cfg(not(unix))]
fn status_code(status: ExitStatus) -> i32 {
    status.code().unwrap_or(1)
}
