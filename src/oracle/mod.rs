//! External toolchain integration.
//!
//! The extraction, injection and resigning tools are black boxes invoked with
//! file paths that answer with a text report. The engine only sees them
//! through the [`Oracle`] trait:
//! - `CommandOracle`: runs a native process (e.g. `java -jar injector.jar`)
//!   with a caller-enforced timeout
//! - `FnOracle`: closure-backed oracle for dry runs and tests
//!
//! # Architecture
//! - `parsing`: fixed line-offset parsing of the tools' report trailers
//! - `toolchain`: typed operations (extract, inject, resign, ...) on top of
//!   the raw oracles

mod parsing;
mod toolchain;

pub use parsing::{InjectionTrailer, SliceStatus};
pub use toolchain::{SliceExtraction, ToolOracles, Toolchain};
pub(crate) use toolchain::read_class_list;

use crate::error::OracleError;
use std::io::Read;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

/// Captured output of a successful tool run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OracleReport {
    pub stdout: String,
    pub stderr: String,
}

impl OracleReport {
    pub fn from_stdout<S: Into<String>>(stdout: S) -> Self {
        Self {
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    /// Report lines split on `\n`, keeping the trailing empty line the tools'
    /// fixed offsets are counted against.
    pub fn lines(&self) -> Vec<&str> {
        self.stdout.split('\n').collect()
    }
}

/// A black-box tool: arguments in, text report out.
pub trait Oracle: Send + Sync {
    /// Short name used in logs and errors.
    fn name(&self) -> &str;

    /// Run the tool. `timeout` of `None` waits indefinitely.
    fn run(&self, args: &[String], timeout: Option<Duration>) -> Result<OracleReport, OracleError>;
}

/// Poll interval while waiting on a child process.
const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Oracle backed by a native process.
#[derive(Debug, Clone)]
pub struct CommandOracle {
    name: String,
    program: String,
    base_args: Vec<String>,
    current_dir: Option<PathBuf>,
}

impl CommandOracle {
    pub fn new<N: Into<String>, P: Into<String>>(name: N, program: P) -> Self {
        Self {
            name: name.into(),
            program: program.into(),
            base_args: Vec::new(),
            current_dir: None,
        }
    }

    /// `java -jar <jar>` component.
    pub fn java_component(java: &str, jar: &std::path::Path) -> Self {
        let name = jar
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "java-component".to_string());
        Self::new(name, java)
            .arg("-jar")
            .arg(jar.to_string_lossy())
    }

    pub fn arg<S: Into<String>>(mut self, arg: S) -> Self {
        self.base_args.push(arg.into());
        self
    }

    pub fn current_dir<P: Into<PathBuf>>(mut self, dir: P) -> Self {
        self.current_dir = Some(dir.into());
        self
    }

    fn command_line(&self, args: &[String]) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.base_args.iter().map(String::as_str))
            .chain(args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

fn drain<R: Read + Send + 'static>(pipe: Option<R>) -> std::thread::JoinHandle<String> {
    std::thread::spawn(move || {
        let mut buf = Vec::new();
        if let Some(mut pipe) = pipe {
            let _ = pipe.read_to_end(&mut buf);
        }
        String::from_utf8_lossy(&buf).into_owned()
    })
}

impl Oracle for CommandOracle {
    fn name(&self) -> &str {
        &self.name
    }

    fn run(&self, args: &[String], timeout: Option<Duration>) -> Result<OracleReport, OracleError> {
        tracing::info!("Running command: {}", self.command_line(args));

        let mut command = Command::new(&self.program);
        command
            .args(&self.base_args)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(dir) = &self.current_dir {
            command.current_dir(dir);
        }

        let mut child = command.spawn().map_err(|source| OracleError::Spawn {
            tool: self.name.clone(),
            source,
        })?;

        // Drain both pipes concurrently so a chatty tool cannot block on a full pipe
        let stdout = drain(child.stdout.take());
        let stderr = drain(child.stderr.take());

        let started = Instant::now();
        let status = loop {
            match child.try_wait() {
                Ok(Some(status)) => break status,
                Ok(None) => {
                    if let Some(limit) = timeout {
                        if started.elapsed() >= limit {
                            let _ = child.kill();
                            let _ = child.wait();
                            tracing::warn!("{} timed out after {:?}", self.name, limit);
                            return Err(OracleError::Timeout {
                                tool: self.name.clone(),
                                after: limit,
                            });
                        }
                    }
                    std::thread::sleep(POLL_INTERVAL);
                }
                Err(source) => {
                    let _ = child.kill();
                    return Err(OracleError::Spawn {
                        tool: self.name.clone(),
                        source,
                    });
                }
            }
        };

        let stdout = stdout.join().unwrap_or_default();
        let stderr = stderr.join().unwrap_or_default();

        if !status.success() {
            tracing::warn!(
                "{} exited with {:?}\nSTDOUT: {}\nSTDERR: {}",
                self.name,
                status.code(),
                stdout,
                stderr
            );
            return Err(OracleError::NonZeroExit {
                tool: self.name.clone(),
                code: status.code(),
                stderr,
            });
        }

        Ok(OracleReport { stdout, stderr })
    }
}

type OracleFn = dyn Fn(&[String]) -> Result<OracleReport, OracleError> + Send + Sync;

/// Oracle implemented by a closure. Counts its invocations.
pub struct FnOracle {
    name: String,
    func: Box<OracleFn>,
    calls: AtomicUsize,
}

impl FnOracle {
    pub fn new<N, F>(name: N, func: F) -> Self
    where
        N: Into<String>,
        F: Fn(&[String]) -> Result<OracleReport, OracleError> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            func: Box::new(func),
            calls: AtomicUsize::new(0),
        }
    }

    /// Number of times the oracle has been run.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl std::fmt::Debug for FnOracle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FnOracle")
            .field("name", &self.name)
            .field("calls", &self.calls())
            .finish()
    }
}

impl Oracle for FnOracle {
    fn name(&self) -> &str {
        &self.name
    }

    fn run(&self, args: &[String], _timeout: Option<Duration>) -> Result<OracleReport, OracleError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        (self.func)(args)
    }
}
