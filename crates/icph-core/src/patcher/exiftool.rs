use std::io::{self, BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command, Stdio};
use std::sync::{Mutex, PoisonError};

use chrono::{DateTime, FixedOffset, Utc};
use tracing::{debug, warn};

use super::{MetadataPatcher, PatchError};
use crate::error::is_transient_io;
use crate::media::MediaKind;
use crate::sidecar::date::{exif_datetime, exif_offset};

/// Printed on stdout by a `-stay_open` process once a command finishes.
const READY: &str = "{ready}";
/// Echoed to stderr after each command so its error text can be collected.
const STDERR_DONE: &str = "{icph-stderr-done}";

/// ExifTool messages that describe a condition likely to clear on retry.
const TRANSIENT_MARKERS: &[&str] = &[
    "temporary file already exists",
    "resource temporarily unavailable",
    "locked",
    "used by another process",
    "error renaming temporary file",
    "timed out",
];

/// Tag assignments for one file.
///
/// Images get the wall-clock time of the record plus its offset. QuickTime
/// dates are UTC by definition, so videos are written in UTC.
pub fn write_args(path: &Path, kind: MediaKind, captured: DateTime<FixedOffset>) -> Vec<String> {
    let mut args = vec!["-overwrite_original".to_string()];
    match kind {
        MediaKind::Video => {
            let utc = exif_datetime(&captured.with_timezone(&Utc).fixed_offset());
            for tag in ["CreateDate", "MediaCreateDate", "TrackCreateDate"] {
                args.push(format!("-{}={}", tag, utc));
            }
        }
        _ => {
            let local = exif_datetime(&captured);
            let offset = exif_offset(&captured);
            args.push(format!("-DateTimeOriginal={}", local));
            args.push(format!("-CreateDate={}", local));
            args.push(format!("-OffsetTimeOriginal={}", offset));
            args.push(format!("-OffsetTime={}", offset));
        }
    }
    args.push(path.to_string_lossy().into_owned());
    args
}

/// Decide success from ExifTool's output. The error text is kept verbatim.
pub fn classify_output(exit_ok: bool, stdout: &str, stderr: &str) -> Result<(), PatchError> {
    let has_error = stderr.lines().any(|l| l.trim_start().starts_with("Error"));
    let not_updated = stdout.contains("weren't updated");
    if exit_ok && !has_error && !not_updated {
        return Ok(());
    }

    let message = [stderr.trim(), stdout.trim()]
        .into_iter()
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("\n");
    let message = if message.is_empty() {
        "exiftool failed without output".to_string()
    } else {
        message
    };
    let lowered = message.to_lowercase();
    if TRANSIENT_MARKERS.iter().any(|m| lowered.contains(m)) {
        Err(PatchError::transient(message))
    } else {
        Err(PatchError::terminal(message))
    }
}

fn spawn_error(program: &Path, err: io::Error) -> PatchError {
    let message = format!("running {}: {}", program.display(), err);
    if is_transient_io(&err) {
        PatchError::transient(message)
    } else {
        PatchError::terminal(message)
    }
}

/// A long-lived `exiftool -stay_open True -@ -` process.
struct StayOpen {
    child: Child,
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,
    stderr: BufReader<ChildStderr>,
}

impl StayOpen {
    fn spawn(program: &Path) -> io::Result<Self> {
        let mut child = Command::new(program)
            .args(["-stay_open", "True", "-@", "-"])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;
        let (Some(stdin), Some(stdout), Some(stderr)) =
            (child.stdin.take(), child.stdout.take(), child.stderr.take())
        else {
            let _ = child.kill();
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "exiftool pipes unavailable"));
        };
        Ok(Self {
            child,
            stdin,
            stdout: BufReader::new(stdout),
            stderr: BufReader::new(stderr),
        })
    }

    fn read_until(reader: &mut impl BufRead, marker: &str) -> io::Result<String> {
        let mut collected = String::new();
        let mut line = String::new();
        loop {
            line.clear();
            if reader.read_line(&mut line)? == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "exiftool exited mid-command",
                ));
            }
            if line.trim_end() == marker {
                return Ok(collected);
            }
            collected.push_str(&line);
        }
    }

    /// Run one command; returns (stdout, stderr).
    fn execute(&mut self, args: &[String]) -> io::Result<(String, String)> {
        for arg in args {
            writeln!(self.stdin, "{}", arg)?;
        }
        writeln!(self.stdin, "-echo4")?;
        writeln!(self.stdin, "{}", STDERR_DONE)?;
        writeln!(self.stdin, "-execute")?;
        self.stdin.flush()?;

        let stdout = Self::read_until(&mut self.stdout, READY)?;
        let stderr = Self::read_until(&mut self.stderr, STDERR_DONE)?;
        Ok((stdout, stderr))
    }

    fn close(mut self) {
        let _ = writeln!(self.stdin, "-stay_open\nFalse");
        let _ = self.stdin.flush();
        drop(self.stdin);
        if self.child.wait().is_err() {
            let _ = self.child.kill();
        }
    }
}

/// ExifTool-backed patcher.
///
/// By default every file gets its own process. With `stay_open` the patcher
/// keeps a pool of persistent processes, one per concurrent caller.
pub struct ExifTool {
    program: PathBuf,
    stay_open: bool,
    idle: Mutex<Vec<StayOpen>>,
}

impl std::fmt::Debug for ExifTool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExifTool")
            .field("program", &self.program)
            .field("stay_open", &self.stay_open)
            .finish()
    }
}

impl ExifTool {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            stay_open: false,
            idle: Mutex::new(Vec::new()),
        }
    }

    pub fn stay_open(mut self, enabled: bool) -> Self {
        self.stay_open = enabled;
        self
    }

    /// Preflight check: `exiftool -ver`.
    pub fn version(&self) -> Result<String, PatchError> {
        let output = Command::new(&self.program)
            .arg("-ver")
            .output()
            .map_err(|e| spawn_error(&self.program, e))?;
        if !output.status.success() {
            return Err(PatchError::terminal(format!(
                "{} -ver exited with {}",
                self.program.display(),
                output.status
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    fn run_once(&self, args: &[String]) -> Result<(), PatchError> {
        let output = Command::new(&self.program)
            .args(args)
            .output()
            .map_err(|e| spawn_error(&self.program, e))?;
        classify_output(
            output.status.success(),
            &String::from_utf8_lossy(&output.stdout),
            &String::from_utf8_lossy(&output.stderr),
        )
    }

    fn run_stay_open(&self, args: &[String]) -> Result<(), PatchError> {
        let pooled = self.idle.lock().unwrap_or_else(PoisonError::into_inner).pop();
        let mut process = match pooled {
            Some(p) => p,
            None => {
                debug!(program = %self.program.display(), "starting exiftool -stay_open");
                StayOpen::spawn(&self.program).map_err(|e| spawn_error(&self.program, e))?
            }
        };

        match process.execute(args) {
            Ok((stdout, stderr)) => {
                self.idle
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .push(process);
                classify_output(true, &stdout, &stderr)
            }
            Err(err) => {
                // The process is in an unknown state; never reuse it.
                warn!(error = %err, "exiftool -stay_open process failed");
                let _ = process.child.kill();
                let _ = process.child.wait();
                Err(PatchError::transient(format!("exiftool process failed: {}", err)))
            }
        }
    }
}

impl MetadataPatcher for ExifTool {
    fn patch(
        &self,
        path: &Path,
        kind: MediaKind,
        captured: DateTime<FixedOffset>,
    ) -> Result<(), PatchError> {
        if kind == MediaKind::Other {
            return Err(PatchError::terminal("unsupported file kind"));
        }
        let args = write_args(path, kind, captured);
        if self.stay_open {
            self.run_stay_open(&args)
        } else {
            self.run_once(&args)
        }
    }
}

impl Drop for ExifTool {
    fn drop(&mut self) {
        let idle = std::mem::take(self.idle.get_mut().unwrap_or_else(PoisonError::into_inner));
        for process in idle {
            process.close();
        }
    }
}
