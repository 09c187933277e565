//! Output rewriting: per-pid line prefixes over captured stdout/stderr.
//!
//! All user-visible output funnels through one [`LinePrefixer`]: a
//! line-buffered rewriter that prepends `[pid=<pid>] ` to every complete
//! line, keyed by the task-local pid. Writes outside any prediction use the
//! `logger` pid. Carriage returns fold to newlines so progress bars come
//! out as discrete lines.
//!
//! The rewriter is installed once at bootstrap; tracing output reaches it
//! through [`ScopedWriter`], raw fd output (user spawned subprocesses)
//! through the capture pipes.

use std::collections::HashMap;
use std::io::{self, Write};
use std::sync::{Mutex, OnceLock};

use crate::scope;

/// Pid used for writes outside any prediction.
pub const LOGGER_PID: &str = "logger";

/// Line-buffered rewriter. One buffer per pid so concurrent predictions
/// interleave on line boundaries only.
pub struct LinePrefixer<W: Write> {
    out: W,
    bufs: HashMap<String, String>,
}

impl<W: Write> LinePrefixer<W> {
    pub fn new(out: W) -> Self {
        Self { out, bufs: HashMap::new() }
    }

    /// Buffer `data` for `pid` and emit every complete line with its
    /// prefix. Carriage returns are folded to newlines first.
    pub fn write(&mut self, pid: Option<&str>, data: &str) -> io::Result<()> {
        if data.is_empty() {
            return Ok(());
        }
        let key = pid.unwrap_or(LOGGER_PID);
        let folded = data.replace('\r', "\n");

        let buf = self.bufs.entry(key.to_string()).or_default();
        buf.push_str(&folded);

        let complete = match buf.rfind('\n') {
            Some(last) => {
                let complete: String = buf.drain(..=last).collect();
                complete
            }
            None => return Ok(()),
        };

        let prefix = format!("[pid={key}] ");
        for line in complete.lines() {
            self.out.write_all(prefix.as_bytes())?;
            self.out.write_all(line.as_bytes())?;
            self.out.write_all(b"\n")?;
        }
        self.out.flush()
    }

    /// Emit any unterminated remainder for `pid` and drop its buffer.
    pub fn drop_pid(&mut self, pid: &str) -> io::Result<()> {
        if let Some(rest) = self.bufs.remove(pid)
            && !rest.is_empty()
        {
            let prefix = format!("[pid={pid}] ");
            self.out.write_all(prefix.as_bytes())?;
            self.out.write_all(rest.as_bytes())?;
            self.out.write_all(b"\n")?;
            self.out.flush()?;
        }
        Ok(())
    }
}

// ============================================================================
// Process-wide sink
// ============================================================================

static OUTPUT: OnceLock<Mutex<LinePrefixer<Box<dyn Write + Send>>>> = OnceLock::new();

/// Install the process-wide output sink. Returns false if one is already
/// installed.
pub fn install_output(out: Box<dyn Write + Send>) -> bool {
    OUTPUT.set(Mutex::new(LinePrefixer::new(out))).is_ok()
}

/// Route data through the installed rewriter, or straight to stderr when
/// none is installed (tests, library embedding without capture).
pub fn write_output(pid: Option<&str>, data: &str) {
    match OUTPUT.get() {
        Some(prefixer) => {
            let mut guard = prefixer.lock().expect("output prefixer mutex poisoned");
            let _ = guard.write(pid, data);
        }
        None => {
            let _ = io::stderr().write_all(data.as_bytes());
        }
    }
}

/// Drop the line buffer for a finished prediction.
pub fn drop_buffer(pid: &str) {
    if let Some(prefixer) = OUTPUT.get() {
        let mut guard = prefixer.lock().expect("output prefixer mutex poisoned");
        let _ = guard.drop_pid(pid);
    }
}

// ============================================================================
// tracing writer
// ============================================================================

/// `MakeWriter` that stamps every tracing event with the emitting task's
/// pid. Events fired outside a prediction come out as `[pid=logger]`.
#[derive(Debug, Clone, Default)]
pub struct ScopedWriter;

impl ScopedWriter {
    pub fn new() -> Self {
        Self
    }
}

pub struct ScopedHandle {
    pid: Option<String>,
}

impl Write for ScopedHandle {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let data = String::from_utf8_lossy(buf);
        write_output(self.pid.as_deref(), &data);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for ScopedWriter {
    type Writer = ScopedHandle;

    fn make_writer(&'a self) -> Self::Writer {
        ScopedHandle { pid: scope::current_pid() }
    }
}

// ============================================================================
// fd capture (subprocess output)
// ============================================================================

/// Replace fd 1/2 with capture pipes and pump everything written to them
/// through the rewriter under the logger pid. The original stdout is
/// preserved as the rewriter's sink.
///
/// Called once at bootstrap, before any predictor code runs.
#[cfg(unix)]
pub fn capture_process_output() -> io::Result<()> {
    use std::os::fd::{AsRawFd, BorrowedFd, FromRawFd, OwnedFd};

    use nix::unistd::{dup, dup2, pipe};

    // Safety: fds 0-2 are open at process startup; called before predictor
    // or subprocess code can race on them.
    let preserved = unsafe {
        let fd = BorrowedFd::borrow_raw(1);
        dup(fd)
    }
    .map_err(|e| io::Error::other(format!("dup(1) failed: {e}")))?;

    if !install_output(Box::new(std::fs::File::from(preserved))) {
        return Ok(());
    }

    let (stdout_read, stdout_write) =
        pipe().map_err(|e| io::Error::other(format!("pipe failed: {e}")))?;
    let (stderr_read, stderr_write) =
        pipe().map_err(|e| io::Error::other(format!("pipe failed: {e}")))?;

    let mut target_fd1 = unsafe { OwnedFd::from_raw_fd(1) };
    dup2(&stdout_write, &mut target_fd1)
        .map_err(|e| io::Error::other(format!("dup2(stdout) failed: {e}")))?;
    std::mem::forget(target_fd1); // Don't close fd 1

    let mut target_fd2 = unsafe { OwnedFd::from_raw_fd(2) };
    dup2(&stderr_write, &mut target_fd2)
        .map_err(|e| io::Error::other(format!("dup2(stderr) failed: {e}")))?;
    std::mem::forget(target_fd2); // Don't close fd 2

    drop(stdout_write);
    drop(stderr_write);

    for read_fd in [stdout_read, stderr_read] {
        let raw = read_fd.as_raw_fd();
        std::thread::spawn(move || {
            // NOTE: no tracing in capture threads - stderr is captured and
            // would feed back into this pipe.
            // Safety: ownership of read_fd is transferred to this thread.
            let mut file = unsafe { std::fs::File::from_raw_fd(raw) };
            let mut buf = [0u8; 4096];
            loop {
                match io::Read::read(&mut file, &mut buf) {
                    Ok(0) => break,
                    Ok(n) => {
                        let data = String::from_utf8_lossy(&buf[..n]).to_string();
                        write_output(None, &data);
                    }
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(_) => break,
                }
            }
        });
        std::mem::forget(read_fd); // Ownership transferred to thread
    }

    Ok(())
}

#[cfg(not(unix))]
pub fn capture_process_output() -> io::Result<()> {
    // No fd capture off Unix; tracing output still flows through the
    // rewriter once installed.
    Ok(())
}
