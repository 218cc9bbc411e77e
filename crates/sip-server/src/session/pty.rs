//! PTY wrapper using portable-pty.
//!
//! Opens a pseudo-terminal with a given command and size and exposes the
//! blocking read/write/resize/wait/kill operations behind [`PtyProcess`], so
//! the broadcaster never touches descriptors or ioctls directly.

use portable_pty::{native_pty_system, Child, ChildKiller, CommandBuilder, MasterPty, PtySize};
use sip_core::{SipError, SipResult, WindowSize};
use std::io::{Read, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{debug, info};

/// Everything needed to start the wrapped command.
#[derive(Debug, Clone)]
pub struct SpawnSpec {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: PathBuf,
    pub size: WindowSize,
    /// Value for `TERM`; the rest of the environment is inherited.
    pub term: String,
}

impl SpawnSpec {
    pub fn new(program: impl Into<String>, args: Vec<String>, cwd: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args,
            cwd: cwd.into(),
            size: WindowSize::default(),
            term: "xterm-256color".to_string(),
        }
    }

    /// Human-readable command line for logs.
    pub fn display(&self) -> String {
        let mut line = self.program.clone();
        for arg in &self.args {
            line.push(' ');
            line.push_str(arg);
        }
        line
    }
}

/// How the child terminated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitStatus {
    pub code: i32,
}

impl ExitStatus {
    pub fn success(&self) -> bool {
        self.code == 0
    }
}

/// A child process attached to a pseudo-terminal.
///
/// All methods may block; callers run them on dedicated threads.
pub trait PtyProcess: Send + Sync + 'static {
    /// Read whatever the child has written. `Ok(0)` means the PTY is closed.
    fn read(&self, buf: &mut [u8]) -> std::io::Result<usize>;

    /// Deliver input verbatim, retrying partial writes.
    fn write_all(&self, data: &[u8]) -> std::io::Result<()>;

    /// Update the window size; the child gets the OS resize notification.
    fn resize(&self, size: WindowSize) -> SipResult<()>;

    /// Window size as currently reported by the PTY.
    fn window_size(&self) -> SipResult<WindowSize>;

    /// Block until the child exits.
    fn wait(&self) -> SipResult<ExitStatus>;

    /// Ask the child to exit.
    fn terminate(&self) -> SipResult<()>;

    /// Force the child to exit.
    fn kill(&self) -> SipResult<()>;

    fn pid(&self) -> Option<u32>;
}

/// Creates PTY-backed processes.
pub trait PtySpawner: Send + Sync + 'static {
    fn spawn(&self, spec: &SpawnSpec) -> SipResult<Arc<dyn PtyProcess>>;
}

/// Resolve the executable and check the working directory before anything
/// is served, so a bad command line fails fast.
pub fn preflight(spec: &SpawnSpec) -> SipResult<PathBuf> {
    if !spec.cwd.is_dir() {
        return Err(SipError::spawn(
            &spec.program,
            format!("working directory {} is not a directory", spec.cwd.display()),
        ));
    }
    which::which_in(&spec.program, std::env::var_os("PATH"), &spec.cwd)
        .map_err(|e| SipError::spawn(&spec.program, e))
}

/// Spawns commands on the platform's native PTY implementation.
#[derive(Debug, Default, Clone, Copy)]
pub struct NativePtySpawner;

impl PtySpawner for NativePtySpawner {
    fn spawn(&self, spec: &SpawnSpec) -> SipResult<Arc<dyn PtyProcess>> {
        Ok(Arc::new(NativePty::spawn(spec)?))
    }
}

/// A managed PTY instance.
pub struct NativePty {
    reader: Mutex<Box<dyn Read + Send>>,
    writer: Mutex<Box<dyn Write + Send>>,
    /// Mutex because MasterPty is not Sync.
    master: Mutex<Box<dyn MasterPty + Send>>,
    child: Mutex<Box<dyn Child + Send + Sync>>,
    /// Separate from `child` so kill works while `wait` holds the child.
    killer: Mutex<Box<dyn ChildKiller + Send + Sync>>,
    pid: Option<u32>,
    exited: AtomicBool,
}

impl NativePty {
    /// Spawn the command on a new PTY whose size is set before the child runs.
    pub fn spawn(spec: &SpawnSpec) -> SipResult<Self> {
        spec.size.validate()?;
        let program = preflight(spec)?;

        let pty_system = native_pty_system();
        let pair = pty_system
            .openpty(to_pty_size(spec.size))
            .map_err(|e| SipError::spawn(&spec.program, format!("failed to open PTY: {e}")))?;

        let mut cmd = CommandBuilder::new(&program);
        cmd.args(&spec.args);
        cmd.cwd(&spec.cwd);
        cmd.env("TERM", &spec.term);

        let child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| SipError::spawn(&spec.program, e))?;
        // Only the child may hold the subordinate side, otherwise reads never see EOF.
        drop(pair.slave);

        let pid = child.process_id();
        info!(program = %program.display(), pid, size = %spec.size, "PTY spawned");

        let reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| SipError::Pty(format!("failed to clone PTY reader: {e}")))?;
        let writer = pair
            .master
            .take_writer()
            .map_err(|e| SipError::Pty(format!("failed to take PTY writer: {e}")))?;
        let killer = child.clone_killer();

        Ok(Self {
            reader: Mutex::new(reader),
            writer: Mutex::new(writer),
            master: Mutex::new(pair.master),
            child: Mutex::new(child),
            killer: Mutex::new(killer),
            pid,
            exited: AtomicBool::new(false),
        })
    }

    #[cfg(unix)]
    fn signal_group(&self, signal: libc::c_int) -> SipResult<()> {
        if self.exited.load(Ordering::Acquire) {
            debug!(pid = self.pid, "child already exited, not signalling");
            return Ok(());
        }
        let Some(pid) = self.pid.and_then(|p| i32::try_from(p).ok()).filter(|p| *p > 0) else {
            return Err(SipError::Pty("child has no usable pid".into()));
        };
        // portable-pty runs the child in its own session, so its pid is the group id.
        let rc = unsafe { libc::kill(-pid, signal) };
        if rc == 0 {
            return Ok(());
        }
        let err = std::io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::ESRCH) {
            return Ok(());
        }
        Err(SipError::Pty(format!("signal {signal} to {pid} failed: {err}")))
    }
}

impl PtyProcess for NativePty {
    fn read(&self, buf: &mut [u8]) -> std::io::Result<usize> {
        let mut reader = self
            .reader
            .lock()
            .map_err(|_| std::io::Error::other("PTY reader lock poisoned"))?;
        match reader.read(buf) {
            // Linux reports a hung-up PTY as EIO rather than EOF.
            #[cfg(unix)]
            Err(e) if e.raw_os_error() == Some(libc::EIO) => Ok(0),
            other => other,
        }
    }

    fn write_all(&self, data: &[u8]) -> std::io::Result<()> {
        let mut writer = self
            .writer
            .lock()
            .map_err(|_| std::io::Error::other("PTY writer lock poisoned"))?;
        writer.write_all(data)?;
        writer.flush()
    }

    fn resize(&self, size: WindowSize) -> SipResult<()> {
        size.validate()?;
        let master = self
            .master
            .lock()
            .map_err(|_| SipError::Pty("PTY master lock poisoned".into()))?;
        master
            .resize(to_pty_size(size))
            .map_err(|e| SipError::Pty(format!("PTY resize failed: {e}")))?;
        debug!(rows = size.rows, cols = size.cols, "PTY resized");
        Ok(())
    }

    fn window_size(&self) -> SipResult<WindowSize> {
        let master = self
            .master
            .lock()
            .map_err(|_| SipError::Pty("PTY master lock poisoned".into()))?;
        let size = master
            .get_size()
            .map_err(|e| SipError::Pty(format!("PTY size query failed: {e}")))?;
        Ok(WindowSize::new(size.rows, size.cols))
    }

    fn wait(&self) -> SipResult<ExitStatus> {
        let mut child = self
            .child
            .lock()
            .map_err(|_| SipError::Pty("child lock poisoned".into()))?;
        let status = child
            .wait()
            .map_err(|e| SipError::Pty(format!("wait error: {e}")))?;
        self.exited.store(true, Ordering::Release);

        let code = i32::try_from(status.exit_code()).unwrap_or(-1);
        info!(code, pid = self.pid, "PTY child exited");
        Ok(ExitStatus { code })
    }

    fn terminate(&self) -> SipResult<()> {
        #[cfg(unix)]
        {
            self.signal_group(libc::SIGTERM)
        }
        #[cfg(not(unix))]
        {
            self.kill()
        }
    }

    fn kill(&self) -> SipResult<()> {
        #[cfg(unix)]
        {
            if self.signal_group(libc::SIGKILL).is_ok() {
                return Ok(());
            }
        }
        let mut killer = self
            .killer
            .lock()
            .map_err(|_| SipError::Pty("killer lock poisoned".into()))?;
        killer
            .kill()
            .map_err(|e| SipError::Pty(format!("kill failed: {e}")))
    }

    fn pid(&self) -> Option<u32> {
        self.pid
    }
}

fn to_pty_size(size: WindowSize) -> PtySize {
    PtySize {
        rows: size.rows,
        cols: size.cols,
        pixel_width: 0,
        pixel_height: 0,
    }
}
