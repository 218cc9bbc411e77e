//! In-memory [`PtyProcess`] for tests: scripted output, recorded input.

use super::pty::{ExitStatus, PtyProcess, PtySpawner, SpawnSpec};
use sip_core::{SipError, SipResult, WindowSize};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::{Arc, Condvar, Mutex};

pub(crate) struct FakePty {
    out_tx: Mutex<Option<Sender<Vec<u8>>>>,
    out_rx: Mutex<Receiver<Vec<u8>>>,
    pending: Mutex<Vec<u8>>,
    exit_tx: Mutex<Option<Sender<ExitStatus>>>,
    exit_rx: Mutex<Receiver<ExitStatus>>,
    written: Mutex<Vec<u8>>,
    /// While true, `write_all` blocks like a child that stopped reading.
    writes_stalled: Mutex<bool>,
    writes_released: Condvar,
    size: Mutex<WindowSize>,
    honor_terminate: AtomicBool,
    honor_kill: AtomicBool,
    terminate_calls: AtomicUsize,
    kill_calls: AtomicUsize,
}

impl FakePty {
    pub fn new() -> Arc<Self> {
        let (out_tx, out_rx) = channel();
        let (exit_tx, exit_rx) = channel();
        Arc::new(Self {
            out_tx: Mutex::new(Some(out_tx)),
            out_rx: Mutex::new(out_rx),
            pending: Mutex::new(Vec::new()),
            exit_tx: Mutex::new(Some(exit_tx)),
            exit_rx: Mutex::new(exit_rx),
            written: Mutex::new(Vec::new()),
            writes_stalled: Mutex::new(false),
            writes_released: Condvar::new(),
            size: Mutex::new(WindowSize::default()),
            honor_terminate: AtomicBool::new(true),
            honor_kill: AtomicBool::new(true),
            terminate_calls: AtomicUsize::new(0),
            kill_calls: AtomicUsize::new(0),
        })
    }

    /// Pretend the child wrote `data`.
    pub fn emit(&self, data: &[u8]) {
        if let Some(tx) = self.out_tx.lock().unwrap().as_ref() {
            let _ = tx.send(data.to_vec());
        }
    }

    /// Hang up the PTY: readers see EOF after buffered output.
    pub fn close_output(&self) {
        self.out_tx.lock().unwrap().take();
    }

    /// Report the child's exit without closing the PTY.
    pub fn report_exit(&self, code: i32) {
        if let Some(tx) = self.exit_tx.lock().unwrap().take() {
            let _ = tx.send(ExitStatus { code });
        }
    }

    /// The child exits and the PTY hangs up.
    pub fn exit(&self, code: i32) {
        self.close_output();
        self.report_exit(code);
    }

    pub fn written(&self) -> Vec<u8> {
        self.written.lock().unwrap().clone()
    }

    pub fn stall_writes(&self) {
        *self.writes_stalled.lock().unwrap() = true;
    }

    pub fn release_writes(&self) {
        *self.writes_stalled.lock().unwrap() = false;
        self.writes_released.notify_all();
    }

    pub fn ignore_terminate(&self) {
        self.honor_terminate.store(false, Ordering::SeqCst);
    }

    pub fn ignore_kill(&self) {
        self.honor_kill.store(false, Ordering::SeqCst);
    }

    pub fn terminate_calls(&self) -> usize {
        self.terminate_calls.load(Ordering::SeqCst)
    }

    pub fn kill_calls(&self) -> usize {
        self.kill_calls.load(Ordering::SeqCst)
    }
}

impl PtyProcess for FakePty {
    fn read(&self, buf: &mut [u8]) -> std::io::Result<usize> {
        let mut pending = self.pending.lock().unwrap();
        if pending.is_empty() {
            match self.out_rx.lock().unwrap().recv() {
                Ok(chunk) => *pending = chunk,
                Err(_) => return Ok(0),
            }
        }
        let n = pending.len().min(buf.len());
        buf[..n].copy_from_slice(&pending[..n]);
        pending.drain(..n);
        Ok(n)
    }

    fn write_all(&self, data: &[u8]) -> std::io::Result<()> {
        let mut stalled = self.writes_stalled.lock().unwrap();
        while *stalled {
            stalled = self.writes_released.wait(stalled).unwrap();
        }
        drop(stalled);
        self.written.lock().unwrap().extend_from_slice(data);
        Ok(())
    }

    fn resize(&self, size: WindowSize) -> SipResult<()> {
        size.validate()?;
        *self.size.lock().unwrap() = size;
        Ok(())
    }

    fn window_size(&self) -> SipResult<WindowSize> {
        Ok(*self.size.lock().unwrap())
    }

    fn wait(&self) -> SipResult<ExitStatus> {
        self.exit_rx
            .lock()
            .unwrap()
            .recv()
            .map_err(|_| SipError::Pty("fake child vanished".into()))
    }

    fn terminate(&self) -> SipResult<()> {
        self.terminate_calls.fetch_add(1, Ordering::SeqCst);
        if self.honor_terminate.load(Ordering::SeqCst) {
            self.exit(143);
        }
        Ok(())
    }

    fn kill(&self) -> SipResult<()> {
        self.kill_calls.fetch_add(1, Ordering::SeqCst);
        if self.honor_kill.load(Ordering::SeqCst) {
            self.exit(137);
            Ok(())
        } else {
            Err(SipError::Pty("kill refused".into()))
        }
    }

    fn pid(&self) -> Option<u32> {
        Some(4242)
    }
}

/// Hands out one prepared [`FakePty`], then refuses.
pub(crate) struct FakeSpawner {
    pty: Mutex<Option<Arc<FakePty>>>,
    pub spawned: AtomicUsize,
}

impl FakeSpawner {
    pub fn new(pty: Arc<FakePty>) -> Self {
        Self {
            pty: Mutex::new(Some(pty)),
            spawned: AtomicUsize::new(0),
        }
    }
}

impl PtySpawner for FakeSpawner {
    fn spawn(&self, spec: &SpawnSpec) -> SipResult<Arc<dyn PtyProcess>> {
        let pty = self
            .pty
            .lock()
            .unwrap()
            .take()
            .ok_or_else(|| SipError::spawn(&spec.program, "fake already spawned"))?;
        self.spawned.fetch_add(1, Ordering::SeqCst);
        pty.resize(spec.size)?;
        Ok(pty)
    }
}
