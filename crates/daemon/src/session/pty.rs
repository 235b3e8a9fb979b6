//! Headless terminal surface backed by a native pseudo-terminal.
//!
//! The child is spawned on a dedicated thread, which then stays on as the
//! reader: output is broadcast to display subscribers and forwarded to the
//! manager. When the stream ends the thread reaps the child and reports
//! `ChildExited` followed by `Eof`.

use std::ffi::OsString;
use std::io::{Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{anyhow, Context};
use parking_lot::Mutex;
use portable_pty::{native_pty_system, Child, ChildKiller, CommandBuilder, MasterPty, PtySize};
use tokio::sync::broadcast;

use super::surface::{SpawnCallback, SpawnRequest, SurfaceEvent, SurfaceSink, TerminalSurface};
use crate::error::SessionError;

/// Buffer size for reading from PTY.
const READ_BUFFER_SIZE: usize = 4096;

/// Channel capacity for broadcast output.
const BROADCAST_CAPACITY: usize = 256;

const DEFAULT_COLS: u16 = 80;
const DEFAULT_ROWS: u16 = 24;

struct Inner {
    sink: Mutex<Option<SurfaceSink>>,
    master: Mutex<Option<Box<dyn MasterPty + Send>>>,
    writer: Mutex<Option<Box<dyn Write + Send>>>,
    killer: Mutex<Option<Box<dyn ChildKiller + Send + Sync>>>,
    pid: Mutex<Option<u32>>,
    size: Mutex<PtySize>,
    display_tx: broadcast::Sender<Vec<u8>>,
    running: AtomicBool,
    closed: AtomicBool,
}

impl Inner {
    fn sink(&self) -> Option<SurfaceSink> {
        self.sink.lock().clone()
    }

    fn emit(&self, event: SurfaceEvent) {
        if let Some(sink) = self.sink() {
            sink.emit_blocking(event);
        }
    }
}

/// A [`TerminalSurface`] on top of `portable-pty`.
///
/// Display output, including diagnostics fed by the manager, is available
/// through [`PtySurface::subscribe`]. Input goes through
/// [`PtySurface::write`].
pub struct PtySurface {
    inner: Arc<Inner>,
}

impl PtySurface {
    pub fn new() -> Self {
        Self::with_size(DEFAULT_COLS, DEFAULT_ROWS)
    }

    pub fn with_size(cols: u16, rows: u16) -> Self {
        let (display_tx, _) = broadcast::channel(BROADCAST_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                sink: Mutex::new(None),
                master: Mutex::new(None),
                writer: Mutex::new(None),
                killer: Mutex::new(None),
                pid: Mutex::new(None),
                size: Mutex::new(PtySize {
                    rows,
                    cols,
                    pixel_width: 0,
                    pixel_height: 0,
                }),
                display_tx,
                running: AtomicBool::new(false),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Receive everything shown on this surface.
    pub fn subscribe(&self) -> broadcast::Receiver<Vec<u8>> {
        self.inner.display_tx.subscribe()
    }

    /// Process ID of the child, once spawned.
    pub fn pid(&self) -> Option<u32> {
        *self.inner.pid.lock()
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    /// Current terminal size as `(cols, rows)`.
    pub fn size(&self) -> (u16, u16) {
        let size = self.inner.size.lock();
        (size.cols, size.rows)
    }

    /// Send input to the child.
    pub fn write(&self, data: &[u8]) -> Result<(), SessionError> {
        let mut guard = self.inner.writer.lock();
        let writer = guard
            .as_mut()
            .ok_or_else(|| SessionError::Surface("terminal is not running".to_string()))?;
        writer
            .write_all(data)
            .and_then(|_| writer.flush())
            .map_err(|e| SessionError::Surface(format!("failed to write to PTY: {}", e)))
    }

    /// Resize the terminal.
    pub fn resize(&self, cols: u16, rows: u16) -> Result<(), SessionError> {
        let size = PtySize {
            rows,
            cols,
            pixel_width: 0,
            pixel_height: 0,
        };

        if let Some(master) = self.inner.master.lock().as_ref() {
            master
                .resize(size)
                .map_err(|e| SessionError::Surface(format!("failed to resize PTY: {}", e)))?;
        }
        *self.inner.size.lock() = size;

        tracing::debug!(cols, rows, "Resized PTY");
        Ok(())
    }
}

impl Default for PtySurface {
    fn default() -> Self {
        Self::new()
    }
}

impl TerminalSurface for PtySurface {
    fn attach(&self, sink: SurfaceSink) {
        *self.inner.sink.lock() = Some(sink);
    }

    fn spawn_async(&self, request: SpawnRequest, on_complete: SpawnCallback) {
        let inner = Arc::clone(&self.inner);
        // Shared so the callback can still be answered if the thread never starts.
        let slot = Arc::new(Mutex::new(Some(on_complete)));
        let thread_slot = Arc::clone(&slot);

        let spawned = std::thread::Builder::new()
            .name("shellward-pty".to_string())
            .spawn(move || {
                let callback = thread_slot.lock().take();
                run_child(inner, request, callback)
            });

        if let Err(e) = spawned {
            tracing::error!(error = %e, "Failed to start PTY thread");
            if let Some(callback) = slot.lock().take() {
                callback(Err(anyhow!("failed to start PTY thread: {}", e)));
            }
        }
    }

    fn feed(&self, data: &[u8]) {
        // No subscribers is fine.
        let _ = self.inner.display_tx.send(data.to_vec());
    }

    fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        if let Some(mut killer) = self.inner.killer.lock().take() {
            if self.inner.running.load(Ordering::SeqCst) {
                if let Err(e) = killer.kill() {
                    tracing::debug!(error = %e, "Failed to kill PTY child");
                }
            }
        }
        self.inner.writer.lock().take();
        self.inner.master.lock().take();
        tracing::debug!(pid = ?*self.inner.pid.lock(), "Closed PTY");
    }
}

impl Drop for PtySurface {
    fn drop(&mut self) {
        if let Some(sink) = self.inner.sink.lock().take() {
            sink.emit(SurfaceEvent::Destroyed);
        }
        self.close();
    }
}

fn run_child(inner: Arc<Inner>, request: SpawnRequest, callback: Option<SpawnCallback>) {
    let (mut child, mut reader) = match start_child(&inner, request) {
        Ok(started) => started,
        Err(e) => {
            tracing::debug!(error = %e, "PTY spawn failed");
            if let Some(callback) = callback {
                callback(Err(e));
            }
            return;
        }
    };

    let pid = child.process_id().unwrap_or_default();
    inner.running.store(true, Ordering::SeqCst);
    if let Some(callback) = callback {
        callback(Ok(pid));
    }

    let mut buffer = vec![0u8; READ_BUFFER_SIZE];
    loop {
        match reader.read(&mut buffer) {
            Ok(0) => break,
            Ok(n) => {
                let data = buffer[..n].to_vec();
                let _ = inner.display_tx.send(data.clone());
                inner.emit(SurfaceEvent::Output(data));
            }
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => {
                // Linux reports EIO once the child side has closed.
                tracing::trace!(pid, error = %e, "PTY read ended");
                break;
            }
        }
    }

    let code = match child.wait() {
        Ok(status) => i32::try_from(status.exit_code()).unwrap_or(i32::MAX),
        Err(e) => {
            tracing::warn!(pid, error = %e, "Failed to reap PTY child");
            -1
        }
    };
    inner.running.store(false, Ordering::SeqCst);
    tracing::info!(pid, code, "PTY child exited");

    inner.emit(SurfaceEvent::ChildExited(code));
    inner.emit(SurfaceEvent::Eof);
}

fn start_child(
    inner: &Inner,
    request: SpawnRequest,
) -> anyhow::Result<(Box<dyn Child + Send + Sync>, Box<dyn Read + Send>)> {
    if inner.closed.load(Ordering::SeqCst) {
        anyhow::bail!("terminal was closed before spawn");
    }
    if request.argv.is_empty() {
        anyhow::bail!("empty command line");
    }

    let size = *inner.size.lock();
    let pair = native_pty_system()
        .openpty(size)
        .context("failed to open PTY")?;

    let mut cmd = CommandBuilder::from_argv(request.argv.iter().map(OsString::from).collect());
    for (key, value) in &request.env {
        cmd.env(key, value);
    }
    if let Some(cwd) = &request.cwd {
        cmd.cwd(cwd);
    }

    let child = pair.slave.spawn_command(cmd)?;
    // The reader sees EOF only once every slave handle is gone.
    drop(pair.slave);

    match child.process_id() {
        Some(pid) if pid != 0 => {}
        _ => anyhow::bail!("child process has no pid"),
    }

    let reader = pair
        .master
        .try_clone_reader()
        .context("failed to get PTY reader")?;
    let writer = pair
        .master
        .take_writer()
        .context("failed to get PTY writer")?;

    *inner.pid.lock() = child.process_id();
    *inner.killer.lock() = Some(child.clone_killer());
    *inner.writer.lock() = Some(writer);
    *inner.master.lock() = Some(pair.master);

    Ok((child, reader))
}
