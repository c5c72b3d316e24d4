use std::io::{Read, Write as IoWrite};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver, Sender};
use std::sync::Arc;

use parking_lot::Mutex;
use portable_pty::{native_pty_system, Child, ChildKiller, MasterPty, PtySize};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use super::shell::ShellConfig;
use crate::errors::PtyAttachError;
use crate::sandbox::SandboxHandle;

const PTY_WRITE_CHUNK_SIZE: usize = 512;
const PTY_READ_BUFFER_SIZE: usize = 4096;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PtyEvent {
    /// Raw shell output, exactly as read from the PTY.
    Output(Vec<u8>),
    /// The shell is gone. `code` is `None` when the exit status could not be
    /// collected.
    Exit { code: Option<i32> },
}

/// A shell running in a pseudo-terminal inside a sandbox.
pub struct PtyBridge {
    id: String,
    master: Mutex<Box<dyn MasterPty + Send>>,
    killer: Mutex<Box<dyn ChildKiller + Send + Sync>>,
    input_tx: Sender<Vec<u8>>,
    pid: Option<u32>,
    exited: Arc<AtomicBool>,
    terminated: AtomicBool,
}

impl PtyBridge {
    /// Spawn the shell in `sandbox` and start pumping its output.
    ///
    /// Must be called from within a tokio runtime. The returned receiver
    /// yields output in arrival order and ends with a single
    /// [`PtyEvent::Exit`].
    pub fn attach(
        sandbox: &SandboxHandle,
        shell: &ShellConfig,
        cols: u16,
        rows: u16,
    ) -> Result<(Self, mpsc::UnboundedReceiver<PtyEvent>), PtyAttachError> {
        if !sandbox.is_ready() {
            return Err(PtyAttachError::SandboxNotReady(sandbox.id().to_string()));
        }
        let id = sandbox.id().to_string();

        let pair = native_pty_system()
            .openpty(PtySize {
                rows: rows.max(1),
                cols: cols.max(1),
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| PtyAttachError::Open(e.to_string()))?;

        let mut cmd = sandbox.command(&shell.shell);
        cmd.args(&shell.args);
        cmd.env("TERM", &shell.term);
        cmd.env("COLORTERM", "truecolor");
        cmd.env("SHELL", &shell.shell);

        let child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| PtyAttachError::Spawn(e.to_string()))?;
        // Keeping the slave open would hide EOF from the reader.
        drop(pair.slave);

        let reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| PtyAttachError::Open(format!("failed to clone reader: {e}")))?;
        let writer = pair
            .master
            .take_writer()
            .map_err(|e| PtyAttachError::Open(format!("failed to take writer: {e}")))?;

        let pid = child.process_id();
        let killer = child.clone_killer();

        let (input_tx, input_rx) = std::sync::mpsc::channel();
        spawn_pty_writer_thread(id.clone(), writer, input_rx);

        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let exited = Arc::new(AtomicBool::new(false));
        tokio::spawn(pump_output(
            id.clone(),
            reader,
            child,
            event_tx,
            Arc::clone(&exited),
        ));

        info!("[pty:{}] Shell {} started (pid: {:?})", id, shell.shell, pid);

        Ok((
            Self {
                id,
                master: Mutex::new(pair.master),
                killer: Mutex::new(killer),
                input_tx,
                pid,
                exited,
                terminated: AtomicBool::new(false),
            },
            event_rx,
        ))
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn has_exited(&self) -> bool {
        self.exited.load(Ordering::Acquire)
    }

    /// Queue input for the shell. Never blocks; input sent after the shell
    /// exited is dropped.
    pub fn write(&self, data: &[u8]) {
        if data.is_empty() {
            return;
        }
        if data.len() > 100 {
            debug!("[pty:{}] Queueing large input: {} bytes", self.id, data.len());
        }
        if self.input_tx.send(data.to_vec()).is_err() {
            debug!(
                "[pty:{}] Dropping {} bytes of input: shell has exited",
                self.id,
                data.len()
            );
        }
    }

    /// Best effort; failures are logged.
    pub fn resize(&self, cols: u16, rows: u16) {
        if cols == 0 || rows == 0 {
            return;
        }
        let master = self.master.lock();
        if let Err(e) = master.resize(PtySize {
            rows,
            cols,
            pixel_width: 0,
            pixel_height: 0,
        }) {
            warn!("[pty:{}] Resize to {}x{} failed: {}", self.id, cols, rows, e);
        }
    }

    /// Kill the shell. Safe to call more than once.
    pub fn terminate(&self) {
        if self.terminated.swap(true, Ordering::AcqRel) || self.has_exited() {
            return;
        }
        if let Err(e) = self.killer.lock().kill() {
            debug!("[pty:{}] Kill failed: {}", self.id, e);
        }
    }
}

impl Drop for PtyBridge {
    fn drop(&mut self) {
        self.terminate();
    }
}

/// Spawns a dedicated thread for PTY writes
fn spawn_pty_writer_thread(
    id: String,
    mut writer: Box<dyn IoWrite + Send>,
    input_rx: Receiver<Vec<u8>>,
) {
    std::thread::spawn(move || {
        debug!("[pty:{}] Writer thread started", id);
        let mut total_bytes_written: usize = 0;

        while let Ok(data) = input_rx.recv() {
            for chunk in data.chunks(PTY_WRITE_CHUNK_SIZE) {
                if let Err(e) = writer.write_all(chunk).and_then(|_| writer.flush()) {
                    debug!(
                        "[pty:{}] Write error: {} (errno: {:?})",
                        id,
                        e,
                        e.raw_os_error()
                    );
                    return;
                }
            }
            total_bytes_written += data.len();
        }

        debug!(
            "[pty:{}] Writer thread finished. Total: {} bytes",
            id, total_bytes_written
        );
    });
}

async fn pump_output(
    id: String,
    mut reader: Box<dyn Read + Send>,
    child: Box<dyn Child + Send + Sync>,
    event_tx: mpsc::UnboundedSender<PtyEvent>,
    exited: Arc<AtomicBool>,
) {
    let mut buf = [0u8; PTY_READ_BUFFER_SIZE];
    let mut total_bytes_read: usize = 0;

    loop {
        let read_result = tokio::task::spawn_blocking(move || {
            let result = reader.read(&mut buf);
            (reader, buf, result)
        })
        .await;

        let (returned_reader, returned_buf, result) = match read_result {
            Ok(r) => r,
            Err(e) => {
                error!("[pty:{}] spawn_blocking panicked: {}", id, e);
                break;
            }
        };
        reader = returned_reader;
        buf = returned_buf;

        match result {
            Ok(0) => break,
            Ok(n) => {
                total_bytes_read += n;
                // A closed receiver only means nobody cares about output
                // anymore; keep draining so the shell never blocks.
                let _ = event_tx.send(PtyEvent::Output(buf[..n].to_vec()));
            }
            // Linux reports EIO once the slave side is closed.
            Err(e) if e.raw_os_error() == Some(libc::EIO) => break,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => {
                warn!("[pty:{}] Read error: {}", id, e);
                break;
            }
        }
    }

    let code = collect_exit_code(&id, child).await;
    exited.store(true, Ordering::Release);
    info!(
        "[pty:{}] Shell exited (code: {:?}, {} bytes read)",
        id, code, total_bytes_read
    );
    let _ = event_tx.send(PtyEvent::Exit { code });
}

async fn collect_exit_code(id: &str, mut child: Box<dyn Child + Send + Sync>) -> Option<i32> {
    match tokio::task::spawn_blocking(move || child.wait()).await {
        Ok(Ok(status)) => Some(status.exit_code() as i32),
        Ok(Err(e)) => {
            warn!("[pty:{}] Failed to collect exit status: {}", id, e);
            None
        }
        Err(e) => {
            error!("[pty:{}] Exit wait panicked: {}", id, e);
            None
        }
    }
}
