//! Per-file I/O actor
//!
//! A dedicated worker thread owns the `File` and drains a crossbeam channel
//! in FIFO order. Callers get a [`Ticket`] per request and block on it.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};

use crate::error::{ChronoError, Result};

use super::FileId;

/// Operations an actor understands
#[derive(Debug, Clone)]
pub enum IoOp {
    /// Read exactly `len` bytes at `offset`
    Read { offset: u64, len: usize },

    /// Write all of `data` at `offset`
    Write { offset: u64, data: Vec<u8> },

    /// Durability boundary: everything acknowledged before is on disk
    Sync,

    /// Cut the file to `len` bytes
    Truncate { len: u64 },

    /// Current file length
    Len,
}

/// Successful outcome of an [`IoOp`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IoReply {
    Data(Vec<u8>),
    Written,
    Synced,
    Truncated,
    Len(u64),
}

/// Per-request state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RequestState {
    Queued = 0,
    InFlight = 1,
    Completed = 2,
    Failed = 3,
    Cancelled = 4,
}

impl RequestState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => RequestState::Queued,
            1 => RequestState::InFlight,
            2 => RequestState::Completed,
            3 => RequestState::Failed,
            _ => RequestState::Cancelled,
        }
    }
}

struct Request {
    op: IoOp,
    state: Arc<AtomicU8>,
    reply: Sender<Result<IoReply>>,
}

enum Message {
    Request(Request),
    Shutdown,
}

// =============================================================================
// Ticket
// =============================================================================

/// Handle to one submitted request
pub struct Ticket {
    state: Arc<AtomicU8>,
    reply: Receiver<Result<IoReply>>,
}

impl Ticket {
    /// Current lifecycle state of the request
    pub fn state(&self) -> RequestState {
        RequestState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Withdraw the request. Only succeeds while it is still queued.
    pub fn cancel(&self) -> bool {
        self.withdraw(RequestState::Cancelled)
    }

    fn withdraw(&self, to: RequestState) -> bool {
        self.state
            .compare_exchange(
                RequestState::Queued as u8,
                to as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// Block until the actor resolves the request
    pub fn wait(self) -> Result<IoReply> {
        if self.state() == RequestState::Cancelled {
            return Err(ChronoError::Cancelled);
        }
        match self.reply.recv() {
            Ok(result) => result,
            Err(_) => Err(self.disconnected()),
        }
    }

    /// Block for at most `timeout`.
    ///
    /// An expired wait withdraws a still-queued request, leaving it
    /// `Failed` with a `TimedOut` I/O error; an in-flight request is always
    /// waited for.
    pub fn wait_timeout(self, timeout: Duration) -> Result<IoReply> {
        if self.state() == RequestState::Cancelled {
            return Err(ChronoError::Cancelled);
        }
        match self.reply.recv_timeout(timeout) {
            Ok(result) => result,
            Err(RecvTimeoutError::Timeout) => {
                if self.withdraw(RequestState::Failed) {
                    return Err(ChronoError::Io(std::io::Error::new(
                        std::io::ErrorKind::TimedOut,
                        "I/O request timed out while queued",
                    )));
                }
                match self.reply.recv() {
                    Ok(result) => result,
                    Err(_) => Err(self.disconnected()),
                }
            }
            Err(RecvTimeoutError::Disconnected) => Err(self.disconnected()),
        }
    }

    fn disconnected(&self) -> ChronoError {
        if self.state() == RequestState::Cancelled {
            ChronoError::Cancelled
        } else {
            ChronoError::Closed
        }
    }
}

// =============================================================================
// Handle
// =============================================================================

/// Cloneable sending side of an actor
#[derive(Clone)]
pub struct IoHandle {
    file_id: FileId,
    sender: Sender<Message>,
    timeout: Option<Duration>,
}

impl IoHandle {
    pub fn file_id(&self) -> FileId {
        self.file_id
    }

    /// Same handle, but every blocking call waits at most `timeout`
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    /// Enqueue a request without waiting for it
    pub fn submit(&self, op: IoOp) -> Result<Ticket> {
        let state = Arc::new(AtomicU8::new(RequestState::Queued as u8));
        let (reply_tx, reply_rx) = channel::bounded(1);
        let request = Request {
            op,
            state: Arc::clone(&state),
            reply: reply_tx,
        };
        self.sender
            .send(Message::Request(request))
            .map_err(|_| ChronoError::Closed)?;
        Ok(Ticket {
            state,
            reply: reply_rx,
        })
    }

    /// Submit and wait, honoring the handle's timeout
    pub fn call(&self, op: IoOp) -> Result<IoReply> {
        let ticket = self.submit(op)?;
        match self.timeout {
            Some(timeout) => ticket.wait_timeout(timeout),
            None => ticket.wait(),
        }
    }

    pub fn read(&self, offset: u64, len: usize) -> Result<Vec<u8>> {
        match self.call(IoOp::Read { offset, len })? {
            IoReply::Data(data) => Ok(data),
            other => Err(unexpected(other)),
        }
    }

    pub fn write(&self, offset: u64, data: Vec<u8>) -> Result<()> {
        match self.call(IoOp::Write { offset, data })? {
            IoReply::Written => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    pub fn sync(&self) -> Result<()> {
        match self.call(IoOp::Sync)? {
            IoReply::Synced => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    pub fn truncate(&self, len: u64) -> Result<()> {
        match self.call(IoOp::Truncate { len })? {
            IoReply::Truncated => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    pub fn len(&self) -> Result<u64> {
        match self.call(IoOp::Len)? {
            IoReply::Len(len) => Ok(len),
            other => Err(unexpected(other)),
        }
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }
}

fn unexpected(reply: IoReply) -> ChronoError {
    ChronoError::Io(std::io::Error::new(
        std::io::ErrorKind::Other,
        format!("mismatched actor reply: {:?}", reply),
    ))
}

// =============================================================================
// Actor
// =============================================================================

/// Owns one file and the worker thread that serializes access to it
pub struct IoActor {
    path: PathBuf,
    handle: IoHandle,
    worker: Option<JoinHandle<()>>,
}

impl IoActor {
    /// Open (or create) `path` and start its worker thread
    pub fn spawn(path: &Path, file_id: FileId) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;

        let (sender, receiver) = channel::unbounded();
        let worker = thread::Builder::new()
            .name(format!("chronokv-io-{}", file_id))
            .spawn(move || run(file, file_id, receiver))?;

        tracing::debug!(file = %file_id, path = %path.display(), "I/O actor started");

        Ok(Self {
            path: path.to_path_buf(),
            handle: IoHandle {
                file_id,
                sender,
                timeout: None,
            },
            worker: Some(worker),
        })
    }

    /// A sending handle onto this actor's queue
    pub fn handle(&self) -> IoHandle {
        self.handle.clone()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Drain everything already queued, then stop the worker
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        if let Some(worker) = self.worker.take() {
            let _ = self.handle.sender.send(Message::Shutdown);
            if worker.join().is_err() {
                tracing::warn!(file = %self.handle.file_id, "I/O actor thread panicked");
            }
            tracing::debug!(file = %self.handle.file_id, "I/O actor stopped");
        }
    }
}

impl Drop for IoActor {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Worker loop: strictly one request at a time, in queue order
fn run(mut file: File, file_id: FileId, receiver: Receiver<Message>) {
    for message in receiver.iter() {
        let request = match message {
            Message::Request(request) => request,
            Message::Shutdown => break,
        };

        let claimed = request.state.compare_exchange(
            RequestState::Queued as u8,
            RequestState::InFlight as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
        if claimed.is_err() {
            // withdrawn while queued
            continue;
        }

        let result = apply(&mut file, request.op);
        let final_state = match &result {
            Ok(_) => RequestState::Completed,
            Err(e) => {
                tracing::error!(file = %file_id, error = %e, "I/O request failed");
                RequestState::Failed
            }
        };
        request.state.store(final_state as u8, Ordering::Release);
        let _ = request.reply.send(result);
    }

    if let Err(e) = file.sync_all() {
        tracing::warn!(file = %file_id, error = %e, "final sync on shutdown failed");
    }
}

fn apply(file: &mut File, op: IoOp) -> Result<IoReply> {
    match op {
        IoOp::Read { offset, len } => {
            file.seek(SeekFrom::Start(offset))?;
            let mut buf = vec![0u8; len];
            file.read_exact(&mut buf)?;
            Ok(IoReply::Data(buf))
        }
        IoOp::Write { offset, data } => {
            file.seek(SeekFrom::Start(offset))?;
            file.write_all(&data)?;
            Ok(IoReply::Written)
        }
        IoOp::Sync => {
            file.sync_all()?;
            Ok(IoReply::Synced)
        }
        IoOp::Truncate { len } => {
            file.set_len(len)?;
            Ok(IoReply::Truncated)
        }
        IoOp::Len => Ok(IoReply::Len(file.metadata()?.len())),
    }
}
