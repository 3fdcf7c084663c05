//! Byte pipes between the host and a guest instance
//!
//! A [`BytePipe`] is an unbounded FIFO of bytes. Writes never block; reads
//! suspend until data arrives. The host writes JSON-RPC requests into a
//! guest's stdin pipe and reads responses line by line from its stdout pipe,
//! while the guest side runs on another thread, so the state sits behind a
//! mutex and readers park with wakers.

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll, Waker};

use crate::kernel::task::Completion;
use crate::kernel::wasm::{Errno, Filestat, Filetype, Whence};
use crate::vfs::Descriptor;

/// Observer called with every chunk written to a pipe
pub type Listener = Arc<dyn Fn(&[u8]) + Send + Sync>;

/// Pipe error types
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PipeError {
    /// A listener is already attached
    #[error("pipe already has an active listener")]
    ListenerActive,
}

/// A parked reader, in the order its wait began
struct Waiter {
    ticket: u64,
    waker: Option<Waker>,
}

#[derive(Default)]
struct PipeState {
    buffer: VecDeque<u8>,
    closed: bool,
    waiters: VecDeque<Waiter>,
    next_ticket: u64,
    listener: Option<Listener>,
    capture: Option<Vec<u8>>,
}

impl PipeState {
    fn enqueue(&mut self) -> u64 {
        let ticket = self.next_ticket;
        self.next_ticket += 1;
        self.waiters.push_back(Waiter {
            ticket,
            waker: None,
        });
        ticket
    }

    fn head_waker(&mut self) -> Option<Waker> {
        self.waiters.front_mut().and_then(|w| w.waker.take())
    }

    /// Remove whatever `want` asks for, if it is available yet
    fn take(&mut self, want: Want) -> Option<Vec<u8>> {
        match want {
            Want::Bytes(0) => Some(Vec::new()),
            Want::Bytes(max) => {
                if self.buffer.is_empty() {
                    return None;
                }
                let n = max.min(self.buffer.len());
                Some(self.buffer.drain(..n).collect())
            }
            Want::Line => {
                if let Some(pos) = self.buffer.iter().position(|&b| b == b'\n') {
                    let mut line: Vec<u8> = self.buffer.drain(..=pos).collect();
                    line.pop();
                    Some(line)
                } else if self.closed && !self.buffer.is_empty() {
                    Some(self.buffer.drain(..).collect())
                } else {
                    None
                }
            }
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Want {
    Bytes(usize),
    Line,
}

/// An unbounded byte FIFO with suspending reads
#[derive(Clone, Default)]
pub struct BytePipe {
    shared: Arc<Mutex<PipeState>>,
}

impl BytePipe {
    pub fn new() -> Self {
        Self::default()
    }

    /// A pipe that also keeps a copy of everything ever written to it
    pub fn capturing() -> Self {
        let pipe = Self::new();
        pipe.state().capture = Some(Vec::new());
        pipe
    }

    fn state(&self) -> MutexGuard<'_, PipeState> {
        self.shared.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append bytes and wake the first parked reader
    pub fn write(&self, data: &[u8]) {
        let (waker, listener) = {
            let mut state = self.state();
            if state.closed {
                return;
            }
            state.buffer.extend(data);
            if let Some(capture) = state.capture.as_mut() {
                capture.extend_from_slice(data);
            }
            (state.head_waker(), state.listener.clone())
        };
        if let Some(listener) = listener {
            listener(data);
        }
        if let Some(waker) = waker {
            waker.wake();
        }
    }

    /// Read up to `max` bytes, suspending until at least one is available.
    /// An empty result means the pipe was closed and drained.
    pub fn read(&self, max: usize) -> Read {
        Read(Take::new(self.clone(), Want::Bytes(max)))
    }

    /// Read one line without its terminator. `None` once closed and drained.
    pub fn read_line(&self) -> ReadLine {
        ReadLine(Take::new(self.clone(), Want::Line))
    }

    /// Non-suspending read: succeeds only when nobody is queued ahead and
    /// data is already buffered.
    pub fn try_read(&self, max: usize) -> Option<Vec<u8>> {
        let mut state = self.state();
        if !state.waiters.is_empty() {
            return None;
        }
        match state.take(Want::Bytes(max)) {
            Some(chunk) if !chunk.is_empty() || max == 0 => Some(chunk),
            _ if state.closed => Some(Vec::new()),
            _ => None,
        }
    }

    /// Attach the single write observer
    pub fn set_listener(&self, listener: Listener) -> Result<(), PipeError> {
        let mut state = self.state();
        if state.listener.is_some() {
            return Err(PipeError::ListenerActive);
        }
        state.listener = Some(listener);
        Ok(())
    }

    pub fn clear_listener(&self) {
        self.state().listener = None;
    }

    /// Close the pipe; parked readers drain what is left, then see EOF
    pub fn close(&self) {
        let wakers: Vec<Waker> = {
            let mut state = self.state();
            state.closed = true;
            state.waiters.iter_mut().filter_map(|w| w.waker.take()).collect()
        };
        for waker in wakers {
            waker.wake();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.state().closed
    }

    /// Bytes buffered and not yet read
    pub fn len(&self) -> usize {
        self.state().buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Everything written so far, if the pipe was created with [`BytePipe::capturing`]
    pub fn all_data(&self) -> Option<Vec<u8>> {
        self.state().capture.clone()
    }
}

impl std::fmt::Debug for BytePipe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state();
        f.debug_struct("BytePipe")
            .field("buffered", &state.buffer.len())
            .field("closed", &state.closed)
            .field("waiters", &state.waiters.len())
            .finish()
    }
}

/// Shared machinery of the read futures
struct Take {
    pipe: BytePipe,
    want: Want,
    ticket: Option<u64>,
    done: bool,
}

impl Take {
    fn new(pipe: BytePipe, want: Want) -> Self {
        Self {
            pipe,
            want,
            ticket: None,
            done: false,
        }
    }

    fn poll_take(&mut self, cx: &mut Context<'_>) -> Poll<Option<Vec<u8>>> {
        let mut state = self.pipe.state();
        let ticket = match self.ticket {
            Some(ticket) => ticket,
            None => {
                let ticket = state.enqueue();
                self.ticket = Some(ticket);
                ticket
            }
        };

        if state.waiters.front().map(|w| w.ticket) != Some(ticket) {
            if let Some(waiter) = state.waiters.iter_mut().find(|w| w.ticket == ticket) {
                waiter.waker = Some(cx.waker().clone());
            }
            return Poll::Pending;
        }

        let taken = state.take(self.want);
        if taken.is_none() && !state.closed {
            if let Some(head) = state.waiters.front_mut() {
                head.waker = Some(cx.waker().clone());
            }
            return Poll::Pending;
        }

        state.waiters.pop_front();
        self.done = true;
        let next = state.head_waker();
        drop(state);
        if let Some(waker) = next {
            waker.wake();
        }
        Poll::Ready(taken)
    }
}

impl Drop for Take {
    fn drop(&mut self) {
        let Some(ticket) = self.ticket else { return };
        if self.done {
            return;
        }
        let next = {
            let mut state = self.pipe.state();
            let was_head = state.waiters.front().map(|w| w.ticket) == Some(ticket);
            state.waiters.retain(|w| w.ticket != ticket);
            if was_head { state.head_waker() } else { None }
        };
        if let Some(waker) = next {
            waker.wake();
        }
    }
}

/// Future returned by [`BytePipe::read`]
pub struct Read(Take);

impl Future for Read {
    type Output = Vec<u8>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Vec<u8>> {
        self.get_mut().0.poll_take(cx).map(Option::unwrap_or_default)
    }
}

/// Future returned by [`BytePipe::read_line`]
pub struct ReadLine(Take);

impl Future for ReadLine {
    type Output = Option<String>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<String>> {
        self.get_mut()
            .0
            .poll_take(cx)
            .map(|line| line.map(|bytes| String::from_utf8_lossy(&bytes).into_owned()))
    }
}

impl Descriptor for BytePipe {
    fn filetype(&self) -> Filetype {
        Filetype::Unknown
    }

    fn filestat(&self) -> Result<Filestat, Errno> {
        Ok(Filestat::new(Filetype::Unknown, 0, 0))
    }

    fn read(&mut self, len: usize) -> Completion<'_, Result<Vec<u8>, Errno>> {
        match self.try_read(len) {
            Some(chunk) => Completion::ready(Ok(chunk)),
            None => {
                let read = BytePipe::read(self, len);
                Completion::pending(async move { Ok(read.await) })
            }
        }
    }

    fn write(&mut self, data: &[u8]) -> Result<usize, Errno> {
        BytePipe::write(self, data);
        Ok(data.len())
    }

    fn seek(&mut self, _offset: i64, _whence: Whence) -> Result<u64, Errno> {
        Err(Errno::Spipe)
    }
}

/// Where [`LineSink`] delivers complete lines
pub type LineHandler = Box<dyn FnMut(&str) + Send>;

/// Write-only sink that forwards complete lines to the log
///
/// Used for guest stderr. Partial lines are held until their terminator
/// arrives (or the sink is dropped).
pub struct LineSink {
    prefix: String,
    pending: Vec<u8>,
    handler: LineHandler,
}

impl LineSink {
    /// Lines go to `log::info!` under the `guest` target
    pub fn new(prefix: impl Into<String>) -> Self {
        let prefix = prefix.into();
        let tag = prefix.clone();
        Self::with_handler(
            prefix,
            Box::new(move |line: &str| log::info!(target: "guest", "[{}] {}", tag, line)),
        )
    }

    pub fn with_handler(prefix: impl Into<String>, handler: LineHandler) -> Self {
        Self {
            prefix: prefix.into(),
            pending: Vec::new(),
            handler,
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn push(&mut self, data: &[u8]) {
        self.pending.extend_from_slice(data);
        while let Some(pos) = self.pending.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.pending.drain(..=pos).collect();
            let text = String::from_utf8_lossy(&line[..line.len() - 1]);
            (self.handler)(text.trim_end_matches('\r'));
        }
    }

    /// Emit a trailing partial line, if any
    pub fn flush(&mut self) {
        if self.pending.is_empty() {
            return;
        }
        let line = std::mem::take(&mut self.pending);
        (self.handler)(&String::from_utf8_lossy(&line));
    }
}

impl Drop for LineSink {
    fn drop(&mut self) {
        self.flush();
    }
}

impl Descriptor for LineSink {
    fn filetype(&self) -> Filetype {
        Filetype::CharacterDevice
    }

    fn filestat(&self) -> Result<Filestat, Errno> {
        Ok(Filestat::new(Filetype::CharacterDevice, 0, 0))
    }

    fn write(&mut self, data: &[u8]) -> Result<usize, Errno> {
        self.push(data);
        Ok(data.len())
    }

    fn seek(&mut self, _offset: i64, _whence: Whence) -> Result<u64, Errno> {
        Err(Errno::Spipe)
    }
}
