//! # Commands and Command Handles
//!
//! Purpose: `Command` describes one outbound request (verb, arguments and
//! the output it decodes into). `AsyncCommand` wraps it in a single-assignment
//! completion cell that the decode path completes and callers wait on.
//!
//! ## Design Principles
//! 1. **One Transition**: A handle leaves `Pending` exactly once, either to
//!    `Completed` or `Cancelled`. Later attempts are no-ops.
//! 2. **Wait at the Call Site**: Only `get`, `get_timeout` and `wait_for`
//!    block, and only the calling thread. The decode path never waits.
//! 3. **Three Ways to Read**: blocking (Condvar), `Future` (wakers) and
//!    completion callbacks all observe the same cell.
//!
//! ## Lifecycle
//!
//! ```text
//!              complete() / complete_exceptionally()
//!   Pending ───────────────────────────────────────────► Completed
//!      │
//!      └── cancel() ────────────────────────────────────► Cancelled
//! ```
//!
//! A wait that times out leaves the handle `Pending`; a reply arriving later
//! still completes it and stays retrievable.

use std::fmt;
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, Waker};
use std::time::{Duration, Instant};

use bytes::BytesMut;
use parking_lot::{Condvar, MappedMutexGuard, Mutex, MutexGuard};
use tracing::error;

use crate::args::{write_bulk, CommandArgs};
use crate::error::{HkvError, HkvResult};
use crate::interrupt::{self, Unpark};
use crate::keyword::ProtocolKeyword;
use crate::output::{self, CommandOutput};
use crate::resp::{encode_array_header, RespValue};

/// One outbound request and the output bound to it.
pub struct Command<O> {
    keyword: Arc<dyn ProtocolKeyword>,
    args: CommandArgs,
    output: O,
}

impl<O: CommandOutput> Command<O> {
    pub fn new<K>(keyword: K, output: O) -> Self
    where
        K: ProtocolKeyword + 'static,
    {
        Self::with_args(keyword, output, CommandArgs::new())
    }

    pub fn with_args<K>(keyword: K, output: O, args: CommandArgs) -> Self
    where
        K: ProtocolKeyword + 'static,
    {
        Command {
            keyword: Arc::new(keyword),
            args,
            output,
        }
    }

    pub fn keyword(&self) -> &dyn ProtocolKeyword {
        self.keyword.as_ref()
    }

    pub fn args(&self) -> &CommandArgs {
        &self.args
    }

    pub fn args_mut(&mut self) -> &mut CommandArgs {
        &mut self.args
    }

    pub fn output(&self) -> &O {
        &self.output
    }

    pub fn output_mut(&mut self) -> &mut O {
        &mut self.output
    }

    /// Appends the RESP2 encoding of the request.
    pub fn encode(&self, out: &mut BytesMut) {
        encode_request(self.keyword.as_ref(), &self.args, out);
    }
}

impl<O: fmt::Debug> fmt::Display for Command<O> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Command [type={}, args=[{}], output={:?}]",
            self.keyword.name(),
            self.args,
            self.output
        )
    }
}

impl<O: fmt::Debug> fmt::Debug for Command<O> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

fn encode_request(keyword: &dyn ProtocolKeyword, args: &CommandArgs, out: &mut BytesMut) {
    encode_array_header(args.len() + 1, out);
    write_bulk(out, keyword.as_bytes());
    args.encode(out);
}

/// Lifecycle state of a command handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandState {
    Pending,
    Completed,
    Cancelled,
}

impl CommandState {
    pub fn is_terminal(self) -> bool {
        self != CommandState::Pending
    }
}

type Callback<T> = Box<dyn FnOnce(&HkvResult<T>) + Send>;

struct Slot<O: CommandOutput> {
    state: CommandState,
    output: O,
    error: Option<HkvError>,
    callbacks: Vec<Callback<O::Output>>,
    wakers: Vec<Waker>,
}

impl<O: CommandOutput> Slot<O> {
    fn result(&self) -> HkvResult<O::Output> {
        match (self.state, &self.error) {
            (CommandState::Cancelled, _) => Err(HkvError::Cancelled),
            (_, Some(err)) => Err(err.clone()),
            _ => Ok(self.output.get()),
        }
    }
}

struct Shared<O: CommandOutput> {
    keyword: Arc<dyn ProtocolKeyword>,
    args: CommandArgs,
    slot: Mutex<Slot<O>>,
    done: Condvar,
}

impl<O: CommandOutput> Unpark for Shared<O> {
    fn unpark(&self) {
        // Taking the lock orders this wake-up after the waiter's flag check.
        let _slot = self.slot.lock();
        self.done.notify_all();
    }
}

/// Awaitable, cancellable handle for a dispatched command.
pub struct AsyncCommand<O: CommandOutput> {
    shared: Arc<Shared<O>>,
}

impl<O: CommandOutput> Clone for AsyncCommand<O> {
    fn clone(&self) -> Self {
        AsyncCommand {
            shared: self.shared.clone(),
        }
    }
}

impl<O: CommandOutput + 'static> AsyncCommand<O> {
    pub fn new(command: Command<O>) -> Self {
        let Command {
            keyword,
            args,
            output,
        } = command;
        AsyncCommand {
            shared: Arc::new(Shared {
                keyword,
                args,
                slot: Mutex::new(Slot {
                    state: CommandState::Pending,
                    output,
                    error: None,
                    callbacks: Vec::new(),
                    wakers: Vec::new(),
                }),
                done: Condvar::new(),
            }),
        }
    }

    pub fn keyword(&self) -> &dyn ProtocolKeyword {
        self.shared.keyword.as_ref()
    }

    pub fn args(&self) -> &CommandArgs {
        &self.shared.args
    }

    /// Locks and returns the bound output.
    pub fn output(&self) -> MappedMutexGuard<'_, O> {
        MutexGuard::map(self.shared.slot.lock(), |slot| &mut slot.output)
    }

    pub fn state(&self) -> CommandState {
        self.shared.slot.lock().state
    }

    pub fn is_done(&self) -> bool {
        self.state().is_terminal()
    }

    pub fn is_cancelled(&self) -> bool {
        self.state() == CommandState::Cancelled
    }

    /// Cancels the handle. Always returns true.
    ///
    /// The request may already be on the wire; its reply is discarded when
    /// it arrives. `_may_interrupt` is accepted for API symmetry only.
    pub fn cancel(&self, _may_interrupt: bool) -> bool {
        self.finish(CommandState::Cancelled, None);
        true
    }

    /// Marks the command completed with whatever the output holds.
    pub fn complete(&self) -> bool {
        self.finish(CommandState::Completed, None)
    }

    /// Completes the command with `err` as its result.
    pub fn complete_exceptionally(&self, err: HkvError) -> bool {
        self.finish(CommandState::Completed, Some(err))
    }

    /// Blocks until the command is done and returns its result.
    pub fn get(&self) -> HkvResult<O::Output> {
        self.await_terminal(None)?;
        self.result()
    }

    /// Like `get`, but fails with `HkvError::Timeout` after `timeout`.
    ///
    /// A zero timeout still returns the result of a completed command.
    pub fn get_timeout(&self, timeout: Duration) -> HkvResult<O::Output> {
        if !self.await_terminal(Some(timeout))? {
            return Err(HkvError::Timeout);
        }
        self.result()
    }

    /// Waits up to `timeout` and reports whether the command is done.
    pub fn wait_for(&self, timeout: Duration) -> HkvResult<bool> {
        self.await_terminal(Some(timeout))
    }

    /// Future resolving to the result once the command is done.
    pub fn wait(&self) -> CommandFuture<O> {
        CommandFuture {
            shared: self.shared.clone(),
        }
    }

    /// Runs `callback` once with the final result. Runs immediately when the
    /// command is already done.
    pub fn on_complete<F>(&self, callback: F)
    where
        F: FnOnce(&HkvResult<O::Output>) + Send + 'static,
    {
        let mut slot = self.shared.slot.lock();
        if slot.state.is_terminal() {
            let result = slot.result();
            drop(slot);
            self.run_callback(Box::new(callback), &result);
        } else {
            slot.callbacks.push(Box::new(callback));
        }
    }

    fn result(&self) -> HkvResult<O::Output> {
        self.shared.slot.lock().result()
    }

    /// Callbacks run on the connection's reader task; a panic must not
    /// take the task down with it.
    fn run_callback(&self, callback: Callback<O::Output>, result: &HkvResult<O::Output>) {
        if panic::catch_unwind(AssertUnwindSafe(|| callback(result))).is_err() {
            error!(command = %self.shared.keyword.name(), "completion callback panicked");
        }
    }

    fn finish(&self, target: CommandState, error: Option<HkvError>) -> bool {
        let mut slot = self.shared.slot.lock();
        if slot.state.is_terminal() {
            return false;
        }
        slot.state = target;
        if let Some(err) = error {
            slot.error = Some(err);
        }
        let callbacks = std::mem::take(&mut slot.callbacks);
        let wakers = std::mem::take(&mut slot.wakers);
        let result = if callbacks.is_empty() {
            None
        } else {
            Some(slot.result())
        };
        self.shared.done.notify_all();
        drop(slot);

        for waker in wakers {
            waker.wake();
        }
        if let Some(result) = result {
            for callback in callbacks {
                self.run_callback(callback, &result);
            }
        }
        true
    }

    fn await_terminal(&self, timeout: Option<Duration>) -> HkvResult<bool> {
        let deadline = timeout.and_then(|timeout| Instant::now().checked_add(timeout));
        let interrupter = interrupt::current();
        if self.is_done() {
            return Ok(true);
        }
        if interrupter.clear() {
            return Err(HkvError::Interrupted);
        }

        let _parked = interrupter.park_on(self.shared.clone());
        let mut slot = self.shared.slot.lock();
        loop {
            if slot.state.is_terminal() {
                return Ok(true);
            }
            if interrupter.clear() {
                return Err(HkvError::Interrupted);
            }
            match deadline {
                // No deadline, or one too far out to represent.
                None => self.shared.done.wait(&mut slot),
                Some(deadline) => {
                    if Instant::now() >= deadline {
                        return Ok(false);
                    }
                    let _ = self.shared.done.wait_until(&mut slot, deadline);
                }
            }
        }
    }
}

impl<O: CommandOutput> fmt::Debug for AsyncCommand<O> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AsyncCommand")
            .field("type", &self.shared.keyword.name())
            .field("state", &self.shared.slot.lock().state)
            .finish()
    }
}

impl<O: CommandOutput> fmt::Display for AsyncCommand<O> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let slot = self.shared.slot.lock();
        write!(
            f,
            "AsyncCommand [type={}, args=[{}], output={:?}, state={:?}]",
            self.shared.keyword.name(),
            self.shared.args,
            slot.output,
            slot.state
        )
    }
}

/// Future returned by [`AsyncCommand::wait`].
pub struct CommandFuture<O: CommandOutput> {
    shared: Arc<Shared<O>>,
}

impl<O: CommandOutput> Future for CommandFuture<O> {
    type Output = HkvResult<O::Output>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut slot = self.shared.slot.lock();
        if slot.state.is_terminal() {
            return Poll::Ready(slot.result());
        }
        if !slot.wakers.iter().any(|waker| waker.will_wake(cx.waker())) {
            slot.wakers.push(cx.waker().clone());
        }
        Poll::Pending
    }
}

/// Type-erased view of a command handle used by connection queues.
pub trait QueuedCommand: Send + Sync + fmt::Debug {
    fn keyword(&self) -> &dyn ProtocolKeyword;

    /// Appends the request bytes to `out`.
    fn encode(&self, out: &mut BytesMut);

    /// Feeds the matching reply and completes the command.
    fn on_reply(&self, frame: &RespValue);

    /// Completes the command with `err`.
    fn fail(&self, err: HkvError);

    fn is_done(&self) -> bool;

    fn is_cancelled(&self) -> bool;
}

impl<O: CommandOutput + 'static> QueuedCommand for AsyncCommand<O> {
    fn keyword(&self) -> &dyn ProtocolKeyword {
        AsyncCommand::keyword(self)
    }

    fn encode(&self, out: &mut BytesMut) {
        encode_request(self.shared.keyword.as_ref(), &self.shared.args, out);
    }

    fn on_reply(&self, frame: &RespValue) {
        {
            let mut slot = self.shared.slot.lock();
            if slot.state.is_terminal() {
                // Cancelled before the reply arrived.
                return;
            }
            if let Err(err) = output::feed(&mut slot.output, frame) {
                if let HkvError::LocalUsage(detail) = &err {
                    error!(command = %self.shared.keyword.name(), %detail, "reply does not fit command output");
                }
                slot.error = Some(err);
            }
        }
        self.complete();
    }

    fn fail(&self, err: HkvError) {
        self.complete_exceptionally(err);
    }

    fn is_done(&self) -> bool {
        AsyncCommand::is_done(self)
    }

    fn is_cancelled(&self) -> bool {
        AsyncCommand::is_cancelled(self)
    }
}
