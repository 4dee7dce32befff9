//! Control commands and their completion paths.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use crate::error::{Result, SessionError};
use crate::traits::{ControlId, ControlValue, FrameMetadata, FrameSize, Roi};

/// Application callback invoked once per delivered frame.
///
/// Any user argument is captured by the closure.
pub type FrameCallback = Box<dyn FnMut(&[u8], &FrameMetadata) + Send + 'static>;

/// Callback invoked when an asynchronously submitted command completes.
pub type CompletionCallback = Box<dyn FnOnce(CommandResult) + Send + 'static>;

/// Result of a processed command.
pub type CommandResult = Result<Response>;

/// A control request processed by the controller thread.
pub enum Command {
    /// Write a control value.
    SetControl {
        /// Control to write.
        id: ControlId,
        /// Value to write.
        value: ControlValue,
    },
    /// Read a control value.
    GetControl(ControlId),
    /// Change the output resolution.
    SetResolution(FrameSize),
    /// Change the region of interest.
    SetRoi(Roi),
    /// Change the time between frames.
    SetFrameInterval(Duration),
    /// Read the label of one entry of a menu control.
    GetMenuItem {
        /// Menu control to query.
        id: ControlId,
        /// Entry index.
        index: u32,
    },
    /// Start streaming frames to the callback.
    StartStreaming(FrameCallback),
    /// Stop streaming.
    StopStreaming,
}

impl Command {
    /// Short name of the command variant, used in logs.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::SetControl { .. } => "set-control",
            Self::GetControl(_) => "get-control",
            Self::SetResolution(_) => "set-resolution",
            Self::SetRoi(_) => "set-roi",
            Self::SetFrameInterval(_) => "set-frame-interval",
            Self::GetMenuItem { .. } => "get-menu-item",
            Self::StartStreaming(_) => "start-streaming",
            Self::StopStreaming => "stop-streaming",
        }
    }
}

impl fmt::Debug for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SetControl { id, value } => f
                .debug_struct("SetControl")
                .field("id", id)
                .field("value", value)
                .finish(),
            Self::GetControl(id) => f.debug_tuple("GetControl").field(id).finish(),
            Self::SetResolution(size) => f.debug_tuple("SetResolution").field(size).finish(),
            Self::SetRoi(roi) => f.debug_tuple("SetRoi").field(roi).finish(),
            Self::SetFrameInterval(interval) => {
                f.debug_tuple("SetFrameInterval").field(interval).finish()
            }
            Self::GetMenuItem { id, index } => f
                .debug_struct("GetMenuItem")
                .field("id", id)
                .field("index", index)
                .finish(),
            Self::StartStreaming(_) => f.write_str("StartStreaming(..)"),
            Self::StopStreaming => f.write_str("StopStreaming"),
        }
    }
}

/// Output payload of a successfully processed command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    /// The command had no output.
    Done,
    /// The value read by a [`Command::GetControl`].
    Value(ControlValue),
    /// The label read by a [`Command::GetMenuItem`].
    MenuItem(String),
}

/// Rendezvous between a blocked submitter and the controller.
///
/// The result is stored together with the completion flag, so a completed
/// slot always carries a result code.
#[derive(Default)]
pub struct CompletionSlot {
    result: Mutex<Option<CommandResult>>,
    done: Condvar,
}

impl CompletionSlot {
    /// Create an empty slot.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Store the result and wake every waiter. Later calls are ignored.
    pub fn complete(&self, result: CommandResult) {
        let mut slot = self.result.lock();
        if slot.is_none() {
            *slot = Some(result);
            drop(slot);
            self.done.notify_all();
        }
    }

    /// Whether a result has been stored.
    #[must_use]
    pub fn is_completed(&self) -> bool {
        self.result.lock().is_some()
    }

    /// Block until the command completes and take its result.
    pub fn wait(&self) -> CommandResult {
        let mut slot = self.result.lock();
        loop {
            if let Some(result) = slot.take() {
                return result;
            }
            self.done.wait(&mut slot);
        }
    }
}

/// How a command reports completion. Exactly one path is taken.
pub enum Completion {
    /// The submitter blocks on the slot.
    Wait(Arc<CompletionSlot>),
    /// The callback runs on the controller thread.
    Callback(CompletionCallback),
}

/// A queued command together with its completion path.
pub(crate) struct Envelope {
    command: Option<Command>,
    completion: Option<Completion>,
}

impl Envelope {
    pub(crate) const fn new(command: Command, completion: Completion) -> Self {
        Self {
            command: Some(command),
            completion: Some(completion),
        }
    }

    /// Move the command out for dispatch.
    pub(crate) fn take_command(&mut self) -> Option<Command> {
        self.command.take()
    }

    /// Report `result` through the completion path, consuming the envelope.
    pub(crate) fn finish(mut self, result: CommandResult) {
        if let Some(completion) = self.completion.take() {
            deliver(completion, result);
        }
    }
}

impl Drop for Envelope {
    fn drop(&mut self) {
        // An envelope dropped unprocessed (controller gone) still completes.
        if let Some(completion) = self.completion.take() {
            deliver(completion, Err(SessionError::SessionClosed));
        }
    }
}

fn deliver(completion: Completion, result: CommandResult) {
    match completion {
        Completion::Wait(slot) => slot.complete(result),
        Completion::Callback(callback) => callback(result),
    }
}

/// Message accepted by the controller thread.
pub(crate) enum ControlMsg {
    Command(Envelope),
    Shutdown,
}
