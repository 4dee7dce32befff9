//! Camera-Session: a concurrency core for camera sessions
//!
//! A [`Session`] owns one opened camera and splits its work across two
//! threads: a controller that processes control commands in FIFO order,
//! and a delivery thread that hands captured frames to the application
//! callback. Frames travel through a fixed pool of preallocated buffers,
//! so the producer never allocates and never blocks.
//!
//! Back-ends implement [`CameraDevice`]; the [`mock`] module provides
//! in-process cameras for tests and the [`device`] module drives V4L2
//! hardware.

pub mod command;
pub mod config;
mod controller;
pub mod delivery;
pub mod device;
pub mod error;
pub mod mock;
pub mod pool;
pub mod producer;
pub mod session;
pub mod traits;
pub mod validation;

pub use command::{Command, CommandResult, Completion, CompletionSlot, FrameCallback, Response};
pub use config::SessionConfig;
pub use delivery::FrameDescriptor;
pub use device::{V4L2Backend, V4L2Device};
pub use error::{Result, SessionError};
pub use pool::{BufferHandle, FramePool};
pub use producer::FrameProducer;
pub use session::{Session, SessionStats};
pub use traits::{
    CameraBackend, CameraDevice, ControlDescriptor, ControlId, ControlType, ControlValue,
    DeviceCapabilities, FrameMetadata, FrameSize, FrameSource, Roi, SyntheticSource,
};
