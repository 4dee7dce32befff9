//! Controller thread: drains the command queue and drives the device.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError};
use tracing::{debug, info, warn};

use crate::command::{Command, CommandResult, ControlMsg, Envelope, FrameCallback, Response};
use crate::error::{Result, SessionError};
use crate::producer::FrameProducer;
use crate::traits::{CameraDevice, ControlId, ControlValue, FrameSize, FrameSource, Roi};

/// Owns the device for the lifetime of the session.
pub(crate) struct Controller<D: CameraDevice> {
    device: D,
    commands: Receiver<ControlMsg>,
    producer: FrameProducer,
    streaming: Arc<AtomicBool>,
    max_frame_wait: Duration,
    next_frame_at: Instant,
}

impl<D: CameraDevice> Controller<D> {
    pub(crate) fn new(
        device: D,
        commands: Receiver<ControlMsg>,
        producer: FrameProducer,
        streaming: Arc<AtomicBool>,
        max_frame_wait: Duration,
    ) -> Self {
        Self {
            device,
            commands,
            producer,
            streaming,
            max_frame_wait,
            next_frame_at: Instant::now(),
        }
    }

    /// Run until shutdown is requested or every submitter is gone.
    pub(crate) fn run(mut self) {
        debug!("controller thread started");

        loop {
            let msg = if self.is_synthesizing() {
                match self.commands.recv_deadline(self.next_frame_at) {
                    Ok(msg) => Some(msg),
                    Err(RecvTimeoutError::Timeout) => None,
                    Err(RecvTimeoutError::Disconnected) => break,
                }
            } else {
                match self.commands.recv() {
                    Ok(msg) => Some(msg),
                    Err(_) => break,
                }
            };

            if let Some(msg) = msg {
                if !self.dispatch(msg) || !self.drain_queue() {
                    break;
                }
            }

            if self.is_synthesizing() && Instant::now() >= self.next_frame_at {
                self.synthesize_frame();
            }
        }

        self.shutdown();
    }

    /// Process everything queued right now. Returns `false` on shutdown.
    fn drain_queue(&mut self) -> bool {
        while let Ok(msg) = self.commands.try_recv() {
            if !self.dispatch(msg) {
                return false;
            }
        }
        true
    }

    fn dispatch(&mut self, msg: ControlMsg) -> bool {
        match msg {
            ControlMsg::Command(envelope) => {
                self.process(envelope);
                true
            }
            ControlMsg::Shutdown => false,
        }
    }

    fn process(&mut self, mut envelope: Envelope) {
        let Some(command) = envelope.take_command() else {
            return;
        };
        let name = command.name();

        let result = self.handle(command);
        if let Err(err) = &result {
            warn!(command = name, error = %err, "command failed");
        }
        envelope.finish(result);
    }

    fn handle(&mut self, command: Command) -> CommandResult {
        match command {
            Command::SetControl { id, value } => self.set_control(id, &value),
            Command::GetControl(id) => self.get_control(id),
            Command::SetResolution(size) => self.set_resolution(size),
            Command::SetRoi(roi) => self.set_roi(roi),
            Command::SetFrameInterval(interval) => self.set_frame_interval(interval),
            Command::GetMenuItem { id, index } => {
                self.device.menu_item(id, index).map(Response::MenuItem)
            }
            Command::StartStreaming(callback) => self.start_streaming(callback),
            Command::StopStreaming => self.stop_streaming(),
        }
    }

    fn set_control(&mut self, id: ControlId, value: &ControlValue) -> CommandResult {
        if id == ControlId::DROPPED_RESET {
            self.producer.reset_dropped();
        } else {
            self.device.apply_control(id, value)?;
        }
        Ok(Response::Done)
    }

    fn get_control(&mut self, id: ControlId) -> CommandResult {
        if id == ControlId::DROPPED {
            let dropped = i64::try_from(self.producer.dropped_frames()).unwrap_or(i64::MAX);
            return Ok(Response::Value(ControlValue::ReadOnly(dropped)));
        }
        if id == ControlId::DROPPED_RESET {
            return Err(SessionError::InvalidControl(id));
        }
        self.device.read_control(id).map(Response::Value)
    }

    fn set_resolution(&mut self, size: FrameSize) -> CommandResult {
        self.check_fits(size)?;
        self.reconfigure(|device| device.apply_resolution(size))
    }

    fn set_roi(&mut self, roi: Roi) -> CommandResult {
        self.check_fits(roi.size())?;
        self.reconfigure(|device| device.apply_roi(roi))
    }

    fn set_frame_interval(&mut self, interval: Duration) -> CommandResult {
        if interval.is_zero() {
            return Err(SessionError::InvalidCommand("frame interval must be non-zero"));
        }
        self.reconfigure(|device| device.apply_frame_interval(interval))
    }

    /// Pool buffers are never resized, so larger frames are refused.
    fn check_fits(&self, size: FrameSize) -> Result<()> {
        let needed = size.frame_len(self.device.capabilities().bytes_per_pixel);
        if needed == 0 || needed > self.producer.buffer_len() {
            return Err(SessionError::OutOfRange {
                control: ControlId::FRAME_FORMAT,
                value: i64::try_from(needed).unwrap_or(i64::MAX),
            });
        }
        Ok(())
    }

    /// Stop, apply `change`, then restart if streaming was active.
    fn reconfigure<F>(&mut self, change: F) -> CommandResult
    where
        F: FnOnce(&mut D) -> Result<()>,
    {
        let restart = self.is_streaming();
        if restart {
            self.halt_capture()?;
        }

        let applied = change(&mut self.device);
        self.producer.set_frame_size(self.device.frame_size());
        info!(size = ?self.device.frame_size(), restart, "capture reconfigured");

        if restart {
            self.resume_capture()?;
        }
        applied.map(|()| Response::Done)
    }

    fn start_streaming(&mut self, callback: FrameCallback) -> CommandResult {
        if self.is_streaming() {
            return Err(SessionError::InvalidCommand("already streaming"));
        }

        self.producer.set_callback(callback);
        if let Err(err) = self.resume_capture() {
            self.producer.clear_callback();
            return Err(err);
        }
        info!("streaming started");
        Ok(Response::Done)
    }

    fn stop_streaming(&mut self) -> CommandResult {
        if !self.is_streaming() {
            return Err(SessionError::InvalidCommand("not streaming"));
        }

        self.halt_capture()?;
        self.producer.clear_callback();
        info!("streaming stopped");
        Ok(Response::Done)
    }

    /// Transition Stopped -> Streaming.
    fn resume_capture(&mut self) -> Result<()> {
        self.producer.resume();
        if let Err(err) = self.device.start_capture(&self.producer) {
            self.producer.pause();
            return Err(err);
        }
        self.streaming.store(true, Ordering::Release);
        self.next_frame_at = Instant::now();
        Ok(())
    }

    /// Transition Streaming -> Stopped. The producer is paused first so no
    /// push lands once `stop_capture` returns. The state is left unchanged
    /// if the device refuses to stop.
    fn halt_capture(&mut self) -> Result<()> {
        self.producer.pause();
        if let Err(err) = self.device.stop_capture() {
            self.producer.resume();
            return Err(err);
        }
        self.streaming.store(false, Ordering::Release);
        Ok(())
    }

    fn is_streaming(&self) -> bool {
        self.streaming.load(Ordering::Acquire)
    }

    fn is_synthesizing(&mut self) -> bool {
        self.is_streaming() && matches!(self.device.frame_source(), FrameSource::Synthetic(_))
    }

    /// Render one frame into the pool and schedule the next turn.
    fn synthesize_frame(&mut self) {
        let FrameSource::Synthetic(source) = self.device.frame_source() else {
            return;
        };

        let interval = source.frame_interval().min(self.max_frame_wait);
        self.producer.produce_with(|handle| source.fill_frame(handle.as_mut_slice()));
        self.next_frame_at = Instant::now() + interval;
    }

    fn shutdown(mut self) {
        if self.is_streaming() {
            if let Err(err) = self.halt_capture() {
                warn!(error = %err, "failed to stop capture during shutdown");
            }
        }
        self.producer.close();
        self.producer.clear_callback();

        let mut abandoned = 0usize;
        for msg in self.commands.try_iter() {
            if let ControlMsg::Command(envelope) = msg {
                envelope.finish(Err(SessionError::SessionClosed));
                abandoned += 1;
            }
        }

        if let Err(err) = self.device.close_device() {
            warn!(error = %err, "failed to close device");
        }
        debug!(abandoned, "controller thread stopped");
    }
}
