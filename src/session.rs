//! Camera session: owns the queues, threads and buffer pool of one device.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{bounded, unbounded, Sender};
use tracing::{debug, error, info};

use crate::command::{
    Command, CommandResult, Completion, CompletionSlot, ControlMsg, Envelope, Response,
};
use crate::config::SessionConfig;
use crate::controller::Controller;
use crate::delivery::{DeliveryMsg, DeliveryTask};
use crate::error::{Result, SessionError};
use crate::pool::FramePool;
use crate::producer::FrameProducer;
use crate::traits::{
    CameraBackend, CameraDevice, ControlDescriptor, ControlId, ControlType, ControlValue,
    DeviceCapabilities, FrameMetadata, FrameSize, Roi,
};

/// Counters describing a session's frame flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionStats {
    /// Frames queued for delivery.
    pub frames_produced: u64,
    /// Frames handed to the application callback.
    pub frames_delivered: u64,
    /// Frames dropped since the last reset.
    pub frames_dropped: u64,
    /// Buffers currently free for the producer.
    pub buffers_available: usize,
    /// Total buffers in the pool.
    pub buffer_count: usize,
}

/// One open camera with its controller thread, delivery thread and pool.
///
/// Control operations go through a FIFO command queue processed by the
/// controller thread. Frames flow from the producer through the pool and
/// the callback queue to the delivery thread, which runs the application
/// callback. The two paths share nothing but the pool, so a slow control
/// operation never stalls frame delivery and vice versa.
pub struct Session {
    commands: Option<Sender<ControlMsg>>,
    frames: Sender<DeliveryMsg>,
    controller: Option<JoinHandle<()>>,
    delivery: Option<JoinHandle<()>>,
    delivery_stop: Arc<AtomicBool>,
    delivered: Arc<AtomicU64>,
    streaming: Arc<AtomicBool>,
    producer: FrameProducer,
    pool: FramePool,
    capabilities: DeviceCapabilities,
    controls: Vec<ControlDescriptor>,
}

impl Session {
    /// Open the back-end's device and start a session on it.
    pub fn open<B: CameraBackend>(backend: &B, config: &SessionConfig) -> Result<Self> {
        let device = backend.open_device()?;
        Self::with_device(device, config)
    }

    /// Start a session on an already opened device.
    ///
    /// Nothing is left running if construction fails.
    pub fn with_device<D: CameraDevice>(mut device: D, config: &SessionConfig) -> Result<Self> {
        let capabilities = device.capabilities().clone();
        let frame_len = config.frame_len.unwrap_or_else(|| capabilities.max_frame_len());
        let pool = match config
            .validate()
            .and_then(|()| FramePool::new(config.buffer_count, frame_len))
        {
            Ok(pool) => pool,
            Err(err) => {
                close_quietly(&mut device);
                return Err(err);
            }
        };

        let mut controls: Vec<_> = device
            .controls()
            .iter()
            .filter(|desc| !desc.id.is_session_control())
            .cloned()
            .collect();
        controls.push(ControlDescriptor::read_only(ControlId::DROPPED));
        controls.push(ControlDescriptor::boolean(ControlId::DROPPED_RESET, false));

        let (frames_tx, frames_rx) = bounded(config.queue_depth());
        let (commands_tx, commands_rx) = unbounded();
        let producer = FrameProducer::new(pool.clone(), frames_tx.clone(), device.frame_size());
        let streaming = Arc::new(AtomicBool::new(false));
        let delivery_stop = Arc::new(AtomicBool::new(false));
        let delivered = Arc::new(AtomicU64::new(0));

        let task = DeliveryTask::new(
            frames_rx,
            pool.clone(),
            Arc::clone(&delivery_stop),
            Arc::clone(&delivered),
        );
        let delivery = match thread::Builder::new()
            .name(format!("{}-delivery", config.thread_name_prefix))
            .spawn(move || task.run())
        {
            Ok(handle) => handle,
            Err(err) => {
                close_quietly(&mut device);
                pool.close();
                return Err(SessionError::MemAlloc(format!("delivery thread: {err}")));
            }
        };

        let controller = Controller::new(
            device,
            commands_rx,
            producer.clone(),
            Arc::clone(&streaming),
            config.max_frame_wait(),
        );
        let controller = match thread::Builder::new()
            .name(format!("{}-controller", config.thread_name_prefix))
            .spawn(move || controller.run())
        {
            Ok(handle) => handle,
            Err(err) => {
                delivery_stop.store(true, Ordering::Release);
                let _ = frames_tx.send(DeliveryMsg::Shutdown);
                let _ = delivery.join();
                pool.close();
                return Err(SessionError::MemAlloc(format!("controller thread: {err}")));
            }
        };

        info!(
            card = %capabilities.card,
            buffers = config.buffer_count,
            frame_len,
            "camera session opened"
        );

        Ok(Self {
            commands: Some(commands_tx),
            frames: frames_tx,
            controller: Some(controller),
            delivery: Some(delivery),
            delivery_stop,
            delivered,
            streaming,
            producer,
            pool,
            capabilities,
            controls,
        })
    }

    /// Submit a command and block until the controller has processed it.
    pub fn submit(&self, command: Command) -> CommandResult {
        let slot = Arc::new(CompletionSlot::new());
        self.enqueue(command, Completion::Wait(Arc::clone(&slot)))?;
        slot.wait()
    }

    /// Submit a command and return immediately; `on_complete` runs on the
    /// controller thread once the command has been processed.
    pub fn submit_async<F>(&self, command: Command, on_complete: F) -> Result<()>
    where
        F: FnOnce(CommandResult) + Send + 'static,
    {
        self.enqueue(command, Completion::Callback(Box::new(on_complete)))
    }

    fn enqueue(&self, command: Command, completion: Completion) -> Result<()> {
        let commands = self.commands.as_ref().ok_or(SessionError::SessionClosed)?;
        commands
            .send(ControlMsg::Command(Envelope::new(command, completion)))
            .map_err(|_| SessionError::SessionClosed)
    }

    /// Check `value` against the control's descriptor without touching the
    /// device.
    pub fn test_control(&self, id: ControlId, value: &ControlValue) -> Result<()> {
        self.descriptor(id)?.check(value)
    }

    /// `(min, max, step, default)` of a control.
    pub fn control_range(&self, id: ControlId) -> Result<(i64, i64, i64, i64)> {
        let desc = self.descriptor(id)?;
        Ok((desc.min, desc.max, desc.step, desc.default))
    }

    /// Descriptor of a control.
    pub fn descriptor(&self, id: ControlId) -> Result<&ControlDescriptor> {
        self.controls
            .iter()
            .find(|desc| desc.id == id)
            .ok_or(SessionError::InvalidControl(id))
    }

    /// Every control the session accepts.
    pub fn controls(&self) -> &[ControlDescriptor] {
        &self.controls
    }

    /// Validate and write a control value.
    pub fn set_control(&self, id: ControlId, value: ControlValue) -> Result<()> {
        self.test_control(id, &value)?;
        self.submit(Command::SetControl { id, value }).map(drop)
    }

    /// Read a control value.
    pub fn read_control(&self, id: ControlId) -> Result<ControlValue> {
        self.descriptor(id)?;
        match self.submit(Command::GetControl(id))? {
            Response::Value(value) => Ok(value),
            _ => Err(SessionError::DeviceIo(format!(
                "no value returned for control {id}"
            ))),
        }
    }

    /// Label of entry `index` of a menu control.
    pub fn menu_item(&self, id: ControlId, index: u32) -> Result<String> {
        let desc = self.descriptor(id)?;
        if desc.kind != ControlType::Menu {
            return Err(SessionError::InvalidControlType {
                control: id,
                expected: ControlType::Menu,
                actual: desc.kind,
            });
        }
        let value = i64::from(index);
        if value < desc.min || value > desc.max {
            return Err(SessionError::OutOfRange { control: id, value });
        }
        match self.submit(Command::GetMenuItem { id, index })? {
            Response::MenuItem(label) => Ok(label),
            _ => Err(SessionError::DeviceIo(format!(
                "no label returned for control {id}"
            ))),
        }
    }

    /// Change the output resolution (stop, reconfigure, restart if streaming).
    pub fn set_resolution(&self, size: FrameSize) -> Result<()> {
        self.submit(Command::SetResolution(size)).map(drop)
    }

    /// Change the region of interest (stop, reconfigure, restart if streaming).
    pub fn set_roi(&self, roi: Roi) -> Result<()> {
        self.submit(Command::SetRoi(roi)).map(drop)
    }

    /// Change the time between frames (stop, reconfigure, restart if
    /// streaming).
    pub fn set_frame_interval(&self, interval: Duration) -> Result<()> {
        self.submit(Command::SetFrameInterval(interval)).map(drop)
    }

    /// Start streaming; `callback` runs on the delivery thread once per frame.
    pub fn start_streaming<F>(&self, callback: F) -> Result<()>
    where
        F: FnMut(&[u8], &FrameMetadata) + Send + 'static,
    {
        self.submit(Command::StartStreaming(Box::new(callback))).map(drop)
    }

    /// Stop streaming. Fails with [`SessionError::InvalidCommand`] if the
    /// session is not streaming.
    pub fn stop_streaming(&self) -> Result<()> {
        self.submit(Command::StopStreaming).map(drop)
    }

    /// Whether the session is streaming.
    pub fn is_streaming(&self) -> bool {
        self.streaming.load(Ordering::Acquire)
    }

    /// Capabilities of the device captured when the session opened.
    pub const fn capabilities(&self) -> &DeviceCapabilities {
        &self.capabilities
    }

    /// The session's frame producer.
    pub const fn producer(&self) -> &FrameProducer {
        &self.producer
    }

    /// The session's buffer pool.
    pub const fn pool(&self) -> &FramePool {
        &self.pool
    }

    /// Snapshot of the frame counters.
    pub fn stats(&self) -> SessionStats {
        SessionStats {
            frames_produced: self.producer.produced_frames(),
            frames_delivered: self.delivered.load(Ordering::Relaxed),
            frames_dropped: self.producer.dropped_frames(),
            buffers_available: self.pool.available(),
            buffer_count: self.pool.buffer_count(),
        }
    }

    /// Stop both threads, release queued work and free the pool.
    pub fn close(mut self) -> Result<()> {
        self.shutdown()
    }

    /// Teardown order:
    /// 1. the producer refuses new frames, so late hardware callbacks
    ///    return without touching the pool;
    /// 2. the controller stops capture, fails queued commands with
    ///    [`SessionError::SessionClosed`] and closes the device;
    /// 3. the delivery thread releases queued frames without running the
    ///    callback;
    /// 4. the pool frees its buffers. A producer call still holding a
    ///    claimed buffer owns that memory and frees it on release.
    fn shutdown(&mut self) -> Result<()> {
        let Some(controller) = self.controller.take() else {
            return Ok(());
        };
        debug!("closing camera session");

        self.producer.close();

        if let Some(commands) = self.commands.take() {
            let _ = commands.send(ControlMsg::Shutdown);
        }
        let controller_result = controller.join();

        self.delivery_stop.store(true, Ordering::Release);
        let _ = self.frames.send(DeliveryMsg::Shutdown);
        let delivery_result = self.delivery.take().map(JoinHandle::join);

        self.pool.close();
        self.streaming.store(false, Ordering::Release);
        info!("camera session closed");

        if controller_result.is_err() {
            error!("controller thread panicked");
            return Err(SessionError::ThreadPanicked("controller"));
        }
        if matches!(delivery_result, Some(Err(_))) {
            error!("delivery thread panicked");
            return Err(SessionError::ThreadPanicked("delivery"));
        }
        Ok(())
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        let _ = self.shutdown();
    }
}

fn close_quietly<D: CameraDevice>(device: &mut D) {
    if let Err(err) = device.close_device() {
        debug!(error = %err, "device close failed during aborted open");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{DeviceCall, MockCamera};
    use tracing_test::traced_test;

    fn camera() -> MockCamera {
        MockCamera::new().with_max_size(FrameSize::new(8, 4))
    }

    #[test]
    #[traced_test]
    fn test_open_and_close_are_logged() {
        let session = Session::with_device(camera(), &SessionConfig::default())
            .expect("session should open");
        session.close().expect("session should close");

        assert!(logs_contain("frame pool allocated"));
        assert!(logs_contain("camera session opened"));
        assert!(logs_contain("camera session closed"));
    }

    #[test]
    fn test_session_controls_are_appended() {
        let session = Session::with_device(camera(), &SessionConfig::default())
            .expect("session should open");

        assert!(session.descriptor(ControlId::DROPPED).is_ok());
        assert!(session.descriptor(ControlId::DROPPED_RESET).is_ok());
        assert_eq!(session.controls().len(), camera().controls().len() + 2);
    }

    #[test]
    fn test_pool_sized_from_device() {
        let session = Session::with_device(camera(), &SessionConfig::default().with_buffer_count(3))
            .expect("session should open");

        assert_eq!(session.pool().buffer_count(), 3);
        assert_eq!(session.pool().buffer_len(), 32);
        assert_eq!(session.stats().buffers_available, 3);
    }

    #[test]
    fn test_rejected_config_closes_device() {
        let device = camera();
        let log = device.call_log();

        let result = Session::with_device(device, &SessionConfig::default().with_buffer_count(0));
        assert!(matches!(result, Err(SessionError::MemAlloc(_))));
        assert_eq!(log.calls(), vec![DeviceCall::Close]);
    }

    #[test]
    fn test_drop_closes_device_once() {
        let device = camera();
        let log = device.call_log();

        let session =
            Session::with_device(device, &SessionConfig::default()).expect("session should open");
        drop(session);

        assert_eq!(log.count(&DeviceCall::Close), 1);
    }
}
