//! Mock cameras for testing without hardware.
//!
//! [`MockCamera`] is a synthetic source: the session's controller thread
//! asks it for one frame per turn. [`MockPushCamera`] behaves like a vendor
//! SDK and pushes frames from a thread of its own. Both record every call
//! the session makes into a shared [`CallLog`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::Mutex;
use tracing::debug;

use crate::error::{Result, SessionError};
use crate::producer::FrameProducer;
use crate::traits::{
    CameraBackend, CameraDevice, ControlDescriptor, ControlId, ControlType, ControlValue,
    DeviceCapabilities, FrameSize, FrameSource, Roi, SyntheticSource,
};

/// Largest frame the mock sensor produces.
pub const MOCK_MAX_SIZE: FrameSize = FrameSize::new(1280, 960);

/// A call made by the session into a mock device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceCall {
    /// `apply_control` with the written value.
    ApplyControl(ControlId, ControlValue),
    /// `read_control`.
    ReadControl(ControlId),
    /// `apply_resolution`.
    ApplyResolution(FrameSize),
    /// `apply_roi`.
    ApplyRoi(Roi),
    /// `apply_frame_interval`.
    ApplyFrameInterval(Duration),
    /// `menu_item` with the queried index.
    ReadMenuItem(ControlId, u32),
    /// `start_capture`.
    StartCapture,
    /// `stop_capture`.
    StopCapture,
    /// A frame was rendered or pushed at the given geometry.
    Frame(FrameSize),
    /// `close_device`.
    Close,
}

/// Shared, ordered record of [`DeviceCall`]s.
#[derive(Debug, Clone, Default)]
pub struct CallLog {
    calls: Arc<Mutex<Vec<DeviceCall>>>,
}

impl CallLog {
    fn record(&self, call: DeviceCall) {
        self.calls.lock().push(call);
    }

    /// Snapshot of every call so far.
    #[must_use]
    pub fn calls(&self) -> Vec<DeviceCall> {
        self.calls.lock().clone()
    }

    /// Calls other than rendered frames.
    #[must_use]
    pub fn commands(&self) -> Vec<DeviceCall> {
        self.calls
            .lock()
            .iter()
            .filter(|call| !matches!(call, DeviceCall::Frame(_)))
            .cloned()
            .collect()
    }

    /// Number of recorded calls equal to `call`.
    #[must_use]
    pub fn count(&self, call: &DeviceCall) -> usize {
        self.calls.lock().iter().filter(|c| *c == call).count()
    }

    /// Number of frames rendered or pushed.
    #[must_use]
    pub fn frames(&self) -> usize {
        self.calls
            .lock()
            .iter()
            .filter(|call| matches!(call, DeviceCall::Frame(_)))
            .count()
    }

    /// Forget every recorded call.
    pub fn clear(&self) {
        self.calls.lock().clear();
    }
}

/// Test pattern types for mock frame generation (8-bit mono).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TestPattern {
    /// Eight vertical bars of decreasing luma.
    ColorBars,
    /// Horizontal gradient from dark to light.
    Gradient,
    /// Every pixel set to the same value.
    Solid(u8),
    /// Every pixel set to the low byte of the frame number.
    Counter,
}

/// Luma of the eight bars, white to black.
pub const BAR_LEVELS: [u8; 8] = [235, 210, 170, 145, 106, 81, 41, 16];

/// Render `pattern` at `size` into `buf`, returning the bytes written.
///
/// Output is truncated to `buf.len()`.
pub fn render_pattern(pattern: TestPattern, size: FrameSize, frame: u64, buf: &mut [u8]) -> usize {
    let width = size.width.max(1) as usize;
    let len = size.frame_len(1).min(buf.len());
    let bar_width = (width / BAR_LEVELS.len()).max(1);

    for (i, px) in buf.iter_mut().take(len).enumerate() {
        let x = i % width;
        *px = match pattern {
            TestPattern::ColorBars => {
                let bar = (x / bar_width).min(BAR_LEVELS.len() - 1);
                BAR_LEVELS.get(bar).copied().unwrap_or(0)
            }
            #[allow(clippy::cast_possible_truncation)]
            TestPattern::Gradient => ((x * 255) / width) as u8,
            TestPattern::Solid(value) => value,
            #[allow(clippy::cast_possible_truncation)]
            TestPattern::Counter => frame as u8,
        };
    }
    len
}

/// Entries of the simulated power line frequency menu.
pub const POWER_LINE_LABELS: [&str; 3] = ["Disabled", "50 Hz", "60 Hz"];

/// Control set of the simulated sensor.
#[must_use]
pub fn dummy_controls() -> Vec<ControlDescriptor> {
    vec![
        ControlDescriptor::ranged(ControlId::GAIN, ControlType::Int32, 0, 100, 50),
        ControlDescriptor::ranged(
            ControlId::EXPOSURE_ABSOLUTE,
            ControlType::Int64,
            1_000,
            30_000_000,
            10_000,
        ),
        ControlDescriptor::ranged(ControlId::BRIGHTNESS, ControlType::Int32, 0, 32, 0),
        ControlDescriptor::boolean(ControlId::HFLIP, false),
        ControlDescriptor::boolean(ControlId::VFLIP, false),
        ControlDescriptor::discrete(ControlId::BINNING, vec![1, 2], 1),
        ControlDescriptor::ranged(ControlId::POWER_LINE_FREQUENCY, ControlType::Menu, 0, 2, 1),
        ControlDescriptor::ranged(ControlId::TEMPERATURE, ControlType::ReadOnly, -10, -10, -10),
    ]
}

fn initial_value(desc: &ControlDescriptor) -> ControlValue {
    let narrow = |v: i64| i32::try_from(v).unwrap_or_default();
    match desc.kind {
        ControlType::Int32 => ControlValue::Int32(narrow(desc.default)),
        ControlType::Int64 => ControlValue::Int64(desc.default),
        ControlType::Boolean => ControlValue::Boolean(desc.default != 0),
        ControlType::Menu => ControlValue::Menu(narrow(desc.default)),
        ControlType::Discrete => ControlValue::Discrete(narrow(desc.default)),
        ControlType::ReadOnly => ControlValue::ReadOnly(desc.default),
        ControlType::String => ControlValue::String(String::new()),
    }
}

/// Stored control values of a mock sensor.
#[derive(Debug, Clone)]
struct ControlBank {
    descriptors: Vec<ControlDescriptor>,
    values: HashMap<ControlId, ControlValue>,
    failing: Option<ControlId>,
}

impl ControlBank {
    fn new() -> Self {
        let descriptors = dummy_controls();
        let values = descriptors
            .iter()
            .map(|desc| (desc.id, initial_value(desc)))
            .collect();
        Self {
            descriptors,
            values,
            failing: None,
        }
    }

    fn apply(&mut self, id: ControlId, value: &ControlValue) -> Result<()> {
        if self.failing == Some(id) {
            return Err(SessionError::DeviceIo(format!("mock failure writing {id}")));
        }
        let desc = self
            .descriptors
            .iter()
            .find(|desc| desc.id == id)
            .ok_or(SessionError::InvalidControl(id))?;
        desc.check(value)?;
        self.values.insert(id, value.clone());
        Ok(())
    }

    fn read(&self, id: ControlId) -> Result<ControlValue> {
        if self.failing == Some(id) {
            return Err(SessionError::DeviceIo(format!("mock failure reading {id}")));
        }
        self.values
            .get(&id)
            .cloned()
            .ok_or(SessionError::InvalidControl(id))
    }

    fn menu_item(&self, id: ControlId, index: u32) -> Result<String> {
        if self.failing == Some(id) {
            return Err(SessionError::DeviceIo(format!("mock failure reading {id}")));
        }
        if id != ControlId::POWER_LINE_FREQUENCY {
            return Err(SessionError::InvalidControl(id));
        }
        usize::try_from(index)
            .ok()
            .and_then(|i| POWER_LINE_LABELS.get(i))
            .map(|label| (*label).to_owned())
            .ok_or(SessionError::OutOfRange {
                control: id,
                value: i64::from(index),
            })
    }
}

fn mock_capabilities(driver: &str, max_size: FrameSize) -> DeviceCapabilities {
    DeviceCapabilities {
        driver: driver.to_owned(),
        card: "Mock Camera".to_owned(),
        bus_info: "mock:0".to_owned(),
        max_size,
        bytes_per_pixel: 1,
    }
}

fn check_geometry(max: FrameSize, x: u32, y: u32, size: FrameSize) -> Result<()> {
    let fits_x = x.checked_add(size.width).is_some_and(|right| right <= max.width);
    let fits_y = y.checked_add(size.height).is_some_and(|bottom| bottom <= max.height);
    if size.width == 0 || size.height == 0 || !fits_x || !fits_y {
        return Err(SessionError::OutOfRange {
            control: ControlId::FRAME_FORMAT,
            value: i64::from(size.width) * i64::from(size.height),
        });
    }
    Ok(())
}

/// Synthetic mock camera rendering frames on demand.
pub struct MockCamera {
    capabilities: DeviceCapabilities,
    controls: ControlBank,
    size: FrameSize,
    pattern: TestPattern,
    frame_interval: Duration,
    control_delay: Duration,
    frame_count: u64,
    fail_stop: bool,
    log: CallLog,
}

impl Default for MockCamera {
    fn default() -> Self {
        Self::new()
    }
}

impl MockCamera {
    /// Create a mock camera with the full sensor size and a 30 fps rate.
    #[must_use]
    pub fn new() -> Self {
        Self {
            capabilities: mock_capabilities("mock", MOCK_MAX_SIZE),
            controls: ControlBank::new(),
            size: MOCK_MAX_SIZE,
            pattern: TestPattern::ColorBars,
            frame_interval: Duration::from_millis(33),
            control_delay: Duration::ZERO,
            frame_count: 0,
            fail_stop: false,
            log: CallLog::default(),
        }
    }

    /// Shrink the sensor; the current geometry follows.
    #[must_use]
    pub const fn with_max_size(mut self, size: FrameSize) -> Self {
        self.capabilities.max_size = size;
        self.size = size;
        self
    }

    /// Set the initial output geometry.
    #[must_use]
    pub const fn with_frame_size(mut self, size: FrameSize) -> Self {
        self.size = size;
        self
    }

    /// Set the time between rendered frames.
    #[must_use]
    pub const fn with_frame_interval(mut self, interval: Duration) -> Self {
        self.frame_interval = interval;
        self
    }

    /// Set the test pattern.
    #[must_use]
    pub const fn with_pattern(mut self, pattern: TestPattern) -> Self {
        self.pattern = pattern;
        self
    }

    /// Make every control write and read take `delay`.
    #[must_use]
    pub const fn with_control_delay(mut self, delay: Duration) -> Self {
        self.control_delay = delay;
        self
    }

    /// Make writes and reads of `id` fail with [`SessionError::DeviceIo`].
    #[must_use]
    pub const fn with_failing_control(mut self, id: ControlId) -> Self {
        self.controls.failing = Some(id);
        self
    }

    /// Make `stop_capture` fail.
    #[must_use]
    pub const fn with_failing_stop(mut self) -> Self {
        self.fail_stop = true;
        self
    }

    /// Handle on the call log, valid after the camera moves into a session.
    #[must_use]
    pub fn call_log(&self) -> CallLog {
        self.log.clone()
    }

    fn pause(&self) {
        if !self.control_delay.is_zero() {
            thread::sleep(self.control_delay);
        }
    }
}

impl SyntheticSource for MockCamera {
    fn frame_interval(&self) -> Duration {
        self.frame_interval
    }

    fn fill_frame(&mut self, buf: &mut [u8]) -> Result<usize> {
        self.log.record(DeviceCall::Frame(self.size));
        let written = render_pattern(self.pattern, self.size, self.frame_count, buf);
        self.frame_count += 1;
        Ok(written)
    }
}

impl CameraDevice for MockCamera {
    fn capabilities(&self) -> &DeviceCapabilities {
        &self.capabilities
    }

    fn controls(&self) -> &[ControlDescriptor] {
        &self.controls.descriptors
    }

    fn frame_size(&self) -> FrameSize {
        self.size
    }

    fn apply_control(&mut self, id: ControlId, value: &ControlValue) -> Result<()> {
        self.log.record(DeviceCall::ApplyControl(id, value.clone()));
        self.pause();
        self.controls.apply(id, value)
    }

    fn read_control(&mut self, id: ControlId) -> Result<ControlValue> {
        self.log.record(DeviceCall::ReadControl(id));
        self.pause();
        self.controls.read(id)
    }

    fn apply_resolution(&mut self, size: FrameSize) -> Result<()> {
        self.log.record(DeviceCall::ApplyResolution(size));
        check_geometry(self.capabilities.max_size, 0, 0, size)?;
        self.size = size;
        Ok(())
    }

    fn apply_roi(&mut self, roi: Roi) -> Result<()> {
        self.log.record(DeviceCall::ApplyRoi(roi));
        check_geometry(self.capabilities.max_size, roi.x, roi.y, roi.size())?;
        self.size = roi.size();
        Ok(())
    }

    fn apply_frame_interval(&mut self, interval: Duration) -> Result<()> {
        self.log.record(DeviceCall::ApplyFrameInterval(interval));
        self.frame_interval = interval;
        Ok(())
    }

    fn menu_item(&mut self, id: ControlId, index: u32) -> Result<String> {
        self.log.record(DeviceCall::ReadMenuItem(id, index));
        self.pause();
        self.controls.menu_item(id, index)
    }

    fn start_capture(&mut self, _producer: &FrameProducer) -> Result<()> {
        self.log.record(DeviceCall::StartCapture);
        Ok(())
    }

    fn stop_capture(&mut self) -> Result<()> {
        self.log.record(DeviceCall::StopCapture);
        if self.fail_stop {
            return Err(SessionError::DeviceIo("mock stop failure".to_owned()));
        }
        Ok(())
    }

    fn frame_source(&mut self) -> FrameSource<'_> {
        FrameSource::Synthetic(self)
    }

    fn close_device(&mut self) -> Result<()> {
        self.log.record(DeviceCall::Close);
        Ok(())
    }
}

/// Manual frame injection into a [`MockPushCamera`].
///
/// Stands in for the vendor callback: pushes only reach the session
/// between `start_capture` and `stop_capture`.
#[derive(Clone, Default)]
pub struct PushTrigger {
    producer: Arc<Mutex<Option<FrameProducer>>>,
}

impl PushTrigger {
    /// Push one frame. Returns whether the session queued it.
    ///
    /// The lock is held across the push, so a concurrent `stop_capture`
    /// waits for it to finish.
    pub fn push(&self, payload: &[u8]) -> bool {
        self.producer
            .lock()
            .as_ref()
            .is_some_and(|producer| producer.on_frame(payload))
    }

    /// Whether the camera is currently capturing.
    #[must_use]
    pub fn is_capturing(&self) -> bool {
        self.producer.lock().is_some()
    }
}

struct SdkThread {
    stop: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

/// Hardware-style mock camera pushing frames from its own thread.
///
/// Without [`MockPushCamera::with_auto_push`] frames are only produced
/// through the [`PushTrigger`].
pub struct MockPushCamera {
    capabilities: DeviceCapabilities,
    controls: ControlBank,
    size: Arc<Mutex<FrameSize>>,
    pattern: TestPattern,
    auto_interval: Option<Duration>,
    trigger: PushTrigger,
    sdk: Option<SdkThread>,
    log: CallLog,
}

impl Default for MockPushCamera {
    fn default() -> Self {
        Self::new()
    }
}

impl MockPushCamera {
    /// Create a push camera with the full sensor size.
    #[must_use]
    pub fn new() -> Self {
        Self {
            capabilities: mock_capabilities("mock-push", MOCK_MAX_SIZE),
            controls: ControlBank::new(),
            size: Arc::new(Mutex::new(MOCK_MAX_SIZE)),
            pattern: TestPattern::Gradient,
            auto_interval: None,
            trigger: PushTrigger::default(),
            sdk: None,
            log: CallLog::default(),
        }
    }

    /// Shrink the sensor; the current geometry follows.
    #[must_use]
    pub fn with_max_size(mut self, size: FrameSize) -> Self {
        self.capabilities.max_size = size;
        self.size = Arc::new(Mutex::new(size));
        self
    }

    /// Push a frame every `interval` from an SDK thread while capturing.
    #[must_use]
    pub const fn with_auto_push(mut self, interval: Duration) -> Self {
        self.auto_interval = Some(interval);
        self
    }

    /// Set the test pattern used by the SDK thread.
    #[must_use]
    pub const fn with_pattern(mut self, pattern: TestPattern) -> Self {
        self.pattern = pattern;
        self
    }

    /// Handle for injecting frames manually.
    #[must_use]
    pub fn trigger(&self) -> PushTrigger {
        self.trigger.clone()
    }

    /// Handle on the call log.
    #[must_use]
    pub fn call_log(&self) -> CallLog {
        self.log.clone()
    }

    fn spawn_sdk(&self, producer: FrameProducer, interval: Duration) -> Result<SdkThread> {
        let stop = Arc::new(AtomicBool::new(false));
        let size = Arc::clone(&self.size);
        let log = self.log.clone();
        let pattern = self.pattern;

        let handle = {
            let stop = Arc::clone(&stop);
            thread::Builder::new()
                .name("mock-sdk".to_owned())
                .spawn(move || {
                    let mut frame = 0u64;
                    let mut data = Vec::new();
                    while !stop.load(Ordering::Acquire) {
                        let size = *size.lock();
                        data.resize(size.frame_len(1), 0);
                        render_pattern(pattern, size, frame, &mut data);
                        if producer.on_frame(&data) {
                            log.record(DeviceCall::Frame(size));
                        }
                        frame += 1;
                        thread::sleep(interval);
                    }
                    debug!(frames = frame, "mock sdk thread stopped");
                })?
        };

        Ok(SdkThread { stop, handle })
    }
}

impl CameraDevice for MockPushCamera {
    fn capabilities(&self) -> &DeviceCapabilities {
        &self.capabilities
    }

    fn controls(&self) -> &[ControlDescriptor] {
        &self.controls.descriptors
    }

    fn frame_size(&self) -> FrameSize {
        *self.size.lock()
    }

    fn apply_control(&mut self, id: ControlId, value: &ControlValue) -> Result<()> {
        self.log.record(DeviceCall::ApplyControl(id, value.clone()));
        self.controls.apply(id, value)
    }

    fn read_control(&mut self, id: ControlId) -> Result<ControlValue> {
        self.log.record(DeviceCall::ReadControl(id));
        self.controls.read(id)
    }

    fn apply_resolution(&mut self, size: FrameSize) -> Result<()> {
        self.log.record(DeviceCall::ApplyResolution(size));
        check_geometry(self.capabilities.max_size, 0, 0, size)?;
        *self.size.lock() = size;
        Ok(())
    }

    fn apply_roi(&mut self, roi: Roi) -> Result<()> {
        self.log.record(DeviceCall::ApplyRoi(roi));
        check_geometry(self.capabilities.max_size, roi.x, roi.y, roi.size())?;
        *self.size.lock() = roi.size();
        Ok(())
    }

    fn apply_frame_interval(&mut self, interval: Duration) -> Result<()> {
        self.log.record(DeviceCall::ApplyFrameInterval(interval));
        if self.auto_interval.is_some() {
            self.auto_interval = Some(interval);
        }
        Ok(())
    }

    fn menu_item(&mut self, id: ControlId, index: u32) -> Result<String> {
        self.log.record(DeviceCall::ReadMenuItem(id, index));
        self.controls.menu_item(id, index)
    }

    fn start_capture(&mut self, producer: &FrameProducer) -> Result<()> {
        self.log.record(DeviceCall::StartCapture);
        if let Some(interval) = self.auto_interval {
            self.sdk = Some(self.spawn_sdk(producer.clone(), interval)?);
        }
        *self.trigger.producer.lock() = Some(producer.clone());
        Ok(())
    }

    fn stop_capture(&mut self) -> Result<()> {
        self.trigger.producer.lock().take();
        if let Some(sdk) = self.sdk.take() {
            sdk.stop.store(true, Ordering::Release);
            if sdk.handle.join().is_err() {
                return Err(SessionError::ThreadPanicked("mock sdk"));
            }
        }
        self.log.record(DeviceCall::StopCapture);
        Ok(())
    }

    fn frame_source(&mut self) -> FrameSource<'_> {
        FrameSource::Hardware
    }

    fn close_device(&mut self) -> Result<()> {
        self.log.record(DeviceCall::Close);
        Ok(())
    }
}

/// Back-end opening [`MockCamera`]s.
#[derive(Debug, Clone, Copy)]
pub struct MockBackend {
    /// Sensor size of opened cameras.
    pub max_size: FrameSize,
    /// Time between rendered frames.
    pub frame_interval: Duration,
}

impl Default for MockBackend {
    fn default() -> Self {
        Self {
            max_size: MOCK_MAX_SIZE,
            frame_interval: Duration::from_millis(33),
        }
    }
}

impl CameraBackend for MockBackend {
    type Device = MockCamera;

    fn open_device(&self) -> Result<MockCamera> {
        Ok(MockCamera::new()
            .with_max_size(self.max_size)
            .with_frame_interval(self.frame_interval))
    }
}

/// Back-end opening auto-pushing [`MockPushCamera`]s.
#[derive(Debug, Clone, Copy)]
pub struct MockPushBackend {
    /// Sensor size of opened cameras.
    pub max_size: FrameSize,
    /// Time between pushed frames.
    pub frame_interval: Duration,
}

impl Default for MockPushBackend {
    fn default() -> Self {
        Self {
            max_size: MOCK_MAX_SIZE,
            frame_interval: Duration::from_millis(33),
        }
    }
}

impl CameraBackend for MockPushBackend {
    type Device = MockPushCamera;

    fn open_device(&self) -> Result<MockPushCamera> {
        Ok(MockPushCamera::new()
            .with_max_size(self.max_size)
            .with_auto_push(self.frame_interval))
    }
}
