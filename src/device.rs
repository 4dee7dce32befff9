//! V4L2 device implementation using the v4l crate.
//!
//! Capture runs on a dedicated thread that owns its own handle to the
//! device node and feeds every dequeued buffer into the session's
//! [`FrameProducer`], the same way a vendor SDK callback would.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{bounded, Sender};
use tracing::{debug, info, warn};
use v4l::buffer::Type;
use v4l::control::{self, Control, Value};
use v4l::io::mmap::Stream;
use v4l::io::traits::CaptureStream as V4lCaptureStream;
use v4l::video::capture::Parameters;
use v4l::video::Capture;
use v4l::{Device, Fraction};

use crate::error::{Result, SessionError};
use crate::producer::FrameProducer;
use crate::traits::{
    CameraBackend, CameraDevice, ControlDescriptor, ControlId, ControlType, ControlValue,
    DeviceCapabilities, FrameSize, FrameSource, Roi,
};

/// Number of mmap buffers queued to the driver.
const DRIVER_BUFFERS: u32 = 4;

/// How long a dequeue may block before the stop flag is checked again.
const POLL_TIMEOUT: Duration = Duration::from_millis(200);

/// V4L2 control IDs for the session's control vocabulary.
const CID_MAP: [(ControlId, u32); 8] = [
    (ControlId::BRIGHTNESS, 0x0098_0900),
    (ControlId::CONTRAST, 0x0098_0901),
    (ControlId::GAMMA, 0x0098_0910),
    (ControlId::GAIN, 0x0098_0913),
    (ControlId::HFLIP, 0x0098_0914),
    (ControlId::VFLIP, 0x0098_0915),
    (ControlId::POWER_LINE_FREQUENCY, 0x0098_0918),
    (ControlId::EXPOSURE_ABSOLUTE, 0x009a_0902),
];

fn cid(id: ControlId) -> Result<u32> {
    CID_MAP
        .iter()
        .find(|(control, _)| *control == id)
        .map(|(_, cid)| *cid)
        .ok_or(SessionError::InvalidControl(id))
}

fn io_error(err: &io::Error) -> SessionError {
    SessionError::DeviceIo(err.to_string())
}

/// Frame interval in microseconds, as handed to `VIDIOC_S_PARM`.
fn interval_micros(interval: Duration) -> Result<u32> {
    u32::try_from(interval.as_micros())
        .ok()
        .filter(|&micros| micros > 0)
        .ok_or_else(|| SessionError::OutOfRange {
            control: ControlId::FRAME_FORMAT,
            value: i64::try_from(interval.as_micros()).unwrap_or(i64::MAX),
        })
}

fn menu_label(item: &control::MenuItem) -> String {
    match item {
        control::MenuItem::Name(name) => name.clone(),
        control::MenuItem::Value(value) => value.to_string(),
    }
}

/// Back-end opening `/dev/video<index>`.
#[derive(Debug, Clone, Copy)]
pub struct V4L2Backend {
    /// Device index (e.g., 0 for /dev/video0).
    pub index: usize,
}

impl CameraBackend for V4L2Backend {
    type Device = V4L2Device;

    fn open_device(&self) -> Result<V4L2Device> {
        V4L2Device::open(self.index)
    }
}

struct CaptureThread {
    stop: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

/// V4L2 device implementation wrapping the v4l crate.
pub struct V4L2Device {
    index: usize,
    device: Device,
    capabilities: DeviceCapabilities,
    controls: Vec<ControlDescriptor>,
    menus: Vec<(ControlId, u32, String)>,
    size: FrameSize,
    capture: Option<CaptureThread>,
}

impl V4L2Device {
    /// Open a V4L2 device by index (e.g., 0 for /dev/video0).
    pub fn open(index: usize) -> Result<Self> {
        let device = Device::new(index).map_err(|err| io_error(&err))?;
        let caps = device.query_caps().map_err(|err| io_error(&err))?;

        if !caps.capabilities.contains(v4l::capability::Flags::VIDEO_CAPTURE)
            || !caps.capabilities.contains(v4l::capability::Flags::STREAMING)
        {
            return Err(SessionError::DeviceIo(format!(
                "{} cannot stream video capture",
                caps.card
            )));
        }

        let fmt = device.format().map_err(|err| io_error(&err))?;
        let size = FrameSize::new(fmt.width, fmt.height);
        let bytes_per_pixel = if fmt.width == 0 {
            1
        } else {
            (fmt.stride / fmt.width).max(1) as usize
        };

        let capabilities = DeviceCapabilities {
            driver: caps.driver,
            card: caps.card,
            bus_info: caps.bus,
            max_size: size,
            bytes_per_pixel,
        };

        let descriptions = device.query_controls().unwrap_or_else(|err| {
            warn!(error = %err, "control query failed, exposing no controls");
            Vec::new()
        });
        let controls: Vec<_> = descriptions.iter().filter_map(describe).collect();
        let menus = descriptions.iter().flat_map(menu_entries).collect();

        info!(
            index,
            card = %capabilities.card,
            width = size.width,
            height = size.height,
            controls = controls.len(),
            "opened V4L2 device"
        );

        Ok(Self {
            index,
            device,
            capabilities,
            controls,
            menus,
            size,
            capture: None,
        })
    }

    fn descriptor(&self, id: ControlId) -> Result<&ControlDescriptor> {
        self.controls
            .iter()
            .find(|desc| desc.id == id)
            .ok_or(SessionError::InvalidControl(id))
    }

    fn spawn_capture(&self, producer: FrameProducer) -> Result<CaptureThread> {
        let stop = Arc::new(AtomicBool::new(false));
        let (ready_tx, ready_rx) = bounded(1);
        let index = self.index;

        let handle = {
            let stop = Arc::clone(&stop);
            thread::Builder::new()
                .name(format!("v4l2-capture-{index}"))
                .spawn(move || capture_loop(index, &producer, &stop, &ready_tx))?
        };

        match ready_rx.recv() {
            Ok(Ok(())) => Ok(CaptureThread { stop, handle }),
            Ok(Err(err)) => {
                let _ = handle.join();
                Err(err)
            }
            Err(_) => {
                let _ = handle.join();
                Err(SessionError::ThreadPanicked("v4l2 capture"))
            }
        }
    }
}

/// Map a V4L2 control description onto the session vocabulary.
fn describe(desc: &control::Description) -> Option<ControlDescriptor> {
    let (id, _) = CID_MAP.iter().find(|(_, cid)| *cid == desc.id)?;
    let kind = if desc.flags.contains(control::Flags::READ_ONLY) {
        ControlType::ReadOnly
    } else {
        match desc.typ {
            control::Type::Integer => ControlType::Int32,
            control::Type::Integer64 => ControlType::Int64,
            control::Type::Boolean => ControlType::Boolean,
            control::Type::Menu | control::Type::IntegerMenu => ControlType::Menu,
            _ => return None,
        }
    };
    let step = i64::try_from(desc.step).unwrap_or(1);
    Some(
        ControlDescriptor::ranged(*id, kind, desc.minimum, desc.maximum, desc.default)
            .with_step(step),
    )
}

/// Labels of a mapped menu control.
fn menu_entries(desc: &control::Description) -> Vec<(ControlId, u32, String)> {
    let Some((id, _)) = CID_MAP.iter().find(|(_, cid)| *cid == desc.id) else {
        return Vec::new();
    };
    desc.items
        .iter()
        .flatten()
        .map(|(index, item)| (*id, *index, menu_label(item)))
        .collect()
}

fn capture_loop(
    index: usize,
    producer: &FrameProducer,
    stop: &AtomicBool,
    ready: &Sender<Result<()>>,
) {
    let device = match Device::new(index) {
        Ok(device) => device,
        Err(err) => {
            let _ = ready.send(Err(io_error(&err)));
            return;
        }
    };
    let mut stream = match Stream::with_buffers(&device, Type::VideoCapture, DRIVER_BUFFERS) {
        Ok(stream) => stream,
        Err(err) => {
            let _ = ready.send(Err(io_error(&err)));
            return;
        }
    };
    stream.set_timeout(POLL_TIMEOUT);
    let _ = ready.send(Ok(()));

    let mut frames = 0u64;
    while !stop.load(Ordering::Acquire) {
        match stream.next() {
            Ok((buf, meta)) => {
                let used = (meta.bytesused as usize).min(buf.len());
                producer.on_frame(buf.get(..used).unwrap_or(buf));
                frames += 1;
            }
            Err(err) if err.kind() == io::ErrorKind::TimedOut => {}
            Err(err) => {
                warn!(index, error = %err, "capture stream failed");
                break;
            }
        }
    }
    debug!(index, frames, "capture thread stopped");
}

impl CameraDevice for V4L2Device {
    fn capabilities(&self) -> &DeviceCapabilities {
        &self.capabilities
    }

    fn controls(&self) -> &[ControlDescriptor] {
        &self.controls
    }

    fn frame_size(&self) -> FrameSize {
        self.size
    }

    fn apply_control(&mut self, id: ControlId, value: &ControlValue) -> Result<()> {
        let desc = self.descriptor(id)?;
        let value = match value {
            ControlValue::Int32(v) | ControlValue::Menu(v) | ControlValue::Discrete(v) => {
                Value::Integer(i64::from(*v))
            }
            ControlValue::Int64(v) => Value::Integer(*v),
            ControlValue::Boolean(v) => Value::Boolean(*v),
            ControlValue::String(v) => Value::String(v.clone()),
            ControlValue::ReadOnly(_) => {
                return Err(SessionError::InvalidControlType {
                    control: id,
                    expected: desc.kind,
                    actual: ControlType::ReadOnly,
                })
            }
        };

        self.device
            .set_control(Control { id: cid(id)?, value })
            .map_err(|err| io_error(&err))
    }

    fn read_control(&mut self, id: ControlId) -> Result<ControlValue> {
        let kind = self.descriptor(id)?.kind;
        let control = self.device.control(cid(id)?).map_err(|err| io_error(&err))?;
        let narrow = |v: i64| {
            i32::try_from(v).map_err(|_| SessionError::OutOfRange { control: id, value: v })
        };

        match (kind, control.value) {
            (ControlType::Boolean, Value::Boolean(v)) => Ok(ControlValue::Boolean(v)),
            (ControlType::Boolean, Value::Integer(v)) => Ok(ControlValue::Boolean(v != 0)),
            (ControlType::Int64, Value::Integer(v)) => Ok(ControlValue::Int64(v)),
            (ControlType::ReadOnly, Value::Integer(v)) => Ok(ControlValue::ReadOnly(v)),
            (ControlType::Menu, Value::Integer(v)) => narrow(v).map(ControlValue::Menu),
            (_, Value::Integer(v)) => narrow(v).map(ControlValue::Int32),
            (_, Value::String(v)) => Ok(ControlValue::String(v)),
            (_, other) => Err(SessionError::DeviceIo(format!(
                "unsupported value {other:?} for control {id}"
            ))),
        }
    }

    fn apply_resolution(&mut self, size: FrameSize) -> Result<()> {
        let mut fmt = self.device.format().map_err(|err| io_error(&err))?;
        fmt.width = size.width;
        fmt.height = size.height;

        let fmt = self.device.set_format(&fmt).map_err(|err| io_error(&err))?;
        self.size = FrameSize::new(fmt.width, fmt.height);
        if self.size != size {
            debug!(requested = ?size, actual = ?self.size, "driver adjusted resolution");
        }
        Ok(())
    }

    fn apply_roi(&mut self, _roi: Roi) -> Result<()> {
        Err(SessionError::InvalidCommand(
            "region of interest is not supported by V4L2 capture devices",
        ))
    }

    fn apply_frame_interval(&mut self, interval: Duration) -> Result<()> {
        let params = Parameters::new(Fraction::new(interval_micros(interval)?, 1_000_000));
        let params = self.device.set_params(&params).map_err(|err| io_error(&err))?;
        debug!(
            numerator = params.interval.numerator,
            denominator = params.interval.denominator,
            "frame interval applied"
        );
        Ok(())
    }

    fn menu_item(&mut self, id: ControlId, index: u32) -> Result<String> {
        if self.descriptor(id)?.kind != ControlType::Menu {
            return Err(SessionError::InvalidControl(id));
        }
        self.menus
            .iter()
            .find(|(control, entry, _)| *control == id && *entry == index)
            .map(|(_, _, label)| label.clone())
            .ok_or(SessionError::OutOfRange {
                control: id,
                value: i64::from(index),
            })
    }

    fn start_capture(&mut self, producer: &FrameProducer) -> Result<()> {
        if self.capture.is_some() {
            return Err(SessionError::InvalidCommand("capture already running"));
        }
        self.capture = Some(self.spawn_capture(producer.clone())?);
        Ok(())
    }

    fn stop_capture(&mut self) -> Result<()> {
        let Some(capture) = self.capture.take() else {
            return Ok(());
        };
        capture.stop.store(true, Ordering::Release);
        capture
            .handle
            .join()
            .map_err(|_| SessionError::ThreadPanicked("v4l2 capture"))
    }

    fn frame_source(&mut self) -> FrameSource<'_> {
        FrameSource::Hardware
    }

    fn close_device(&mut self) -> Result<()> {
        self.stop_capture()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cid_mapping() {
        assert_eq!(cid(ControlId::GAIN).expect("gain mapped"), 0x0098_0913);
        assert_eq!(
            cid(ControlId::EXPOSURE_ABSOLUTE).expect("exposure mapped"),
            0x009a_0902
        );
        assert!(matches!(
            cid(ControlId::DROPPED),
            Err(SessionError::InvalidControl(ControlId::DROPPED))
        ));
    }

    #[test]
    fn test_frame_interval_in_microseconds() {
        assert_eq!(
            interval_micros(Duration::from_millis(33)).expect("interval fits"),
            33_000
        );
        assert!(interval_micros(Duration::ZERO).is_err());
        assert!(interval_micros(Duration::from_secs(5_000)).is_err());
    }

    #[test]
    fn test_menu_labels() {
        assert_eq!(menu_label(&control::MenuItem::Name("50 Hz".to_owned())), "50 Hz");
        assert_eq!(menu_label(&control::MenuItem::Value(-3)), "-3");
    }

    #[test]
    fn test_cid_map_has_unique_entries() {
        for (i, (id, code)) in CID_MAP.iter().enumerate() {
            for (other_id, other_code) in CID_MAP.iter().skip(i + 1) {
                assert_ne!(id, other_id);
                assert_ne!(code, other_code);
            }
        }
    }
}
