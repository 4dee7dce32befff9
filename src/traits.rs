//! Core types and collaborator traits for the camera session.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, SessionError};
use crate::producer::FrameProducer;

/// Identifier of a device control (gain, exposure, ...).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ControlId(pub u32);

impl ControlId {
    /// Image brightness.
    pub const BRIGHTNESS: Self = Self(1);
    /// Image contrast.
    pub const CONTRAST: Self = Self(2);
    /// Gamma correction.
    pub const GAMMA: Self = Self(7);
    /// Sensor gain.
    pub const GAIN: Self = Self(10);
    /// Horizontal flip.
    pub const HFLIP: Self = Self(13);
    /// Vertical flip.
    pub const VFLIP: Self = Self(14);
    /// Absolute exposure time in microseconds.
    pub const EXPOSURE_ABSOLUTE: Self = Self(27);
    /// Mains frequency compensation (menu).
    pub const POWER_LINE_FREQUENCY: Self = Self(33);
    /// Sensor temperature (read-only).
    pub const TEMPERATURE: Self = Self(40);
    /// Pixel binning factor.
    pub const BINNING: Self = Self(45);
    /// Frames dropped by the session since the last reset (read-only).
    pub const DROPPED: Self = Self(60);
    /// Writing any boolean resets the dropped-frame counter.
    pub const DROPPED_RESET: Self = Self(61);
    /// Output frame format.
    pub const FRAME_FORMAT: Self = Self(112);

    /// Whether the session answers this control itself instead of the device.
    #[must_use]
    pub const fn is_session_control(self) -> bool {
        self.0 == Self::DROPPED.0 || self.0 == Self::DROPPED_RESET.0
    }
}

impl fmt::Display for ControlId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Declared type of a control.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlType {
    /// 32-bit integer.
    Int32,
    /// 64-bit integer.
    Int64,
    /// On/off switch.
    Boolean,
    /// Index into a menu.
    Menu,
    /// One of a fixed set of values.
    Discrete,
    /// Value that can be read but never written.
    ReadOnly,
    /// Free-form string.
    String,
}

/// Typed value carried by control commands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlValue {
    /// 32-bit integer value.
    Int32(i32),
    /// 64-bit integer value.
    Int64(i64),
    /// Boolean value.
    Boolean(bool),
    /// Menu index.
    Menu(i32),
    /// Discrete value.
    Discrete(i32),
    /// Read-only value as reported by the device.
    ReadOnly(i64),
    /// String value.
    String(String),
}

impl ControlValue {
    /// The type tag of this value.
    #[must_use]
    pub const fn kind(&self) -> ControlType {
        match self {
            Self::Int32(_) => ControlType::Int32,
            Self::Int64(_) => ControlType::Int64,
            Self::Boolean(_) => ControlType::Boolean,
            Self::Menu(_) => ControlType::Menu,
            Self::Discrete(_) => ControlType::Discrete,
            Self::ReadOnly(_) => ControlType::ReadOnly,
            Self::String(_) => ControlType::String,
        }
    }

    /// Numeric view of the value, if it has one.
    #[must_use]
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int32(v) | Self::Menu(v) | Self::Discrete(v) => Some(i64::from(*v)),
            Self::Int64(v) | Self::ReadOnly(v) => Some(*v),
            Self::Boolean(v) => Some(i64::from(*v)),
            Self::String(_) => None,
        }
    }
}

/// Bounds and type information for one control.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlDescriptor {
    /// Control identifier.
    pub id: ControlId,
    /// Declared value type.
    pub kind: ControlType,
    /// Minimum accepted value.
    pub min: i64,
    /// Maximum accepted value.
    pub max: i64,
    /// Step between accepted values (0 disables the step check).
    pub step: i64,
    /// Default value.
    pub default: i64,
    /// Accepted values for discrete controls.
    pub allowed: Vec<i64>,
}

impl ControlDescriptor {
    /// Create a ranged descriptor.
    #[must_use]
    pub const fn ranged(id: ControlId, kind: ControlType, min: i64, max: i64, default: i64) -> Self {
        Self {
            id,
            kind,
            min,
            max,
            step: 1,
            default,
            allowed: Vec::new(),
        }
    }

    /// Create a boolean descriptor.
    #[must_use]
    pub const fn boolean(id: ControlId, default: bool) -> Self {
        Self::ranged(id, ControlType::Boolean, 0, 1, default as i64)
    }

    /// Create a read-only descriptor.
    #[must_use]
    pub const fn read_only(id: ControlId) -> Self {
        Self::ranged(id, ControlType::ReadOnly, i64::MIN, i64::MAX, 0)
    }

    /// Create a discrete descriptor accepting only `allowed`.
    #[must_use]
    pub fn discrete(id: ControlId, allowed: Vec<i64>, default: i64) -> Self {
        let min = allowed.iter().copied().min().unwrap_or(default);
        let max = allowed.iter().copied().max().unwrap_or(default);
        Self {
            id,
            kind: ControlType::Discrete,
            min,
            max,
            step: 0,
            default,
            allowed,
        }
    }

    /// Set the step between accepted values.
    #[must_use]
    pub const fn with_step(mut self, step: i64) -> Self {
        self.step = step;
        self
    }

    /// Check whether `value` may be written to this control.
    pub fn check(&self, value: &ControlValue) -> Result<()> {
        if self.kind == ControlType::ReadOnly || value.kind() != self.kind {
            return Err(SessionError::InvalidControlType {
                control: self.id,
                expected: self.kind,
                actual: value.kind(),
            });
        }

        let Some(raw) = value.as_i64() else {
            return Ok(());
        };

        let accepted = match self.kind {
            ControlType::Boolean => true,
            ControlType::Discrete if !self.allowed.is_empty() => self.allowed.contains(&raw),
            _ => {
                let offset = i128::from(raw) - i128::from(self.min);
                raw >= self.min
                    && raw <= self.max
                    && (self.step <= 0 || offset % i128::from(self.step) == 0)
            }
        };

        if accepted {
            Ok(())
        } else {
            Err(SessionError::OutOfRange {
                control: self.id,
                value: raw,
            })
        }
    }
}

/// Frame dimensions in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct FrameSize {
    /// Frame width in pixels.
    pub width: u32,
    /// Frame height in pixels.
    pub height: u32,
}

impl FrameSize {
    /// Create a new frame size.
    #[must_use]
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// Bytes needed for one frame at `bytes_per_pixel`.
    #[must_use]
    pub const fn frame_len(self, bytes_per_pixel: usize) -> usize {
        self.width as usize * self.height as usize * bytes_per_pixel
    }
}

/// Region of interest within the sensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Roi {
    /// Left edge in pixels.
    pub x: u32,
    /// Top edge in pixels.
    pub y: u32,
    /// Region width in pixels.
    pub width: u32,
    /// Region height in pixels.
    pub height: u32,
}

impl Roi {
    /// Create a new region of interest.
    #[must_use]
    pub const fn new(x: u32, y: u32, width: u32, height: u32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    /// Size of frames produced with this region.
    #[must_use]
    pub const fn size(self) -> FrameSize {
        FrameSize::new(self.width, self.height)
    }
}

/// Static description of an opened device.
#[derive(Debug, Clone, Default)]
pub struct DeviceCapabilities {
    /// Driver name.
    pub driver: String,
    /// Card/device name.
    pub card: String,
    /// Bus information.
    pub bus_info: String,
    /// Largest frame the device can produce.
    pub max_size: FrameSize,
    /// Bytes per pixel in the output format.
    pub bytes_per_pixel: usize,
}

impl DeviceCapabilities {
    /// Length of the largest frame the device can produce.
    #[must_use]
    pub const fn max_frame_len(&self) -> usize {
        self.max_size.frame_len(self.bytes_per_pixel)
    }
}

/// Metadata for a delivered frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameMetadata {
    /// Frame sequence number. Dropped frames still consume a number.
    pub sequence: u64,
    /// Time since the session was opened.
    pub timestamp: Duration,
    /// Bytes of valid data in the buffer.
    pub bytes_used: usize,
    /// Geometry the frame was produced with.
    pub size: FrameSize,
}

/// A device that renders frames on demand, paced by the session.
pub trait SyntheticSource: Send {
    /// Time between consecutive frames.
    fn frame_interval(&self) -> Duration;

    /// Render the next frame into `buf`, returning the bytes written.
    fn fill_frame(&mut self, buf: &mut [u8]) -> Result<usize>;
}

/// How frames reach the session.
pub enum FrameSource<'a> {
    /// The controller renders one frame per turn while streaming.
    Synthetic(&'a mut dyn SyntheticSource),
    /// The device pushes frames from its own thread through the
    /// [`FrameProducer`] handed to [`CameraDevice::start_capture`].
    Hardware,
}

/// An opened camera, driven exclusively from the controller thread.
pub trait CameraDevice: Send + 'static {
    /// Get device capabilities.
    fn capabilities(&self) -> &DeviceCapabilities;

    /// Descriptors of every control the device exposes.
    fn controls(&self) -> &[ControlDescriptor];

    /// Current frame geometry.
    fn frame_size(&self) -> FrameSize;

    /// Write a control value.
    fn apply_control(&mut self, id: ControlId, value: &ControlValue) -> Result<()>;

    /// Read a control value.
    fn read_control(&mut self, id: ControlId) -> Result<ControlValue>;

    /// Change the output resolution. Only called while capture is stopped.
    fn apply_resolution(&mut self, size: FrameSize) -> Result<()>;

    /// Change the region of interest. Only called while capture is stopped.
    fn apply_roi(&mut self, roi: Roi) -> Result<()>;

    /// Change the time between frames. Only called while capture is stopped.
    fn apply_frame_interval(&mut self, interval: Duration) -> Result<()>;

    /// Label of entry `index` of a menu control.
    fn menu_item(&mut self, id: ControlId, index: u32) -> Result<String>;

    /// Start capturing. Hardware sources keep a clone of `producer` and
    /// feed it until [`CameraDevice::stop_capture`] returns.
    fn start_capture(&mut self, producer: &FrameProducer) -> Result<()>;

    /// Stop capturing. No frame may be pushed after this returns.
    fn stop_capture(&mut self) -> Result<()>;

    /// How this device produces frames.
    fn frame_source(&mut self) -> FrameSource<'_>;

    /// Release the device. Called once when the session closes.
    fn close_device(&mut self) -> Result<()>;
}

/// Opens devices for a back-end.
pub trait CameraBackend {
    /// The device type this back-end opens.
    type Device: CameraDevice;

    /// Open the device.
    fn open_device(&self) -> Result<Self::Device>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ranged_check_honours_bounds_and_step() {
        let desc =
            ControlDescriptor::ranged(ControlId::GAIN, ControlType::Int32, 10, 50, 20).with_step(5);

        assert!(desc.check(&ControlValue::Int32(10)).is_ok());
        assert!(desc.check(&ControlValue::Int32(45)).is_ok());
        assert!(matches!(
            desc.check(&ControlValue::Int32(12)),
            Err(SessionError::OutOfRange { value: 12, .. })
        ));
        assert!(matches!(
            desc.check(&ControlValue::Int32(55)),
            Err(SessionError::OutOfRange { .. })
        ));
        assert!(matches!(
            desc.check(&ControlValue::Int64(20)),
            Err(SessionError::InvalidControlType { .. })
        ));
    }

    #[test]
    fn test_full_width_range_does_not_overflow() {
        let desc = ControlDescriptor::ranged(
            ControlId::EXPOSURE_ABSOLUTE,
            ControlType::Int64,
            i64::MIN,
            i64::MAX,
            0,
        );

        assert!(desc.check(&ControlValue::Int64(1)).is_ok());
        assert!(desc.check(&ControlValue::Int64(i64::MAX)).is_ok());
        assert!(desc.check(&ControlValue::Int64(i64::MIN)).is_ok());

        let even = desc.with_step(2);
        assert!(even.check(&ControlValue::Int64(i64::MAX - 1)).is_ok());
        assert!(matches!(
            even.check(&ControlValue::Int64(i64::MAX)),
            Err(SessionError::OutOfRange { .. })
        ));
    }

    #[test]
    fn test_read_only_rejects_writes() {
        let desc = ControlDescriptor::read_only(ControlId::TEMPERATURE);
        assert!(matches!(
            desc.check(&ControlValue::ReadOnly(1)),
            Err(SessionError::InvalidControlType { .. })
        ));
    }
}
