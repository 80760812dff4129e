//! Graphics, input, sound and entropy devices.
//!
//! These have no runtime surface; they only shape the configuration.

use crate::host::Feature;
use vmbridge_core::error::{BridgeError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Scanout {
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MacDisplay {
    pub width: u32,
    pub height: u32,
    pub pixels_per_inch: u32,
}

/// Graphics device configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GraphicsDeviceConfiguration {
    Virtio { scanouts: Vec<Scanout> },
    Mac { displays: Vec<MacDisplay> },
}

impl GraphicsDeviceConfiguration {
    /// Virtio GPU with a single scanout.
    pub fn virtio(width: u32, height: u32) -> Result<Self> {
        check_dimensions(width, height)?;
        Ok(GraphicsDeviceConfiguration::Virtio {
            scanouts: vec![Scanout { width, height }],
        })
    }

    /// Mac graphics with a single display.
    pub fn mac(width: u32, height: u32, pixels_per_inch: u32) -> Result<Self> {
        check_dimensions(width, height)?;
        if pixels_per_inch == 0 {
            return Err(BridgeError::ConfigInvalid {
                violations: vec!["display pixels per inch must be positive".to_string()],
            });
        }
        Ok(GraphicsDeviceConfiguration::Mac {
            displays: vec![MacDisplay {
                width,
                height,
                pixels_per_inch,
            }],
        })
    }

    pub(crate) fn required_feature(&self) -> Feature {
        match self {
            GraphicsDeviceConfiguration::Virtio { .. } => Feature::VirtioGraphics,
            GraphicsDeviceConfiguration::Mac { .. } => Feature::GraphicsDevice,
        }
    }
}

fn check_dimensions(width: u32, height: u32) -> Result<()> {
    if width == 0 || height == 0 {
        return Err(BridgeError::ConfigInvalid {
            violations: vec![format!("display size {width}x{height} must be non-zero")],
        });
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyboardConfiguration {
    Usb,
    Mac,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PointingDeviceConfiguration {
    UsbScreenCoordinate,
    MacTrackpad,
}

/// Audio stream direction, bound to the host's default devices.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SoundStream {
    HostInput,
    HostOutput,
}

/// Virtio sound device.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SoundDeviceConfiguration {
    streams: Vec<SoundStream>,
}

impl SoundDeviceConfiguration {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_stream(mut self, stream: SoundStream) -> Self {
        self.streams.push(stream);
        self
    }

    pub fn streams(&self) -> &[SoundStream] {
        &self.streams
    }
}

/// Virtio entropy source.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EntropyDeviceConfiguration;
