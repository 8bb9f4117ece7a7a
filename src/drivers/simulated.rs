//! Simulated cameras for testing and bring-up.
//!
//! Three devices with the same configuration surface but different fills:
//! `uniform random` (noise), `radial sin` (animated interference pattern),
//! and `empty` (frames at maximum rate with the payload left untouched;
//! useful for stressing drop accounting). Frames are paced on the exposure
//! clock; `empty` is unpaced.

use std::time::Instant;

use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};
use tracing::{debug, warn};

use crate::device::{
    Camera, DeviceHandle, DeviceIdentifier, DeviceState, Driver, FrameInfo, FramePoll,
};
use crate::error::DeviceError;
use crate::properties::{
    CameraProperties, CameraPropertyMetadata, ImageShape, PropertyRange, SampleType,
    TriggerCapabilities,
};

/// Driver exposing the three simulated cameras.
pub struct SimulatedDriver;

const CAMERA_NAMES: [&str; 3] = [
    "simulated: uniform random",
    "simulated: radial sin",
    "simulated: empty",
];

impl Driver for SimulatedDriver {
    fn name(&self) -> &'static str {
        "simulated"
    }

    fn device_count(&self) -> usize {
        CAMERA_NAMES.len()
    }

    fn describe(&self, index: usize) -> Result<DeviceIdentifier, DeviceError> {
        CAMERA_NAMES
            .get(index)
            .map(|name| DeviceIdentifier::camera(*name))
            .ok_or(DeviceError::BadIndex {
                driver: "simulated".to_string(),
                index,
            })
    }

    fn open(&self, index: usize) -> Result<DeviceHandle, DeviceError> {
        let pattern = match index {
            0 => SimPattern::UniformRandom,
            1 => SimPattern::RadialSin,
            2 => SimPattern::Empty,
            _ => {
                return Err(DeviceError::BadIndex {
                    driver: "simulated".to_string(),
                    index,
                })
            }
        };
        Ok(DeviceHandle::Camera(Box::new(SimulatedCamera::new(pattern))))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SimPattern {
    UniformRandom,
    RadialSin,
    Empty,
}

/// Quantized sine period; the pattern fill avoids `sin` per pixel.
const SIN_TABLE_LEN: usize = 1024;
/// Phase advance per frame, in table steps (about 0.2 rad).
const PHASE_STEP: usize = 33;

pub struct SimulatedCamera {
    pattern: SimPattern,
    properties: CameraProperties,
    state: DeviceState,
    epoch: Option<Instant>,
    frames_emitted: u64,
    rng: StdRng,
    sin_table: Vec<f32>,
    /// Quantized radial phase per pixel, rebuilt when the shape changes.
    radius_table: Vec<u16>,
    radius_shape: (u32, u32),
    /// Set by `execute_trigger` when the software frame trigger is enabled.
    trigger_fired: bool,
}

impl SimulatedCamera {
    fn new(pattern: SimPattern) -> Self {
        let sin_table = (0..SIN_TABLE_LEN)
            .map(|i| {
                (i as f32 / SIN_TABLE_LEN as f32 * 2.0 * std::f32::consts::PI).sin()
            })
            .collect();
        Self {
            pattern,
            properties: CameraProperties::default(),
            state: DeviceState::AwaitingConfiguration,
            epoch: None,
            frames_emitted: 0,
            rng: StdRng::from_entropy(),
            sin_table,
            radius_table: Vec::new(),
            radius_shape: (0, 0),
            trigger_fired: false,
        }
    }

    fn supports(sample_type: SampleType) -> bool {
        matches!(
            sample_type,
            SampleType::U8 | SampleType::U16 | SampleType::I8 | SampleType::I16 | SampleType::F32
        )
    }

    /// Microseconds between frames under the applied properties.
    fn frame_period_us(&self) -> f64 {
        if self.pattern == SimPattern::Empty {
            return 0.0;
        }
        let readout =
            self.properties.line_interval_us as f64 * self.properties.shape.1 as f64;
        (self.properties.exposure_time_us as f64).max(1.0) + readout
    }

    fn software_trigger_enabled(&self) -> bool {
        self.properties.input_triggers.frame_start.enable
    }

    fn fill(&mut self, buffer: &mut [u8]) {
        let shape = self.shape();
        let nbytes = shape.bytes_of_image();
        match self.pattern {
            SimPattern::Empty => {}
            SimPattern::UniformRandom => self.rng.fill_bytes(&mut buffer[..nbytes]),
            SimPattern::RadialSin => self.fill_radial_sin(&mut buffer[..nbytes], &shape),
        }
    }

    /// Quantize each pixel's radial phase (`r * 0.1`) into sine-table steps.
    fn rebuild_radius_table(&mut self, width: u32, height: u32) {
        let cx = width as i64 / 2;
        let cy = height as i64 / 2;
        let steps_per_radian = SIN_TABLE_LEN as f32 / (2.0 * std::f32::consts::PI);
        self.radius_table = (0..height as i64)
            .flat_map(|y| (0..width as i64).map(move |x| (x, y)))
            .map(|(x, y)| {
                let dx = (x - cx) as f32;
                let dy = (y - cy) as f32;
                let r = (dx * dx + dy * dy).sqrt();
                (r * 0.1 * steps_per_radian) as u32 as u16 % SIN_TABLE_LEN as u16
            })
            .collect();
        self.radius_shape = (width, height);
    }

    /// Animated interference rings: `sin(0.1 * r - phase)` per pixel, via the
    /// per-pixel radius table and a per-frame table of encoded samples.
    fn fill_radial_sin(&mut self, buffer: &mut [u8], shape: &ImageShape) {
        let (width, height) = (shape.dims.width, shape.dims.height);
        if self.radius_shape != (width, height) {
            self.rebuild_radius_table(width, height);
        }
        let phase = (self.frames_emitted as usize * PHASE_STEP) % SIN_TABLE_LEN;
        let sample_type = shape.sample_type;
        let width_bytes = sample_type.bytes();

        // Encode the whole sine period once per frame; the pixel loop is
        // then two lookups and a copy.
        let mut encoded = vec![0u8; SIN_TABLE_LEN * width_bytes];
        for (i, chunk) in encoded.chunks_exact_mut(width_bytes).enumerate() {
            let v = self.sin_table[(i + SIN_TABLE_LEN - phase) % SIN_TABLE_LEN];
            write_sample(chunk, sample_type, v);
        }

        for (pixel, chunk) in self
            .radius_table
            .iter()
            .zip(buffer.chunks_exact_mut(width_bytes))
        {
            let index = *pixel as usize * width_bytes;
            chunk.copy_from_slice(&encoded[index..index + width_bytes]);
        }
    }
}

/// Encode a normalized [-1, 1] value as one sample.
fn write_sample(dst: &mut [u8], sample_type: SampleType, v: f32) {
    match sample_type {
        SampleType::U8 => dst[0] = ((v * 0.5 + 0.5) * u8::MAX as f32) as u8,
        SampleType::I8 => dst[0] = ((v * i8::MAX as f32) as i8) as u8,
        SampleType::U16 | SampleType::U10 | SampleType::U12 | SampleType::U14 => {
            dst[..2].copy_from_slice(&(((v * 0.5 + 0.5) * u16::MAX as f32) as u16).to_ne_bytes());
        }
        SampleType::I16 => {
            dst[..2].copy_from_slice(&((v * i16::MAX as f32) as i16).to_ne_bytes());
        }
        SampleType::F32 => dst[..4].copy_from_slice(&v.to_ne_bytes()),
    }
}

impl Camera for SimulatedCamera {
    fn set(&mut self, properties: &CameraProperties) -> DeviceState {
        if properties.binning < 1 {
            warn!("Simulated camera rejects binning factor 0");
            return DeviceState::AwaitingConfiguration;
        }
        if properties.shape.0 == 0 || properties.shape.1 == 0 {
            warn!(
                "Simulated camera rejects empty shape {}x{}",
                properties.shape.0, properties.shape.1
            );
            return DeviceState::AwaitingConfiguration;
        }
        if !Self::supports(properties.sample_type) {
            warn!(
                "Simulated camera does not produce {} samples",
                properties.sample_type
            );
            return DeviceState::AwaitingConfiguration;
        }

        let mut applied = properties.clone();
        // The simulator has no lower bound on exposure but never reports a
        // non-positive one back.
        applied.exposure_time_us = applied.exposure_time_us.max(1e-3);
        self.properties = applied;
        if self.state == DeviceState::AwaitingConfiguration {
            self.state = DeviceState::Armed;
        }
        debug!(
            "Simulated camera configured: {}x{} {} exposure {} us",
            self.properties.shape.0,
            self.properties.shape.1,
            self.properties.sample_type,
            self.properties.exposure_time_us
        );
        self.state
    }

    fn get(&self, properties: &mut CameraProperties) {
        *properties = self.properties.clone();
    }

    fn get_meta(&self, metadata: &mut CameraPropertyMetadata) {
        let writable = |low: f32, high: f32| PropertyRange {
            low,
            high,
            writable: true,
        };
        *metadata = CameraPropertyMetadata {
            exposure_time_us: writable(0.0, 1e7),
            line_interval_us: writable(0.0, 1e4),
            binning: writable(1.0, 8.0),
            offset: (writable(0.0, 8192.0), writable(0.0, 8192.0)),
            shape: (writable(1.0, 8192.0), writable(1.0, 8192.0)),
            supported_pixel_types: SampleType::U8.bit()
                | SampleType::U16.bit()
                | SampleType::I8.bit()
                | SampleType::I16.bit()
                | SampleType::F32.bit(),
            digital_lines: vec!["software".to_string()],
            triggers: crate::properties::TriggersMetadata {
                frame_start: TriggerCapabilities { input: 1, output: 0 },
                ..Default::default()
            },
        };
    }

    fn shape(&self) -> ImageShape {
        ImageShape::packed(
            self.properties.shape.0,
            self.properties.shape.1,
            self.properties.sample_type,
        )
    }

    fn start(&mut self) -> DeviceState {
        if self.state != DeviceState::Armed {
            return self.state;
        }
        self.epoch = Some(Instant::now());
        self.frames_emitted = 0;
        self.trigger_fired = false;
        self.state = DeviceState::Running;
        self.state
    }

    fn stop(&mut self) -> DeviceState {
        if self.state == DeviceState::Running {
            self.state = DeviceState::Armed;
        }
        self.epoch = None;
        self.state
    }

    fn execute_trigger(&mut self) {
        if self.software_trigger_enabled() {
            self.trigger_fired = true;
        }
    }

    fn get_frame(
        &mut self,
        buffer: &mut [u8],
        info: &mut FrameInfo,
    ) -> Result<FramePoll, DeviceError> {
        if self.state != DeviceState::Running {
            return Err(DeviceError::BadTransition {
                name: "simulated".to_string(),
                action: "get_frame",
                state: self.state.as_str(),
            });
        }
        let epoch = self.epoch.expect("running camera has an epoch");

        if self.software_trigger_enabled() {
            if !self.trigger_fired {
                return Ok(FramePoll::Again);
            }
        } else {
            let due_us = self.frame_period_us() * (self.frames_emitted + 1) as f64;
            if (epoch.elapsed().as_micros() as f64) < due_us {
                return Ok(FramePoll::Again);
            }
        }

        let shape = self.shape();
        let nbytes = shape.bytes_of_image();
        assert!(
            buffer.len() >= nbytes,
            "frame buffer too small: {} < {}",
            buffer.len(),
            nbytes
        );

        self.fill(buffer);
        *info = FrameInfo {
            shape,
            hardware_timestamp: epoch.elapsed().as_nanos() as u64,
        };
        self.frames_emitted += 1;
        self.trigger_fired = false;
        Ok(FramePoll::Ready { nbytes })
    }
}
