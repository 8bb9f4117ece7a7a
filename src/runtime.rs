//! Runtime controller: owns the streams and the device manager, and
//! sequences `configure -> start -> stop/abort -> shutdown`.
//!
//! All entry points are synchronous and run on the caller's thread; the
//! producer and consumer tasks they coordinate are OS threads owned by the
//! per-stream pipeline. The monitor tap (`map_read`/`unmap_read`) also runs
//! on the caller's thread.

use std::sync::Arc;

use tracing::{info, warn};

use crate::device::Driver;
use crate::error::{Result, RuntimeError};
use crate::frame::MappedFrames;
use crate::manager::DeviceManager;
use crate::pipeline::{PipelineOutcome, StreamPipeline};
use crate::properties::{RuntimeMetadata, RuntimeProperties, MAX_VIDEO_STREAMS};
use crate::reconcile::{self, StreamDevices};
use crate::report::Reporter;
use crate::ring::FrameRing;

/// Ring slots per stream. A power of two; the ring rounds up anyway.
const QUEUE_DEPTH: usize = 16;

/// Controller state machine.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
enum RuntimeState {
    /// Initialized, nothing configured yet.
    #[default]
    Idle,
    /// At least one configure has been applied since init.
    Configured,
    /// Stopped after a run; devices are armed and can start again.
    Armed,
    Running,
}

impl RuntimeState {
    const fn as_str(self) -> &'static str {
        match self {
            RuntimeState::Idle => "Idle",
            RuntimeState::Configured => "Configured",
            RuntimeState::Armed => "Armed",
            RuntimeState::Running => "Running",
        }
    }
}

/// Live or final accounting of one stream's acquisition.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StreamProgress {
    pub frames_written: u64,
    pub frames_dropped: u64,
    pub frames_appended: u64,
    /// True once the producer has committed its final frame.
    pub finished: bool,
}

#[derive(Default)]
struct StreamSlot {
    devices: StreamDevices,
    ring: Option<Arc<FrameRing>>,
    frame_bytes: usize,
    pipeline: Option<StreamPipeline>,
    last_outcome: Option<PipelineOutcome>,
    failed: bool,
}

/// The multi-stream acquisition runtime.
pub struct Runtime {
    manager: DeviceManager,
    streams: Vec<StreamSlot>,
    applied: RuntimeProperties,
    state: RuntimeState,
    reporter: Option<Reporter>,
}

impl Runtime {
    /// Initialize the runtime: build the device manager over the built-in
    /// drivers.
    pub fn new() -> Result<Self> {
        Self::init(None)
    }

    /// Initialize with a host log reporter; every runtime-emitted line,
    /// including `Dropped <N>` loss reports, is delivered to it.
    pub fn with_reporter(reporter: Reporter) -> Result<Self> {
        Self::init(Some(reporter))
    }

    /// Initialize over a caller-supplied driver set instead of the built-in
    /// registry, e.g. to add vendor drivers.
    pub fn with_drivers(drivers: Vec<Arc<dyn Driver>>) -> Result<Self> {
        Ok(Self::from_manager(DeviceManager::new(drivers)?, None))
    }

    fn init(reporter: Option<Reporter>) -> Result<Self> {
        Ok(Self::from_manager(
            DeviceManager::with_default_drivers()?,
            reporter,
        ))
    }

    fn from_manager(manager: DeviceManager, reporter: Option<Reporter>) -> Self {
        info!(
            "Runtime initialized with {} devices across {} stream slots",
            manager.device_count(),
            MAX_VIDEO_STREAMS
        );
        Self {
            manager,
            streams: (0..MAX_VIDEO_STREAMS).map(|_| StreamSlot::default()).collect(),
            applied: RuntimeProperties::default(),
            state: RuntimeState::Idle,
            reporter,
        }
    }

    pub fn device_manager(&self) -> &DeviceManager {
        &self.manager
    }

    /// Apply a requested configuration.
    ///
    /// `properties` is in-out: identifiers are resolved and device-chosen
    /// values are written back, so a following [`Runtime::get_configuration`]
    /// returns exactly what was applied.
    pub fn configure(&mut self, properties: &mut RuntimeProperties) -> Result<()> {
        if self.state == RuntimeState::Running {
            return Err(RuntimeError::InvalidState {
                call: "configure",
                state: self.state.as_str(),
            }
            .into());
        }

        for (index, requested) in properties.streams.iter_mut().enumerate() {
            let slot = &mut self.streams[index];
            match reconcile::configure_stream(&self.manager, &mut slot.devices, requested, index)? {
                Some(frame_bytes) => {
                    if slot.ring.is_none() || slot.frame_bytes != frame_bytes {
                        slot.ring = Some(FrameRing::with_frame_size(frame_bytes, QUEUE_DEPTH)?);
                        slot.frame_bytes = frame_bytes;
                    }
                    slot.failed = false;
                }
                None => {
                    slot.ring = None;
                    slot.frame_bytes = 0;
                }
            }
        }

        self.applied = properties.clone();
        self.state = match self.state {
            RuntimeState::Armed => RuntimeState::Armed,
            _ => RuntimeState::Configured,
        };
        Ok(())
    }

    /// The applied configuration, including device-chosen values.
    pub fn get_configuration(&self) -> RuntimeProperties {
        self.applied.clone()
    }

    /// Observable ranges and capability flags for every configured stream.
    pub fn configuration_metadata(&self) -> RuntimeMetadata {
        let mut metadata = RuntimeMetadata::default();
        for (index, slot) in self.streams.iter().enumerate() {
            metadata.streams[index] = reconcile::stream_metadata(&slot.devices);
        }
        metadata
    }

    /// Transition every configured device to `Running` and spawn the
    /// producer/consumer pair for each active stream.
    pub fn start(&mut self) -> Result<()> {
        match self.state {
            RuntimeState::Running => return Err(RuntimeError::AlreadyRunning.into()),
            RuntimeState::Configured | RuntimeState::Armed => {}
            RuntimeState::Idle => {
                return Err(RuntimeError::InvalidState {
                    call: "start",
                    state: self.state.as_str(),
                }
                .into())
            }
        }
        if !self.streams.iter().any(|slot| slot.devices.is_active()) {
            return Err(RuntimeError::NotConfigured.into());
        }
        for (index, slot) in self.streams.iter().enumerate() {
            if slot.devices.is_active() && slot.failed {
                return Err(RuntimeError::StreamFailed { index }.into());
            }
        }

        let mut failure = None;
        for (index, slot) in self.streams.iter_mut().enumerate() {
            if !slot.devices.is_active() {
                continue;
            }
            if let Err(e) =
                Self::start_stream(index, slot, &self.applied, self.reporter.clone())
            {
                failure = Some(e);
                break;
            }
        }

        // A stream that failed to start takes the ones already started down
        // with it; a partially running acquisition is not a state. Teardown
        // mirrors abort: rings are emptied so a retried start cannot replay
        // this run's frames into the next one.
        if let Some(e) = failure {
            for (index, slot) in self.streams.iter_mut().enumerate() {
                if let Some(pipeline) = slot.pipeline.take() {
                    pipeline.request_abort();
                    let outcome = pipeline.join();
                    Self::stop_devices(index, slot);
                    if let Some(ring) = &slot.ring {
                        ring.discard_all();
                    }
                    warn!(
                        "[stream {}] torn down after failed start ({} frames)",
                        index, outcome.frames_written
                    );
                    slot.failed |= outcome.failed;
                    slot.last_outcome = Some(outcome);
                }
            }
            return Err(e);
        }

        self.state = RuntimeState::Running;
        Ok(())
    }

    fn start_stream(
        index: usize,
        slot: &mut StreamSlot,
        applied: &RuntimeProperties,
        reporter: Option<Reporter>,
    ) -> Result<()> {
        let camera = Arc::clone(slot.devices.camera.as_ref().expect("active stream"));
        let storage = Arc::clone(slot.devices.storage.as_ref().expect("active stream"));
        let ring = Arc::clone(slot.ring.as_ref().expect("configured ring"));

        // Sink first so frames have somewhere to land.
        storage.lock().start()?;
        if let Err(e) = camera.lock().start() {
            let _ = storage.lock().stop();
            return Err(e.into());
        }

        let stream_props = &applied.streams[index];
        slot.pipeline = Some(StreamPipeline::spawn(
            index,
            camera,
            storage,
            ring,
            stream_props.max_frame_count,
            stream_props.frame_average_count,
            reporter,
        ));
        info!(
            "[stream {}] started (max_frame_count {})",
            index, stream_props.max_frame_count
        );
        Ok(())
    }

    /// Graceful termination: the producer finishes its current frame, the
    /// consumer drains the ring, both tasks join, then the devices stop.
    /// A no-op when nothing is running.
    pub fn stop(&mut self) -> Result<()> {
        if self.state != RuntimeState::Running {
            return Ok(());
        }
        for slot in &self.streams {
            if let Some(pipeline) = &slot.pipeline {
                pipeline.request_stop();
            }
        }
        let mut first_failure = None;
        for (index, slot) in self.streams.iter_mut().enumerate() {
            if let Some(pipeline) = slot.pipeline.take() {
                let outcome = pipeline.join();
                Self::stop_devices(index, slot);
                info!(
                    "[stream {}] stopped: {} written, {} dropped, {} appended",
                    index, outcome.frames_written, outcome.frames_dropped, outcome.frames_appended
                );
                if outcome.failed {
                    slot.failed = true;
                    first_failure.get_or_insert(index);
                }
                slot.last_outcome = Some(outcome);
            }
        }
        self.state = RuntimeState::Armed;
        match first_failure {
            Some(index) => Err(RuntimeError::StreamFailed { index }.into()),
            None => Ok(()),
        }
    }

    /// Forced termination: both tasks are cancelled, the ring is emptied,
    /// queued frames are discarded. A no-op when nothing is running.
    pub fn abort(&mut self) -> Result<()> {
        if self.state != RuntimeState::Running {
            return Ok(());
        }
        for slot in &self.streams {
            if let Some(pipeline) = &slot.pipeline {
                pipeline.request_abort();
            }
        }
        for (index, slot) in self.streams.iter_mut().enumerate() {
            if let Some(pipeline) = slot.pipeline.take() {
                let outcome = pipeline.join();
                Self::stop_devices(index, slot);
                if let Some(ring) = &slot.ring {
                    ring.discard_all();
                }
                info!(
                    "[stream {}] aborted after {} frames",
                    index, outcome.frames_written
                );
                slot.failed |= outcome.failed;
                slot.last_outcome = Some(outcome);
            }
        }
        self.state = RuntimeState::Armed;
        Ok(())
    }

    /// Stop camera and storage after their tasks have joined. The producer
    /// has exited before the camera stops, which is what guarantees
    /// `get_frame` never overlaps `stop`.
    fn stop_devices(index: usize, slot: &mut StreamSlot) {
        if let Some(camera) = &slot.devices.camera {
            if let Err(e) = camera.lock().stop() {
                warn!("[stream {}] camera stop: {}", index, e);
            }
        }
        if let Some(storage) = &slot.devices.storage {
            if let Err(e) = storage.lock().stop() {
                warn!("[stream {}] storage stop: {}", index, e);
            }
        }
        if let Some(ring) = &slot.ring {
            ring.end();
        }
    }

    /// Fire stream `index`'s software trigger.
    pub fn execute_trigger(&self, index: usize) -> Result<()> {
        let slot = self.slot(index)?;
        let camera = slot
            .devices
            .camera
            .as_ref()
            .ok_or(RuntimeError::StreamInactive { index })?;
        camera.lock().execute_trigger();
        Ok(())
    }

    /// Map the monitor tap's readable region for stream `index`.
    ///
    /// The region is a copy with the ring's record layout and alignment;
    /// acknowledge it with [`Runtime::unmap_read`] and the region's consumed
    /// byte count. The monitor never gates the producer; a host that stops
    /// polling only loses its own view.
    pub fn map_read(&self, index: usize) -> Result<MappedFrames> {
        let slot = self.slot(index)?;
        let ring = slot
            .ring
            .as_ref()
            .ok_or(RuntimeError::StreamInactive { index })?;
        Ok(ring.monitor_map())
    }

    /// Advance the monitor cursor by `nbytes`; must be a multiple of 8.
    pub fn unmap_read(&self, index: usize, nbytes: usize) -> Result<()> {
        let slot = self.slot(index)?;
        let ring = slot
            .ring
            .as_ref()
            .ok_or(RuntimeError::StreamInactive { index })?;
        ring.monitor_unmap(nbytes)?;
        Ok(())
    }

    /// Live counters while running, the final outcome afterwards.
    pub fn stream_progress(&self, index: usize) -> Result<StreamProgress> {
        let slot = self.slot(index)?;
        if let Some(pipeline) = &slot.pipeline {
            return Ok(StreamProgress {
                frames_written: pipeline.frames_written(),
                frames_dropped: pipeline.frames_dropped(),
                frames_appended: pipeline.frames_appended(),
                finished: pipeline.producer_done(),
            });
        }
        let outcome = slot.last_outcome.unwrap_or_default();
        Ok(StreamProgress {
            frames_written: outcome.frames_written,
            frames_dropped: outcome.frames_dropped,
            frames_appended: outcome.frames_appended,
            finished: true,
        })
    }

    /// Abort anything running, release every device, unload the drivers.
    pub fn shutdown(mut self) -> Result<()> {
        self.teardown();
        Ok(())
    }

    fn slot(&self, index: usize) -> Result<&StreamSlot> {
        self.streams.get(index).ok_or_else(|| {
            RuntimeError::StreamOutOfRange {
                index,
                count: self.streams.len(),
            }
            .into()
        })
    }

    fn teardown(&mut self) {
        if self.state == RuntimeState::Running {
            if let Err(e) = self.abort() {
                warn!("abort during shutdown: {}", e);
            }
        }
        for slot in &mut self.streams {
            slot.devices.release();
            slot.ring = None;
        }
        self.manager.shutdown();
        self.state = RuntimeState::Idle;
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        self.teardown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{DeviceHandle, DeviceIdentifier, DeviceKind, DeviceState, Storage};
    use crate::error::DeviceError;
    use crate::frame::{align_up, FrameHeader};
    use crate::properties::{ImageShape, StorageProperties, StoragePropertyMetadata};
    use crate::properties::SampleType;
    use regex::Regex;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::time::{Duration, Instant};
    use tempfile::TempDir;

    fn configure_stream0(
        runtime: &mut Runtime,
        camera_pattern: &str,
        storage_pattern: &str,
        uri: Option<&str>,
        shape: (u32, u32),
        sample_type: SampleType,
        exposure_us: f32,
        max_frame_count: u64,
    ) -> RuntimeProperties {
        let manager = runtime.device_manager();
        let mut properties = runtime.get_configuration();
        properties.streams[0].camera.identifier = manager
            .select(DeviceKind::Camera, camera_pattern)
            .unwrap();
        properties.streams[0].storage.identifier = manager
            .select(DeviceKind::Storage, storage_pattern)
            .unwrap();
        if let Some(uri) = uri {
            properties.streams[0].storage.settings.set_uri(uri);
        }
        properties.streams[0].camera.settings.binning = 1;
        properties.streams[0].camera.settings.sample_type = sample_type;
        properties.streams[0].camera.settings.shape = shape;
        properties.streams[0].camera.settings.exposure_time_us = exposure_us;
        properties.streams[0].max_frame_count = max_frame_count;

        runtime.configure(&mut properties).unwrap();
        properties
    }

    fn drain_monitor_until(
        runtime: &Runtime,
        target: u64,
        deadline: Duration,
        mut inspect: impl FnMut(&crate::frame::FrameRef<'_>),
    ) -> u64 {
        let start = Instant::now();
        let mut nframes = 0u64;
        while nframes < target {
            assert!(
                start.elapsed() < deadline,
                "timeout with {nframes}/{target} frames"
            );
            let mapped = runtime.map_read(0).unwrap();
            for frame in mapped.frames() {
                inspect(&frame);
                nframes += 1;
            }
            let consumed = mapped.consumed_bytes();
            assert_eq!(consumed % 8, 0);
            runtime.unmap_read(0, consumed).unwrap();
            std::thread::sleep(Duration::from_millis(1));
        }
        nframes
    }

    #[test]
    fn test_identifier_reported_in_metadata() {
        let cameras = [
            "simulated: uniform random",
            "simulated: radial sin",
            "simulated: empty",
        ];
        let storages = ["raw", "tiff", "trash", "tiff-json"];
        let dir = TempDir::new().unwrap();

        for camera in cameras {
            for storage in storages {
                let mut runtime = Runtime::new().unwrap();
                let uri = dir.path().join("target");
                configure_stream0(
                    &mut runtime,
                    camera,
                    storage,
                    Some(uri.to_str().unwrap()),
                    (64, 48),
                    SampleType::U8,
                    1000.0,
                    8,
                );
                let metadata = runtime.configuration_metadata();
                assert_eq!(metadata.streams[0].camera_identifier.name, camera);
                assert_eq!(metadata.streams[0].storage_identifier.name, storage);
                runtime.shutdown().unwrap();
            }
        }
    }

    #[test]
    fn test_simcam_will_not_stall_on_radial_sin() {
        let dropped = Arc::new(AtomicU64::new(0));
        let reporter: Reporter = {
            let dropped = Arc::clone(&dropped);
            let pattern = Regex::new(r"Dropped\s*(\d+)").unwrap();
            Arc::new(move |record| {
                if let Some(captures) = pattern.captures(record.message) {
                    dropped.fetch_add(captures[1].parse::<u64>().unwrap(), Ordering::Relaxed);
                }
            })
        };
        let mut runtime = Runtime::with_reporter(reporter).unwrap();
        let frame_count = 100u64;
        configure_stream0(
            &mut runtime,
            "simulated.*sin*",
            "trash",
            None,
            (1920, 1080),
            SampleType::U16,
            1.0,
            frame_count,
        );

        // expected time to acquire at >= 3 fps, +100%
        let time_limit = Duration::from_secs_f64(frame_count as f64 / 3.0 * 2.0);
        runtime.start().unwrap();
        let nframes = drain_monitor_until(&runtime, frame_count, time_limit, |_| {});
        runtime.stop().unwrap();

        assert_eq!(nframes, frame_count);
        assert!(dropped.load(Ordering::Relaxed) < frame_count);
        runtime.shutdown().unwrap();
    }

    #[test]
    fn test_aligned_videoframe_pointers() {
        let mut runtime = Runtime::new().unwrap();
        // 33x47 u8 gives an odd row stride, exercising the alignment padding
        configure_stream0(
            &mut runtime,
            "simulated.*empty.*",
            "trash",
            None,
            (33, 47),
            SampleType::U8,
            1000.0,
            10,
        );

        runtime.start().unwrap();
        let expected_bytes = align_up(FrameHeader::SIZE + 33 * 47, 8) as u64;
        let mut next_id = 0u64;
        let nframes = drain_monitor_until(&runtime, 10, Duration::from_secs(30), |frame| {
            let header = frame.header();
            assert_eq!(frame.address() % 8, 0);
            assert_eq!(header.shape.bytes_of_image(), 33 * 47);
            assert_eq!(header.bytes_of_frame, expected_bytes);
            assert_eq!(header.frame_id, next_id);
            assert_eq!(header.shape.dims.width, 33);
            assert_eq!(header.shape.dims.height, 47);
            next_id += 1;
        });
        runtime.stop().unwrap();
        assert_eq!(nframes, 10);
        runtime.shutdown().unwrap();
    }

    #[test]
    fn test_switch_storage_identifier_across_runs() {
        let sequence = [
            "trash", "tiff", "trash", "raw", "trash", "tiff", "raw", "trash", "raw", "tiff",
        ];
        let dir = TempDir::new().unwrap();
        let frames = 32u64;
        let mut runtime = Runtime::new().unwrap();

        for (run, storage) in sequence.iter().enumerate() {
            let uri = match *storage {
                "tiff" => Some(dir.path().join(format!("run{run}.tif"))),
                "raw" => Some(dir.path().join(format!("run{run}.bin"))),
                _ => None,
            };
            configure_stream0(
                &mut runtime,
                "simulated.*empty.*",
                storage,
                uri.as_ref().map(|p| p.to_str().unwrap()),
                (64, 48),
                SampleType::U8,
                1.0,
                frames,
            );
            runtime.start().unwrap();
            let deadline = Instant::now() + Duration::from_secs(30);
            while !runtime.stream_progress(0).unwrap().finished {
                assert!(Instant::now() < deadline, "run {run} did not finish");
                std::thread::sleep(Duration::from_millis(1));
            }
            runtime.stop().unwrap();
            let progress = runtime.stream_progress(0).unwrap();
            assert_eq!(progress.frames_written, frames);
            assert_eq!(progress.frames_appended, frames);

            if let Some(path) = uri {
                let size = std::fs::metadata(&path).unwrap().len();
                match *storage {
                    "tiff" => assert!(size >= 64 * 48 * frames, "run {run}: {size}"),
                    "raw" => assert_eq!(
                        size,
                        (FrameHeader::SIZE as u64 + 64 * 48) * frames,
                        "run {run}"
                    ),
                    _ => unreachable!(),
                }
            }
        }
        runtime.shutdown().unwrap();
    }

    #[test]
    fn test_file_uri_round_trip() {
        let dir = TempDir::new().unwrap();
        let mut runtime = Runtime::new().unwrap();

        for (run, storage) in ["raw", "tiff", "tiff-json"].iter().enumerate() {
            let plain = dir.path().join(format!("plain{run}"));
            let prefixed = format!("file://{}", dir.path().join(format!("pre{run}")).display());
            for uri in [plain.to_str().unwrap().to_string(), prefixed] {
                configure_stream0(
                    &mut runtime,
                    "simulated: uniform random",
                    storage,
                    Some(&uri),
                    (16, 16),
                    SampleType::U8,
                    1000.0,
                    1,
                );
                let applied = runtime.get_configuration();
                let expected = uri.strip_prefix("file://").unwrap_or(&uri);
                assert_eq!(applied.streams[0].storage.settings.uri, expected);
            }
        }
        runtime.shutdown().unwrap();
    }

    #[test]
    fn test_repeat_start_without_monitor() {
        let mut runtime = Runtime::new().unwrap();
        for _ in 0..2 {
            configure_stream0(
                &mut runtime,
                "simulated.*empty.*",
                "trash",
                None,
                (2304, 2304),
                SampleType::U16,
                1000.0,
                500,
            );
            runtime.start().unwrap();
            runtime.stop().unwrap();
        }
        runtime.shutdown().unwrap();
    }

    #[test]
    fn test_lifecycle_misuse_is_rejected() {
        let mut runtime = Runtime::new().unwrap();

        // start before configure
        assert!(runtime.start().is_err());

        configure_stream0(
            &mut runtime,
            "simulated: uniform random",
            "trash",
            None,
            (32, 32),
            SampleType::U8,
            100.0,
            0,
        );
        runtime.start().unwrap();

        // start while running
        assert!(matches!(
            runtime.start(),
            Err(crate::error::ScopecamError::Runtime(
                RuntimeError::AlreadyRunning
            ))
        ));
        // configure while running must not mutate device state
        let mut properties = runtime.get_configuration();
        assert!(runtime.configure(&mut properties).is_err());

        runtime.stop().unwrap();
        // stop after stop is a no-op
        runtime.stop().unwrap();
        runtime.shutdown().unwrap();
    }

    #[test]
    fn test_configure_then_get_is_identity_on_caller_fields() {
        let mut runtime = Runtime::new().unwrap();
        let applied = configure_stream0(
            &mut runtime,
            "simulated: radial sin",
            "trash",
            None,
            (128, 96),
            SampleType::U16,
            500.0,
            42,
        );
        let read_back = runtime.get_configuration();
        assert_eq!(read_back, applied);
        assert_eq!(read_back.streams[0].max_frame_count, 42);
        assert_eq!(read_back.streams[0].camera.settings.shape, (128, 96));
        runtime.shutdown().unwrap();
    }

    #[test]
    fn test_default_devices_selected_on_configure() {
        let mut runtime = Runtime::new().unwrap();

        // camera unspecified, storage named
        let mut properties = runtime.get_configuration();
        properties.streams[0].storage.identifier =
            runtime.device_manager().select(DeviceKind::Storage, "trash").unwrap();
        runtime.configure(&mut properties).unwrap();
        assert_eq!(
            properties.streams[0].camera.identifier,
            DeviceIdentifier::camera("simulated: uniform random")
        );

        // storage unspecified, camera named
        let mut properties = RuntimeProperties::default();
        properties.streams[0].camera.identifier =
            runtime.device_manager().select(DeviceKind::Camera, "empty").unwrap();
        runtime.configure(&mut properties).unwrap();
        assert_eq!(
            properties.streams[0].storage.identifier,
            DeviceIdentifier::storage("trash")
        );

        // both unspecified stays unspecified
        let mut properties = RuntimeProperties::default();
        runtime.configure(&mut properties).unwrap();
        assert!(properties.streams[0].camera.identifier.is_unspecified());
        assert!(properties.streams[0].storage.identifier.is_unspecified());
        runtime.shutdown().unwrap();
    }

    #[test]
    fn test_two_streams_run_in_parallel() {
        let mut runtime = Runtime::new().unwrap();
        let mut properties = runtime.get_configuration();
        for (index, stream) in properties.streams.iter_mut().enumerate() {
            stream.camera.identifier = runtime
                .device_manager()
                .select(DeviceKind::Camera, "uniform random")
                .unwrap();
            stream.storage.identifier = runtime
                .device_manager()
                .select(DeviceKind::Storage, "trash")
                .unwrap();
            stream.camera.settings.shape = (64, 48);
            stream.camera.settings.exposure_time_us = 100.0;
            stream.max_frame_count = 8 + index as u64;
        }
        runtime.configure(&mut properties).unwrap();
        runtime.start().unwrap();

        let deadline = Instant::now() + Duration::from_secs(30);
        while !(runtime.stream_progress(0).unwrap().finished
            && runtime.stream_progress(1).unwrap().finished)
        {
            assert!(Instant::now() < deadline);
            std::thread::sleep(Duration::from_millis(1));
        }
        runtime.stop().unwrap();
        assert_eq!(runtime.stream_progress(0).unwrap().frames_written, 8);
        assert_eq!(runtime.stream_progress(1).unwrap().frames_written, 9);
        runtime.shutdown().unwrap();
    }

    struct FailingStartDriver;

    impl Driver for FailingStartDriver {
        fn name(&self) -> &'static str {
            "failing"
        }
        fn device_count(&self) -> usize {
            1
        }
        fn describe(&self, index: usize) -> std::result::Result<DeviceIdentifier, DeviceError> {
            if index == 0 {
                Ok(DeviceIdentifier::storage("failing: start"))
            } else {
                Err(DeviceError::BadIndex {
                    driver: "failing".to_string(),
                    index,
                })
            }
        }
        fn open(&self, index: usize) -> std::result::Result<DeviceHandle, DeviceError> {
            if index == 0 {
                Ok(DeviceHandle::Storage(Box::new(FailingStartSink::default())))
            } else {
                Err(DeviceError::BadIndex {
                    driver: "failing".to_string(),
                    index,
                })
            }
        }
    }

    /// Accepts any configuration but refuses to arm its output, like a sink
    /// whose destination vanished between configure and start.
    #[derive(Default)]
    struct FailingStartSink {
        properties: StorageProperties,
        state: DeviceState,
    }

    impl Storage for FailingStartSink {
        fn set(&mut self, properties: &StorageProperties) -> DeviceState {
            self.properties = properties.clone();
            self.state = DeviceState::Armed;
            self.state
        }
        fn get(&self, properties: &mut StorageProperties) {
            *properties = self.properties.clone();
        }
        fn get_meta(&self, _metadata: &mut StoragePropertyMetadata) {}
        fn start(&mut self) -> DeviceState {
            DeviceState::AwaitingConfiguration
        }
        fn stop(&mut self) -> DeviceState {
            self.state = DeviceState::Armed;
            self.state
        }
        fn append(&mut self, _frame: crate::frame::FrameRef<'_>) -> DeviceState {
            self.state
        }
        fn reserve_image_shape(&mut self, _shape: &ImageShape) {}
    }

    #[test]
    fn test_partial_start_failure_tears_down_started_streams() {
        let mut drivers = crate::drivers::default_drivers();
        drivers.push(Arc::new(FailingStartDriver));
        let mut runtime = Runtime::with_drivers(drivers).unwrap();

        let mut properties = runtime.get_configuration();
        // stream 0 is healthy and floods frames as fast as it can
        properties.streams[0].camera.identifier = runtime
            .device_manager()
            .select(DeviceKind::Camera, "simulated.*empty.*")
            .unwrap();
        properties.streams[0].storage.identifier = runtime
            .device_manager()
            .select(DeviceKind::Storage, "trash")
            .unwrap();
        properties.streams[0].camera.settings.shape = (64, 48);
        properties.streams[0].camera.settings.exposure_time_us = 1.0;
        properties.streams[0].max_frame_count = 8;
        // stream 1's sink refuses to start
        properties.streams[1].camera.identifier = runtime
            .device_manager()
            .select(DeviceKind::Camera, "uniform random")
            .unwrap();
        properties.streams[1].storage.identifier = runtime
            .device_manager()
            .select(DeviceKind::Storage, "failing.*")
            .unwrap();
        properties.streams[1].camera.settings.shape = (32, 32);
        properties.streams[1].camera.settings.exposure_time_us = 100.0;
        properties.streams[1].max_frame_count = 4;
        runtime.configure(&mut properties).unwrap();

        // stream 0 starts first, then stream 1's sink fails the whole start
        assert!(runtime.start().is_err());

        // stream 0 was torn down and its ring emptied, like after an abort
        let mapped = runtime.map_read(0).unwrap();
        assert!(mapped.is_empty());

        // swap the broken sink out; stream 0 keeps its devices and its ring
        properties.streams[1].storage.identifier = runtime
            .device_manager()
            .select(DeviceKind::Storage, "trash")
            .unwrap();
        runtime.configure(&mut properties).unwrap();
        runtime.start().unwrap();

        let deadline = Instant::now() + Duration::from_secs(30);
        while !(runtime.stream_progress(0).unwrap().finished
            && runtime.stream_progress(1).unwrap().finished)
        {
            assert!(Instant::now() < deadline);
            std::thread::sleep(Duration::from_millis(1));
        }
        runtime.stop().unwrap();

        // nothing from the aborted run leaked into this acquisition
        let progress = runtime.stream_progress(0).unwrap();
        assert_eq!(progress.frames_written, 8);
        assert_eq!(progress.frames_appended, 8);
        let progress = runtime.stream_progress(1).unwrap();
        assert_eq!(progress.frames_written, 4);
        assert_eq!(progress.frames_appended, 4);
        runtime.shutdown().unwrap();
    }

    #[test]
    fn test_execute_trigger_releases_frames() {
        let mut runtime = Runtime::new().unwrap();
        let mut properties = runtime.get_configuration();
        properties.streams[0].camera.identifier = runtime
            .device_manager()
            .select(DeviceKind::Camera, "uniform random")
            .unwrap();
        properties.streams[0].storage.identifier = runtime
            .device_manager()
            .select(DeviceKind::Storage, "trash")
            .unwrap();
        properties.streams[0].camera.settings.shape = (32, 32);
        properties.streams[0]
            .camera
            .settings
            .input_triggers
            .frame_start
            .enable = true;
        properties.streams[0].max_frame_count = 2;
        runtime.configure(&mut properties).unwrap();
        runtime.start().unwrap();

        // with the software trigger armed, nothing flows on its own
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(runtime.stream_progress(0).unwrap().frames_written, 0);

        let deadline = Instant::now() + Duration::from_secs(10);
        runtime.execute_trigger(0).unwrap();
        while runtime.stream_progress(0).unwrap().frames_written < 1 {
            assert!(Instant::now() < deadline);
            std::thread::sleep(Duration::from_millis(1));
        }
        runtime.execute_trigger(0).unwrap();
        while !runtime.stream_progress(0).unwrap().finished {
            assert!(Instant::now() < deadline);
            std::thread::sleep(Duration::from_millis(1));
        }
        runtime.stop().unwrap();
        assert_eq!(runtime.stream_progress(0).unwrap().frames_written, 2);
        runtime.shutdown().unwrap();
    }

    #[test]
    fn test_abort_discards_ring_contents() {
        let mut runtime = Runtime::new().unwrap();
        configure_stream0(
            &mut runtime,
            "simulated: uniform random",
            "trash",
            None,
            (64, 48),
            SampleType::U8,
            100.0,
            0,
        );
        runtime.start().unwrap();
        std::thread::sleep(Duration::from_millis(50));
        runtime.abort().unwrap();

        // after abort the monitor sees an empty ring
        let mapped = runtime.map_read(0).unwrap();
        assert!(mapped.is_empty());
        runtime.shutdown().unwrap();
    }
}
