//! Per-stream acquisition pipeline: the producer task pulls frames from the
//! camera into the ring, the consumer task drains the ring into storage.
//!
//! Both tasks are OS threads joined on stop or abort. Backpressure never
//! blocks the producer: when the ring cannot reserve space the frame is
//! discarded, counted, and reported through a `Dropped <N>` line. A drop is
//! never fatal; the host decides whether the loss is acceptable.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use tracing::{debug, error, info};

use crate::device::{DeviceState, FrameInfo, FramePoll, OpenCamera, OpenStorage};
use crate::frame::{align_up, FrameHeader, FrameIter, FrameTimestamps, FRAME_ALIGN};
use crate::properties::SampleType;
use crate::report::{report, report_err, Reporter};
use crate::ring::{FrameRing, RingWriter};

/// How long the producer naps when the camera has no frame ready.
const POLL_INTERVAL: Duration = Duration::from_micros(100);
/// Bounded wait of the consumer on an empty ring.
const DRAIN_INTERVAL: Duration = Duration::from_millis(10);
/// Termination handshake budget before escalating to forced teardown.
const JOIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Flags and counters shared between the controller and both tasks.
#[derive(Default)]
struct PipelineShared {
    /// Graceful: finish the current frame, then exit.
    stop: AtomicBool,
    /// Forced: exit as soon as possible, remaining ring contents are
    /// discarded by the controller.
    cancel: AtomicBool,
    producer_done: AtomicBool,
    consumer_done: AtomicBool,
    failed: AtomicBool,
    frames_written: AtomicU64,
    frames_dropped: AtomicU64,
    frames_appended: AtomicU64,
}

/// Final accounting of one acquisition run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PipelineOutcome {
    pub frames_written: u64,
    pub frames_dropped: u64,
    pub frames_appended: u64,
    pub failed: bool,
}

/// A running producer/consumer pair for one stream.
pub struct StreamPipeline {
    stream_id: usize,
    shared: Arc<PipelineShared>,
    producer: Option<JoinHandle<()>>,
    consumer: Option<JoinHandle<()>>,
}

impl StreamPipeline {
    /// Arm the ring and spawn both tasks.
    #[allow(clippy::too_many_arguments)]
    pub fn spawn(
        stream_id: usize,
        camera: Arc<Mutex<OpenCamera>>,
        storage: Arc<Mutex<OpenStorage>>,
        ring: Arc<FrameRing>,
        max_frame_count: u64,
        frame_average_count: u32,
        reporter: Option<Reporter>,
    ) -> Self {
        ring.begin();
        let shared = Arc::new(PipelineShared::default());
        let writer = ring.writer();

        let producer = {
            let shared = Arc::clone(&shared);
            let reporter = reporter.clone();
            std::thread::Builder::new()
                .name(format!("scopecam-producer-{stream_id}"))
                .spawn(move || {
                    producer_loop(
                        stream_id,
                        camera,
                        writer,
                        shared,
                        max_frame_count,
                        frame_average_count,
                        reporter,
                    )
                })
                .expect("spawn producer thread")
        };

        let consumer = {
            let shared = Arc::clone(&shared);
            std::thread::Builder::new()
                .name(format!("scopecam-consumer-{stream_id}"))
                .spawn(move || consumer_loop(stream_id, storage, ring, shared, reporter))
                .expect("spawn consumer thread")
        };

        Self {
            stream_id,
            shared,
            producer: Some(producer),
            consumer: Some(consumer),
        }
    }

    /// Ask both tasks to wind down; the producer stops taking frames and the
    /// consumer drains what remains.
    pub fn request_stop(&self) {
        self.shared.stop.store(true, Ordering::Release);
    }

    /// Ask both tasks to exit as soon as possible, discarding queued frames.
    pub fn request_abort(&self) {
        self.shared.cancel.store(true, Ordering::Release);
        self.shared.stop.store(true, Ordering::Release);
    }

    pub fn frames_written(&self) -> u64 {
        self.shared.frames_written.load(Ordering::Acquire)
    }

    pub fn frames_dropped(&self) -> u64 {
        self.shared.frames_dropped.load(Ordering::Acquire)
    }

    pub fn frames_appended(&self) -> u64 {
        self.shared.frames_appended.load(Ordering::Acquire)
    }

    /// True once the producer has committed its final frame.
    pub fn producer_done(&self) -> bool {
        self.shared.producer_done.load(Ordering::Acquire)
    }

    /// Join both tasks, escalating from polite stop to forced teardown when
    /// the handshake budget is exceeded.
    pub fn join(mut self) -> PipelineOutcome {
        let deadline = Instant::now() + JOIN_TIMEOUT;
        while Instant::now() < deadline {
            if self.shared.producer_done.load(Ordering::Acquire)
                && self.shared.consumer_done.load(Ordering::Acquire)
            {
                break;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        if !self.shared.producer_done.load(Ordering::Acquire)
            || !self.shared.consumer_done.load(Ordering::Acquire)
        {
            error!(
                "[stream {}] termination handshake exceeded {:?}; forcing teardown",
                self.stream_id, JOIN_TIMEOUT
            );
            self.request_abort();
        }
        if let Some(handle) = self.producer.take() {
            let _ = handle.join();
        }
        if let Some(handle) = self.consumer.take() {
            let _ = handle.join();
        }
        PipelineOutcome {
            frames_written: self.shared.frames_written.load(Ordering::Acquire),
            frames_dropped: self.shared.frames_dropped.load(Ordering::Acquire),
            frames_appended: self.shared.frames_appended.load(Ordering::Acquire),
            failed: self.shared.failed.load(Ordering::Acquire),
        }
    }
}

fn system_clock_ns() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as u64
}

fn producer_loop(
    stream_id: usize,
    camera: Arc<Mutex<OpenCamera>>,
    mut writer: RingWriter,
    shared: Arc<PipelineShared>,
    max_frame_count: u64,
    frame_average_count: u32,
    reporter: Option<Reporter>,
) {
    let shape = camera.lock().shape();
    let mut scratch = vec![0u8; shape.bytes_of_image()];
    let mut averager = FrameAverager::new(frame_average_count);
    let mut info = FrameInfo::default();
    let mut next_frame_id: u64 = 0;
    let mut committed: u64 = 0;
    let mut burst_dropped: u64 = 0;

    loop {
        if shared.cancel.load(Ordering::Acquire) || shared.stop.load(Ordering::Acquire) {
            break;
        }
        if max_frame_count > 0 && committed >= max_frame_count {
            break;
        }

        let poll = camera.lock().get_frame(&mut scratch, &mut info);
        let nbytes = match poll {
            Err(e) => {
                report_err!(&reporter, "[stream {}] camera error: {}", stream_id, e);
                shared.failed.store(true, Ordering::Release);
                break;
            }
            Ok(FramePoll::Again) => {
                std::thread::sleep(POLL_INTERVAL);
                continue;
            }
            Ok(FramePoll::Ready { nbytes }) => nbytes,
        };

        if let Some(averager) = averager.as_mut() {
            if !averager.accumulate(info.shape.sample_type, &scratch[..nbytes]) {
                continue;
            }
            averager.write_mean(info.shape.sample_type, &mut scratch[..nbytes]);
        }

        let frame_id = next_frame_id;
        next_frame_id += 1;

        let record_bytes = FrameHeader::SIZE + nbytes;
        let Some(dst) = writer.map_write(align_up(record_bytes, FRAME_ALIGN)) else {
            // Pressure from the storage consumer: discard, count, report.
            burst_dropped += 1;
            shared.frames_dropped.fetch_add(1, Ordering::Release);
            continue;
        };
        if burst_dropped > 0 {
            report!(
                &reporter,
                "[stream {}] Dropped {} frames",
                stream_id,
                burst_dropped
            );
            burst_dropped = 0;
        }

        let header = FrameHeader::new(
            stream_id as u32,
            frame_id,
            info.shape,
            FrameTimestamps {
                hardware: info.hardware_timestamp,
                system: system_clock_ns(),
            },
        );
        header.write_to(dst);
        dst[FrameHeader::SIZE..record_bytes].copy_from_slice(&scratch[..nbytes]);
        writer.commit_write(record_bytes);
        committed += 1;
        shared.frames_written.store(committed, Ordering::Release);
    }

    if burst_dropped > 0 {
        report!(
            &reporter,
            "[stream {}] Dropped {} frames",
            stream_id,
            burst_dropped
        );
    }
    debug!(
        "[stream {}] producer exiting after {} frames ({} dropped)",
        stream_id,
        committed,
        shared.frames_dropped.load(Ordering::Acquire)
    );
    shared.producer_done.store(true, Ordering::Release);
    writer.ring().end();
}

fn consumer_loop(
    stream_id: usize,
    storage: Arc<Mutex<OpenStorage>>,
    ring: Arc<FrameRing>,
    shared: Arc<PipelineShared>,
    reporter: Option<Reporter>,
) {
    let mut appended: u64 = 0;
    'drain: loop {
        if shared.cancel.load(Ordering::Acquire) {
            break;
        }
        // Read the done flag before mapping: anything committed before it was
        // set is visible in this or a later mapping.
        let producer_done = shared.producer_done.load(Ordering::Acquire);
        let region = ring.consumer_map();
        if region.is_empty() {
            if producer_done {
                break;
            }
            ring.wait_readable(DRAIN_INTERVAL);
            continue;
        }

        let mut consumed = 0usize;
        for frame in FrameIter::new(region) {
            if shared.cancel.load(Ordering::Acquire) {
                break;
            }
            let frame_id = frame.header().frame_id;
            let state = storage.lock().append(frame);
            if state != DeviceState::Running {
                report_err!(
                    &reporter,
                    "[stream {}] storage append failed at frame {} (sink is {}); stopping stream",
                    stream_id,
                    frame_id,
                    state
                );
                shared.failed.store(true, Ordering::Release);
                shared.stop.store(true, Ordering::Release);
                let _ = ring.consumer_unmap(consumed);
                break 'drain;
            }
            appended += 1;
            shared.frames_appended.store(appended, Ordering::Release);
            consumed += frame.header().bytes_of_frame as usize;
        }
        if let Err(e) = ring.consumer_unmap(consumed) {
            error!("[stream {}] consumer unmap failed: {}", stream_id, e);
            shared.failed.store(true, Ordering::Release);
            break;
        }
    }
    info!("[stream {}] consumer exiting after {} frames", stream_id, appended);
    shared.consumer_done.store(true, Ordering::Release);
}

/// In-line frame averaging: accumulates N payloads and emits their mean.
struct FrameAverager {
    factor: u32,
    count: u32,
    acc: Vec<f64>,
}

impl FrameAverager {
    fn new(factor: u32) -> Option<Self> {
        (factor > 1).then(|| Self {
            factor,
            count: 0,
            acc: Vec::new(),
        })
    }

    /// Fold one payload in; true once `factor` payloads have accumulated.
    fn accumulate(&mut self, sample_type: SampleType, payload: &[u8]) -> bool {
        let width = sample_type.bytes();
        let samples = payload.len() / width;
        if self.acc.len() != samples {
            self.acc = vec![0.0; samples];
        }
        for (slot, chunk) in self.acc.iter_mut().zip(payload.chunks_exact(width)) {
            *slot += decode_sample(sample_type, chunk);
        }
        self.count += 1;
        self.count >= self.factor
    }

    /// Write the mean into `payload` and reset the accumulator.
    fn write_mean(&mut self, sample_type: SampleType, payload: &mut [u8]) {
        let width = sample_type.bytes();
        let count = self.count.max(1) as f64;
        for (slot, chunk) in self.acc.iter().zip(payload.chunks_exact_mut(width)) {
            encode_sample(sample_type, *slot / count, chunk);
        }
        self.acc.iter_mut().for_each(|slot| *slot = 0.0);
        self.count = 0;
    }
}

fn decode_sample(sample_type: SampleType, chunk: &[u8]) -> f64 {
    match sample_type {
        SampleType::U8 => chunk[0] as f64,
        SampleType::I8 => chunk[0] as i8 as f64,
        SampleType::U16 | SampleType::U10 | SampleType::U12 | SampleType::U14 => {
            u16::from_ne_bytes([chunk[0], chunk[1]]) as f64
        }
        SampleType::I16 => i16::from_ne_bytes([chunk[0], chunk[1]]) as f64,
        SampleType::F32 => f32::from_ne_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]) as f64,
    }
}

fn encode_sample(sample_type: SampleType, value: f64, chunk: &mut [u8]) {
    match sample_type {
        SampleType::U8 => chunk[0] = value.round().clamp(0.0, u8::MAX as f64) as u8,
        SampleType::I8 => {
            chunk[0] = (value.round().clamp(i8::MIN as f64, i8::MAX as f64) as i8) as u8
        }
        SampleType::U16 | SampleType::U10 | SampleType::U12 | SampleType::U14 => {
            let value = value.round().clamp(0.0, u16::MAX as f64) as u16;
            chunk.copy_from_slice(&value.to_ne_bytes());
        }
        SampleType::I16 => {
            let value = value.round().clamp(i16::MIN as f64, i16::MAX as f64) as i16;
            chunk.copy_from_slice(&value.to_ne_bytes());
        }
        SampleType::F32 => chunk.copy_from_slice(&(value as f32).to_ne_bytes()),
    }
}
