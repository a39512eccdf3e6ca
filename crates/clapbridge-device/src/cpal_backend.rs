//! Real devices through cpal.
//!
//! cpal is callback-driven, so the packet model is rebuilt on top of it:
//! - Capture: the input callback copies each cpal buffer into lock-free
//!   `rtrb` queues as one packet and signals the wake event, if installed.
//! - Render: the output callback drains an `rtrb` queue that the render
//!   service fills. Padding is the occupancy of that queue.
//!
//! cpal streams are not `Send`, so every stream lives on its own thread and
//! is driven through a small control channel. `stop` and `reset` wait for
//! the thread to acknowledge; a reset empties the queue on that thread.
//!
//! No format conversion happens here: a device that can't open a stereo f32
//! stream at the host rate fails at initialize.

use crate::{
    AudioClient, CapturePacket, CaptureService, DeviceBackend, DeviceError, DeviceId,
    DeviceInfo, Direction, Endpoint, LoopbackTarget, PacketFlags, RenderService, StreamFlags,
};
use clapbridge_comms::WakeEvent;
use clapbridge_core::{Frames, NUM_CHANNELS, Sample, StreamFormat};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use crossbeam_channel::{Receiver, Sender};
use rtrb::{Consumer, Producer, RingBuffer};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// Capture queue depth in device periods
const CAPTURE_QUEUE_PERIODS: usize = 4;

/// Period used when the device does not report a buffer size range
const DEFAULT_PERIOD: Duration = Duration::from_millis(10);

/// How long `stop` and `reset` wait for the stream thread
const ACK_TIMEOUT: Duration = Duration::from_secs(2);

/// Lists input devices.
pub fn input_devices() -> Result<Vec<DeviceInfo>, DeviceError> {
    let host = cpal::default_host();
    let default_name = host.default_input_device().and_then(|d| d.name().ok());
    let devices = host
        .input_devices()
        .map_err(|e| DeviceError::Backend(e.to_string()))?;
    Ok(describe(devices, default_name.as_deref()))
}

/// Lists output devices.
pub fn output_devices() -> Result<Vec<DeviceInfo>, DeviceError> {
    let host = cpal::default_host();
    let default_name = host.default_output_device().and_then(|d| d.name().ok());
    let devices = host
        .output_devices()
        .map_err(|e| DeviceError::Backend(e.to_string()))?;
    Ok(describe(devices, default_name.as_deref()))
}

fn describe(
    devices: impl Iterator<Item = cpal::Device>,
    default_name: Option<&str>,
) -> Vec<DeviceInfo> {
    devices
        .filter_map(|device| device.name().ok())
        .map(|name| DeviceInfo {
            id: DeviceId::new(name.clone()),
            is_default: default_name == Some(name.as_str()),
            name,
        })
        .collect()
}

fn find_named(
    mut devices: impl Iterator<Item = cpal::Device>,
    endpoint: &Endpoint,
    id: &DeviceId,
) -> Result<cpal::Device, DeviceError> {
    devices
        .find(|device| device.name().is_ok_and(|name| name == id.as_str()))
        .ok_or_else(|| DeviceError::NotFound(endpoint.to_string()))
}

fn find_device(host: &cpal::Host, endpoint: &Endpoint) -> Result<cpal::Device, DeviceError> {
    match endpoint {
        Endpoint::Input(id) => {
            let devices = host
                .input_devices()
                .map_err(|e| DeviceError::Backend(e.to_string()))?;
            find_named(devices, endpoint, id)
        }
        Endpoint::Output(id) => {
            let devices = host
                .output_devices()
                .map_err(|e| DeviceError::Backend(e.to_string()))?;
            find_named(devices, endpoint, id)
        }
        // System loopback records the default output device
        Endpoint::Loopback(_) => host
            .default_output_device()
            .ok_or_else(|| DeviceError::NotFound("default output device".to_string())),
    }
}

/// Buffer size range the device reports, if any
fn supported_range(device: &cpal::Device, endpoint: &Endpoint) -> Option<(Frames, Frames)> {
    let config = match endpoint {
        Endpoint::Input(_) => device.default_input_config(),
        Endpoint::Output(_) | Endpoint::Loopback(_) => device.default_output_config(),
    }
    .ok()?;
    match config.buffer_size() {
        cpal::SupportedBufferSize::Range { min, max } => Some((*min as Frames, *max as Frames)),
        cpal::SupportedBufferSize::Unknown => None,
    }
}

/// How a stream's buffers are sized
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct BufferLayout {
    /// Frames per cpal callback
    period_frames: Frames,
    /// Whether `period_frames` can be requested from cpal
    fixed: bool,
    /// Frames reported by `buffer_size()`
    buffer_frames: Frames,
}

impl BufferLayout {
    /// Capture grants one period sized from the request; render keeps a
    /// default period and grows the queue to the requested duration.
    fn new(
        direction: Direction,
        requested: Frames,
        default_period: Frames,
        range: Option<(Frames, Frames)>,
    ) -> Self {
        let wanted = match direction {
            Direction::Capture if requested > 0 => requested,
            _ => default_period,
        };
        let (period_frames, fixed) = match range {
            Some((min, max)) if min <= max => (wanted.clamp(min, max).max(1), true),
            _ => (default_period.max(1), false),
        };
        let buffer_frames = match direction {
            Direction::Capture => period_frames,
            Direction::Render => requested.max(period_frames),
        };
        Self {
            period_frames,
            fixed,
            buffer_frames,
        }
    }

    fn stream_config(&self, format: StreamFormat) -> cpal::StreamConfig {
        cpal::StreamConfig {
            channels: NUM_CHANNELS as u16,
            sample_rate: cpal::SampleRate(format.sample_rate),
            buffer_size: if self.fixed {
                cpal::BufferSize::Fixed(self.period_frames as u32)
            } else {
                cpal::BufferSize::Default
            },
        }
    }
}

/// Backend opening cpal streams on the default host.
#[derive(Debug, Clone)]
pub struct CpalBackend {
    name: String,
    default_period: Duration,
}

impl CpalBackend {
    #[must_use]
    pub fn new() -> Self {
        Self::with_default_period(DEFAULT_PERIOD)
    }

    /// Use `period` when a device reports no buffer size range.
    #[must_use]
    pub fn with_default_period(period: Duration) -> Self {
        Self {
            name: format!("cpal ({})", cpal::default_host().id().name()),
            default_period: period,
        }
    }
}

impl Default for CpalBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceBackend for CpalBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn open_client(&self, endpoint: &Endpoint) -> Result<Box<dyn AudioClient>, DeviceError> {
        if let Endpoint::Loopback(target @ LoopbackTarget::Process { .. }) = endpoint {
            return Err(DeviceError::Unsupported(format!(
                "loopback of {target} is not available through cpal"
            )));
        }
        // Fail at open rather than at initialize if the device is gone
        find_device(&cpal::default_host(), endpoint)?;
        Ok(Box::new(CpalClient {
            endpoint: endpoint.clone(),
            default_period: self.default_period,
            stream: None,
        }))
    }
}

/// Capture side the cpal callback writes into.
///
/// Samples go in before their packet size, so a size is only visible once
/// its samples are.
struct CaptureWriter {
    samples: Producer<Sample>,
    sizes: Producer<Frames>,
}

/// Capture side the service reads from. Shared with the stream thread so a
/// reset can empty it.
struct CaptureQueue {
    samples: Consumer<Sample>,
    sizes: Consumer<Frames>,
}

/// Queues for a capture stream holding `frames` frames in total.
fn capture_queue(frames: Frames) -> (CaptureWriter, CaptureQueue) {
    let (samples_tx, samples_rx) = RingBuffer::<Sample>::new(frames * NUM_CHANNELS);
    let (sizes_tx, sizes_rx) = RingBuffer::<Frames>::new(frames);
    (
        CaptureWriter {
            samples: samples_tx,
            sizes: sizes_tx,
        },
        CaptureQueue {
            samples: samples_rx,
            sizes: sizes_rx,
        },
    )
}

impl CaptureWriter {
    /// Queue the whole frames of `data` as one packet.
    ///
    /// A trailing half frame is ignored. Returns `false` if the packet did
    /// not fit and was dropped.
    fn push_packet(&mut self, data: &[Sample]) -> bool {
        let frames = data.len() / NUM_CHANNELS;
        let len = frames * NUM_CHANNELS;
        if self.sizes.is_full() || self.samples.slots() < len {
            return false;
        }
        let Ok(chunk) = self.samples.write_chunk_uninit(len) else {
            return false;
        };
        chunk.fill_from_iter(data[..len].iter().copied());
        self.sizes.push(frames).is_ok()
    }
}

impl CaptureQueue {
    /// Frames in the oldest packet, or 0 when empty
    fn next_packet_size(&self) -> Frames {
        self.sizes.peek().map_or(0, |&frames| frames)
    }

    /// Frames in every complete packet
    fn queued_frames(&mut self) -> Frames {
        let packets = self.sizes.slots();
        self.sizes
            .read_chunk(packets)
            .map_or(0, |chunk| {
                let (first, second) = chunk.as_slices();
                first.iter().chain(second).sum()
            })
    }

    /// Move the oldest packet into `out`, returning its frame count.
    fn pop_packet(&mut self, out: &mut [Sample]) -> Result<Frames, DeviceError> {
        let Ok(frames) = self.sizes.pop() else {
            return Ok(0);
        };
        let len = frames * NUM_CHANNELS;
        let chunk = self
            .samples
            .read_chunk(len)
            .map_err(|_| DeviceError::Backend("capture queue out of sync".to_string()))?;
        let (first, second) = chunk.as_slices();
        out[..first.len()].copy_from_slice(first);
        out[first.len()..len].copy_from_slice(second);
        chunk.commit_all();
        Ok(frames)
    }

    /// Drop every complete packet, returning the frames dropped.
    ///
    /// Samples of a packet whose size is not queued yet are left alone.
    fn clear(&mut self) -> Frames {
        let mut frames = 0;
        while let Ok(size) = self.sizes.pop() {
            frames += size;
        }
        if let Ok(chunk) = self.samples.read_chunk(frames * NUM_CHANNELS) {
            chunk.commit_all();
        }
        frames
    }
}

/// Input callback body.
///
/// REAL-TIME SAFE: no allocation, no logging, no locking.
fn on_capture(
    writer: &mut CaptureWriter,
    data: &[Sample],
    discontinuity: &AtomicBool,
    event: &OnceLock<WakeEvent>,
) {
    if data.len() < NUM_CHANNELS {
        return;
    }
    if writer.push_packet(data) {
        if let Some(event) = event.get() {
            event.signal();
        }
    } else {
        discontinuity.store(true, Ordering::Relaxed);
    }
}

/// Frames written and not yet played
fn queued_frames(samples: &Producer<Sample>) -> Frames {
    (samples.buffer().capacity() - samples.slots()) / NUM_CHANNELS
}

/// Frames that can still be written
fn free_frames(samples: &Producer<Sample>) -> Frames {
    samples.slots() / NUM_CHANNELS
}

/// Copy whole queued frames into `data` and pad the rest with silence.
///
/// Returns the frames played.
fn play_into(samples: &mut Consumer<Sample>, data: &mut [Sample]) -> Frames {
    let available = samples.slots().min(data.len());
    let available = available - available % NUM_CHANNELS;
    let played = match samples.read_chunk(available) {
        Ok(chunk) => {
            let (first, second) = chunk.as_slices();
            data[..first.len()].copy_from_slice(first);
            data[first.len()..available].copy_from_slice(second);
            chunk.commit_all();
            available
        }
        Err(_) => 0,
    };
    data[played..].fill(0.0);
    played / NUM_CHANNELS
}

/// Drop everything queued for playback, returning the frames dropped.
fn discard_queued(samples: &mut Consumer<Sample>) -> Frames {
    let queued = samples.slots() - samples.slots() % NUM_CHANNELS;
    if let Ok(chunk) = samples.read_chunk(queued) {
        chunk.commit_all();
    }
    queued / NUM_CHANNELS
}

/// Output callback body.
///
/// REAL-TIME SAFE: never waits on the lock. While a reset holds it the
/// callback plays silence.
fn on_render(samples: &Mutex<Consumer<Sample>>, data: &mut [Sample]) {
    match samples.try_lock() {
        Some(mut samples) => {
            play_into(&mut samples, data);
        }
        None => data.fill(0.0),
    }
}

/// Host-side end of a stream's queue
enum StreamQueue {
    Capture(Arc<Mutex<CaptureQueue>>),
    Render(Arc<Mutex<Producer<Sample>>>),
}

struct OpenStream {
    thread: StreamThread,
    flags: StreamFlags,
    layout: BufferLayout,
    event: Arc<OnceLock<WakeEvent>>,
    discontinuity: Arc<AtomicBool>,
    running: bool,
    queue: StreamQueue,
    service_taken: bool,
}

struct CpalClient {
    endpoint: Endpoint,
    default_period: Duration,
    stream: Option<OpenStream>,
}

impl CpalClient {
    fn stream(&self) -> Result<&OpenStream, DeviceError> {
        self.stream.as_ref().ok_or(DeviceError::NotInitialized)
    }

    fn stream_mut(&mut self) -> Result<&mut OpenStream, DeviceError> {
        self.stream.as_mut().ok_or(DeviceError::NotInitialized)
    }

    fn open_capture(
        &self,
        format: StreamFormat,
        layout: BufferLayout,
        event: &Arc<OnceLock<WakeEvent>>,
        discontinuity: &Arc<AtomicBool>,
    ) -> Result<(StreamThread, StreamQueue), DeviceError> {
        let (mut writer, queue) = capture_queue(layout.period_frames * CAPTURE_QUEUE_PERIODS);
        let queue = Arc::new(Mutex::new(queue));
        let endpoint = self.endpoint.clone();
        let config = layout.stream_config(format);
        let event = Arc::clone(event);
        let discontinuity = Arc::clone(discontinuity);
        let reset_queue = Arc::clone(&queue);

        let thread = StreamThread::spawn(
            "clapbridge-capture",
            move || {
                let device = find_device(&cpal::default_host(), &endpoint)?;
                device
                    .build_input_stream(
                        &config,
                        move |data: &[Sample], _: &cpal::InputCallbackInfo| {
                            on_capture(&mut writer, data, &discontinuity, &event);
                        },
                        |err| tracing::error!("Capture stream error: {}", err),
                        None,
                    )
                    .map_err(|e| DeviceError::Backend(e.to_string()))
            },
            move || reset_queue.lock().clear(),
        )?;

        Ok((thread, StreamQueue::Capture(queue)))
    }

    fn open_render(
        &self,
        format: StreamFormat,
        layout: BufferLayout,
    ) -> Result<(StreamThread, StreamQueue), DeviceError> {
        let (producer, consumer) = RingBuffer::<Sample>::new(layout.buffer_frames * NUM_CHANNELS);
        let consumer = Arc::new(Mutex::new(consumer));
        let endpoint = self.endpoint.clone();
        let config = layout.stream_config(format);
        let playing = Arc::clone(&consumer);

        let thread = StreamThread::spawn(
            "clapbridge-render",
            move || {
                let device = find_device(&cpal::default_host(), &endpoint)?;
                device
                    .build_output_stream(
                        &config,
                        move |data: &mut [Sample], _: &cpal::OutputCallbackInfo| {
                            on_render(&playing, data);
                        },
                        |err| tracing::error!("Render stream error: {}", err),
                        None,
                    )
                    .map_err(|e| DeviceError::Backend(e.to_string()))
            },
            move || discard_queued(&mut consumer.lock()),
        )?;

        Ok((
            thread,
            StreamQueue::Render(Arc::new(Mutex::new(producer))),
        ))
    }
}

impl AudioClient for CpalClient {
    fn initialize(
        &mut self,
        format: StreamFormat,
        flags: StreamFlags,
        buffer_duration: Duration,
    ) -> Result<(), DeviceError> {
        if self.stream.is_some() {
            return Err(DeviceError::AlreadyInitialized);
        }
        if flags.loopback != self.endpoint.is_loopback() {
            return Err(DeviceError::Unsupported(format!(
                "loopback flag does not match {}",
                self.endpoint
            )));
        }

        let direction = self.endpoint.direction();
        let range = {
            let host = cpal::default_host();
            let device = find_device(&host, &self.endpoint)?;
            supported_range(&device, &self.endpoint)
        };
        let layout = BufferLayout::new(
            direction,
            format.frames_for(buffer_duration),
            format.frames_for(self.default_period),
            range,
        );
        tracing::debug!(
            "Opening {} at {} Hz: {:?}",
            self.endpoint,
            format.sample_rate,
            layout
        );

        let event = Arc::new(OnceLock::new());
        let discontinuity = Arc::new(AtomicBool::new(false));
        let (thread, queue) = match direction {
            Direction::Capture => self.open_capture(format, layout, &event, &discontinuity)?,
            Direction::Render => self.open_render(format, layout)?,
        };

        self.stream = Some(OpenStream {
            thread,
            flags,
            layout,
            event,
            discontinuity,
            running: false,
            queue,
            service_taken: false,
        });
        Ok(())
    }

    fn buffer_size(&self) -> Result<Frames, DeviceError> {
        Ok(self.stream()?.layout.buffer_frames)
    }

    fn current_padding(&self) -> Result<Frames, DeviceError> {
        Ok(match &self.stream()?.queue {
            StreamQueue::Capture(queue) => queue.lock().queued_frames(),
            StreamQueue::Render(samples) => queued_frames(&samples.lock()),
        })
    }

    fn set_event_handle(&mut self, event: WakeEvent) -> Result<(), DeviceError> {
        let stream = self.stream()?;
        if !stream.flags.event_driven {
            return Err(DeviceError::NotEventDriven);
        }
        stream
            .event
            .set(event)
            .map_err(|_| DeviceError::Backend("event handle already installed".to_string()))
    }

    fn start(&mut self) -> Result<(), DeviceError> {
        let stream = self.stream_mut()?;
        if stream.running {
            return Err(DeviceError::NotStopped);
        }
        stream.thread.send(StreamControl::Play)?;
        stream.running = true;
        Ok(())
    }

    /// Returns once the stream thread has paused the stream.
    fn stop(&mut self) -> Result<(), DeviceError> {
        let stream = self.stream_mut()?;
        if stream.running {
            stream.thread.request(StreamControl::Pause)?;
            stream.running = false;
        }
        Ok(())
    }

    /// Returns once the stream thread has emptied the queue.
    fn reset(&mut self) -> Result<(), DeviceError> {
        let stream = self.stream_mut()?;
        if stream.running {
            return Err(DeviceError::NotStopped);
        }
        stream.thread.request(StreamControl::Reset)
    }

    fn capture_service(&mut self) -> Result<Box<dyn CaptureService>, DeviceError> {
        let stream = self.stream_mut()?;
        let StreamQueue::Capture(queue) = &stream.queue else {
            return Err(DeviceError::Unsupported(
                "capture service on a render stream".to_string(),
            ));
        };
        if std::mem::replace(&mut stream.service_taken, true) {
            return Err(DeviceError::OutOfOrder("service already taken"));
        }
        Ok(Box::new(CpalCapture::new(
            Arc::clone(queue),
            Arc::clone(&stream.discontinuity),
        )))
    }

    fn render_service(&mut self) -> Result<Box<dyn RenderService>, DeviceError> {
        let stream = self.stream_mut()?;
        let StreamQueue::Render(samples) = &stream.queue else {
            return Err(DeviceError::Unsupported(
                "render service on a capture stream".to_string(),
            ));
        };
        if std::mem::replace(&mut stream.service_taken, true) {
            return Err(DeviceError::OutOfOrder("service already taken"));
        }
        Ok(Box::new(CpalRender::new(Arc::clone(samples))))
    }
}

struct CpalCapture {
    queue: Arc<Mutex<CaptureQueue>>,
    scratch: Vec<Sample>,
    discontinuity: Arc<AtomicBool>,
    held: Option<Frames>,
}

impl CpalCapture {
    fn new(queue: Arc<Mutex<CaptureQueue>>, discontinuity: Arc<AtomicBool>) -> Self {
        let capacity = queue.lock().samples.buffer().capacity();
        Self {
            queue,
            scratch: vec![0.0; capacity],
            discontinuity,
            held: None,
        }
    }
}

impl CaptureService for CpalCapture {
    fn next_packet_size(&mut self) -> Result<Frames, DeviceError> {
        Ok(self.queue.lock().next_packet_size())
    }

    /// Copies the packet out of the queue, so a reset between get and
    /// release cannot tear it.
    fn get_buffer(&mut self) -> Result<CapturePacket<'_>, DeviceError> {
        if self.held.is_some() {
            return Err(DeviceError::OutOfOrder("previous packet not released"));
        }
        let frames = self.queue.lock().pop_packet(&mut self.scratch)?;
        self.held = Some(frames);
        let flags = PacketFlags {
            discontinuity: self.discontinuity.swap(false, Ordering::AcqRel),
            ..PacketFlags::default()
        };
        Ok(CapturePacket {
            data: &self.scratch[..frames * NUM_CHANNELS],
            flags,
        })
    }

    fn release_buffer(&mut self, frames: Frames) -> Result<(), DeviceError> {
        match self.held.take() {
            Some(held) if held == frames => Ok(()),
            Some(_) => Err(DeviceError::OutOfOrder("released a partial packet")),
            None => Err(DeviceError::OutOfOrder("no packet held")),
        }
    }
}

struct CpalRender {
    samples: Arc<Mutex<Producer<Sample>>>,
    scratch: Vec<Sample>,
    held: Option<Frames>,
}

impl CpalRender {
    fn new(samples: Arc<Mutex<Producer<Sample>>>) -> Self {
        let capacity = samples.lock().buffer().capacity();
        Self {
            samples,
            scratch: vec![0.0; capacity],
            held: None,
        }
    }
}

impl RenderService for CpalRender {
    fn get_buffer(&mut self, frames: Frames) -> Result<&mut [Sample], DeviceError> {
        if self.held.is_some() {
            return Err(DeviceError::OutOfOrder("previous buffer not released"));
        }
        let available = free_frames(&self.samples.lock());
        if frames > available {
            return Err(DeviceError::BufferTooLarge {
                requested: frames,
                available,
            });
        }
        self.held = Some(frames);
        let buffer = &mut self.scratch[..frames * NUM_CHANNELS];
        buffer.fill(0.0);
        Ok(buffer)
    }

    fn release_buffer(&mut self, frames: Frames) -> Result<(), DeviceError> {
        match self.held.take() {
            Some(held) if frames <= held => {
                let len = frames * NUM_CHANNELS;
                let mut samples = self.samples.lock();
                let chunk = samples
                    .write_chunk_uninit(len)
                    .map_err(|_| DeviceError::Backend("render queue overrun".to_string()))?;
                chunk.fill_from_iter(self.scratch[..len].iter().copied());
                Ok(())
            }
            Some(_) => Err(DeviceError::OutOfOrder("released more than was acquired")),
            None => Err(DeviceError::OutOfOrder("no buffer held")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StreamControl {
    Play,
    Pause,
    /// Run the stream's reset hook
    Reset,
}

struct Command {
    control: StreamControl,
    /// Sequence number to acknowledge, if the sender waits
    ack: Option<u64>,
}

type Ack = (u64, Result<(), String>);

/// What the stream thread needs from a stream
trait StreamHandle {
    fn play(&self) -> Result<(), String>;
    fn pause(&self) -> Result<(), String>;
}

impl StreamHandle for cpal::Stream {
    fn play(&self) -> Result<(), String> {
        StreamTrait::play(self).map_err(|e| e.to_string())
    }

    fn pause(&self) -> Result<(), String> {
        StreamTrait::pause(self).map_err(|e| e.to_string())
    }
}

/// Thread owning one cpal stream.
///
/// Dropping it closes the control channel, which drops the stream and ends
/// the thread; the drop joins it.
struct StreamThread {
    control: Option<Sender<Command>>,
    acks: Receiver<Ack>,
    next_ack: u64,
    handle: Option<JoinHandle<()>>,
}

impl StreamThread {
    fn spawn<S, F, R>(name: &str, build: F, mut reset: R) -> Result<Self, DeviceError>
    where
        S: StreamHandle,
        F: FnOnce() -> Result<S, DeviceError> + Send + 'static,
        R: FnMut() -> Frames + Send + 'static,
    {
        let (control_tx, control_rx) = crossbeam_channel::bounded(8);
        let (ack_tx, ack_rx) = crossbeam_channel::bounded(8);
        let (ready_tx, ready_rx) = crossbeam_channel::bounded(1);

        let handle = std::thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                let stream = match build() {
                    Ok(stream) => stream,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                // Some hosts start streams as soon as they are built
                let _ = stream.pause();
                let _ = ready_tx.send(Ok(()));
                run_stream(&stream, &control_rx, &ack_tx, &mut reset);
            })
            .map_err(|e| DeviceError::Backend(format!("Failed to spawn stream thread: {e}")))?;

        let ready = ready_rx
            .recv()
            .unwrap_or_else(|_| Err(DeviceError::Backend("stream thread exited".to_string())));
        match ready {
            Ok(()) => Ok(Self {
                control: Some(control_tx),
                acks: ack_rx,
                next_ack: 0,
                handle: Some(handle),
            }),
            Err(e) => {
                let _ = handle.join();
                Err(e)
            }
        }
    }

    fn post(&self, command: Command) -> Result<(), DeviceError> {
        self.control
            .as_ref()
            .ok_or(DeviceError::NotInitialized)?
            .try_send(command)
            .map_err(|_| DeviceError::Backend("stream thread not responding".to_string()))
    }

    /// Never blocks, so it can be called from the host callback.
    fn send(&self, control: StreamControl) -> Result<(), DeviceError> {
        self.post(Command { control, ack: None })
    }

    /// Send `control` and wait until the stream thread has carried it out.
    fn request(&mut self, control: StreamControl) -> Result<(), DeviceError> {
        self.next_ack += 1;
        let seq = self.next_ack;
        self.post(Command {
            control,
            ack: Some(seq),
        })?;

        let deadline = Instant::now() + ACK_TIMEOUT;
        loop {
            let (acked, result) = self.acks.recv_deadline(deadline).map_err(|_| {
                DeviceError::Backend(format!("stream thread did not acknowledge {control:?}"))
            })?;
            // Acks left over from a request that timed out
            if acked == seq {
                return result.map_err(DeviceError::Backend);
            }
        }
    }
}

fn run_stream<S: StreamHandle>(
    stream: &S,
    control: &Receiver<Command>,
    acks: &Sender<Ack>,
    reset: &mut dyn FnMut() -> Frames,
) {
    // Ends when the owning client drops its sender
    while let Ok(Command { control, ack }) = control.recv() {
        let result = match control {
            StreamControl::Play => stream.play(),
            StreamControl::Pause => stream.pause(),
            StreamControl::Reset => {
                let dropped = reset();
                tracing::debug!("Stream reset discarded {} frames", dropped);
                Ok(())
            }
        };
        if let Err(e) = &result {
            tracing::warn!("Stream control {:?} failed: {}", control, e);
        }
        if let Some(seq) = ack {
            let _ = acks.try_send((seq, result));
        }
    }
}

impl Drop for StreamThread {
    fn drop(&mut self) {
        drop(self.control.take());
        if let Some(handle) = self.handle.take()
            && handle.join().is_err()
        {
            tracing::error!("Audio stream thread panicked");
        }
    }
}
