//! Microphone capture and outbound framing
//!
//! The cpal stream feeds a one-second ring buffer from the device callback;
//! a tick thread drains a 20 ms frame on every tick, applies the input
//! gain, measures the peak level and emits exactly one packet per tick.
//! Mute, push-to-talk and the broadcast threshold gate what the packet
//! contains, never whether it is emitted.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use cpal::traits::{DeviceTrait, StreamTrait};
use cpal::StreamConfig;
use ringbuf::traits::{Consumer, Observer, Producer, Split};
use ringbuf::HeapRb;
use tokio::sync::mpsc;
use tracing::{error, info, trace, warn};

use super::codec::{self, VoiceEncoder, FRAME_MILLIS, FRAME_SAMPLES, SAMPLE_RATE};
use super::device;
use super::error::AudioError;

/// Ring buffer capacity: one second of mono audio
const RING_CAPACITY: usize = SAMPLE_RATE as usize;

/// Emit a zero level if nothing was reported for this long while capturing
const LEVEL_WATCHDOG: Duration = Duration::from_secs(2);

const TICK: Duration = Duration::from_millis(FRAME_MILLIS);

/// Events produced by the capture pipeline
#[derive(Debug, Clone, PartialEq)]
pub enum CaptureEvent {
    /// Peak level of the latest frame, normalised to [0, 1]
    Level(f32),
    /// One Opus packet per 20 ms tick; empty denotes silence
    Packet(Vec<u8>),
}

fn store_f32(cell: &AtomicU32, value: f32) {
    cell.store(value.to_bits(), Ordering::Relaxed);
}

fn load_f32(cell: &AtomicU32) -> f32 {
    f32::from_bits(cell.load(Ordering::Relaxed))
}

/// Runtime capture controls shared between the tick thread, the hotkey
/// handling and the configuration service
pub struct CaptureControls {
    muted: AtomicBool,
    ptt_enabled: AtomicBool,
    ptt_active: AtomicBool,
    input_gain: AtomicU32,
    broadcast_threshold: AtomicU32,
}

impl CaptureControls {
    pub fn new(ptt_enabled: bool, input_gain: f32, broadcast_threshold: f32) -> Self {
        let controls = Self {
            muted: AtomicBool::new(false),
            ptt_enabled: AtomicBool::new(ptt_enabled),
            ptt_active: AtomicBool::new(false),
            input_gain: AtomicU32::new(0),
            broadcast_threshold: AtomicU32::new(0),
        };
        controls.set_input_gain(input_gain);
        controls.set_broadcast_threshold(broadcast_threshold);
        controls
    }

    pub fn muted(&self) -> bool {
        self.muted.load(Ordering::Relaxed)
    }

    pub fn set_muted(&self, muted: bool) {
        self.muted.store(muted, Ordering::Relaxed);
    }

    /// Flip the self-mute flag, returning the new state
    pub fn toggle_muted(&self) -> bool {
        !self.muted.fetch_xor(true, Ordering::Relaxed)
    }

    pub fn ptt_enabled(&self) -> bool {
        self.ptt_enabled.load(Ordering::Relaxed)
    }

    pub fn set_ptt_enabled(&self, enabled: bool) {
        self.ptt_enabled.store(enabled, Ordering::Relaxed);
    }

    pub fn ptt_active(&self) -> bool {
        self.ptt_active.load(Ordering::Relaxed)
    }

    pub fn set_ptt_active(&self, active: bool) {
        self.ptt_active.store(active, Ordering::Relaxed);
    }

    pub fn input_gain(&self) -> f32 {
        load_f32(&self.input_gain)
    }

    pub fn set_input_gain(&self, gain: f32) {
        store_f32(&self.input_gain, gain.clamp(0.0, 5.0));
    }

    pub fn broadcast_threshold(&self) -> f32 {
        load_f32(&self.broadcast_threshold)
    }

    pub fn set_broadcast_threshold(&self, threshold: f32) {
        store_f32(&self.broadcast_threshold, threshold.clamp(0.0, 1.0));
    }
}

/// What a captured frame turns into on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FrameDisposition {
    /// Muted or PTT not held: silence, reported level 0
    Suppressed,
    /// Below the broadcast threshold: silence, real level reported
    BelowThreshold,
    /// Encode and transmit
    Transmit,
}

fn gate_frame(
    level: f32,
    muted: bool,
    ptt_enabled: bool,
    ptt_active: bool,
    threshold: f32,
) -> FrameDisposition {
    if muted || (ptt_enabled && !ptt_active) {
        FrameDisposition::Suppressed
    } else if level < threshold {
        FrameDisposition::BelowThreshold
    } else {
        FrameDisposition::Transmit
    }
}

/// Apply the input gain in fixed point with a double-precision intermediate
fn apply_input_gain(frame: &mut [i16], gain: f32) {
    if (gain - 1.0).abs() < f32::EPSILON {
        return;
    }
    let gain = gain as f64;
    for sample in frame.iter_mut() {
        let scaled = (*sample as f64 * gain).round();
        *sample = scaled.clamp(i16::MIN as f64, i16::MAX as f64) as i16;
    }
}

/// Microphone capture engine
pub struct CaptureEngine {
    running: Arc<AtomicBool>,
    controls: Arc<CaptureControls>,
    overflows: Arc<AtomicU64>,
    io_thread: Option<JoinHandle<()>>,
    tick_thread: Option<JoinHandle<()>>,
}

impl CaptureEngine {
    /// Open the capture device and start the framing loop.
    ///
    /// The cpal stream lives on a dedicated thread; device-open failures
    /// are reported synchronously.
    pub fn start(
        device_name: Option<String>,
        controls: Arc<CaptureControls>,
        events: mpsc::UnboundedSender<CaptureEvent>,
    ) -> Result<Self, AudioError> {
        let running = Arc::new(AtomicBool::new(true));
        let overflows = Arc::new(AtomicU64::new(0));

        let rb = HeapRb::<i16>::new(RING_CAPACITY);
        let (producer, consumer) = rb.split();

        let (ready_tx, ready_rx) = std::sync::mpsc::channel::<Result<(), AudioError>>();

        let io_running = running.clone();
        let io_overflows = overflows.clone();
        let io_thread = thread::Builder::new()
            .name("capture-io".into())
            .spawn(move || {
                capture_io_loop(device_name, producer, io_running, io_overflows, ready_tx)
            })
            .map_err(|e| AudioError::StreamError(e.to_string()))?;

        match ready_rx.recv_timeout(Duration::from_secs(5)) {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                running.store(false, Ordering::SeqCst);
                let _ = io_thread.join();
                return Err(e);
            }
            Err(_) => {
                running.store(false, Ordering::SeqCst);
                return Err(AudioError::StreamError("capture startup timed out".into()));
            }
        }

        let tick_running = running.clone();
        let tick_controls = controls.clone();
        let tick_thread = thread::Builder::new()
            .name("capture-tick".into())
            .spawn(move || capture_tick_loop(consumer, tick_controls, events, tick_running))
            .map_err(|e| AudioError::StreamError(e.to_string()))?;

        Ok(Self {
            running,
            controls,
            overflows,
            io_thread: Some(io_thread),
            tick_thread: Some(tick_thread),
        })
    }

    pub fn controls(&self) -> &Arc<CaptureControls> {
        &self.controls
    }

    /// Device-callback samples dropped because the ring buffer was full
    pub fn overflow_count(&self) -> u64 {
        self.overflows.load(Ordering::Relaxed)
    }

    /// Stop capture and join the worker threads
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.io_thread.take() {
            handle.thread().unpark();
            let _ = handle.join();
        }
        if let Some(handle) = self.tick_thread.take() {
            let _ = handle.join();
        }
        info!("Capture stopped");
    }
}

impl Drop for CaptureEngine {
    fn drop(&mut self) {
        self.stop();
    }
}

fn capture_io_loop(
    device_name: Option<String>,
    mut producer: ringbuf::HeapProd<i16>,
    running: Arc<AtomicBool>,
    overflows: Arc<AtomicU64>,
    ready_tx: std::sync::mpsc::Sender<Result<(), AudioError>>,
) {
    let device = match device::resolve_input_device(device_name.as_deref()) {
        Ok(d) => d,
        Err(e) => {
            let _ = ready_tx.send(Err(e));
            return;
        }
    };

    let device_label = device.name().unwrap_or_default();
    let stream_config = StreamConfig {
        channels: 1,
        sample_rate: cpal::SampleRate(SAMPLE_RATE),
        buffer_size: cpal::BufferSize::Default,
    };

    let err_fn = |err| error!("Capture stream error: {}", err);
    let stream = match device.build_input_stream(
        &stream_config,
        move |data: &[i16], _: &cpal::InputCallbackInfo| {
            let pushed = producer.push_slice(data);
            if pushed < data.len() {
                overflows.fetch_add((data.len() - pushed) as u64, Ordering::Relaxed);
                trace!("Capture ring full, dropped {} samples", data.len() - pushed);
            }
        },
        err_fn,
        None,
    ) {
        Ok(s) => s,
        Err(e) => {
            let _ = ready_tx.send(Err(AudioError::StreamError(e.to_string())));
            return;
        }
    };

    if let Err(e) = stream.play() {
        let _ = ready_tx.send(Err(AudioError::StreamError(e.to_string())));
        return;
    }

    info!("Capture started on device: {}", device_label);
    let _ = ready_tx.send(Ok(()));

    // The stream must stay alive on this thread; cpal streams are not Send
    while running.load(Ordering::SeqCst) {
        thread::park_timeout(Duration::from_millis(200));
    }
    drop(stream);
}

fn capture_tick_loop(
    mut consumer: ringbuf::HeapCons<i16>,
    controls: Arc<CaptureControls>,
    events: mpsc::UnboundedSender<CaptureEvent>,
    running: Arc<AtomicBool>,
) {
    let mut encoder = match VoiceEncoder::new() {
        Ok(e) => Some(e),
        Err(e) => {
            // Cadence continues with silence packets
            error!("Voice encoder unavailable: {}", e);
            None
        }
    };

    let mut frame = vec![0i16; FRAME_SAMPLES];
    let mut next_tick = Instant::now() + TICK;
    let mut last_level_emit = Instant::now();
    let mut starved_since: Option<Instant> = None;

    while running.load(Ordering::SeqCst) {
        let now = Instant::now();
        if now < next_tick {
            thread::sleep(next_tick - now);
        }
        next_tick += TICK;

        if consumer.occupied_len() < FRAME_SAMPLES {
            // Device starvation: keep the packet cadence with silence and
            // let the watchdog keep the level stream alive
            if events.send(CaptureEvent::Packet(Vec::new())).is_err() {
                break;
            }
            if starved_since.is_none() {
                starved_since = Some(now);
                warn!("Capture ring starved, emitting silence");
            }
            if last_level_emit.elapsed() > LEVEL_WATCHDOG {
                let _ = events.send(CaptureEvent::Level(0.0));
                last_level_emit = Instant::now();
            }
            continue;
        }
        starved_since = None;

        consumer.pop_slice(&mut frame);
        apply_input_gain(&mut frame, controls.input_gain());

        let level = codec::peak_level(&frame);
        let disposition = gate_frame(
            level,
            controls.muted(),
            controls.ptt_enabled(),
            controls.ptt_active(),
            controls.broadcast_threshold(),
        );

        let (reported_level, packet) = match disposition {
            FrameDisposition::Suppressed => (0.0, Vec::new()),
            FrameDisposition::BelowThreshold => (level, Vec::new()),
            FrameDisposition::Transmit => {
                let packet = encoder
                    .as_mut()
                    .map(|enc| enc.encode(&frame))
                    .unwrap_or_default();
                (level, packet)
            }
        };

        if events.send(CaptureEvent::Level(reported_level)).is_err() {
            break;
        }
        last_level_emit = Instant::now();
        if events.send(CaptureEvent::Packet(packet)).is_err() {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gate_muted_suppresses() {
        let d = gate_frame(0.9, true, false, false, 0.1);
        assert_eq!(d, FrameDisposition::Suppressed);
    }

    #[test]
    fn test_gate_ptt_released_suppresses() {
        let d = gate_frame(0.9, false, true, false, 0.1);
        assert_eq!(d, FrameDisposition::Suppressed);
    }

    #[test]
    fn test_gate_ptt_held_transmits() {
        let d = gate_frame(0.9, false, true, true, 0.1);
        assert_eq!(d, FrameDisposition::Transmit);
    }

    #[test]
    fn test_gate_below_threshold_keeps_level() {
        // level 0.05 under threshold 0.1: silence packet, level preserved
        let d = gate_frame(0.05, false, false, false, 0.1);
        assert_eq!(d, FrameDisposition::BelowThreshold);

        let d = gate_frame(0.2, false, false, false, 0.1);
        assert_eq!(d, FrameDisposition::Transmit);
    }

    #[test]
    fn test_apply_input_gain_scales_and_clamps() {
        let mut frame = vec![1000, -1000, 20000, i16::MIN];
        apply_input_gain(&mut frame, 2.0);
        assert_eq!(frame[0], 2000);
        assert_eq!(frame[1], -2000);
        assert_eq!(frame[2], i16::MAX);
        assert_eq!(frame[3], i16::MIN);
    }

    #[test]
    fn test_apply_unity_gain_is_identity() {
        let mut frame = vec![123, -456, 789];
        apply_input_gain(&mut frame, 1.0);
        assert_eq!(frame, vec![123, -456, 789]);
    }

    #[test]
    fn test_controls_clamp_ranges() {
        let controls = CaptureControls::new(false, 9.0, 4.0);
        assert_eq!(controls.input_gain(), 5.0);
        assert_eq!(controls.broadcast_threshold(), 1.0);

        controls.set_input_gain(-1.0);
        assert_eq!(controls.input_gain(), 0.0);
    }

    #[test]
    fn test_toggle_muted() {
        let controls = CaptureControls::new(false, 1.0, 0.0);
        assert!(!controls.muted());
        assert!(controls.toggle_muted());
        assert!(controls.muted());
        assert!(!controls.toggle_muted());
        assert!(!controls.muted());
    }
}
