//! Per-peer playback sinks
//!
//! Each peer gets its own output stream at 48 kHz stereo with a 200 ms
//! ring buffer. Writes discard on overflow; the device callback zero-fills
//! on underrun. The cpal stream lives on a dedicated thread because
//! streams are not Send.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use cpal::traits::{DeviceTrait, StreamTrait};
use cpal::StreamConfig;
use parking_lot::Mutex;
use ringbuf::traits::{Consumer, Producer, Split};
use ringbuf::HeapRb;
use tracing::{debug, error};

use super::codec::SAMPLE_RATE;
use super::device;
use super::error::AudioError;

/// Playback channel count (stereo for panning)
pub const PLAYBACK_CHANNELS: u16 = 2;

/// Sink buffering: 200 ms of stereo audio
const SINK_CAPACITY: usize = (SAMPLE_RATE as usize / 5) * PLAYBACK_CHANNELS as usize;

/// A jitter-buffered playback sink for one peer
pub struct PeerSink {
    producer: Mutex<ringbuf::HeapProd<i16>>,
    running: Arc<AtomicBool>,
    discarded: AtomicU64,
    thread: Option<JoinHandle<()>>,
}

impl PeerSink {
    /// Open a sink on the default output device.
    ///
    /// Device failures are recoverable: the sink still accepts frames (and
    /// discards them once full) so callers never have to special-case a
    /// missing output device.
    pub fn open(peer_id: &str) -> Result<Self, AudioError> {
        let rb = HeapRb::<i16>::new(SINK_CAPACITY);
        let (producer, consumer) = rb.split();
        let running = Arc::new(AtomicBool::new(true));

        let thread_running = running.clone();
        let label = peer_id.to_string();
        let thread = thread::Builder::new()
            .name(format!("playback-{}", &label[..label.len().min(8)]))
            .spawn(move || playback_loop(label, consumer, thread_running))
            .map_err(|e| AudioError::StreamError(e.to_string()))?;

        Ok(Self {
            producer: Mutex::new(producer),
            running,
            discarded: AtomicU64::new(0),
            thread: Some(thread),
        })
    }

    /// Queue interleaved stereo samples, discarding on overflow.
    /// Returns the number of samples actually queued.
    pub fn push(&self, samples: &[i16]) -> usize {
        let pushed = self.producer.lock().push_slice(samples);
        if pushed < samples.len() {
            self.discarded
                .fetch_add((samples.len() - pushed) as u64, Ordering::Relaxed);
        }
        pushed
    }

    /// Samples dropped because the sink buffer was full
    pub fn discarded_count(&self) -> u64 {
        self.discarded.load(Ordering::Relaxed)
    }

    /// Stop playback and join the stream thread
    pub fn close(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.thread.take() {
            handle.thread().unpark();
            let _ = handle.join();
        }
    }
}

impl Drop for PeerSink {
    fn drop(&mut self) {
        self.close();
    }
}

fn playback_loop(peer_id: String, consumer: ringbuf::HeapCons<i16>, running: Arc<AtomicBool>) {
    let device = match device::resolve_output_device() {
        Ok(d) => d,
        Err(e) => {
            error!("No playback device for peer {}: {}", peer_id, e);
            return;
        }
    };

    let stream_config = StreamConfig {
        channels: PLAYBACK_CHANNELS,
        sample_rate: cpal::SampleRate(SAMPLE_RATE),
        buffer_size: cpal::BufferSize::Default,
    };

    let consumer = Arc::new(Mutex::new(consumer));
    let cb_consumer = consumer.clone();
    let err_fn = |err| error!("Playback stream error: {}", err);

    let stream = match device.build_output_stream(
        &stream_config,
        move |data: &mut [i16], _: &cpal::OutputCallbackInfo| {
            let mut cons = cb_consumer.lock();
            for sample in data.iter_mut() {
                *sample = cons.try_pop().unwrap_or(0);
            }
        },
        err_fn,
        None,
    ) {
        Ok(s) => s,
        Err(e) => {
            error!("Failed to open playback stream for peer {}: {}", peer_id, e);
            return;
        }
    };

    if let Err(e) = stream.play() {
        error!("Failed to start playback for peer {}: {}", peer_id, e);
        return;
    }

    debug!("Playback sink opened for peer {}", peer_id);
    while running.load(Ordering::SeqCst) {
        thread::park_timeout(Duration::from_millis(200));
    }
    drop(stream);
    debug!("Playback sink closed for peer {}", peer_id);
}
