//! Game-data position source
//!
//! Connects to the local provider over a named IPC endpoint, performs the
//! magic echo handshake and then reads heartbeat bytes and 64-byte records
//! until the stream dies. Reconnects with bounded exponential backoff.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::error::PositionError;
use super::wire::{
    parse_record, PositionSample, SampleValidator, HANDSHAKE_MAGIC, HEARTBEAT_BYTE, RECORD_SIZE,
};

/// Name of the IPC endpoint, in the host OS convention
#[cfg(unix)]
pub const ENDPOINT: &str = "/tmp/proxchat-gamedata.sock";
#[cfg(windows)]
pub const ENDPOINT: &str = r"\\.\pipe\proxchat-gamedata";

/// Interval for the outbound single-byte heartbeat
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(4);

/// Inbound silence longer than 3x the provider heartbeat interval means
/// the connection is dead
const READ_TIMEOUT: Duration = Duration::from_secs(15);

/// Reconnect backoff bounds
const BACKOFF_INITIAL: Duration = Duration::from_millis(500);
const BACKOFF_MAX: Duration = Duration::from_secs(10);

/// Events emitted by the position source
#[derive(Debug, Clone, PartialEq)]
pub enum PositionEvent {
    Connected,
    Disconnected,
    Sample(PositionSample),
}

trait IpcStream: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> IpcStream for T {}

#[cfg(unix)]
async fn connect_endpoint() -> std::io::Result<Box<dyn IpcStream>> {
    let stream = tokio::net::UnixStream::connect(ENDPOINT).await?;
    Ok(Box::new(stream))
}

#[cfg(windows)]
async fn connect_endpoint() -> std::io::Result<Box<dyn IpcStream>> {
    let stream = tokio::net::windows::named_pipe::ClientOptions::new().open(ENDPOINT)?;
    Ok(Box::new(stream))
}

/// Doubling backoff with an upper bound
struct Backoff {
    delay: Duration,
}

impl Backoff {
    fn new() -> Self {
        Self { delay: BACKOFF_INITIAL }
    }

    fn next(&mut self) -> Duration {
        let current = self.delay;
        self.delay = (self.delay * 2).min(BACKOFF_MAX);
        current
    }

    fn reset(&mut self) {
        self.delay = BACKOFF_INITIAL;
    }
}

fn now_unix_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Handle to the reader task
pub struct PositionSource {
    running: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl PositionSource {
    /// Spawn the reader task; it keeps reconnecting until stopped
    pub fn start(events: mpsc::UnboundedSender<PositionEvent>) -> Self {
        let running = Arc::new(AtomicBool::new(true));
        let task_running = running.clone();
        let handle = tokio::spawn(async move {
            reader_loop(events, task_running).await;
        });

        Self {
            running,
            handle: Some(handle),
        }
    }

    /// Stop reading; the task ends at its next reconnect or read timeout
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

impl Drop for PositionSource {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn reader_loop(events: mpsc::UnboundedSender<PositionEvent>, running: Arc<AtomicBool>) {
    let mut backoff = Backoff::new();

    while running.load(Ordering::SeqCst) {
        match connect_endpoint().await {
            Ok(stream) => {
                info!("Connected to game-data provider at {}", ENDPOINT);
                backoff.reset();
                if events.send(PositionEvent::Connected).is_err() {
                    return;
                }

                match run_stream(stream, &events, &running).await {
                    Ok(()) => debug!("Game-data stream ended"),
                    Err(e) => warn!("Game-data stream error: {}", e),
                }

                if events.send(PositionEvent::Disconnected).is_err() {
                    return;
                }
            }
            Err(e) => {
                debug!("Game-data provider unavailable: {}", e);
            }
        }

        if !running.load(Ordering::SeqCst) {
            return;
        }
        tokio::time::sleep(backoff.next()).await;
    }
}

/// Drive one connected stream until it errors, desynchronizes or times out
async fn run_stream(
    mut stream: Box<dyn IpcStream>,
    events: &mpsc::UnboundedSender<PositionEvent>,
    running: &Arc<AtomicBool>,
) -> Result<(), PositionError> {
    // Magic echo handshake
    stream.write_all(&HANDSHAKE_MAGIC).await?;
    let mut echo = [0u8; 4];
    tokio::time::timeout(READ_TIMEOUT, stream.read_exact(&mut echo))
        .await
        .map_err(|_| PositionError::ProviderSilent)??;
    if echo != HANDSHAKE_MAGIC {
        return Err(PositionError::HandshakeFailed(echo));
    }
    debug!("Game-data handshake complete");

    let (mut reader, mut writer) = tokio::io::split(stream);

    // Outbound keep-alives run independently of the read cadence
    let heartbeat = tokio::spawn(async move {
        loop {
            tokio::time::sleep(HEARTBEAT_INTERVAL).await;
            if writer.write_all(&[HEARTBEAT_BYTE]).await.is_err() {
                break;
            }
        }
    });

    let result = read_records(&mut reader, events, running).await;
    heartbeat.abort();
    result
}

async fn read_records(
    reader: &mut (impl AsyncRead + Unpin),
    events: &mpsc::UnboundedSender<PositionEvent>,
    running: &Arc<AtomicBool>,
) -> Result<(), PositionError> {
    // The provider restarts sequence numbering per connection
    let mut validator = SampleValidator::new();
    let mut record = [0u8; RECORD_SIZE];

    loop {
        if !running.load(Ordering::SeqCst) {
            return Ok(());
        }

        let first = tokio::time::timeout(READ_TIMEOUT, reader.read_u8())
            .await
            .map_err(|_| PositionError::ProviderSilent)??;

        if first == HEARTBEAT_BYTE {
            continue;
        }

        record[0] = first;
        tokio::time::timeout(READ_TIMEOUT, reader.read_exact(&mut record[1..]))
            .await
            .map_err(|_| PositionError::ProviderSilent)??;

        let Some(parsed) = parse_record(&record) else {
            // Unknown type means we lost framing; force a reconnect
            let msg_type = u32::from_le_bytes([record[0], record[1], record[2], record[3]]);
            return Err(PositionError::Desynchronized(msg_type));
        };

        if validator.accept(&parsed, now_unix_ms()) {
            if events
                .send(PositionEvent::Sample(PositionSample::from(parsed)))
                .is_err()
            {
                return Ok(());
            }
        }
        // Rejected samples (stale, replayed, unsuccessful) drop silently
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_to_cap() {
        let mut backoff = Backoff::new();
        assert_eq!(backoff.next(), Duration::from_millis(500));
        assert_eq!(backoff.next(), Duration::from_secs(1));
        assert_eq!(backoff.next(), Duration::from_secs(2));
        assert_eq!(backoff.next(), Duration::from_secs(4));
        assert_eq!(backoff.next(), Duration::from_secs(8));
        assert_eq!(backoff.next(), Duration::from_secs(10));
        assert_eq!(backoff.next(), Duration::from_secs(10));

        backoff.reset();
        assert_eq!(backoff.next(), Duration::from_millis(500));
    }

    #[test]
    fn test_now_unix_ms_is_sane() {
        // sometime after 2020
        assert!(now_unix_ms() > 1_577_836_800_000);
    }

    #[cfg(unix)]
    mod stream_tests {
        use super::super::*;
        use tokio::io::AsyncWriteExt;

        fn record_for(sequence: u32, timestamp_ms: u64, success: bool) -> [u8; RECORD_SIZE] {
            let mut buf = [0u8; RECORD_SIZE];
            buf[0..4].copy_from_slice(&1u32.to_le_bytes());
            buf[4..8].copy_from_slice(&sequence.to_le_bytes());
            buf[8..16].copy_from_slice(&timestamp_ms.to_le_bytes());
            buf[16..20].copy_from_slice(&10i32.to_le_bytes());
            buf[20..24].copy_from_slice(&20i32.to_le_bytes());
            buf[24..26].copy_from_slice(&3u16.to_le_bytes());
            buf[28..32].copy_from_slice(b"town");
            buf[44..48].copy_from_slice(b"Hero");
            buf[56..60].copy_from_slice(&(success as u32).to_le_bytes());
            buf
        }

        /// Drive `run_stream` against an in-process provider on a socket pair
        #[tokio::test]
        async fn test_handshake_and_sample_flow() {
            let (client, mut provider) = tokio::io::duplex(4096);
            let (tx, mut rx) = mpsc::unbounded_channel();
            let running = Arc::new(AtomicBool::new(true));

            let reader = tokio::spawn(async move {
                let _ = run_stream(Box::new(client), &tx, &running).await;
            });

            // Echo the magic back
            let mut magic = [0u8; 4];
            provider.read_exact(&mut magic).await.unwrap();
            assert_eq!(magic, HANDSHAKE_MAGIC);
            provider.write_all(&magic).await.unwrap();

            // Heartbeat, then a fresh successful record
            provider.write_all(&[HEARTBEAT_BYTE]).await.unwrap();
            provider
                .write_all(&record_for(1, now_unix_ms(), true))
                .await
                .unwrap();

            match rx.recv().await.unwrap() {
                PositionEvent::Sample(sample) => {
                    assert_eq!(sample.x, 10);
                    assert_eq!(sample.y, 20);
                    assert_eq!(sample.map_id, 3);
                    assert_eq!(sample.map_name, "town");
                    assert_eq!(sample.character_name, "Hero");
                    assert!(sample.success);
                }
                other => panic!("expected sample, got {:?}", other),
            }

            drop(provider);
            reader.await.unwrap();
        }

        #[tokio::test]
        async fn test_stale_sample_is_dropped() {
            let (client, mut provider) = tokio::io::duplex(4096);
            let (tx, mut rx) = mpsc::unbounded_channel();
            let running = Arc::new(AtomicBool::new(true));

            let reader = tokio::spawn(async move {
                let _ = run_stream(Box::new(client), &tx, &running).await;
            });

            let mut magic = [0u8; 4];
            provider.read_exact(&mut magic).await.unwrap();
            provider.write_all(&magic).await.unwrap();

            // 11 s old: no event; then a fresh one: event
            provider
                .write_all(&record_for(1, now_unix_ms() - 11_000, true))
                .await
                .unwrap();
            provider
                .write_all(&record_for(2, now_unix_ms(), true))
                .await
                .unwrap();

            match rx.recv().await.unwrap() {
                PositionEvent::Sample(sample) => {
                    // the stale sample never surfaced
                    assert!(now_unix_ms() - sample.timestamp_ms < 5_000);
                }
                other => panic!("expected sample, got {:?}", other),
            }

            drop(provider);
            reader.await.unwrap();
        }

        #[tokio::test]
        async fn test_bad_handshake_fails() {
            let (client, mut provider) = tokio::io::duplex(64);
            let (tx, _rx) = mpsc::unbounded_channel();
            let running = Arc::new(AtomicBool::new(true));

            let reader = tokio::spawn(async move { run_stream(Box::new(client), &tx, &running).await });

            let mut magic = [0u8; 4];
            provider.read_exact(&mut magic).await.unwrap();
            provider.write_all(b"NOPE").await.unwrap();

            match reader.await.unwrap() {
                Err(PositionError::HandshakeFailed(echo)) => assert_eq!(&echo, b"NOPE"),
                other => panic!("expected handshake failure, got {:?}", other),
            }
        }

        #[tokio::test]
        async fn test_unknown_record_type_desynchronizes() {
            let (client, mut provider) = tokio::io::duplex(4096);
            let (tx, _rx) = mpsc::unbounded_channel();
            let running = Arc::new(AtomicBool::new(true));

            let reader = tokio::spawn(async move { run_stream(Box::new(client), &tx, &running).await });

            let mut magic = [0u8; 4];
            provider.read_exact(&mut magic).await.unwrap();
            provider.write_all(&magic).await.unwrap();

            let mut bogus = [0u8; RECORD_SIZE];
            bogus[0..4].copy_from_slice(&7u32.to_le_bytes());
            provider.write_all(&bogus).await.unwrap();

            match reader.await.unwrap() {
                Err(PositionError::Desynchronized(7)) => {}
                other => panic!("expected desync, got {:?}", other),
            }
        }
    }
}
