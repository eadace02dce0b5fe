//! Wire format of the game-data IPC channel
//!
//! Record layout (64 bytes, little-endian):
//!
//! ```text
//!  0:4   message_type (u32)      1 = game-data
//!  4:4   sequence_number (u32)
//!  8:8   timestamp_ms (u64, unix-ms UTC)
//! 16:4   x (i32)
//! 20:4   y (i32)
//! 24:2   map_id (u16)
//! 26:2   reserved
//! 28:16  map_name (utf-8, NUL-terminated)
//! 44:12  character_name (utf-8, NUL-terminated)
//! 56:4   flags (bit 0 = success)
//! 60:4   reserved
//! ```
//!
//! Heartbeats are single `0xFF` bytes between records; a record always
//! starts with `message_type = 1`, so the first byte of a record can never
//! be mistaken for a heartbeat.

/// Size of one game-data record
pub const RECORD_SIZE: usize = 64;

/// Heartbeat byte interleaved with records
pub const HEARTBEAT_BYTE: u8 = 0xFF;

/// Handshake magic; the provider echoes it back verbatim
pub const HANDSHAKE_MAGIC: [u8; 4] = *b"PXCT";

/// `message_type` of a game-data record
pub const MSG_GAME_DATA: u32 = 1;

/// Samples older than this are dropped
pub const MAX_SAMPLE_AGE_MS: u64 = 10_000;

/// A parsed game-data record
#[derive(Debug, Clone, PartialEq)]
pub struct GameDataRecord {
    pub sequence: u32,
    pub timestamp_ms: u64,
    pub x: i32,
    pub y: i32,
    pub map_id: u16,
    pub map_name: String,
    pub character_name: String,
    pub success: bool,
}

/// A validated local position, as handed to the orchestrator
#[derive(Debug, Clone, PartialEq)]
pub struct PositionSample {
    pub timestamp_ms: u64,
    pub success: bool,
    pub map_id: u16,
    pub map_name: String,
    pub x: i32,
    pub y: i32,
    pub character_name: String,
}

impl From<GameDataRecord> for PositionSample {
    fn from(rec: GameDataRecord) -> Self {
        Self {
            timestamp_ms: rec.timestamp_ms,
            success: rec.success,
            map_id: rec.map_id,
            map_name: rec.map_name,
            x: rec.x,
            y: rec.y,
            character_name: rec.character_name,
        }
    }
}

fn read_u32(buf: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]])
}

fn read_i32(buf: &[u8], at: usize) -> i32 {
    i32::from_le_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]])
}

fn read_u64(buf: &[u8], at: usize) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&buf[at..at + 8]);
    u64::from_le_bytes(bytes)
}

/// Read a NUL-terminated UTF-8 string from a fixed-size field
fn read_cstr(field: &[u8]) -> String {
    let end = field.iter().position(|&b| b == 0).unwrap_or(field.len());
    String::from_utf8_lossy(&field[..end]).into_owned()
}

/// Parse one 64-byte record. Returns `None` for unknown message types.
pub fn parse_record(buf: &[u8; RECORD_SIZE]) -> Option<GameDataRecord> {
    if read_u32(buf, 0) != MSG_GAME_DATA {
        return None;
    }

    Some(GameDataRecord {
        sequence: read_u32(buf, 4),
        timestamp_ms: read_u64(buf, 8),
        x: read_i32(buf, 16),
        y: read_i32(buf, 20),
        map_id: u16::from_le_bytes([buf[24], buf[25]]),
        map_name: read_cstr(&buf[28..44]),
        character_name: read_cstr(&buf[44..56]),
        success: read_u32(buf, 56) & 1 != 0,
    })
}

/// Sequence and freshness gate for incoming records
#[derive(Debug, Default)]
pub struct SampleValidator {
    last_sequence: Option<u32>,
}

impl SampleValidator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Accept a record if it advances the sequence, reports success and is
    /// no older than 10 s. Accepted records update the sequence watermark.
    pub fn accept(&mut self, record: &GameDataRecord, now_ms: u64) -> bool {
        if let Some(last) = self.last_sequence {
            if record.sequence <= last {
                return false;
            }
        }
        if !record.success {
            return false;
        }
        if now_ms.saturating_sub(record.timestamp_ms) > MAX_SAMPLE_AGE_MS {
            return false;
        }

        self.last_sequence = Some(record.sequence);
        true
    }

    /// Forget the watermark (used across reconnects: the provider may
    /// restart its sequence numbering)
    pub fn reset(&mut self) {
        self.last_sequence = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record_bytes(
        msg_type: u32,
        sequence: u32,
        timestamp_ms: u64,
        x: i32,
        y: i32,
        map_id: u16,
        map_name: &str,
        character_name: &str,
        success: bool,
    ) -> [u8; RECORD_SIZE] {
        let mut buf = [0u8; RECORD_SIZE];
        buf[0..4].copy_from_slice(&msg_type.to_le_bytes());
        buf[4..8].copy_from_slice(&sequence.to_le_bytes());
        buf[8..16].copy_from_slice(&timestamp_ms.to_le_bytes());
        buf[16..20].copy_from_slice(&x.to_le_bytes());
        buf[20..24].copy_from_slice(&y.to_le_bytes());
        buf[24..26].copy_from_slice(&map_id.to_le_bytes());
        buf[28..28 + map_name.len()].copy_from_slice(map_name.as_bytes());
        buf[44..44 + character_name.len()].copy_from_slice(character_name.as_bytes());
        buf[56..60].copy_from_slice(&(success as u32).to_le_bytes());
        buf
    }

    #[test]
    fn test_parse_record_roundtrip() {
        let buf = record_bytes(1, 42, 1_700_000_000_000, -15, 230, 7, "overworld", "Mira", true);
        let rec = parse_record(&buf).unwrap();

        assert_eq!(rec.sequence, 42);
        assert_eq!(rec.timestamp_ms, 1_700_000_000_000);
        assert_eq!(rec.x, -15);
        assert_eq!(rec.y, 230);
        assert_eq!(rec.map_id, 7);
        assert_eq!(rec.map_name, "overworld");
        assert_eq!(rec.character_name, "Mira");
        assert!(rec.success);
    }

    #[test]
    fn test_parse_unknown_type_is_none() {
        let buf = record_bytes(9, 1, 0, 0, 0, 0, "", "", true);
        assert!(parse_record(&buf).is_none());
    }

    #[test]
    fn test_cstr_fills_whole_field() {
        // exactly 16 bytes of map name, no NUL
        let buf = record_bytes(1, 1, 0, 0, 0, 0, "sixteen-bytes-xy", "Char", true);
        let rec = parse_record(&buf).unwrap();
        assert_eq!(rec.map_name, "sixteen-bytes-xy");
    }

    #[test]
    fn test_validator_rejects_stale_sequence() {
        let mut validator = SampleValidator::new();
        let now = 1_000_000;
        let rec = parse_record(&record_bytes(1, 10, now, 0, 0, 1, "m", "c", true)).unwrap();
        assert!(validator.accept(&rec, now));

        // same and lower sequence numbers are replays
        assert!(!validator.accept(&rec, now));
        let old = parse_record(&record_bytes(1, 9, now, 0, 0, 1, "m", "c", true)).unwrap();
        assert!(!validator.accept(&old, now));

        let next = parse_record(&record_bytes(1, 11, now, 0, 0, 1, "m", "c", true)).unwrap();
        assert!(validator.accept(&next, now));
    }

    #[test]
    fn test_validator_rejects_failure_flag() {
        let mut validator = SampleValidator::new();
        let rec = parse_record(&record_bytes(1, 1, 1000, 0, 0, 1, "m", "c", false)).unwrap();
        assert!(!validator.accept(&rec, 1000));
    }

    #[test]
    fn test_validator_rejects_old_samples() {
        let mut validator = SampleValidator::new();
        let now: u64 = 20_000_000;

        // 11 s old: dropped
        let rec =
            parse_record(&record_bytes(1, 1, now - 11_000, 0, 0, 1, "m", "c", true)).unwrap();
        assert!(!validator.accept(&rec, now));

        // 9 s old: accepted
        let rec =
            parse_record(&record_bytes(1, 2, now - 9_000, 0, 0, 1, "m", "c", true)).unwrap();
        assert!(validator.accept(&rec, now));
    }

    #[test]
    fn test_validator_accepts_future_timestamps() {
        // clock skew forwards is not staleness
        let mut validator = SampleValidator::new();
        let rec = parse_record(&record_bytes(1, 1, 5000, 0, 0, 1, "m", "c", true)).unwrap();
        assert!(validator.accept(&rec, 1000));
    }

    #[test]
    fn test_validator_reset_forgets_watermark() {
        let mut validator = SampleValidator::new();
        let now = 1000;
        let rec = parse_record(&record_bytes(1, 50, now, 0, 0, 1, "m", "c", true)).unwrap();
        assert!(validator.accept(&rec, now));

        validator.reset();
        let lower = parse_record(&record_bytes(1, 3, now, 0, 0, 1, "m", "c", true)).unwrap();
        assert!(validator.accept(&lower, now));
    }

    #[test]
    fn test_heartbeat_cannot_alias_record_start() {
        // a record's first byte is the LSB of message_type = 1
        let buf = record_bytes(MSG_GAME_DATA, 1, 0, 0, 0, 0, "", "", true);
        assert_ne!(buf[0], HEARTBEAT_BYTE);
    }
}
