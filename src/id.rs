use crate::error::{ForumError, ForumResult};
use chrono::{TimeZone, Utc};
use parking_lot::Mutex;

const NODE_BITS: u32 = 10;
const SEQUENCE_BITS: u32 = 12;
const MAX_NODE: u16 = (1 << NODE_BITS) - 1;
const SEQUENCE_MASK: i64 = (1 << SEQUENCE_BITS) - 1;

/// Source of globally unique, time-ordered 64-bit ids
pub trait IdGenerator: Send + Sync {
    fn next_id(&self) -> ForumResult<i64>;
}

/// Snowflake layout: 41 bits of milliseconds, 10 bits of node, 12 bits of sequence
pub struct SnowflakeGenerator {
    node: i64,
    epoch_ms: i64,
    /// (last millisecond, sequence within it)
    state: Mutex<(i64, i64)>,
}

impl SnowflakeGenerator {
    pub fn new(node: u16) -> ForumResult<Self> {
        if node > MAX_NODE {
            return Err(ForumError::ConfigError(format!("Node id {} exceeds {}", node, MAX_NODE)));
        }
        let epoch_ms = Utc
            .with_ymd_and_hms(2024, 1, 1, 0, 0, 0)
            .single()
            .map(|epoch| epoch.timestamp_millis())
            .ok_or_else(|| ForumError::Internal("Invalid snowflake epoch".to_string()))?;

        Ok(Self {
            node: node as i64,
            epoch_ms,
            state: Mutex::new((0, 0)),
        })
    }

    fn elapsed_ms(&self) -> i64 {
        Utc::now().timestamp_millis() - self.epoch_ms
    }
}

impl IdGenerator for SnowflakeGenerator {
    fn next_id(&self) -> ForumResult<i64> {
        let mut state = self.state.lock();
        let (last_ms, sequence) = *state;

        // a clock stepping backwards reuses the last millisecond
        let elapsed = self.elapsed_ms();
        let mut now_ms = elapsed.max(last_ms);
        let mut next_sequence = 0;
        if now_ms == last_ms {
            next_sequence = (sequence + 1) & SEQUENCE_MASK;
            if next_sequence == 0 {
                if elapsed < last_ms {
                    return Err(ForumError::Internal(format!(
                        "Clock moved backwards by {}ms with sequence exhausted",
                        last_ms - elapsed
                    )));
                }
                // at most one millisecond
                while now_ms <= last_ms {
                    std::hint::spin_loop();
                    now_ms = self.elapsed_ms();
                }
            }
        }

        *state = (now_ms, next_sequence);
        Ok((now_ms << (NODE_BITS + SEQUENCE_BITS)) | (self.node << SEQUENCE_BITS) | next_sequence)
    }
}
