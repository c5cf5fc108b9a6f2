//! Write-cache watermarks
//!
//! Tracks the number of bytes queued on a channel but not yet written to the
//! socket, and reports edge-triggered crossings of the configured watermarks.

use crate::error::PoolError;
use crate::handle::SessionState;
use serde::{Deserialize, Serialize};

/// Low/high thresholds on a channel's write cache, in bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Watermarks {
    /// Level at or below which the cache is considered drained
    pub low: usize,
    /// Level at or above which the cache is considered congested
    pub high: usize,
}

impl Watermarks {
    /// Create validated watermarks
    pub fn new(low: usize, high: usize) -> Result<Self, PoolError> {
        if low > high {
            return Err(PoolError::InvalidArgument(format!(
                "low watermark {} exceeds high watermark {}",
                low, high
            )));
        }
        Ok(Watermarks { low, high })
    }
}

/// Watermark crossing reported by [`WriteCacheMonitor`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatermarkEvent {
    /// The cache reached the high watermark
    High,
    /// The cache drained back to the low watermark
    Low,
}

impl From<WatermarkEvent> for SessionState {
    fn from(event: WatermarkEvent) -> Self {
        match event {
            WatermarkEvent::High => SessionState::WriteCacheHiWat,
            WatermarkEvent::Low => SessionState::WriteCacheLowWat,
        }
    }
}

/// Edge-triggered write-cache occupancy tracker
///
/// `High` fires once when the cache reaches the high watermark and is not
/// repeated until a `Low` has been reported, which happens once the cache
/// drains to the low watermark.
#[derive(Debug, Clone)]
pub struct WriteCacheMonitor {
    size: usize,
    marks: Watermarks,
    congested: bool,
}

impl WriteCacheMonitor {
    /// Create an empty monitor
    pub fn new(marks: Watermarks) -> Self {
        WriteCacheMonitor {
            size: 0,
            marks,
            congested: false,
        }
    }

    /// Bytes currently cached
    pub fn size(&self) -> usize {
        self.size
    }

    /// Current thresholds
    pub fn watermarks(&self) -> Watermarks {
        self.marks
    }

    /// Whether a `High` has been reported without a matching `Low`
    pub fn is_congested(&self) -> bool {
        self.congested
    }

    /// Account for `bytes` queued for writing
    pub fn enqueue(&mut self, bytes: usize) -> Option<WatermarkEvent> {
        self.size = self.size.saturating_add(bytes);
        self.evaluate()
    }

    /// Account for `bytes` written to the socket
    pub fn dequeue(&mut self, bytes: usize) -> Option<WatermarkEvent> {
        self.size = self.size.saturating_sub(bytes);
        self.evaluate()
    }

    /// Replace the thresholds and re-check the current occupancy
    pub fn set_watermarks(&mut self, marks: Watermarks) -> Option<WatermarkEvent> {
        self.marks = marks;
        self.evaluate()
    }

    fn evaluate(&mut self) -> Option<WatermarkEvent> {
        if self.congested {
            if self.size <= self.marks.low {
                self.congested = false;
                return Some(WatermarkEvent::Low);
            }
        } else if self.size > 0 && self.size >= self.marks.high {
            self.congested = true;
            return Some(WatermarkEvent::High);
        }
        None
    }
}
