//! Media-stream frame accounting.
//!
//! The client walks the datagram stream by sequence number and partitions
//! every arrival into successful, dropped, duplicate, or error frames. Stream
//! position advances over gaps so a lossy path still reaches the configured
//! transfer size: dropped frames are accounted as consumed stream bytes, they
//! just never count as successful.

use protocol_traffic::{DatagramHeader, FrameTag, decode_tag};

use crate::metrics;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FrameCounts {
    pub successful: u64,
    pub dropped: u64,
    pub duplicate: u64,
    pub error: u64,
}

impl FrameCounts {
    pub fn total(&self) -> u64 {
        self.successful + self.dropped + self.duplicate + self.error
    }
}

/// Outcome of classifying one received datagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameOutcome {
    /// The next expected frame, or a frame beyond a gap; `advance` is the
    /// number of stream bytes consumed (the frame itself plus any frames
    /// skipped over).
    Accepted { advance: u64 },
    /// A frame at or behind the current position; consumes no stream bytes.
    Duplicate,
    /// Failed validation; consumes no stream bytes.
    Invalid,
}

pub struct MediaTracker {
    frame_size: u64,
    next_sequence: i64,
    counts: FrameCounts,
}

impl MediaTracker {
    pub fn new(frame_size: u32) -> Self {
        Self {
            frame_size: frame_size as u64,
            next_sequence: 0,
            counts: FrameCounts::default(),
        }
    }

    pub fn counts(&self) -> FrameCounts {
        self.counts
    }

    /// Classify a received datagram and update the frame counters.
    pub fn record_datagram(&mut self, datagram: &[u8]) -> FrameOutcome {
        match decode_tag(datagram) {
            Ok(FrameTag::Data) => {}
            Ok(FrameTag::ConnectionId) | Err(_) => {
                self.counts.error += 1;
                metrics::FRAMES_ERROR.increment();
                return FrameOutcome::Invalid;
            }
        }
        let header = match DatagramHeader::decode(datagram) {
            Ok(header) => header,
            Err(_) => {
                self.counts.error += 1;
                metrics::FRAMES_ERROR.increment();
                return FrameOutcome::Invalid;
            }
        };
        self.record_sequence(header.sequence)
    }

    /// Classify by sequence number alone.
    pub fn record_sequence(&mut self, sequence: i64) -> FrameOutcome {
        if sequence < self.next_sequence {
            self.counts.duplicate += 1;
            metrics::FRAMES_DUPLICATE.increment();
            return FrameOutcome::Duplicate;
        }

        let gap = (sequence - self.next_sequence) as u64;
        if gap > 0 {
            self.counts.dropped += gap;
            metrics::FRAMES_DROPPED.add(gap);
        }
        self.counts.successful += 1;
        metrics::FRAMES_SUCCESSFUL.increment();
        self.next_sequence = sequence + 1;

        FrameOutcome::Accepted {
            advance: (gap + 1) * self.frame_size,
        }
    }
}
