//! Inbound record assembly.

use bytes::{Buf, Bytes};

use super::{DEFAULT_MAX_RECORD, FramingError, parse_header};
use crate::segment::SegmentChain;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FramingState {
    /// Waiting for a fragment header.
    Idle,
    /// Header parsed; `resid` body bytes still to move.
    FragmentInProgress,
    /// Closed or failed. Nothing further is assembled.
    Ended,
}

/// Outcome of one [`RecordAssembler::poll_record`].
#[derive(Debug)]
pub enum RecordPoll {
    Complete(SegmentChain),
    /// More input is needed. Partial state is kept.
    WouldBlock,
}

/// Reassembles records from arbitrarily chunked input.
///
/// Input is queued with [`push`](Self::push) in arrival order. Each poll
/// moves as much of the queue as it can into the in-progress record, splitting
/// the last queued segment when a fragment ends inside it.
#[derive(Debug)]
pub struct RecordAssembler {
    queue: SegmentChain,
    record: SegmentChain,
    resid: usize,
    last_frag: bool,
    state: FramingState,
    max_record: usize,
}

impl Default for RecordAssembler {
    fn default() -> Self {
        Self::new()
    }
}

impl RecordAssembler {
    pub fn new() -> Self {
        Self::with_max_record(DEFAULT_MAX_RECORD)
    }

    pub fn with_max_record(max_record: usize) -> Self {
        Self {
            queue: SegmentChain::new(),
            record: SegmentChain::new(),
            resid: 0,
            last_frag: false,
            state: FramingState::Idle,
            max_record,
        }
    }

    pub fn state(&self) -> FramingState {
        self.state
    }

    /// Queue bytes read from the stream. Ignored once ended.
    pub fn push(&mut self, buf: Bytes) {
        if self.state != FramingState::Ended {
            self.queue.push(buf);
        }
    }

    /// Bytes queued or assembled but not yet returned as a record.
    pub fn buffered(&self) -> usize {
        self.queue.len() + self.record.len()
    }

    /// True if a record has been started but not finished.
    pub fn mid_record(&self) -> bool {
        self.state == FramingState::FragmentInProgress || !self.record.is_empty()
    }

    /// Try to complete the next record from queued input.
    pub fn poll_record(&mut self) -> Result<RecordPoll, FramingError> {
        loop {
            match self.state {
                FramingState::Ended => return Err(FramingError::Ended),
                FramingState::Idle => {
                    let Some(header) = self.queue.peek_u32_be() else {
                        return Ok(RecordPoll::WouldBlock);
                    };
                    self.queue.advance(4);
                    let (last, len) = parse_header(header);
                    let total = self.record.len().saturating_add(len);
                    if total > self.max_record {
                        tracing::debug!(
                            len = total,
                            max = self.max_record,
                            "Record exceeds size limit"
                        );
                        self.end();
                        return Err(FramingError::RecordTooLarge {
                            len: total,
                            max: self.max_record,
                        });
                    }
                    tracing::trace!(len, last, "Fragment header");
                    self.resid = len;
                    self.last_frag = last;
                    self.state = FramingState::FragmentInProgress;
                }
                FramingState::FragmentInProgress => {
                    let take = self.resid.min(self.queue.len());
                    if take > 0 {
                        let body = self.queue.split_to(take);
                        self.record.append(body);
                        self.resid -= take;
                    }
                    if self.resid > 0 {
                        return Ok(RecordPoll::WouldBlock);
                    }
                    self.state = FramingState::Idle;
                    if self.last_frag {
                        self.last_frag = false;
                        let record = std::mem::take(&mut self.record);
                        tracing::trace!(len = record.len(), "Record complete");
                        return Ok(RecordPoll::Complete(record));
                    }
                }
            }
        }
    }

    /// Stream closed or failed: discard all partial state and stop.
    pub fn end(&mut self) {
        self.queue.clear();
        self.record.clear();
        self.resid = 0;
        self.last_frag = false;
        self.state = FramingState::Ended;
    }
}
