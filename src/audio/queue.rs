//! Bounded decode queue for inbound commentary
//!
//! Raw fragments are decoded off the session task, in parallel, and appended
//! in arrival order: a decode that finishes early is held back until every
//! earlier fragment has finished decoding or failed. The queue holds at most `capacity`
//! unplayed fragments; when a new one arrives at a full queue the oldest is
//! evicted, since fresh commentary is worth more than complete commentary.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::{self, JoinSet};

use crate::codec::audio::{DecodedAudio, FragmentDecoder};
use crate::error::DecodeError;

/// One decoded utterance waiting to play
#[derive(Debug, Clone)]
pub struct AudioFragment {
    /// Arrival order, assigned when the raw bytes were received
    pub sequence: u64,
    pub audio: Arc<DecodedAudio>,
}

impl AudioFragment {
    pub fn new(sequence: u64, audio: DecodedAudio) -> Self {
        Self {
            sequence,
            audio: Arc::new(audio),
        }
    }

    pub fn duration(&self) -> Duration {
        self.audio.duration()
    }
}

/// Fixed-capacity FIFO that evicts its oldest entry on overflow
#[derive(Debug)]
pub struct FragmentQueue {
    fragments: VecDeque<AudioFragment>,
    capacity: usize,
    evicted: u64,
}

impl FragmentQueue {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            fragments: VecDeque::with_capacity(capacity),
            capacity,
            evicted: 0,
        }
    }

    /// Append a fragment, returning the evicted one if the queue was full
    pub fn push(&mut self, fragment: AudioFragment) -> Option<AudioFragment> {
        let evicted = if self.fragments.len() >= self.capacity {
            self.evicted += 1;
            self.fragments.pop_front()
        } else {
            None
        };
        self.fragments.push_back(fragment);
        evicted
    }

    pub fn pop(&mut self) -> Option<AudioFragment> {
        self.fragments.pop_front()
    }

    pub fn clear(&mut self) {
        self.fragments.clear();
    }

    pub fn len(&self) -> usize {
        self.fragments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fragments.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn evicted_count(&self) -> u64 {
        self.evicted
    }

    /// Sequences currently queued, oldest first
    pub fn sequences(&self) -> Vec<u64> {
        self.fragments.iter().map(|f| f.sequence).collect()
    }
}

/// Decode results waiting for earlier sequences to finish
#[derive(Debug, Default)]
struct Reorder {
    held: BTreeMap<u64, Result<DecodedAudio, DecodeError>>,
    next: u64,
}

impl Reorder {
    /// Hold `result` and return everything now releasable, lowest first
    fn accept(
        &mut self,
        sequence: u64,
        result: Result<DecodedAudio, DecodeError>,
    ) -> Vec<(u64, Result<DecodedAudio, DecodeError>)> {
        if sequence < self.next {
            return Vec::new();
        }
        self.held.insert(sequence, result);

        let mut released = Vec::new();
        while let Some(result) = self.held.remove(&self.next) {
            released.push((self.next, result));
            self.next += 1;
        }
        released
    }

    /// Forget held results; releases resume at `next`
    fn reset(&mut self, next: u64) {
        self.held.clear();
        self.next = next;
    }

    fn held(&self) -> usize {
        self.held.len()
    }
}

/// A finished decode, successful or not
pub type DecodeOutcome = (u64, Result<DecodedAudio, DecodeError>);

/// Decodes inbound audio and buffers the results
pub struct AudioDecodeQueue {
    decoder: Arc<dyn FragmentDecoder>,
    queue: FragmentQueue,
    pending: JoinSet<DecodeOutcome>,
    in_flight: HashMap<task::Id, u64>,
    reorder: Reorder,
    next_sequence: u64,
    received: u64,
    decoded: u64,
    failed: u64,
}

impl AudioDecodeQueue {
    pub fn new(decoder: Arc<dyn FragmentDecoder>, capacity: usize) -> Self {
        Self {
            decoder,
            queue: FragmentQueue::new(capacity),
            pending: JoinSet::new(),
            in_flight: HashMap::new(),
            reorder: Reorder::default(),
            next_sequence: 0,
            received: 0,
            decoded: 0,
            failed: 0,
        }
    }

    /// Start decoding raw bytes; returns the arrival sequence assigned
    pub fn enqueue(&mut self, raw: Vec<u8>) -> u64 {
        let sequence = self.next_sequence;
        self.next_sequence += 1;
        self.received += 1;

        let decoder = self.decoder.clone();
        let handle = self
            .pending
            .spawn_blocking(move || (sequence, decoder.decode(&raw)));
        self.in_flight.insert(handle.id(), sequence);
        sequence
    }

    /// Whether any decode is still running
    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    /// Wait for the next decode to finish, in completion order.
    ///
    /// Returns `None` immediately when nothing is pending. Cancel safe.
    pub async fn next_decoded(&mut self) -> Option<DecodeOutcome> {
        let joined = self.pending.join_next_with_id().await?;
        Some(match joined {
            Ok((id, outcome)) => {
                self.in_flight.remove(&id);
                outcome
            }
            Err(e) => {
                let sequence = self.in_flight.remove(&e.id()).unwrap_or(u64::MAX);
                (
                    sequence,
                    Err(DecodeError::DecodingFailed(format!("decode task failed: {}", e))),
                )
            }
        })
    }

    /// Apply a finished decode. Results are released in arrival order, so
    /// a fast decode waits here for slower earlier ones. Failures are logged
    /// and discarded; returns whether any fragment was appended.
    pub fn complete(&mut self, outcome: DecodeOutcome) -> bool {
        let (sequence, result) = outcome;
        let mut appended = false;
        for (sequence, result) in self.reorder.accept(sequence, result) {
            appended |= self.release(sequence, result);
        }
        if self.reorder.held() > 0 {
            tracing::trace!(
                "Fragment {} held behind {} earlier decode(s)",
                sequence,
                self.in_flight.len()
            );
        }
        appended
    }

    fn release(&mut self, sequence: u64, result: Result<DecodedAudio, DecodeError>) -> bool {
        match result {
            Ok(audio) => {
                self.decoded += 1;
                let duration = audio.duration();
                if let Some(evicted) = self.queue.push(AudioFragment::new(sequence, audio)) {
                    tracing::debug!(
                        "Queue full, dropped oldest fragment {} for {}",
                        evicted.sequence,
                        sequence
                    );
                }
                tracing::debug!(
                    "Fragment {} decoded ({:.2}s, queue {}/{})",
                    sequence,
                    duration.as_secs_f64(),
                    self.queue.len(),
                    self.queue.capacity()
                );
                true
            }
            Err(e) => {
                self.failed += 1;
                tracing::warn!("Audio fragment {} discarded: {}", sequence, e);
                false
            }
        }
    }

    /// Append an already decoded buffer
    pub fn push_decoded(&mut self, audio: DecodedAudio) -> u64 {
        let sequence = self.next_sequence;
        self.next_sequence += 1;
        self.received += 1;
        self.complete((sequence, Ok(audio)));
        sequence
    }

    /// Remove and return the oldest fragment
    pub fn dequeue_next(&mut self) -> Option<AudioFragment> {
        self.queue.pop()
    }

    /// Drop queued fragments and abandon in-flight decodes
    pub fn clear(&mut self) {
        self.queue.clear();
        // Dropping the set aborts its tasks and discards their results
        self.pending = JoinSet::new();
        self.in_flight.clear();
        self.reorder.reset(self.next_sequence);
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn stats(&self) -> QueueStats {
        QueueStats {
            received: self.received,
            decoded: self.decoded,
            failed: self.failed,
            evicted: self.queue.evicted_count(),
            queued: self.queue.len(),
            capacity: self.queue.capacity(),
        }
    }
}

/// Decode queue statistics
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct QueueStats {
    pub received: u64,
    pub decoded: u64,
    pub failed: u64,
    pub evicted: u64,
    pub queued: usize,
    pub capacity: usize,
}
