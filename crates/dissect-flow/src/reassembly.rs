//! Per-direction TCP stream reassembly.
//!
//! Segments own their bytes (`Bytes`), so a reassembler outlives the packet
//! buffers that fed it. Sequence comparisons are plain `u32` ordering; flows
//! whose sequence space wraps mid-capture are reset by the caller.

use bytes::Bytes;
use std::collections::BTreeMap;

/// One TCP segment queued for reassembly.
#[derive(Debug, Clone)]
pub struct TcpSegment {
    pub seq: u32,
    pub data: Bytes,
    pub syn: bool,
    pub fin: bool,
}

impl TcpSegment {
    pub fn new(seq: u32, data: impl Into<Bytes>) -> Self {
        Self {
            seq,
            data: data.into(),
            syn: false,
            fin: false,
        }
    }

    pub fn with_flags(seq: u32, data: impl Into<Bytes>, syn: bool, fin: bool) -> Self {
        Self {
            seq,
            data: data.into(),
            syn,
            fin,
        }
    }

    fn end_seq(&self) -> u32 {
        self.seq.wrapping_add(self.data.len() as u32)
    }
}

/// Reassembler limits and switches.
#[derive(Debug, Clone)]
pub struct ReassemblerConfig {
    /// Cap on assembled plus buffered bytes.
    pub max_buffer_size: usize,
    /// Cap on out-of-order segments held in the store.
    pub max_out_of_order: usize,
    /// Inactivity bound enforced by the connection tracker, in milliseconds.
    pub timeout_ms: u64,
    /// Append in-order segments without touching the store.
    pub enable_fast_path: bool,
}

impl Default for ReassemblerConfig {
    fn default() -> Self {
        Self {
            max_buffer_size: 10 * 1024 * 1024,
            max_out_of_order: 1000,
            timeout_ms: 30_000,
            enable_fast_path: true,
        }
    }
}

/// Counters for one reassembler. Single-writer; snapshot by `clone`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReassemblyStats {
    pub total_segments: u64,
    pub out_of_order_segments: u64,
    pub retransmitted_bytes: u64,
    pub merged_overlaps: u64,
    pub dropped_segments: u64,
}

/// View of the current reassembly window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowInfo {
    pub expected_seq: u32,
    pub highest_seq: u32,
    pub buffered_bytes: usize,
    pub available_bytes: usize,
    pub gap_count: u32,
}

/// Sequence-ordered segment store with duplicate and overlap handling.
pub struct TcpReassembler {
    config: ReassemblerConfig,
    segments: BTreeMap<u32, TcpSegment>,
    expected_seq: u32,
    has_initial_seq: bool,
    has_fin: bool,
    fin_seq: u32,
    assembled: Vec<u8>,
    consumed: usize,
    highest_seq: u32,
    stats: ReassemblyStats,
}

impl TcpReassembler {
    pub fn new(config: ReassemblerConfig) -> Self {
        Self {
            config,
            segments: BTreeMap::new(),
            expected_seq: 0,
            has_initial_seq: false,
            has_fin: false,
            fin_seq: 0,
            assembled: Vec::new(),
            consumed: 0,
            highest_seq: 0,
            stats: ReassemblyStats::default(),
        }
    }

    /// Pin the first expected sequence number (normally from the SYN).
    pub fn set_initial_sequence(&mut self, seq: u32) {
        self.expected_seq = seq;
        self.highest_seq = seq;
        self.has_initial_seq = true;
    }

    /// Queue one segment. Returns true when new in-order bytes became
    /// available to [`get_data`](Self::get_data).
    pub fn add_segment(&mut self, segment: TcpSegment) -> bool {
        self.stats.total_segments += 1;

        let mut segment = segment;
        if segment.syn {
            // SYN consumes one sequence number; data follows it.
            self.set_initial_sequence(segment.seq.wrapping_add(1));
            segment.seq = segment.seq.wrapping_add(1);
        } else if !self.has_initial_seq {
            self.set_initial_sequence(segment.seq);
        }

        if segment.fin {
            self.has_fin = true;
            self.fin_seq = segment.end_seq();
        }
        self.highest_seq = self.highest_seq.max(segment.end_seq());

        if segment.data.is_empty() {
            return false;
        }

        // Entirely behind the assembled edge: retransmission.
        if segment.end_seq() <= self.expected_seq {
            self.stats.retransmitted_bytes += segment.data.len() as u64;
            return false;
        }

        let before = self.assembled.len();

        if self.config.enable_fast_path
            && self.segments.is_empty()
            && segment.seq == self.expected_seq
        {
            if self.buffered_bytes() + self.available() + segment.data.len()
                > self.config.max_buffer_size
            {
                self.stats.dropped_segments += 1;
                return false;
            }
            self.assembled.extend_from_slice(&segment.data);
            self.expected_seq = segment.end_seq();
            return true;
        }

        if segment.seq != self.expected_seq {
            self.stats.out_of_order_segments += 1;
        }
        if self.segments.len() >= self.config.max_out_of_order {
            tracing::debug!(seq = segment.seq, "out-of-order cap reached, dropping");
            self.stats.dropped_segments += 1;
            return false;
        }
        if self.buffered_bytes() + self.available() + segment.data.len()
            > self.config.max_buffer_size
        {
            self.stats.dropped_segments += 1;
            return false;
        }

        self.insert_trimmed(segment);
        self.drain_in_order();
        self.assembled.len() > before
    }

    /// Insert `segment`, trimming any overlap with already-buffered
    /// neighbors. Earlier-inserted data wins on the overlap.
    fn insert_trimmed(&mut self, mut segment: TcpSegment) {
        // Trim the front against the closest predecessor.
        if let Some((_, prev)) = self.segments.range(..=segment.seq).next_back() {
            let prev_end = prev.end_seq();
            if prev_end > segment.seq {
                let overlap = (prev_end.wrapping_sub(segment.seq)) as usize;
                if overlap >= segment.data.len() {
                    self.stats.retransmitted_bytes += segment.data.len() as u64;
                    return;
                }
                segment.data = segment.data.slice(overlap..);
                segment.seq = prev_end;
                self.stats.merged_overlaps += 1;
            }
        }

        // Trim the tail against each successor in reach.
        while let Some((&next_seq, next)) = self.segments.range(segment.seq..).next() {
            if next_seq >= segment.end_seq() {
                break;
            }
            if next_seq == segment.seq {
                // Same offset: keep the longer tail beyond the existing one.
                let existing_len = next.data.len();
                if existing_len >= segment.data.len() {
                    self.stats.retransmitted_bytes += segment.data.len() as u64;
                    return;
                }
                segment.data = segment.data.slice(existing_len..);
                segment.seq = segment.seq.wrapping_add(existing_len as u32);
                self.stats.merged_overlaps += 1;
                continue;
            }
            // Successor starts inside this segment: cut our tail there and
            // queue the remainder after the successor separately.
            let keep = (next_seq.wrapping_sub(segment.seq)) as usize;
            let tail = TcpSegment {
                seq: next.end_seq(),
                data: segment.data.slice((keep + next.data.len()).min(segment.data.len())..),
                syn: false,
                fin: false,
            };
            segment.data = segment.data.slice(..keep);
            self.stats.merged_overlaps += 1;
            if !tail.data.is_empty() {
                self.insert_trimmed(tail);
            }
            break;
        }

        if !segment.data.is_empty() {
            self.segments.insert(segment.seq, segment);
        }
    }

    /// Move the contiguous head of the store into the assembled buffer.
    fn drain_in_order(&mut self) {
        while let Some(entry) = self.segments.first_entry() {
            let seq = *entry.key();
            if seq > self.expected_seq {
                break;
            }
            let segment = entry.remove();
            let skip = (self.expected_seq.wrapping_sub(seq)) as usize;
            if skip >= segment.data.len() {
                self.stats.retransmitted_bytes += segment.data.len() as u64;
                continue;
            }
            self.assembled.extend_from_slice(&segment.data[skip..]);
            self.expected_seq = segment.end_seq();
        }
    }

    /// The in-order bytes not yet consumed.
    pub fn get_data(&self) -> &[u8] {
        &self.assembled[self.consumed..]
    }

    /// Mark `bytes` of [`get_data`](Self::get_data) as processed.
    pub fn consume(&mut self, bytes: usize) {
        self.consumed = (self.consumed + bytes).min(self.assembled.len());
    }

    fn available(&self) -> usize {
        self.assembled.len() - self.consumed
    }

    fn buffered_bytes(&self) -> usize {
        self.segments.values().map(|s| s.data.len()).sum()
    }

    pub fn window_info(&self) -> WindowInfo {
        let mut gap_count = 0u32;
        let mut cursor = self.expected_seq;
        for (&seq, segment) in &self.segments {
            if seq > cursor {
                gap_count += 1;
            }
            cursor = cursor.max(segment.end_seq());
        }
        WindowInfo {
            expected_seq: self.expected_seq,
            highest_seq: self.highest_seq,
            buffered_bytes: self.buffered_bytes(),
            available_bytes: self.available(),
            gap_count,
        }
    }

    /// True once the FIN was seen and every byte before it is assembled.
    pub fn is_complete(&self) -> bool {
        self.has_fin && self.segments.is_empty() && self.expected_seq >= self.fin_seq
    }

    pub fn stats(&self) -> &ReassemblyStats {
        &self.stats
    }

    pub fn reset(&mut self) {
        self.segments.clear();
        self.expected_seq = 0;
        self.has_initial_seq = false;
        self.has_fin = false;
        self.fin_seq = 0;
        self.assembled.clear();
        self.consumed = 0;
        self.highest_seq = 0;
        self.stats = ReassemblyStats::default();
    }
}

impl Default for TcpReassembler {
    fn default() -> Self {
        Self::new(ReassemblerConfig::default())
    }
}
