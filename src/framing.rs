// src/framing.rs
//
// Frame extraction engine.
// Splits an accumulating byte buffer into application frames using one of
// four delimiter strategies, then verifies the optional trailing checksum.
// Used inline by the connection manager and inside every worker.

use serde::{Deserialize, Serialize};

use crate::checksums::ChecksumAlgorithm;
use crate::io::now_ms;
use crate::pool::Poolable;

/// Default upper bound for the extractor's byte buffer (10 MiB).
pub const DEFAULT_BUFFER_CAPACITY: usize = 10 * 1024 * 1024;

// ============================================================================
// Types
// ============================================================================

/// Frame delimiting strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FrameDetectionMode {
    /// Frames end at `finish_sequence`
    #[default]
    EndDelimiterOnly,
    /// Frames sit between `start_sequence` and `finish_sequence`
    StartAndEndDelimiter,
    /// Each `start_sequence` closes the previous frame and opens the next
    StartDelimiterOnly,
    /// The whole buffer is one frame
    NoDelimiters,
}

/// Frame detection configuration shared by the inline extractor and workers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FrameDetectionConfig {
    pub mode: FrameDetectionMode,
    /// Start delimiter, written as a hex string in config files (e.g. "7B")
    #[serde(with = "hex_bytes")]
    pub start_sequence: Vec<u8>,
    /// Finish delimiter, written as a hex string in config files (e.g. "0D0A")
    #[serde(with = "hex_bytes")]
    pub finish_sequence: Vec<u8>,
    pub checksum_algorithm: ChecksumAlgorithm,
}

impl Default for FrameDetectionConfig {
    fn default() -> Self {
        FrameDetectionConfig {
            mode: FrameDetectionMode::EndDelimiterOnly,
            start_sequence: Vec::new(),
            finish_sequence: vec![0x0A],
            checksum_algorithm: ChecksumAlgorithm::None,
        }
    }
}

/// Partial update for a [`FrameDetectionConfig`]. Unset fields keep their value.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameDetectionUpdate {
    pub mode: Option<FrameDetectionMode>,
    pub start_sequence: Option<Vec<u8>>,
    pub finish_sequence: Option<Vec<u8>>,
    pub checksum_algorithm: Option<ChecksumAlgorithm>,
}

impl FrameDetectionConfig {
    /// Merge a partial update into this configuration.
    pub fn merge(&mut self, update: FrameDetectionUpdate) {
        if let Some(mode) = update.mode {
            self.mode = mode;
        }
        if let Some(start) = update.start_sequence {
            self.start_sequence = start;
        }
        if let Some(finish) = update.finish_sequence {
            self.finish_sequence = finish;
        }
        if let Some(algo) = update.checksum_algorithm {
            self.checksum_algorithm = algo;
        }
    }
}

/// One decoded frame.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawFrame {
    /// Frame payload (delimiters and checksum removed)
    pub data: Vec<u8>,
    /// Capture time in milliseconds since the Unix epoch
    pub timestamp: u64,
    /// Per-connection sequence number, starting at 1
    pub sequence: u64,
    pub checksum_valid: bool,
}

impl Poolable for RawFrame {
    fn reset(&mut self) {
        self.data.clear();
        self.timestamp = 0;
        self.sequence = 0;
        self.checksum_valid = false;
    }
}

/// Result of one pass of [`extract_frames`] over a buffer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Extraction {
    /// Verified frame payloads, in stream order
    pub frames: Vec<Vec<u8>>,
    /// Number of leading buffer bytes that can be discarded
    pub consumed: usize,
    /// Candidates dropped because their checksum was missing or wrong
    pub checksum_errors: u64,
}

// ============================================================================
// Pure extraction
// ============================================================================

fn find(haystack: &[u8], needle: &[u8], from: usize) -> Option<usize> {
    if needle.is_empty() || from >= haystack.len() {
        return None;
    }
    haystack[from..]
        .windows(needle.len())
        .position(|w| w == needle)
        .map(|p| p + from)
}

/// Bytes that can be dropped when no delimiter was found, keeping a tail
/// that may hold the first half of a split delimiter.
fn unmatched_prefix(len: usize, from: usize, delimiter: &[u8]) -> usize {
    len.saturating_sub(delimiter.len().saturating_sub(1)).max(from)
}

/// Checksum-verify one candidate and record it in `out`.
fn accept(candidate: &[u8], algorithm: ChecksumAlgorithm, out: &mut Extraction) {
    if candidate.is_empty() {
        return;
    }
    let n = algorithm.output_bytes();
    if n == 0 {
        out.frames.push(candidate.to_vec());
        return;
    }
    if candidate.len() <= n {
        out.checksum_errors += 1;
        return;
    }
    let (payload, checksum) = candidate.split_at(candidate.len() - n);
    if algorithm.verify(payload, checksum) {
        out.frames.push(payload.to_vec());
    } else {
        out.checksum_errors += 1;
    }
}

/// Extract every complete frame from `buffer`.
///
/// Returns the verified payloads plus how many leading bytes were consumed;
/// the caller keeps `buffer[consumed..]` for the next pass.
pub fn extract_frames(buffer: &[u8], config: &FrameDetectionConfig) -> Extraction {
    let mut out = Extraction::default();
    let algo = config.checksum_algorithm;

    let mode = match config.mode {
        FrameDetectionMode::EndDelimiterOnly if config.finish_sequence.is_empty() => {
            FrameDetectionMode::NoDelimiters
        }
        FrameDetectionMode::StartDelimiterOnly if config.start_sequence.is_empty() => {
            FrameDetectionMode::NoDelimiters
        }
        mode => mode,
    };

    match mode {
        FrameDetectionMode::EndDelimiterOnly => {
            let finish = &config.finish_sequence;
            let mut cut = 0;
            while let Some(end) = find(buffer, finish, cut) {
                accept(&buffer[cut..end], algo, &mut out);
                cut = end + finish.len();
            }
            out.consumed = cut;
        }
        FrameDetectionMode::StartAndEndDelimiter => {
            let start = &config.start_sequence;
            let finish = &config.finish_sequence;
            if start.is_empty() || finish.is_empty() {
                return out;
            }
            let mut cut = 0;
            loop {
                let Some(s) = find(buffer, start, cut) else {
                    cut = unmatched_prefix(buffer.len(), cut, start);
                    break;
                };
                let body = s + start.len();
                let Some(e) = find(buffer, finish, body) else {
                    cut = s;
                    break;
                };
                accept(&buffer[body..e], algo, &mut out);
                cut = e + finish.len();
            }
            out.consumed = cut;
        }
        FrameDetectionMode::StartDelimiterOnly => {
            let start = &config.start_sequence;
            let Some(first) = find(buffer, start, 0) else {
                out.consumed = unmatched_prefix(buffer.len(), 0, start);
                return out;
            };
            let mut open = first;
            while let Some(next) = find(buffer, start, open + start.len()) {
                accept(&buffer[open + start.len()..next], algo, &mut out);
                open = next;
            }
            // The segment after the last start stays buffered.
            out.consumed = open;
        }
        FrameDetectionMode::NoDelimiters => {
            accept(buffer, algo, &mut out);
            out.consumed = buffer.len();
        }
    }

    out
}

// ============================================================================
// Stateful extractor
// ============================================================================

/// Buffer statistics for an extractor
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExtractorStats {
    pub buffered: usize,
    pub capacity: usize,
    pub free_space: usize,
    pub utilization_percent: f64,
    pub checksum_errors: u64,
    pub frames_emitted: u64,
}

/// Streaming frame extractor: owns the byte buffer, sequence counter and
/// checksum error counter for one stream.
#[derive(Debug)]
pub struct FrameExtractor {
    config: FrameDetectionConfig,
    buffer: Vec<u8>,
    capacity: usize,
    sequence: u64,
    checksum_errors: u64,
    frames_emitted: u64,
}

impl FrameExtractor {
    pub fn new(config: FrameDetectionConfig) -> Self {
        Self::with_capacity(config, DEFAULT_BUFFER_CAPACITY)
    }

    pub fn with_capacity(config: FrameDetectionConfig, capacity: usize) -> Self {
        FrameExtractor {
            config,
            buffer: Vec::new(),
            capacity: capacity.max(1),
            sequence: 0,
            checksum_errors: 0,
            frames_emitted: 0,
        }
    }

    pub fn config(&self) -> &FrameDetectionConfig {
        &self.config
    }

    /// Replace the configuration. Buffered bytes are kept.
    pub fn configure(&mut self, config: FrameDetectionConfig) {
        self.config = config;
    }

    /// Append bytes and return every frame completed by them.
    pub fn push(&mut self, data: &[u8]) -> Vec<RawFrame> {
        self.buffer.extend_from_slice(data);
        trim_to_capacity(&mut self.buffer, self.capacity);

        let extraction = extract_frames(&self.buffer, &self.config);
        self.buffer.drain(..extraction.consumed);
        self.checksum_errors += extraction.checksum_errors;

        let timestamp = now_ms();
        extraction
            .frames
            .into_iter()
            .map(|data| RawFrame {
                data,
                timestamp,
                sequence: self.next_sequence(),
                checksum_valid: true,
            })
            .collect()
    }

    /// Move the buffered bytes plus `data` out, for extraction somewhere
    /// else. Hand the unconsumed tail back with [`FrameExtractor::restore`].
    pub fn take_pending(&mut self, data: &[u8]) -> Vec<u8> {
        let mut pending = std::mem::take(&mut self.buffer);
        pending.extend_from_slice(data);
        trim_to_capacity(&mut pending, self.capacity);
        pending
    }

    /// Put back the tail an outside extraction left unconsumed, ahead of
    /// anything buffered since.
    pub fn restore(&mut self, remainder: &[u8]) {
        self.buffer.splice(0..0, remainder.iter().copied());
        trim_to_capacity(&mut self.buffer, self.capacity);
    }

    /// Number frames extracted elsewhere and count their checksum failures.
    pub fn adopt(&mut self, frames: &mut [RawFrame], checksum_errors: u64) {
        for frame in frames {
            frame.sequence = self.next_sequence();
        }
        self.checksum_errors += checksum_errors;
    }

    /// Claim the next sequence number.
    pub fn next_sequence(&mut self) -> u64 {
        self.sequence += 1;
        self.frames_emitted += 1;
        self.sequence
    }

    /// Drop buffered bytes, keeping the sequence counter.
    pub fn clear_buffer(&mut self) {
        self.buffer.clear();
    }

    /// Drop buffered bytes and restart sequence numbering.
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.sequence = 0;
    }

    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn checksum_errors(&self) -> u64 {
        self.checksum_errors
    }

    pub fn stats(&self) -> ExtractorStats {
        ExtractorStats {
            buffered: self.buffer.len(),
            capacity: self.capacity,
            free_space: self.capacity.saturating_sub(self.buffer.len()),
            utilization_percent: self.buffer.len() as f64 / self.capacity as f64 * 100.0,
            checksum_errors: self.checksum_errors,
            frames_emitted: self.frames_emitted,
        }
    }
}

/// Drop the oldest bytes beyond `capacity`.
fn trim_to_capacity(buffer: &mut Vec<u8>, capacity: usize) {
    if buffer.len() > capacity {
        let overflow = buffer.len() - capacity;
        buffer.drain(..overflow);
    }
}

// ============================================================================
// Hex (de)serialisation for delimiter sequences
// ============================================================================

mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode_upper(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        let cleaned: String = s.chars().filter(|c| !c.is_whitespace()).collect();
        hex::decode(&cleaned).map_err(serde::de::Error::custom)
    }
}

// ============================================================================
// Tests
// ============================================================================
