//! Conversion pipeline.
//!
//! The pipeline reconciles two mismatched models: readers emit sparse
//! `(offset, bytes)` blocks in non-decreasing offset order, while
//! writers expect a dense, strictly sequential byte stream. A single
//! cursor tracks the write position; gaps are filled from a shared
//! zero buffer and the tail is zero-filled out to the declared
//! capacity after end-of-stream.

use tracing::{debug, info};

use crate::cancel::CancelToken;
use crate::error::{Error, Result};

/// Size of the shared zero buffer used for gap and tail fill.
pub const ZERO_BLOCK_BYTES: usize = 64 * 1024;

/// The shared all-zeros buffer. Immutable by construction.
static ZEROES: [u8; ZERO_BLOCK_BYTES] = [0u8; ZERO_BLOCK_BYTES];

/// One block yielded by an [`ImageReader`]: `len` bytes of guest data
/// starting at guest byte `offset`. The bytes live in the caller's
/// buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Block {
    pub offset: u64,
    pub len: usize,
}

/// A format decoder presenting the image as a sparse block stream.
pub trait ImageReader {
    /// Parse headers and prepare for iteration.
    fn open(&mut self) -> Result<()>;

    /// Declared guest capacity in bytes; 0 when unknown.
    fn capacity_bytes(&self) -> u64;

    /// Preferred buffer size for [`next_block`](Self::next_block).
    fn block_bytes(&self) -> usize;

    /// Yield the next non-sparse block into `buf`, or `None` at
    /// end-of-stream. Offsets never move backwards.
    fn next_block(&mut self, buf: &mut [u8]) -> Result<Option<Block>>;

    /// Release the underlying source. Idempotent.
    fn close(&mut self) -> Result<()>;
}

/// A format encoder consuming a dense sequential byte stream.
pub trait ImageWriter {
    /// Emit headers for a disk of `capacity_bytes`.
    fn open(&mut self, capacity_bytes: u64) -> Result<()>;

    /// Required input granularity, if any. When `Some(n)`, every
    /// [`write_block`](Self::write_block) call except the last must
    /// carry exactly `n` bytes; the pipeline restages input to honor
    /// this.
    fn write_granularity(&self) -> Option<usize>;

    /// Append one block of guest bytes.
    fn write_block(&mut self, data: &[u8]) -> Result<()>;

    /// Flush trailing metadata and release the sink. Idempotent.
    fn close(&mut self) -> Result<()>;
}

/// zlib level used when compressing VMDK grains.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CompressionLevel {
    /// Fast compression (zlib level 1).
    Fast,
    /// Balanced compression (zlib level 6).
    #[default]
    Balanced,
    /// Maximum compression (zlib level 9).
    Max,
}

impl CompressionLevel {
    /// Convert to a zlib compression level.
    pub fn to_zlib_level(&self) -> u32 {
        match self {
            CompressionLevel::Fast => 1,
            CompressionLevel::Balanced => 6,
            CompressionLevel::Max => 9,
        }
    }
}

/// Snapshot handed to the progress callback.
#[derive(Debug, Clone, Copy)]
pub struct ConvertProgress {
    /// Bytes handed to the writer so far, zero fill included.
    pub written: u64,
    /// Declared capacity; 0 while unknown.
    pub capacity: u64,
}

/// Callback invoked after each block the pipeline forwards.
pub type ProgressCallback = Box<dyn FnMut(ConvertProgress)>;

/// Result of a completed conversion.
///
/// `written` counts every byte handed to the writer, including the
/// zeros injected for sparse gaps and the capacity tail; it is not the
/// count of source payload bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConvertSummary {
    pub written: u64,
    pub capacity: u64,
}

/// Drives one reader into one writer.
///
/// Owns both sides for the duration of the conversion and closes them
/// deterministically (writer first, then reader) on every exit path.
pub struct Converter {
    reader: Box<dyn ImageReader>,
    writer: Box<dyn ImageWriter>,
    cancel: CancelToken,
    progress: Option<ProgressCallback>,
    written: u64,
    capacity: u64,
}

impl Converter {
    pub fn new(reader: Box<dyn ImageReader>, writer: Box<dyn ImageWriter>) -> Self {
        Self {
            reader,
            writer,
            cancel: CancelToken::new(),
            progress: None,
            written: 0,
            capacity: 0,
        }
    }

    /// Attach a cancellation token; clones of it abort the run.
    pub fn with_cancel(mut self, token: CancelToken) -> Self {
        self.cancel = token;
        self
    }

    /// Attach a progress callback.
    pub fn with_progress(mut self, callback: ProgressCallback) -> Self {
        self.progress = Some(callback);
        self
    }

    /// Counts accrued so far; meaningful after `run` even when it
    /// returned an error.
    pub fn summary(&self) -> ConvertSummary {
        ConvertSummary {
            written: self.written,
            capacity: self.capacity,
        }
    }

    /// Execute the conversion.
    pub fn run(&mut self) -> Result<ConvertSummary> {
        let mut written = 0u64;
        let mut capacity = 0u64;
        let result = pump(
            self.reader.as_mut(),
            self.writer.as_mut(),
            &self.cancel,
            &mut self.progress,
            &mut written,
            &mut capacity,
        );
        self.written = written;
        self.capacity = capacity;

        // Writer first, then reader, on every path.
        let writer_close = self.writer.close();
        let reader_close = self.reader.close();

        result?;
        writer_close?;
        reader_close?;

        info!(written, capacity, "conversion complete");
        Ok(self.summary())
    }
}

/// Restages arbitrary emissions into the writer's granularity.
///
/// Readers yield blocks at their own granularity (a 1 MiB RAW block, a
/// 64 KiB grain) while the VMDK writer consumes exactly one grain per
/// call. Full-granularity slices pass straight through; partial input
/// is staged until a whole unit accumulates. The final short unit is
/// flushed at end-of-stream.
struct SequentialEmitter<'a> {
    writer: &'a mut dyn ImageWriter,
    granularity: Option<usize>,
    stage: Vec<u8>,
    written: u64,
}

impl<'a> SequentialEmitter<'a> {
    fn new(writer: &'a mut dyn ImageWriter) -> Self {
        let granularity = writer.write_granularity();
        Self {
            writer,
            granularity,
            stage: Vec::with_capacity(granularity.unwrap_or(0)),
            written: 0,
        }
    }

    fn emit(&mut self, mut data: &[u8]) -> Result<()> {
        let Some(granularity) = self.granularity else {
            self.writer.write_block(data)?;
            self.written += data.len() as u64;
            return Ok(());
        };

        while !data.is_empty() {
            if self.stage.is_empty() && data.len() >= granularity {
                self.writer.write_block(&data[..granularity])?;
                self.written += granularity as u64;
                data = &data[granularity..];
                continue;
            }
            let take = (granularity - self.stage.len()).min(data.len());
            self.stage.extend_from_slice(&data[..take]);
            data = &data[take..];
            if self.stage.len() == granularity {
                self.writer.write_block(&self.stage)?;
                self.written += granularity as u64;
                self.stage.clear();
            }
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        if !self.stage.is_empty() {
            self.writer.write_block(&self.stage)?;
            self.written += self.stage.len() as u64;
            self.stage.clear();
        }
        Ok(())
    }
}

fn pump(
    reader: &mut dyn ImageReader,
    writer: &mut dyn ImageWriter,
    cancel: &CancelToken,
    progress: &mut Option<ProgressCallback>,
    written_out: &mut u64,
    capacity_out: &mut u64,
) -> Result<()> {
    reader.open()?;
    let mut capacity = reader.capacity_bytes();
    *capacity_out = capacity;

    writer.open(capacity)?;

    let block_bytes = reader.block_bytes().max(1);
    let mut buf = vec![0u8; block_bytes];
    let mut emitter = SequentialEmitter::new(writer);
    let mut cursor = 0u64;
    debug!(capacity, block_bytes, "pipeline started");

    loop {
        cancel.check()?;
        let Some(block) = reader.next_block(&mut buf)? else {
            break;
        };
        if block.len == 0 {
            continue;
        }

        if block.offset < cursor {
            *written_out = emitter.written;
            return Err(Error::protocol(format!(
                "block offset {} is behind write cursor {}",
                block.offset, cursor
            )));
        }
        if capacity > 0 && block.offset + block.len as u64 > capacity {
            *written_out = emitter.written;
            return Err(Error::protocol(format!(
                "block at {}+{} exceeds declared capacity {}",
                block.offset, block.len, capacity
            )));
        }

        if block.offset > cursor {
            let mut gap = block.offset - cursor;
            while gap > 0 {
                cancel.check()?;
                let n = gap.min(ZERO_BLOCK_BYTES as u64) as usize;
                emitter.emit(&ZEROES[..n])?;
                cursor += n as u64;
                gap -= n as u64;
            }
        }

        emitter.emit(&buf[..block.len])?;
        cursor += block.len as u64;
        *written_out = emitter.written;

        if let Some(callback) = progress {
            callback(ConvertProgress {
                written: emitter.written,
                capacity,
            });
        }
    }

    // Tail fill out to capacity. A stream that ended exactly at the
    // boundary fills nothing.
    while cursor < capacity {
        cancel.check()?;
        let n = (capacity - cursor).min(ZERO_BLOCK_BYTES as u64) as usize;
        emitter.emit(&ZEROES[..n])?;
        cursor += n as u64;
        *written_out = emitter.written;
    }

    emitter.flush()?;
    *written_out = emitter.written;

    if capacity == 0 {
        capacity = cursor;
        *capacity_out = capacity;
    }

    if let Some(callback) = progress {
        callback(ConvertProgress {
            written: *written_out,
            capacity,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    /// Reader replaying a scripted sequence of sparse blocks.
    struct ScriptedReader {
        capacity: u64,
        blocks: Vec<(u64, Vec<u8>)>,
        next: usize,
    }

    impl ScriptedReader {
        fn new(capacity: u64, blocks: Vec<(u64, Vec<u8>)>) -> Self {
            Self {
                capacity,
                blocks,
                next: 0,
            }
        }
    }

    impl ImageReader for ScriptedReader {
        fn open(&mut self) -> Result<()> {
            Ok(())
        }

        fn capacity_bytes(&self) -> u64 {
            self.capacity
        }

        fn block_bytes(&self) -> usize {
            1 << 16
        }

        fn next_block(&mut self, buf: &mut [u8]) -> Result<Option<Block>> {
            let Some((offset, data)) = self.blocks.get(self.next) else {
                return Ok(None);
            };
            self.next += 1;
            buf[..data.len()].copy_from_slice(data);
            Ok(Some(Block {
                offset: *offset,
                len: data.len(),
            }))
        }

        fn close(&mut self) -> Result<()> {
            Ok(())
        }
    }

    /// Writer collecting everything it is handed.
    struct CollectingWriter {
        granularity: Option<usize>,
        data: Arc<Mutex<Vec<u8>>>,
        block_sizes: Arc<Mutex<Vec<usize>>>,
    }

    impl CollectingWriter {
        fn new(granularity: Option<usize>) -> Self {
            Self {
                granularity,
                data: Arc::new(Mutex::new(Vec::new())),
                block_sizes: Arc::new(Mutex::new(Vec::new())),
            }
        }
    }

    impl ImageWriter for CollectingWriter {
        fn open(&mut self, _capacity_bytes: u64) -> Result<()> {
            Ok(())
        }

        fn write_granularity(&self) -> Option<usize> {
            self.granularity
        }

        fn write_block(&mut self, data: &[u8]) -> Result<()> {
            self.data.lock().unwrap().extend_from_slice(data);
            self.block_sizes.lock().unwrap().push(data.len());
            Ok(())
        }

        fn close(&mut self) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_gap_and_tail_fill() {
        let reader = ScriptedReader::new(300, vec![(100, vec![0xAB; 50])]);
        let writer = CollectingWriter::new(None);
        let data = writer.data.clone();

        let summary = Converter::new(Box::new(reader), Box::new(writer))
            .run()
            .unwrap();

        assert_eq!(summary.written, 300);
        assert_eq!(summary.capacity, 300);

        let out = data.lock().unwrap();
        assert_eq!(out.len(), 300);
        assert!(out[..100].iter().all(|&b| b == 0));
        assert!(out[100..150].iter().all(|&b| b == 0xAB));
        assert!(out[150..].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_unknown_capacity_backfilled_from_cursor() {
        let reader = ScriptedReader::new(0, vec![(0, vec![1; 10]), (10, vec![2; 7])]);
        let writer = CollectingWriter::new(None);

        let summary = Converter::new(Box::new(reader), Box::new(writer))
            .run()
            .unwrap();

        assert_eq!(summary.capacity, 17);
        assert_eq!(summary.written, 17);
    }

    #[test]
    fn test_backwards_block_is_protocol_error() {
        let reader = ScriptedReader::new(100, vec![(50, vec![1; 10]), (20, vec![2; 10])]);
        let writer = CollectingWriter::new(None);

        let err = Converter::new(Box::new(reader), Box::new(writer))
            .run()
            .unwrap_err();
        assert!(matches!(err, Error::Protocol { .. }));
    }

    #[test]
    fn test_block_past_capacity_is_protocol_error() {
        let reader = ScriptedReader::new(64, vec![(32, vec![1; 64])]);
        let writer = CollectingWriter::new(None);

        let err = Converter::new(Box::new(reader), Box::new(writer))
            .run()
            .unwrap_err();
        assert!(matches!(err, Error::Protocol { .. }));
    }

    #[test]
    fn test_granularity_restaging() {
        // 10-byte writer blocks from uneven emissions: 3 + 12 + 11 = 26
        // bytes arrive, the writer must see 10, 10, 6.
        let reader = ScriptedReader::new(
            26,
            vec![(0, vec![1; 3]), (3, vec![2; 12]), (15, vec![3; 11])],
        );
        let writer = CollectingWriter::new(Some(10));
        let sizes = writer.block_sizes.clone();
        let data = writer.data.clone();

        let summary = Converter::new(Box::new(reader), Box::new(writer))
            .run()
            .unwrap();

        assert_eq!(summary.written, 26);
        assert_eq!(*sizes.lock().unwrap(), vec![10, 10, 6]);
        let out = data.lock().unwrap();
        assert_eq!(out.len(), 26);
        assert_eq!(&out[..3], &[1, 1, 1]);
    }

    #[test]
    fn test_cancelled_before_first_block() {
        let reader = ScriptedReader::new(100, vec![(0, vec![1; 100])]);
        let writer = CollectingWriter::new(None);
        let token = CancelToken::new();
        token.cancel();

        let err = Converter::new(Box::new(reader), Box::new(writer))
            .with_cancel(token)
            .run()
            .unwrap_err();
        assert!(err.is_cancelled());
    }

    #[test]
    fn test_no_tail_fill_when_stream_ends_on_capacity() {
        let reader = ScriptedReader::new(100, vec![(0, vec![5; 100])]);
        let writer = CollectingWriter::new(None);
        let data = writer.data.clone();

        let summary = Converter::new(Box::new(reader), Box::new(writer))
            .run()
            .unwrap();

        assert_eq!(summary.written, 100);
        assert_eq!(data.lock().unwrap().len(), 100, "nothing past capacity");
    }

    #[test]
    fn test_compression_level_to_zlib() {
        assert_eq!(CompressionLevel::Fast.to_zlib_level(), 1);
        assert_eq!(CompressionLevel::Balanced.to_zlib_level(), 6);
        assert_eq!(CompressionLevel::Max.to_zlib_level(), 9);
        assert_eq!(CompressionLevel::default(), CompressionLevel::Balanced);
    }

    #[test]
    fn test_progress_callback_sees_final_totals() {
        let reader = ScriptedReader::new(128, vec![(0, vec![7; 64])]);
        let writer = CollectingWriter::new(None);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();

        Converter::new(Box::new(reader), Box::new(writer))
            .with_progress(Box::new(move |p| sink.lock().unwrap().push(p.written)))
            .run()
            .unwrap();

        let seen = seen.lock().unwrap();
        assert_eq!(*seen.last().unwrap(), 128);
    }
}
