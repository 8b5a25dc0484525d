//! Decompression engine: sliding window, decoders, filter queue.
//!
//! The [`DecodeReader`] drives a format-specific [`Decoder`] that fills the
//! sliding [`Window`] and may queue [`FilterBlock`]s, transforms scheduled
//! at specific output offsets. Decoded bytes flow
//! decoder → window → filters → caller.

mod bit_reader;
mod decode29;
mod decode50;
mod filters;
mod huffman;
mod window;

pub(crate) use decode29::Decode29;
pub(crate) use decode50::Decode50;
pub(crate) use window::Window;

use std::collections::VecDeque;
use std::ops::Range;

use crate::block::{DECODE29, DECODE50};
use crate::error::{RarError, Result};

/// Smallest window ever allocated.
pub(crate) const MIN_WINDOW_SIZE: usize = 0x40000;

/// Upper bound on queued filters; overflow is fatal.
pub(crate) const MAX_QUEUED_FILTERS: usize = 8192;

/// Source of packed bytes for a decoder.
pub(crate) trait ByteInput {
    /// Returns the next packed byte, or `None` at the end of the file's
    /// packed data.
    fn read_byte(&mut self) -> Result<Option<u8>>;
}

/// In-memory byte input, used for parsing embedded streams and in tests.
pub(crate) struct SliceInput<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> SliceInput<'a> {
    pub(crate) fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }
}

impl ByteInput for SliceInput<'_> {
    fn read_byte(&mut self) -> Result<Option<u8>> {
        match self.data.get(self.pos) {
            Some(&b) => {
                self.pos += 1;
                Ok(Some(b))
            }
            None => Ok(None),
        }
    }
}

/// A filter function mutates a block of decoded bytes in place; it may
/// resize the buffer. The second argument is the total number of plaintext
/// bytes delivered before the block.
pub(crate) type FilterFn = Box<dyn FnMut(&mut Vec<u8>, u64) -> Result<()> + Send>;

/// A deferred transform over `length` bytes of output starting `offset`
/// bytes ahead of the current read position.
pub(crate) struct FilterBlock {
    pub(crate) offset: usize,
    pub(crate) length: usize,
    pub(crate) filter: FilterFn,
}

/// LZ-style decompression backend.
pub(crate) trait Decoder: Send {
    /// Prepares the decoder for a new file. With `reset` the dictionary
    /// and tables start fresh; without it state carries over from the
    /// previous file (solid archives).
    fn init(&mut self, reset: bool) -> Result<()>;

    /// Decodes packed bytes into the window until it fills or the file's
    /// data ends, returning any filters the stream scheduled.
    fn fill(&mut self, win: &mut Window, input: &mut dyn ByteInput) -> Result<Vec<FilterBlock>>;

    /// Decoder selector this implementation answers to.
    fn version(&self) -> u8;
}

/// Undelivered output: either a range of window bytes or the filter
/// output buffer.
enum OutBuf {
    None,
    Win(Range<usize>),
    /// Read cursor into `DecodeReader::fbuf`.
    Buf(usize),
}

/// Drives decoder → window → filters and exposes the decoded byte stream.
pub(crate) struct DecodeReader {
    win: Window,
    dec: Option<Box<dyn Decoder>>,
    /// Plaintext bytes delivered so far; filters are parameterised by it.
    tot: u64,
    /// Filter input/output buffer, retained across filters.
    fbuf: Vec<u8>,
    out: OutBuf,
    /// Window bytes drained but not yet routed to output.
    winbuf: Range<usize>,
    err: Option<RarError>,
    /// Queued filters; each offset is relative to the previous entry.
    filters: VecDeque<FilterBlock>,
}

impl DecodeReader {
    pub(crate) fn new() -> Self {
        Self {
            win: Window::new(),
            dec: None,
            tot: 0,
            fbuf: Vec::new(),
            out: OutBuf::None,
            winbuf: 0..0,
            err: None,
            filters: VecDeque::new(),
        }
    }

    /// Prepares for a new file. `reset` clears the dictionary and filters;
    /// solid files keep both.
    pub(crate) fn init(&mut self, ver: u8, winsize: u8, reset: bool) -> Result<()> {
        if reset {
            self.filters.clear();
        }
        self.err = None;
        self.fbuf.clear();
        self.out = OutBuf::None;
        self.winbuf = 0..0;
        self.tot = 0;
        self.win.reset(winsize, reset);
        if let Some(d) = &self.dec {
            if d.version() != ver {
                return Err(RarError::MultipleDecoders);
            }
        } else {
            self.dec = Some(match ver {
                DECODE29 => Box::new(Decode29::new()),
                DECODE50 => Box::new(Decode50::new()),
                _ => return Err(RarError::UnknownDecoder(ver)),
            });
        }
        match self.dec.as_mut() {
            Some(d) => d.init(reset),
            None => Err(RarError::UnknownDecoder(ver)),
        }
    }

    /// Adds a filter to the queue, converting its offset to be relative to
    /// the queue tail.
    fn queue_filter(&mut self, mut f: FilterBlock) -> Result<()> {
        if self.filters.len() >= MAX_QUEUED_FILTERS {
            return Err(RarError::TooManyFilters);
        }
        // offset and length are window-sized quantities
        f.offset &= self.win.mask();
        f.length &= self.win.mask();
        for q in &self.filters {
            if f.offset < q.offset {
                // a filter block must not start before its predecessor
                return Err(RarError::InvalidFilter);
            }
            f.offset -= q.offset;
        }
        self.filters.push_back(f);
        Ok(())
    }

    /// Runs the due head filter, plus any chained filters at the same
    /// offset, over `fbuf`.
    fn process_filters(&mut self) -> Result<()> {
        let mut f = self.filters.pop_front().expect("filter queue empty");
        debug_assert_eq!(f.offset, 0);
        let n = f.length;
        (f.filter)(&mut self.fbuf, self.tot)?;
        loop {
            let Some(next) = self.filters.front() else {
                return Ok(());
            };
            if next.offset != 0 {
                self.filters[0].offset = self.filters[0].offset.saturating_sub(n);
                return Ok(());
            }
            // chained filter over the same block
            if next.length != self.fbuf.len() {
                return Err(RarError::InvalidFilter);
            }
            let mut f2 = self.filters.pop_front().unwrap();
            (f2.filter)(&mut self.fbuf, self.tot)?;
        }
    }

    /// Asks the decoder for more window data, queueing emitted filters.
    fn fill(&mut self, input: &mut dyn ByteInput) {
        if self.err.is_some() {
            return;
        }
        let Some(dec) = self.dec.as_mut() else {
            self.err = Some(RarError::UnknownDecoder(0));
            return;
        };
        match dec.fill(&mut self.win, input) {
            Ok(blocks) => {
                for fb in blocks {
                    if let Err(e) = self.queue_filter(fb) {
                        self.err = Some(e);
                        return;
                    }
                }
            }
            Err(e) => self.err = Some(e),
        }
    }

    fn out_is_empty(&self) -> bool {
        match &self.out {
            OutBuf::None => true,
            OutBuf::Win(r) => r.is_empty(),
            OutBuf::Buf(pos) => *pos >= self.fbuf.len(),
        }
    }

    /// Reads decoded plaintext into `p`. Returns 0 at end of stream.
    pub(crate) fn read(&mut self, input: &mut dyn ByteInput, p: &mut [u8]) -> Result<usize> {
        if p.is_empty() {
            return Ok(0);
        }
        while self.out_is_empty() {
            if let OutBuf::Buf(_) = self.out {
                self.fbuf.clear();
            }
            self.out = OutBuf::None;
            if self.winbuf.is_empty() {
                self.winbuf = self.win.bytes();
                if self.winbuf.is_empty() {
                    if let Some(e) = self.err.take() {
                        return Err(e);
                    }
                    self.fill(input);
                    self.winbuf = self.win.bytes();
                    if self.winbuf.is_empty() {
                        return match self.err.take() {
                            Some(e) => Err(e),
                            None => Ok(0),
                        };
                    }
                }
            }
            if self.filters.is_empty() {
                // no filters, the window slice is the output
                self.out = OutBuf::Win(std::mem::replace(&mut self.winbuf, 0..0));
                continue;
            }
            let head_offset = self.filters[0].offset;
            if head_offset > 0 {
                // bytes before the filter go straight to output
                let l = head_offset.min(self.winbuf.len());
                let r = self.winbuf.start..self.winbuf.start + l;
                self.winbuf.start += l;
                self.filters[0].offset -= l;
                self.out = OutBuf::Win(r);
                continue;
            }
            // the head filter is due; gather its input
            let need = self.filters[0].length - self.fbuf.len();
            if self.winbuf.len() >= need {
                let r = self.winbuf.start..self.winbuf.start + need;
                self.winbuf.start += need;
                let (win, fbuf) = (&self.win, &mut self.fbuf);
                fbuf.extend_from_slice(win.data(r));
                self.process_filters()?;
                self.out = OutBuf::Buf(0);
            } else {
                // not enough bytes yet; buffer what we have and loop
                let r = std::mem::replace(&mut self.winbuf, 0..0);
                let (win, fbuf) = (&self.win, &mut self.fbuf);
                fbuf.extend_from_slice(win.data(r));
            }
        }

        let n = match &mut self.out {
            OutBuf::Win(r) => {
                let n = p.len().min(r.len());
                p[..n].copy_from_slice(&self.win.data(r.start..r.start + n));
                r.start += n;
                n
            }
            OutBuf::Buf(pos) => {
                let n = p.len().min(self.fbuf.len() - *pos);
                p[..n].copy_from_slice(&self.fbuf[*pos..*pos + n]);
                *pos += n;
                n
            }
            OutBuf::None => unreachable!(),
        };
        self.tot += n as u64;
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Scripted decoder for exercising the reader and filter queue.
    struct ScriptDecoder {
        /// Per-fill: bytes to write and filters to emit
        /// (absolute offset, length, xor value).
        steps: Vec<(Vec<u8>, Vec<(usize, usize, u8)>)>,
        next: usize,
    }

    impl ScriptDecoder {
        fn new(steps: Vec<(Vec<u8>, Vec<(usize, usize, u8)>)>) -> Self {
            Self { steps, next: 0 }
        }
    }

    impl Decoder for ScriptDecoder {
        fn init(&mut self, _reset: bool) -> Result<()> {
            Ok(())
        }

        fn fill(
            &mut self,
            win: &mut Window,
            _input: &mut dyn ByteInput,
        ) -> Result<Vec<FilterBlock>> {
            if self.next >= self.steps.len() {
                return Ok(Vec::new());
            }
            let (bytes, filters) = &self.steps[self.next];
            self.next += 1;
            let buffered = win.buffered();
            for &b in bytes {
                win.write_byte(b);
            }
            let out = filters
                .iter()
                .map(|&(offset, length, x)| FilterBlock {
                    offset: offset + buffered,
                    length,
                    filter: Box::new(move |buf: &mut Vec<u8>, _pos: u64| {
                        for b in buf.iter_mut() {
                            *b ^= x;
                        }
                        Ok(())
                    }),
                })
                .collect();
            Ok(out)
        }

        fn version(&self) -> u8 {
            DECODE29
        }
    }

    fn reader_with(steps: Vec<(Vec<u8>, Vec<(usize, usize, u8)>)>) -> DecodeReader {
        let mut dr = DecodeReader::new();
        dr.win.reset(18, true);
        dr.dec = Some(Box::new(ScriptDecoder::new(steps)));
        dr
    }

    fn read_all(dr: &mut DecodeReader) -> Vec<u8> {
        let mut input = SliceInput::new(&[]);
        let mut out = Vec::new();
        let mut buf = [0u8; 7]; // odd size forces split deliveries
        loop {
            let n = dr.read(&mut input, &mut buf).unwrap();
            if n == 0 {
                return out;
            }
            out.extend_from_slice(&buf[..n]);
        }
    }

    #[test]
    fn test_plain_output_no_filters() {
        let mut dr = reader_with(vec![(b"hello world".to_vec(), vec![])]);
        assert_eq!(read_all(&mut dr), b"hello world");
    }

    #[test]
    fn test_filter_applies_at_offset() {
        // 64 bytes of zeros; filter xors 8 bytes at offset 16 with 0xFF
        let mut dr = reader_with(vec![(vec![0u8; 64], vec![(16, 8, 0xFF)])]);
        let out = read_all(&mut dr);
        assert_eq!(out.len(), 64);
        assert!(out[..16].iter().all(|&b| b == 0));
        assert!(out[16..24].iter().all(|&b| b == 0xFF));
        assert!(out[24..].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_filter_input_gathered_across_fills() {
        // filter covers bytes 4..12 which arrive over three fills
        let mut dr = reader_with(vec![
            (vec![1u8; 6], vec![(4, 8, 0xF0)]),
            (vec![2u8; 4], vec![]),
            (vec![3u8; 6], vec![]),
        ]);
        let out = read_all(&mut dr);
        assert_eq!(out.len(), 16);
        assert_eq!(&out[..4], &[1, 1, 1, 1]);
        assert_eq!(&out[4..12], &[0xF1, 0xF1, 0xF2, 0xF2, 0xF2, 0xF2, 0xF3, 0xF3]);
        assert_eq!(&out[12..], &[3, 3, 3, 3]);
    }

    #[test]
    fn test_chained_filters_same_offset() {
        let mut dr = reader_with(vec![(
            vec![0u8; 8],
            vec![(0, 8, 0x0F), (0, 8, 0xF0)],
        )]);
        let out = read_all(&mut dr);
        assert_eq!(out, vec![0xFF; 8]);
    }

    #[test]
    fn test_two_filters_in_sequence() {
        let mut dr = reader_with(vec![(vec![0u8; 32], vec![(4, 4, 0x01), (12, 4, 0x02)])]);
        let out = read_all(&mut dr);
        assert!(out[..4].iter().all(|&b| b == 0));
        assert!(out[4..8].iter().all(|&b| b == 1));
        assert!(out[8..12].iter().all(|&b| b == 0));
        assert!(out[12..16].iter().all(|&b| b == 2));
        assert!(out[16..].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_queue_preserves_caller_offsets() {
        // enqueue with non-decreasing absolute offsets; heads come back in
        // insertion order with the original spacing
        let mut dr = DecodeReader::new();
        dr.win.reset(18, true);
        for (off, len) in [(5usize, 2usize), (10, 3), (10, 3), (40, 1)] {
            dr.queue_filter(FilterBlock {
                offset: off,
                length: len,
                filter: Box::new(|_, _| Ok(())),
            })
            .unwrap();
        }
        let rel: Vec<usize> = dr.filters.iter().map(|f| f.offset).collect();
        assert_eq!(rel, vec![5, 5, 0, 30]);
        // reconstructing the absolute offsets returns the originals
        let mut abs = Vec::new();
        let mut base = 0;
        for r in rel {
            base += r;
            abs.push(base);
        }
        assert_eq!(abs, vec![5, 10, 10, 40]);
    }

    #[test]
    fn test_filter_before_predecessor_rejected() {
        let mut dr = DecodeReader::new();
        dr.win.reset(18, true);
        dr.queue_filter(FilterBlock {
            offset: 10,
            length: 4,
            filter: Box::new(|_, _| Ok(())),
        })
        .unwrap();
        let err = dr.queue_filter(FilterBlock {
            offset: 5,
            length: 4,
            filter: Box::new(|_, _| Ok(())),
        });
        assert!(matches!(err, Err(RarError::InvalidFilter)));
    }

    #[test]
    fn test_filter_queue_overflow() {
        let mut dr = DecodeReader::new();
        dr.win.reset(18, true);
        for _ in 0..MAX_QUEUED_FILTERS {
            dr.queue_filter(FilterBlock {
                offset: 0,
                length: 0,
                filter: Box::new(|_, _| Ok(())),
            })
            .unwrap();
        }
        let err = dr.queue_filter(FilterBlock {
            offset: 0,
            length: 0,
            filter: Box::new(|_, _| Ok(())),
        });
        assert!(matches!(err, Err(RarError::TooManyFilters)));
    }

    #[test]
    fn test_chained_filter_length_mismatch() {
        let mut dr = reader_with(vec![(
            vec![0u8; 8],
            vec![(0, 8, 0x0F), (0, 4, 0xF0)],
        )]);
        let mut input = SliceInput::new(&[]);
        let mut buf = [0u8; 16];
        assert!(matches!(
            dr.read(&mut input, &mut buf),
            Err(RarError::InvalidFilter)
        ));
    }
}
