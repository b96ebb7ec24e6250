//! Copies bytes from a subprocess-shaped reader into a shared, lockable sink, flushing
//! only on complete lines.
//!
//! A naive `BufReader::lines()` forces a full UTF-8 validation pass and loses the
//! original byte layout; this instead keeps a ring of fixed-size buffers so that a
//! multi-byte UTF-8 rune split across a 16 KiB read boundary is carried intact into the
//! next buffer rather than corrupted or blocked on forever.

use std::collections::VecDeque;
use std::io;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt};

/// Size of each buffer in the ring.
pub const BUFFER_SIZE: usize = 16 * 1024;

/// Minimum trailing capacity a buffer must keep for a not-yet-complete UTF-8 rune (the
/// longest UTF-8 scalar is 4 bytes).
pub const END_THRESHOLD: usize = 4;

/// How long to sleep after a read that returned no data without signalling EOF, before
/// retrying. Tolerates noisy pty-like sources that wake up with nothing to report.
const IDLE_BACKOFF: Duration = Duration::from_secs(2);

/// The result of a single read from a [`LineSource`].
pub enum ReadOutcome {
    /// `n` new bytes are available.
    Data(usize),
    /// No bytes were read, but the source is not done — retry after a backoff.
    Idle,
    /// The source is exhausted.
    Eof,
}

/// An input to a [`StreamHandler`].
///
/// This is deliberately not [`tokio::io::AsyncRead`]: a plain `AsyncRead` conflates "no
/// data right now" with "done forever" by using a zero-length read for both. Piping a
/// noisy pty-backed child process needs to tell those apart.
#[async_trait::async_trait]
pub trait LineSource: Send {
    async fn read(&mut self, buf: &mut [u8]) -> io::Result<ReadOutcome>;

    /// Called once, after EOF, only if the handler was constructed as the owner of this
    /// source (see [`StreamHandler::new_owned`]).
    async fn close(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Adapts any [`tokio::io::AsyncRead`] into a [`LineSource`] under the standard
/// contract: a zero-length read always means EOF.
pub struct AsyncReadSource<R>(pub R);

#[async_trait::async_trait]
impl<R: AsyncRead + Unpin + Send> LineSource for AsyncReadSource<R> {
    async fn read(&mut self, buf: &mut [u8]) -> io::Result<ReadOutcome> {
        let n = AsyncReadExt::read(&mut self.0, buf).await?;
        Ok(if n == 0 {
            ReadOutcome::Eof
        } else {
            ReadOutcome::Data(n)
        })
    }
}

/// Where flushed line-aligned chunks are written.
///
/// Multiple `StreamHandler`s may share one sink; the lock guards interleaving of their
/// writes so lines from concurrent streams are never spliced mid-line.
pub trait LineSink: Send {
    fn write(&mut self, bytes: &[u8]) -> io::Result<()>;
}

/// A [`LineSink`] shared by an arbitrary number of handlers.
pub type SharedSink = Arc<Mutex<dyn LineSink>>;

impl LineSink for Vec<u8> {
    fn write(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.extend_from_slice(bytes);
        Ok(())
    }
}

struct Buffer {
    seq: u64,
    data: Vec<u8>,
    /// First byte not yet flushed.
    start: usize,
    /// First byte not yet scanned for rune/line boundaries.
    decoded_to: usize,
    /// First byte not yet written by a read.
    end_data: usize,
}

impl Buffer {
    fn fresh(seq: u64) -> Self {
        Self {
            seq,
            data: vec![0u8; BUFFER_SIZE],
            start: 0,
            decoded_to: 0,
            end_data: 0,
        }
    }

    fn recycle(mut self, seq: u64) -> Self {
        self.seq = seq;
        self.start = 0;
        self.decoded_to = 0;
        self.end_data = 0;
        self
    }
}

/// Copies from a [`LineSource`] into a [`SharedSink`] in whole-line chunks.
///
/// One `StreamHandler` is meant to be driven by one background task (see
/// [`StreamHandler::run`]); the sink's lock is what allows several handlers to share an
/// output safely.
pub struct StreamHandler {
    source: Box<dyn LineSource>,
    sink: SharedSink,
    owns_input: bool,
    chain: VecDeque<Buffer>,
    free: Vec<Buffer>,
    next_seq: u64,
    /// The furthest-forward point at which a complete line has been found but not yet
    /// flushed: `(buffer seq, offset within that buffer)`.
    boundary: Option<(u64, usize)>,
}

impl StreamHandler {
    /// Build a handler that does not own `source`: on EOF, the source is left alone.
    pub fn new_borrowed(source: Box<dyn LineSource>, sink: SharedSink) -> Self {
        Self::new(source, sink, false)
    }

    /// Build a handler that owns `source`: on EOF, [`LineSource::close`] is called.
    pub fn new_owned(source: Box<dyn LineSource>, sink: SharedSink) -> Self {
        Self::new(source, sink, true)
    }

    fn new(source: Box<dyn LineSource>, sink: SharedSink, owns_input: bool) -> Self {
        let mut chain = VecDeque::with_capacity(4);
        chain.push_back(Buffer::fresh(0));
        Self {
            source,
            sink,
            owns_input,
            chain,
            free: Vec::new(),
            next_seq: 1,
            boundary: None,
        }
    }

    /// Drive the handler to completion: read until EOF, flushing each complete line (or
    /// run of lines) as it's discovered, then flush any trailing partial line.
    pub async fn run(mut self) -> io::Result<()> {
        loop {
            self.rotate_if_needed();

            let tail = self.chain.back_mut().expect("chain always has a tail");
            let free_start = tail.end_data;
            let outcome = self.source.read(&mut tail.data[free_start..]).await?;

            match outcome {
                ReadOutcome::Data(n) => {
                    tail.end_data += n;
                    self.scan();
                    self.flush()?;
                }
                ReadOutcome::Idle => {
                    tracing::trace!(backoff_secs = IDLE_BACKOFF.as_secs(), "stream source idle");
                    tokio::time::sleep(IDLE_BACKOFF).await;
                }
                ReadOutcome::Eof => {
                    self.flush_remainder()?;
                    if self.owns_input {
                        self.source.close().await?;
                    }
                    return Ok(());
                }
            }
        }
    }

    fn rotate_if_needed(&mut self) {
        let needs_rotation = {
            let tail = self.chain.back().expect("chain always has a tail");
            BUFFER_SIZE - tail.end_data < END_THRESHOLD
        };
        if !needs_rotation {
            return;
        }

        let seq = self.next_seq;
        self.next_seq += 1;
        let mut fresh = self
            .free
            .pop()
            .map(|b| b.recycle(seq))
            .unwrap_or_else(|| Buffer::fresh(seq));

        // Carry over the undecoded trailing bytes of the old tail (a rune split across
        // the boundary) so the next scan can complete it.
        let old_tail = self.chain.back_mut().expect("chain always has a tail");
        let carried = old_tail.end_data - old_tail.decoded_to;
        if carried > 0 {
            fresh.data[..carried]
                .copy_from_slice(&old_tail.data[old_tail.decoded_to..old_tail.end_data]);
            fresh.end_data = carried;
        }
        old_tail.end_data = old_tail.decoded_to;

        self.chain.push_back(fresh);
    }

    /// Advance `decoded_to` over every complete UTF-8 scalar newly available in the tail
    /// buffer, recording a new line boundary whenever a `\n` is found.
    fn scan(&mut self) {
        let seq = self.chain.back().unwrap().seq;
        let tail = self.chain.back_mut().unwrap();

        loop {
            if tail.decoded_to >= tail.end_data {
                break;
            }
            let byte = tail.data[tail.decoded_to];
            let rune_len = utf8_char_len(byte);
            if tail.decoded_to + rune_len > tail.end_data {
                // Incomplete rune at the tail; wait for more bytes.
                break;
            }
            tail.decoded_to += rune_len;
            if byte == b'\n' {
                self.boundary = Some((seq, tail.decoded_to));
            }
        }
    }

    /// Flush everything up to the last discovered line boundary, releasing consumed
    /// buffers back to the freelist.
    fn flush(&mut self) -> io::Result<()> {
        let Some((boundary_seq, boundary_offset)) = self.boundary.take() else {
            return Ok(());
        };
        self.flush_to(boundary_seq, boundary_offset)
    }

    /// On EOF, flush whatever has been decoded but not yet terminated by a newline.
    fn flush_remainder(&mut self) -> io::Result<()> {
        self.flush()?;
        let (seq, decoded_to) = {
            let tail = self.chain.back().unwrap();
            (tail.seq, tail.decoded_to)
        };
        self.flush_to(seq, decoded_to)
    }

    fn flush_to(&mut self, boundary_seq: u64, boundary_offset: usize) -> io::Result<()> {
        let mut sink = self.sink.lock().expect("sink mutex poisoned");
        loop {
            let is_tail = self.chain.len() == 1;
            let front = self.chain.front_mut().expect("chain always has a front");

            if front.seq < boundary_seq {
                sink.write(&front.data[front.start..front.end_data])?;
                let done = self.chain.pop_front().unwrap();
                self.free.push(done);
            } else if front.seq == boundary_seq {
                if boundary_offset > front.start {
                    sink.write(&front.data[front.start..boundary_offset])?;
                    front.start = boundary_offset;
                }
                if is_tail {
                    break;
                }
                // The boundary buffer is fully consumed and more buffers remain ahead
                // of it in the chain; drop it so the freelist can reclaim it.
                if front.start >= front.end_data {
                    let done = self.chain.pop_front().unwrap();
                    self.free.push(done);
                }
                break;
            } else {
                break;
            }
        }
        Ok(())
    }
}

fn utf8_char_len(lead_byte: u8) -> usize {
    if lead_byte & 0x80 == 0 {
        1
    } else if lead_byte & 0xE0 == 0xC0 {
        2
    } else if lead_byte & 0xF0 == 0xE0 {
        3
    } else if lead_byte & 0xF8 == 0xF0 {
        4
    } else {
        // Not a valid UTF-8 leading byte; make progress rather than stalling forever.
        1
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    struct ChunkSource {
        chunks: std::collections::VecDeque<Vec<u8>>,
    }

    #[async_trait::async_trait]
    impl LineSource for ChunkSource {
        async fn read(&mut self, buf: &mut [u8]) -> io::Result<ReadOutcome> {
            match self.chunks.pop_front() {
                Some(chunk) => {
                    let n = chunk.len();
                    buf[..n].copy_from_slice(&chunk);
                    Ok(ReadOutcome::Data(n))
                }
                None => Ok(ReadOutcome::Eof),
            }
        }
    }

    fn run_to_completion(chunks: Vec<&[u8]>) -> Vec<u8> {
        let sink: SharedSink = Arc::new(Mutex::new(Vec::<u8>::new()));
        let source = ChunkSource {
            chunks: chunks.into_iter().map(<[u8]>::to_vec).collect(),
        };
        let handler = StreamHandler::new_borrowed(Box::new(source), Arc::clone(&sink));

        let rt = tokio::runtime::Builder::new_current_thread()
            .build()
            .unwrap();
        rt.block_on(handler.run()).unwrap();

        let sink = sink.lock().unwrap();
        (*sink).clone()
    }

    #[test]
    fn whole_lines_pass_through_unchanged() {
        let out = run_to_completion(vec![b"alpha\nbeta\n"]);
        assert_eq!(out, b"alpha\nbeta\n");
    }

    #[test]
    fn trailing_partial_line_is_flushed_on_eof() {
        let out = run_to_completion(vec![b"alpha\nbeta"]);
        assert_eq!(out, b"alpha\nbeta");
    }

    #[test]
    fn multi_byte_rune_split_across_reads_is_preserved() {
        // "héllo\n" with 'é' (0xC3 0xA9) split across two reads.
        let full = "h\u{e9}llo\n".as_bytes().to_vec();
        let (first, second) = full.split_at(2); // splits inside the 2-byte rune
        let out = run_to_completion(vec![first, second]);
        assert_eq!(out, full);
    }

    #[test]
    fn multi_byte_rune_split_across_buffer_boundary_is_preserved() {
        // Fill the first ring buffer to exactly BUFFER_SIZE - 1 bytes of ASCII, then
        // split a 2-byte rune across the forced rotation.
        let mut first = vec![b'a'; BUFFER_SIZE - 1];
        first.push(0xC3); // first byte of 'é'
        let second = vec![0xA9, b'\n'];
        let out = run_to_completion(vec![&first, &second]);

        let mut expected = vec![b'a'; BUFFER_SIZE - 1];
        expected.push(0xC3);
        expected.push(0xA9);
        expected.push(b'\n');
        assert_eq!(out, expected);
    }

    #[test]
    fn multiple_lines_in_one_read_flush_together() {
        let out = run_to_completion(vec![b"one\ntwo\nthree\n"]);
        assert_eq!(out, b"one\ntwo\nthree\n");
    }
}
