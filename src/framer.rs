//! Byte-stuffed record framing over a raw octet stream.

use std::cell::Cell;
use std::collections::VecDeque;
use std::io::{self, Read, Write};

use log::debug;

use crate::error::TransportError;
use crate::TryClone;

/// Frame delimiter. Appears on the wire only as a sentinel or escaped.
const SOF: u8 = 0x7e;
/// Escape byte.
const ESC: u8 = 0x7d;

const READ_CHUNK: usize = 256;

/// Delimits and de-escapes records out of a raw byte stream.
///
/// A single `Framer` must not be driven by more than one thread at a time:
/// `read` and `write` both take `&mut self` and the rolling input buffer is
/// only ever valid under that external serialization. The
/// layer above (`Mux`/`Sequencer`) is responsible for that serialization
/// when it wraps a `Framer` with a background reader thread.
pub struct Framer<C> {
    inner: C,
    read_buffer: VecDeque<u8>,
    in_frame: bool,
    in_escape: bool,
    closed: Cell<bool>,
}

impl<C: Read + Write> Framer<C> {
    pub fn new(inner: C) -> Self {
        Framer {
            inner,
            read_buffer: VecDeque::new(),
            in_frame: false,
            in_escape: false,
            closed: Cell::new(false),
        }
    }

    pub fn into_inner(self) -> C {
        self.inner
    }

    /// Idempotent. Further `read`/`write` calls fail with
    /// `TransportError::Closed`.
    pub fn close(&self) {
        self.closed.set(true);
    }

    fn fill(&mut self) -> io::Result<()> {
        let mut chunk = vec![0u8; READ_CHUNK];
        let nn = self.inner.read(&mut chunk)?;
        if nn == 0 {
            debug!("framer: end of stream, resetting frame state");
            self.in_frame = false;
            self.in_escape = false;
            self.read_buffer.clear();
            return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "lower channel at end of stream"));
        }
        self.read_buffer.extend(&chunk[..nn]);
        Ok(())
    }
}

impl<C: TryClone> TryClone for Framer<C> {
    /// Produces a second handle onto the same link with its own, fresh
    /// parse state. Safe to use purely for `write` (as the dedicated emit
    /// handle in `Mux`/`Sequencer` does): `write` never touches
    /// `read_buffer`/`in_frame`/`in_escape`.
    fn try_clone(&self) -> io::Result<Self> {
        Ok(Framer {
            inner: self.inner.try_clone()?,
            read_buffer: VecDeque::new(),
            in_frame: false,
            in_escape: false,
            closed: Cell::new(self.closed.get()),
        })
    }
}

impl<C: Read + Write> Read for Framer<C> {
    /// Returns the next frame's de-escaped payload. Bytes outside any
    /// `0x7e`-delimited region are discarded (resynchronisation): closing
    /// a frame always leaves the reader outside any frame again, so a
    /// fresh `0x7e` is required to open the next one. A zero-length frame
    /// (two sentinels with nothing real between them) is skipped rather
    /// than surfaced, preserving the "no zero-success read" property.
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.closed.get() {
            return Err(TransportError::Closed.into());
        }
        if buf.is_empty() {
            return Ok(0);
        }
        let mut n = 0usize;
        loop {
            while let Some(ch) = self.read_buffer.pop_front() {
                if !self.in_frame {
                    if ch == SOF {
                        self.in_frame = true;
                    }
                    continue;
                }
                if self.in_escape {
                    // An escape immediately followed by end-of-frame is
                    // treated as "escape applies to the next literal
                    // byte", even if that byte is 0x7e itself.
                    if n < buf.len() {
                        buf[n] = ch;
                        n += 1;
                    }
                    self.in_escape = false;
                    continue;
                }
                if ch == ESC {
                    self.in_escape = true;
                    continue;
                }
                if ch != SOF {
                    if n < buf.len() {
                        buf[n] = ch;
                        n += 1;
                    }
                    continue;
                }
                // Unescaped SOF: end of frame. A fresh sentinel is
                // required to open the next one; anything arriving before
                // it is resynchronisation noise and gets discarded.
                self.in_frame = false;
                if n > 0 {
                    return Ok(n);
                }
            }
            self.fill()?;
        }
    }
}

impl<C: Read + Write> Write for Framer<C> {
    /// Escapes `0x7d`/`0x7e` and brackets the result with a leading and a
    /// trailing `0x7e`, retrying partial lower-level writes until every
    /// byte is accepted. The leading sentinel is what lets a cold reader
    /// open the very first frame: since closing a frame no longer doubles
    /// as opening the next one, every write must supply its own opener.
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.closed.get() {
            return Err(TransportError::Closed.into());
        }
        let mut out = Vec::with_capacity(buf.len() + 2);
        out.push(SOF);
        for &byte in buf {
            if byte == ESC || byte == SOF {
                out.push(ESC);
            }
            out.push(byte);
        }
        out.push(SOF);
        self.inner.write_all(&out)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Pipe {
        data: VecDeque<u8>,
        written: Vec<u8>,
    }

    impl Pipe {
        fn new(data: &[u8]) -> Self {
            Pipe { data: data.iter().copied().collect(), written: Vec::new() }
        }
    }

    impl Read for Pipe {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            let n = self.data.len().min(buf.len()).min(7); // force short reads
            for i in 0..n {
                buf[i] = self.data.pop_front().unwrap();
            }
            Ok(n)
        }
    }

    impl Write for Pipe {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.written.extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn round_trips_plain_payload() {
        let mut framer = Framer::new(Pipe::new(&[]));
        framer.write(b"hello").unwrap();
        let wire = framer.into_inner().written;
        assert_eq!(wire, [SOF, b'h', b'e', b'l', b'l', b'o', SOF]);

        let mut framer = Framer::new(Pipe::new(&wire));
        let mut out = [0u8; 16];
        let n = framer.read(&mut out).unwrap();
        assert_eq!(&out[..n], b"hello");
    }

    #[test]
    fn escapes_reserved_bytes() {
        let mut framer = Framer::new(Pipe::new(&[]));
        framer.write(&[0x01, ESC, 0x02, SOF, 0x03]).unwrap();
        let wire = framer.into_inner().written;
        assert_eq!(
            wire,
            vec![SOF, 0x01, ESC, ESC, 0x02, ESC, SOF, 0x03, SOF]
        );

        let mut framer = Framer::new(Pipe::new(&wire));
        let mut out = [0u8; 16];
        let n = framer.read(&mut out).unwrap();
        assert_eq!(&out[..n], &[0x01, ESC, 0x02, SOF, 0x03]);
    }

    #[test]
    fn discards_garbage_outside_frames_and_resyncs() {
        let mut wire = Vec::new();
        wire.push(SOF);
        wire.extend(b"one");
        wire.push(SOF);
        wire.extend(b"garbage not in a frame");
        wire.push(SOF);
        wire.extend(b"two");
        wire.push(SOF);

        let mut framer = Framer::new(Pipe::new(&wire));
        let mut out = [0u8; 16];

        let n = framer.read(&mut out).unwrap();
        assert_eq!(&out[..n], b"one");

        let n = framer.read(&mut out).unwrap();
        assert_eq!(&out[..n], b"two");
    }

    #[test]
    fn back_to_back_sentinels_produce_no_empty_frame() {
        let mut wire = Vec::new();
        wire.push(SOF);
        wire.extend(b"a");
        wire.push(SOF); // closes "a"
        wire.push(SOF); // opens, then immediately closes: zero-length frame
        wire.push(SOF); // must be skipped rather than returned as Ok(0)
        wire.extend(b"b");
        wire.push(SOF);

        let mut framer = Framer::new(Pipe::new(&wire));
        let mut out = [0u8; 16];

        let n = framer.read(&mut out).unwrap();
        assert_eq!(&out[..n], b"a");
        let n = framer.read(&mut out).unwrap();
        assert_eq!(&out[..n], b"b");
    }
}
