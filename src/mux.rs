//! Length-prefixed, optionally multi-stream packets.
//!
//! Only the multi-stream variant is implemented: a single-stream
//! deployment is just this one restricted to stream 0, so a
//! single-stream user simply takes `mux.stream(0)`.

use std::collections::{HashMap, VecDeque};
use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};

use log::{debug, trace, warn};

use crate::error::TransportError;
use crate::TryClone;

const HEADER_LEN: usize = 4;

/// Upper bound on distinct stream identifiers (`stream` is one byte).
pub const MAX_STREAMS: usize = 256;

struct Header {
    pktlen: u16,
    ctrl: u8,
    stream: u8,
}

impl Header {
    fn encode(&self) -> [u8; HEADER_LEN] {
        let mut buf = [0u8; HEADER_LEN];
        buf[0..2].copy_from_slice(&self.pktlen.to_le_bytes());
        buf[2] = self.ctrl;
        buf[3] = self.stream;
        buf
    }

    fn decode(buf: &[u8; HEADER_LEN]) -> Self {
        Header {
            pktlen: u16::from_le_bytes([buf[0], buf[1]]),
            ctrl: buf[2],
            stream: buf[3],
        }
    }
}

struct StreamBuf {
    data: VecDeque<u8>,
    closed: bool,
}

type StreamSlot = Arc<(Mutex<StreamBuf>, Condvar)>;

struct Shared<C> {
    // Touched only by the single background reader thread; a Mutex here
    // is for uniformity with `writer_lower`, not to arbitrate contention.
    reader_lower: Mutex<C>,
    // The dedicated emit mutex: every application write goes through this
    // handle to the same link, never the reader's. A packet's header and
    // payload are one write under one lock acquisition, so packets from
    // different streams never interleave their headers on the wire, and a
    // write never blocks on the reader thread's in-flight blocking read.
    writer_lower: Mutex<C>,
    streams: Mutex<HashMap<u8, StreamSlot>>,
    closed: AtomicBool,
    error: Mutex<Option<(io::ErrorKind, String)>>,
}

impl<C> Shared<C> {
    fn slot_for(&self, id: u8) -> StreamSlot {
        let mut streams = self.streams.lock().unwrap();
        Arc::clone(streams.entry(id).or_insert_with(|| {
            Arc::new((Mutex::new(StreamBuf { data: VecDeque::new(), closed: false }), Condvar::new()))
        }))
    }

    fn take_error(&self) -> Option<io::Error> {
        self.error
            .lock()
            .unwrap()
            .clone()
            .map(|(kind, msg)| io::Error::new(kind, msg))
    }

    fn wake_all_streams(&self) {
        let streams = self.streams.lock().unwrap();
        for slot in streams.values() {
            slot.1.notify_all();
        }
    }

    fn fail(&self, err: TransportError) {
        warn!("mux: background reader terminating: {}", err);
        let io_err: io::Error = err.into();
        let mut slot = self.error.lock().unwrap();
        if slot.is_none() {
            *slot = Some((io_err.kind(), io_err.to_string()));
        }
        drop(slot);
        self.closed.store(true, Ordering::SeqCst);
        self.wake_all_streams();
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.wake_all_streams();
    }
}

/// Owns the background reader that demultiplexes packets read from a
/// single lower channel into up to [`MAX_STREAMS`] independent ordered
/// byte streams.
pub struct Mux<C> {
    shared: Arc<Shared<C>>,
    _reader: Option<JoinHandle<()>>,
}

impl<C: Read + Write + TryClone + Send + 'static> Mux<C> {
    pub fn new(inner: C) -> Self {
        let writer_inner = inner.try_clone().expect("clone lower channel for dedicated writer handle");
        let shared = Arc::new(Shared {
            reader_lower: Mutex::new(inner),
            writer_lower: Mutex::new(writer_inner),
            streams: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
            error: Mutex::new(None),
        });

        let reader_shared = Arc::clone(&shared);
        let reader = thread::Builder::new()
            .name("mux-reader".into())
            .spawn(move || reader_loop(reader_shared))
            .expect("spawn mux reader thread");

        Mux { shared, _reader: Some(reader) }
    }

    /// Returns a handle for stream `id`, creating its receive buffer on
    /// first reference. Handles are cheap to clone and may be held from
    /// multiple threads.
    pub fn stream(&self, id: u8) -> MuxStream<C> {
        debug!("mux: opening stream {}", id);
        let _ = self.shared.slot_for(id);
        MuxStream { id, shared: Arc::clone(&self.shared) }
    }

    /// Idempotent. Terminates the background reader's effect on new I/O
    /// and wakes every stream blocked in `read`.
    pub fn close(&self) {
        self.shared.close();
    }
}

fn reader_loop<C: Read + Write>(shared: Arc<Shared<C>>) {
    loop {
        if shared.closed.load(Ordering::SeqCst) {
            return;
        }

        let mut hdr = [0u8; HEADER_LEN];
        let result = {
            let mut lower = shared.reader_lower.lock().unwrap();
            lower.read_exact(&mut hdr)
        };
        if let Err(e) = result {
            shared.fail(TransportError::LowerIo(e));
            return;
        }

        let header = Header::decode(&hdr);
        if header.ctrl != 0 {
            shared.fail(TransportError::FramingViolation(format!(
                "reserved ctrl byte must be 0, got {:#04x} on stream {}",
                header.ctrl, header.stream
            )));
            return;
        }

        let mut payload = vec![0u8; header.pktlen as usize];
        let result = {
            let mut lower = shared.reader_lower.lock().unwrap();
            lower.read_exact(&mut payload)
        };
        if let Err(e) = result {
            shared.fail(TransportError::LowerIo(e));
            return;
        }

        let slot = shared.slot_for(header.stream);
        {
            let (buf_lock, cv) = &*slot;
            let mut state = buf_lock.lock().unwrap();
            state.data.extend(payload);
            cv.notify_all();
        }
        trace!("mux: delivered {} bytes to stream {}", header.pktlen, header.stream);
    }
}

/// A single demultiplexed ordered byte stream.
pub struct MuxStream<C> {
    id: u8,
    shared: Arc<Shared<C>>,
}

impl<C> Clone for MuxStream<C> {
    fn clone(&self) -> Self {
        MuxStream { id: self.id, shared: Arc::clone(&self.shared) }
    }
}

impl<C> TryClone for MuxStream<C> {
    /// Already a cheap, shareable handle over the demuxed stream's data
    /// structure; cloning it is exactly cloning the handle.
    fn try_clone(&self) -> io::Result<Self> {
        Ok(self.clone())
    }
}

impl<C: Read + Write> MuxStream<C> {
    /// Idempotent. Marks this stream (not the whole `Mux`) closed: further
    /// `read`/`write` calls on this handle fail with
    /// `TransportError::Closed`, but other streams on the same `Mux` are
    /// unaffected.
    pub fn close(&self) {
        let slot = self.shared.slot_for(self.id);
        let (buf_lock, cv) = &*slot;
        buf_lock.lock().unwrap().closed = true;
        cv.notify_all();
    }
}

impl<C: Read + Write> Read for MuxStream<C> {
    /// Blocks until this stream's receive buffer is non-empty, then
    /// copies out up to `buf.len()` bytes. Never returns `Ok(0)` on a live
    /// channel.
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let slot = self.shared.slot_for(self.id);
        let (buf_lock, cv) = &*slot;
        let mut state = buf_lock.lock().unwrap();
        loop {
            if !state.data.is_empty() {
                break;
            }
            if state.closed {
                return Err(TransportError::Closed.into());
            }
            if let Some(err) = self.shared.take_error() {
                return Err(err);
            }
            if self.shared.closed.load(Ordering::SeqCst) {
                return Err(TransportError::Closed.into());
            }
            state = cv.wait(state).unwrap();
        }
        let n = state.data.len().min(buf.len());
        for slot in buf.iter_mut().take(n) {
            *slot = state.data.pop_front().unwrap();
        }
        Ok(n)
    }
}

impl<C: Read + Write> Write for MuxStream<C> {
    /// Serialises `(pktlen, ctrl=0, stream=self.id)` and the payload into
    /// one buffer and submits it as a single lower-level write, so the
    /// packet is one wire-level record (one CRC/Framer unit) even when
    /// other streams write concurrently.
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if buf.len() > u16::MAX as usize {
            return Err(TransportError::FramingViolation(format!(
                "payload of {} bytes exceeds u16::MAX",
                buf.len()
            ))
            .into());
        }
        {
            let slot = self.shared.slot_for(self.id);
            if slot.0.lock().unwrap().closed {
                return Err(TransportError::Closed.into());
            }
        }
        let header = Header { pktlen: buf.len() as u16, ctrl: 0, stream: self.id };
        let mut packet = Vec::with_capacity(HEADER_LEN + buf.len());
        packet.extend_from_slice(&header.encode());
        packet.extend_from_slice(buf);
        self.shared.writer_lower.lock().unwrap().write_all(&packet)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.shared.writer_lower.lock().unwrap().flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[derive(Clone)]
    struct LoopbackPipe {
        inbound: Arc<Mutex<Cursor<Vec<u8>>>>,
        outbound: Arc<Mutex<Vec<u8>>>,
    }

    impl LoopbackPipe {
        fn new(inbound: Vec<u8>, outbound: Arc<Mutex<Vec<u8>>>) -> Self {
            LoopbackPipe { inbound: Arc::new(Mutex::new(Cursor::new(inbound))), outbound }
        }
    }

    impl Read for LoopbackPipe {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            Read::read(&mut *self.inbound.lock().unwrap(), buf)
        }
    }

    impl Write for LoopbackPipe {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.outbound.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl TryClone for LoopbackPipe {
        fn try_clone(&self) -> io::Result<Self> {
            Ok(self.clone())
        }
    }

    fn encode_packet(stream: u8, payload: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&(payload.len() as u16).to_le_bytes());
        out.push(0);
        out.push(stream);
        out.extend_from_slice(payload);
        out
    }

    #[test]
    fn demultiplexes_independent_streams_in_order() {
        let mut wire = Vec::new();
        wire.extend(encode_packet(1, b"aaa"));
        wire.extend(encode_packet(2, b"bbb"));
        wire.extend(encode_packet(1, b"ccc"));

        let mux = Mux::new(LoopbackPipe::new(wire, Arc::new(Mutex::new(Vec::new()))));
        let mut s1 = mux.stream(1);
        let mut s2 = mux.stream(2);

        let mut buf = [0u8; 16];
        let n = s1.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"aaa");

        let n = s2.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"bbb");

        let n = s1.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"ccc");
    }

    #[test]
    fn write_serialises_header_and_payload_as_one_packet() {
        let outbound = Arc::new(Mutex::new(Vec::new()));
        let mux = Mux::new(LoopbackPipe::new(Vec::new(), Arc::clone(&outbound)));
        let mut s = mux.stream(7);
        s.write_all(b"payload").unwrap();

        let expected = encode_packet(7, b"payload");
        assert_eq!(*outbound.lock().unwrap(), expected);
    }
}
