//! Whole-frame integrity check.
//!
//! Computes the CRC-32 variant commonly labelled "IEEE 802.3": reflected
//! input/output, polynomial 0x04C11DB7, seed and final XOR both
//! 0xFFFFFFFF. The `crc` crate's `CRC_32_ISO_HDLC` algorithm is that exact
//! variant, so the checksum step itself is not hand-rolled here.

use std::cell::Cell;
use std::io::{self, Read, Write};

use crc::{Algorithm, Crc as CrcAlgorithm, CRC_32_ISO_HDLC};
use log::warn;

use crate::error::TransportError;
use crate::TryClone;

const CHECKSUM_LEN: usize = 4;
const READ_BUF: usize = 1024;

const ALGORITHM: &Algorithm<u32> = &CRC_32_ISO_HDLC;

fn checksum(data: &[u8]) -> u32 {
    CrcAlgorithm::<u32>::new(ALGORITHM).checksum(data)
}

/// Appends/verifies a trailing little-endian CRC-32 around each record
/// produced by the layer below (expected to deliver one whole record per
/// `read`, as `Framer` does).
pub struct Crc<C> {
    inner: C,
    closed: Cell<bool>,
}

impl<C: Read + Write> Crc<C> {
    pub fn new(inner: C) -> Self {
        Crc { inner, closed: Cell::new(false) }
    }

    pub fn into_inner(self) -> C {
        self.inner
    }

    /// Idempotent. Further `read`/`write` calls fail with
    /// `TransportError::Closed`.
    pub fn close(&self) {
        self.closed.set(true);
    }
}

impl<C: TryClone> TryClone for Crc<C> {
    fn try_clone(&self) -> io::Result<Self> {
        Ok(Crc { inner: self.inner.try_clone()?, closed: Cell::new(self.closed.get()) })
    }
}

impl<C: Read + Write> Read for Crc<C> {
    /// One lower-level read is assumed to yield a complete checksummed
    /// record. Fails with `ShortRead` if fewer than 4 bytes arrived, or
    /// `ChecksumMismatch` if the trailing CRC disagrees with the payload.
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.closed.get() {
            return Err(TransportError::Closed.into());
        }
        let mut read_buf = vec![0u8; READ_BUF];
        let nn = self.inner.read(&mut read_buf)?;
        if nn < CHECKSUM_LEN {
            let err = TransportError::ShortRead { expected: CHECKSUM_LEN, got: nn };
            warn!("crc: {}", err);
            return Err(err.into());
        }
        let (payload, trailer) = read_buf[..nn].split_at(nn - CHECKSUM_LEN);
        let on_wire = u32::from_le_bytes(trailer.try_into().unwrap());
        let calculated = checksum(payload);
        if calculated != on_wire {
            let err = TransportError::ChecksumMismatch { calculated, on_wire };
            warn!("crc: {}", err);
            return Err(err.into());
        }
        let n = payload.len().min(buf.len());
        buf[..n].copy_from_slice(&payload[..n]);
        Ok(n)
    }
}

impl<C: Read + Write> Write for Crc<C> {
    /// Submits `payload || crc32_le(payload)` to the lower channel as one
    /// logical write, retrying until fully drained.
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.closed.get() {
            return Err(TransportError::Closed.into());
        }
        let sum = checksum(buf);
        let mut out = Vec::with_capacity(buf.len() + CHECKSUM_LEN);
        out.extend_from_slice(buf);
        out.extend_from_slice(&sum.to_le_bytes());
        self.inner.write_all(&out)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}
