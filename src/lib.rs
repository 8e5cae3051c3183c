//! A layered, reliable byte-stream transport for a network switch's serial
//! base-management control plane.
//!
//! Four independent layers, each exposing nothing more than
//! [`std::io::Read`] + [`std::io::Write`], compose bottom to top:
//!
//! ```text
//! raw device -> Framer -> Crc -> [Mux] -> Sequencer -> RPC codec (out of scope)
//! ```
//!
//! `Mux` is optional: a single-stream deployment wraps `Crc` directly in a
//! `Sequencer`, a multi-stream one calls [`Mux::stream`] once per logical
//! channel and puts a `Sequencer` on top of each.
//!
//! ```no_run
//! use std::io::{Read, Write};
//! use std::net::TcpStream;
//!
//! use serial_transport::{Crc, Framer, Sequencer};
//!
//! # fn connect() -> std::io::Result<()> {
//! let dev = TcpStream::connect("127.0.0.1:9000")?;
//! let mut link = Sequencer::new(Crc::new(Framer::new(dev)));
//!
//! link.write_all(b"hello switch")?;
//! let mut reply = [0u8; 64];
//! let n = link.read(&mut reply)?;
//! println!("got {} bytes back", n);
//! # Ok(())
//! # }
//! ```
//!
//! For several independent logical streams over one physical link:
//!
//! ```no_run
//! use serial_transport::{Crc, Framer, Mux, Sequencer};
//! use std::net::TcpStream;
//!
//! # fn connect() -> std::io::Result<()> {
//! let dev = TcpStream::connect("127.0.0.1:9000")?;
//! let mux = Mux::new(Crc::new(Framer::new(dev)));
//! let mut console = Sequencer::new(mux.stream(0));
//! let mut telemetry = Sequencer::new(mux.stream(1));
//! # let _ = (&mut console, &mut telemetry);
//! # Ok(())
//! # }
//! ```

use std::io;
use std::net::TcpStream;

pub mod crc;
pub mod error;
pub mod framer;
pub mod mux;
pub mod sequencer;

pub use crate::crc::Crc;
pub use crate::error::TransportError;
pub use crate::framer::Framer;
pub use crate::mux::{Mux, MuxStream, MAX_STREAMS};
pub use crate::sequencer::{Sequencer, DEFAULT_RETRANSMIT_INTERVAL};

/// A channel that can be split into a second, independent handle onto the
/// same underlying link.
///
/// `Mux` and `Sequencer` each own a background reader thread that may
/// block indefinitely in a lower-level read. Per the concurrency model's
/// recommended design, application writes and the retransmit timer must
/// never contend with that in-flight read for the same lock, so both
/// layers call `try_clone` once at construction time to hand the reader
/// thread and the writers their own handles onto the link, guarded by
/// independent mutexes. Mirrors `std::net::TcpStream::try_clone`, which
/// this trait forwards to directly.
pub trait TryClone: Sized {
    fn try_clone(&self) -> io::Result<Self>;
}

impl TryClone for TcpStream {
    fn try_clone(&self) -> io::Result<Self> {
        TcpStream::try_clone(self)
    }
}
