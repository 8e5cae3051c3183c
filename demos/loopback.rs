//! Runs the full layered stack, `Framer -> Crc -> Mux -> Sequencer`, over a
//! pair of loopback pipes joined by an mpsc channel in each direction, the
//! same shape as the original MIN library's multithreaded loopback example.
//! Mirrors `serial.NewSequencer(serial.NewCRC(serial.NewFramer(dev)))` from
//! the BMC client daemon this crate's stack is modeled on, but with two
//! independent logical streams multiplexed onto the one physical link.

use std::io::{self, Read, Write};
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::thread;

use env_logger;
use log::LevelFilter;

use serial_transport::{Crc, Framer, Mux, Sequencer, TryClone};

/// One direction of an in-memory duplex pipe: bytes written are handed to
/// the channel, bytes read come back out of it. The receiving half is
/// shared behind a mutex so the pipe can be cheaply split into an
/// independent read handle and write handle onto the same channel (see
/// `TryClone`); in practice only the designated reader handle ever calls
/// `read`.
#[derive(Clone)]
struct ChannelPipe {
    tx: Sender<u8>,
    rx: Arc<Mutex<Receiver<u8>>>,
}

impl Read for ChannelPipe {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let rx = self.rx.lock().unwrap();
        // Block for at least one byte, then drain whatever else is
        // already queued without blocking further.
        match rx.recv() {
            Ok(first) => {
                buf[0] = first;
                let mut n = 1;
                while n < buf.len() {
                    match rx.try_recv() {
                        Ok(b) => {
                            buf[n] = b;
                            n += 1;
                        }
                        Err(_) => break,
                    }
                }
                Ok(n)
            }
            Err(_) => Ok(0), // peer hung up
        }
    }
}

impl TryClone for ChannelPipe {
    fn try_clone(&self) -> io::Result<Self> {
        Ok(self.clone())
    }
}

impl Write for ChannelPipe {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        for &byte in buf {
            self.tx
                .send(byte)
                .map_err(|e| io::Error::new(io::ErrorKind::BrokenPipe, e.to_string()))?;
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

fn joined_pair() -> (ChannelPipe, ChannelPipe) {
    let (tx_a, rx_b) = channel();
    let (tx_b, rx_a) = channel();
    (
        ChannelPipe { tx: tx_a, rx: Arc::new(Mutex::new(rx_a)) },
        ChannelPipe { tx: tx_b, rx: Arc::new(Mutex::new(rx_b)) },
    )
}

fn main() {
    log::set_max_level(LevelFilter::Trace);
    env_logger::init();

    let (side_a, side_b) = joined_pair();

    let server = thread::Builder::new()
        .name("demo-server".into())
        .spawn(move || {
            let mux = Mux::new(Crc::new(Framer::new(side_b)));
            let mut console = Sequencer::new(mux.stream(0));
            let mut telemetry = Sequencer::new(mux.stream(1));

            let mut buf = [0u8; 64];
            let n = console.read(&mut buf).unwrap();
            println!("server console got: {:?}", &buf[..n]);
            console.write_all(b"ack").unwrap();

            let n = telemetry.read(&mut buf).unwrap();
            println!("server telemetry got: {:?}", &buf[..n]);
        })
        .unwrap();

    let mux = Mux::new(Crc::new(Framer::new(side_a)));
    let mut console = Sequencer::new(mux.stream(0));
    let mut telemetry = Sequencer::new(mux.stream(1));

    console.write_all(b"hello switch").unwrap();
    telemetry.write_all(b"temp=42C").unwrap();

    let mut buf = [0u8; 64];
    let n = console.read(&mut buf).unwrap();
    println!("client console got: {:?}", &buf[..n]);

    server.join().unwrap();
}
