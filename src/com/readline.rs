use std::collections::VecDeque;
use std::io::{self, ErrorKind, Write};
use std::time::Duration;

use crate::com::{CancelToken, ComReader};
use crate::constants::{XOFF, XON, ZDLE};

/// Bytes requested from the channel per refill.
const READ_BATCH: usize = 128;
/// Read-ahead capacity.
const BUFFER_CAPACITY: usize = 256;

/// Buffered protocol I/O over the host channel.
///
/// Single-byte reads with a per-read deadline, plus the small protocol
/// helpers the frame reader needs. The detector seeds already-consumed
/// bytes back in through [`ZReadline::unread`].
pub struct ZReadline<'a> {
    rx: &'a mut dyn ComReader,
    tx: &'a mut dyn Write,
    rbuf: VecDeque<u8>,
    timeout: Duration,
    cancel: CancelToken,
}

impl<'a> ZReadline<'a> {
    pub fn new(
        rx: &'a mut dyn ComReader,
        tx: &'a mut dyn Write,
        timeout: Duration,
        cancel: CancelToken,
    ) -> Self {
        Self {
            rx,
            tx,
            rbuf: VecDeque::with_capacity(BUFFER_CAPACITY),
            timeout,
            cancel,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Push bytes back so they are delivered before anything new from the
    /// channel. Order is preserved.
    pub fn unread(&mut self, bytes: &[u8]) {
        for b in bytes.iter().rev() {
            self.rbuf.push_front(*b);
        }
    }

    pub fn read_byte(&mut self) -> io::Result<u8> {
        self.read_byte_deadline(self.timeout)
    }

    pub fn read_byte_deadline(&mut self, deadline: Duration) -> io::Result<u8> {
        if let Some(b) = self.rbuf.pop_front() {
            return Ok(b);
        }
        if self.cancel.is_cancelled() {
            return Err(io::Error::new(ErrorKind::Interrupted, "transfer cancelled"));
        }
        let mut chunk = [0u8; READ_BATCH];
        let n = self.rx.read_timeout(&mut chunk, deadline)?;
        if n == 0 {
            return Err(io::Error::new(ErrorKind::UnexpectedEof, "carrier lost"));
        }
        self.rbuf.extend(&chunk[1..n]);
        Ok(chunk[0])
    }

    /// Discard everything already received but not yet consumed, both in
    /// the read-ahead buffer and pending on the channel. Used during error
    /// recovery before resynchronizing.
    pub fn purge_line(&mut self) {
        let mut purged = self.rbuf.len();
        self.rbuf.clear();
        let mut chunk = [0u8; READ_BATCH];
        loop {
            match self.rx.read_timeout(&mut chunk, Duration::from_millis(1)) {
                Ok(0) | Err(_) => break,
                Ok(n) => purged += n,
            }
        }
        if purged > 0 {
            log::debug!("purged {purged} stale byte(s)");
        }
    }

    /// Read a byte masked to seven bits, silently dropping XON/XOFF.
    /// Used only while scanning for a header's frame-format byte.
    pub fn noxrd7(&mut self) -> io::Result<u8> {
        loop {
            let c = self.read_byte()? & 0x7F;
            match c {
                XON | XOFF => continue,
                b'\r' | b'\n' | ZDLE => return Ok(c),
                _ => return Ok(c),
            }
        }
    }

    pub fn write(&mut self, buf: &[u8]) -> io::Result<()> {
        self.tx.write_all(buf)
    }

    pub fn flush(&mut self) -> io::Result<()> {
        self.tx.flush()
    }
}
