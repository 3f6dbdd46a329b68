use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::callbacks::TransferHandler;
use crate::com::{ComReader, ZReadline};
use crate::constants::{ZDLE, ZHEX, ZPAD};
use crate::session::{Config, Zmodem};

/// Bytes of recent terminal output kept for signatures that straddle reads.
const SCAN_TAIL: usize = 16;
/// Poll granularity of the passthrough read loop.
const PASSTHROUGH_POLL: Duration = Duration::from_millis(500);

/// Inline middleware between a remote shell and the local terminal.
///
/// Reads pass through untouched until the opening ZRINIT of a remote `rz`
/// (or `sz`) appears in the stream. At that point the matched bytes are
/// held back, a session runs over the same channel, and passthrough resumes
/// when it finishes. The application never sees protocol bytes.
///
/// The read side is owned; the write side is shared, so keystrokes can keep
/// flowing from another thread through [`TerminalIo::writer`].
pub struct TerminalIo<R: ComReader, W: Write> {
    rx: R,
    tx: Arc<Mutex<W>>,
    session: Zmodem,
    tail: Vec<u8>,
    /// Replay armed by a match whose preceding bytes still had to be
    /// delivered; the session runs on the next read call.
    pending: Option<Vec<u8>>,
    transferring: Arc<AtomicBool>,
}

impl<R: ComReader, W: Write> TerminalIo<R, W> {
    pub fn new(rx: R, tx: W, config: Config, handler: Box<dyn TransferHandler>) -> Self {
        Self {
            rx,
            tx: Arc::new(Mutex::new(tx)),
            session: Zmodem::new(config, handler),
            tail: Vec::with_capacity(SCAN_TAIL),
            pending: None,
            transferring: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Keystroke side: forwards unchanged to the remote.
    pub fn writer(&self) -> TerminalWriter<W> {
        TerminalWriter {
            tx: self.tx.clone(),
        }
    }

    pub fn is_transferring(&self) -> bool {
        self.transferring.load(Ordering::SeqCst)
    }

    fn run_session(&mut self, replay: Vec<u8>) {
        log::info!("zmodem session detected, {} byte(s) replayed", replay.len());
        self.transferring.store(true, Ordering::SeqCst);
        let timeout = self.session.config().timeout_duration();
        let cancel = self.session.config().cancel.clone();
        let mut tx = TerminalWriter {
            tx: self.tx.clone(),
        };
        let result = {
            let mut io = ZReadline::new(&mut self.rx, &mut tx, timeout, cancel);
            io.unread(&replay);
            if replay_has_zrinit(&replay) {
                // the remote is the receiver, this side sends
                self.session.run_detected_send(&mut io)
            } else {
                // a symmetric peer opened some other way: take the
                // receiver role and let the engine sort it out
                self.session.receive_files_io(&mut io, 0).map(|_| ())
            }
        };
        if let Err(e) = result {
            log::error!("zmodem session ended with: {e}");
        }
        self.session.reset();
        self.tail.clear();
        self.transferring.store(false, Ordering::SeqCst);
        log::info!("returning to terminal passthrough");
    }
}

impl<R: ComReader, W: Write> Read for TerminalIo<R, W> {
    fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        if out.is_empty() {
            return Ok(0);
        }
        loop {
            if let Some(replay) = self.pending.take() {
                self.run_session(replay);
            }
            let n = match self.rx.read_timeout(out, PASSTHROUGH_POLL) {
                Ok(0) => return Ok(0),
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::TimedOut => continue,
                Err(e) => return Err(e),
            };
            let mut scan = Vec::with_capacity(self.tail.len() + n);
            scan.extend_from_slice(&self.tail);
            scan.extend_from_slice(&out[..n]);
            match find_signature(&scan) {
                Some(m) => {
                    let replay = normalize_replay(&scan[m..]);
                    let delivered = self.tail.len();
                    self.tail.clear();
                    if m > delivered {
                        // hand the clean prefix to the terminal first, the
                        // session runs on the next call
                        let keep = m - delivered;
                        self.pending = Some(replay);
                        return Ok(keep);
                    }
                    self.run_session(replay);
                }
                None => {
                    let from = scan.len().saturating_sub(SCAN_TAIL);
                    self.tail.clear();
                    self.tail.extend_from_slice(&scan[from..]);
                    return Ok(n);
                }
            }
        }
    }
}

/// Shared write half handed to the keystroke forwarder and to the session.
pub struct TerminalWriter<W: Write> {
    tx: Arc<Mutex<W>>,
}

impl<W: Write> Clone for TerminalWriter<W> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

impl<W: Write> Write for TerminalWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.lock()?.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.lock()?.flush()
    }
}

impl<W: Write> TerminalWriter<W> {
    fn lock(&self) -> io::Result<std::sync::MutexGuard<'_, W>> {
        self.tx
            .lock()
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "terminal writer poisoned"))
    }
}

/// Find the start of a ZRINIT hex header. Only ZRINIT (type 01) arms the
/// engine; a stray mid-session frame such as ZFIN must not hijack the
/// terminal.
fn find_signature(buf: &[u8]) -> Option<usize> {
    for i in 0..buf.len() {
        if buf[i] != ZPAD {
            continue;
        }
        let rest = &buf[i..];
        if rest.len() >= 6
            && rest[1] == ZPAD
            && rest[2] == ZDLE
            && rest[3] == ZHEX
            && rest[4] == b'0'
            && rest[5] == b'1'
        {
            return Some(i);
        }
        // some implementations drop the ZDLE from the opening frame
        if rest.len() >= 5 && rest[1] == ZPAD && rest[2] == ZHEX && rest[3] == b'0' && rest[4] == b'1'
        {
            return Some(i);
        }
    }
    None
}

/// The engine's header scanner expects the canonical `** ZDLE ZHEX` form;
/// reinsert the ZDLE if the peer omitted it.
fn normalize_replay(replay: &[u8]) -> Vec<u8> {
    if replay.len() >= 3 && replay[2] == ZHEX {
        let mut out = Vec::with_capacity(replay.len() + 1);
        out.extend_from_slice(&[ZPAD, ZPAD, ZDLE]);
        out.extend_from_slice(&replay[2..]);
        return out;
    }
    replay.to_vec()
}

fn replay_has_zrinit(replay: &[u8]) -> bool {
    find_signature(replay).is_some()
}
