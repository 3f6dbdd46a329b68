use std::io::Write;
use std::thread;
use std::time::Duration;

use crate::callbacks::FileSink;
use crate::com::ZReadline;
use crate::constants::frame_types::*;
use crate::constants::{zfile_flag, zrinit_flag, zsinit_flag, ZATTNLEN, ZCRCE, ZCRCG, ZCRCQ, ZCRCW};
use crate::err::{TransferResult, TransmissionError};
use crate::escape::Escaper;
use crate::header::{Header, HeaderEvent, HeaderType};
use crate::session::Config;
use crate::subpacket::{read_subpacket, SubpacketEvent};

/// What the wait-for-file loop produced.
#[derive(Debug)]
pub enum RzEvent {
    /// Raw ZFILE metadata payload, ready for [`crate::FileDetails::parse`].
    FileOffer(Vec<u8>),
    /// The sender closed the batch with ZFIN.
    SessionEnd,
}

/// The receiving state machine (the `rz` side of the protocol).
pub struct Rz {
    use_crc32: bool,
    escape_ctrl: bool,
    buffer_size: usize,
    /// Resync sequence announced by the sender in ZSINIT; empty until then.
    attn: Vec<u8>,
    zconv: u8,
    zmanag: u8,
    ztrans: u8,
    skip_if_absent: bool,
    zrqinits_seen: usize,
    escaper: Escaper,
}

impl Rz {
    pub fn new(config: &Config) -> Self {
        Self {
            use_crc32: config.use_crc32,
            escape_ctrl: config.escape_control,
            buffer_size: config.max_block_size.max(1024),
            attn: Vec::new(),
            zconv: 0,
            zmanag: 0,
            ztrans: 0,
            skip_if_absent: false,
            zrqinits_seen: 0,
            escaper: Escaper::new(config.escape_control, config.turbo_escape),
        }
    }

    fn send_hex(&mut self, io: &mut ZReadline<'_>, frame_type: u8, number: u32) -> TransferResult<()> {
        let header = Header::from_number(HeaderType::Hex, frame_type, number);
        log::debug!("rz: send {header}");
        let bytes = header.build(&mut self.escaper);
        io.write(&bytes)?;
        io.flush()?;
        Ok(())
    }

    pub(crate) fn send_zrinit(&mut self, io: &mut ZReadline<'_>) -> TransferResult<()> {
        let mut f0 = zrinit_flag::CANFC32 | zrinit_flag::CANFDX | zrinit_flag::CANOVIO;
        if self.escape_ctrl {
            f0 |= zrinit_flag::ESCCTL;
        }
        // P0/P1 carry zero: no buffer-length cap, the sender streams freely
        let header = Header::from_flags(HeaderType::Hex, ZRINIT, 0, 0, 0, f0);
        log::debug!("rz: send {header}");
        let bytes = header.build(&mut self.escaper);
        io.write(&bytes)?;
        io.flush()?;
        Ok(())
    }

    pub(crate) fn send_skip(&mut self, io: &mut ZReadline<'_>) -> TransferResult<()> {
        self.send_hex(io, ZSKIP, 0)
    }

    /// Track the frame-check width the sender actually uses: whatever its
    /// last binary header announced.
    fn note_header_type(&mut self, header: &Header) {
        if header.header_type != HeaderType::Hex {
            self.use_crc32 = header.header_type == HeaderType::Bin32;
        }
    }

    /// Announce readiness and wait for a file offer.
    ///
    /// Handles the whole session-setup traffic: ZRQINIT retries, ZSINIT,
    /// ZFREECNT, ZCHALLENGE echoes from confused peers, and the ZCOMMAND
    /// refusal mandated by policy. The ZRINIT announcement is repeated on
    /// timeouts and garbled frames, not after ordinary setup frames.
    pub fn wait_for_zfile(&mut self, io: &mut ZReadline<'_>) -> TransferResult<RzEvent> {
        let mut errors = 0;
        let mut attempts = 0;
        'announce: while attempts < 15 && self.zrqinits_seen < 10 {
            attempts += 1;
            self.send_zrinit(io)?;
            loop {
                let event = match Header::read(io) {
                    Ok(event) => event,
                    // framing noise and garbage floods are retryable here,
                    // the sender may still be flushing a previous file
                    Err(e @ TransmissionError::InvalidFrame(_))
                    | Err(e @ TransmissionError::Protocol(_)) => {
                        log::warn!("rz: bad frame while waiting for ZFILE: {e}");
                        io.purge_line();
                        errors += 1;
                        if errors > 20 {
                            return Err(e);
                        }
                        continue 'announce;
                    }
                    Err(e) => return Err(e),
                };
                match event {
                    HeaderEvent::Timeout => continue 'announce,
                    HeaderEvent::Cancelled => return Err(TransmissionError::Cancelled),
                    HeaderEvent::CrcError => {
                        errors += 1;
                        if errors > 20 {
                            return Err(TransmissionError::Crc(
                                "too many bad headers while waiting for ZFILE".into(),
                            ));
                        }
                        continue 'announce;
                    }
                    HeaderEvent::Frame(h) => {
                        log::debug!("rz: got {h}");
                        self.note_header_type(&h);
                        match h.frame_type {
                            ZRQINIT => {
                                self.zrqinits_seen += 1;
                                continue 'announce;
                            }
                            ZEOF | ZCOMPL => {
                                // stale traffic from the previous file
                                continue;
                            }
                            ZCHALLENGE => {
                                self.send_hex(io, ZACK, h.number())?;
                                continue;
                            }
                            ZFILE => {
                                self.zconv = h.f0();
                                if self.zconv == 0 {
                                    self.zconv = zfile_flag::ZCBIN;
                                }
                                let mut f1 = h.f1();
                                self.skip_if_absent = f1 & zfile_flag::ZMSKNOLOC != 0;
                                f1 &= !zfile_flag::ZMSKNOLOC;
                                self.zmanag = f1;
                                self.ztrans = h.f2();
                                log::debug!(
                                    "rz: zconv=x{:02X} zmanag=x{:02X} ztrans=x{:02X} skip-if-absent={}",
                                    self.zconv,
                                    self.zmanag,
                                    self.ztrans,
                                    self.skip_if_absent
                                );

                                let mut buf = vec![0u8; self.buffer_size];
                                match read_subpacket(io, &mut buf, self.use_crc32) {
                                    Ok(SubpacketEvent::Data {
                                        len,
                                        terminator: ZCRCW,
                                    }) => {
                                        buf.truncate(len);
                                        return Ok(RzEvent::FileOffer(buf));
                                    }
                                    Ok(SubpacketEvent::Cancelled) => {
                                        return Err(TransmissionError::Cancelled)
                                    }
                                    Ok(_) => {
                                        self.send_hex(io, ZNAK, 0)?;
                                        errors += 1;
                                        if errors > 20 {
                                            return Err(TransmissionError::Protocol(
                                                "file offer never arrived intact".into(),
                                            ));
                                        }
                                        continue 'announce;
                                    }
                                    Err(TransmissionError::Cancelled) => {
                                        return Err(TransmissionError::Cancelled)
                                    }
                                    Err(e) => {
                                        log::warn!("rz: bad ZFILE subpacket: {e}");
                                        io.purge_line();
                                        self.send_hex(io, ZNAK, 0)?;
                                        errors += 1;
                                        if errors > 20 {
                                            return Err(e);
                                        }
                                        continue 'announce;
                                    }
                                }
                            }
                            ZSINIT => {
                                self.escape_ctrl =
                                    self.escape_ctrl || h.f0() & zsinit_flag::TESCCTL != 0;
                                let mut buf = vec![0u8; ZATTNLEN + 1];
                                match read_subpacket(io, &mut buf, self.use_crc32) {
                                    Ok(SubpacketEvent::Data {
                                        len,
                                        terminator: ZCRCW,
                                    }) => {
                                        buf.truncate(len);
                                        self.attn = buf;
                                        self.send_hex(io, ZACK, 1)?;
                                        continue;
                                    }
                                    Ok(SubpacketEvent::Cancelled) => {
                                        return Err(TransmissionError::Cancelled)
                                    }
                                    _ => {
                                        self.send_hex(io, ZNAK, 0)?;
                                        continue 'announce;
                                    }
                                }
                            }
                            ZFREECNT => {
                                // plenty of space; the exact figure is
                                // nobody's business
                                self.send_hex(io, ZACK, 1 << 30)?;
                                continue;
                            }
                            ZCOMMAND => {
                                return self.refuse_command(io);
                            }
                            ZFIN => {
                                self.send_hex(io, ZFIN, 0)?;
                                drain_over_and_out(io);
                                return Ok(RzEvent::SessionEnd);
                            }
                            ZRINIT => {
                                return Err(TransmissionError::Protocol(
                                    "remote end is also a receiver".into(),
                                ))
                            }
                            ZCAN => return Err(TransmissionError::Cancelled),
                            _ => {
                                errors += 1;
                                if errors > 20 {
                                    return Err(TransmissionError::Protocol(format!(
                                        "unexpected frame while waiting for ZFILE: {h}"
                                    )));
                                }
                                continue 'announce;
                            }
                        }
                    }
                }
            }
        }
        Err(TransmissionError::Timeout(
            "no ZFILE within the retry budget".into(),
        ))
    }

    /// ZCOMMAND is refused unconditionally: acknowledge with ZCOMPL(0),
    /// ride out the session end, and surface the attempted command.
    fn refuse_command(&mut self, io: &mut ZReadline<'_>) -> TransferResult<RzEvent> {
        let mut buf = vec![0u8; self.buffer_size];
        let command = match read_subpacket(io, &mut buf, self.use_crc32) {
            Ok(SubpacketEvent::Data { len, .. }) => {
                let raw = &buf[..len];
                let end = raw.iter().position(|b| *b == 0).unwrap_or(raw.len());
                String::from_utf8_lossy(&raw[..end]).into_owned()
            }
            _ => String::new(),
        };
        log::warn!("rz: refusing remote command {command:?}");
        self.send_hex(io, ZCOMPL, 0)?;
        for _ in 0..20 {
            match Header::read(io) {
                Ok(HeaderEvent::Frame(h)) if h.frame_type == ZFIN => {
                    self.send_hex(io, ZFIN, 0)?;
                    drain_over_and_out(io);
                    break;
                }
                Ok(HeaderEvent::Cancelled) | Err(TransmissionError::Cancelled) => break,
                Ok(_) => continue,
                Err(_) => continue,
            }
        }
        Err(TransmissionError::CommandDenied(command))
    }

    /// Receive one file into `sink` after its offer was accepted.
    pub fn receive_file(
        &mut self,
        io: &mut ZReadline<'_>,
        sink: &mut dyn FileSink,
        progress: &mut dyn FnMut(u64),
    ) -> TransferResult<u64> {
        let mut bytes_received = 0u64;
        let mut errors = 0usize;
        let mut buf = vec![0u8; self.buffer_size];

        'resync: loop {
            if io.is_cancelled() {
                return Err(TransmissionError::Cancelled);
            }
            self.send_hex(io, ZRPOS, bytes_received as u32)?;

            'headers: loop {
                let event = match Header::read(io) {
                    Ok(event) => event,
                    Err(TransmissionError::InvalidFrame(reason))
                    | Err(TransmissionError::Protocol(reason)) => {
                        log::warn!("rz: resync after bad frame: {reason}");
                        errors += 1;
                        if errors > 20 {
                            return Err(TransmissionError::Protocol(reason));
                        }
                        io.purge_line();
                        self.send_attn(io)?;
                        continue 'resync;
                    }
                    Err(e) => return Err(e),
                };
                match event {
                    HeaderEvent::Timeout => {
                        errors += 1;
                        if errors > 20 {
                            return Err(TransmissionError::Timeout(
                                "no data from the sender".into(),
                            ));
                        }
                        continue 'resync;
                    }
                    HeaderEvent::Cancelled => return Err(TransmissionError::Cancelled),
                    HeaderEvent::CrcError => {
                        errors += 1;
                        if errors > 20 {
                            return Err(TransmissionError::Crc("too many bad headers".into()));
                        }
                        io.purge_line();
                        self.send_attn(io)?;
                        continue 'resync;
                    }
                    HeaderEvent::Frame(h) => {
                        log::debug!("rz: data loop got {h}");
                        self.note_header_type(&h);
                        match h.frame_type {
                            ZDATA => {
                                if u64::from(h.number()) != bytes_received {
                                    log::debug!(
                                        "rz: ZDATA at {} but we are at {}",
                                        h.number(),
                                        bytes_received
                                    );
                                    errors += 1;
                                    if errors > 20 {
                                        return Err(TransmissionError::Protocol(
                                            "sender will not resync".into(),
                                        ));
                                    }
                                    io.purge_line();
                                    self.send_attn(io)?;
                                    continue 'resync;
                                }
                                // consume subpackets until the frame closes
                                loop {
                                    match read_subpacket(io, &mut buf, self.use_crc32) {
                                        Ok(SubpacketEvent::Data { len, terminator }) => {
                                            sink.write_all(&buf[..len])?;
                                            bytes_received += len as u64;
                                            errors = 0;
                                            progress(bytes_received);
                                            match terminator {
                                                ZCRCW => {
                                                    self.send_hex(
                                                        io,
                                                        ZACK | 0x80,
                                                        bytes_received as u32,
                                                    )?;
                                                    continue 'headers;
                                                }
                                                ZCRCQ => {
                                                    self.send_hex(
                                                        io,
                                                        ZACK,
                                                        bytes_received as u32,
                                                    )?;
                                                }
                                                ZCRCG => {}
                                                ZCRCE => continue 'headers,
                                                _ => unreachable!(),
                                            }
                                        }
                                        Ok(SubpacketEvent::Cancelled) => {
                                            return Err(TransmissionError::Cancelled)
                                        }
                                        Ok(SubpacketEvent::CrcError) => {
                                            errors += 1;
                                            if errors > 20 {
                                                return Err(TransmissionError::Crc(
                                                    "too many data errors".into(),
                                                ));
                                            }
                                            io.purge_line();
                                            self.send_attn(io)?;
                                            continue 'resync;
                                        }
                                        Err(TransmissionError::Cancelled) => {
                                            return Err(TransmissionError::Cancelled)
                                        }
                                        Err(e) => {
                                            log::warn!("rz: data subpacket error: {e}");
                                            errors += 1;
                                            if errors > 20 {
                                                return Err(e);
                                            }
                                            io.purge_line();
                                            self.send_attn(io)?;
                                            continue 'resync;
                                        }
                                    }
                                }
                            }
                            ZEOF => {
                                if u64::from(h.number()) != bytes_received {
                                    // an EOF for a position we rewound past
                                    log::debug!(
                                        "rz: stale ZEOF at {} (we are at {})",
                                        h.number(),
                                        bytes_received
                                    );
                                    continue 'resync;
                                }
                                self.send_hex(io, ZACK, bytes_received as u32)?;
                                return Ok(bytes_received);
                            }
                            ZFILE => {
                                // the sender re-offered the file; eat the
                                // metadata and ask for our position again
                                let _ = read_subpacket(io, &mut buf, self.use_crc32);
                                continue 'resync;
                            }
                            ZSKIP => return Err(TransmissionError::FileSkipped),
                            ZCAN | ZABORT => return Err(TransmissionError::Cancelled),
                            ZNAK => {
                                errors += 1;
                                if errors > 20 {
                                    return Err(TransmissionError::Protocol(
                                        "sender keeps NAKing".into(),
                                    ));
                                }
                                continue 'resync;
                            }
                            _ => {
                                errors += 1;
                                if errors > 20 {
                                    return Err(TransmissionError::Protocol(format!(
                                        "unexpected frame in the data loop: {h}"
                                    )));
                                }
                                continue 'resync;
                            }
                        }
                    }
                }
            }
        }
    }

    /// Replay the sender's attention sequence to interrupt its stream.
    /// A NUL ends the sequence, 0x8E is a one-second pause.
    fn send_attn(&mut self, io: &mut ZReadline<'_>) -> TransferResult<()> {
        if self.attn.is_empty() {
            return Ok(());
        }
        let mut out = Vec::with_capacity(self.attn.len());
        for &b in &self.attn {
            match b {
                0 => break,
                0x8E => {
                    io.write(&out)?;
                    io.flush()?;
                    out.clear();
                    thread::sleep(Duration::from_secs(1));
                }
                _ => out.push(b),
            }
        }
        io.write(&out)?;
        io.flush()?;
        Ok(())
    }
}

/// Best-effort consumption of the sender's trailing "OO" so it never leaks
/// into the terminal after the session.
fn drain_over_and_out(io: &mut ZReadline<'_>) {
    for _ in 0..2 {
        if io.read_byte_deadline(Duration::from_millis(500)).is_err() {
            break;
        }
    }
}
