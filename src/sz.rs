use std::io::{Read, Seek, SeekFrom};
use std::time::Duration;

use crate::callbacks::FileSource;
use crate::com::ZReadline;
use crate::constants::frame_types::*;
use crate::constants::{zfile_flag, zrinit_flag, zsinit_flag, ZCRCE, ZCRCG, ZCRCQ, ZCRCW};
use crate::crc::{finalize_crc32, update_crc32};
use crate::err::{TransferResult, TransmissionError};
use crate::escape::Escaper;
use crate::fileinfo::FileDetails;
use crate::header::{Header, HeaderEvent, HeaderType};
use crate::session::Config;
use crate::subpacket::encode_subpacket;

/// Streaming subpackets tolerated without any acknowledgement before a
/// liveness ZCRCQ is forced.
const UNACKED_BLOCK_LIMIT: usize = 64;
/// Deadline for the pipelined ZCRCQ acknowledgement probe.
const ACK_PROBE_DEADLINE: Duration = Duration::from_millis(200);

/// The sending state machine (the `sz` side of the protocol).
pub struct Sz {
    use_crc32: bool,
    escape_ctrl: bool,
    turbo_escape: bool,
    window: u32,
    wspac: u32,
    block_size: usize,
    max_block_size: usize,
    znulls: usize,
    attn: Vec<u8>,
    rx_flags: u8,
    rx_flags2: u8,
    rx_buf_len: usize,
    zrqinits_sent: usize,
    escaper: Escaper,
    /// Latched once the ZRQINIT/ZRINIT/ZSINIT handshake has run, so a batch
    /// does not renegotiate per file.
    pub(crate) initialized: bool,
}

impl Sz {
    pub fn new(config: &Config) -> Self {
        Self {
            use_crc32: config.use_crc32,
            escape_ctrl: config.escape_control,
            turbo_escape: config.turbo_escape,
            window: config.window_size,
            wspac: config.window_size,
            block_size: config.block_size.max(32),
            max_block_size: config.max_block_size.max(config.block_size),
            znulls: config.znulls,
            attn: config.attention.clone(),
            rx_flags: 0,
            rx_flags2: 0,
            rx_buf_len: 0,
            zrqinits_sent: 0,
            escaper: Escaper::new(config.escape_control, config.turbo_escape),
            initialized: false,
        }
    }

    fn bin_type(&self) -> HeaderType {
        if self.use_crc32 {
            HeaderType::Bin32
        } else {
            HeaderType::Bin
        }
    }

    fn send_header(&mut self, io: &mut ZReadline<'_>, header: Header) -> TransferResult<()> {
        log::debug!("sz: send {header}");
        let bytes = header.build(&mut self.escaper);
        io.write(&bytes)?;
        io.flush()?;
        Ok(())
    }

    fn send_hex(&mut self, io: &mut ZReadline<'_>, frame_type: u8, number: u32) -> TransferResult<()> {
        self.send_header(io, Header::from_number(HeaderType::Hex, frame_type, number))
    }

    /// A ZDATA header carrying `pos`, preceded by the configured run of
    /// NUL preamble bytes.
    fn send_zdata(&mut self, io: &mut ZReadline<'_>, pos: u32) -> TransferResult<()> {
        if self.znulls > 0 {
            let mut nulls = Vec::with_capacity(self.znulls * 2);
            for _ in 0..self.znulls {
                self.escaper.push(&mut nulls, 0);
            }
            io.write(&nulls)?;
        }
        self.send_header(io, Header::from_number(self.bin_type(), ZDATA, pos))
    }

    /// Run the ZRQINIT/ZRINIT/ZSINIT handshake.
    ///
    /// The first transmission is suppressed: the remote opened the session
    /// with its own signal and usually speaks first.
    pub fn get_receiver_init(&mut self, io: &mut ZReadline<'_>) -> TransferResult<()> {
        if self.initialized {
            return Ok(());
        }
        let mut hold_fire = true;
        for attempt in 0..10 {
            if !hold_fire && self.zrqinits_sent < 4 {
                self.zrqinits_sent += 1;
                self.send_hex(io, ZRQINIT, 0)?;
            }
            hold_fire = false;
            match Header::read(io)? {
                HeaderEvent::Timeout => {
                    if attempt == 0 {
                        continue;
                    }
                    return Err(TransmissionError::Timeout("waiting for ZRINIT".into()));
                }
                HeaderEvent::Cancelled => return Err(TransmissionError::Cancelled),
                HeaderEvent::CrcError => {
                    self.send_hex(io, ZNAK, 0)?;
                }
                HeaderEvent::Frame(h) => {
                    log::debug!("sz: init got {h}");
                    match h.frame_type {
                        ZCHALLENGE => {
                            // echo the challenge value back
                            self.send_hex(io, ZACK, h.number())?;
                        }
                        ZCOMMAND => {
                            // receiver missed our request, it will retry
                        }
                        ZRQINIT => {
                            // both ends believe they are senders
                            self.send_hex(io, ZNAK, 0)?;
                        }
                        ZCAN => return Err(TransmissionError::Cancelled),
                        ZRINIT => {
                            self.parse_zrinit(&h);
                            self.send_zsinit(io)?;
                            self.initialized = true;
                            return Ok(());
                        }
                        _ => {
                            self.send_hex(io, ZNAK, 0)?;
                        }
                    }
                }
            }
        }
        Err(TransmissionError::Timeout(
            "no ZRINIT within the retry budget".into(),
        ))
    }

    /// Absorb the receiver's capabilities from its ZRINIT.
    pub(crate) fn parse_zrinit(&mut self, header: &Header) {
        self.rx_flags = header.f0();
        self.rx_flags2 = header.f1();
        self.use_crc32 = self.use_crc32 && self.rx_flags & zrinit_flag::CANFC32 != 0;

        let escape_ctrl = self.escape_ctrl || self.rx_flags & zrinit_flag::ESCCTL != 0;
        if escape_ctrl && !self.escape_ctrl {
            self.escape_ctrl = true;
            self.escaper = Escaper::new(true, self.turbo_escape);
        }

        let buf_len = usize::from(header.data[0]) | usize::from(header.data[1]) << 8;
        self.rx_buf_len = if buf_len == 0 {
            1024
        } else {
            buf_len.clamp(32, self.max_block_size)
        };
        self.block_size = self.block_size.min(self.rx_buf_len);

        // pipelining only makes sense against a full-duplex receiver;
        // spacing is the whole window, the transport is not a serial line
        self.window = if self.rx_flags & zrinit_flag::CANFDX != 0 {
            self.window
        } else {
            0
        };
        self.wspac = self.window;

        log::info!(
            "sz: receiver caps x{:02X}/x{:02X}, buffer {}, block {}, crc32 {}, escape {}",
            self.rx_flags,
            self.rx_flags2,
            self.rx_buf_len,
            self.block_size,
            self.use_crc32,
            self.escape_ctrl
        );
    }

    /// Send the attention string (and the escape-control request) if either
    /// is called for; otherwise the frame is skipped entirely.
    pub(crate) fn send_zsinit(&mut self, io: &mut ZReadline<'_>) -> TransferResult<()> {
        if self.attn.is_empty() && (!self.escape_ctrl || self.rx_flags & zsinit_flag::TESCCTL != 0)
        {
            return Ok(());
        }
        let mut attn = self.attn.clone();
        if attn.last() != Some(&0) {
            attn.push(0);
        }
        let mut errors = 0;
        loop {
            if self.escape_ctrl {
                let header =
                    Header::from_flags(HeaderType::Hex, ZSINIT, 0, 0, 0, zsinit_flag::TESCCTL);
                self.send_header(io, header)?;
            } else {
                self.send_header(io, Header::empty(self.bin_type(), ZSINIT))?;
            }
            let pck = encode_subpacket(&mut self.escaper, ZCRCW, &attn, self.use_crc32);
            io.write(&pck)?;
            io.flush()?;

            match Header::read(io)? {
                HeaderEvent::Cancelled => return Err(TransmissionError::Cancelled),
                HeaderEvent::Frame(h) if h.frame_type == ZACK => return Ok(()),
                HeaderEvent::Frame(h) if h.frame_type == ZCAN => {
                    return Err(TransmissionError::Cancelled)
                }
                _ => {
                    errors += 1;
                    if errors > 19 {
                        return Err(TransmissionError::Protocol(
                            "too many errors sending ZSINIT".into(),
                        ));
                    }
                }
            }
        }
    }

    /// Offer one file and, once the receiver answers with ZRPOS, stream it.
    /// Returns the final byte count.
    pub fn send_file(
        &mut self,
        io: &mut ZReadline<'_>,
        source: &mut dyn FileSource,
        details: &FileDetails,
        progress: &mut dyn FnMut(u64),
    ) -> TransferResult<u64> {
        let flags = Header::from_flags(
            self.bin_type(),
            ZFILE,
            0,
            0,
            zfile_flag::ZMCLOB,
            zfile_flag::ZCBIN,
        );
        let info = details.encode();
        let mut errors = 0;
        'offer: loop {
            self.send_header(io, flags.clone())?;
            let pck = encode_subpacket(&mut self.escaper, ZCRCW, &info, self.use_crc32);
            io.write(&pck)?;
            io.flush()?;

            // the receiver re-announces itself between files; a stray
            // ZRINIT or two is normal chatter, a run of them means the
            // offer was lost
            let mut zrinit_run = 0;
            loop {
                match Header::read(io)? {
                    HeaderEvent::Cancelled => return Err(TransmissionError::Cancelled),
                    HeaderEvent::Timeout | HeaderEvent::CrcError => {
                        errors += 1;
                        if errors > 10 {
                            return Err(TransmissionError::Timeout(
                                "no answer to the file offer".into(),
                            ));
                        }
                        continue 'offer;
                    }
                    HeaderEvent::Frame(h) => {
                        log::debug!("sz: file offer got {h}");
                        match h.frame_type {
                            ZRINIT => {
                                zrinit_run += 1;
                                if zrinit_run >= 2 {
                                    continue 'offer;
                                }
                            }
                            ZRQINIT => {
                                return Err(TransmissionError::Protocol(
                                    "remote end is also a sender".into(),
                                ))
                            }
                            ZCAN | ZABORT | ZFIN => return Err(TransmissionError::Cancelled),
                            ZSKIP => return Err(TransmissionError::FileSkipped),
                            ZCRC => {
                                let crc = file_crc32(source)?;
                                self.send_header(
                                    io,
                                    Header::from_number(self.bin_type(), ZCRC, crc),
                                )?;
                            }
                            ZRPOS => {
                                return self.send_file_data(io, source, h.number(), progress);
                            }
                            _ => {
                                errors += 1;
                                if errors > 10 {
                                    return Err(TransmissionError::Protocol(format!(
                                        "unexpected answer to the file offer: {h}"
                                    )));
                                }
                                continue 'offer;
                            }
                        }
                    }
                }
            }
        }
    }

    /// Stream file data from `start` until EOF, then run the ZEOF exchange.
    fn send_file_data(
        &mut self,
        io: &mut ZReadline<'_>,
        source: &mut dyn FileSource,
        mut start: u32,
        progress: &mut dyn FnMut(u64),
    ) -> TransferResult<u64> {
        'restart: loop {
            source.seek(SeekFrom::Start(u64::from(start)))?;
            let mut bytes_sent = u64::from(start);
            let mut last_acked = i64::from(start) - 1;
            let mut junk = 0usize;
            let mut window_bytes = 0u64;
            let mut unacked_blocks = 0usize;
            let mut buf = vec![0u8; self.block_size];
            self.send_zdata(io, start)?;

            loop {
                if io.is_cancelled() {
                    return Err(TransmissionError::Cancelled);
                }
                let n = read_block(source, &mut buf)?;
                let at_eof = n < buf.len();
                let terminator = if at_eof {
                    ZCRCE
                } else if junk > 3 {
                    ZCRCW
                } else if bytes_sent as i64 == last_acked {
                    ZCRCW
                } else if self.window > 0 && window_bytes + n as u64 >= u64::from(self.wspac) {
                    window_bytes = 0;
                    ZCRCQ
                } else if unacked_blocks >= UNACKED_BLOCK_LIMIT {
                    ZCRCQ
                } else {
                    ZCRCG
                };

                let pck = encode_subpacket(&mut self.escaper, terminator, &buf[..n], self.use_crc32);
                io.write(&pck)?;
                io.flush()?;
                bytes_sent += n as u64;
                window_bytes += n as u64;
                unacked_blocks += 1;
                progress(bytes_sent);

                if terminator == ZCRCW {
                    // the frame is closed: collect the ack, then reopen
                    match Header::read(io)? {
                        HeaderEvent::Cancelled => return Err(TransmissionError::Cancelled),
                        HeaderEvent::Frame(h) => match h.frame_type {
                            ZACK => {
                                last_acked = i64::from(h.number());
                                junk = 0;
                                unacked_blocks = 0;
                            }
                            ZRPOS => {
                                log::debug!("sz: rewind to {}", h.number());
                                start = h.number();
                                continue 'restart;
                            }
                            ZSKIP => return Err(TransmissionError::FileSkipped),
                            ZCAN | ZABORT => return Err(TransmissionError::Cancelled),
                            _ => {
                                junk += 1;
                                if junk > 10 {
                                    return Err(TransmissionError::Protocol(format!(
                                        "unexpected answer to ZCRCW: {h}"
                                    )));
                                }
                            }
                        },
                        HeaderEvent::Timeout | HeaderEvent::CrcError => {
                            junk += 1;
                            if junk > 10 {
                                return Err(TransmissionError::Timeout(
                                    "no acknowledgement after ZCRCW".into(),
                                ));
                            }
                        }
                    }
                    self.send_zdata(io, bytes_sent as u32)?;
                } else if terminator == ZCRCQ {
                    match Header::read_deadline(io, ACK_PROBE_DEADLINE)? {
                        HeaderEvent::Timeout => {
                            // the pipelined ack simply has not arrived yet
                        }
                        HeaderEvent::Cancelled => return Err(TransmissionError::Cancelled),
                        HeaderEvent::CrcError => {
                            junk += 1;
                            if junk > 5 {
                                return Err(TransmissionError::Crc(
                                    "too many bad frames in the ack stream".into(),
                                ));
                            }
                        }
                        HeaderEvent::Frame(h) => match h.frame_type {
                            ZACK => {
                                last_acked = i64::from(h.number());
                                junk = 0;
                                unacked_blocks = 0;
                            }
                            ZRPOS => {
                                start = h.number();
                                continue 'restart;
                            }
                            ZSKIP => return Err(TransmissionError::FileSkipped),
                            ZCAN | ZABORT => return Err(TransmissionError::Cancelled),
                            _ => {
                                junk += 1;
                                if junk > 5 {
                                    return Err(TransmissionError::Protocol(format!(
                                        "unexpected answer to ZCRCQ: {h}"
                                    )));
                                }
                            }
                        },
                    }
                }

                // never run more than a window ahead of the last ack
                if self.window > 0 && bytes_sent as i64 - last_acked >= i64::from(self.window) {
                    let mut tries = 0;
                    loop {
                        match Header::read(io)? {
                            HeaderEvent::Cancelled => return Err(TransmissionError::Cancelled),
                            HeaderEvent::Frame(h) => match h.frame_type {
                                ZACK => {
                                    last_acked = i64::from(h.number());
                                    break;
                                }
                                ZRPOS => {
                                    start = h.number();
                                    continue 'restart;
                                }
                                ZSKIP => return Err(TransmissionError::FileSkipped),
                                ZCAN | ZABORT => return Err(TransmissionError::Cancelled),
                                _ => {
                                    tries += 1;
                                    if tries > 3 {
                                        return Err(TransmissionError::Protocol(
                                            "window full and no ZACK".into(),
                                        ));
                                    }
                                }
                            },
                            HeaderEvent::Timeout | HeaderEvent::CrcError => {
                                tries += 1;
                                if tries > 3 {
                                    return Err(TransmissionError::Timeout(
                                        "window full and no ZACK".into(),
                                    ));
                                }
                            }
                        }
                    }
                }

                if at_eof {
                    break;
                }
            }

            // ZEOF exchange
            let mut errors = 0;
            loop {
                self.send_header(
                    io,
                    Header::from_number(self.bin_type(), ZEOF, bytes_sent as u32),
                )?;
                match Header::read(io)? {
                    HeaderEvent::Cancelled => return Err(TransmissionError::Cancelled),
                    HeaderEvent::Frame(h) => match h.frame_type {
                        // a stale pipelined ack carries an older position;
                        // only the final count ends the file
                        ZACK if u64::from(h.number()) == bytes_sent => return Ok(bytes_sent),
                        ZACK => {}
                        ZRINIT => return Ok(bytes_sent),
                        ZRPOS => {
                            start = h.number();
                            continue 'restart;
                        }
                        ZSKIP => return Err(TransmissionError::FileSkipped),
                        ZCAN | ZABORT => return Err(TransmissionError::Cancelled),
                        _ => {
                            errors += 1;
                            if errors > 10 {
                                return Err(TransmissionError::Protocol(format!(
                                    "unexpected answer to ZEOF: {h}"
                                )));
                            }
                        }
                    },
                    HeaderEvent::Timeout | HeaderEvent::CrcError => {
                        errors += 1;
                        if errors > 10 {
                            return Err(TransmissionError::Timeout(
                                "no acknowledgement of ZEOF".into(),
                            ));
                        }
                    }
                }
            }
        }
    }

    /// Close the session: ZFIN, wait for the peer's ZFIN, write the "OO"
    /// over-and-out. Best effort, a silent peer does not fail the batch.
    pub fn finish(&mut self, io: &mut ZReadline<'_>) -> TransferResult<()> {
        for _ in 0..3 {
            self.send_hex(io, ZFIN, 0)?;
            match Header::read(io)? {
                HeaderEvent::Frame(h) if h.frame_type == ZFIN => {
                    io.write(b"OO")?;
                    io.flush()?;
                    return Ok(());
                }
                HeaderEvent::Cancelled => return Ok(()),
                HeaderEvent::Frame(h) if h.frame_type == ZCAN => return Ok(()),
                _ => continue,
            }
        }
        Ok(())
    }
}

fn read_block(source: &mut dyn FileSource, buf: &mut [u8]) -> TransferResult<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = source.read(&mut buf[filled..])?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

/// CRC-32 of the whole file, for answering a ZCRC request. The read
/// position is restored afterwards.
fn file_crc32(source: &mut dyn FileSource) -> TransferResult<u32> {
    let saved = source.stream_position()?;
    source.seek(SeekFrom::Start(0))?;
    let mut crc = 0xFFFF_FFFFu32;
    let mut buf = [0u8; 8192];
    loop {
        let n = source.read(&mut buf)?;
        if n == 0 {
            break;
        }
        for b in &buf[..n] {
            crc = update_crc32(crc, *b);
        }
    }
    source.seek(SeekFrom::Start(saved))?;
    Ok(finalize_crc32(crc))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::frame_types::ZRINIT;

    fn sz_with_window(window: u32) -> Sz {
        let config = Config {
            window_size: window,
            ..Config::default()
        };
        Sz::new(&config)
    }

    fn zrinit(f0: u8) -> Header {
        Header::from_flags(HeaderType::Hex, ZRINIT, 0, 0, 0, f0)
    }

    #[test]
    fn zero_buffer_length_defaults_to_1024() {
        let mut sz = sz_with_window(0);
        sz.parse_zrinit(&zrinit(zrinit_flag::CANFC32));
        assert_eq!(sz.rx_buf_len, 1024);
        // the 2 KiB default block shrinks to fit
        assert_eq!(sz.block_size, 1024);
    }

    #[test]
    fn tiny_advertised_buffers_are_clamped_up() {
        let mut sz = sz_with_window(0);
        let mut header = zrinit(zrinit_flag::CANFC32);
        header.data[0] = 8;
        sz.parse_zrinit(&header);
        assert_eq!(sz.rx_buf_len, 32);
        assert_eq!(sz.block_size, 32);
    }

    #[test]
    fn window_requires_full_duplex() {
        let mut sz = sz_with_window(4096);
        sz.parse_zrinit(&zrinit(zrinit_flag::CANFC32));
        assert_eq!(sz.window, 0);

        let mut sz = sz_with_window(4096);
        sz.parse_zrinit(&zrinit(zrinit_flag::CANFC32 | zrinit_flag::CANFDX));
        assert_eq!(sz.window, 4096);
        assert_eq!(sz.wspac, 4096);
    }

    #[test]
    fn crc32_needs_agreement_from_both_sides() {
        let mut sz = sz_with_window(0);
        sz.parse_zrinit(&zrinit(0));
        assert!(!sz.use_crc32);
        assert_eq!(sz.bin_type(), HeaderType::Bin);
    }

    #[test]
    fn peer_requested_escaping_rebuilds_the_encoder() {
        let mut sz = sz_with_window(0);
        assert!(!sz.escape_ctrl);
        sz.parse_zrinit(&zrinit(zrinit_flag::CANFC32 | zrinit_flag::ESCCTL));
        assert!(sz.escape_ctrl);
    }
}
