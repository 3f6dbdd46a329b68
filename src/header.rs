use std::fmt::Display;
use std::io::{self, ErrorKind};

use crate::com::ZReadline;
use crate::constants::*;
use crate::crc::{
    finalize_crc16, finalize_crc32, update_crc16, update_crc32, CRC32_CHECK,
};
use crate::err::{TransferResult, TransmissionError};
use crate::escape::{zdlread, Escaper};

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum HeaderType {
    Bin,
    Bin32,
    Hex,
}

/// A received (or to-be-sent) frame header: the frame type plus four bytes
/// read either as flags F3..F0 or as a little-endian position.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct Header {
    pub header_type: HeaderType,
    pub frame_type: u8,
    pub data: [u8; 4],
}

/// Outcome of hunting for a header on the wire. Deadline expiry and CAN*5
/// come back as values so the state machines can branch on them; hard
/// failures (stream gone, garbage overflow) are errors.
#[derive(Debug)]
pub enum HeaderEvent {
    Frame(Header),
    Timeout,
    Cancelled,
    CrcError,
}

fn get_hex(n: u8) -> u8 {
    if n < 10 {
        b'0' + n
    } else {
        b'a' + (n - 10)
    }
}

fn from_hex(n: u8) -> TransferResult<u8> {
    match n {
        b'0'..=b'9' => Ok(n - b'0'),
        b'a'..=b'f' => Ok(10 + n - b'a'),
        b'A'..=b'F' => Ok(10 + n - b'A'),
        _ => Err(TransmissionError::InvalidFrame(format!(
            "hex digit expected, got 0x{n:02X}"
        ))),
    }
}

impl Header {
    pub fn empty(header_type: HeaderType, frame_type: u8) -> Self {
        Self {
            header_type,
            frame_type,
            data: [0, 0, 0, 0],
        }
    }

    pub fn from_flags(
        header_type: HeaderType,
        frame_type: u8,
        f3: u8,
        f2: u8,
        f1: u8,
        f0: u8,
    ) -> Self {
        Self {
            header_type,
            frame_type,
            data: [f3, f2, f1, f0],
        }
    }

    pub fn from_number(header_type: HeaderType, frame_type: u8, number: u32) -> Self {
        Self {
            header_type,
            frame_type,
            data: u32::to_le_bytes(number),
        }
    }

    pub fn f0(&self) -> u8 {
        self.data[3]
    }

    pub fn f1(&self) -> u8 {
        self.data[2]
    }

    pub fn f2(&self) -> u8 {
        self.data[1]
    }

    pub fn f3(&self) -> u8 {
        self.data[0]
    }

    pub fn number(&self) -> u32 {
        u32::from_le_bytes(self.data)
    }

    /// Encode for the wire. The escaper is used (and advanced) only by the
    /// binary formats; hex headers are self-escaping by construction.
    pub fn build(&self, escaper: &mut Escaper) -> Vec<u8> {
        let mut res = Vec::with_capacity(24);
        match self.header_type {
            HeaderType::Bin => {
                res.extend_from_slice(&[ZPAD, ZDLE, ZBIN]);
                let mut crc = 0u16;
                escaper.push(&mut res, self.frame_type);
                crc = update_crc16(crc, self.frame_type);
                for b in self.data {
                    escaper.push(&mut res, b);
                    crc = update_crc16(crc, b);
                }
                let crc = finalize_crc16(crc);
                escaper.push(&mut res, (crc >> 8) as u8);
                escaper.push(&mut res, crc as u8);
            }
            HeaderType::Bin32 => {
                res.extend_from_slice(&[ZPAD, ZDLE, ZBIN32]);
                let mut crc = 0xFFFF_FFFFu32;
                escaper.push(&mut res, self.frame_type);
                crc = update_crc32(crc, self.frame_type);
                for b in self.data {
                    escaper.push(&mut res, b);
                    crc = update_crc32(crc, b);
                }
                let crc = finalize_crc32(crc);
                for b in crc.to_le_bytes() {
                    escaper.push(&mut res, b);
                }
            }
            HeaderType::Hex => {
                let ft = self.frame_type & 0x7F;
                res.extend_from_slice(&[ZPAD, ZPAD, ZDLE, ZHEX]);
                res.push(get_hex(ft >> 4));
                res.push(get_hex(ft & 0xF));
                let mut crc = update_crc16(0, ft);
                for b in self.data {
                    res.push(get_hex(b >> 4));
                    res.push(get_hex(b & 0xF));
                    crc = update_crc16(crc, b);
                }
                let crc = finalize_crc16(crc);
                res.push(get_hex((crc >> 12) as u8 & 0xF));
                res.push(get_hex((crc >> 8) as u8 & 0xF));
                res.push(get_hex((crc >> 4) as u8 & 0xF));
                res.push(get_hex(crc as u8 & 0xF));
                res.push(b'\r');
                res.push(0x8A); // LF with the high bit set, uncorks old line disciplines
                if ft != frame_types::ZFIN && ft != frame_types::ZACK {
                    res.push(XON);
                }
            }
        }
        res
    }

    /// Hunt for the next header on the stream.
    pub fn read(io: &mut ZReadline<'_>) -> TransferResult<HeaderEvent> {
        let deadline = io.timeout();
        Self::read_deadline(io, deadline)
    }

    /// Same as [`Header::read`] with an explicit per-byte deadline, used
    /// for the short non-blocking ZCRCQ acknowledgement probe.
    pub fn read_deadline(
        io: &mut ZReadline<'_>,
        deadline: std::time::Duration,
    ) -> TransferResult<HeaderEvent> {
        let mut garbage = GARBAGE_BUDGET;
        let mut cancount = 0usize;
        loop {
            let c = match io.read_byte_deadline(deadline) {
                Ok(c) => c,
                Err(e) => return map_read_error(e),
            };
            if c == CAN {
                cancount += 1;
                if cancount >= 5 {
                    return Ok(HeaderEvent::Cancelled);
                }
                continue;
            }
            cancount = 0;
            if c != ZPAD && c != ZPAD | 0x80 {
                garbage = garbage.saturating_sub(1);
                if garbage == 0 {
                    return Err(TransmissionError::Protocol(
                        "garbage count exceeded while hunting for a frame".into(),
                    ));
                }
                continue;
            }
            // ZPAD seen: absorb further padding, then ZDLE and the format byte
            let mut next = match io.noxrd7() {
                Ok(c) => c,
                Err(e) => return map_read_error(e),
            };
            while next == ZPAD {
                next = match io.noxrd7() {
                    Ok(c) => c,
                    Err(e) => return map_read_error(e),
                };
            }
            if next != ZDLE {
                garbage = garbage.saturating_sub(1);
                if garbage == 0 {
                    return Err(TransmissionError::Protocol(
                        "garbage count exceeded while hunting for a frame".into(),
                    ));
                }
                continue;
            }
            // ZDLE seen, the next byte names the frame format
            let format = match io.noxrd7() {
                Ok(c) => c,
                Err(e) => return map_read_error(e),
            };
            match format {
                ZBIN => return Self::read_binary(io, false),
                ZBIN32 => return Self::read_binary(io, true),
                ZHEX => return Self::read_hex(io),
                CAN => {
                    // ZDLE itself was the first CAN of a possible run
                    let mut run = 2;
                    loop {
                        let c = match io.read_byte_deadline(deadline) {
                            Ok(c) => c,
                            Err(e) => return map_read_error(e),
                        };
                        if c != CAN {
                            break;
                        }
                        run += 1;
                        if run >= 5 {
                            return Ok(HeaderEvent::Cancelled);
                        }
                    }
                    garbage = garbage.saturating_sub(1);
                    if garbage == 0 {
                        return Err(TransmissionError::Protocol(
                            "garbage count exceeded while hunting for a frame".into(),
                        ));
                    }
                }
                _ => {
                    garbage = garbage.saturating_sub(1);
                    if garbage == 0 {
                        return Err(TransmissionError::Protocol(
                            "garbage count exceeded while hunting for a frame".into(),
                        ));
                    }
                }
            }
        }
    }

    fn read_binary(io: &mut ZReadline<'_>, use_crc32: bool) -> TransferResult<HeaderEvent> {
        let mut bytes = [0u8; 9];
        let count = if use_crc32 { 9 } else { 7 };
        for slot in bytes.iter_mut().take(count) {
            match zdlread(io) {
                Ok(GOTCAN) => return Ok(HeaderEvent::Cancelled),
                Ok(c) if c > 0xFF => {
                    return Err(TransmissionError::InvalidFrame(
                        "subpacket terminator inside a header".into(),
                    ))
                }
                Ok(c) => *slot = c as u8,
                Err(e) => return map_read_error(e),
            }
        }
        let ok = if use_crc32 {
            let reg = bytes[..9]
                .iter()
                .fold(0xFFFF_FFFF, |crc, b| update_crc32(crc, *b));
            reg == CRC32_CHECK
        } else {
            let reg = bytes[..7].iter().fold(0, |crc, b| update_crc16(crc, *b));
            reg == 0
        };
        if !ok {
            log::debug!("binary header failed its frame check");
            return Ok(HeaderEvent::CrcError);
        }
        Ok(HeaderEvent::Frame(Header {
            header_type: if use_crc32 {
                HeaderType::Bin32
            } else {
                HeaderType::Bin
            },
            frame_type: bytes[0],
            data: [bytes[1], bytes[2], bytes[3], bytes[4]],
        }))
    }

    fn read_hex(io: &mut ZReadline<'_>) -> TransferResult<HeaderEvent> {
        let mut digits = [0u8; 14];
        for d in digits.iter_mut() {
            *d = match io.read_byte() {
                Ok(c) => c,
                Err(e) => return map_read_error(e),
            };
        }
        let mut bytes = [0u8; 7];
        for (i, b) in bytes.iter_mut().enumerate() {
            *b = from_hex(digits[2 * i])? << 4 | from_hex(digits[2 * i + 1])?;
        }
        let reg = bytes.iter().fold(0, |crc, b| update_crc16(crc, *b));
        // Trailing CR/LF: consume best-effort, errors here don't matter
        if let Ok(b) = io.read_byte() {
            if b & 0x7F == b'\r' {
                let _ = io.read_byte();
            }
        }
        if reg != 0 {
            log::debug!("hex header failed its frame check");
            return Ok(HeaderEvent::CrcError);
        }
        Ok(HeaderEvent::Frame(Header {
            header_type: HeaderType::Hex,
            frame_type: bytes[0],
            data: [bytes[1], bytes[2], bytes[3], bytes[4]],
        }))
    }
}

fn map_read_error(e: io::Error) -> TransferResult<HeaderEvent> {
    match e.kind() {
        ErrorKind::TimedOut => Ok(HeaderEvent::Timeout),
        ErrorKind::Interrupted => Err(TransmissionError::Cancelled),
        ErrorKind::InvalidData => Err(TransmissionError::InvalidFrame(e.to_string())),
        _ => Err(TransmissionError::Io(e)),
    }
}

impl Display for Header {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.frame_type & 0x7F {
            frame_types::ZRPOS | frame_types::ZACK | frame_types::ZEOF | frame_types::ZDATA
            | frame_types::ZFREECNT => write!(
                f,
                "[{:?} {} pos={}]",
                self.header_type,
                frame_type_name(self.frame_type),
                self.number()
            ),
            frame_types::ZCRC | frame_types::ZCHALLENGE => write!(
                f,
                "[{:?} {} value=x{:08X}]",
                self.header_type,
                frame_type_name(self.frame_type),
                self.number()
            ),
            _ => write!(
                f,
                "[{:?} {} flags=x{:02X} x{:02X} x{:02X} x{:02X}]",
                self.header_type,
                frame_type_name(self.frame_type),
                self.f3(),
                self.f2(),
                self.f1(),
                self.f0()
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::com::test_com::TestChannel;
    use crate::com::CancelToken;
    use crate::constants::frame_types::*;
    use std::io::Write as _;
    use std::time::Duration;

    fn build(header: &Header) -> Vec<u8> {
        header.build(&mut Escaper::new(false, false))
    }

    #[test]
    fn hex_header_bytes() {
        assert_eq!(
            build(&Header::from_flags(HeaderType::Hex, ZRINIT, 0, 0, 0, 0x23)),
            b"**\x18B0100000023be50\r\x8a\x11".to_vec()
        );
        assert_eq!(
            build(&Header::empty(HeaderType::Hex, ZRPOS)),
            b"**\x18B0900000000a87c\r\x8a\x11".to_vec()
        );
        // ZFIN and ZACK do not get the trailing XON
        assert_eq!(
            build(&Header::from_number(HeaderType::Hex, ZFIN, 2)),
            b"**\x18B0802000000ef45\r\x8a".to_vec()
        );
        assert_eq!(
            build(&Header::empty(HeaderType::Hex, ZACK)),
            b"**\x18B0300000000eed2\r\x8a".to_vec()
        );
    }

    #[test]
    fn hex_header_masks_the_high_type_bit() {
        // ZACK with the marker bit is wire-identical to a plain ZACK
        assert_eq!(
            build(&Header::from_number(HeaderType::Hex, ZACK | 0x80, 5)),
            build(&Header::from_number(HeaderType::Hex, ZACK, 5))
        );
    }

    #[test]
    fn bin_header_bytes() {
        assert_eq!(
            build(&Header::empty(HeaderType::Bin, ZRQINIT)),
            vec![ZPAD, ZDLE, ZBIN, 0, 0, 0, 0, 0, 0, 0]
        );
        assert_eq!(
            build(&Header::from_flags(HeaderType::Bin, ZRQINIT, 1, 1, 1, 1)),
            vec![ZPAD, ZDLE, ZBIN, 0, 1, 1, 1, 1, 0x62, 0x94]
        );
    }

    #[test]
    fn bin32_header_bytes() {
        assert_eq!(
            build(&Header::empty(HeaderType::Bin32, ZDATA)),
            vec![ZPAD, ZDLE, ZBIN32, 0x0A, 0, 0, 0, 0, 0xBC, 0xEF, 0x92, 0x8C]
        );
    }

    fn round_trip(header: Header) {
        let mut channel = TestChannel::new();
        channel.sender.tx.write_all(&build(&header)).unwrap();
        let mut sink = Vec::new();
        let mut io = ZReadline::new(
            &mut channel.receiver.rx,
            &mut sink,
            Duration::from_millis(200),
            CancelToken::new(),
        );
        match Header::read(&mut io).unwrap() {
            HeaderEvent::Frame(read_back) => assert_eq!(read_back, header),
            other => panic!("expected a frame, got {other:?}"),
        }
    }

    #[test]
    fn header_round_trips() {
        round_trip(Header::from_flags(HeaderType::Bin, ZFILE, 3, 2, 1, 0));
        round_trip(Header::from_flags(HeaderType::Bin32, ZFILE, 3, 2, 1, 0));
        round_trip(Header::from_number(HeaderType::Hex, ZRPOS, 0x01020304));
        // position bytes that need stuffing in a binary header
        round_trip(Header::from_number(HeaderType::Bin32, ZDATA, 0x1113_1811));
    }

    #[test]
    fn leading_noise_is_skipped() {
        let mut channel = TestChannel::new();
        channel.sender.tx.write_all(b"login: ").unwrap();
        let header = Header::from_flags(HeaderType::Hex, ZRINIT, 0, 0, 0, 0x23);
        channel.sender.tx.write_all(&build(&header)).unwrap();
        let mut sink = Vec::new();
        let mut io = ZReadline::new(
            &mut channel.receiver.rx,
            &mut sink,
            Duration::from_millis(200),
            CancelToken::new(),
        );
        match Header::read(&mut io).unwrap() {
            HeaderEvent::Frame(read_back) => assert_eq!(read_back, header),
            other => panic!("expected a frame, got {other:?}"),
        }
    }

    #[test]
    fn five_cans_cancel_the_scan() {
        let mut channel = TestChannel::new();
        channel.sender.tx.write_all(&[CAN; 5]).unwrap();
        let mut sink = Vec::new();
        let mut io = ZReadline::new(
            &mut channel.receiver.rx,
            &mut sink,
            Duration::from_millis(200),
            CancelToken::new(),
        );
        assert!(matches!(
            Header::read(&mut io).unwrap(),
            HeaderEvent::Cancelled
        ));
    }

    #[test]
    fn corrupted_hex_header_reports_crc_error() {
        let mut channel = TestChannel::new();
        let mut bytes = build(&Header::empty(HeaderType::Hex, ZRPOS));
        bytes[6] = b'1'; // flip a position digit
        channel.sender.tx.write_all(&bytes).unwrap();
        let mut sink = Vec::new();
        let mut io = ZReadline::new(
            &mut channel.receiver.rx,
            &mut sink,
            Duration::from_millis(200),
            CancelToken::new(),
        );
        assert!(matches!(
            Header::read(&mut io).unwrap(),
            HeaderEvent::CrcError
        ));
    }
}
