use std::io::ErrorKind;

use crate::com::ZReadline;
use crate::constants::*;
use crate::crc::{
    finalize_crc16, finalize_crc32, update_crc16, update_crc32, CRC32_CHECK,
};
use crate::err::{TransferResult, TransmissionError};
use crate::escape::{zdlread, Escaper};

/// Outcome of consuming one data subpacket.
#[derive(Debug)]
pub enum SubpacketEvent {
    /// `len` payload bytes landed in the caller's buffer, bounded by one of
    /// ZCRCE/ZCRCG/ZCRCQ/ZCRCW.
    Data { len: usize, terminator: u8 },
    /// The payload arrived but its frame check failed.
    CrcError,
    /// CAN*5 inside the subpacket.
    Cancelled,
}

/// Encode one data subpacket: escaped payload, raw `ZDLE <terminator>`,
/// then the CRC over payload‖terminator. ZCRCW gets the trailing XON that
/// releases an XOFF-blocked peer.
pub fn encode_subpacket(
    escaper: &mut Escaper,
    terminator: u8,
    data: &[u8],
    use_crc32: bool,
) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len() + 16);
    if use_crc32 {
        let mut crc = 0xFFFF_FFFFu32;
        for b in data {
            escaper.push(&mut out, *b);
            crc = update_crc32(crc, *b);
        }
        out.extend_from_slice(&[ZDLE, terminator]);
        crc = update_crc32(crc, terminator);
        let crc = finalize_crc32(crc);
        for b in crc.to_le_bytes() {
            // bytes with bits 5/6 set can never collide with a control byte
            if b & 0x60 != 0 {
                out.push(b);
            } else {
                escaper.push(&mut out, b);
            }
        }
    } else {
        let mut crc = 0u16;
        for b in data {
            escaper.push(&mut out, *b);
            crc = update_crc16(crc, *b);
        }
        out.extend_from_slice(&[ZDLE, terminator]);
        crc = update_crc16(crc, terminator);
        let crc = finalize_crc16(crc);
        escaper.push(&mut out, (crc >> 8) as u8);
        escaper.push(&mut out, crc as u8);
    }
    if terminator == ZCRCW {
        out.push(XON);
    }
    out
}

/// Decode one data subpacket into `buf`.
///
/// A payload longer than `buf` is a framing violation (the peer ignored the
/// advertised buffer size) and errors out rather than truncating.
pub fn read_subpacket(
    io: &mut ZReadline<'_>,
    buf: &mut [u8],
    use_crc32: bool,
) -> TransferResult<SubpacketEvent> {
    let mut crc16 = 0u16;
    let mut crc32 = 0xFFFF_FFFFu32;
    let mut pos = 0usize;
    loop {
        let c = match zdlread(io) {
            Ok(c) => c,
            Err(e) => {
                return Err(match e.kind() {
                    ErrorKind::TimedOut => {
                        TransmissionError::Timeout("mid-subpacket read".into())
                    }
                    ErrorKind::Interrupted => TransmissionError::Cancelled,
                    ErrorKind::InvalidData => TransmissionError::InvalidFrame(e.to_string()),
                    _ => TransmissionError::Io(e),
                })
            }
        };
        if c == GOTCAN {
            return Ok(SubpacketEvent::Cancelled);
        }
        if c & GOTOR != 0 {
            let terminator = (c & 0xFF) as u8;
            if use_crc32 {
                crc32 = update_crc32(crc32, terminator);
                for _ in 0..4 {
                    crc32 = update_crc32(crc32, read_crc_byte(io)?);
                }
                if crc32 != CRC32_CHECK {
                    return Ok(SubpacketEvent::CrcError);
                }
            } else {
                crc16 = update_crc16(crc16, terminator);
                for _ in 0..2 {
                    crc16 = update_crc16(crc16, read_crc_byte(io)?);
                }
                if crc16 != 0 {
                    return Ok(SubpacketEvent::CrcError);
                }
            }
            return Ok(SubpacketEvent::Data {
                len: pos,
                terminator,
            });
        }
        if pos >= buf.len() {
            return Err(TransmissionError::InvalidFrame(
                "data subpacket longer than the advertised buffer".into(),
            ));
        }
        let b = c as u8;
        buf[pos] = b;
        pos += 1;
        if use_crc32 {
            crc32 = update_crc32(crc32, b);
        } else {
            crc16 = update_crc16(crc16, b);
        }
    }
}

fn read_crc_byte(io: &mut ZReadline<'_>) -> TransferResult<u8> {
    match zdlread(io) {
        Ok(c) if c <= 0xFF => Ok(c as u8),
        Ok(_) => Err(TransmissionError::InvalidFrame(
            "terminator inside a subpacket frame check".into(),
        )),
        Err(e) => Err(match e.kind() {
            ErrorKind::TimedOut => TransmissionError::Timeout("subpacket frame check".into()),
            ErrorKind::Interrupted => TransmissionError::Cancelled,
            ErrorKind::InvalidData => TransmissionError::InvalidFrame(e.to_string()),
            _ => TransmissionError::Io(e),
        }),
    }
}
