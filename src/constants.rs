//
// Constants taken from:
//
//   Z M O D E M . H     Manifest constants for ZMODEM
//    application to application file transfer protocol
//    04-17-89  Chuck Forsberg Omen Technology Inc
//
// See https://www.rpi.edu/dept/acm/packages/zmodem/3.17/sun4c_41/src/

pub const ZPAD: u8 = b'*'; // 052 Padding character begins frames
pub const ZDLE: u8 = 0x18; // Ctrl-X Zmodem escape - `ala BISYNC DLE
pub const ZDLEE: u8 = ZDLE ^ 0x40; // Escaped ZDLE as transmitted
pub const ZBIN: u8 = b'A'; // Binary frame indicator (CRC-16)
pub const ZHEX: u8 = b'B'; // HEX frame indicator
pub const ZBIN32: u8 = b'C'; // Binary frame with 32 bit FCS

pub const CAN: u8 = 0x18;
pub const XON: u8 = 0x11;
pub const XOFF: u8 = 0x13;
pub const XON_0X80: u8 = XON | 0x80;
pub const XOFF_0X80: u8 = XOFF | 0x80;

/* ZDLE sequences */
/// CRC next, frame ends, header packet follows
pub const ZCRCE: u8 = b'h';
/// CRC next, frame continues nonstop
pub const ZCRCG: u8 = b'i';
/// CRC next, frame continues, ZACK expected
pub const ZCRCQ: u8 = b'j';
/// CRC next, ZACK expected, end of frame
pub const ZCRCW: u8 = b'k';
pub const ZRUB0: u8 = b'l'; /* Translate to rubout 0177 */
pub const ZRUB1: u8 = b'm'; /* Translate to rubout 0377 */

/// Frame-end codes returned by the ZDLE decoder. The marker bit keeps them
/// out of the byte value range so the data reader can tell them apart.
pub const GOTOR: u16 = 0x400;
pub const GOTCRCE: u16 = GOTOR | ZCRCE as u16;
pub const GOTCRCG: u16 = GOTOR | ZCRCG as u16;
pub const GOTCRCQ: u16 = GOTOR | ZCRCQ as u16;
pub const GOTCRCW: u16 = GOTOR | ZCRCW as u16;
/// CAN*5 seen
pub const GOTCAN: u16 = GOTOR | CAN as u16;

pub mod frame_types {
    pub const ZRQINIT: u8 = 0; // Request receive init
    pub const ZRINIT: u8 = 1; // Receive init
    pub const ZSINIT: u8 = 2; // Send init sequence (optional)
    pub const ZACK: u8 = 3; // ACK to above
    pub const ZFILE: u8 = 4; // File name from sender
    pub const ZSKIP: u8 = 5; // To sender: skip this file
    pub const ZNAK: u8 = 6; // Last packet was garbled
    pub const ZABORT: u8 = 7; // Abort batch transfers
    pub const ZFIN: u8 = 8; // Finish session
    pub const ZRPOS: u8 = 9; // Resume data trans at this position
    pub const ZDATA: u8 = 10; // Data packet(s) follow
    pub const ZEOF: u8 = 11; // End of file
    pub const ZFERR: u8 = 12; // Fatal Read or Write error Detected
    pub const ZCRC: u8 = 13; // Request for file CRC and response
    pub const ZCHALLENGE: u8 = 14; // Receiver's Challenge
    pub const ZCOMPL: u8 = 15; // Request is complete
    pub const ZCAN: u8 = 16; // Other end canned session with CAN*5
    pub const ZFREECNT: u8 = 17; // Request for free bytes on filesystem
    pub const ZCOMMAND: u8 = 18; // Command from sending program
    pub const ZSTDERR: u8 = 19; // Output to standard error, data follows
}

/// Human-readable frame-type name for logging.
pub fn frame_type_name(frame_type: u8) -> &'static str {
    const NAMES: [&str; 20] = [
        "ZRQINIT",
        "ZRINIT",
        "ZSINIT",
        "ZACK",
        "ZFILE",
        "ZSKIP",
        "ZNAK",
        "ZABORT",
        "ZFIN",
        "ZRPOS",
        "ZDATA",
        "ZEOF",
        "ZFERR",
        "ZCRC",
        "ZCHALLENGE",
        "ZCOMPL",
        "ZCAN",
        "ZFREECNT",
        "ZCOMMAND",
        "ZSTDERR",
    ];
    NAMES
        .get((frame_type & 0x7F) as usize)
        .copied()
        .unwrap_or("UNKNOWN")
}

pub mod zrinit_flag {
    // Bit Masks for ZRINIT flags byte ZF0
    pub const CANFDX: u8 = 0x01; // Rx can send and receive true full duplex
    pub const CANOVIO: u8 = 0x02; // Rx can receive data during disk I/O
    pub const CANBRK: u8 = 0x04; // Rx can send a break signal
    pub const CANCRY: u8 = 0x08; // Receiver can decrypt
    pub const CANLZW: u8 = 0x10; // Receiver can uncompress
    pub const CANFC32: u8 = 0x20; // Receiver can use 32 bit Frame Check
    pub const ESCCTL: u8 = 0x40; // Receiver expects ctl chars to be escaped
    pub const ESC8: u8 = 0x80; // Receiver expects 8th bit to be escaped
}

pub mod zsinit_flag {
    pub const TESCCTL: u8 = 0x40; // Transmitter expects ctl chars to be escaped
    pub const TESC8: u8 = 0x80; // Transmitter expects 8th bit to be escaped
}

pub mod zfile_flag {
    /* Conversion options, one of these in ZF0 */
    pub const ZCBIN: u8 = 1; /* Binary transfer - inhibit conversion */
    pub const ZCNL: u8 = 2; /* Convert NL to local end of line convention */
    pub const ZCRESUM: u8 = 3; /* Resume interrupted file transfer */

    /* Management options, one of these ored in ZF1 */
    pub const ZMMASK: u8 = 0x1F; /* Mask for the choices below */
    pub const ZMNEWL: u8 = 1; /* Transfer if source newer or longer */
    pub const ZMCRC: u8 = 2; /* Transfer if different file CRC or length */
    pub const ZMAPND: u8 = 3; /* Append contents to existing file (if any) */
    pub const ZMCLOB: u8 = 4; /* Replace existing file */
    pub const ZMNEW: u8 = 5; /* Transfer if source newer */

    /* Management include option, ored in ZF1 */
    pub const ZMSKNOLOC: u8 = 0x80; /* Skip file if not present at rx */
}

/// Max length of the ZSINIT attention string.
pub const ZATTNLEN: usize = 32;

/// Bytes of non-frame noise tolerated while hunting for a header.
pub const GARBAGE_BUDGET: usize = 3800;

/// Session cancel: CAN*8 followed by backspaces to wipe the echo.
pub const ABORT_SEQ: [u8; 18] = [
    0x18, 0x18, 0x18, 0x18, 0x18, 0x18, 0x18, 0x18, /* 8 CAN */
    0x08, 0x08, 0x08, 0x08, 0x08, 0x08, 0x08, 0x08, 0x08, 0x08, /* 10 BS */
];
