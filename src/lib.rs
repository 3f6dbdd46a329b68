//
// ZModem protocol specification http://cristal.inria.fr/~doligez/zmodem/zmodem.txt
//

//! ZMODEM for terminal clients.
//!
//! A synchronous send/receive engine that interoperates byte-for-byte with
//! `lrzsz`-style peers, plus [`TerminalIo`]: inline middleware that watches
//! a remote-shell byte stream, recognizes when the far end starts a ZMODEM
//! session, runs the transfer, and hands the terminal back.
//!
//! The host supplies the channel (a [`ComReader`] plus any `io::Write`) and
//! a [`TransferHandler`] for file access and progress; everything else is
//! protocol.

pub mod constants;
pub mod crc;

mod callbacks;
mod com;
mod detect;
mod err;
mod escape;
mod fileinfo;
mod header;
mod progress;
mod rz;
mod session;
mod subpacket;
mod sz;

#[cfg(test)]
mod tests;

pub use callbacks::{FileSink, FileSource, LocalFileSink, NullHandler, TransferHandler};
pub use com::{CancelToken, ComReader, ZReadline};
pub use detect::{TerminalIo, TerminalWriter};
pub use err::{TransferResult, TransmissionError};
pub use fileinfo::FileDetails;
pub use header::{Header, HeaderEvent, HeaderType};
pub use progress::ProgressTracker;
pub use session::{Config, Zmodem};
