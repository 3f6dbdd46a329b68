use std::path::Path;

use crate::err::{TransferResult, TransmissionError};

/// Everything the ZFILE frame says about one file.
///
/// On the wire this is `name NUL size mtime mode 0 filesLeft totalLeft`
/// where size and the two batch counters are decimal and mtime/mode are
/// octal (C's `%o`). Fields absent from the info string default to zero.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileDetails {
    pub name: String,
    pub size: u64,
    /// Modification time, Unix seconds.
    pub mtime: i64,
    /// POSIX permission bits only.
    pub mode: u32,
    /// Files remaining in the batch after this one.
    pub files_left: u32,
    /// Bytes remaining in the batch after this one.
    pub bytes_left: u64,
}

impl FileDetails {
    pub fn new(name: impl Into<String>, size: u64) -> Self {
        Self {
            name: name.into(),
            size,
            ..Self::default()
        }
    }

    /// The name with any directory components stripped. Remote names are
    /// untrusted; nothing the peer sends may escape the target directory.
    pub fn basename(&self) -> &str {
        Path::new(&self.name)
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("unnamed")
    }

    /// Encode the compact ZFILE metadata subpacket payload.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.name.len() + 32);
        out.extend_from_slice(self.name.as_bytes());
        out.push(0);
        out.extend_from_slice(
            format!(
                "{} {:o} {:o} 0 {} {}",
                self.size, self.mtime, self.mode, self.files_left, self.bytes_left
            )
            .as_bytes(),
        );
        out
    }

    /// Parse a received ZFILE metadata payload. Accepts both the compact
    /// form and the legacy form that pads the gap after the name with NULs.
    pub fn parse(data: &[u8]) -> TransferResult<Self> {
        let null = data.iter().position(|b| *b == 0).ok_or_else(|| {
            TransmissionError::InvalidFrame("file metadata without a NUL after the name".into())
        })?;
        let name = String::from_utf8_lossy(&data[..null]).into_owned();
        if name.is_empty() {
            return Err(TransmissionError::InvalidFrame(
                "file metadata with an empty name".into(),
            ));
        }
        let mut info_start = null + 1;
        while info_start < data.len() && data[info_start] == 0 {
            info_start += 1;
        }
        let info = String::from_utf8_lossy(&data[info_start..]);
        let info = info.trim_end_matches('\0');
        let mut fields = info.split_ascii_whitespace();
        let size = fields.next().and_then(|f| f.parse().ok()).unwrap_or(0);
        let mtime = fields
            .next()
            .and_then(|f| i64::from_str_radix(f, 8).ok())
            .unwrap_or(0);
        let mode = fields
            .next()
            .and_then(|f| u32::from_str_radix(f, 8).ok())
            .unwrap_or(0);
        let _serial = fields.next(); // always literal zero
        let files_left = fields.next().and_then(|f| f.parse().ok()).unwrap_or(0);
        let bytes_left = fields.next().and_then(|f| f.parse().ok()).unwrap_or(0);
        Ok(Self {
            name,
            size,
            mtime,
            mode: mode & 0o777,
            files_left,
            bytes_left,
        })
    }
}
