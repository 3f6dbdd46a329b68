use std::fs;
use std::io::{self, Read, Seek, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use crate::err::TransmissionError;
use crate::fileinfo::FileDetails;

/// Readable, seekable source for an outgoing file. Seeking is what makes
/// ZRPOS resume and rewind work; sources that cannot seek should not be
/// offered for transfer.
pub trait FileSource: Read + Seek {}
impl<T: Read + Seek> FileSource for T {}

/// Sink for an incoming file. `finalize` runs once after the last byte of a
/// successfully received file; the default does nothing.
pub trait FileSink: Write {
    fn finalize(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Host hooks around a transfer session.
///
/// Every method has a default, so a handler only overrides what it cares
/// about. The defaults accept every file, open and create files relative to
/// the current directory, and never retry after an error.
pub trait TransferHandler {
    /// Per-file decision for an incoming ZFILE. Returning `false` answers
    /// the peer with ZSKIP. Default: accept.
    fn accept_file(&mut self, _file: &FileDetails) -> bool {
        true
    }

    /// A file transfer is about to move data. Default: ignore.
    fn on_file_start(&mut self, _file: &FileDetails) {}

    /// Periodic progress, rate in bytes per second. Default: ignore.
    fn on_progress(&mut self, _name: &str, _transferred: u64, _total: u64, _rate: f64) {}

    /// A file finished cleanly. Default: ignore.
    fn on_file_complete(&mut self, _name: &str, _bytes: u64, _elapsed: Duration) {}

    /// A file-level error. Returning `true` asks the session to retry the
    /// file once. Default: no retry.
    fn on_error(&mut self, _err: &TransmissionError, _context: &str) -> bool {
        false
    }

    /// Files to offer when the remote end starts receiving (it ran `rz`
    /// and the inline detector put this side into the sender role).
    /// Default: nothing to send, the session closes with ZFIN.
    fn file_list(&mut self) -> Vec<PathBuf> {
        Vec::new()
    }

    /// Open an outgoing file. Default: open from the filesystem and take
    /// size/mtime/permission bits from its metadata.
    fn open_file(&mut self, path: &Path) -> io::Result<(Box<dyn FileSource>, FileDetails)> {
        let file = fs::File::open(path)?;
        let meta = file.metadata()?;
        let mut details = FileDetails::new(
            path.file_name()
                .and_then(|n| n.to_str())
                .unwrap_or("unnamed"),
            meta.len(),
        );
        details.mtime = meta
            .modified()
            .ok()
            .and_then(|t| t.duration_since(SystemTime::UNIX_EPOCH).ok())
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0);
        details.mode = mode_bits(&meta);
        Ok((Box::new(file), details))
    }

    /// Create an incoming file. Default: the basename in the current
    /// directory, permission bits and mtime restored when the transfer
    /// finalizes.
    fn create_file(&mut self, file: &FileDetails) -> io::Result<Box<dyn FileSink>> {
        Ok(Box::new(LocalFileSink::create(file)?))
    }
}

/// Handler with every default left in place.
#[derive(Default)]
pub struct NullHandler;
impl TransferHandler for NullHandler {}

#[cfg(unix)]
fn mode_bits(meta: &fs::Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    meta.permissions().mode() & 0o777
}

#[cfg(not(unix))]
fn mode_bits(_meta: &fs::Metadata) -> u32 {
    0o644
}

/// Default receive sink: a freshly created local file that applies the
/// sender's permission bits and modification time once the file is complete.
pub struct LocalFileSink {
    file: fs::File,
    path: PathBuf,
    mode: u32,
    mtime: i64,
}

impl LocalFileSink {
    /// Create under the current directory.
    pub fn create(details: &FileDetails) -> io::Result<Self> {
        Self::create_in(Path::new("."), details)
    }

    /// Create `basename(details.name)` inside `dir`; the remote path is
    /// never trusted beyond its file name.
    pub fn create_in(dir: &Path, details: &FileDetails) -> io::Result<Self> {
        let path = dir.join(details.basename());
        let file = fs::File::create(&path)?;
        Ok(Self {
            file,
            path,
            mode: details.mode,
            mtime: details.mtime,
        })
    }
}

impl Write for LocalFileSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.file.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}

impl FileSink for LocalFileSink {
    fn finalize(&mut self) -> io::Result<()> {
        self.file.flush()?;
        #[cfg(unix)]
        if self.mode != 0 {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&self.path, fs::Permissions::from_mode(self.mode))?;
        }
        if self.mtime > 0 {
            let t = filetime::FileTime::from_unix_time(self.mtime, 0);
            filetime::set_file_mtime(&self.path, t)?;
        }
        Ok(())
    }
}

impl FileSink for fs::File {}
impl FileSink for Vec<u8> {}
