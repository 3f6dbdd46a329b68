use std::io::{self, Read};
use std::net::TcpStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

mod readline;
pub use readline::ZReadline;

#[cfg(test)]
pub mod test_com;

/// The read half of the remote channel, as supplied by the host.
///
/// The engine is synchronous: every protocol read blocks with a deadline,
/// and a deadline expiry must surface as `ErrorKind::TimedOut` so the state
/// machines can turn it into a retry. `Ok(0)` means the stream is gone
/// (carrier lost).
pub trait ComReader {
    fn read_timeout(&mut self, buf: &mut [u8], timeout: Duration) -> io::Result<usize>;
}

impl ComReader for TcpStream {
    fn read_timeout(&mut self, buf: &mut [u8], timeout: Duration) -> io::Result<usize> {
        self.set_read_timeout(Some(timeout.max(Duration::from_millis(1))))?;
        match self.read(buf) {
            Ok(n) => Ok(n),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                Err(io::Error::new(io::ErrorKind::TimedOut, "read deadline expired"))
            }
            Err(e) => Err(e),
        }
    }
}

impl ComReader for Box<dyn ComReader + Send> {
    fn read_timeout(&mut self, buf: &mut [u8], timeout: Duration) -> io::Result<usize> {
        (**self).read_timeout(buf, timeout)
    }
}

/// Ambient cancellation flag, polled by the engines before blocking reads.
/// Clones observe the same flag.
#[derive(Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}
