use std::collections::VecDeque;
use std::io::{self, Write};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use super::ComReader;

struct Pipe {
    queue: Mutex<(VecDeque<u8>, bool)>, // (bytes, closed)
    ready: Condvar,
}

impl Pipe {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            queue: Mutex::new((VecDeque::new(), false)),
            ready: Condvar::new(),
        })
    }
}

pub struct PipeReader {
    pipe: Arc<Pipe>,
}

impl ComReader for PipeReader {
    fn read_timeout(&mut self, buf: &mut [u8], timeout: Duration) -> io::Result<usize> {
        let deadline = Instant::now() + timeout;
        let mut state = self.pipe.queue.lock().unwrap();
        loop {
            if !state.0.is_empty() {
                let mut n = 0;
                while n < buf.len() {
                    match state.0.pop_front() {
                        Some(b) => {
                            buf[n] = b;
                            n += 1;
                        }
                        None => break,
                    }
                }
                return Ok(n);
            }
            if state.1 {
                return Ok(0);
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(io::Error::new(io::ErrorKind::TimedOut, "pipe read timeout"));
            }
            let (guard, _) = self.pipe.ready.wait_timeout(state, deadline - now).unwrap();
            state = guard;
        }
    }
}

pub struct PipeWriter {
    pipe: Arc<Pipe>,
}

impl Write for PipeWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut state = self.pipe.queue.lock().unwrap();
        state.0.extend(buf.iter());
        self.pipe.ready.notify_all();
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Drop for PipeWriter {
    fn drop(&mut self) {
        let mut state = self.pipe.queue.lock().unwrap();
        state.1 = true;
        self.pipe.ready.notify_all();
    }
}

/// One side of an in-process channel.
pub struct ComEnd {
    pub rx: PipeReader,
    pub tx: PipeWriter,
}

/// A connected pair of com endpoints for driving both engines in-process.
/// Reads block on a condvar so the sender and receiver can run on their own
/// threads, like the two stream copiers of a real terminal client.
pub struct TestChannel {
    pub sender: ComEnd,
    pub receiver: ComEnd,
}

impl TestChannel {
    pub fn new() -> Self {
        let a = Pipe::new(); // sender -> receiver
        let b = Pipe::new(); // receiver -> sender
        Self {
            sender: ComEnd {
                rx: PipeReader { pipe: b.clone() },
                tx: PipeWriter { pipe: a.clone() },
            },
            receiver: ComEnd {
                rx: PipeReader { pipe: a },
                tx: PipeWriter { pipe: b },
            },
        }
    }
}

mod tests {
    #[test]
    fn pipe_round_trip() {
        use super::*;
        let mut channel = TestChannel::new();
        channel.sender.tx.write_all(b"Hello World").unwrap();
        let mut buf = [0u8; 16];
        let n = channel
            .receiver
            .rx
            .read_timeout(&mut buf, Duration::from_secs(1))
            .unwrap();
        assert_eq!(&buf[..n], b"Hello World");
    }

    #[test]
    fn pipe_times_out_when_empty() {
        use super::*;
        let mut channel = TestChannel::new();
        let mut buf = [0u8; 4];
        let err = channel
            .receiver
            .rx
            .read_timeout(&mut buf, Duration::from_millis(10))
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
    }
}
