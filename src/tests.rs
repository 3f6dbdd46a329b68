use std::io::{self, Cursor, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use crate::callbacks::{FileSink, FileSource, NullHandler, TransferHandler};
use crate::com::test_com::{ComEnd, PipeReader, TestChannel};
use crate::com::{CancelToken, ComReader, ZReadline};
use crate::constants::frame_types::*;
use crate::constants::{frame_type_name, ZCRCE, ZCRCW};
use crate::escape::Escaper;
use crate::fileinfo::FileDetails;
use crate::header::{Header, HeaderEvent, HeaderType};
use crate::session::{Config, Zmodem};
use crate::subpacket::{encode_subpacket, read_subpacket, SubpacketEvent};
use crate::TransmissionError;

fn quick_config() -> Config {
    Config {
        timeout: 10, // one second keeps failing tests short
        attention: Vec::new(),
        ..Config::default()
    }
}

/// Serves files from memory on the sending side.
struct MemorySender {
    files: Vec<(String, Vec<u8>)>,
}

impl MemorySender {
    fn single(name: &str, data: Vec<u8>) -> Self {
        Self {
            files: vec![(name.to_string(), data)],
        }
    }
}

impl TransferHandler for MemorySender {
    fn file_list(&mut self) -> Vec<PathBuf> {
        self.files.iter().map(|(n, _)| PathBuf::from(n)).collect()
    }

    fn open_file(&mut self, path: &Path) -> io::Result<(Box<dyn FileSource>, FileDetails)> {
        let wanted = path.to_string_lossy();
        let (name, data) = self
            .files
            .iter()
            .find(|(n, _)| *n == wanted)
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no such test file"))?;
        let mut details = FileDetails::new(name.clone(), data.len() as u64);
        details.mode = 0o644;
        details.mtime = 1_600_000_000;
        Ok((Box::new(Cursor::new(data.clone())), details))
    }
}

/// Collects received files in memory on the receiving side.
#[derive(Default, Clone)]
struct Captured {
    files: Arc<Mutex<Vec<(FileDetails, Vec<u8>)>>>,
}

struct MemoryReceiver {
    captured: Captured,
    reject: Vec<String>,
}

impl MemoryReceiver {
    fn new(captured: Captured) -> Self {
        Self {
            captured,
            reject: Vec::new(),
        }
    }
}

impl TransferHandler for MemoryReceiver {
    fn accept_file(&mut self, file: &FileDetails) -> bool {
        !self.reject.contains(&file.name)
    }

    fn create_file(&mut self, file: &FileDetails) -> io::Result<Box<dyn FileSink>> {
        Ok(Box::new(CaptureSink {
            details: file.clone(),
            data: Vec::new(),
            captured: self.captured.clone(),
        }))
    }
}

struct CaptureSink {
    details: FileDetails,
    data: Vec<u8>,
    captured: Captured,
}

impl Write for CaptureSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.data.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl FileSink for CaptureSink {
    fn finalize(&mut self) -> io::Result<()> {
        self.captured
            .files
            .lock()
            .unwrap()
            .push((self.details.clone(), std::mem::take(&mut self.data)));
        Ok(())
    }
}

/// Read frames until `frame_type` shows up, tolerating a few repeats of
/// other session chatter (re-sent ZRINITs and the like).
fn expect_frame(io: &mut ZReadline<'_>, frame_type: u8) -> Header {
    for _ in 0..16 {
        match Header::read(io).unwrap() {
            HeaderEvent::Frame(h) if h.frame_type == frame_type => return h,
            HeaderEvent::Frame(h) => {
                log::debug!("test peer skipping {h}");
                continue;
            }
            HeaderEvent::Timeout => continue,
            other => panic!("waiting for {}, got {other:?}", frame_type_name(frame_type)),
        }
    }
    panic!("{} never arrived", frame_type_name(frame_type));
}

#[test]
fn send_single_file_end_to_end() {
    let TestChannel {
        mut sender,
        mut receiver,
    } = TestChannel::new();
    let payload = b"hello".to_vec();
    let payload_clone = payload.clone();
    let send_thread = thread::spawn(move || {
        // default attention so the ZSINIT exchange is exercised too
        let config = Config {
            timeout: 10,
            ..Config::default()
        };
        let mut session = Zmodem::new(config, Box::new(MemorySender::single("foo", payload_clone)));
        session.send_files(&mut sender.rx, &mut sender.tx, &[PathBuf::from("foo")])
    });

    let captured = Captured::default();
    let mut session = Zmodem::new(
        Config {
            timeout: 10,
            ..Config::default()
        },
        Box::new(MemoryReceiver::new(captured.clone())),
    );
    let received = session
        .receive_files(&mut receiver.rx, &mut receiver.tx, 0)
        .unwrap();
    send_thread.join().unwrap().unwrap();

    assert_eq!(received, 1);
    let files = captured.files.lock().unwrap();
    assert_eq!(files.len(), 1);
    assert_eq!(files[0].0.name, "foo");
    assert_eq!(files[0].0.size, 5);
    assert_eq!(files[0].0.mode, 0o644);
    assert_eq!(files[0].0.mtime, 1_600_000_000);
    assert_eq!(files[0].1, payload);
}

#[test]
fn skip_mid_batch_delivers_the_rest() {
    let TestChannel {
        mut sender,
        mut receiver,
    } = TestChannel::new();
    let send_thread = thread::spawn(move || {
        let handler = MemorySender {
            files: vec![
                ("a.txt".into(), b"first file".to_vec()),
                ("b.txt".into(), b"unwanted".to_vec()),
                ("c.txt".into(), b"third file".to_vec()),
            ],
        };
        let paths = [
            PathBuf::from("a.txt"),
            PathBuf::from("b.txt"),
            PathBuf::from("c.txt"),
        ];
        let mut session = Zmodem::new(quick_config(), Box::new(handler));
        session.send_files(&mut sender.rx, &mut sender.tx, &paths)
    });

    let captured = Captured::default();
    let mut session = Zmodem::new(
        quick_config(),
        Box::new(MemoryReceiver {
            captured: captured.clone(),
            reject: vec!["b.txt".to_string()],
        }),
    );
    let received = session
        .receive_files(&mut receiver.rx, &mut receiver.tx, 0)
        .unwrap();
    send_thread.join().unwrap().unwrap();

    assert_eq!(received, 2);
    let files = captured.files.lock().unwrap();
    let names: Vec<&str> = files.iter().map(|(d, _)| d.name.as_str()).collect();
    assert_eq!(names, ["a.txt", "c.txt"]);
    assert_eq!(files[0].1, b"first file");
    assert_eq!(files[1].1, b"third file");
}

#[test]
fn sender_resumes_at_receiver_position() {
    let TestChannel {
        mut sender,
        mut receiver,
    } = TestChannel::new();
    let payload: Vec<u8> = (0..8192u32).map(|i| (i % 251) as u8).collect();
    let payload_clone = payload.clone();
    let send_thread = thread::spawn(move || {
        let mut session = Zmodem::new(
            quick_config(),
            Box::new(MemorySender::single("big.bin", payload_clone)),
        );
        session.send_files(&mut sender.rx, &mut sender.tx, &[PathBuf::from("big.bin")])
    });

    // scripted receiver: pretend the first 4096 bytes already arrived
    let mut io = ZReadline::new(
        &mut receiver.rx,
        &mut receiver.tx,
        Duration::from_secs(2),
        CancelToken::new(),
    );
    let mut escaper = Escaper::new(false, false);
    let zrinit = Header::from_flags(HeaderType::Hex, ZRINIT, 0, 0, 0, 0x23);
    io.write(&zrinit.build(&mut escaper)).unwrap();

    let offer = expect_frame(&mut io, ZFILE);
    let use_crc32 = offer.header_type == HeaderType::Bin32;
    let mut buf = vec![0u8; 8192];
    let details = match read_subpacket(&mut io, &mut buf, use_crc32).unwrap() {
        SubpacketEvent::Data { len, .. } => FileDetails::parse(&buf[..len]).unwrap(),
        other => panic!("expected the file offer payload, got {other:?}"),
    };
    assert_eq!(details.name, "big.bin");
    assert_eq!(details.size, 8192);

    io.write(
        &Header::from_number(HeaderType::Hex, ZRPOS, 4096).build(&mut escaper),
    )
    .unwrap();
    let zdata = expect_frame(&mut io, ZDATA);
    assert_eq!(zdata.number(), 4096);

    let mut received = Vec::new();
    loop {
        match read_subpacket(&mut io, &mut buf, use_crc32).unwrap() {
            SubpacketEvent::Data { len, terminator } => {
                received.extend_from_slice(&buf[..len]);
                if terminator == ZCRCE {
                    break;
                }
            }
            other => panic!("expected data, got {other:?}"),
        }
    }
    assert_eq!(received, payload[4096..].to_vec());

    let zeof = expect_frame(&mut io, ZEOF);
    assert_eq!(zeof.number() as usize, payload.len());
    io.write(&Header::from_number(HeaderType::Hex, ZACK, 8192).build(&mut escaper))
        .unwrap();

    expect_frame(&mut io, ZFIN);
    io.write(&Header::from_number(HeaderType::Hex, ZFIN, 0).build(&mut escaper))
        .unwrap();
    assert_eq!(io.read_byte().unwrap(), b'O');
    assert_eq!(io.read_byte().unwrap(), b'O');
    send_thread.join().unwrap().unwrap();
}

#[test]
fn zcommand_is_refused_with_a_clean_close() {
    let TestChannel {
        mut sender,
        mut receiver,
    } = TestChannel::new();
    let peer = thread::spawn(move || {
        let mut io = ZReadline::new(
            &mut sender.rx,
            &mut sender.tx,
            Duration::from_secs(2),
            CancelToken::new(),
        );
        let mut escaper = Escaper::new(false, false);
        expect_frame(&mut io, ZRINIT);
        io.write(
            &Header::empty(HeaderType::Bin32, ZCOMMAND).build(&mut escaper),
        )
        .unwrap();
        io.write(&encode_subpacket(&mut escaper, ZCRCW, b"rm -rf /\0", true))
            .unwrap();
        io.flush().unwrap();
        let compl = expect_frame(&mut io, ZCOMPL);
        assert_eq!(compl.number(), 0);
        io.write(&Header::from_number(HeaderType::Hex, ZFIN, 0).build(&mut escaper))
            .unwrap();
        expect_frame(&mut io, ZFIN);
        io.write(b"OO").unwrap();
        io.flush().unwrap();
    });

    let mut session = Zmodem::new(quick_config(), Box::new(NullHandler));
    let err = session
        .receive_files(&mut receiver.rx, &mut receiver.tx, 0)
        .unwrap_err();
    match err {
        TransmissionError::CommandDenied(cmd) => assert_eq!(cmd, "rm -rf /"),
        other => panic!("expected a denied command, got {other}"),
    }
    peer.join().unwrap();
}

/// Flips one bit in the nth occurrence of a marker byte, then stays quiet.
struct CorruptReader {
    inner: PipeReader,
    marker: u8,
    skip: usize,
    done: bool,
}

impl ComReader for CorruptReader {
    fn read_timeout(&mut self, buf: &mut [u8], timeout: Duration) -> io::Result<usize> {
        let n = self.inner.read_timeout(buf, timeout)?;
        if !self.done {
            for b in buf[..n].iter_mut() {
                if *b == self.marker {
                    if self.skip == 0 {
                        *b ^= 0x01;
                        self.done = true;
                        break;
                    }
                    self.skip -= 1;
                }
            }
        }
        Ok(n)
    }
}

#[test]
fn crc_error_recovery_rewinds_without_corruption() {
    let TestChannel {
        mut sender,
        receiver,
    } = TestChannel::new();
    let payload = vec![0xAAu8; 10 * 1024];
    let payload_clone = payload.clone();
    let send_thread = thread::spawn(move || {
        let mut session = Zmodem::new(
            quick_config(),
            Box::new(MemorySender::single("noisy.bin", payload_clone)),
        );
        session.send_files(&mut sender.rx, &mut sender.tx, &[PathBuf::from("noisy.bin")])
    });

    let ComEnd { rx, mut tx } = receiver;
    let mut corrupt_rx = CorruptReader {
        inner: rx,
        marker: 0xAA,
        skip: 600, // lands inside the first data subpacket
        done: false,
    };
    let captured = Captured::default();
    let mut session = Zmodem::new(
        quick_config(),
        Box::new(MemoryReceiver::new(captured.clone())),
    );
    let received = session.receive_files(&mut corrupt_rx, &mut tx, 0).unwrap();
    send_thread.join().unwrap().unwrap();

    assert_eq!(received, 1);
    let files = captured.files.lock().unwrap();
    assert_eq!(files[0].1.len(), payload.len());
    assert_eq!(files[0].1, payload);
}

#[test]
fn inline_detection_diverts_and_resumes() {
    use std::io::Read;

    let TestChannel {
        sender: local,
        receiver: remote,
    } = TestChannel::new();
    let captured = Captured::default();
    let captured_remote = captured.clone();
    let remote_thread = thread::spawn(move || {
        let ComEnd { mut rx, mut tx } = remote;
        // ordinary terminal output first, then the remote runs rz
        tx.write_all(b"abc").unwrap();
        let mut session = Zmodem::new(
            quick_config(),
            Box::new(MemoryReceiver::new(captured_remote)),
        );
        let n = session.receive_files(&mut rx, &mut tx, 0).unwrap();
        tx.write_all(b"post-session").unwrap();
        n
    });

    let ComEnd { rx, tx } = local;
    let handler = MemorySender::single("note.txt", b"inline transfer works".to_vec());
    let mut term = crate::TerminalIo::new(rx, tx, quick_config(), Box::new(handler));

    let mut screen = Vec::new();
    let mut buf = [0u8; 256];
    while screen.len() < b"abcpost-session".len() {
        let n = term.read(&mut buf).unwrap();
        if n == 0 {
            break;
        }
        screen.extend_from_slice(&buf[..n]);
    }

    assert_eq!(screen, b"abcpost-session");
    assert_eq!(remote_thread.join().unwrap(), 1);
    let files = captured.files.lock().unwrap();
    assert_eq!(files.len(), 1);
    assert_eq!(files[0].0.name, "note.txt");
    assert_eq!(files[0].1, b"inline transfer works");
}
