use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;

use crate::callbacks::{FileSource, TransferHandler};
use crate::com::{CancelToken, ComReader, ZReadline};
use crate::constants::ABORT_SEQ;
use crate::err::{TransferResult, TransmissionError};
use crate::fileinfo::FileDetails;
use crate::progress::ProgressTracker;
use crate::rz::{Rz, RzEvent};
use crate::sz::Sz;

/// Protocol options. `Default` matches what stock `sz`/`rz` negotiate over
/// a clean 8-bit channel.
#[derive(Clone)]
pub struct Config {
    /// Offer ZBIN32 frames and CRC-32 when the peer advertises CANFC32.
    pub use_crc32: bool,
    /// Force control-character escaping (TESCCTL); the peer may still
    /// request it on its own.
    pub escape_control: bool,
    /// Thinner escape table for transports known to be clean.
    pub turbo_escape: bool,
    /// Per-read deadline in tenths of a second; zero disables deadlines.
    pub timeout: u32,
    /// Pipelined window in bytes; zero disables the window entirely.
    pub window_size: u32,
    /// Data subpacket size. Clamped down to the peer's buffer length.
    pub block_size: usize,
    /// Upper clamp for the negotiated buffer and subpacket sizes.
    pub max_block_size: usize,
    /// NUL preamble bytes before each ZDATA header, for peers that drop
    /// the first bytes after line turnaround.
    pub znulls: usize,
    /// Attention sequence announced via ZSINIT; NUL ends it, 0x8E pauses.
    pub attention: Vec<u8>,
    /// Minimum spacing between progress callbacks.
    pub progress_interval: Duration,
    /// Ambient cancellation, polled before blocking reads.
    pub cancel: CancelToken,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            use_crc32: true,
            escape_control: false,
            turbo_escape: false,
            timeout: 100,
            window_size: 0,
            block_size: 2 * 1024,
            max_block_size: 8 * 1024,
            znulls: 0,
            attention: vec![0x03, 0x8E, 0x00],
            progress_interval: Duration::from_millis(100),
            cancel: CancelToken::new(),
        }
    }
}

impl Config {
    pub fn timeout_duration(&self) -> Duration {
        if self.timeout == 0 {
            // deadlines disabled; anything effectively infinite works
            Duration::from_secs(30 * 24 * 3600)
        } else {
            Duration::from_millis(u64::from(self.timeout) * 100)
        }
    }
}

/// Session facade: owns the configuration, the host callbacks, and both
/// state machines; drives whole batches over a borrowed channel.
pub struct Zmodem {
    config: Config,
    handler: Box<dyn TransferHandler>,
    sz: Sz,
    rz: Rz,
}

impl Zmodem {
    pub fn new(config: Config, handler: Box<dyn TransferHandler>) -> Self {
        let sz = Sz::new(&config);
        let rz = Rz::new(&config);
        Self {
            config,
            handler,
            sz,
            rz,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Throw the emergency brake: eight CANs and the backspaces that wipe
    /// their echo.
    pub fn cancel(tx: &mut dyn Write) -> std::io::Result<()> {
        tx.write_all(&ABORT_SEQ)?;
        tx.flush()
    }

    /// Forget all negotiated state so the next batch starts from a fresh
    /// handshake.
    pub(crate) fn reset(&mut self) {
        self.sz = Sz::new(&self.config);
        self.rz = Rz::new(&self.config);
    }

    /// Send a batch of files, then close the session with ZFIN.
    pub fn send_files(
        &mut self,
        rx: &mut dyn ComReader,
        tx: &mut dyn Write,
        paths: &[PathBuf],
    ) -> TransferResult<()> {
        let mut io = self.readline(rx, tx);
        self.send_files_io(&mut io, paths)
    }

    pub(crate) fn send_files_io(
        &mut self,
        io: &mut ZReadline<'_>,
        paths: &[PathBuf],
    ) -> TransferResult<()> {
        self.sz.get_receiver_init(io)?;

        let mut entries: Vec<(Box<dyn FileSource>, FileDetails)> = Vec::new();
        for path in paths {
            match self.handler.open_file(path) {
                Ok(pair) => entries.push(pair),
                Err(e) => {
                    let err = TransmissionError::Io(e);
                    log::error!("cannot open {}: {err}", path.display());
                    self.handler.on_error(&err, "open file");
                }
            }
        }

        let total: u64 = entries.iter().map(|(_, d)| d.size).sum();
        let count = entries.len();
        let mut sent_before = 0u64;
        for (index, (source, details)) in entries.iter_mut().enumerate() {
            details.files_left = (count - index - 1) as u32;
            details.bytes_left = total - sent_before - details.size;
            self.handler.on_file_start(details);
            let mut tracker = ProgressTracker::new(details.size, self.config.progress_interval);

            let result = send_one(&mut self.sz, self.handler.as_mut(), io, source.as_mut(), details, &mut tracker);
            match result {
                Ok(bytes) => {
                    self.handler
                        .on_file_complete(&details.name, bytes, tracker.elapsed());
                }
                Err(TransmissionError::FileSkipped) => {
                    log::info!("peer skipped {}", details.name);
                    self.handler
                        .on_error(&TransmissionError::FileSkipped, "send file");
                }
                Err(e) if e.is_cancelled() => return Err(e),
                Err(e) => {
                    if self.handler.on_error(&e, "send file") {
                        log::warn!("retrying {} after: {e}", details.name);
                        let bytes = send_one(
                            &mut self.sz,
                            self.handler.as_mut(),
                            io,
                            source.as_mut(),
                            details,
                            &mut tracker,
                        )?;
                        self.handler
                            .on_file_complete(&details.name, bytes, tracker.elapsed());
                    } else {
                        return Err(e);
                    }
                }
            }
            sent_before += details.size;
        }

        self.sz.finish(io)
    }

    /// Receive files until the sender closes the batch, an unrecoverable
    /// error occurs, or `max_files` (when nonzero) is reached. Returns the
    /// number of files stored.
    pub fn receive_files(
        &mut self,
        rx: &mut dyn ComReader,
        tx: &mut dyn Write,
        max_files: usize,
    ) -> TransferResult<usize> {
        let mut io = self.readline(rx, tx);
        self.receive_files_io(&mut io, max_files)
    }

    pub(crate) fn receive_files_io(
        &mut self,
        io: &mut ZReadline<'_>,
        max_files: usize,
    ) -> TransferResult<usize> {
        let mut received = 0usize;
        loop {
            if max_files > 0 && received >= max_files {
                break;
            }
            match self.rz.wait_for_zfile(io)? {
                RzEvent::SessionEnd => break,
                RzEvent::FileOffer(raw) => {
                    let details = match FileDetails::parse(&raw) {
                        Ok(details) => details,
                        Err(e) => {
                            log::warn!("unusable file offer: {e}");
                            self.handler.on_error(&e, "parse file offer");
                            self.rz.send_skip(io)?;
                            continue;
                        }
                    };
                    if !self.handler.accept_file(&details) {
                        log::info!("declining {}", details.name);
                        self.rz.send_skip(io)?;
                        continue;
                    }
                    let mut sink = match self.handler.create_file(&details) {
                        Ok(sink) => sink,
                        Err(e) => {
                            let err = TransmissionError::Io(e);
                            log::error!("cannot create {}: {err}", details.name);
                            self.handler.on_error(&err, "create file");
                            self.rz.send_skip(io)?;
                            continue;
                        }
                    };
                    self.handler.on_file_start(&details);
                    let mut tracker =
                        ProgressTracker::new(details.size, self.config.progress_interval);

                    let result = {
                        let handler = self.handler.as_mut();
                        let name = details.name.clone();
                        let total = details.size;
                        self.rz.receive_file(io, sink.as_mut(), &mut |transferred| {
                            if let Some(rate) = tracker.update(transferred) {
                                handler.on_progress(&name, transferred, total, rate);
                            }
                        })
                    };
                    match result {
                        Ok(bytes) => {
                            sink.finalize()?;
                            self.handler
                                .on_file_complete(&details.name, bytes, tracker.elapsed());
                            received += 1;
                        }
                        Err(TransmissionError::FileSkipped) => {
                            log::info!("sender skipped {}", details.name);
                            continue;
                        }
                        Err(e) if e.is_cancelled() => return Err(e),
                        Err(e) => {
                            if self.handler.on_error(&e, "receive file") {
                                continue;
                            }
                            return Err(e);
                        }
                    }
                }
            }
        }
        Ok(received)
    }

    /// Detector entry point for the sender role: ask the host for its file
    /// list and run the batch (an empty list still closes politely).
    pub(crate) fn run_detected_send(&mut self, io: &mut ZReadline<'_>) -> TransferResult<()> {
        let files = self.handler.file_list();
        log::info!("remote is receiving; offering {} file(s)", files.len());
        self.send_files_io(io, &files)
    }

    fn readline<'a>(&self, rx: &'a mut dyn ComReader, tx: &'a mut dyn Write) -> ZReadline<'a> {
        ZReadline::new(
            rx,
            tx,
            self.config.timeout_duration(),
            self.config.cancel.clone(),
        )
    }
}

fn send_one(
    sz: &mut Sz,
    handler: &mut dyn TransferHandler,
    io: &mut ZReadline<'_>,
    source: &mut dyn FileSource,
    details: &FileDetails,
    tracker: &mut ProgressTracker,
) -> TransferResult<u64> {
    let name = details.name.clone();
    let total = details.size;
    sz.send_file(io, source, details, &mut |transferred| {
        if let Some(rate) = tracker.update(transferred) {
            handler.on_progress(&name, transferred, total, rate);
        }
    })
}
