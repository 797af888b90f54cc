//! Host capability interface.
//!
//! Everything the core wants from the outside world — console bytes, host
//! files, seekable disk images, wall-clock time, the beep — goes through
//! the `HostIo` trait. The emulator owns one shared handle (`HostPtr`) in
//! the same way the teacher machine shares its bus. `StdHost` is the
//! standard-terminal implementation used by the binary; tests plug in
//! their own.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{Datelike, Local, Timelike};
use termion::raw::{IntoRawMode, RawTerminal};
use termion::AsyncReader;
use tracing::{debug, warn};

pub type HostPtr = Rc<RefCell<dyn HostIo>>;
pub type DiskHandle = usize;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum DiskMode {
    Read,
    ReadWrite,
    ReadWriteCreate,
}

/// Broken-down local time for the RTC handler.
#[derive(Clone, Copy, Debug)]
pub struct HostTime {
    pub year: u16,
    pub month: u8,
    pub day: u8,
    pub hour: u8,
    pub minute: u8,
    pub second: u8,
    pub weekday: u8,
}

pub trait HostIo {
    // Console.
    fn has_input(&mut self) -> bool;
    /// Next console byte, or -1 when none is available.
    fn read_char(&mut self) -> i32;
    fn write_char(&mut self, byte: u8);
    /// Inject a byte into the console input queue (boot strings, tests).
    fn queue_char(&mut self, ch: i32);

    // Whole files.
    fn file_exists(&self, path: &Path) -> bool;
    fn file_size(&self, path: &Path) -> Option<u64>;
    fn file_load(&self, path: &Path) -> io::Result<Vec<u8>>;
    fn file_save(&self, path: &Path, bytes: &[u8]) -> io::Result<()>;

    // Seekable disk images.
    fn disk_open(&mut self, path: &Path, mode: DiskMode) -> io::Result<DiskHandle>;
    fn disk_read(&mut self, handle: DiskHandle, offset: u64, len: usize) -> io::Result<Vec<u8>>;
    fn disk_write(&mut self, handle: DiskHandle, offset: u64, data: &[u8]) -> io::Result<usize>;
    fn disk_flush(&mut self, handle: DiskHandle) -> io::Result<()>;
    fn disk_size(&mut self, handle: DiskHandle) -> io::Result<u64>;
    fn disk_close(&mut self, handle: DiskHandle);

    fn local_time(&self) -> HostTime;
    fn beep(&mut self);
}

fn open_file(path: &Path, mode: DiskMode) -> io::Result<File> {
    match mode {
        DiskMode::Read => OpenOptions::new().read(true).open(path),
        DiskMode::ReadWrite => OpenOptions::new().read(true).write(true).open(path),
        DiskMode::ReadWriteCreate => OpenOptions::new().read(true).write(true).create(true).open(path),
    }
}

fn read_at(file: &mut File, offset: u64, len: usize) -> io::Result<Vec<u8>> {
    file.seek(SeekFrom::Start(offset))?;
    let mut buf = vec![0u8; len];
    let mut filled = 0;
    while filled < len {
        match file.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    buf.truncate(filled);
    Ok(buf)
}

/// Terminal-backed host: raw-mode stdout, asynchronous stdin, chrono wall
/// clock and a rodio beep.
pub struct StdHost {
    stdin: AsyncReader,
    stdout: RawTerminal<io::Stdout>,
    queue: VecDeque<u8>,
    disks: Vec<Option<File>>,
    escape_char: u8,
    stop: Arc<AtomicBool>,
    audio: Option<rodio::OutputStreamHandle>,
    // Keep the stream alive for as long as the host; dropping it silences
    // any sink still playing.
    _audio_stream: Option<rodio::OutputStream>,
    audio_failed: bool,
}

impl StdHost {
    pub fn new(escape_char: u8, stop: Arc<AtomicBool>) -> io::Result<Self> {
        let stdout = io::stdout().into_raw_mode()?;
        Ok(StdHost {
            stdin: termion::async_stdin(),
            stdout,
            queue: VecDeque::new(),
            disks: Vec::new(),
            escape_char,
            stop,
            audio: None,
            _audio_stream: None,
            audio_failed: false,
        })
    }

    /// Drain whatever the terminal has buffered into the local queue,
    /// honouring the escape byte.
    fn pump(&mut self) {
        let mut buf = [0u8; 64];
        loop {
            match self.stdin.read(&mut buf) {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    for &b in &buf[..n] {
                        if b == self.escape_char {
                            debug!("escape character seen, requesting stop");
                            self.stop.store(true, Ordering::Relaxed);
                        } else {
                            self.queue.push_back(b);
                        }
                    }
                }
            }
        }
    }
}

impl HostIo for StdHost {
    fn has_input(&mut self) -> bool {
        self.pump();
        !self.queue.is_empty()
    }

    fn read_char(&mut self) -> i32 {
        self.pump();
        match self.queue.pop_front() {
            Some(b) => b as i32,
            None => -1,
        }
    }

    fn write_char(&mut self, byte: u8) {
        // Raw mode: expand bare line feeds so output lines return home.
        let _ = if byte == b'\n' {
            self.stdout.write_all(b"\r\n")
        } else {
            self.stdout.write_all(&[byte])
        };
        let _ = self.stdout.flush();
    }

    fn queue_char(&mut self, ch: i32) {
        if ch >= 0 {
            self.queue.push_back(ch as u8);
        }
    }

    fn file_exists(&self, path: &Path) -> bool {
        path.is_file()
    }

    fn file_size(&self, path: &Path) -> Option<u64> {
        std::fs::metadata(path).ok().map(|m| m.len())
    }

    fn file_load(&self, path: &Path) -> io::Result<Vec<u8>> {
        std::fs::read(path)
    }

    fn file_save(&self, path: &Path, bytes: &[u8]) -> io::Result<()> {
        std::fs::write(path, bytes)
    }

    fn disk_open(&mut self, path: &Path, mode: DiskMode) -> io::Result<DiskHandle> {
        let file = open_file(path, mode)?;
        self.disks.push(Some(file));
        Ok(self.disks.len() - 1)
    }

    fn disk_read(&mut self, handle: DiskHandle, offset: u64, len: usize) -> io::Result<Vec<u8>> {
        match self.disks.get_mut(handle).and_then(Option::as_mut) {
            Some(file) => read_at(file, offset, len),
            None => Err(io::Error::new(io::ErrorKind::NotFound, "bad disk handle")),
        }
    }

    fn disk_write(&mut self, handle: DiskHandle, offset: u64, data: &[u8]) -> io::Result<usize> {
        match self.disks.get_mut(handle).and_then(Option::as_mut) {
            Some(file) => {
                file.seek(SeekFrom::Start(offset))?;
                file.write_all(data)?;
                Ok(data.len())
            }
            None => Err(io::Error::new(io::ErrorKind::NotFound, "bad disk handle")),
        }
    }

    fn disk_flush(&mut self, handle: DiskHandle) -> io::Result<()> {
        match self.disks.get_mut(handle).and_then(Option::as_mut) {
            Some(file) => file.sync_data(),
            None => Ok(()),
        }
    }

    fn disk_size(&mut self, handle: DiskHandle) -> io::Result<u64> {
        match self.disks.get_mut(handle).and_then(Option::as_mut) {
            Some(file) => Ok(file.metadata()?.len()),
            None => Err(io::Error::new(io::ErrorKind::NotFound, "bad disk handle")),
        }
    }

    fn disk_close(&mut self, handle: DiskHandle) {
        if let Some(slot) = self.disks.get_mut(handle) {
            *slot = None;
        }
    }

    fn local_time(&self) -> HostTime {
        let now = Local::now();
        HostTime {
            year: now.year() as u16,
            month: now.month() as u8,
            day: now.day() as u8,
            hour: now.hour() as u8,
            minute: now.minute() as u8,
            second: now.second() as u8,
            weekday: now.weekday().num_days_from_sunday() as u8,
        }
    }

    fn beep(&mut self) {
        use rodio::source::{SineWave, Source};

        if self.audio.is_none() && !self.audio_failed {
            match rodio::OutputStream::try_default() {
                Ok((stream, handle)) => {
                    self._audio_stream = Some(stream);
                    self.audio = Some(handle);
                }
                Err(e) => {
                    warn!("no audio output available: {}", e);
                    self.audio_failed = true;
                }
            }
        }
        if let Some(handle) = &self.audio {
            if let Ok(sink) = rodio::Sink::try_new(handle) {
                let tone = SineWave::new(880.0).take_duration(Duration::from_millis(120)).amplify(0.15);
                sink.append(tone);
                sink.detach();
            }
        }
    }
}
