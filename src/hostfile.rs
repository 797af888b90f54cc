//! Host file transfer extension.
//!
//! Backs the guest-side R8/W8 utilities: the guest hands over a host path
//! and then moves bytes one at a time. A mode byte selects raw binary,
//! CP/M-flavoured text translation, or auto-detection.

use std::io;

use tracing::debug;

use crate::host::{DiskHandle, DiskMode, HostIo};

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum XferMode {
    Auto,
    Text,
    Binary,
}

impl XferMode {
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(XferMode::Auto),
            1 => Some(XferMode::Text),
            2 => Some(XferMode::Binary),
            _ => None,
        }
    }

    pub fn code(self) -> u8 {
        match self {
            XferMode::Auto => 0,
            XferMode::Text => 1,
            XferMode::Binary => 2,
        }
    }
}

struct OpenFile {
    handle: DiskHandle,
    pos: u64,
    size: u64,
    writing: bool,
    text: bool,
    // CRLF expansion state for text reads.
    pending: Option<u8>,
    prev: u8,
}

/// The transfer state machine. One file at a time; opening a new file
/// closes the previous one.
pub struct HostFileXfer {
    file: Option<OpenFile>,
    mode: XferMode,
    args: Vec<String>,
}

impl HostFileXfer {
    pub fn new(args: Vec<String>) -> Self {
        HostFileXfer { file: None, mode: XferMode::Auto, args }
    }

    pub fn mode(&self) -> XferMode {
        self.mode
    }

    pub fn set_mode(&mut self, mode: XferMode) {
        self.mode = mode;
    }

    /// Guest argument by index, for the argument-fetch call.
    pub fn arg(&self, index: usize) -> Option<&str> {
        self.args.get(index).map(String::as_str)
    }

    pub fn open_read(&mut self, host: &mut dyn HostIo, path: &str) -> io::Result<()> {
        self.close(host);
        let handle = host.disk_open(path.as_ref(), DiskMode::Read)?;
        let size = host.disk_size(handle)?;
        let text = match self.mode {
            XferMode::Text => true,
            XferMode::Binary => false,
            XferMode::Auto => {
                let head = host.disk_read(handle, 0, 1)?;
                head.first().is_some_and(|&b| b == b'\t' || b == b'\r' || b == b'\n' || (0x20..0x7F).contains(&b))
            }
        };
        debug!("transfer open read {} ({} bytes, text={})", path, size, text);
        self.file = Some(OpenFile { handle, pos: 0, size, writing: false, text, pending: None, prev: 0 });
        Ok(())
    }

    pub fn open_write(&mut self, host: &mut dyn HostIo, path: &str) -> io::Result<()> {
        self.close(host);
        // Truncate whatever was there; byte writes then extend from zero.
        host.file_save(path.as_ref(), &[])?;
        let handle = host.disk_open(path.as_ref(), DiskMode::ReadWriteCreate)?;
        let text = self.mode == XferMode::Text;
        debug!("transfer open write {} (text={})", path, text);
        self.file = Some(OpenFile { handle, pos: 0, size: 0, writing: true, text, pending: None, prev: 0 });
        Ok(())
    }

    /// Next byte from the open file, or `None` at end of data.
    pub fn read_byte(&mut self, host: &mut dyn HostIo) -> io::Result<Option<u8>> {
        let file = match self.file.as_mut() {
            Some(f) if !f.writing => f,
            _ => return Err(io::Error::new(io::ErrorKind::Other, "no file open for reading")),
        };
        if let Some(b) = file.pending.take() {
            file.prev = b;
            return Ok(Some(b));
        }
        if file.pos >= file.size {
            return Ok(None);
        }
        let chunk = host.disk_read(file.handle, file.pos, 1)?;
        let Some(&byte) = chunk.first() else { return Ok(None) };
        file.pos += 1;
        if file.text {
            if byte == 0x1A {
                // CP/M end-of-file marker.
                file.pos = file.size;
                return Ok(None);
            }
            if byte == b'\n' && file.prev != b'\r' {
                file.pending = Some(b'\n');
                file.prev = b'\r';
                return Ok(Some(b'\r'));
            }
        }
        file.prev = byte;
        Ok(Some(byte))
    }

    pub fn write_byte(&mut self, host: &mut dyn HostIo, byte: u8) -> io::Result<()> {
        let file = match self.file.as_mut() {
            Some(f) if f.writing => f,
            _ => return Err(io::Error::new(io::ErrorKind::Other, "no file open for writing")),
        };
        if file.text && byte == b'\r' {
            return Ok(());
        }
        host.disk_write(file.handle, file.pos, &[byte])?;
        file.pos += 1;
        file.size = file.size.max(file.pos);
        Ok(())
    }

    pub fn close(&mut self, host: &mut dyn HostIo) {
        if let Some(file) = self.file.take() {
            let _ = host.disk_flush(file.handle);
            host.disk_close(file.handle);
        }
    }

    pub fn is_open(&self) -> bool {
        self.file.is_some()
    }
}
