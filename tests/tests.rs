//! End-to-end tests: real interpreter, synthesized ROM images, a bespoke
//! console host.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::sync::atomic::Ordering;

use emwbw::host::{DiskHandle, DiskMode, HostIo, HostPtr, HostTime};
use emwbw::{Configuration, Emulator, ExitReason};

struct ConsoleHost {
    input: VecDeque<u8>,
    output: Vec<u8>,
    disks: Vec<Option<File>>,
}

impl ConsoleHost {
    fn new() -> Self {
        ConsoleHost { input: VecDeque::new(), output: Vec::new(), disks: Vec::new() }
    }

    fn output_string(&self) -> String {
        String::from_utf8_lossy(&self.output).into_owned()
    }
}

impl HostIo for ConsoleHost {
    fn has_input(&mut self) -> bool {
        !self.input.is_empty()
    }

    fn read_char(&mut self) -> i32 {
        self.input.pop_front().map_or(-1, |b| b as i32)
    }

    fn write_char(&mut self, byte: u8) {
        self.output.push(byte);
    }

    fn queue_char(&mut self, ch: i32) {
        if ch >= 0 {
            self.input.push_back(ch as u8);
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
        let file = match mode {
            DiskMode::Read => OpenOptions::new().read(true).open(path)?,
            DiskMode::ReadWrite => OpenOptions::new().read(true).write(true).open(path)?,
            DiskMode::ReadWriteCreate => {
                OpenOptions::new().read(true).write(true).create(true).open(path)?
            }
        };
        self.disks.push(Some(file));
        Ok(self.disks.len() - 1)
    }

    fn disk_read(&mut self, handle: DiskHandle, offset: u64, len: usize) -> io::Result<Vec<u8>> {
        let file = self.disks[handle].as_mut().unwrap();
        file.seek(SeekFrom::Start(offset))?;
        let mut buf = vec![0u8; len];
        let n = file.read(&mut buf)?;
        buf.truncate(n);
        Ok(buf)
    }

    fn disk_write(&mut self, handle: DiskHandle, offset: u64, data: &[u8]) -> io::Result<usize> {
        let file = self.disks[handle].as_mut().unwrap();
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(data)?;
        Ok(data.len())
    }

    fn disk_flush(&mut self, handle: DiskHandle) -> io::Result<()> {
        self.disks[handle].as_mut().unwrap().sync_data()
    }

    fn disk_size(&mut self, handle: DiskHandle) -> io::Result<u64> {
        Ok(self.disks[handle].as_mut().unwrap().metadata()?.len())
    }

    fn disk_close(&mut self, handle: DiskHandle) {
        self.disks[handle] = None;
    }

    fn local_time(&self) -> HostTime {
        HostTime { year: 2024, month: 1, day: 2, hour: 3, minute: 4, second: 5, weekday: 2 }
    }

    fn beep(&mut self) {}
}

/// A one-bank ROM with the program at the reset vector.
fn write_rom(dir: &tempfile::TempDir, program: &[u8], extra: &[(u16, &[u8])]) -> PathBuf {
    let mut image = vec![0u8; 0x8000];
    image[..program.len()].copy_from_slice(program);
    for (addr, bytes) in extra {
        image[*addr as usize..*addr as usize + bytes.len()].copy_from_slice(bytes);
    }
    let path = dir.path().join("test.rom");
    std::fs::write(&path, &image).unwrap();
    path
}

fn machine(rom: PathBuf) -> (Emulator, Rc<RefCell<ConsoleHost>>) {
    let mut config = Configuration::new(rom);
    config.blocking_input = false;
    let host = Rc::new(RefCell::new(ConsoleHost::new()));
    let hp: HostPtr = host.clone();
    let emulator = Emulator::new(config, hp).unwrap();
    (emulator, host)
}

#[test]
fn port_dispatch_reaches_the_console() {
    let dir = tempfile::tempdir().unwrap();
    #[rustfmt::skip]
    let program = [
        0x06, 0x01,       // LD B,01h      (CIO output)
        0x1E, b'H',       // LD E,'H'
        0xD3, 0xEF,       // OUT (EFh),A
        0x1E, b'i',       // LD E,'i'
        0xD3, 0xEF,       // OUT (EFh),A
        0x76,             // HALT
    ];
    let (mut emu, host) = machine(write_rom(&dir, &program, &[]));
    assert_eq!(emu.run().unwrap(), ExitReason::Halted);
    assert_eq!(host.borrow().output_string(), "Hi");
}

#[test]
fn trap_dispatch_after_signal_registration() {
    let dir = tempfile::tempdir().unwrap();
    #[rustfmt::skip]
    let program = [
        0x31, 0x00, 0x9F, // LD SP,9F00h
        0x3E, 0x10,       // LD A,10h      (register CIO address)
        0xD3, 0xEE,       // OUT (EEh),A
        0x3E, 0x00,       // LD A,00h      (low byte)
        0xD3, 0xEE,       // OUT (EEh),A
        0x3E, 0x40,       // LD A,40h      (high byte -> 4000h)
        0xD3, 0xEE,       // OUT (EEh),A
        0x3E, 0xFF,       // LD A,FFh      (enable traps)
        0xD3, 0xEE,       // OUT (EEh),A
        0x06, 0x01,       // LD B,01h      (CIO output)
        0x1E, b'T',       // LD E,'T'
        0xCD, 0x00, 0x40, // CALL 4000h
        0x1E, b'!',       // LD E,'!'
        0xCD, 0x00, 0x40, // CALL 4000h
        0x76,             // HALT
    ];
    let (mut emu, host) = machine(write_rom(&dir, &program, &[]));
    assert_eq!(emu.run().unwrap(), ExitReason::Halted);
    assert_eq!(host.borrow().output_string(), "T!");
}

#[test]
fn bank_select_ports_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    #[rustfmt::skip]
    let program = [
        0x3E, 0x8E,       // LD A,8Eh
        0xD3, 0x7C,       // OUT (7Ch),A   (select bank)
        0xDB, 0x78,       // IN A,(78h)    (read it back)
        0x32, 0x00, 0x90, // LD (9000h),A
        0x76,             // HALT
    ];
    let (mut emu, _) = machine(write_rom(&dir, &program, &[]));
    assert_eq!(emu.run().unwrap(), ExitReason::Halted);
    assert_eq!(emu.sys.mem.current_bank(), 0x8E);
    assert_eq!(emu.sys.mem.fetch(0x9000), 0x8E);
}

#[test]
fn console_input_arrives_translated() {
    let dir = tempfile::tempdir().unwrap();
    #[rustfmt::skip]
    let program = [
        0x06, 0x00,       // LD B,00h      (CIO input)
        0xD3, 0xEF,       // OUT (EFh),A
        0x7B,             // LD A,E
        0x32, 0x00, 0x90, // LD (9000h),A
        0x76,             // HALT
    ];
    let (mut emu, host) = machine(write_rom(&dir, &program, &[]));
    host.borrow_mut().queue_char(0x0A);
    assert_eq!(emu.run().unwrap(), ExitReason::Halted);
    // Line feeds become carriage returns on the way in.
    assert_eq!(emu.sys.mem.fetch(0x9000), 0x0D);
}

#[test]
fn sysboot_starts_a_rom_application() {
    let dir = tempfile::tempdir().unwrap();
    // Application payload: a single HALT at its entry point.
    let payload = [0x76u8, 0x00, 0x00];
    let app = {
        let mut bytes = vec![0u8; 0x600 + payload.len()];
        bytes[0x5E0 + 26..0x5E0 + 28].copy_from_slice(&0x8200u16.to_le_bytes());
        bytes[0x5E0 + 28..0x5E0 + 30].copy_from_slice(&0x8203u16.to_le_bytes());
        bytes[0x5E0 + 30..0x5E0 + 32].copy_from_slice(&0x8200u16.to_le_bytes());
        bytes[0x600..].copy_from_slice(&payload);
        let path = dir.path().join("cpm.sys");
        std::fs::write(&path, &bytes).unwrap();
        path
    };
    #[rustfmt::skip]
    let program = [
        0x21, 0x40, 0x00, // LD HL,0040h   (command string address)
        0x06, 0xFE,       // LD B,FEh      (SYS boot)
        0xD3, 0xEF,       // OUT (EFh),A
        0x76,             // HALT          (not reached; PC moves to entry)
    ];
    let rom = write_rom(&dir, &program, &[(0x0040, b"C\0")]);
    let mut config = Configuration::new(rom);
    config.blocking_input = false;
    config.rom_apps.push(emwbw::boot::RomApp {
        key: 'C',
        name: "CP/M".into(),
        path: app,
    });
    let host = Rc::new(RefCell::new(ConsoleHost::new()));
    let hp: HostPtr = host.clone();
    let mut emu = Emulator::new(config, hp).unwrap();

    assert_eq!(emu.run().unwrap(), ExitReason::Halted);
    // Landed in the user bank with the payload in place.
    assert_eq!(emu.sys.mem.current_bank(), 0x8E);
    for (i, &b) in payload.iter().enumerate() {
        assert_eq!(emu.sys.mem.fetch(0x8200 + i as u16), b);
    }
}

#[test]
fn stop_flag_halts_the_loop() {
    let dir = tempfile::tempdir().unwrap();
    // An infinite loop the stop flag has to break.
    let program = [0x18u8, 0xFE]; // JR -2
    let rom = write_rom(&dir, &program, &[]);
    let mut config = Configuration::new(rom);
    config.blocking_input = false;
    config.stop.store(true, Ordering::Relaxed);
    let stop = config.stop.clone();
    let host = Rc::new(RefCell::new(ConsoleHost::new()));
    let hp: HostPtr = host.clone();
    let mut emu = Emulator::new(config, hp).unwrap();
    assert_eq!(emu.run().unwrap(), ExitReason::Stopped);
    assert!(stop.load(Ordering::Relaxed));
}
