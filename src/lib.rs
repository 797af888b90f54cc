//! A RomWBW machine emulator: banked memory, HBIOS services in host code,
//! and a Z80 interpreter driving them.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use iz80::{Cpu, Machine};
use thiserror::Error;
use tracing::{debug, error, info, warn};

pub mod boot;
pub mod cpu;
pub mod disk;
pub mod hbios;
pub mod host;
pub mod hostfile;
pub mod memory;
pub mod rom;

use boot::RomApp;
use cpu::Z80Regs;
use disk::{DiskSet, DiskSlot};
use hbios::{Hbios, Trap, PORT_BANK_A, PORT_BANK_B, PORT_BANK_CALL, PORT_DISPATCH, PORT_SIGNAL};
use host::HostPtr;
use memory::BankedMemory;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("ROM file not found: {0}")]
    RomMissing(PathBuf),
    #[error("ROM image is empty: {0}")]
    RomEmpty(PathBuf),
    #[error("ROM image larger than 512 KiB ({1} bytes): {0}")]
    RomTooLarge(PathBuf, usize),
    #[error("i/o failure: {0}")]
    Io(#[from] std::io::Error),
    #[error("unhandled port access: {0}")]
    StrictIo(String),
}

/// Machine construction parameters; the configuration surface of the CLI.
pub struct Configuration {
    pub rom_path: PathBuf,
    pub disks: Vec<DiskSlot>,
    pub rom_apps: Vec<RomApp>,
    /// Arguments guest utilities can fetch over the extension call.
    pub guest_args: Vec<String>,
    /// Treat unknown port accesses as fatal.
    pub strict_io: bool,
    /// Whether CIO input may block the driver loop.
    pub blocking_input: bool,
    /// Raised (for example by the host console) to stop the machine at the
    /// next instruction boundary.
    pub stop: Arc<AtomicBool>,
}

impl Configuration {
    pub fn new(rom_path: PathBuf) -> Self {
        Configuration {
            rom_path,
            disks: Vec::new(),
            rom_apps: Vec::new(),
            guest_args: Vec::new(),
            strict_io: false,
            blocking_input: true,
            stop: Arc::new(AtomicBool::new(false)),
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ExitReason {
    /// The guest executed HALT.
    Halted,
    /// The stop flag was raised.
    Stopped,
}

enum PendingPort {
    Dispatch,
    BankCall,
}

/// The bus the CPU talks to: memory accesses hit the banked controller,
/// port accesses route to bank selection, the signal machine and the
/// dispatcher. Dispatch itself needs the register file, which the
/// interpreter does not expose mid-instruction, so port writes only latch
/// the request; the driver loop services it before the next instruction,
/// which keeps HBIOS calls atomic from the guest's point of view.
pub struct System {
    pub mem: BankedMemory,
    pub hbios: Hbios,
    strict_io: bool,
    pending: Option<PendingPort>,
    fault: Option<String>,
}

impl Machine for System {
    fn peek(&mut self, address: u16) -> u8 {
        self.mem.fetch(address)
    }

    fn poke(&mut self, address: u16, value: u8) {
        self.mem.store(address, value);
    }

    fn port_in(&mut self, address: u16) -> u8 {
        match address as u8 {
            PORT_BANK_A | PORT_BANK_B => self.mem.current_bank(),
            port => {
                if self.strict_io {
                    self.fault = Some(format!("read of port {:02X}", port));
                } else {
                    debug!("unhandled port read {:02X}", port);
                }
                0xFF
            }
        }
    }

    fn port_out(&mut self, address: u16, value: u8) {
        match address as u8 {
            PORT_BANK_A | PORT_BANK_B => self.mem.select_bank(value),
            PORT_SIGNAL => self.hbios.signal_write(value),
            PORT_DISPATCH => self.pending = Some(PendingPort::Dispatch),
            PORT_BANK_CALL => self.pending = Some(PendingPort::BankCall),
            port => {
                if self.strict_io {
                    self.fault = Some(format!("write of {:02X} to port {:02X}", value, port));
                } else {
                    debug!("unhandled port write {:02X} -> {:02X}", value, port);
                }
            }
        }
    }
}

pub struct Emulator {
    pub cpu: Cpu,
    pub sys: System,
    stop: Arc<AtomicBool>,
}

impl Emulator {
    pub fn new(config: Configuration, host: HostPtr) -> Result<Emulator, CoreError> {
        let mut mem = BankedMemory::new();
        rom::load_rom_file(&mut mem, &*host.borrow(), &config.rom_path)?;
        let mut disks = DiskSet::from_config(&config.disks, &*host.borrow());
        for app in &config.rom_apps {
            if !host.borrow().file_exists(&app.path) {
                warn!("ROM application {} image {} not found", app.name, app.path.display());
            }
        }
        let topology = rom::install(&mut mem, &mut disks);
        let hbios = Hbios::new(
            host,
            disks,
            config.rom_apps,
            topology,
            config.blocking_input,
            config.guest_args,
        );
        let mut cpu = Cpu::new_z80();
        cpu.registers().set_pc(0x0000);
        Ok(Emulator {
            cpu,
            sys: System { mem, hbios, strict_io: config.strict_io, pending: None, fault: None },
            stop: config.stop,
        })
    }

    /// The cooperative driver loop: intercept trap addresses, execute one
    /// instruction, service any latched port dispatch, and park on the
    /// input latch without advancing the guest.
    pub fn run(&mut self) -> Result<ExitReason, CoreError> {
        info!("starting execution in ROM bank 0");
        loop {
            if self.stop.load(Ordering::Relaxed) {
                info!("stop requested");
                self.sys.hbios.shutdown();
                return Ok(ExitReason::Stopped);
            }
            if let Some(message) = self.sys.fault.take() {
                error!("strict port i/o violation: {}", message);
                self.sys.hbios.shutdown();
                return Err(CoreError::StrictIo(message));
            }
            if self.sys.hbios.waiting_for_input() {
                let System { mem, hbios, .. } = &mut self.sys;
                if !hbios.complete_input(mem, &mut Z80Regs(self.cpu.registers())) {
                    thread::sleep(Duration::from_millis(1));
                }
                continue;
            }
            let pc = self.cpu.registers().pc();
            if let Some(trap) = self.sys.hbios.trap_for(pc) {
                let System { mem, hbios, .. } = &mut self.sys;
                match trap {
                    Trap::Service => hbios.dispatch_trap(mem, &mut Z80Regs(self.cpu.registers())),
                    Trap::BankCall => hbios.bank_call(mem, &mut Z80Regs(self.cpu.registers()), true),
                }
                continue;
            }
            self.cpu.execute_instruction(&mut self.sys);
            if let Some(pending) = self.sys.pending.take() {
                let System { mem, hbios, .. } = &mut self.sys;
                match pending {
                    PendingPort::Dispatch => {
                        hbios.dispatch_port(mem, &mut Z80Regs(self.cpu.registers()))
                    }
                    PendingPort::BankCall => {
                        hbios.bank_call(mem, &mut Z80Regs(self.cpu.registers()), false)
                    }
                }
            }
            if self.cpu.is_halted() {
                info!("guest halted");
                self.sys.hbios.shutdown();
                return Ok(ExitReason::Halted);
            }
        }
    }
}
