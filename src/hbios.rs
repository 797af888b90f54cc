//! HBIOS dispatch engine.
//!
//! Firmware service calls arrive two ways. The boot ROM writes to the
//! dispatch port (0xEF) from inline stubs that pop their own return
//! address; once the firmware has registered its entry points over the
//! signal port (0xEE) and enabled trapping, execution reaching one of
//! those addresses (or the main entry at 0xFFF0 / the bank-call entry at
//! 0xFFF9) is intercepted and the dispatcher synthesises the return
//! itself. The two paths share one service routine; only the return
//! handling differs.
//!
//! Calling convention: B carries the function code, C a unit or
//! subfunction, the remaining registers the arguments. On return A holds
//! a signed result code with the Zero flag mirroring `A == 0`.

use std::thread;
use std::time::Duration;

use tracing::{debug, info, trace, warn};

use crate::boot::{self, BootTarget, RomApp};
use crate::cpu::GuestRegisters;
use crate::disk::{self, DiskSet, Unit, ATTR_HIGH_CAPACITY, SECTOR_SIZE};
use crate::host::HostPtr;
use crate::hostfile::{HostFileXfer, XferMode};
use crate::memory::{BankedMemory, BANK_RAM, COMMON_BASE};
use crate::rom::{self, BankTopology, DEV_HDSK, DEV_MD};

/// Result codes as the firmware sees them.
pub mod result {
    pub const OK: i8 = 0;
    pub const UNDEFINED: i8 = -1;
    pub const NOT_IMPLEMENTED: i8 = -2;
    pub const NO_FUNCTION: i8 = -3;
    pub const NO_UNIT: i8 = -4;
    pub const NO_MEMORY: i8 = -5;
    pub const OUT_OF_RANGE: i8 = -6;
    pub const NO_MEDIA: i8 = -7;
    pub const NO_HARDWARE: i8 = -8;
    pub const IO_ERROR: i8 = -9;
    pub const READ_ONLY: i8 = -10;
    pub const TIMEOUT: i8 = -11;
    pub const BAD_CONFIG: i8 = -12;
    pub const INTERNAL: i8 = -13;
    pub const FAILURE: i8 = -14;
}

pub const PORT_BANK_A: u8 = 0x78;
pub const PORT_BANK_B: u8 = 0x7C;
pub const PORT_BANK_CALL: u8 = 0xED;
pub const PORT_SIGNAL: u8 = 0xEE;
pub const PORT_DISPATCH: u8 = 0xEF;

pub const MAIN_ENTRY: u16 = 0xFFF0;
pub const BANK_CALL_ENTRY: u16 = 0xFFF9;
/// Bank-call address of the boot menu's "print device summary" service.
const SUMMARY_CALL_ADDR: u16 = 0x0406;

const HEAP_BASE: u16 = 0x0200;
const HEAP_LIMIT: u16 = 0x8000;

const PLATFORM_ID: u8 = 1;
const VERSION_WORD: u16 = ((rom::VERSION_MAJOR as u16) << 12) | ((rom::VERSION_MINOR as u16) << 8);

/// Dispatch-table slots registered over the signal port.
const SLOT_NAMES: [&str; 6] = ["CIO", "DIO", "RTC", "SYS", "VDA", "SND"];

#[derive(Clone, Copy)]
enum SignalState {
    Idle,
    /// Sequential registration of CIO/DIO/RTC/SYS, eight bytes total.
    Sequence(u8),
    /// One-off registration of a single slot, low byte first.
    Single { slot: usize, low: Option<u8> },
}

/// Which intercepted address fired.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Trap {
    Service,
    BankCall,
}

/// A CIO input call parked until the host has a character.
struct PendingInput {
    pop_return: bool,
}

enum Outcome {
    /// Result code for the postlude; Zero flag mirrors it.
    Done(i8),
    /// Input not ready: park the call, leave the guest unadvanced.
    Wait,
    /// PC was redirected (reset, boot); no postlude, no return pop.
    NoReturn,
}

#[derive(Clone, Copy, Default)]
struct SndChannel {
    period: u16,
    volume: u8,
    duration: u16,
}

pub struct Hbios {
    host: HostPtr,
    pub disks: DiskSet,
    pub apps: Vec<RomApp>,
    pub topology: BankTopology,
    addresses: [u16; 6],
    traps_enabled: bool,
    signal: SignalState,
    heap: u16,
    copy_src_bank: u8,
    copy_dst_bank: u8,
    copy_count: u16,
    ram_seeded: u16,
    vda_row: u8,
    vda_col: u8,
    snd: [SndChannel; 4],
    xfer: HostFileXfer,
    pending_input: Option<PendingInput>,
    blocking_input: bool,
    boot_unit: u8,
    boot_slice: u8,
    switch: u8,
}

impl Hbios {
    pub fn new(
        host: HostPtr,
        disks: DiskSet,
        apps: Vec<RomApp>,
        topology: BankTopology,
        blocking_input: bool,
        guest_args: Vec<String>,
    ) -> Self {
        Hbios {
            host,
            disks,
            apps,
            topology,
            addresses: [0; 6],
            traps_enabled: false,
            signal: SignalState::Idle,
            heap: HEAP_BASE,
            copy_src_bank: 0,
            copy_dst_bank: 0,
            copy_count: 0,
            // The loader already seeded the working bank 0x80.
            ram_seeded: 1,
            vda_row: 0,
            vda_col: 0,
            snd: [SndChannel::default(); 4],
            xfer: HostFileXfer::new(guest_args),
            pending_input: None,
            blocking_input,
            boot_unit: 0,
            boot_slice: 0,
            switch: 0,
        }
    }

    /// Flush and close everything at teardown.
    pub fn shutdown(&mut self) {
        let mut host = self.host.borrow_mut();
        self.xfer.close(&mut *host);
        self.disks.close_all(&mut *host);
    }

    // ---- signal port -----------------------------------------------------

    pub fn signal_write(&mut self, value: u8) {
        match self.signal {
            SignalState::Idle => match value {
                0x01 => info!("firmware starting"),
                0x02 => self.signal = SignalState::Sequence(0),
                0x10..=0x15 => {
                    self.signal = SignalState::Single { slot: (value - 0x10) as usize, low: None }
                }
                0xFE => warn!("firmware signalled a diagnostic halt"),
                0xFF => {
                    self.traps_enabled = true;
                    info!("dispatch traps enabled");
                }
                _ => debug!("unknown signal byte {:02X}", value),
            },
            SignalState::Sequence(index) => {
                let slot = (index / 2) as usize;
                if index % 2 == 0 {
                    self.addresses[slot] = value as u16;
                } else {
                    self.addresses[slot] |= (value as u16) << 8;
                    debug!("{} dispatch address {:04X}", SLOT_NAMES[slot], self.addresses[slot]);
                }
                self.signal = if index == 7 { SignalState::Idle } else { SignalState::Sequence(index + 1) };
            }
            SignalState::Single { slot, low } => match low {
                None => self.signal = SignalState::Single { slot, low: Some(value) },
                Some(lo) => {
                    self.addresses[slot] = lo as u16 | ((value as u16) << 8);
                    debug!("{} dispatch address {:04X}", SLOT_NAMES[slot], self.addresses[slot]);
                    self.signal = SignalState::Idle;
                }
            },
        }
    }

    /// Does an instruction fetch at `pc` belong to the dispatcher?
    pub fn trap_for(&self, pc: u16) -> Option<Trap> {
        if !self.traps_enabled {
            return None;
        }
        if pc == MAIN_ENTRY {
            return Some(Trap::Service);
        }
        if pc == BANK_CALL_ENTRY {
            return Some(Trap::BankCall);
        }
        if self.addresses.iter().any(|&a| a != 0 && a == pc) {
            return Some(Trap::Service);
        }
        None
    }

    // ---- entry points ----------------------------------------------------

    /// Port path: the guest's own code pops the return address.
    pub fn dispatch_port(&mut self, mem: &mut BankedMemory, regs: &mut dyn GuestRegisters) {
        self.service(mem, regs, false);
    }

    /// Trap path: the dispatcher pops the return word itself.
    pub fn dispatch_trap(&mut self, mem: &mut BankedMemory, regs: &mut dyn GuestRegisters) {
        self.service(mem, regs, true);
    }

    /// Bank-call service (port 0xED or the 0xFFF9 entry).
    pub fn bank_call(&mut self, mem: &mut BankedMemory, regs: &mut dyn GuestRegisters, pop: bool) {
        let outcome = if regs.hl() == SUMMARY_CALL_ADDR {
            self.device_summary()
        } else {
            warn!("unhandled bank call to {:04X}", regs.hl());
            Outcome::Done(result::NOT_IMPLEMENTED)
        };
        self.finish(mem, regs, outcome, pop);
    }

    fn service(&mut self, mem: &mut BankedMemory, regs: &mut dyn GuestRegisters, pop: bool) {
        let func = regs.b();
        trace!("hbios fn {:02X} c={:02X} de={:04X} hl={:04X}", func, regs.c(), regs.de(), regs.hl());
        let outcome = match func {
            0x00..=0x0F => self.cio(regs, func),
            0x10..=0x1F => self.dio(mem, regs, func),
            0x20..=0x2F => self.rtc(mem, regs, func),
            0x30..=0x3F => Outcome::Done(result::NO_HARDWARE),
            0x40..=0x4F => self.vda(regs, func),
            0x50..=0x5F => self.snd(regs, func),
            0xE0..=0xE7 => self.ext(mem, regs, func),
            0xF0..=0xFF => self.sys(mem, regs, func),
            _ => {
                warn!("unknown hbios function {:02X}", func);
                Outcome::Done(result::NO_FUNCTION)
            }
        };
        self.finish(mem, regs, outcome, pop);
    }

    fn finish(&mut self, mem: &mut BankedMemory, regs: &mut dyn GuestRegisters, outcome: Outcome, pop: bool) {
        match outcome {
            Outcome::Done(code) => {
                regs.set_a(code as u8);
                regs.set_zero(code == 0);
                if pop {
                    Self::pop_return(mem, regs);
                }
            }
            Outcome::Wait => {
                self.pending_input = Some(PendingInput { pop_return: pop });
            }
            Outcome::NoReturn => {}
        }
    }

    fn pop_return(mem: &BankedMemory, regs: &mut dyn GuestRegisters) {
        let sp = regs.sp();
        let lo = mem.fetch(sp) as u16;
        let hi = mem.fetch(sp.wrapping_add(1)) as u16;
        regs.set_sp(sp.wrapping_add(2));
        regs.set_pc((hi << 8) | lo);
    }

    // ---- waiting-for-input latch ----------------------------------------

    pub fn waiting_for_input(&self) -> bool {
        self.pending_input.is_some()
    }

    /// Retry the parked CIO input call. Returns false while the host still
    /// has nothing.
    pub fn complete_input(&mut self, mem: &mut BankedMemory, regs: &mut dyn GuestRegisters) -> bool {
        if self.pending_input.is_none() {
            return true;
        }
        let Some(ch) = self.try_read_char() else { return false };
        let Some(pending) = self.pending_input.take() else { return true };
        regs.set_e(ch);
        regs.set_a(0);
        regs.set_zero(true);
        if pending.pop_return {
            Self::pop_return(mem, regs);
        }
        true
    }

    // ---- character I/O ---------------------------------------------------

    fn try_read_char(&mut self) -> Option<u8> {
        let ch = self.host.borrow_mut().read_char();
        if ch < 0 {
            None
        } else if ch as u8 == 0x0A {
            // CP/M end-of-line convention.
            Some(0x0D)
        } else {
            Some(ch as u8)
        }
    }

    fn console_out(&mut self, byte: u8) {
        let byte = byte & 0x7F;
        if byte != 0x0D {
            self.host.borrow_mut().write_char(byte);
        }
    }

    fn console_print(&mut self, text: &str) {
        for &b in text.as_bytes() {
            self.console_out(b);
        }
    }

    fn cio(&mut self, regs: &mut dyn GuestRegisters, func: u8) -> Outcome {
        match func {
            // Input: next character in E, or park the call.
            0x00 => {
                if let Some(ch) = self.try_read_char() {
                    regs.set_e(ch);
                    return Outcome::Done(result::OK);
                }
                if !self.blocking_input {
                    return Outcome::Wait;
                }
                loop {
                    thread::sleep(Duration::from_millis(1));
                    if let Some(ch) = self.try_read_char() {
                        regs.set_e(ch);
                        return Outcome::Done(result::OK);
                    }
                }
            }
            0x01 => {
                self.console_out(regs.e());
                Outcome::Done(result::OK)
            }
            // Input status: a character count, so the Zero flag naturally
            // means "nothing waiting".
            0x02 => Outcome::Done(self.host.borrow_mut().has_input() as i8),
            // Output is always ready.
            0x03 => Outcome::Done(1),
            0x04 => Outcome::Done(result::OK),
            0x05 => {
                regs.set_de(0);
                Outcome::Done(result::OK)
            }
            0x06 => {
                regs.set_d(0);
                regs.set_e(0);
                regs.set_c(0);
                Outcome::Done(result::OK)
            }
            _ => Outcome::Done(result::NO_FUNCTION),
        }
    }

    // ---- disk I/O --------------------------------------------------------

    fn dma_fetch(mem: &BankedMemory, dma: u8, addr: u16) -> u8 {
        if dma & BANK_RAM != 0 {
            let (bank, offset) = BankedMemory::resolve_common(dma, addr);
            mem.read_bank(bank, offset)
        } else {
            mem.fetch(addr)
        }
    }

    fn dma_store(mem: &mut BankedMemory, dma: u8, addr: u16, value: u8) {
        if dma & BANK_RAM != 0 {
            let (bank, offset) = BankedMemory::resolve_common(dma, addr);
            mem.write_bank(bank, offset, value);
        } else {
            mem.store(addr, value);
        }
    }

    fn dio(&mut self, mem: &mut BankedMemory, regs: &mut dyn GuestRegisters, func: u8) -> Outcome {
        // The slice-calculation extension aside, the unit rides in C.
        let unit = regs.c();
        let resolved = self.disks.resolve(unit);
        match func {
            0x10 | 0x11 => match resolved {
                Some(Unit::Mem(idx)) => {
                    if func == 0x11 {
                        self.disks.md[idx].lba = 0;
                    }
                    Outcome::Done(result::OK)
                }
                Some(Unit::Hard(idx)) => {
                    if func == 0x11 {
                        if let Some(disk) = self.disks.hd[idx].as_mut() {
                            disk.lba = 0;
                        }
                    }
                    Outcome::Done(result::OK)
                }
                None => Outcome::Done(result::NO_UNIT),
            },
            0x12 => {
                // Bit 31 of DE:HL is the LBA-mode flag; mask it off.
                let lba = (((regs.de() as u32) << 16) | regs.hl() as u32) & 0x7FFF_FFFF;
                match resolved {
                    Some(Unit::Mem(idx)) => {
                        self.disks.md[idx].lba = lba;
                        Outcome::Done(result::OK)
                    }
                    Some(Unit::Hard(idx)) => {
                        self.disks.hd[idx].as_mut().unwrap().lba = lba;
                        Outcome::Done(result::OK)
                    }
                    None => Outcome::Done(result::NO_UNIT),
                }
            }
            0x13 => self.dio_read(mem, regs, resolved),
            0x14 => self.dio_write(mem, regs, resolved),
            0x15 => Outcome::Done(result::OK),
            0x16 | 0x19 => Outcome::Done(result::NOT_IMPLEMENTED),
            0x17 => match resolved {
                Some(Unit::Mem(idx)) => {
                    regs.set_d(DEV_MD);
                    regs.set_e(idx as u8);
                    regs.set_c(0);
                    Outcome::Done(result::OK)
                }
                Some(Unit::Hard(idx)) => {
                    regs.set_d(DEV_HDSK);
                    regs.set_e(idx as u8);
                    regs.set_c(ATTR_HIGH_CAPACITY);
                    Outcome::Done(result::OK)
                }
                None => Outcome::Done(result::NO_UNIT),
            },
            0x18 => match resolved {
                Some(Unit::Mem(idx)) => {
                    regs.set_e(self.disks.md[idx].media_id());
                    Outcome::Done(result::OK)
                }
                Some(Unit::Hard(idx)) => {
                    let mut host = self.host.borrow_mut();
                    match self.disks.hd[idx].as_mut().unwrap().media_id(&mut *host) {
                        Ok(id) => {
                            regs.set_e(id);
                            Outcome::Done(result::OK)
                        }
                        Err(e) => Outcome::Done(e.code()),
                    }
                }
                None => Outcome::Done(result::NO_UNIT),
            },
            0x1A => {
                let sectors = match resolved {
                    Some(Unit::Mem(idx)) => self.disks.md[idx].total_sectors(),
                    Some(Unit::Hard(idx)) => {
                        let mut host = self.host.borrow_mut();
                        match self.disks.hd[idx].as_mut().unwrap().capacity_sectors(&mut *host) {
                            Ok(s) => s,
                            Err(e) => return Outcome::Done(e.code()),
                        }
                    }
                    None => return Outcome::Done(result::NO_UNIT),
                };
                regs.set_de((sectors >> 16) as u16);
                regs.set_hl(sectors as u16);
                Outcome::Done(result::OK)
            }
            0x1B => {
                if resolved.is_none() {
                    return Outcome::Done(result::NO_UNIT);
                }
                // Synthetic CHS geometry.
                regs.set_hl(255);
                regs.set_d(16);
                regs.set_e(63);
                Outcome::Done(result::OK)
            }
            _ => Outcome::Done(result::NO_FUNCTION),
        }
    }

    fn dio_read(
        &mut self,
        mem: &mut BankedMemory,
        regs: &mut dyn GuestRegisters,
        resolved: Option<Unit>,
    ) -> Outcome {
        let count = regs.e();
        let buffer = regs.hl();
        let dma = regs.d();
        regs.set_e(0);
        let unit = match resolved {
            Some(u) => u,
            None => return Outcome::Done(result::NO_UNIT),
        };
        match unit {
            Unit::Mem(idx) => {
                let mut sector = [0u8; SECTOR_SIZE];
                for n in 0..count {
                    let lba = self.disks.md[idx].lba;
                    if let Err(e) = self.disks.md[idx].read_sector(mem, lba, &mut sector) {
                        regs.set_e(n);
                        return Outcome::Done(e.code());
                    }
                    let base = buffer.wrapping_add(n as u16 * SECTOR_SIZE as u16);
                    for (i, &b) in sector.iter().enumerate() {
                        Self::dma_store(mem, dma, base.wrapping_add(i as u16), b);
                    }
                    self.disks.md[idx].lba += 1;
                }
                regs.set_e(count);
                Outcome::Done(result::OK)
            }
            Unit::Hard(idx) => {
                let data = {
                    let mut host = self.host.borrow_mut();
                    match self.disks.hd[idx].as_mut().unwrap().read(&mut *host, count) {
                        Ok(d) => d,
                        Err(e) => return Outcome::Done(e.code()),
                    }
                };
                for (i, &b) in data.iter().enumerate() {
                    Self::dma_store(mem, dma, buffer.wrapping_add(i as u16), b);
                }
                let whole = (data.len() / SECTOR_SIZE) as u8;
                regs.set_e(whole);
                Outcome::Done(if whole == count { result::OK } else { result::IO_ERROR })
            }
        }
    }

    fn dio_write(
        &mut self,
        mem: &mut BankedMemory,
        regs: &mut dyn GuestRegisters,
        resolved: Option<Unit>,
    ) -> Outcome {
        let count = regs.e();
        let buffer = regs.hl();
        let dma = regs.d();
        regs.set_e(0);
        let unit = match resolved {
            Some(u) => u,
            None => return Outcome::Done(result::NO_UNIT),
        };
        match unit {
            Unit::Mem(idx) => {
                let mut sector = [0u8; SECTOR_SIZE];
                for n in 0..count {
                    let base = buffer.wrapping_add(n as u16 * SECTOR_SIZE as u16);
                    for (i, slot) in sector.iter_mut().enumerate() {
                        *slot = Self::dma_fetch(mem, dma, base.wrapping_add(i as u16));
                    }
                    let lba = self.disks.md[idx].lba;
                    if let Err(e) = self.disks.md[idx].write_sector(mem, lba, &sector) {
                        regs.set_e(n);
                        return Outcome::Done(e.code());
                    }
                    self.disks.md[idx].lba += 1;
                }
                regs.set_e(count);
                Outcome::Done(result::OK)
            }
            Unit::Hard(idx) => {
                let mut data = Vec::with_capacity(count as usize * SECTOR_SIZE);
                for i in 0..count as usize * SECTOR_SIZE {
                    data.push(Self::dma_fetch(mem, dma, buffer.wrapping_add(i as u16)));
                }
                let written = {
                    let mut host = self.host.borrow_mut();
                    match self.disks.hd[idx].as_mut().unwrap().write(&mut *host, &data) {
                        Ok(n) => n as u8,
                        Err(e) => return Outcome::Done(e.code()),
                    }
                };
                regs.set_e(written);
                Outcome::Done(if written == count { result::OK } else { result::IO_ERROR })
            }
        }
    }

    // ---- real-time clock -------------------------------------------------

    fn rtc(&mut self, mem: &mut BankedMemory, regs: &mut dyn GuestRegisters, func: u8) -> Outcome {
        match func {
            0x20 => {
                let time = self.host.borrow().local_time();
                let bcd = |v: u8| ((v / 10) << 4) | (v % 10);
                let fields = [
                    bcd((time.year % 100) as u8),
                    bcd(time.month),
                    bcd(time.day),
                    bcd(time.hour),
                    bcd(time.minute),
                    bcd(time.second),
                ];
                let buffer = regs.hl();
                for (i, &b) in fields.iter().enumerate() {
                    mem.store(buffer.wrapping_add(i as u16), b);
                }
                Outcome::Done(result::OK)
            }
            // Accepted and ignored; the host clock is not ours to set.
            0x21 => Outcome::Done(result::OK),
            _ => Outcome::Done(result::NOT_IMPLEMENTED),
        }
    }

    // ---- video / sound / keypad stubs -------------------------------------

    fn vda(&mut self, regs: &mut dyn GuestRegisters, func: u8) -> Outcome {
        match func {
            0x40 => {
                self.vda_row = 0;
                self.vda_col = 0;
                Outcome::Done(result::OK)
            }
            0x41 => {
                regs.set_c(0);
                regs.set_d(24);
                regs.set_e(80);
                Outcome::Done(result::OK)
            }
            0x48 => {
                self.vda_row = regs.d();
                self.vda_col = regs.e();
                Outcome::Done(result::OK)
            }
            0x49 => {
                regs.set_d(self.vda_row);
                regs.set_e(self.vda_col);
                Outcome::Done(result::OK)
            }
            0x4A => {
                self.console_out(regs.e());
                self.vda_col = self.vda_col.wrapping_add(1);
                Outcome::Done(result::OK)
            }
            _ => Outcome::Done(result::OK),
        }
    }

    fn snd(&mut self, regs: &mut dyn GuestRegisters, func: u8) -> Outcome {
        let channel = (regs.d() & 3) as usize;
        match func {
            0x50 => {
                self.snd = [SndChannel::default(); 4];
                Outcome::Done(result::OK)
            }
            0x51 => {
                self.snd[channel].volume = regs.e();
                Outcome::Done(result::OK)
            }
            0x52 | 0x53 => {
                self.snd[channel].period = regs.hl();
                Outcome::Done(result::OK)
            }
            0x54 => {
                self.host.borrow_mut().beep();
                Outcome::Done(result::OK)
            }
            0x55 => {
                regs.set_hl(self.snd[channel].period);
                regs.set_e(self.snd[channel].volume);
                Outcome::Done(result::OK)
            }
            0x56 => {
                self.snd[channel].duration = regs.hl();
                Outcome::Done(result::OK)
            }
            _ => Outcome::Done(result::NOT_IMPLEMENTED),
        }
    }

    // ---- extensions -------------------------------------------------------

    fn read_guest_string(mem: &BankedMemory, mut addr: u16) -> String {
        let mut bytes = Vec::new();
        for _ in 0..255 {
            let b = mem.fetch(addr);
            if b == 0x00 || b == 0x0D || b == 0x0A {
                break;
            }
            bytes.push(b);
            addr = addr.wrapping_add(1);
        }
        String::from_utf8_lossy(&bytes).into_owned()
    }

    fn ext(&mut self, mem: &mut BankedMemory, regs: &mut dyn GuestRegisters, func: u8) -> Outcome {
        match func {
            // Slice calculation: unit in D, slice in E.
            0xE0 => {
                let (unit, slice) = (regs.d(), regs.e());
                let mut host = self.host.borrow_mut();
                match self.disks.slice_offset(&mut *host, unit, slice) {
                    Ok((lba, attrs, media)) => {
                        drop(host);
                        regs.set_de((lba >> 16) as u16);
                        regs.set_hl(lba as u16);
                        regs.set_b(attrs);
                        regs.set_c(media);
                        Outcome::Done(result::OK)
                    }
                    Err(e) => Outcome::Done(e.code()),
                }
            }
            0xE1 | 0xE2 => {
                let path = Self::read_guest_string(mem, regs.hl());
                let mut host = self.host.borrow_mut();
                let opened = if func == 0xE1 {
                    self.xfer.open_read(&mut *host, &path)
                } else {
                    self.xfer.open_write(&mut *host, &path)
                };
                match opened {
                    Ok(()) => Outcome::Done(result::OK),
                    Err(e) => {
                        debug!("host file open {} failed: {}", path, e);
                        Outcome::Done(result::IO_ERROR)
                    }
                }
            }
            0xE3 => {
                let mut host = self.host.borrow_mut();
                match self.xfer.read_byte(&mut *host) {
                    Ok(Some(b)) => {
                        drop(host);
                        regs.set_e(b);
                        Outcome::Done(result::OK)
                    }
                    Ok(None) => Outcome::Done(result::FAILURE),
                    Err(_) => Outcome::Done(result::IO_ERROR),
                }
            }
            0xE4 => {
                let mut host = self.host.borrow_mut();
                match self.xfer.write_byte(&mut *host, regs.e()) {
                    Ok(()) => Outcome::Done(result::OK),
                    Err(_) => Outcome::Done(result::IO_ERROR),
                }
            }
            0xE5 => {
                let mut host = self.host.borrow_mut();
                self.xfer.close(&mut *host);
                Outcome::Done(result::OK)
            }
            0xE6 => {
                if regs.c() == 0 {
                    regs.set_e(self.xfer.mode().code());
                    Outcome::Done(result::OK)
                } else {
                    match XferMode::from_code(regs.e()) {
                        Some(mode) => {
                            self.xfer.set_mode(mode);
                            Outcome::Done(result::OK)
                        }
                        None => Outcome::Done(result::OUT_OF_RANGE),
                    }
                }
            }
            0xE7 => {
                let index = regs.e() as usize;
                match self.xfer.arg(index) {
                    Some(arg) => {
                        let arg = arg.to_owned();
                        let mut addr = regs.hl();
                        for &b in arg.as_bytes() {
                            mem.store(addr, b);
                            addr = addr.wrapping_add(1);
                        }
                        mem.store(addr, 0);
                        Outcome::Done(result::OK)
                    }
                    None => Outcome::Done(result::OUT_OF_RANGE),
                }
            }
            _ => Outcome::Done(result::NO_FUNCTION),
        }
    }

    // ---- system ------------------------------------------------------------

    fn ensure_seeded(&mut self, mem: &mut BankedMemory, bank: u8) {
        if bank & BANK_RAM == 0 {
            return;
        }
        let bit = 1u16 << (bank & 0x0F);
        if self.ram_seeded & bit == 0 {
            rom::seed_ram_bank(mem, bank);
            self.ram_seeded |= bit;
            debug!("seeded RAM bank {:02X}", bank);
        }
    }

    fn sys(&mut self, mem: &mut BankedMemory, regs: &mut dyn GuestRegisters, func: u8) -> Outcome {
        match func {
            0xF0 => match regs.c() {
                0x01 | 0x02 => {
                    info!("system reset ({})", if regs.c() == 0x01 { "warm" } else { "cold" });
                    mem.select_bank(0x00);
                    self.pending_input = None;
                    {
                        let mut host = self.host.borrow_mut();
                        while host.has_input() {
                            host.read_char();
                        }
                    }
                    self.heap = HEAP_BASE;
                    self.ram_seeded = 1;
                    regs.set_pc(0x0000);
                    Outcome::NoReturn
                }
                _ => Outcome::Done(result::NOT_IMPLEMENTED),
            },
            0xF1 => {
                regs.set_de(VERSION_WORD);
                regs.set_l(PLATFORM_ID);
                Outcome::Done(result::OK)
            }
            0xF2 => {
                let bank = regs.c();
                let previous = mem.current_bank();
                self.ensure_seeded(mem, bank);
                mem.select_bank(bank);
                regs.set_c(previous);
                Outcome::Done(result::OK)
            }
            0xF3 => {
                regs.set_c(mem.current_bank());
                Outcome::Done(result::OK)
            }
            0xF4 => {
                self.copy_dst_bank = regs.d();
                self.copy_src_bank = regs.e();
                self.copy_count = regs.hl();
                Outcome::Done(result::OK)
            }
            0xF5 => {
                let (src, dst) = (regs.hl(), regs.de());
                for i in 0..self.copy_count {
                    let (sb, so) = BankedMemory::resolve_common(self.copy_src_bank, src.wrapping_add(i));
                    let (db, dof) = BankedMemory::resolve_common(self.copy_dst_bank, dst.wrapping_add(i));
                    let byte = mem.read_bank(sb, so);
                    mem.write_bank(db, dof, byte);
                }
                Outcome::Done(result::OK)
            }
            0xF6 => {
                let size = regs.hl();
                if self.heap as u32 + size as u32 > HEAP_LIMIT as u32 {
                    Outcome::Done(result::NO_MEMORY)
                } else {
                    regs.set_hl(self.heap);
                    self.heap += size;
                    Outcome::Done(result::OK)
                }
            }
            0xF7 => Outcome::Done(result::OK),
            0xF8 => self.sys_get(regs),
            0xF9 => match regs.c() {
                0xD0 => Outcome::Done(result::OK),
                0xF4 => {
                    self.switch = regs.l();
                    Outcome::Done(result::OK)
                }
                _ => Outcome::Done(result::NOT_IMPLEMENTED),
            },
            0xFA => {
                let (bank, addr) = (regs.d(), regs.hl());
                let value = if addr >= COMMON_BASE { mem.fetch(addr) } else { mem.read_bank(bank, addr) };
                regs.set_e(value);
                Outcome::Done(result::OK)
            }
            0xFB => {
                let (bank, addr, value) = (regs.d(), regs.hl(), regs.e());
                if addr >= COMMON_BASE {
                    mem.store(addr, value);
                } else {
                    mem.write_bank(bank, addr, value);
                }
                Outcome::Done(result::OK)
            }
            0xFC => Outcome::Done(result::OK),
            0xFE => self.sys_boot(mem, regs),
            _ => Outcome::Done(result::NO_FUNCTION),
        }
    }

    fn sys_get(&mut self, regs: &mut dyn GuestRegisters) -> Outcome {
        match regs.c() {
            0x00 | 0x20 | 0x40 | 0x50 => {
                regs.set_e(1);
                Outcome::Done(result::OK)
            }
            0x10 => {
                let count = self.disks.md.iter().filter(|md| md.enabled).count()
                    + self.disks.hd.iter().flatten().count();
                regs.set_e(count as u8);
                Outcome::Done(result::OK)
            }
            0xD0 => {
                // 50 Hz tick counter derived from the host clock.
                let time = self.host.borrow().local_time();
                let seconds =
                    time.hour as u32 * 3600 + time.minute as u32 * 60 + time.second as u32;
                let ticks = seconds * 50;
                regs.set_de((ticks >> 16) as u16);
                regs.set_hl(ticks as u16);
                Outcome::Done(result::OK)
            }
            0xE0 => {
                regs.set_l(self.topology.user);
                regs.set_d(self.boot_unit);
                regs.set_e(self.boot_slice);
                Outcome::Done(result::OK)
            }
            0xF0 => {
                // Z80 at a nominal 8 MHz.
                regs.set_de(8);
                regs.set_l(0);
                Outcome::Done(result::OK)
            }
            0xF1 => {
                regs.set_de((crate::memory::ROM_SIZE / 1024) as u16);
                regs.set_hl((crate::memory::RAM_SIZE / 1024) as u16);
                Outcome::Done(result::OK)
            }
            0xF2 => {
                regs.set_d(self.topology.user);
                regs.set_e(self.topology.bios);
                Outcome::Done(result::OK)
            }
            0xF3 => {
                regs.set_d(self.topology.app_first);
                regs.set_e(self.topology.app_count);
                Outcome::Done(result::OK)
            }
            0xF4 => {
                regs.set_l(self.switch);
                Outcome::Done(result::OK)
            }
            _ => Outcome::Done(result::NOT_IMPLEMENTED),
        }
    }

    fn sys_boot(&mut self, mem: &mut BankedMemory, regs: &mut dyn GuestRegisters) -> Outcome {
        let command = Self::read_guest_string(mem, regs.hl());
        info!("boot request: {:?}", command);
        let Some(target) = boot::parse_command(&command, &self.apps) else {
            warn!("unrecognised boot command {:?}", command);
            return Outcome::Done(result::INTERNAL);
        };
        let image = match target {
            BootTarget::App(idx) => {
                let path = self.apps[idx].path.clone();
                let host = self.host.borrow();
                boot::image_from_file(&*host, &path)
            }
            BootTarget::Disk { unit, slice } => {
                let mut host = self.host.borrow_mut();
                boot::image_from_disk(mem, &mut self.disks, &mut *host, unit, slice)
            }
        };
        let image = match image {
            Ok(image) => image,
            Err(e) => {
                warn!("boot failed: {}", e);
                return Outcome::Done(result::INTERNAL);
            }
        };
        let user = self.topology.user;
        self.ensure_seeded(mem, user);
        mem.select_bank(user);
        for (i, &b) in image.payload.iter().enumerate() {
            let addr = image.load.wrapping_add(i as u16);
            let (bank, offset) = BankedMemory::resolve_common(user, addr);
            mem.write_bank(bank, offset, b);
        }
        let (unit, slice) = match target {
            BootTarget::App(_) => (0, 0),
            BootTarget::Disk { unit, slice } => (unit, slice),
        };
        self.boot_unit = unit;
        self.boot_slice = slice;
        regs.set_d(unit);
        regs.set_e(slice);
        regs.set_a(0);
        regs.set_zero(true);
        regs.set_pc(image.entry);
        info!("booted to {:04X} (unit {:02X} slice {})", image.entry, unit, slice);
        Outcome::NoReturn
    }

    // ---- device summary ----------------------------------------------------

    fn device_summary(&mut self) -> Outcome {
        fn capacity(bytes: u64) -> String {
            if bytes < 1024 * 1024 {
                format!("{}KB", bytes / 1024)
            } else {
                format!("{}MB", bytes / (1024 * 1024))
            }
        }

        let mut rows: Vec<(u8, String, &str, String)> = Vec::new();
        for (idx, md) in self.disks.md.iter().enumerate() {
            if md.enabled {
                let kind = if md.is_rom { "ROM Disk" } else { "RAM Disk" };
                rows.push((idx as u8, format!("MD{}:", idx), kind, capacity(md.size_bytes())));
            }
        }
        for idx in 0..self.disks.hd.len() {
            if self.disks.hd[idx].is_some() {
                let size = {
                    let mut host = self.host.borrow_mut();
                    self.disks.hd[idx]
                        .as_mut()
                        .unwrap()
                        .capacity_sectors(&mut *host)
                        .map(|s| s as u64 * SECTOR_SIZE as u64)
                        .unwrap_or(0)
                };
                rows.push((
                    disk::HD_UNIT_BASE + idx as u8,
                    format!("HDSK{}:", idx),
                    "Hard Disk",
                    capacity(size),
                ));
            }
        }

        let mut text = String::from("\nDisk Device Summary\n");
        text.push_str("Unit Dev    Type       Capacity\n");
        for (unit, dev, kind, cap) in rows {
            text.push_str(&format!("{:>2}   {:<7}{:<10}{:>7}\n", unit, dev, kind, cap));
        }
        text.push('\n');
        self.console_print(&text);
        Outcome::Done(result::OK)
    }
}
