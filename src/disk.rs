//! Block devices: the two memory disks and the file-backed hard disks.
//!
//! Memory disks are windows over contiguous bank ranges (64 sectors of 512
//! bytes per 32K bank): MD0 lives in RAM banks and is writable, MD1 lives
//! in ROM banks and is not. Hard disks are host files opened on first use;
//! their slice geometry is probed on demand from the image's MBR:
//!
//! * hd1k — 8 MiB slices of 16384 sectors, announced by a partition of
//!   type 0x2E whose start LBA is the slice-0 base (an exactly-8 MiB image
//!   without such a partition also counts, with base 0);
//! * hd512 — the older 8.32 MiB layout, 16640-sector slices, base 0.

use std::path::PathBuf;

use thiserror::Error;
use tracing::{debug, warn};

use crate::host::{DiskHandle, DiskMode, HostIo};
use crate::memory::BankedMemory;

pub const SECTOR_SIZE: usize = 512;
pub const SECTORS_PER_BANK: u32 = 64;
pub const HD1K_SLICE_SECTORS: u32 = 16384;
pub const HD512_SLICE_SECTORS: u32 = 16640;
const HD1K_BARE_SIZE: u64 = 8 * 1024 * 1024;

/// Hard-disk slots available to the configuration.
pub const HD_SLOTS: usize = 16;
/// HBIOS unit number of the first hard disk (0 and 1 are the memory disks).
pub const HD_UNIT_BASE: u8 = 2;

/// Media identifiers reported by the media query and slice calculation.
pub mod media {
    pub const NONE: u8 = 0;
    pub const MDROM: u8 = 1;
    pub const MDRAM: u8 = 2;
    pub const HD: u8 = 4;
    pub const HDNEW: u8 = 10;
}

/// Device-attribute byte: bit 5 marks a high-capacity (sliceable) device.
pub const ATTR_HIGH_CAPACITY: u8 = 0x20;

#[derive(Debug, Error)]
pub enum DiskError {
    #[error("no such disk unit")]
    NoUnit,
    #[error("device is read-only")]
    ReadOnly,
    #[error("sector out of range")]
    OutOfRange,
    #[error("host i/o failure: {0}")]
    Io(#[from] std::io::Error),
}

impl DiskError {
    pub fn code(&self) -> i8 {
        use crate::hbios::result;
        match self {
            DiskError::NoUnit => result::NO_UNIT,
            DiskError::ReadOnly => result::READ_ONLY,
            DiskError::OutOfRange => result::OUT_OF_RANGE,
            DiskError::Io(_) => result::IO_ERROR,
        }
    }
}

/// A disk attachment request from the configuration surface.
#[derive(Clone, Debug)]
pub struct DiskSlot {
    pub unit: usize,
    pub path: PathBuf,
    pub slices: u8,
}

/// Block device over a contiguous bank range.
pub struct MemDisk {
    pub first_bank: u8,
    pub bank_count: u8,
    pub is_rom: bool,
    pub lba: u32,
    pub enabled: bool,
}

impl MemDisk {
    pub fn disabled(is_rom: bool) -> Self {
        MemDisk { first_bank: 0, bank_count: 0, is_rom, lba: 0, enabled: false }
    }

    pub fn total_sectors(&self) -> u32 {
        self.bank_count as u32 * SECTORS_PER_BANK
    }

    pub fn size_bytes(&self) -> u64 {
        self.total_sectors() as u64 * SECTOR_SIZE as u64
    }

    pub fn media_id(&self) -> u8 {
        if self.is_rom {
            media::MDROM
        } else {
            media::MDRAM
        }
    }

    fn locate(&self, lba: u32) -> Result<(u8, u16), DiskError> {
        if lba >= self.total_sectors() {
            return Err(DiskError::OutOfRange);
        }
        let bank = self.first_bank + (lba / SECTORS_PER_BANK) as u8;
        let offset = (lba % SECTORS_PER_BANK) as u16 * SECTOR_SIZE as u16;
        Ok((bank, offset))
    }

    pub fn read_sector(&self, mem: &BankedMemory, lba: u32, out: &mut [u8]) -> Result<(), DiskError> {
        let (bank, offset) = self.locate(lba)?;
        for (i, slot) in out.iter_mut().enumerate().take(SECTOR_SIZE) {
            *slot = mem.read_bank(bank, offset + i as u16);
        }
        Ok(())
    }

    pub fn write_sector(&self, mem: &mut BankedMemory, lba: u32, data: &[u8]) -> Result<(), DiskError> {
        if self.is_rom {
            return Err(DiskError::ReadOnly);
        }
        let (bank, offset) = self.locate(lba)?;
        for (i, &b) in data.iter().enumerate().take(SECTOR_SIZE) {
            mem.write_bank(bank, offset + i as u16, b);
        }
        Ok(())
    }

    /// Byte-granular read used by the boot helper; short when the range
    /// runs off the end of the disk.
    pub fn read_bytes(&self, mem: &BankedMemory, offset: u64, len: usize) -> Vec<u8> {
        let mut out = Vec::with_capacity(len);
        for i in 0..len as u64 {
            let pos = offset + i;
            if pos >= self.size_bytes() {
                break;
            }
            let bank = self.first_bank + (pos / crate::memory::BANK_SIZE as u64) as u8;
            let within = (pos % crate::memory::BANK_SIZE as u64) as u16;
            out.push(mem.read_bank(bank, within));
        }
        out
    }
}

/// File-backed hard-disk unit. The image is opened lazily and its slice
/// geometry probed on the first query that needs it.
pub struct HardDisk {
    pub path: PathBuf,
    pub slices: u8,
    handle: Option<DiskHandle>,
    pub lba: u32,
    pub size: u64,
    pub probed: bool,
    pub hd1k: bool,
    pub partition_base: u32,
    pub slice_sectors: u32,
}

impl HardDisk {
    pub fn new(path: PathBuf, slices: u8) -> Self {
        HardDisk {
            path,
            slices,
            handle: None,
            lba: 0,
            size: 0,
            probed: false,
            hd1k: false,
            partition_base: 0,
            slice_sectors: HD512_SLICE_SECTORS,
        }
    }

    fn ensure_open(&mut self, host: &mut dyn HostIo) -> Result<DiskHandle, DiskError> {
        if let Some(handle) = self.handle {
            return Ok(handle);
        }
        let handle = match host.disk_open(&self.path, DiskMode::ReadWrite) {
            Ok(h) => h,
            Err(e) => {
                debug!("read-write open of {} failed ({}), retrying read-only", self.path.display(), e);
                host.disk_open(&self.path, DiskMode::Read)?
            }
        };
        self.size = host.disk_size(handle)?;
        self.handle = Some(handle);
        Ok(handle)
    }

    /// Inspect the image's first sector once and fix the slice geometry.
    pub fn probe(&mut self, host: &mut dyn HostIo) -> Result<(), DiskError> {
        if self.probed {
            return Ok(());
        }
        let handle = self.ensure_open(host)?;
        let sector = host.disk_read(handle, 0, SECTOR_SIZE)?;
        let has_mbr = sector.len() == SECTOR_SIZE && sector[510] == 0x55 && sector[511] == 0xAA;
        let mut found = false;
        if has_mbr {
            for k in 0..4 {
                let entry = 0x1BE + 16 * k;
                if sector[entry + 4] == 0x2E {
                    self.hd1k = true;
                    self.partition_base = u32::from_le_bytes([
                        sector[entry + 8],
                        sector[entry + 9],
                        sector[entry + 10],
                        sector[entry + 11],
                    ]);
                    self.slice_sectors = HD1K_SLICE_SECTORS;
                    found = true;
                    debug!(
                        "{}: hd1k layout, slice base LBA {}",
                        self.path.display(),
                        self.partition_base
                    );
                    break;
                }
            }
        }
        if !found {
            if self.size == HD1K_BARE_SIZE {
                self.hd1k = true;
                self.partition_base = 0;
                self.slice_sectors = HD1K_SLICE_SECTORS;
                let boot_op = !sector.is_empty() && matches!(sector[0], 0xC3 | 0x18 | 0x31 | 0xF3);
                if has_mbr && !boot_op {
                    warn!(
                        "{}: 8 MiB image has an MBR but no type-0x2E partition and no boot code; \
                         treating as bare hd1k",
                        self.path.display()
                    );
                }
            } else {
                self.hd1k = false;
                self.partition_base = 0;
                self.slice_sectors = HD512_SLICE_SECTORS;
            }
        }
        self.probed = true;
        Ok(())
    }

    pub fn media_id(&mut self, host: &mut dyn HostIo) -> Result<u8, DiskError> {
        self.probe(host)?;
        Ok(if self.hd1k { media::HDNEW } else { media::HD })
    }

    pub fn capacity_sectors(&mut self, host: &mut dyn HostIo) -> Result<u32, DiskError> {
        self.ensure_open(host)?;
        Ok((self.size / SECTOR_SIZE as u64) as u32)
    }

    /// Resolved LBA of a slice start: partition base plus whole slices.
    pub fn slice_lba(&mut self, host: &mut dyn HostIo, slice: u8) -> Result<u32, DiskError> {
        self.probe(host)?;
        Ok(self.partition_base + slice as u32 * self.slice_sectors)
    }

    /// Read whole sectors at the current position, advancing it by the
    /// number transferred.
    pub fn read(&mut self, host: &mut dyn HostIo, count: u8) -> Result<Vec<u8>, DiskError> {
        let handle = self.ensure_open(host)?;
        let offset = self.lba as u64 * SECTOR_SIZE as u64;
        let mut data = host.disk_read(handle, offset, count as usize * SECTOR_SIZE)?;
        let whole = data.len() / SECTOR_SIZE;
        data.truncate(whole * SECTOR_SIZE);
        self.lba += whole as u32;
        Ok(data)
    }

    /// Write whole sectors at the current position, advancing it.
    pub fn write(&mut self, host: &mut dyn HostIo, data: &[u8]) -> Result<usize, DiskError> {
        let handle = self.ensure_open(host)?;
        let offset = self.lba as u64 * SECTOR_SIZE as u64;
        let written = host.disk_write(handle, offset, data)?;
        host.disk_flush(handle)?;
        let whole = written / SECTOR_SIZE;
        self.lba += whole as u32;
        Ok(whole)
    }

    /// Byte-granular read used by the boot helper.
    pub fn read_at(&mut self, host: &mut dyn HostIo, offset: u64, len: usize) -> Result<Vec<u8>, DiskError> {
        let handle = self.ensure_open(host)?;
        Ok(host.disk_read(handle, offset, len)?)
    }

    pub fn close(&mut self, host: &mut dyn HostIo) {
        if let Some(handle) = self.handle.take() {
            let _ = host.disk_flush(handle);
            host.disk_close(handle);
        }
    }
}

/// A resolved unit number.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Unit {
    Mem(usize),
    Hard(usize),
}

/// All block devices of the machine, indexed by the HBIOS unit projection.
pub struct DiskSet {
    pub md: [MemDisk; 2],
    pub hd: Vec<Option<HardDisk>>,
}

impl DiskSet {
    pub fn new() -> Self {
        let mut hd = Vec::with_capacity(HD_SLOTS);
        hd.resize_with(HD_SLOTS, || None);
        DiskSet { md: [MemDisk::disabled(false), MemDisk::disabled(true)], hd }
    }

    /// Attach the configured hard-disk images. Missing files are a
    /// warning, not an error; the firmware sees an absent unit.
    pub fn from_config(slots: &[DiskSlot], host: &dyn HostIo) -> Self {
        let mut set = DiskSet::new();
        for slot in slots {
            if slot.unit >= HD_SLOTS {
                warn!("disk unit {} out of range, ignored", slot.unit);
                continue;
            }
            if !host.file_exists(&slot.path) {
                warn!("disk {} image {} not found, unit left empty", slot.unit, slot.path.display());
                continue;
            }
            set.hd[slot.unit] = Some(HardDisk::new(slot.path.clone(), slot.slices.clamp(1, 8)));
        }
        set
    }

    /// The §unit-number projection: 0/1 and their aliases are the memory
    /// disks, 2..17 and 0x90..0x9F the hard disks.
    pub fn resolve(&self, unit: u8) -> Option<Unit> {
        let mem = |idx: usize| {
            if self.md[idx].enabled {
                Some(Unit::Mem(idx))
            } else {
                None
            }
        };
        let hard = |idx: usize| {
            if self.hd[idx].is_some() {
                Some(Unit::Hard(idx))
            } else {
                None
            }
        };
        match unit {
            0x00 | 0x01 => mem(unit as usize),
            0x02..=0x11 => hard((unit - HD_UNIT_BASE) as usize),
            0x80..=0x8F => mem(((unit & 0x0F) as usize).min(1)),
            0x90..=0x9F => hard((unit & 0x0F) as usize),
            0xC0..=0xCF => mem(1),
            _ => None,
        }
    }

    /// Slice calculation: resolved start LBA plus the attribute and media
    /// bytes the extension call reports. Memory disks do not slice.
    pub fn slice_offset(
        &mut self,
        host: &mut dyn HostIo,
        unit: u8,
        slice: u8,
    ) -> Result<(u32, u8, u8), DiskError> {
        match self.resolve(unit).ok_or(DiskError::NoUnit)? {
            Unit::Mem(idx) => Ok((0, 0, self.md[idx].media_id())),
            Unit::Hard(idx) => {
                let disk = self.hd[idx].as_mut().ok_or(DiskError::NoUnit)?;
                let lba = disk.slice_lba(host, slice)?;
                let media = if disk.hd1k { media::HDNEW } else { media::HD };
                Ok((lba, ATTR_HIGH_CAPACITY, media))
            }
        }
    }

    pub fn close_all(&mut self, host: &mut dyn HostIo) {
        for disk in self.hd.iter_mut().flatten() {
            disk.close(host);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::testing::TestHost;
    use std::io::Write;

    fn image(dir: &tempfile::TempDir, name: &str, size: u64, mbr: Option<(usize, u32)>) -> PathBuf {
        let path = dir.path().join(name);
        let file = std::fs::File::create(&path).unwrap();
        file.set_len(size).unwrap();
        if let Some((entry, base)) = mbr {
            let mut sector = vec![0u8; SECTOR_SIZE];
            sector[510] = 0x55;
            sector[511] = 0xAA;
            let off = 0x1BE + 16 * entry;
            sector[off + 4] = 0x2E;
            sector[off + 8..off + 12].copy_from_slice(&base.to_le_bytes());
            let mut file = std::fs::OpenOptions::new().write(true).open(&path).unwrap();
            file.write_all(&sector).unwrap();
        }
        path
    }

    fn ram_disk() -> (BankedMemory, MemDisk) {
        let mem = BankedMemory::new();
        let md = MemDisk { first_bank: 0x81, bank_count: 8, is_rom: false, lba: 0, enabled: true };
        (mem, md)
    }

    #[test]
    fn memory_disk_round_trip() {
        let (mut mem, md) = ram_disk();
        let pattern: Vec<u8> = (0..SECTOR_SIZE).map(|i| (i * 7) as u8).collect();
        md.write_sector(&mut mem, 0, &pattern).unwrap();
        md.write_sector(&mut mem, 130, &pattern).unwrap();
        let mut back = [0u8; SECTOR_SIZE];
        md.read_sector(&mem, 0, &mut back).unwrap();
        assert_eq!(&back[..], &pattern[..]);
        // Sector 130 lives two banks up; make sure the split math holds.
        md.read_sector(&mem, 130, &mut back).unwrap();
        assert_eq!(&back[..], &pattern[..]);
    }

    #[test]
    fn rom_disk_rejects_writes() {
        let mut mem = BankedMemory::new();
        let md = MemDisk { first_bank: 0x04, bank_count: 12, is_rom: true, lba: 0, enabled: true };
        let err = md.write_sector(&mut mem, 0, &[0u8; SECTOR_SIZE]).unwrap_err();
        assert!(matches!(err, DiskError::ReadOnly));
    }

    #[test]
    fn memory_disk_bounds() {
        let (mem, md) = ram_disk();
        let mut buf = [0u8; SECTOR_SIZE];
        assert_eq!(md.total_sectors(), 512);
        assert!(matches!(md.read_sector(&mem, 512, &mut buf), Err(DiskError::OutOfRange)));
    }

    #[test]
    fn bare_8mib_image_probes_as_hd1k() {
        let dir = tempfile::tempdir().unwrap();
        let mut host = TestHost::new();
        let path = image(&dir, "bare.img", 8 * 1024 * 1024, None);
        let mut disk = HardDisk::new(path, 4);
        disk.probe(&mut host).unwrap();
        assert!(disk.hd1k);
        assert_eq!(disk.partition_base, 0);
        assert_eq!(disk.slice_sectors, HD1K_SLICE_SECTORS);
        assert_eq!(disk.media_id(&mut host).unwrap(), media::HDNEW);
    }

    #[test]
    fn partitioned_image_probes_base_from_mbr() {
        let dir = tempfile::tempdir().unwrap();
        let mut host = TestHost::new();
        let path = image(&dir, "combo.img", 1024 * 1024 + 8 * 1024 * 1024, Some((1, 2048)));
        let mut disk = HardDisk::new(path, 4);
        disk.probe(&mut host).unwrap();
        assert!(disk.hd1k);
        assert_eq!(disk.partition_base, 2048);
        assert_eq!(disk.slice_lba(&mut host, 2).unwrap(), 2048 + 2 * HD1K_SLICE_SECTORS);
    }

    #[test]
    fn odd_sized_image_probes_as_hd512() {
        let dir = tempfile::tempdir().unwrap();
        let mut host = TestHost::new();
        let path = image(&dir, "old.img", 8_519_680, None);
        let mut disk = HardDisk::new(path, 4);
        disk.probe(&mut host).unwrap();
        assert!(!disk.hd1k);
        assert_eq!(disk.slice_sectors, HD512_SLICE_SECTORS);
        assert_eq!(disk.media_id(&mut host).unwrap(), media::HD);
    }

    #[test]
    fn file_backed_round_trip_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let mut host = TestHost::new();
        let path = image(&dir, "rw.img", 8 * 1024 * 1024, None);
        let pattern: Vec<u8> = (0..SECTOR_SIZE).map(|i| (i ^ 0x5A) as u8).collect();

        let mut disk = HardDisk::new(path.clone(), 4);
        disk.lba = 9;
        assert_eq!(disk.write(&mut host, &pattern).unwrap(), 1);
        assert_eq!(disk.lba, 10);
        disk.close(&mut host);

        let raw = std::fs::read(&path).unwrap();
        assert_eq!(&raw[9 * SECTOR_SIZE..10 * SECTOR_SIZE], &pattern[..]);

        let mut reopened = HardDisk::new(path, 4);
        reopened.lba = 9;
        let back = reopened.read(&mut host, 1).unwrap();
        assert_eq!(back, pattern);
        assert_eq!(reopened.lba, 10);
    }

    #[test]
    fn unit_projection() {
        let mut set = DiskSet::new();
        set.md[0] = MemDisk { first_bank: 0x81, bank_count: 8, is_rom: false, lba: 0, enabled: true };
        set.md[1] = MemDisk { first_bank: 0x04, bank_count: 12, is_rom: true, lba: 0, enabled: true };
        set.hd[0] = Some(HardDisk::new(PathBuf::from("hd0.img"), 4));
        set.hd[3] = Some(HardDisk::new(PathBuf::from("hd3.img"), 4));

        assert_eq!(set.resolve(0), Some(Unit::Mem(0)));
        assert_eq!(set.resolve(1), Some(Unit::Mem(1)));
        assert_eq!(set.resolve(2), Some(Unit::Hard(0)));
        assert_eq!(set.resolve(5), Some(Unit::Hard(3)));
        assert_eq!(set.resolve(3), None);
        assert_eq!(set.resolve(0x80), Some(Unit::Mem(0)));
        assert_eq!(set.resolve(0x87), Some(Unit::Mem(1)));
        assert_eq!(set.resolve(0xC3), Some(Unit::Mem(1)));
        assert_eq!(set.resolve(0x93), Some(Unit::Hard(3)));
        assert_eq!(set.resolve(0x40), None);
    }

    #[test]
    fn slice_offsets_for_bare_hd1k() {
        let dir = tempfile::tempdir().unwrap();
        let mut host = TestHost::new();
        let path = image(&dir, "slice.img", 8 * 1024 * 1024, None);
        let mut set = DiskSet::new();
        set.hd[0] = Some(HardDisk::new(path, 4));

        let (lba, attrs, media_id) = set.slice_offset(&mut host, 2, 0).unwrap();
        assert_eq!((lba, attrs, media_id), (0, ATTR_HIGH_CAPACITY, media::HDNEW));
        let (lba, _, _) = set.slice_offset(&mut host, 2, 1).unwrap();
        assert_eq!(lba, HD1K_SLICE_SECTORS);
    }
}
