//! ROM image loading and the HBIOS Configuration Block.
//!
//! The HCB is a 256-byte block at 0x0100 in every bank that is prepared
//! for execution. The fields this machine maintains:
//!
//!   +0x0C  device count (assigned drive letters)
//!   +0x12  APITYPE (0 = HBIOS; 0xFF would mean UNA and is rejected by
//!          client utilities, so the loader patches it before anything
//!          else sees the block)
//!   +0x20  drive map, 16 bytes, (slice << 4) | unit, 0xFF unassigned
//!   +0x60  disk unit table, 16 entries of {type, unit, attributes, 0}
//!   +0xD8  bank topology: common/user/bios/aux banks, RAM-disk and
//!          ROM-disk bank ranges, application bank range
//!
//! The ident block ('W', ~'W', packed version) is written to 0xFE00 and
//! 0xFF00 in the common area with a pointer at 0xFFFC, then frozen.

use std::path::Path;

use tracing::{debug, info};

use crate::disk::{DiskSet, MemDisk, ATTR_HIGH_CAPACITY};
use crate::host::HostIo;
use crate::memory::{BankedMemory, ROM_SIZE, SHADOW_BANK};
use crate::CoreError;

pub const HCB_BASE: u16 = 0x0100;
pub const HCB_DEVCNT: u16 = HCB_BASE + 0x0C;
pub const HCB_APITYPE: u16 = HCB_BASE + 0x12;
pub const HCB_DRIVEMAP: u16 = HCB_BASE + 0x20;
pub const HCB_UNITTAB: u16 = HCB_BASE + 0x60;
pub const HCB_TOPOLOGY: u16 = HCB_BASE + 0xD8;

pub const APITYPE_HBIOS: u8 = 0x00;

pub const DEV_MD: u8 = 0x00;
pub const DEV_HDSK: u8 = 0x09;

pub const DRIVE_LETTERS: usize = 16;
pub const UNIT_ENTRIES: usize = 16;

pub const IDENT_LO: u16 = 0xFE00;
pub const IDENT_HI: u16 = 0xFF00;
pub const IDENT_PTR: u16 = 0xFFFC;
pub const VERSION_MAJOR: u8 = 3;
pub const VERSION_MINOR: u8 = 5;
pub const VERSION_BYTE: u8 = (VERSION_MAJOR << 4) | VERSION_MINOR;

/// Bank assignments read from (or defaulted into) the HCB.
#[derive(Clone, Copy, Debug)]
pub struct BankTopology {
    pub common: u8,
    pub user: u8,
    pub bios: u8,
    pub aux: u8,
    pub ramdisk_first: u8,
    pub ramdisk_count: u8,
    pub romdisk_first: u8,
    pub romdisk_count: u8,
    pub app_first: u8,
    pub app_count: u8,
}

impl Default for BankTopology {
    fn default() -> Self {
        BankTopology {
            common: 0x8F,
            user: 0x8E,
            bios: 0x80,
            aux: 0x8D,
            ramdisk_first: 0x81,
            ramdisk_count: 8,
            romdisk_first: 0x04,
            romdisk_count: 12,
            app_first: 0x89,
            app_count: 4,
        }
    }
}

impl BankTopology {
    fn to_bytes(self) -> [u8; 10] {
        [
            self.common,
            self.user,
            self.bios,
            self.aux,
            self.ramdisk_first,
            self.ramdisk_count,
            self.romdisk_first,
            self.romdisk_count,
            self.app_first,
            self.app_count,
        ]
    }

    fn from_bytes(b: [u8; 10]) -> Self {
        BankTopology {
            common: b[0],
            user: b[1],
            bios: b[2],
            aux: b[3],
            ramdisk_first: b[4],
            ramdisk_count: b[5],
            romdisk_first: b[6],
            romdisk_count: b[7],
            app_first: b[8],
            app_count: b[9],
        }
    }
}

/// Load the ROM image into the ROM banks. A missing, empty or oversized
/// image is fatal.
pub fn load_rom_file(mem: &mut BankedMemory, host: &dyn HostIo, path: &Path) -> Result<(), CoreError> {
    if !host.file_exists(path) {
        return Err(CoreError::RomMissing(path.to_path_buf()));
    }
    let image = host.file_load(path)?;
    if image.is_empty() {
        return Err(CoreError::RomEmpty(path.to_path_buf()));
    }
    if image.len() > ROM_SIZE {
        return Err(CoreError::RomTooLarge(path.to_path_buf(), image.len()));
    }
    info!("loaded ROM {} ({} bytes)", path.display(), image.len());
    mem.load_rom(&image);
    Ok(())
}

/// Prepare the machine after the ROM is in place: patch the APITYPE, seed
/// the working RAM bank, write the ident block, populate the HCB tables
/// and bring up the memory disks from the bank topology.
pub fn install(mem: &mut BankedMemory, disks: &mut DiskSet) -> BankTopology {
    mem.write_bank(0x00, HCB_APITYPE, APITYPE_HBIOS);

    // Page zero and HCB into the working RAM bank.
    for offset in 0..0x200u16 {
        mem.write_bank(SHADOW_BANK, offset, mem.read_bank(0x00, offset));
    }

    write_ident(mem);
    let topology = resolve_topology(mem);
    init_mem_disks(&topology, disks);
    build_unit_table(mem, disks);
    build_drive_map(mem, disks);

    // The tables went into ROM bank 0's HCB; refresh the RAM copy.
    for offset in HCB_BASE..HCB_BASE + 0x100 {
        mem.write_bank(SHADOW_BANK, offset, mem.read_bank(0x00, offset));
    }

    mem.lock_ident();
    topology
}

fn write_ident(mem: &mut BankedMemory) {
    for base in [IDENT_LO, IDENT_HI] {
        mem.store(base, b'W');
        mem.store(base + 1, !b'W');
        mem.store(base + 2, VERSION_BYTE);
    }
    mem.store(IDENT_PTR, (IDENT_HI & 0xFF) as u8);
    mem.store(IDENT_PTR + 1, (IDENT_HI >> 8) as u8);
}

/// Topology from the ROM's HCB, falling back to this machine's defaults
/// when the image carries none. The common-bank field is the sanity
/// anchor: anything but 0x8F there means the block is unset (zeroed or
/// unprogrammed 0xFF fill).
fn resolve_topology(mem: &mut BankedMemory) -> BankTopology {
    let mut raw = [0u8; 10];
    for (i, slot) in raw.iter_mut().enumerate() {
        *slot = mem.read_bank(0x00, HCB_TOPOLOGY + i as u16);
    }
    if raw[0] != 0x8F {
        let defaults = BankTopology::default();
        for (i, b) in defaults.to_bytes().iter().enumerate() {
            mem.write_bank(0x00, HCB_TOPOLOGY + i as u16, *b);
        }
        debug!("ROM HCB carries no bank topology, using defaults");
        defaults
    } else {
        BankTopology::from_bytes(raw)
    }
}

fn init_mem_disks(topology: &BankTopology, disks: &mut DiskSet) {
    disks.md[0] = MemDisk {
        first_bank: topology.ramdisk_first,
        bank_count: topology.ramdisk_count,
        is_rom: false,
        lba: 0,
        enabled: topology.ramdisk_count > 0,
    };
    disks.md[1] = MemDisk {
        first_bank: topology.romdisk_first,
        bank_count: topology.romdisk_count,
        is_rom: true,
        lba: 0,
        enabled: topology.romdisk_count > 0,
    };
}

fn build_unit_table(mem: &mut BankedMemory, disks: &DiskSet) {
    let mut entries: Vec<[u8; 4]> = Vec::new();
    for (idx, md) in disks.md.iter().enumerate() {
        if md.enabled {
            entries.push([DEV_MD, idx as u8, 0x00, 0x00]);
        }
    }
    for (idx, slot) in disks.hd.iter().enumerate() {
        if slot.is_some() {
            entries.push([DEV_HDSK, idx as u8, ATTR_HIGH_CAPACITY, 0x00]);
        }
    }
    entries.truncate(UNIT_ENTRIES);
    for slot in 0..UNIT_ENTRIES {
        let entry = entries.get(slot).copied().unwrap_or([0xFF; 4]);
        for (i, b) in entry.iter().enumerate() {
            mem.write_bank(0x00, HCB_UNITTAB + (slot * 4 + i) as u16, *b);
        }
    }
}

fn build_drive_map(mem: &mut BankedMemory, disks: &DiskSet) {
    let mut map = [0xFFu8; DRIVE_LETTERS];
    let mut letter = 0;
    for (idx, md) in disks.md.iter().enumerate() {
        if md.enabled && letter < DRIVE_LETTERS {
            map[letter] = idx as u8;
            letter += 1;
        }
    }
    for (idx, slot) in disks.hd.iter().enumerate() {
        if let Some(disk) = slot {
            let unit = (crate::disk::HD_UNIT_BASE + idx as u8) & 0x0F;
            for slice in 0..disk.slices {
                if letter >= DRIVE_LETTERS {
                    break;
                }
                map[letter] = (slice << 4) | unit;
                letter += 1;
            }
        }
    }
    for (i, b) in map.iter().enumerate() {
        mem.write_bank(0x00, HCB_DRIVEMAP + i as u16, *b);
    }
    mem.write_bank(0x00, HCB_DEVCNT, letter as u8);
    debug!("drive map holds {} letters", letter);
}

/// First-touch preparation of a RAM bank: page zero and HCB from ROM bank
/// 0, with the APITYPE forced to HBIOS.
pub fn seed_ram_bank(mem: &mut BankedMemory, bank: u8) {
    for offset in 0..0x200u16 {
        mem.write_bank(bank, offset, mem.read_bank(0x00, offset));
    }
    mem.write_bank(bank, HCB_APITYPE, APITYPE_HBIOS);
}

/// Convenience for tests and the dispatcher: the ident block readable
/// through the CPU window.
pub fn ident_at(mem: &BankedMemory, base: u16) -> (u8, u8, u8) {
    (mem.fetch(base), mem.fetch(base + 1), mem.fetch(base + 2))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::disk::{DiskSlot, HardDisk};
    use crate::host::testing::TestHost;
    use std::path::PathBuf;

    fn machine_with(hd_slices: &[(usize, u8)]) -> (BankedMemory, DiskSet, BankTopology) {
        let mut mem = BankedMemory::new();
        // Zeroed bank 0 so the topology defaults kick in.
        mem.load_rom(&vec![0u8; 0x8000]);
        let mut disks = DiskSet::new();
        for &(unit, slices) in hd_slices {
            disks.hd[unit] = Some(HardDisk::new(PathBuf::from(format!("hd{}.img", unit)), slices));
        }
        let topology = install(&mut mem, &mut disks);
        (mem, disks, topology)
    }

    #[test]
    fn ident_block_is_written_and_frozen() {
        let (mut mem, _, _) = machine_with(&[]);
        assert_eq!(ident_at(&mem, IDENT_LO), (b'W', !b'W', VERSION_BYTE));
        assert_eq!(ident_at(&mem, IDENT_HI), (b'W', !b'W', VERSION_BYTE));
        assert_eq!(mem.fetch(IDENT_PTR), 0x00);
        assert_eq!(mem.fetch(IDENT_PTR + 1), 0xFF);
        mem.store(IDENT_HI, 0x00);
        assert_eq!(mem.fetch(IDENT_HI), b'W');
    }

    #[test]
    fn apitype_is_patched_everywhere() {
        let (mem, _, _) = machine_with(&[]);
        assert_eq!(mem.read_bank(0x00, HCB_APITYPE), APITYPE_HBIOS);
        assert_eq!(mem.read_bank(SHADOW_BANK, HCB_APITYPE), APITYPE_HBIOS);
    }

    #[test]
    fn topology_defaults_enable_both_memory_disks() {
        let (_, disks, topology) = machine_with(&[]);
        assert_eq!(topology.ramdisk_count, 8);
        assert_eq!(topology.romdisk_count, 12);
        assert!(disks.md[0].enabled && !disks.md[0].is_rom);
        assert!(disks.md[1].enabled && disks.md[1].is_rom);
        // 8 banks of RAM disk, 12 of ROM disk.
        assert_eq!(disks.md[0].size_bytes(), 256 * 1024);
        assert_eq!(disks.md[1].size_bytes(), 384 * 1024);
    }

    #[test]
    fn unit_table_lists_memory_disks_then_hard_disks() {
        let (mem, _, _) = machine_with(&[(0, 4), (2, 4)]);
        let entry = |slot: u16| {
            [
                mem.read_bank(0x00, HCB_UNITTAB + slot * 4),
                mem.read_bank(0x00, HCB_UNITTAB + slot * 4 + 1),
                mem.read_bank(0x00, HCB_UNITTAB + slot * 4 + 2),
                mem.read_bank(0x00, HCB_UNITTAB + slot * 4 + 3),
            ]
        };
        assert_eq!(entry(0), [DEV_MD, 0, 0x00, 0x00]);
        assert_eq!(entry(1), [DEV_MD, 1, 0x00, 0x00]);
        assert_eq!(entry(2), [DEV_HDSK, 0, ATTR_HIGH_CAPACITY, 0x00]);
        assert_eq!(entry(3), [DEV_HDSK, 2, ATTR_HIGH_CAPACITY, 0x00]);
        assert_eq!(entry(4), [0xFF; 4]);
    }

    #[test]
    fn drive_map_assigns_letters_by_slice_and_unit() {
        let (mem, _, _) = machine_with(&[(0, 4)]);
        let expected = [0x00, 0x01, 0x02, 0x12, 0x22, 0x32];
        for (i, &want) in expected.iter().enumerate() {
            assert_eq!(mem.fetch(HCB_DRIVEMAP + i as u16), want, "letter {}", i);
        }
        assert_eq!(mem.fetch(HCB_DRIVEMAP + 6), 0xFF);
        assert_eq!(mem.fetch(HCB_DEVCNT), 6);
    }

    #[test]
    fn seed_ram_bank_copies_page_zero_and_hcb() {
        let mut mem = BankedMemory::new();
        let mut image = vec![0u8; 0x8000];
        image[0x0000] = 0xC3;
        image[0x0150] = 0x77;
        image[(HCB_APITYPE) as usize] = 0xFF;
        mem.load_rom(&image);
        seed_ram_bank(&mut mem, 0x8E);
        assert_eq!(mem.read_bank(0x8E, 0x0000), 0xC3);
        assert_eq!(mem.read_bank(0x8E, 0x0150), 0x77);
        assert_eq!(mem.read_bank(0x8E, HCB_APITYPE), APITYPE_HBIOS);
    }

    #[test]
    fn rom_loading_rejects_bad_images() {
        let dir = tempfile::tempdir().unwrap();
        let host = TestHost::new();
        let mut mem = BankedMemory::new();

        let missing = dir.path().join("nope.rom");
        assert!(matches!(
            load_rom_file(&mut mem, &host, &missing),
            Err(CoreError::RomMissing(_))
        ));

        let empty = dir.path().join("empty.rom");
        std::fs::write(&empty, b"").unwrap();
        assert!(matches!(load_rom_file(&mut mem, &host, &empty), Err(CoreError::RomEmpty(_))));

        let big = dir.path().join("big.rom");
        std::fs::write(&big, vec![0u8; ROM_SIZE + 1]).unwrap();
        assert!(matches!(
            load_rom_file(&mut mem, &host, &big),
            Err(CoreError::RomTooLarge(_, _))
        ));

        let good = dir.path().join("good.rom");
        std::fs::write(&good, vec![0x76u8; 0x100]).unwrap();
        assert!(load_rom_file(&mut mem, &host, &good).is_ok());
        assert_eq!(mem.read_bank(0x00, 0x0000), 0x76);
    }

    #[test]
    fn missing_disk_image_leaves_unit_empty() {
        let host = TestHost::new();
        let slots =
            vec![DiskSlot { unit: 0, path: PathBuf::from("/definitely/not/here.img"), slices: 4 }];
        let set = DiskSet::from_config(&slots, &host);
        assert!(set.hd[0].is_none());
    }
}
