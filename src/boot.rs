//! Boot command parsing and boot-image loading.
//!
//! Both ROM applications and bootable disks carry the same metadata: a
//! 32-byte block at source offset 0x5E0 whose little-endian words at
//! offsets 26/28/30 give the load address, end address and entry point,
//! followed by the payload at 0x600. The dispatcher copies the payload
//! into the user bank and jumps to the entry point.

use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{debug, warn};

use crate::disk::{DiskSet, Unit};
use crate::host::HostIo;
use crate::memory::BankedMemory;

pub const META_OFFSET: u64 = 0x5E0;
pub const PAYLOAD_OFFSET: u64 = 0x600;
const META_LEN: usize = 32;
const META_LOAD: usize = 26;
const META_END: usize = 28;
const META_ENTRY: usize = 30;

/// A ROM application registered in the configuration, bootable by a
/// single-letter key.
#[derive(Clone, Debug)]
pub struct RomApp {
    pub key: char,
    pub name: String,
    pub path: PathBuf,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum BootTarget {
    App(usize),
    Disk { unit: u8, slice: u8 },
}

#[derive(Debug, Error)]
pub enum BootError {
    #[error("no such boot source")]
    NoSource,
    #[error("corrupt boot metadata")]
    BadMetadata,
    #[error("boot payload unreadable")]
    ShortPayload,
    #[error("host i/o failure: {0}")]
    Io(#[from] std::io::Error),
    #[error("disk i/o failure: {0}")]
    Disk(#[from] crate::disk::DiskError),
}

/// Loaded boot image, ready to copy into guest memory.
pub struct BootImage {
    pub load: u16,
    pub end: u16,
    pub entry: u16,
    pub payload: Vec<u8>,
}

/// Parse a boot command: a single letter selects a ROM application by
/// key; `HDn[:s]`, `MDn[:s]` or a bare unit number select a disk.
pub fn parse_command(cmd: &str, apps: &[RomApp]) -> Option<BootTarget> {
    let token = cmd.trim();
    if token.is_empty() {
        return None;
    }
    if token.len() == 1 {
        let ch = token.chars().next().unwrap();
        if ch.is_ascii_alphabetic() {
            return apps
                .iter()
                .position(|app| app.key.eq_ignore_ascii_case(&ch))
                .map(BootTarget::App);
        }
    }
    let (device, slice) = match token.split_once(':') {
        Some((dev, s)) => (dev, s.parse::<u8>().ok()?),
        None => (token, 0),
    };
    let upper = device.to_ascii_uppercase();
    let unit = if let Some(n) = upper.strip_prefix("HD") {
        crate::disk::HD_UNIT_BASE.checked_add(n.parse::<u8>().ok()?)?
    } else if let Some(n) = upper.strip_prefix("MD") {
        let n = n.parse::<u8>().ok()?;
        if n > 1 {
            return None;
        }
        n
    } else {
        device.parse::<u8>().ok()?
    };
    Some(BootTarget::Disk { unit, slice })
}

fn decode_meta(meta: &[u8]) -> Result<(u16, u16, u16), BootError> {
    if meta.len() < META_LEN {
        return Err(BootError::BadMetadata);
    }
    let word = |at: usize| u16::from_le_bytes([meta[at], meta[at + 1]]);
    let (load, end, entry) = (word(META_LOAD), word(META_END), word(META_ENTRY));
    if end < load {
        return Err(BootError::BadMetadata);
    }
    Ok((load, end, entry))
}

fn assemble(meta: &[u8], payload: Vec<u8>) -> Result<BootImage, BootError> {
    let (load, end, entry) = decode_meta(meta)?;
    let wanted = (end - load) as usize;
    if payload.len() < wanted {
        warn!("boot payload short: wanted {} bytes, got {}", wanted, payload.len());
        return Err(BootError::ShortPayload);
    }
    let mut payload = payload;
    payload.truncate(wanted);
    debug!("boot image: load {:04X} end {:04X} entry {:04X}", load, end, entry);
    Ok(BootImage { load, end, entry, payload })
}

/// Boot image from a ROM-application host file.
pub fn image_from_file(host: &dyn HostIo, path: &Path) -> Result<BootImage, BootError> {
    if !host.file_exists(path) {
        return Err(BootError::NoSource);
    }
    let bytes = host.file_load(path)?;
    if bytes.len() < PAYLOAD_OFFSET as usize {
        return Err(BootError::BadMetadata);
    }
    let meta = &bytes[META_OFFSET as usize..META_OFFSET as usize + META_LEN];
    let (load, end, _) = decode_meta(meta)?;
    let avail = bytes.len() - PAYLOAD_OFFSET as usize;
    let take = ((end - load) as usize).min(avail);
    let payload = bytes[PAYLOAD_OFFSET as usize..PAYLOAD_OFFSET as usize + take].to_vec();
    assemble(meta, payload)
}

/// Boot image from a disk unit, honouring the unit's slice geometry.
pub fn image_from_disk(
    mem: &BankedMemory,
    disks: &mut DiskSet,
    host: &mut dyn HostIo,
    unit: u8,
    slice: u8,
) -> Result<BootImage, BootError> {
    match disks.resolve(unit).ok_or(BootError::NoSource)? {
        Unit::Mem(idx) => {
            let md = &disks.md[idx];
            let meta = md.read_bytes(mem, META_OFFSET, META_LEN);
            let (load, end, _) = decode_meta(&meta)?;
            let payload = md.read_bytes(mem, PAYLOAD_OFFSET, (end - load) as usize);
            assemble(&meta, payload)
        }
        Unit::Hard(idx) => {
            let disk = disks.hd[idx].as_mut().ok_or(BootError::NoSource)?;
            let base = disk.slice_lba(host, slice)? as u64 * crate::disk::SECTOR_SIZE as u64;
            let meta = disk.read_at(host, base + META_OFFSET, META_LEN)?;
            let (load, end, _) = decode_meta(&meta)?;
            let payload = disk.read_at(host, base + PAYLOAD_OFFSET, (end - load) as usize)?;
            assemble(&meta, payload)
        }
    }
}

/// Build a bootable image file in memory — the shape the metadata block
/// describes. Used by tests; kept here so the layout stays in one place.
#[cfg(test)]
pub fn synthesize(load: u16, entry: u16, payload: &[u8]) -> Vec<u8> {
    let end = load + payload.len() as u16;
    let mut bytes = vec![0u8; PAYLOAD_OFFSET as usize + payload.len()];
    let meta = META_OFFSET as usize;
    bytes[meta + META_LOAD..meta + META_LOAD + 2].copy_from_slice(&load.to_le_bytes());
    bytes[meta + META_END..meta + META_END + 2].copy_from_slice(&end.to_le_bytes());
    bytes[meta + META_ENTRY..meta + META_ENTRY + 2].copy_from_slice(&entry.to_le_bytes());
    bytes[PAYLOAD_OFFSET as usize..].copy_from_slice(payload);
    bytes
}
