use std::cell::RefCell;
use std::path::PathBuf;
use std::rc::Rc;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use emwbw::boot::RomApp;
use emwbw::disk::DiskSlot;
use emwbw::host::{HostIo, HostPtr, StdHost};
use emwbw::{Configuration, Emulator, ExitReason};

#[derive(Parser)]
#[command(name = "romwbw", about = "RomWBW machine emulator", version)]
struct Args {
    /// RomWBW ROM image to boot.
    rom: PathBuf,

    /// Attach a hard-disk image: N=PATH[:SLICES], N in 0..15, 1..8 slices
    /// (default 4).
    #[arg(long = "disk", value_name = "N=PATH[:SLICES]")]
    disks: Vec<String>,

    /// Register a bootable ROM application: KEY=NAME:PATH.
    #[arg(long = "rom-app", value_name = "KEY=NAME:PATH")]
    rom_apps: Vec<String>,

    /// Verbose diagnostic logging.
    #[arg(long)]
    debug: bool,

    /// Treat any unknown port access as a fatal error.
    #[arg(long)]
    strict_io: bool,

    /// Never block on console input; park the call and keep polling.
    #[arg(long)]
    no_blocking_input: bool,

    /// Console byte that requests a stop (default 0x1D, Ctrl-]).
    #[arg(long, default_value_t = 0x1D)]
    escape_char: u8,

    /// Bytes queued to the console before the machine starts.
    #[arg(long)]
    input: Option<String>,

    /// Arguments visible to guest utilities via the argument-fetch call.
    #[arg(last = true)]
    guest_args: Vec<String>,
}

fn parse_disk(spec: &str) -> Result<DiskSlot> {
    let (unit, rest) = spec
        .split_once('=')
        .with_context(|| format!("disk spec {:?} is not N=PATH[:SLICES]", spec))?;
    let unit: usize = unit.parse().with_context(|| format!("bad disk unit in {:?}", spec))?;
    if unit >= emwbw::disk::HD_SLOTS {
        bail!("disk unit {} out of range 0..{}", unit, emwbw::disk::HD_SLOTS - 1);
    }
    let (path, slices) = match rest.rsplit_once(':') {
        Some((path, tail)) if !tail.is_empty() && tail.bytes().all(|b| b.is_ascii_digit()) => {
            (path, tail.parse::<u8>()?)
        }
        _ => (rest, 4),
    };
    if !(1..=8).contains(&slices) {
        bail!("slice count {} out of range 1..8 in {:?}", slices, spec);
    }
    Ok(DiskSlot { unit, path: PathBuf::from(path), slices })
}

fn parse_rom_app(spec: &str) -> Result<RomApp> {
    let (key, rest) = spec
        .split_once('=')
        .with_context(|| format!("ROM app spec {:?} is not KEY=NAME:PATH", spec))?;
    let key = match key.chars().collect::<Vec<_>>()[..] {
        [ch] if ch.is_ascii_alphabetic() => ch,
        _ => bail!("ROM app key {:?} must be a single letter", key),
    };
    let (name, path) = rest
        .split_once(':')
        .with_context(|| format!("ROM app spec {:?} is missing :PATH", spec))?;
    Ok(RomApp { key, name: name.to_owned(), path: PathBuf::from(path) })
}

fn main() -> Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(if args.debug { "debug" } else { "warn" }));
    tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stderr).init();

    let stop = Arc::new(AtomicBool::new(false));
    let mut config = Configuration::new(args.rom);
    config.strict_io = args.strict_io;
    config.blocking_input = !args.no_blocking_input;
    config.guest_args = args.guest_args;
    config.stop = stop.clone();
    for spec in &args.disks {
        config.disks.push(parse_disk(spec)?);
    }
    for spec in &args.rom_apps {
        config.rom_apps.push(parse_rom_app(spec)?);
    }

    let host = StdHost::new(args.escape_char, stop).context("failed to set up the terminal")?;
    let host: HostPtr = Rc::new(RefCell::new(host));
    if let Some(input) = &args.input {
        let mut host = host.borrow_mut();
        for b in input.bytes() {
            host.queue_char(b as i32);
        }
    }

    let mut emulator = Emulator::new(config, host).context("failed to build the machine")?;
    match emulator.run().context("emulation failed")? {
        ExitReason::Halted => info!("guest halted, exiting"),
        ExitReason::Stopped => info!("stopped by request"),
    }
    Ok(())
}
