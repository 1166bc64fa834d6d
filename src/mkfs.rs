//! The `mkfs.newfs` tool creates a filesystem on a device.

use crate::error;
use newfs::NewFs;
use newfs::util::ByteSize;
use std::env::ArgsOs;
use std::io;
use std::io::BufRead;
use std::io::Write;
use std::path::PathBuf;
use std::process::exit;

/// Structure storing command line arguments.
#[derive(Default)]
struct Args {
    /// If true, print command line help.
    help: bool,
    /// The volume label.
    label: Option<String>,
    /// The path to the device file on which the filesystem will be created.
    device_path: Option<PathBuf>,
}

fn parse_args(args: ArgsOs) -> Args {
    let mut res: Args = Default::default();
    let mut iter = args;
    while let Some(arg) = iter.next() {
        match arg.to_str() {
            Some("-h" | "--help") => res.help = true,
            Some("-L" | "--label") => {
                res.label = iter.next().and_then(|s| s.into_string().ok());
                if res.label.is_none() {
                    error("mkfs.newfs", "missing label value");
                }
            }
            _ => {
                res.device_path = Some(PathBuf::from(arg));
            }
        }
    }
    res
}

/// Prints command help.
fn print_help() {
    println!();
    println!("Usage:");
    println!(" mkfs.newfs [options] device");
    println!();
    println!("Creates a NewFS filesystem on the given device.");
    println!();
    println!("Options:");
    println!(" -h, --help\tPrints help.");
    println!(" -L, --label <label>\tSets the volume label.");
}

/// Shows `text` and waits for a confirmation on the standard input.
fn confirm(text: &str) -> bool {
    print!("{text}");
    let _ = io::stdout().flush();
    io::stdin()
        .lock()
        .lines()
        .next()
        .and_then(|line| line.ok())
        .map(|line| line.to_lowercase() == "y")
        .unwrap_or(false)
}

pub fn main(args: ArgsOs) {
    let args = parse_args(args);
    if args.help {
        print_help();
        exit(0);
    }
    let device_path = args.device_path.unwrap_or_else(|| {
        error("mkfs.newfs", "specify path to a device");
    });
    let formatted = NewFs::probe(&device_path).unwrap_or_else(|e| {
        error(
            "mkfs.newfs",
            format_args!("{}: {e}", device_path.display()),
        );
    });
    if formatted {
        println!(
            "{} already contains a newfs file system",
            device_path.display()
        );
        if !confirm("Proceed anyway? (y/N) ") {
            eprintln!("Abort.");
            exit(1);
        }
    }
    let mut fs = NewFs::format(&device_path, args.label.as_deref()).unwrap_or_else(|e| {
        error(
            "mkfs.newfs",
            format_args!("failed to create filesystem: {e}"),
        );
    });

    let blk = fs.block_size() as u64;
    let sb = fs.superblock();
    let (ino_blks, data_blks) = (sb.ino_blks, sb.data_blks);
    let usage = fs.usage();
    println!("Filesystem UUID: {}", fs.uuid());
    let label = fs.label();
    if !label.is_empty() {
        println!("Volume label: {label}");
    }
    println!("Block size: {blk} bytes");
    println!(
        "Inode table: {ino_blks} blocks, {} inodes",
        usage.inodes_total
    );
    println!(
        "Data region: {data_blks} blocks ({})",
        ByteSize(data_blks as u64 * blk)
    );

    fs.unmount().unwrap_or_else(|e| {
        error(
            "mkfs.newfs",
            format_args!("failed to flush filesystem: {e}"),
        );
    });
}
