//! The `dump.newfs` tool prints the metadata and the file tree of a
//! formatted device.

use crate::error;
use newfs::NewFs;
use newfs::inode::DentryRef;
use newfs::layout::FileType;
use newfs::util::ByteSize;
use std::env::ArgsOs;
use std::path::PathBuf;
use std::process::exit;

/// Structure storing command line arguments.
#[derive(Default)]
struct Args {
    /// If true, print command line help.
    help: bool,
    /// The path to the device file to inspect.
    device_path: Option<PathBuf>,
}

fn parse_args(args: ArgsOs) -> Args {
    let mut res: Args = Default::default();
    for arg in args {
        match arg.to_str() {
            Some("-h" | "--help") => res.help = true,
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
    println!(" dump.newfs [options] device");
    println!();
    println!("Prints the superblock, usage counters and file tree of a NewFS device.");
    println!();
    println!("Options:");
    println!(" -h, --help\tPrints help.");
}

/// Prints one line per file, walking the tree depth first. Inodes are
/// loaded on the way, like any other access.
fn list_tree(fs: &mut NewFs, dentry: &DentryRef, depth: usize) {
    let inode = match fs.load_inode(dentry) {
        Ok(inode) => inode,
        Err(e) => {
            eprintln!("dump.newfs: inode {}: {e}", dentry.ino());
            return;
        }
    };
    let node = inode.borrow();
    let tag = match dentry.ftype() {
        FileType::Dir => 'd',
        FileType::Reg => '-',
    };
    println!(
        "#{ino:<4} {tag} {blocks:>2} blk  {pad:indent$}{name}",
        ino = dentry.ino(),
        blocks = node.size(),
        pad = "",
        indent = depth * 2,
        name = dentry.name(),
    );
    if dentry.ftype() == FileType::Dir {
        let children: Vec<_> = (0..).map_while(|i| node.get_dentry(i)).collect();
        drop(node);
        for child in children {
            list_tree(fs, &child, depth + 1);
        }
    }
}

pub fn main(args: ArgsOs) {
    let args = parse_args(args);
    if args.help {
        print_help();
        exit(0);
    }
    let device_path = args.device_path.unwrap_or_else(|| {
        error("dump.newfs", "specify path to a device");
    });
    let formatted = NewFs::probe(&device_path).unwrap_or_else(|e| {
        error(
            "dump.newfs",
            format_args!("{}: {e}", device_path.display()),
        );
    });
    if !formatted {
        error(
            "dump.newfs",
            format_args!("{}: no newfs file system found", device_path.display()),
        );
    }
    let mut fs = NewFs::mount(&device_path).unwrap_or_else(|e| {
        error(
            "dump.newfs",
            format_args!("{}: {e}", device_path.display()),
        );
    });

    let blk = fs.block_size() as u64;
    let usage = fs.usage();
    println!("Filesystem UUID: {}", fs.uuid());
    let label = fs.label();
    if !label.is_empty() {
        println!("Volume label: {label}");
    }
    let sb = fs.superblock();
    println!("Usage counter: {}", sb.sz_usage);
    println!("Inodes: {} used / {} total", usage.inodes_used, usage.inodes_total);
    println!(
        "Blocks: {} used / {} total ({} free)",
        usage.blocks_used,
        usage.blocks_total,
        ByteSize((usage.blocks_total - usage.blocks_used) as u64 * blk)
    );
    println!();
    println!("Region       Offset  Blocks");
    println!(" superblock  {:>6}  {:>6}", sb.sb_offset, sb.sb_blks);
    println!(" inode map   {:>6}  {:>6}", sb.ino_map_offset, sb.ino_map_blks);
    println!(" data map    {:>6}  {:>6}", sb.data_map_offset, sb.data_map_blks);
    println!(" inode table {:>6}  {:>6}", sb.ino_offset, sb.ino_blks);
    println!(" data        {:>6}  {:>6}", sb.data_offset, sb.data_blks);
    println!();

    // walking the tree only reads; the device is left untouched
    let root = fs.root();
    list_tree(&mut fs, &root, 0);
}
