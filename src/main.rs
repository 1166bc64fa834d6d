//! Main of the NewFS tools.
//!
//! The binary is installed once and symlinked under one name per tool,
//! `mkfs.newfs` and `dump.newfs`. When invoked under its own name, the
//! first argument selects the tool.

mod dump;
mod mkfs;

use std::env;
use std::fmt;
use std::path::PathBuf;
use std::process::exit;

/// Writes an error to stderr, then exits.
pub fn error<M: fmt::Display>(bin: &str, msg: M) -> ! {
    eprintln!("{bin}: error: {msg}");
    exit(1);
}

fn main() {
    let mut args = env::args_os();
    let bin = args
        .next()
        .map(PathBuf::from)
        .and_then(|p| {
            p.file_name()
                .and_then(|name| name.to_str())
                .map(str::to_owned)
        })
        .unwrap_or_else(|| {
            error("newfs", "missing binary name");
        });
    match bin.as_str() {
        "mkfs.newfs" => mkfs::main(args),
        "dump.newfs" => dump::main(args),
        _ => match args.next().and_then(|s| s.into_string().ok()).as_deref() {
            Some("mkfs") => mkfs::main(args),
            Some("dump") => dump::main(args),
            _ => error("newfs", "invalid binary name"),
        },
    }
}
