//! The `mkfs-bitsfs` tool creates a bitsfs filesystem on a device.

use std::env;
use std::fs::OpenOptions;
use std::process::exit;

use bitsfs::device::FileDisk;
use bitsfs::mkfs;

/// Command line arguments.
#[derive(Default)]
struct Args {
    /// The name of the current program used in command line.
    prog: String,
    /// If true, print command line help.
    help: bool,
    /// The path to the device file on which the filesystem will be created.
    device_path: Option<String>,
}

fn parse_args() -> Args {
    let mut args: Args = Default::default();
    let mut iter = env::args();

    args.prog = iter.next().unwrap_or_else(|| "mkfs-bitsfs".to_owned());

    for arg in iter {
        match arg.as_str() {
            "-h" | "--help" => args.help = true,
            _ => {
                args.device_path = Some(arg);
            }
        }
    }

    args
}

fn main() {
    env_logger::init();
    let args = parse_args();

    if args.help {
        println!("usage: {} <device>", args.prog);
        exit(0);
    }

    let device_path = args.device_path.unwrap_or_else(|| {
        eprintln!("{}: specify path to a device", args.prog);
        exit(1);
    });

    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .open(&device_path)
        .unwrap_or_else(|e| {
            eprintln!("{}: {}: {}", args.prog, device_path, e);
            exit(1);
        });

    let dev = FileDisk::new(file).unwrap_or_else(|e| {
        eprintln!("{}: {}: {}", args.prog, device_path, e);
        exit(1);
    });

    if let Err(e) = mkfs::format(dev.as_ref()) {
        eprintln!("{}: failed to create filesystem: {}", args.prog, e);
        exit(1);
    }
}
