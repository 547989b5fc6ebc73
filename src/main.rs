use clap::*;
use clap_num::number_range;
use log::{error, info, LevelFilter};
use serde_json::json;
use std::path::Path;
use vmdk_stream::header::{
    FLAG_COMPRESSED, FLAG_EMBEDDED_LBA, FLAG_USE_REDUNDANT, FLAG_VALID_NEWLINE_DETECTOR,
};
use vmdk_stream::{copy_disk, descriptor::DescriptorInfo, Disk};

/// toolsVersion recorded in the descriptor when none is given;
/// 2^31-1 means "unknown".
const DEFAULT_TOOLS_VERSION: &str = "2147483647";

fn parse_compression_level(s: &str) -> Result<u32, String> {
    number_range(s, 1, 9)
}

fn parse_thread_count(s: &str) -> Result<usize, String> {
    number_range(s, 1, 1024)
}

/// Reads a numeric environment variable, ignoring anything out of range.
fn env_number(name: &str, min: u64, max: u64) -> Option<u64> {
    let value = std::env::var(name).ok()?;
    let n = value.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

fn print_info(disk: &Disk, detailed: bool) -> vmdk_stream::Result<()> {
    let capacity = disk.capacity();
    let mut used = 0u64;
    let mut end = 0u64;
    loop {
        match disk.next_data(end) {
            Ok((pos, span_end)) => {
                used += span_end - pos;
                end = span_end;
            }
            Err(vmdk_stream::DiskError::NoData) => break,
            Err(e) => return Err(e),
        }
    }
    let mut report = json!({ "capacity": capacity, "used": used });
    if detailed {
        if let Disk::Sparse(sparse) = disk {
            let hdr = sparse.header();
            report["sparseHeader"] = json!({
                "version": hdr.version,
                "flags": hdr.flags,
                "flagsDecoded": {
                    "validNewlineDetector": hdr.flags & FLAG_VALID_NEWLINE_DETECTOR != 0,
                    "useRedundant": hdr.flags & FLAG_USE_REDUNDANT != 0,
                    "compressed": hdr.flags & FLAG_COMPRESSED != 0,
                    "embeddedLBA": hdr.flags & FLAG_EMBEDDED_LBA != 0,
                },
                "numGTEsPerGT": hdr.num_gtes_per_gt,
                "compressAlgorithm": hdr.compress_algorithm,
                "uncleanShutdown": hdr.unclean_shutdown,
                "grainSize": hdr.grain_size,
                "grainSizeBytes": hdr.grain_bytes(),
                "descriptorOffset": hdr.descriptor_offset,
                "descriptorSize": hdr.descriptor_size,
                "rgdOffset": hdr.rgd_offset,
                "gdOffset": hdr.gd_offset,
                "overHead": hdr.over_head,
            });
            if let Some(text) = sparse.embedded_descriptor()? {
                if let Ok(desc) = text.parse::<DescriptorInfo>() {
                    report["descriptor"] = json!({
                        "cid": format!("{:08x}", desc.cid),
                        "createType": desc.create_type,
                        "capacitySectors": desc.capacity_sectors(),
                        "toolsVersion": desc.tools_version,
                        "adapterType": desc.adapter_type,
                    });
                }
            }
        } else {
            report["error"] = json!("detailed information is only available for sparse VMDK files");
        }
    }
    println!("{report}");
    Ok(())
}

fn main() {
    let matches = Command::new("vmdkconvert")
        .version(crate_version!())
        .author(crate_authors!())
        .about("Convert disks to and from the stream-optimized sparse VMDK format.")
        .arg(
            Arg::new("source")
                .value_parser(value_parser!(String))
                .required(true)
                .help("The source disk (sparse VMDK or raw image)."),
        )
        .arg(
            Arg::new("dest")
                .value_parser(value_parser!(String))
                .required(false)
                .help("The destination disk; a '.vmdk' suffix selects the stream-optimized format, anything else a raw image."),
        )
        .arg(
            Arg::new("info")
                .short('i')
                .long("info")
                .action(ArgAction::SetTrue)
                .help("Display capacity and used space of the source disk as JSON."),
        )
        .arg(
            Arg::new("detailed")
                .long("detailed")
                .action(ArgAction::SetTrue)
                .requires("info")
                .help("Include decoded sparse extent header information (only with -i)."),
        )
        .arg(
            Arg::new("compression_level")
                .short('c')
                .long("compression-level")
                .value_parser(parse_compression_level)
                .help("Deflate level from 1 (fastest) to 9 (best), used when writing a VMDK. Defaults to 9."),
        )
        .arg(
            Arg::new("num_threads")
                .short('n')
                .long("num-threads")
                .value_parser(parse_thread_count)
                .help("Number of compression workers, used when writing a VMDK. Defaults to the number of CPUs."),
        )
        .arg(
            Arg::new("tools_version")
                .short('t')
                .long("tools-version")
                .value_parser(value_parser!(String))
                .help("Numeric tools version recorded in the destination descriptor."),
        )
        .arg(
            Arg::new("log_level")
                .short('l')
                .long("log-level")
                .value_parser(["error", "warn", "info", "debug", "trace"])
                .default_value("info")
                .help("Set the log verbosity level"),
        )
        .get_matches();

    let log_level_str = matches.get_one::<String>("log_level").unwrap();
    let level_filter = match log_level_str.as_str() {
        "error" => LevelFilter::Error,
        "warn" => LevelFilter::Warn,
        "info" => LevelFilter::Info,
        "debug" => LevelFilter::Debug,
        "trace" => LevelFilter::Trace,
        _ => LevelFilter::Info,
    };
    env_logger::Builder::new().filter_level(level_filter).init();

    // Command-line values win over the environment, which wins over the
    // built-in defaults.
    let compression_level = matches
        .get_one::<u32>("compression_level")
        .copied()
        .or_else(|| env_number("VMDKCONVERT_COMPRESSION_LEVEL", 1, 9).map(|n| n as u32))
        .unwrap_or(9);
    let num_threads = matches
        .get_one::<usize>("num_threads")
        .copied()
        .or_else(|| env_number("VMDKCONVERT_NUM_THREADS", 1, 1024).map(|n| n as usize))
        .unwrap_or_else(|| {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        });
    let tools_version = matches
        .get_one::<String>("tools_version")
        .cloned()
        .unwrap_or_else(|| DEFAULT_TOOLS_VERSION.to_string());
    if tools_version.is_empty() || !tools_version.bytes().all(|b| b.is_ascii_digit()) {
        error!("invalid tools version: {tools_version}");
        std::process::exit(1);
    }

    let source = matches.get_one::<String>("source").unwrap();
    let src = match Disk::open(Path::new(source)) {
        Ok(disk) => disk,
        Err(e) => {
            error!("Cannot open source disk {source}: {e}");
            std::process::exit(1);
        }
    };

    if matches.get_flag("info") {
        if let Err(e) = print_info(&src, matches.get_flag("detailed")) {
            error!("Cannot inspect {source}: {e}");
            std::process::exit(1);
        }
        return;
    }

    let dest = match matches.get_one::<String>("dest") {
        Some(dest) => dest,
        None => {
            error!("a destination disk is required unless -i is given");
            std::process::exit(1);
        }
    };
    let capacity = src.capacity();
    let dst = if dest.ends_with(".vmdk") {
        Disk::create_stream_optimized(
            Path::new(dest),
            capacity,
            compression_level,
            &tools_version,
        )
    } else {
        Disk::create_flat(Path::new(dest), capacity)
    };
    let dst = match dst {
        Ok(disk) => disk,
        Err(e) => {
            error!("Cannot create target disk {dest}: {e}");
            std::process::exit(1);
        }
    };

    info!(
        "Converting {} ({}) to {} ({}) using compression level {} and {} threads",
        source,
        src.kind(),
        dest,
        dst.kind(),
        compression_level,
        num_threads
    );
    match copy_disk(&src, dst, num_threads) {
        Ok(copied) => info!("Success, {copied} bytes copied"),
        Err(e) => {
            error!("Conversion failed: {e}");
            std::process::exit(1);
        }
    }
}
