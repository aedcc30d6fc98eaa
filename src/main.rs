use clap::*;
use clap_num::maybe_hex;
use exhume_vmdk::{check, Vmdk};
use log::{debug, error, info, LevelFilter};
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};

fn process_image(file_path: &str, offset: u64, size: Option<u64>, partitions: bool, json: bool) {
    info!("Processing the VMDK image '{}'...", file_path);
    let mut file = match File::open(file_path) {
        Ok(file) => file,
        Err(err) => {
            error!("Error: {}", err);
            std::process::exit(1);
        }
    };

    match check(&mut file) {
        Ok(true) => {}
        Ok(false) => {
            error!("'{}' is not a VMDK sparse extent.", file_path);
            std::process::exit(1);
        }
        Err(err) => {
            error!("Error: {}", err);
            std::process::exit(1);
        }
    }

    let mut vmdk = match Vmdk::open(file) {
        Ok(vmdk) => vmdk,
        Err(err) => {
            error!("Error: {}", err);
            std::process::exit(1);
        }
    };

    info!("------------------------------------------------------------");
    info!("Selected format: VMDK (stream-optimized)");
    info!("Description: VMDK (Virtual Machine Disk) file.");
    info!("Create type: {}", vmdk.descriptor().create_type);
    info!("CID: {}", vmdk.descriptor().cid);
    info!("Capacity: {} bytes", vmdk.size());
    debug!("------------------------------------------------------------");

    if partitions {
        let table = match vmdk.partition_table() {
            Ok(table) => table,
            Err(err) => {
                error!("Error: {}", err);
                std::process::exit(1);
            }
        };
        let partition_list = table.partitions();
        if json {
            println!("{}", serde_json::to_string_pretty(&partition_list).unwrap());
        } else {
            for partition in &partition_list {
                println!(
                    "{}\tstart_sector={}\tsectors={}\tbootable={}\ttype={:?}",
                    partition.name,
                    partition.start_sector,
                    partition.sector_count,
                    partition.bootable,
                    partition.type_code,
                );
            }
        }
    }

    if let Some(size) = size {
        vmdk.seek(SeekFrom::Start(offset)).unwrap();
        let mut bytes = vec![0u8; size as usize];
        vmdk.read(&mut bytes).unwrap();
        let result = String::from_utf8_lossy(&bytes);
        println!("{}", result);
    }
}

fn main() {
    let matches = Command::new("exhume_vmdk")
        .version(crate_version!())
        .author(crate_authors!())
        .about("Exhume the contents of a stream-optimized VMDK disk image.")
        .arg(
            Arg::new("body")
                .short('b')
                .long("body")
                .value_parser(value_parser!(String))
                .required(true)
                .help("The path to the VMDK image to exhume."),
        )
        .arg(
            Arg::new("offset")
                .short('o')
                .long("offset")
                .value_parser(maybe_hex::<u64>)
                .required(false)
                .help("Read at a specific offset on the virtual disk."),
        )
        .arg(
            Arg::new("size")
                .short('s')
                .long("size")
                .value_parser(maybe_hex::<u64>)
                .required(false)
                .help("The size (in bytes) to read."),
        )
        .arg(
            Arg::new("partitions")
                .short('p')
                .long("partitions")
                .action(ArgAction::SetTrue)
                .help("Discover and print the partition table."),
        )
        .arg(
            Arg::new("json")
                .short('j')
                .long("json")
                .action(ArgAction::SetTrue)
                .help("Print the partition table as JSON."),
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

    let file_path = matches.get_one::<String>("body").unwrap();
    let offset = matches.get_one::<u64>("offset").unwrap_or(&0);
    let size = matches.get_one::<u64>("size").copied();
    let partitions = matches.get_flag("partitions");
    let json = matches.get_flag("json");

    process_image(file_path, *offset, size, partitions, json);
}
