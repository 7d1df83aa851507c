//! Administrative CLI for `loopstore`: drives the engine end-to-end by hand,
//! standing in for the excluded HTTP layer.

use std::fs::File;
use std::io::{self, Read, Write};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{crate_version, App, Arg, SubCommand};

use loopstore::process::HostSystemOps;
use loopstore::{BlobStore, LoopBlobStore, StoreConfig};

fn load_config(root: Option<&str>, config_file: Option<&str>) -> Result<StoreConfig> {
    if let Some(path) = config_file {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path))?;
        return StoreConfig::from_toml_str(&raw);
    }
    let root = root.context("either --root or --config is required")?;
    Ok(StoreConfig::new(PathBuf::from(root)))
}

fn main() -> Result<()> {
    env_logger::init();

    let matches = App::new("loopstore-cli")
        .version(crate_version!())
        .author("Loopstore Developers")
        .about("Administers a content-addressable, loop-image-backed blob store")
        .arg(
            Arg::with_name("root")
                .long("root")
                .value_name("PATH")
                .help("Storage root (uses defaults for all other settings)")
                .global(true)
                .takes_value(true),
        )
        .arg(
            Arg::with_name("config")
                .long("config")
                .value_name("FILE")
                .help("TOML config file (overrides --root)")
                .global(true)
                .takes_value(true),
        )
        .subcommand(
            SubCommand::with_name("put")
                .about("Read a blob from stdin or a file, store it, print its fingerprint")
                .arg(Arg::with_name("file").value_name("FILE").help("Defaults to stdin")),
        )
        .subcommand(
            SubCommand::with_name("get")
                .about("Write a blob's content to stdout")
                .arg(Arg::with_name("fingerprint").required(true)),
        )
        .subcommand(
            SubCommand::with_name("info")
                .about("Print a blob's size and creation time")
                .arg(Arg::with_name("fingerprint").required(true)),
        )
        .subcommand(
            SubCommand::with_name("delete")
                .about("Remove a blob")
                .arg(Arg::with_name("fingerprint").required(true)),
        )
        .subcommand(
            SubCommand::with_name("resize")
                .about("Resize a blob's backing image")
                .arg(Arg::with_name("fingerprint").required(true))
                .arg(Arg::with_name("bytes").required(true)),
        )
        .subcommand(
            SubCommand::with_name("disk-usage")
                .about("Print a blob's backing filesystem usage")
                .arg(Arg::with_name("fingerprint").required(true)),
        )
        .get_matches();

    let cfg = load_config(matches.value_of("root"), matches.value_of("config"))?;
    let ops: Arc<dyn loopstore::process::SystemOps> = Arc::new(HostSystemOps);
    let store = LoopBlobStore::new(cfg, ops);

    match matches.subcommand() {
        ("put", Some(sub)) => {
            let fingerprint = match sub.value_of("file") {
                Some(path) => {
                    let mut file = File::open(path).with_context(|| format!("opening {}", path))?;
                    store.put(&mut file, path)?
                }
                None => {
                    let mut stdin = io::stdin();
                    store.put(&mut stdin, "stdin")?
                }
            };
            println!("{}", fingerprint);
        }
        ("get", Some(sub)) => {
            let fingerprint = sub.value_of("fingerprint").unwrap();
            let mut reader = store.get_stream(fingerprint)?;
            let mut stdout = io::stdout();
            io::copy(&mut reader, &mut stdout)?;
            reader.close()?;
        }
        ("info", Some(sub)) => {
            let fingerprint = sub.value_of("fingerprint").unwrap();
            let info = store.get_info(fingerprint)?;
            println!("fingerprint: {}", info.fingerprint);
            println!("size: {}", info.size);
            println!(
                "created: {}",
                info.created
                    .duration_since(std::time::UNIX_EPOCH)
                    .map(|d| d.as_secs())
                    .unwrap_or(0)
            );
        }
        ("delete", Some(sub)) => {
            store.delete(sub.value_of("fingerprint").unwrap())?;
        }
        ("resize", Some(sub)) => {
            let fingerprint = sub.value_of("fingerprint").unwrap();
            let bytes: u64 = sub
                .value_of("bytes")
                .unwrap()
                .parse()
                .context("bytes must be a non-negative integer")?;
            store.resize(fingerprint, bytes)?;
        }
        ("disk-usage", Some(sub)) => {
            let usage = store.disk_usage(sub.value_of("fingerprint").unwrap())?;
            println!("used: {}", usage.used);
            println!("available: {}", usage.available);
            println!("total: {}", usage.total);
        }
        _ => {
            eprintln!("no subcommand given, try --help");
            std::process::exit(1);
        }
    }

    io::stdout().flush().ok();
    Ok(())
}
