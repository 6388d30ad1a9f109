use std::sync::Arc;

use provenance_rs::config::{ConfigOverrides, ProvenanceConfig, StorageOverrides};
use provenance_rs::{PersistentOpenOptions, PersistentStore, Provenance};

fn parse_arg(flag: &str) -> Option<String> {
    let mut args = std::env::args();
    while let Some(arg) = args.next() {
        if arg == flag {
            return args.next();
        }
    }
    None
}

fn has_flag(flag: &str) -> bool {
    std::env::args().any(|arg| arg == flag)
}

fn print_help() {
    eprintln!(
        r#"provenance_gc - Provenance registry garbage collector

USAGE:
    provenance_gc [OPTIONS]

OPTIONS:
    -c, --config <FILE>     Path to config file (TOML)
    -d, --data-dir <DIR>    Override registry data directory
        --repair            Run RocksDB repair before opening
        --resync-cache      Rewrite drifted cache columns after collecting
    -h, --help              Print help

ENVIRONMENT:
    PROVENANCE_CONFIG       Path to config file
    PROVENANCE_DATA_DIR     Registry data directory

CONFIG FILE (provenance.toml):
    data_dir = "/var/lib/provenance"

    [types.CachedSourceableRecord]
    cache_column = "sourced"
"#
    );
}

fn main() -> anyhow::Result<()> {
    if has_flag("-h") || has_flag("--help") {
        print_help();
        return Ok(());
    }

    tracing_subscriber::fmt::init();

    // Build CLI overrides
    let mut overrides = ConfigOverrides::default();
    if let Some(data_dir) = parse_arg("--data-dir").or_else(|| parse_arg("-d")) {
        overrides.data_dir = Some(data_dir.into());
    }
    if has_flag("--repair") {
        overrides.storage = Some(StorageOverrides { repair: Some(true) });
    }

    // Load config: CLI > Env > File > Defaults
    let config_path = parse_arg("--config")
        .or_else(|| parse_arg("-c"))
        .or_else(|| std::env::var("PROVENANCE_CONFIG").ok());
    let config = ProvenanceConfig::load(config_path.as_deref(), overrides)?;

    let data_dir = config
        .data_dir
        .clone()
        .ok_or_else(|| anyhow::anyhow!("no data_dir configured; pass --data-dir"))?;
    let store = PersistentStore::open_with_options(
        &data_dir,
        PersistentOpenOptions::from(&config.storage),
    )?;
    let provenance = Provenance::from_config(Arc::new(store), &config)?;

    let report = provenance.maintain(has_flag("--resync-cache"))?;
    println!("{}", report.gc);
    for failure in &report.gc.failures {
        eprintln!("  {} {}: {}", failure.pass, failure.target, failure.error);
    }
    for (type_name, changed) in &report.resynced {
        println!("{}: resynced {} cache flags", type_name, changed);
    }

    provenance.store().flush()?;

    let code = report.exit_code();
    if code != 0 {
        std::process::exit(code);
    }
    Ok(())
}
