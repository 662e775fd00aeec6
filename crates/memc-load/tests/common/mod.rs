//! Shared fixtures for memc-load integration tests
//!
//! Source files are written as real gzip files into a temporary directory;
//! every device type routes to one [`ScriptedCache`].
#![allow(dead_code)]

use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use flate2::write::GzEncoder;
use flate2::Compression;
use memc_load::config::LoadConfig;
use memc_load::endpoints::EndpointTable;
use memc_load::pipeline::RunCoordinator;
use memc_load::retry::{BackoffPolicy, NoJitter};
use memc_load::testing::ScriptedCache;
use memc_load::writer::{CacheWriter, DryRunRecorder};

pub const DEVICE_TYPES: [&str; 4] = ["idfa", "gaid", "adid", "dvid"];

/// Write `lines` into `dir/name` as a gzip file
pub fn write_gz(dir: &Path, name: &str, lines: &[String]) -> PathBuf {
    let path = dir.join(name);
    let file = File::create(&path).expect("Failed to create fixture");
    let mut encoder = GzEncoder::new(file, Compression::default());
    for line in lines {
        writeln!(encoder, "{}", line).expect("Failed to write fixture line");
    }
    encoder.finish().expect("Failed to finish gzip stream");
    path
}

/// `count` well-formed lines cycling through the device types
pub fn valid_lines(count: usize) -> Vec<String> {
    (0..count)
        .map(|i| {
            let dev_type = DEVICE_TYPES[i % DEVICE_TYPES.len()];
            format!("{dev_type}\tdev{i:06}\t{}.5\t-{}.25\t{},{},{}", i % 90, i % 180, i, i + 1, i + 2)
        })
        .collect()
}

/// Config reading `*.tsv.gz` from `dir`, with defaults otherwise
pub fn config_for(dir: &Path) -> LoadConfig {
    LoadConfig {
        pattern: format!("{}/.*.tsv.gz", dir.display()),
        retry: BackoffPolicy::immediate(),
        ..LoadConfig::default()
    }
}

pub fn table_for(cache: &Arc<ScriptedCache>) -> EndpointTable {
    let mut table = EndpointTable::new();
    for (i, dev_type) in DEVICE_TYPES.iter().enumerate() {
        table.insert(*dev_type, format!("127.0.0.1:{}", 33013 + i), cache.clone());
    }
    table
}

pub fn coordinator(config: LoadConfig, cache: &Arc<ScriptedCache>) -> RunCoordinator {
    let writer = CacheWriter::new(config.retry.clone(), Arc::new(NoJitter));
    RunCoordinator::new(Arc::new(config), Arc::new(table_for(cache)), writer)
}

pub fn coordinator_with_recorder(
    config: LoadConfig,
    cache: &Arc<ScriptedCache>,
    recorder: Arc<dyn DryRunRecorder>,
) -> RunCoordinator {
    let writer = CacheWriter::new(config.retry.clone(), Arc::new(NoJitter)).with_recorder(recorder);
    RunCoordinator::new(Arc::new(config), Arc::new(table_for(cache)), writer)
}
