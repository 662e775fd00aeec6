//! memc-load - load "apps installed" logs into memcached

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use clap::{ArgAction, Parser};
use memc_common::logging::{init_logging, LogConfig, LogFormat, LogLevel, LogOutput};
use memc_load::config::{
    self, LoadConfig, DEFAULT_ADID_ADDRESS, DEFAULT_DVID_ADDRESS, DEFAULT_ERROR_RATE_THRESHOLD,
    DEFAULT_GAID_ADDRESS, DEFAULT_IDFA_ADDRESS, DEFAULT_IO_TIMEOUT_MS, DEFAULT_QUEUE_CAPACITY,
    DEFAULT_WORKERS,
};
use memc_load::endpoints::EndpointTable;
use memc_load::pipeline::{RunCoordinator, RunReport, RunVerdict};
use memc_load::retry::{BackoffPolicy, JitterSource, SeededJitter};
use memc_load::writer::CacheWriter;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "memc-load")]
#[command(author, version, about = "Load apps-installed logs into memcached")]
struct Cli {
    /// Log file path, or "stdout"
    #[arg(long, env = "MEMC_LOAD_LOGFILE", default_value = "stdout")]
    logfile: String,

    /// Minimum log level (trace, debug, info, warn, error)
    #[arg(long, env = "MEMC_LOAD_LOGLEVEL", default_value = "info")]
    loglevel: LogLevel,

    /// Log line format (text, json)
    #[arg(long, env = "MEMC_LOAD_LOG_FORMAT", default_value = "text")]
    log_format: LogFormat,

    /// Memcached address for idfa devices
    #[arg(long, env = "MEMC_LOAD_IDFA", default_value = DEFAULT_IDFA_ADDRESS)]
    idfa: String,

    /// Memcached address for gaid devices
    #[arg(long, env = "MEMC_LOAD_GAID", default_value = DEFAULT_GAID_ADDRESS)]
    gaid: String,

    /// Memcached address for adid devices
    #[arg(long, env = "MEMC_LOAD_ADID", default_value = DEFAULT_ADID_ADDRESS)]
    adid: String,

    /// Memcached address for dvid devices
    #[arg(long, env = "MEMC_LOAD_DVID", default_value = DEFAULT_DVID_ADDRESS)]
    dvid: String,

    /// Source files as <dir>/<regex>, e.g. /data/logs/.*.tsv.gz
    #[arg(long, env = "MEMC_LOAD_PATTERN")]
    pattern: Option<String>,

    /// Log what would be written instead of writing
    #[arg(long)]
    dry: bool,

    /// Error rate at or above which the load is declared failed
    #[arg(long, default_value_t = DEFAULT_ERROR_RATE_THRESHOLD)]
    err_rate: f64,

    /// Number of concurrent cache writers
    #[arg(long, env = "MEMC_LOAD_WORKERS", default_value_t = DEFAULT_WORKERS)]
    workers: usize,

    /// Mark processed files with a dot prefix after a successful load
    #[arg(long, action = ArgAction::Set, default_value_t = true)]
    rename: bool,

    /// Capacity of the job and outcome queues
    #[arg(long, default_value_t = DEFAULT_QUEUE_CAPACITY)]
    queue_capacity: usize,

    /// Memcached connect/read/write timeout in milliseconds
    #[arg(long, default_value_t = DEFAULT_IO_TIMEOUT_MS)]
    io_timeout_ms: u64,

    /// Seed for reconnect jitter; random when omitted
    #[arg(long)]
    seed: Option<u64>,

    /// Exit non-zero when the error rate is too high
    #[arg(long)]
    strict_exit: bool,
}

impl Cli {
    fn log_config(&self) -> Result<LogConfig> {
        let base = LogConfig::builder().level(self.loglevel).format(self.log_format);
        let base = if self.logfile.eq_ignore_ascii_case("stdout") {
            base.output(LogOutput::Console)
        } else {
            base.output(LogOutput::File).log_file(PathBuf::from(&self.logfile))
        };

        // LOG_* variables take precedence over flags
        base.build()
            .merge_env()
            .context("Invalid logging environment")
    }

    fn load_config(&self) -> LoadConfig {
        let device_endpoints = BTreeMap::from([
            ("idfa".to_string(), self.idfa.clone()),
            ("gaid".to_string(), self.gaid.clone()),
            ("adid".to_string(), self.adid.clone()),
            ("dvid".to_string(), self.dvid.clone()),
        ]);

        LoadConfig {
            device_endpoints,
            pattern: self.pattern.clone().unwrap_or_else(config::default_pattern),
            dry_run: self.dry,
            error_rate_threshold: self.err_rate,
            workers: self.workers,
            rename_on_success: self.rename,
            queue_capacity: self.queue_capacity,
            io_timeout_ms: self.io_timeout_ms,
            retry: BackoffPolicy::default(),
            strict_exit: self.strict_exit,
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let _guard = match cli.log_config().and_then(|c| init_logging(&c).map_err(Into::into)) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("Error: cannot initialise logging: {:#}", e);
            return ExitCode::from(2);
        },
    };

    let started = Instant::now();
    let config = cli.load_config();
    let strict_exit = config.strict_exit;

    let code = match run(config, cli.seed).await {
        Ok(report) => match report.verdict {
            RunVerdict::Failed { .. } if strict_exit => ExitCode::FAILURE,
            _ => ExitCode::SUCCESS,
        },
        Err(e) => {
            error!(error = %e, "Load aborted");
            ExitCode::FAILURE
        },
    };

    info!("Execution time: {:.3}s", started.elapsed().as_secs_f64());
    code
}

async fn run(config: LoadConfig, seed: Option<u64>) -> Result<RunReport> {
    config.validate()?;
    info!(
        pattern = %config.pattern,
        dry_run = config.dry_run,
        workers = config.workers,
        error_rate_threshold = config.error_rate_threshold,
        rename_on_success = config.rename_on_success,
        queue_capacity = config.queue_capacity,
        io_timeout_ms = config.io_timeout_ms,
        endpoints = ?config.device_endpoints,
        "Starting memc-load"
    );

    let table = EndpointTable::connect(&config.device_endpoints, config.workers, config.io_timeout());
    let jitter: Arc<dyn JitterSource> = match seed {
        Some(seed) => Arc::new(SeededJitter::new(seed)),
        None => Arc::new(SeededJitter::from_entropy()),
    };
    let writer = CacheWriter::new(config.retry.clone(), jitter);

    let coordinator = RunCoordinator::new(Arc::new(config), Arc::new(table), writer);
    let report = coordinator.run().await?;

    info!(
        run_id = %report.run_id,
        state = report.state.as_str(),
        verdict = report.verdict.as_str(),
        processed = report.stats.processed,
        errors = report.stats.errors,
        files = report.files.len(),
        renamed = report.renamed.len(),
        "Run finished"
    );
    Ok(report)
}
