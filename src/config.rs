//! Command-line and environment configuration.
//!
//! Every setting can come from a flag or from the environment (a `.env` file
//! is loaded first by the binary).

use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};

use crate::daemon::DaemonConfig;
use crate::error::{CourierError, Result};
use crate::producer::{ProducerConfig, StorageMode};
use crate::server::ServerConfig;
use crate::storage::{StorageResolver, create_s3_store};
use crate::upstream::UpstreamConfig;

#[derive(Debug, Parser)]
#[command(name = "courier")]
#[command(about = "Batch CV upload intake and processing worker", long_about = None)]
pub struct Cli {
    #[command(flatten)]
    pub settings: Settings,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Subcommand)]
pub enum Command {
    /// Accept uploads and queue one job per file
    Serve,
    /// Process queued jobs
    Work,
    /// Serve and work in one process
    Run,
}

#[derive(Debug, Clone, Args)]
pub struct Settings {
    /// PostgreSQL queue database. Without it only `run` works, on an in-process queue.
    #[arg(long, env = "DATABASE_URL", global = true)]
    pub database_url: Option<String>,

    /// Where intake files are kept: `local` or `s3`
    #[arg(long, env = "UPLOAD_STORAGE_TYPE", default_value = "local", global = true)]
    pub storage_type: StorageMode,

    /// Bucket for `s3` storage; also enables resolving `s3://` references
    #[arg(long, env = "S3_BUCKET_NAME", global = true)]
    pub bucket: Option<String>,

    #[arg(long, env = "LOCAL_UPLOAD_PATH", default_value = "uploads", global = true)]
    pub upload_path: PathBuf,

    /// Directory for files fetched from the bucket
    #[arg(long, env = "COURIER_TEMP_DIR", global = true)]
    pub temp_dir: Option<PathBuf>,

    /// Pause after each processed file (milliseconds)
    #[arg(long, env = "WORKER_DELAY_MS", default_value_t = 10_000, global = true)]
    pub worker_delay_ms: u64,

    #[arg(
        long,
        env = "PARSER_URL",
        default_value = "http://localhost:8001/api/cv-to-json",
        global = true
    )]
    pub parser_url: String,

    #[arg(
        long,
        env = "MAIN_SERVER_URL",
        default_value = "http://localhost:5000",
        global = true
    )]
    pub backend_url: String,

    #[arg(long, env = "HOST", default_value = "0.0.0.0", global = true)]
    pub host: String,

    #[arg(long, env = "PORT", default_value_t = 5001, global = true)]
    pub port: u16,

    /// Give up on the in-flight job this many seconds after a shutdown
    /// signal. Unset waits for it to finish.
    #[arg(long, env = "SHUTDOWN_TIMEOUT_SECS", global = true)]
    pub shutdown_timeout_secs: Option<u64>,
}

impl Settings {
    pub fn server_config(&self) -> ServerConfig {
        ServerConfig {
            host: self.host.clone(),
            port: self.port,
            upload_dir: self.upload_path.clone(),
            ..Default::default()
        }
    }

    pub fn producer_config(&self) -> ProducerConfig {
        ProducerConfig {
            storage_mode: self.storage_type,
            ..Default::default()
        }
    }

    pub fn daemon_config(&self) -> DaemonConfig {
        DaemonConfig {
            worker_delay_ms: self.worker_delay_ms,
            upstream: UpstreamConfig {
                parser_url: self.parser_url.clone(),
                backend_url: self.backend_url.clone(),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    pub fn shutdown_timeout(&self) -> Option<Duration> {
        self.shutdown_timeout_secs.map(Duration::from_secs)
    }

    /// Build the storage resolver, connecting to S3 when a bucket is set.
    pub fn resolver(&self) -> Result<StorageResolver> {
        let temp_dir = self
            .temp_dir
            .clone()
            .unwrap_or_else(std::env::temp_dir);
        let resolver = StorageResolver::local(temp_dir);

        match (&self.bucket, self.storage_type) {
            (Some(bucket), _) => Ok(resolver.with_remote(create_s3_store(bucket)?, bucket.clone())),
            (None, StorageMode::S3) => Err(CourierError::Validation(
                "UPLOAD_STORAGE_TYPE=s3 requires S3_BUCKET_NAME".to_string(),
            )),
            (None, StorageMode::Local) => Ok(resolver),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_deployment_values() {
        let cli = Cli::try_parse_from(["courier", "work"]).unwrap();
        assert_eq!(cli.command, Command::Work);

        let daemon = cli.settings.daemon_config();
        assert_eq!(daemon.worker_delay_ms, 10_000);
        assert_eq!(
            daemon.upstream.parser_url,
            "http://localhost:8001/api/cv-to-json"
        );
        assert_eq!(daemon.upstream.parse_timeout_ms, 120_000);

        assert_eq!(cli.settings.shutdown_timeout(), None);

        let server = cli.settings.server_config();
        assert_eq!(server.port, 5001);
        assert_eq!(server.max_file_size, 50 * 1024 * 1024);
    }

    #[test]
    fn test_flags_override_defaults() {
        let cli = Cli::try_parse_from([
            "courier",
            "serve",
            "--storage-type",
            "s3",
            "--port",
            "8080",
            "--worker-delay-ms",
            "0",
            "--shutdown-timeout-secs",
            "30",
        ])
        .unwrap();
        assert_eq!(cli.settings.storage_type, StorageMode::S3);
        assert_eq!(cli.settings.server_config().port, 8080);
        assert_eq!(cli.settings.daemon_config().worker_delay_ms, 0);
        assert_eq!(
            cli.settings.shutdown_timeout(),
            Some(Duration::from_secs(30))
        );

        // s3 mode without a bucket cannot build a resolver
        assert!(matches!(
            cli.settings.resolver(),
            Err(CourierError::Validation(_))
        ));
    }
}
