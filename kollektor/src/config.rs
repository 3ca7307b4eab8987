//! Command-line parsing and the validated [`Config`] the rest of the program
//! consumes, in the `clap::Parser` style of the teacher's `Opts`/`Args`
//! structs (see `bin/payloadtool.rs`).

use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::str::FromStr;

use clap::Parser;

/// Errors produced while resolving CLI arguments into a [`Config`].
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// The `--address` value is not a valid IP address (spec.md §7 `BindError`).
    #[error("address {0:?} is not a valid IP address")]
    InvalidAddress(String),
    /// The `--metrics-addr` value does not parse as `IP:PORT`.
    #[error("invalid metrics-addr {0:?}: {1}")]
    InvalidMetricsAddr(String, std::net::AddrParseError),
}

fn default_max_bucket_count() -> usize {
    // (1024 - 7) / 2, the fd-budget-derived default from spec.md §6.
    (1024 - 7) / 2
}

#[derive(Parser, Debug)]
#[command(author, version, about = "UDP event aggregator", long_about = None)]
pub struct Args {
    /// bind address
    #[arg(short = 'a', long = "address", default_value = "0.0.0.0")]
    pub address: String,
    /// UDP port
    #[arg(short = 'p', long = "port", default_value_t = 2323)]
    pub port: u16,
    /// output directory
    #[arg(short = 's', long = "storage-path", default_value = ".")]
    pub storage_path: PathBuf,
    /// capacity of the bucket table
    #[arg(short = 'c', long = "max-bucket-count")]
    pub max_bucket_count: Option<usize>,
    /// items per bucket before a size-triggered flush
    #[arg(short = 'n', long = "max-bucket-size", default_value_t = 50)]
    pub max_bucket_size: usize,
    /// idle timeout in seconds
    #[arg(short = 'i', long = "max-bucket-idle", default_value_t = 10)]
    pub max_bucket_idle: u64,
    /// hard TTL in seconds
    #[arg(short = 't', long = "max-bucket-ttl", default_value_t = 60)]
    pub max_bucket_ttl: u64,
    /// optional address to bind a Prometheus metrics exporter to (ambient;
    /// see SPEC_FULL.md §F — disabled when omitted)
    #[arg(long = "metrics-addr")]
    pub metrics_addr: Option<String>,
}

/// Validated, fully-resolved runtime configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub bind_addr: SocketAddr,
    pub storage_path: PathBuf,
    pub max_bucket_count: usize,
    pub max_bucket_size: usize,
    pub max_bucket_idle: std::time::Duration,
    pub max_bucket_ttl: std::time::Duration,
    pub metrics_addr: Option<SocketAddr>,
}

impl Args {
    pub fn into_config(self) -> Result<Config, Error> {
        let ip = IpAddr::from_str(&self.address)
            .map_err(|_| Error::InvalidAddress(self.address.clone()))?;
        let bind_addr = SocketAddr::new(ip, self.port);

        let metrics_addr = match self.metrics_addr {
            None => None,
            Some(raw) => Some(
                SocketAddr::from_str(&raw)
                    .map_err(|e| Error::InvalidMetricsAddr(raw, e))?,
            ),
        };

        Ok(Config {
            bind_addr,
            storage_path: self.storage_path,
            max_bucket_count: self.max_bucket_count.unwrap_or_else(default_max_bucket_count),
            max_bucket_size: self.max_bucket_size,
            max_bucket_idle: std::time::Duration::from_secs(self.max_bucket_idle),
            max_bucket_ttl: std::time::Duration::from_secs(self.max_bucket_ttl),
            metrics_addr,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(extra: &[&str]) -> Args {
        let mut argv = vec!["kollektor"];
        argv.extend_from_slice(extra);
        Args::parse_from(argv)
    }

    #[test]
    fn defaults_match_spec() {
        let config = args(&[]).into_config().expect("valid default config");
        assert_eq!(config.bind_addr, "0.0.0.0:2323".parse().unwrap());
        assert_eq!(config.storage_path, PathBuf::from("."));
        assert_eq!(config.max_bucket_count, (1024 - 7) / 2);
        assert_eq!(config.max_bucket_size, 50);
        assert_eq!(config.max_bucket_idle, std::time::Duration::from_secs(10));
        assert_eq!(config.max_bucket_ttl, std::time::Duration::from_secs(60));
        assert_eq!(config.metrics_addr, None);
    }

    #[test]
    fn rejects_malformed_address() {
        let err = args(&["--address", "not-an-ip"])
            .into_config()
            .unwrap_err();
        assert!(matches!(err, Error::InvalidAddress(_)));
    }

    #[test]
    fn overrides_are_applied() {
        let config = args(&[
            "-a", "127.0.0.1",
            "-p", "9999",
            "-c", "4",
            "-n", "3",
            "-i", "1",
            "-t", "2",
        ])
        .into_config()
        .expect("valid config");
        assert_eq!(config.bind_addr, "127.0.0.1:9999".parse().unwrap());
        assert_eq!(config.max_bucket_count, 4);
        assert_eq!(config.max_bucket_size, 3);
        assert_eq!(config.max_bucket_idle, std::time::Duration::from_secs(1));
        assert_eq!(config.max_bucket_ttl, std::time::Duration::from_secs(2));
    }
}
