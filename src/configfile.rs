use std::net::SocketAddrV4;
use std::time::Duration;

use config::{Config, File as CFile, FileFormat};
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::filter::{parse_ip_port, FilterSet};
use crate::relay::RelayConfig;

pub const UPSTREAM_PORT_MIN: u16 = 49152;
pub const UPSTREAM_PORT_MAX: u16 = 65535;

const MIN_MTU: usize = 576;

/// Settings as written by the operator, from a JSON file or the command line.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "kebab-case", default)]
pub struct ConfigFile {
    pub listen_devices: Vec<String>,
    pub upstream_device: String,
    pub method: String,
    pub password: String,
    pub verbose: bool,
    pub upstream_port: i64,
    pub filters: Vec<String>,
    pub server: String,
    /// Session idle timeout, seconds.
    pub nat_timeout: u64,
    /// Device read timeout, milliseconds.
    pub read_timeout: u64,
    pub mtu: usize,
}

impl Default for ConfigFile {
    fn default() -> Self {
        Self {
            listen_devices: Vec::new(),
            upstream_device: String::new(),
            method: "plain".into(),
            password: String::new(),
            verbose: false,
            upstream_port: 0,
            filters: Vec::new(),
            server: String::new(),
            nat_timeout: 300,
            read_timeout: 500,
            mtu: 1500,
        }
    }
}

/// Validated settings the relay is built from.
#[derive(Debug, Clone)]
pub struct Settings {
    pub listen_devices: Vec<String>,
    pub upstream_device: String,
    pub method: String,
    pub password: String,
    pub verbose: bool,
    pub upstream_port: u16,
    pub filters: FilterSet,
    pub server: SocketAddrV4,
    pub nat_timeout: Duration,
    pub read_timeout: Duration,
    pub mtu: usize,
}

impl Settings {
    pub fn relay_config(&self) -> RelayConfig {
        let mut config = RelayConfig::new(self.filters.clone(), self.server, self.upstream_port);
        config.nat.idle_timeout = self.nat_timeout;
        config.mtu = self.mtu;
        config
    }
}

pub fn read_config_file(config_file: &str) -> Result<ConfigFile> {
    let defaults = ConfigFile::default();
    let config_builder = Config::builder()
        .set_default("method", defaults.method.clone())
        .and_then(|b| b.set_default("upstream-port", defaults.upstream_port))
        .and_then(|b| b.set_default("nat-timeout", defaults.nat_timeout))
        .and_then(|b| b.set_default("read-timeout", defaults.read_timeout))
        .and_then(|b| b.set_default("mtu", defaults.mtu as u64))
        .map_err(|e| Error::config(format!("defaults: {}", e)))?
        .add_source(CFile::new(config_file, FileFormat::Json));

    let config = config_builder
        .build()
        .map_err(|e| Error::config(format!("read {}: {}", config_file, e)))?;

    config
        .try_deserialize()
        .map_err(|e| Error::config(format!("unpack {}: {}", config_file, e)))
}

/// Checks every field and resolves the upstream port.
pub fn config_sanity_check(config: ConfigFile) -> Result<Settings> {
    if config.filters.is_empty() {
        return Err(Error::config("no filters, provide them with -f [filters]"));
    }
    if config.server.trim().is_empty() {
        return Err(Error::config("no server, provide it with -s [address:port]"));
    }
    if !(0..=u16::MAX as i64).contains(&config.upstream_port) {
        return Err(Error::config(format!(
            "upstream port {} out of range",
            config.upstream_port
        )));
    }
    if config.nat_timeout == 0 {
        return Err(Error::config("nat-timeout must be positive"));
    }
    if config.read_timeout == 0 {
        return Err(Error::config("read-timeout must be positive"));
    }
    if config.mtu < MIN_MTU || config.mtu > u16::MAX as usize {
        return Err(Error::config(format!("mtu {} out of range", config.mtu)));
    }

    let filters = FilterSet::parse(&config.filters)?;
    let server = parse_ip_port(&config.server)
        .map_err(|e| Error::config(format!("server {}: {}", config.server, e)))?;

    let upstream_port = match config.upstream_port {
        0 => random_upstream_port(&filters),
        port => port as u16,
    };

    Ok(Settings {
        listen_devices: config.listen_devices,
        upstream_device: config.upstream_device,
        method: config.method,
        password: config.password,
        verbose: config.verbose,
        upstream_port,
        filters,
        server,
        nat_timeout: Duration::from_secs(config.nat_timeout),
        read_timeout: Duration::from_millis(config.read_timeout),
        mtu: config.mtu,
    })
}

/// Draws candidates from `next` until one collides with no filter port.
pub fn select_upstream_port(filters: &FilterSet, mut next: impl FnMut() -> u16) -> u16 {
    loop {
        let port = next();
        if !filters.ports().any(|p| p == port) {
            return port;
        }
    }
}

pub fn random_upstream_port(filters: &FilterSet) -> u16 {
    let mut rng = rand::thread_rng();
    select_upstream_port(filters, || rng.gen_range(UPSTREAM_PORT_MIN..=UPSTREAM_PORT_MAX))
}
