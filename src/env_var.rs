use std::sync::OnceLock;

use serde::Deserialize;

fn default_endpoint_host() -> String {
    "localhost".to_owned()
}

fn default_cores() -> u32 {
    match std::thread::available_parallelism() {
        Ok(n) => n.get() as u32,
        Err(_) => 4,
    }
}

fn default_bound_timeout_ms() -> u64 {
    30_000
}

fn default_unbound_timeout_ms() -> u64 {
    300_000
}

fn default_mpi_host_state_len() -> usize {
    50
}

fn default_result_ttl_secs() -> u64 {
    30
}

fn default_threads() -> usize {
    match std::thread::available_parallelism() {
        Ok(n) => n.get(),
        Err(_) => 4,
    }
}

#[derive(Deserialize, Debug)]
pub struct Config {
    /// Identifier of this host as seen by the rest of the cluster
    #[serde(default = "default_endpoint_host")]
    pub endpoint_host: String,

    /// Number of cores advertised for scheduling, default: hardware parallelism
    #[serde(default = "default_cores")]
    pub cores: u32,

    /// How long a bound executor waits on its function queue before finishing
    #[serde(default = "default_bound_timeout_ms")]
    pub bound_timeout_ms: u64,

    /// How long an unbound executor waits on the bind queue before finishing
    #[serde(default = "default_unbound_timeout_ms")]
    pub unbound_timeout_ms: u64,

    /// Fixed width of the null-padded rank-to-host state buffer, default: 50
    #[serde(default = "default_mpi_host_state_len")]
    pub mpi_host_state_len: usize,

    /// Expiry in seconds applied to function result keys, default: 30
    #[serde(default = "default_result_ttl_secs")]
    pub result_ttl_secs: u64,

    /// Worker threads available to in-process pools
    #[serde(default = "default_threads")]
    pub threads: usize,
}

/// Get the current environment variable configuration
pub fn config() -> &'static Config {
    static CONFIG: OnceLock<Config> = OnceLock::new();
    CONFIG.get_or_init(|| match envy::prefixed("WEFT_").from_env::<Config>() {
        Ok(config) => config,
        Err(error) => panic!("{}", error),
    })
}

/// Cores usable by in-process worker pools
pub fn usable_cores() -> usize {
    config().cores as usize
}
