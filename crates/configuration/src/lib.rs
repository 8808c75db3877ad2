//! Configuration loader for the exchange server.
//!
//! This crate centralizes runtime settings for the server. It provides sane
//! defaults and supports overrides via an optional `config.toml` file and
//! environment variables prefixed with `EXCHANGE_` (nested fields separated
//! using `__`). For example, `EXCHANGE_POOL__UTXO_POOL_SIZE=5000`.
//!
use serde::Deserialize;
use std::collections::HashMap;

#[derive(Debug, Deserialize, Clone)]
/// Top-level settings consumed by the server.
pub struct Settings {
    /// Root of all persisted state (accounts, order books, wallets).
    pub data_dir: String,
    pub server_addr: String,
    pub server_port: u16,
    /// Bitcoin transaction fee rate in sat/byte.
    pub btc_fee: u64,
    /// Master seed for the omnibus hot wallets, one per server.
    pub seed: String,
    /// Server identity private key, hex.
    pub seckey: String,
    /// Comma-separated admin pubkeys, hex.
    pub admins: String,
    /// chain name -> host:port of the full node to talk to.
    pub node_addresses: HashMap<String, String>,
    pub pool: Pool,
    pub matching: Matching,
}

#[derive(Debug, Deserialize, Clone)]
/// UTXO pool sizing and timing.
pub struct Pool {
    /// Upper bound on the live set per chain.
    pub utxo_pool_size: usize,
    /// Seconds between chain refresh ticks.
    pub refresh_interval_secs: u64,
    /// Seconds a reservation stays exclusive without an explicit release.
    pub reservation_ttl_secs: u64,
}

#[derive(Debug, Deserialize, Clone)]
/// Match-cycle cadence for the order manager.
pub struct Matching {
    pub tick_interval_secs: u64,
}

impl Settings {
    /// Load settings from defaults, `config.toml` (optional), and environment.
    pub fn load() -> Result<Self, config::ConfigError> {
        let config = config::Config::builder()
            .set_default("data_dir", "exchange-data")?
            .set_default("server_addr", "127.0.0.1")?
            .set_default("server_port", 8080)?
            .set_default("btc_fee", 20)?
            .set_default("seed", "")?
            .set_default("seckey", "")?
            .set_default("admins", "")?
            .set_default("node_addresses.bitcoin", "127.0.0.1:8332")?
            .set_default("node_addresses.skycoin", "127.0.0.1:6420")?
            .set_default("pool.utxo_pool_size", 1000)?
            .set_default("pool.refresh_interval_secs", 10)?
            .set_default("pool.reservation_ttl_secs", 180)?
            .set_default("matching.tick_interval_secs", 1)?
            .add_source(config::File::with_name("config").required(false))
            .add_source(
                config::Environment::with_prefix("EXCHANGE")
                    .prefix_separator("_")
                    .separator("__"),
            )
            .build()?;

        config.try_deserialize()
    }

    /// Admin pubkeys parsed out of the comma-separated config value.
    pub fn admin_keys(&self) -> Vec<String> {
        self.admins
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect()
    }
}
