//! TOML configuration.
//!
//! ```toml
//! [device]
//! app_id = 0
//! pipe_capacity = 2097152        # bytes, power of two
//! max_batch_bytes = 65536
//! head_update_period = 64        # packets
//! max_pending_tx_requests = 16383
//!
//! [steering]
//! hash = "ahash"                 # or "sum"
//! ```
//!
//! Every key is optional; missing keys keep their defaults.

use crate::notification::{HEAD_UPDATE_PERIOD, MAX_PENDING_TX_REQUESTS};
use crate::pipe::PipeConfig;
use crate::steering::RssHash;
use crate::utils::{FLIT_SIZE, MAX_PKT_SIZE};
use color_eyre::eyre::{bail, ensure, eyre, Result, WrapErr};
use std::fs::read_to_string;
use std::path::Path;
use std::str::FromStr;
use toml::Value;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnsoConfig {
    /// Namespaces this application's pipes and rules on a shared NIC.
    pub app_id: u16,
    pub pipe_capacity: usize,
    pub max_batch_bytes: usize,
    pub head_update_period: u32,
    pub max_pending_tx_requests: u32,
    pub rss_hash: RssHash,
}

impl Default for EnsoConfig {
    fn default() -> Self {
        let pipe = PipeConfig::default();
        Self {
            app_id: 0,
            pipe_capacity: pipe.capacity,
            max_batch_bytes: pipe.max_batch_bytes,
            head_update_period: HEAD_UPDATE_PERIOD,
            max_pending_tx_requests: MAX_PENDING_TX_REQUESTS,
            rss_hash: RssHash::default(),
        }
    }
}

impl EnsoConfig {
    pub fn from_path(config_path: &Path) -> Result<Self> {
        let file_str = read_to_string(config_path)
            .wrap_err_with(|| eyre!("read config {}", config_path.display()))?;
        file_str.parse()
    }

    pub fn pipe_config(&self) -> PipeConfig {
        PipeConfig {
            capacity: self.pipe_capacity,
            max_batch_bytes: self.max_batch_bytes,
            head_update_period: self.head_update_period,
        }
    }

    pub fn validate(&self) -> Result<()> {
        ensure!(
            self.pipe_capacity.is_power_of_two(),
            "pipe_capacity {} is not a power of two",
            self.pipe_capacity
        );
        ensure!(
            self.pipe_capacity >= MAX_PKT_SIZE + FLIT_SIZE,
            "pipe_capacity {} is smaller than {}",
            self.pipe_capacity,
            MAX_PKT_SIZE + FLIT_SIZE
        );
        ensure!(self.max_batch_bytes > 0, "max_batch_bytes must be positive");
        ensure!(
            self.head_update_period > 0,
            "head_update_period must be positive"
        );
        ensure!(
            self.max_pending_tx_requests > 0,
            "max_pending_tx_requests must be positive"
        );
        Ok(())
    }
}

impl FromStr for EnsoConfig {
    type Err = color_eyre::eyre::Error;

    fn from_str(file_str: &str) -> Result<Self> {
        let mut cfg: Value = file_str.parse().wrap_err("parse TOML config")?;
        let tab = cfg
            .as_table_mut()
            .ok_or_else(|| eyre!("Malformed TOML, want table structure"))?;

        let mut config = EnsoConfig::default();

        fn int(tab: &toml::value::Table, key: &str) -> Result<Option<i64>> {
            match tab.get(key) {
                None => Ok(None),
                Some(Value::Integer(i)) => Ok(Some(*i)),
                Some(_) => bail!("{} should be an integer", key),
            }
        }

        fn device_cfg(dev: Value, config: &mut EnsoConfig) -> Result<()> {
            let tab = dev
                .as_table()
                .ok_or_else(|| eyre!("device config key not a table"))?;
            if let Some(v) = int(tab, "app_id")? {
                config.app_id = u16::try_from(v).wrap_err("app_id out of range")?;
            }
            if let Some(v) = int(tab, "pipe_capacity")? {
                config.pipe_capacity = usize::try_from(v).wrap_err("pipe_capacity out of range")?;
            }
            if let Some(v) = int(tab, "max_batch_bytes")? {
                config.max_batch_bytes =
                    usize::try_from(v).wrap_err("max_batch_bytes out of range")?;
            }
            if let Some(v) = int(tab, "head_update_period")? {
                config.head_update_period =
                    u32::try_from(v).wrap_err("head_update_period out of range")?;
            }
            if let Some(v) = int(tab, "max_pending_tx_requests")? {
                config.max_pending_tx_requests =
                    u32::try_from(v).wrap_err("max_pending_tx_requests out of range")?;
            }
            Ok(())
        }

        fn steering_cfg(steering: Value, config: &mut EnsoConfig) -> Result<()> {
            let tab = steering
                .as_table()
                .ok_or_else(|| eyre!("steering config key not a table"))?;
            if let Some(hash) = tab.get("hash") {
                config.rss_hash = hash
                    .as_str()
                    .ok_or_else(|| eyre!("hash value should be a string"))?
                    .parse()?;
            }
            Ok(())
        }

        if let Some(dev) = tab.remove("device") {
            device_cfg(dev, &mut config)?;
        }
        if let Some(steering) = tab.remove("steering") {
            steering_cfg(steering, &mut config)?;
        }

        config.validate()?;
        Ok(config)
    }
}
