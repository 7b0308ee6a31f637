use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::NaiveDate;
use chrono_tz::Tz;
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::domain::UserGroup;
use crate::error::SmaError;
use crate::protocol::{BtAddr, LinkKind};

/// Top-level application configuration
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct AppConfig {
    #[validate(nested)]
    pub connection: ConnectionConfig,

    #[validate(nested)]
    pub session: SessionConfig,

    #[validate(nested)]
    #[serde(default)]
    pub archive: ArchiveConfig,

    #[validate(nested)]
    #[serde(default)]
    pub time_sync: TimeSyncConfig,

    #[validate(nested)]
    #[serde(default)]
    pub poll: PollConfig,

    #[validate(nested)]
    #[serde(default)]
    pub tags: TagsConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionKind {
    Bluetooth,
    Speedwire,
    None,
}

/// Physical link configuration
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
#[validate(schema(function = "validate_connection_config"))]
pub struct ConnectionConfig {
    pub kind: ConnectionKind,

    /// Inverter Bluetooth address, `12:34:56:78:9A:BC`.
    #[serde(default)]
    pub bt_address: Option<String>,

    /// Inverter IP list; a single `0.0.0.0` triggers multicast discovery.
    #[serde(default = "default_ip_addresses")]
    pub ip_addresses: Vec<String>,

    #[serde(default = "default_port")]
    #[validate(range(min = 1, max = 65535))]
    pub port: u16,

    #[serde(default = "default_bt_timeout_secs")]
    #[validate(range(min = 1, max = 60))]
    pub bt_timeout_secs: u64,

    #[serde(default = "default_eth_timeout_secs")]
    #[validate(range(min = 1, max = 60))]
    pub eth_timeout_secs: u64,

    #[serde(default = "default_bt_connect_retries")]
    #[validate(range(min = 1, max = 15))]
    pub bt_connect_retries: u32,
}

/// Plant session configuration
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct SessionConfig {
    #[serde(default = "default_user_group")]
    pub user_group: UserGroup,

    /// The inverter password; at most 12 characters travel on the wire.
    #[validate(length(min = 1, max = 12))]
    pub password: String,

    /// Multi-inverter support. Keep disabled on single-inverter plants with
    /// old firmware.
    #[serde(default)]
    pub multi_inverter: bool,

    #[serde(default = "default_plant_name")]
    pub plant_name: String,

    /// IANA timezone for civil-day bucketing of the archives.
    #[validate(custom(function = "validate_timezone"))]
    pub timezone: String,
}

/// Archive retrieval windows
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct ArchiveConfig {
    /// Days of 5-minute archive to fetch; 0 disables, 1 is today.
    #[serde(default = "default_one")]
    #[validate(range(min = 0, max = 300))]
    pub days: u32,

    /// Months of per-day archive; 0 disables, 1 is the current month.
    #[serde(default = "default_one")]
    #[validate(range(min = 0, max = 300))]
    pub months: u32,

    /// Months of event log; 0 disables.
    #[serde(default = "default_one")]
    #[validate(range(min = 0, max = 300))]
    pub event_months: u32,

    /// Optional fixed start date (`YYYYMMDD`) for historic retrieval.
    #[serde(default)]
    pub start_date: Option<String>,
}

/// Plant-clock synchronization guards
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct TimeSyncConfig {
    /// Adjust at most once per this many days; 0 disables time sync.
    #[serde(default = "default_one")]
    #[validate(range(min = 0, max = 30))]
    pub every_days: u32,

    #[serde(default = "default_sync_low")]
    #[validate(range(min = 1, max = 120))]
    pub low_limit_secs: u32,

    #[serde(default = "default_sync_high")]
    #[validate(range(min = 1200, max = 3600))]
    pub high_limit_secs: u32,
}

/// Polling cadence
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct PollConfig {
    /// Keep running and poll on an interval instead of a single cycle.
    #[serde(default)]
    pub daemon: bool,

    #[serde(default = "default_interval_secs")]
    #[validate(range(min = 30, max = 86400))]
    pub interval_secs: u64,

    /// Derive spot values some models omit (P from U and I).
    #[serde(default)]
    pub calc_missing_spot: bool,
}

/// Tag catalogue location
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct TagsConfig {
    #[serde(default = "default_tags_dir")]
    pub dir: PathBuf,

    #[serde(default = "default_locale")]
    pub locale: String,
}

fn validate_connection_config(config: &ConnectionConfig) -> Result<(), validator::ValidationError> {
    match config.kind {
        ConnectionKind::Bluetooth => {
            let ok = config
                .bt_address
                .as_deref()
                .map(|addr| addr.parse::<BtAddr>().is_ok())
                .unwrap_or(false);
            if !ok {
                return Err(validator::ValidationError::new(
                    "bluetooth connection needs a valid bt_address",
                ));
            }
        }
        ConnectionKind::Speedwire => {
            if config.ip_addresses.is_empty() {
                return Err(validator::ValidationError::new(
                    "speedwire connection needs at least one ip_address (0.0.0.0 to discover)",
                ));
            }
            if config
                .ip_addresses
                .iter()
                .any(|ip| ip.parse::<Ipv4Addr>().is_err())
            {
                return Err(validator::ValidationError::new("invalid ip_address entry"));
            }
        }
        ConnectionKind::None => {}
    }
    Ok(())
}

fn validate_timezone(tz: &str) -> Result<(), validator::ValidationError> {
    tz.parse::<Tz>()
        .map(|_| ())
        .map_err(|_| validator::ValidationError::new("unknown IANA timezone"))
}

// Default value functions
fn default_ip_addresses() -> Vec<String> { vec!["0.0.0.0".to_string()] }
fn default_port() -> u16 { 9522 }
fn default_bt_timeout_secs() -> u64 { 5 }
fn default_eth_timeout_secs() -> u64 { 2 }
fn default_bt_connect_retries() -> u32 { 10 }
fn default_user_group() -> UserGroup { UserGroup::User }
fn default_plant_name() -> String { "MyPlant".to_string() }
fn default_one() -> u32 { 1 }
fn default_sync_low() -> u32 { 1 }
fn default_sync_high() -> u32 { 3600 }
fn default_interval_secs() -> u64 { 300 }
fn default_tags_dir() -> PathBuf { PathBuf::from("tags") }
fn default_locale() -> String { "en-US".to_string() }

impl Default for ArchiveConfig {
    fn default() -> Self {
        Self {
            days: default_one(),
            months: default_one(),
            event_months: default_one(),
            start_date: None,
        }
    }
}

impl Default for TimeSyncConfig {
    fn default() -> Self {
        Self {
            every_days: default_one(),
            low_limit_secs: default_sync_low(),
            high_limit_secs: default_sync_high(),
        }
    }
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            daemon: false,
            interval_secs: default_interval_secs(),
            calc_missing_spot: false,
        }
    }
}

impl Default for TagsConfig {
    fn default() -> Self {
        Self {
            dir: default_tags_dir(),
            locale: default_locale(),
        }
    }
}

impl ConnectionConfig {
    pub fn bt_addr(&self) -> crate::error::Result<BtAddr> {
        self.bt_address
            .as_deref()
            .ok_or_else(|| SmaError::BadArg("bt_address not configured".into()))?
            .parse()
    }

    pub fn parsed_ips(&self) -> crate::error::Result<Vec<Ipv4Addr>> {
        self.ip_addresses
            .iter()
            .map(|ip| {
                ip.parse::<Ipv4Addr>()
                    .map_err(|_| SmaError::BadArg(format!("invalid IP address '{ip}'")))
            })
            .collect()
    }

    pub fn recv_timeout(&self, kind: LinkKind) -> Duration {
        match kind {
            LinkKind::Bluetooth => Duration::from_secs(self.bt_timeout_secs),
            LinkKind::Speedwire => Duration::from_secs(self.eth_timeout_secs),
        }
    }
}

impl SessionConfig {
    pub fn tz(&self) -> crate::error::Result<Tz> {
        self.timezone
            .parse::<Tz>()
            .map_err(|_| SmaError::BadArg(format!("unknown timezone '{}'", self.timezone)))
    }
}

impl ArchiveConfig {
    /// Epoch of local noon on the configured start date, if any. Noon keeps
    /// the date stable across DST transitions.
    pub fn start_date_epoch(&self, tz: Tz) -> crate::error::Result<Option<i64>> {
        let Some(raw) = self.start_date.as_deref() else {
            return Ok(None);
        };
        let date = NaiveDate::parse_from_str(raw, "%Y%m%d")
            .map_err(|_| SmaError::BadArg(format!("invalid start_date '{raw}' (YYYYMMDD)")))?;
        let noon = date
            .and_hms_opt(12, 0, 0)
            .and_then(|dt| chrono::TimeZone::from_local_datetime(&tz, &dt).earliest())
            .ok_or_else(|| SmaError::BadArg(format!("unrepresentable start_date '{raw}'")))?;
        Ok(Some(noon.timestamp()))
    }
}

impl AppConfig {
    /// Load configuration from TOML files and environment variables
    ///
    /// Configuration is loaded in this order (later overrides earlier):
    /// 1. config/default.toml (base configuration)
    /// 2. config/local.toml (site-specific overrides, optional)
    /// 3. Environment variables with SUNWIRE__ prefix
    pub fn load() -> Result<Self> {
        let figment = Figment::new()
            .merge(Toml::file("config/default.toml"))
            .merge(Toml::file("config/local.toml"))
            .merge(Env::prefixed("SUNWIRE__").split("__"));
        Self::from_figment(figment)
    }

    pub fn from_figment(figment: Figment) -> Result<Self> {
        let config: AppConfig = figment.extract().context("Failed to parse configuration")?;
        config
            .validate()
            .context("Configuration validation failed")?;
        Ok(config)
    }
}
