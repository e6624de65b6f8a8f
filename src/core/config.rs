//! Configuration - Type-safe, validated config
//!
//! Sources, lowest priority first: built-in defaults, a TOML file, a `.env`
//! file, then `FXSYNC_*` environment variables.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::core::{Credentials, Error, Result, TableKind, TradingSessionDescriptor};

const HOSTS_SUFFIX: &str = "/Hosts.jsp";

/// Application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Fallback tracing filter when RUST_LOG is unset
    pub log_level: String,

    pub login: LoginConfig,

    /// Parameters of the sample flows
    pub sample: SampleConfig,

    pub timeouts: TimeoutConfig,

    /// Seed data for the in-process venue
    pub paper: PaperConfig,
}

#[derive(Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LoginConfig {
    pub login: String,
    pub password: String,
    /// Venue endpoint, normalized to end in `/Hosts.jsp`
    pub url: String,
    /// Connection name, e.g. "Demo" or "Real"
    pub connection: String,
    pub session_id: Option<String>,
    pub pin: Option<String>,
}

impl std::fmt::Debug for LoginConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoginConfig")
            .field("login", &self.login)
            .field("password", &"***")
            .field("url", &self.url)
            .field("connection", &self.connection)
            .field("session_id", &self.session_id)
            .finish()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SampleConfig {
    /// Explicit account; first eligible account when unset
    pub account_id: Option<String>,
    pub instrument: String,
    pub lots: i64,
    /// Table listed by the print sample: "orders" or "trades"
    pub table: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    pub login_secs: u64,
    pub logout_secs: u64,
    pub request_secs: u64,
    pub table_load_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PaperConfig {
    pub accounts: Vec<PaperAccount>,
    pub offers: Vec<PaperOffer>,
    pub trading_sessions: Vec<TradingSessionDescriptor>,
    /// Ask for a trading session after login
    pub require_trading_session: bool,
    /// Contract size of one lot
    pub base_unit_size: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaperAccount {
    pub id: String,
    pub kind: String,
    pub margin_call: String,
    pub balance: Decimal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaperOffer {
    pub id: String,
    pub instrument: String,
    pub bid: Decimal,
    pub ask: Decimal,
    pub point_size: Decimal,
    pub digits: u32,
    #[serde(default = "tradable")]
    pub status: String,
}

fn tradable() -> String {
    "T".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: "info,fxsync=debug".to_string(),
            login: LoginConfig::default(),
            sample: SampleConfig::default(),
            timeouts: TimeoutConfig::default(),
            paper: PaperConfig::default(),
        }
    }
}

impl Default for SampleConfig {
    fn default() -> Self {
        Self {
            account_id: None,
            instrument: "EUR/USD".to_string(),
            lots: 1,
            table: "trades".to_string(),
        }
    }
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            login_secs: 30,
            logout_secs: 30,
            request_secs: 30,
            table_load_secs: 30,
        }
    }
}

impl TimeoutConfig {
    pub fn login(&self) -> Duration {
        Duration::from_secs(self.login_secs)
    }

    pub fn logout(&self) -> Duration {
        Duration::from_secs(self.logout_secs)
    }

    pub fn request(&self) -> Duration {
        Duration::from_secs(self.request_secs)
    }

    pub fn table_load(&self) -> Duration {
        Duration::from_secs(self.table_load_secs)
    }
}

impl Default for PaperConfig {
    fn default() -> Self {
        Self {
            accounts: vec![
                PaperAccount {
                    id: "00001".to_string(),
                    kind: "32".to_string(),
                    margin_call: "N".to_string(),
                    balance: Decimal::new(50_000, 0),
                },
                PaperAccount {
                    id: "00002".to_string(),
                    kind: "36".to_string(),
                    margin_call: "Y".to_string(),
                    balance: Decimal::new(1_250, 0),
                },
            ],
            offers: vec![
                PaperOffer {
                    id: "1".to_string(),
                    instrument: "EUR/USD".to_string(),
                    bid: Decimal::new(112340, 5),
                    ask: Decimal::new(112355, 5),
                    point_size: Decimal::new(1, 4),
                    digits: 5,
                    status: tradable(),
                },
                PaperOffer {
                    id: "2".to_string(),
                    instrument: "USD/JPY".to_string(),
                    bid: Decimal::new(151230, 3),
                    ask: Decimal::new(151245, 3),
                    point_size: Decimal::new(1, 2),
                    digits: 3,
                    status: tradable(),
                },
                PaperOffer {
                    id: "3".to_string(),
                    instrument: "GBP/USD".to_string(),
                    bid: Decimal::new(127010, 5),
                    ask: Decimal::new(127030, 5),
                    point_size: Decimal::new(1, 4),
                    digits: 5,
                    status: "D".to_string(),
                },
            ],
            trading_sessions: Vec::new(),
            require_trading_session: false,
            base_unit_size: 1000,
        }
    }
}

impl LoginConfig {
    pub fn to_credentials(&self) -> Credentials {
        Credentials {
            login: self.login.clone(),
            password: self.password.clone(),
            url: self.url.clone(),
            connection: self.connection.clone(),
            session_id: self.session_id.clone(),
            pin: self.pin.clone(),
        }
    }
}

impl SampleConfig {
    pub fn table_kind(&self) -> TableKind {
        match self.table.parse() {
            Ok(TableKind::Orders) => TableKind::Orders,
            _ => TableKind::Trades,
        }
    }
}

impl Config {
    /// Load from TOML file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("Failed to read config {}: {}", path.display(), e)))?;

        toml::from_str(&content).map_err(|e| Error::Config(format!("Failed to parse config: {}", e)))
    }

    /// Defaults or `path`, then `.env`, then the process environment.
    pub fn from_sources(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::load(path)?,
            None => Self::default(),
        };
        dotenv::dotenv().ok();
        config.apply_env(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// Overlay `FXSYNC_*` variables resolved through `lookup`.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let var = |name: &str| lookup(&format!("FXSYNC_{}", name)).filter(|v| !v.is_empty());

        if let Some(v) = var("LOGIN") {
            self.login.login = v;
        }
        if let Some(v) = var("PASSWORD") {
            self.login.password = v;
        }
        if let Some(v) = var("URL") {
            self.login.url = v;
        }
        if let Some(v) = var("CONNECTION") {
            self.login.connection = v;
        }
        if let Some(v) = var("SESSION_ID") {
            self.login.session_id = Some(v);
        }
        if let Some(v) = var("PIN") {
            self.login.pin = Some(v);
        }
        if let Some(v) = var("ACCOUNT") {
            self.sample.account_id = Some(v);
        }
        if let Some(v) = var("INSTRUMENT") {
            self.sample.instrument = v;
        }
    }

    /// Check required values and normalize the rest in place.
    pub fn validate(&mut self) -> Result<()> {
        let login = &mut self.login;
        for (name, value) in [
            ("login", &mut login.login),
            ("password", &mut login.password),
            ("url", &mut login.url),
            ("connection", &mut login.connection),
        ] {
            *value = value.trim().to_string();
            if value.is_empty() {
                return Err(Error::Config(format!("'{}' is required", name)));
            }
        }
        if !login.url.to_ascii_lowercase().ends_with(&HOSTS_SUFFIX.to_ascii_lowercase()) {
            login.url.push_str(HOSTS_SUFFIX);
        }
        for optional in [&mut login.session_id, &mut login.pin, &mut self.sample.account_id] {
            *optional = optional.take().map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        }

        let sample = &mut self.sample;
        sample.instrument = sample.instrument.trim().to_string();
        if sample.instrument.is_empty() {
            return Err(Error::Config("'instrument' is required".into()));
        }
        if sample.lots <= 0 {
            return Err(Error::Config(format!("'lots' must be positive, got {}", sample.lots)));
        }
        sample.table = sample.table_kind().to_string();
        Ok(())
    }
}
