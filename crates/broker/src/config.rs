use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};

#[derive(Debug, Clone)]
pub struct BrokerConfig {
    pub bind_addr: SocketAddr,
    pub data_db_url: String,
    pub risk_addr: String,
    pub risk_timeout_ms: u64,
    pub identity: String,
    pub token: String,
    pub peers_path: String,
    pub allow_alias: bool,
    pub allow_echo: bool,
    pub handshake_timeout_ms: u64,
    pub selection_timeout_ms: u64,
    pub max_histogram_cells: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartupError {
    pub code: &'static str,
    pub message: String,
}

impl std::fmt::Display for StartupError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for StartupError {}

impl BrokerConfig {
    /// Environment variables win over entries from the optional
    /// `DPQ_CONFIG_PATH` KEY=VALUE file.
    pub fn load() -> Result<Self, StartupError> {
        let mut merged = HashMap::new();

        if let Ok(config_path) = std::env::var("DPQ_CONFIG_PATH") {
            let config_path = config_path.trim();
            if !config_path.is_empty() {
                merged.extend(parse_env_file(config_path)?);
            }
        }

        merged.extend(std::env::vars());

        Self::from_kv(&merged)
    }

    pub fn from_kv(kv: &HashMap<String, String>) -> Result<Self, StartupError> {
        let bind_addr = parse_socket_addr(
            kv.get("DPQ_BIND_ADDR"),
            SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 9070),
            "DPQ_BIND_ADDR",
        )?;

        let data_db_url = require_nonempty(kv, "DPQ_DATA_DB_URL")?;
        let risk_addr = require_nonempty(kv, "DPQ_RISK_ADDR")?;
        let identity = require_nonempty(kv, "DPQ_IDENTITY")?;
        let token = require_nonempty(kv, "DPQ_TOKEN")?;
        let peers_path = require_nonempty(kv, "DPQ_PEERS_PATH")?;

        let risk_timeout_ms =
            parse_u64(kv.get("DPQ_RISK_TIMEOUT_MS"), 5000, "DPQ_RISK_TIMEOUT_MS")?;
        let handshake_timeout_ms = parse_u64(
            kv.get("DPQ_HANDSHAKE_TIMEOUT_MS"),
            5000,
            "DPQ_HANDSHAKE_TIMEOUT_MS",
        )?;
        let selection_timeout_ms = parse_u64(
            kv.get("DPQ_SELECTION_TIMEOUT_MS"),
            30_000,
            "DPQ_SELECTION_TIMEOUT_MS",
        )?;
        let max_histogram_cells = parse_u64(
            kv.get("DPQ_MAX_HISTOGRAM_CELLS"),
            dpq_processors::histogram::DEFAULT_MAX_CELLS,
            "DPQ_MAX_HISTOGRAM_CELLS",
        )?;

        let allow_alias = parse_bool(kv.get("DPQ_ALLOW_ALIAS")).unwrap_or(false);
        let allow_echo = parse_bool(kv.get("DPQ_ALLOW_ECHO")).unwrap_or(false);

        Ok(Self {
            bind_addr,
            data_db_url,
            risk_addr,
            risk_timeout_ms,
            identity,
            token,
            peers_path,
            allow_alias,
            allow_echo,
            handshake_timeout_ms,
            selection_timeout_ms,
            max_histogram_cells,
        })
    }
}

pub(crate) fn parse_env_file(path: &str) -> Result<HashMap<String, String>, StartupError> {
    let contents = std::fs::read_to_string(path).map_err(|_| StartupError {
        code: "ERR_CONFIG_FILE_READ",
        message: format!("failed to read config file at {}", path),
    })?;

    let mut kv = HashMap::new();

    for (idx, raw_line) in contents.lines().enumerate() {
        let line = raw_line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let (key, value) = line.split_once('=').ok_or_else(|| StartupError {
            code: "ERR_CONFIG_FILE_PARSE",
            message: format!("invalid config line {} (expected KEY=VALUE)", idx + 1),
        })?;

        let key = key.trim();
        if key.is_empty() {
            return Err(StartupError {
                code: "ERR_CONFIG_FILE_PARSE",
                message: format!("invalid config line {} (empty key)", idx + 1),
            });
        }

        kv.insert(key.to_string(), strip_quotes(value.trim()));
    }

    Ok(kv)
}

fn strip_quotes(s: &str) -> String {
    let bytes = s.as_bytes();
    if bytes.len() >= 2 {
        let first = bytes[0];
        let last = bytes[bytes.len() - 1];
        if (first == b'"' && last == b'"') || (first == b'\'' && last == b'\'') {
            return s[1..bytes.len() - 1].to_string();
        }
    }
    s.to_string()
}

fn require_nonempty(
    kv: &HashMap<String, String>,
    key: &'static str,
) -> Result<String, StartupError> {
    let Some(value) = kv.get(key) else {
        return Err(StartupError {
            code: "ERR_MISSING_CONFIG",
            message: format!("missing required config key {}", key),
        });
    };

    let value = value.trim();
    if value.is_empty() {
        return Err(StartupError {
            code: "ERR_MISSING_CONFIG",
            message: format!("missing required config key {}", key),
        });
    }

    Ok(value.to_string())
}

fn parse_socket_addr(
    value: Option<&String>,
    default: SocketAddr,
    key: &'static str,
) -> Result<SocketAddr, StartupError> {
    match value {
        None => Ok(default),
        Some(v) => v.parse::<SocketAddr>().map_err(|_| StartupError {
            code: "ERR_INVALID_CONFIG",
            message: format!("{} must be a valid host:port socket address", key),
        }),
    }
}

fn parse_u64(value: Option<&String>, default: u64, key: &'static str) -> Result<u64, StartupError> {
    match value {
        None => Ok(default),
        Some(v) if v.trim().is_empty() => Ok(default),
        Some(v) => v.parse::<u64>().map_err(|_| StartupError {
            code: "ERR_INVALID_CONFIG",
            message: format!("{} must be an integer", key),
        }),
    }
}

fn parse_bool(value: Option<&String>) -> Option<bool> {
    let v = value?.trim();
    match v {
        "1" | "true" | "yes" => Some(true),
        "0" | "false" | "no" => Some(false),
        _ => None,
    }
}
