use anyhow::{Context, Result};
use std::str::FromStr;
use std::time::Duration;

use crate::presence::PresenceStyle;
use crate::transport::{default_prefix, ENDPOINT_COUNT};

/// Application id registered with the presence service
pub const CLIENT_ID: &str = "1402044057647186053";

/// Media session owner we follow (matched as a substring)
pub const DEFAULT_TARGET_APP: &str = "AppleInc.AppleMusic";

#[cfg(windows)]
pub const DEFAULT_PEER_PROCESS: &str = "Discord.exe";
#[cfg(not(windows))]
pub const DEFAULT_PEER_PROCESS: &str = "Discord";

/// Program (plus arguments) that streams media session events as JSON lines
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SidecarCommand {
    pub program: String,
    pub args: Vec<String>,
}

impl SidecarCommand {
    /// Split a command line on whitespace
    pub fn parse(line: &str) -> Option<Self> {
        let mut parts = line.split_whitespace().map(str::to_string);
        let program = parts.next()?;
        Some(Self {
            program,
            args: parts.collect(),
        })
    }
}

#[derive(Debug, Clone)]
pub struct BridgeConfig {
    pub client_id: String,
    pub target_app: String,
    pub peer_process: String,
    pub endpoint_prefix: String,
    pub endpoint_count: usize,
    /// How often the peer process probe runs
    pub probe_interval: Duration,
    /// Orchestrator tick while a session is attached
    pub tick_interval: Duration,
    /// Run the artwork pass every N ticks
    pub thumbnail_refresh_ticks: u32,
    /// Position jump that counts as a seek
    pub seek_tolerance: Duration,
    pub presence: PresenceStyle,
    pub sidecar: Option<SidecarCommand>,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            client_id: CLIENT_ID.to_string(),
            target_app: DEFAULT_TARGET_APP.to_string(),
            peer_process: DEFAULT_PEER_PROCESS.to_string(),
            endpoint_prefix: default_prefix(),
            endpoint_count: ENDPOINT_COUNT,
            probe_interval: Duration::from_secs(5),
            tick_interval: Duration::from_secs(1),
            thumbnail_refresh_ticks: 10,
            seek_tolerance: Duration::from_secs(3),
            presence: PresenceStyle::default(),
            sidecar: None,
        }
    }
}

impl BridgeConfig {
    /// Defaults overridden by `PRESENCE_*` environment variables
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Defaults overridden by whatever `lookup` returns for each `PRESENCE_*` key
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        if let Some(target) = get("PRESENCE_TARGET_APP") {
            log::info!("Following media sessions from: {}", target);
            config.target_app = target;
        }
        if let Some(peer) = get("PRESENCE_PEER_PROCESS") {
            config.peer_process = peer;
        }
        if let Some(prefix) = get("PRESENCE_IPC_PREFIX") {
            config.endpoint_prefix = prefix;
        }
        if let Some(secs) = get("PRESENCE_PROBE_SECS") {
            config.probe_interval = Duration::from_secs(parse_number("PRESENCE_PROBE_SECS", &secs)?);
        }
        if let Some(ms) = get("PRESENCE_TICK_MS") {
            config.tick_interval = Duration::from_millis(parse_number("PRESENCE_TICK_MS", &ms)?);
        }
        if let Some(ticks) = get("PRESENCE_ARTWORK_TICKS") {
            config.thumbnail_refresh_ticks = parse_number("PRESENCE_ARTWORK_TICKS", &ticks)?;
        }
        if let Some(line) = get("PRESENCE_SIDECAR") {
            config.sidecar = SidecarCommand::parse(&line);
        }

        if config.probe_interval.is_zero() || config.tick_interval.is_zero() {
            anyhow::bail!("Probe and tick intervals must be greater than zero");
        }

        Ok(config)
    }
}

fn parse_number<T>(key: &str, value: &str) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    value
        .parse()
        .with_context(|| format!("Invalid value for {}: {:?}", key, value))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn load(vars: &[(&str, &str)]) -> Result<BridgeConfig> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        BridgeConfig::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = load(&[]).unwrap();
        assert_eq!(config.client_id, CLIENT_ID);
        assert_eq!(config.target_app, "AppleInc.AppleMusic");
        assert_eq!(config.endpoint_count, 10);
        assert_eq!(config.probe_interval, Duration::from_secs(5));
        assert_eq!(config.tick_interval, Duration::from_secs(1));
        assert_eq!(config.thumbnail_refresh_ticks, 10);
        assert!(config.sidecar.is_none());
    }

    #[test]
    fn test_overrides() {
        let config = load(&[
            ("PRESENCE_TARGET_APP", "Spotify"),
            ("PRESENCE_PROBE_SECS", "8"),
            ("PRESENCE_TICK_MS", "250"),
            ("PRESENCE_ARTWORK_TICKS", "3"),
            ("PRESENCE_IPC_PREFIX", "/tmp/test-ipc-"),
            ("PRESENCE_SIDECAR", "node  reader.js --json"),
        ])
        .unwrap();

        assert_eq!(config.target_app, "Spotify");
        assert_eq!(config.probe_interval, Duration::from_secs(8));
        assert_eq!(config.tick_interval, Duration::from_millis(250));
        assert_eq!(config.thumbnail_refresh_ticks, 3);
        assert_eq!(config.endpoint_prefix, "/tmp/test-ipc-");
        assert_eq!(
            config.sidecar,
            Some(SidecarCommand {
                program: "node".to_string(),
                args: vec!["reader.js".to_string(), "--json".to_string()],
            })
        );
    }

    #[test]
    fn test_invalid_number_is_an_error() {
        let err = load(&[("PRESENCE_PROBE_SECS", "soon")]).unwrap_err();
        assert!(err.to_string().contains("PRESENCE_PROBE_SECS"));
    }

    #[test]
    fn test_zero_interval_rejected() {
        assert!(load(&[("PRESENCE_TICK_MS", "0")]).is_err());
    }

    #[test]
    fn test_blank_values_ignored() {
        let config = load(&[("PRESENCE_TARGET_APP", "  ")]).unwrap();
        assert_eq!(config.target_app, DEFAULT_TARGET_APP);
    }
}
