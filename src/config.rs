use anyhow::Context;

#[derive(Clone, Debug)]
pub struct Config {
    pub ws_base_url: String,
    pub api_base_url: String,
    pub ws_sockjs: bool,
    pub reconnect_delay_ms: u64,
    pub heartbeat_ms: u64,
    pub credential_poll_ms: u64,
    pub event_channels: bool,
    pub credentials_path: String,
    pub status_bind_addr: String,
    pub unread_count_path: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            ws_base_url: "http://localhost:8080".into(),
            api_base_url: "http://localhost:8080/api".into(),
            ws_sockjs: true,
            reconnect_delay_ms: 5000,
            heartbeat_ms: 30000,
            credential_poll_ms: 1000,
            event_channels: true,
            credentials_path: "./credentials.json".into(),
            status_bind_addr: "127.0.0.1:3030".into(),
            unread_count_path: "/notifications/my/unread/count".into(),
        }
    }
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let defaults = Self::default();
        let text = |name: &str, default: String| lookup(name).unwrap_or(default);

        let ws_base_url = text("RFT_WS_BASE_URL", defaults.ws_base_url);
        let api_base_url = text("RFT_API_BASE_URL", defaults.api_base_url);
        let ws_sockjs = lookup("RFT_WS_SOCKJS")
            .unwrap_or_else(|| "true".into())
            .parse()
            .context("RFT_WS_SOCKJS must be true or false")?;
        let reconnect_delay_ms = lookup("RFT_RECONNECT_DELAY_MS")
            .unwrap_or_else(|| "5000".into())
            .parse()
            .context("RFT_RECONNECT_DELAY_MS must be a number")?;
        let heartbeat_ms = lookup("RFT_HEARTBEAT_MS")
            .unwrap_or_else(|| "30000".into())
            .parse()
            .context("RFT_HEARTBEAT_MS must be a number")?;
        let credential_poll_ms: u64 = lookup("RFT_CREDENTIAL_POLL_MS")
            .unwrap_or_else(|| "1000".into())
            .parse()
            .context("RFT_CREDENTIAL_POLL_MS must be a number")?;
        if credential_poll_ms == 0 {
            anyhow::bail!("RFT_CREDENTIAL_POLL_MS must be greater than zero");
        }
        let event_channels = lookup("RFT_EVENT_CHANNELS")
            .unwrap_or_else(|| "true".into())
            .parse()
            .context("RFT_EVENT_CHANNELS must be true or false")?;
        let credentials_path = text("RFT_CREDENTIALS_PATH", defaults.credentials_path);
        let status_bind_addr = text("RFT_STATUS_BIND_ADDR", defaults.status_bind_addr);
        let unread_count_path = text("RFT_UNREAD_COUNT_PATH", defaults.unread_count_path);

        Ok(Self {
            ws_base_url,
            api_base_url,
            ws_sockjs,
            reconnect_delay_ms,
            heartbeat_ms,
            credential_poll_ms,
            event_channels,
            credentials_path,
            status_bind_addr,
            unread_count_path,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn from(vars: &[(&str, &str)]) -> anyhow::Result<Config> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|name| vars.get(name).cloned())
    }

    #[test]
    fn defaults_target_local_backend() {
        let config = from(&[]).unwrap();
        assert_eq!(config.ws_base_url, "http://localhost:8080");
        assert!(config.ws_sockjs);
        assert_eq!(config.reconnect_delay_ms, 5000);
        assert_eq!(config.heartbeat_ms, 30000);
    }

    #[test]
    fn overrides_are_parsed() {
        let config = from(&[
            ("RFT_WS_BASE_URL", "https://rft.example"),
            ("RFT_WS_SOCKJS", "false"),
            ("RFT_HEARTBEAT_MS", "10000"),
        ])
        .unwrap();
        assert_eq!(config.ws_base_url, "https://rft.example");
        assert!(!config.ws_sockjs);
        assert_eq!(config.heartbeat_ms, 10000);
    }

    #[test]
    fn invalid_numbers_are_rejected() {
        let err = from(&[("RFT_RECONNECT_DELAY_MS", "soon")]).unwrap_err();
        assert!(err.to_string().contains("RFT_RECONNECT_DELAY_MS"));
        assert!(from(&[("RFT_CREDENTIAL_POLL_MS", "0")]).is_err());
    }
}
