use std::time::Duration;

pub const DEFAULT_SIGNALING_URL: &str = "ws://localhost:3001/ws";
pub const DEFAULT_DATA_CHANNEL_LABEL: &str = "voice-activity";
pub const DEFAULT_NEGOTIATION_TIMEOUT: Duration = Duration::from_secs(20);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientConfig {
    pub signaling_url: String,
    pub ice_servers: Vec<String>,
    /// Offers or answers left unanswered this long are abandoned. `None`
    /// disables the watchdog.
    pub negotiation_timeout: Option<Duration>,
    pub data_channel_label: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            signaling_url: DEFAULT_SIGNALING_URL.to_string(),
            ice_servers: vec![
                "stun:stun.l.google.com:19302".to_string(),
                "stun:stun1.l.google.com:19302".to_string(),
            ],
            negotiation_timeout: Some(DEFAULT_NEGOTIATION_TIMEOUT),
            data_channel_label: DEFAULT_DATA_CHANNEL_LABEL.to_string(),
        }
    }
}

impl ClientConfig {
    /// Defaults overridden by `HUDDLE_SIGNALING_URL`, `HUDDLE_ICE_SERVERS`
    /// (comma separated) and `HUDDLE_NEGOTIATION_TIMEOUT_SECS` (0 disables).
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();
        if let Some(url) = lookup("HUDDLE_SIGNALING_URL").filter(|v| !v.trim().is_empty()) {
            config.signaling_url = url.trim().to_string();
        }
        if let Some(servers) = lookup("HUDDLE_ICE_SERVERS") {
            config.ice_servers = servers
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect();
        }
        if let Some(secs) = lookup("HUDDLE_NEGOTIATION_TIMEOUT_SECS")
            .and_then(|v| v.trim().parse::<u64>().ok())
        {
            config.negotiation_timeout = (secs > 0).then(|| Duration::from_secs(secs));
        }
        config
    }
}
