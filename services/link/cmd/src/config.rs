//! Configuration handling for the link binary.
//!
//! Settings come from the `link:` section of a YAML file, then from `LINK_*`
//! environment variables. Command line flags are applied last by `main`.
//! Durations use humantime notation such as `250ms` or `30s`.

use anyhow::{Context, Result};
use link_session::SessionConfig;
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;
use tracing::{info, warn};

/// Link binary configuration
#[derive(Debug, Clone)]
pub struct LinkConfig {
    /// Address the echo server listens on
    pub listen_addr: SocketAddr,
    /// Address the client dials
    pub connect_addr: SocketAddr,
    /// Session identity used by the client; random when unset
    pub session_id: Option<u64>,
    /// Protocol settings shared by both roles
    pub session: SessionConfig,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 7400)),
            connect_addr: SocketAddr::from(([127, 0, 0, 1], 7400)),
            session_id: None,
            session: SessionConfig::default(),
        }
    }
}

/// Root configuration structure (matches the YAML structure)
#[derive(Debug, Deserialize)]
struct RootConfig {
    link: Option<FileConfig>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileConfig {
    listen: Option<SocketAddr>,
    connect: Option<SocketAddr>,
    session_id: Option<u64>,
    max_pending_messages: Option<usize>,
    max_cache_messages: Option<usize>,
    ack_timeout: Option<String>,
    connect_timeout: Option<String>,
    max_connect_times: Option<u32>,
    connect_retry_interval: Option<String>,
    verify_timeout: Option<String>,
    max_verify_times: Option<u32>,
    heartbeat_interval: Option<String>,
    idle_timeout: Option<String>,
    tick_interval: Option<String>,
    write_high_water_mark: Option<usize>,
    max_frame_size: Option<usize>,
}

impl LinkConfig {
    /// Load configuration from file and environment variables
    pub fn load_from_file<P: AsRef<Path>>(config_path: P) -> Result<Self> {
        let path = config_path.as_ref();
        let mut config = Self::default();

        match std::fs::read_to_string(path) {
            Ok(content) => {
                let root: RootConfig = serde_yaml::from_str(&content)
                    .with_context(|| format!("Failed to parse config file {:?}", path))?;
                if let Some(section) = root.link {
                    config.apply_file_config(section)?;
                }
                info!("Loaded configuration from {:?}", path);
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!("Config file {:?} not found, using defaults", path)
            }
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to read config file {:?}", path));
            }
        }

        config.apply_overrides(|key| std::env::var(key).ok())?;
        config
            .session
            .validate()
            .context("Invalid session configuration")?;

        info!(
            "Final link configuration: listen={}, connect={}, window={}, cache={}, \
             heartbeat={:?}, ack_timeout={:?}",
            config.listen_addr,
            config.connect_addr,
            config.session.max_pending_messages,
            config.session.max_cache_messages,
            config.session.heartbeat_interval,
            config.session.ack_timeout
        );
        Ok(config)
    }

    fn apply_file_config(&mut self, file: FileConfig) -> Result<()> {
        let session = &mut self.session;

        if let Some(addr) = file.listen {
            self.listen_addr = addr;
        }
        if let Some(addr) = file.connect {
            self.connect_addr = addr;
        }
        if file.session_id.is_some() {
            self.session_id = file.session_id;
        }
        if let Some(v) = file.max_pending_messages {
            session.max_pending_messages = v;
        }
        if let Some(v) = file.max_cache_messages {
            session.max_cache_messages = v;
        }
        if let Some(v) = file.max_connect_times {
            session.max_connect_times = v;
        }
        if let Some(v) = file.max_verify_times {
            session.max_verify_times = v;
        }
        if let Some(v) = file.write_high_water_mark {
            session.write_high_water_mark = v;
        }
        if let Some(v) = file.max_frame_size {
            session.max_frame_size = v;
        }

        let durations = [
            ("ack_timeout", file.ack_timeout, &mut session.ack_timeout),
            ("connect_timeout", file.connect_timeout, &mut session.connect_timeout),
            (
                "connect_retry_interval",
                file.connect_retry_interval,
                &mut session.connect_retry_interval,
            ),
            ("verify_timeout", file.verify_timeout, &mut session.verify_timeout),
            ("heartbeat_interval", file.heartbeat_interval, &mut session.heartbeat_interval),
            ("idle_timeout", file.idle_timeout, &mut session.idle_timeout),
            ("tick_interval", file.tick_interval, &mut session.tick_interval),
        ];
        for (key, value, slot) in durations {
            if let Some(text) = value {
                *slot = parse_duration(key, &text)?;
            }
        }
        Ok(())
    }

    /// Apply `LINK_*` overrides read through `lookup`
    fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("LINK_LISTEN") {
            self.listen_addr = v
                .parse::<SocketAddr>()
                .with_context(|| format!("LINK_LISTEN={}", v))?;
            info!("Listen address overridden by environment: {}", self.listen_addr);
        }
        if let Some(v) = lookup("LINK_CONNECT") {
            self.connect_addr = v
                .parse::<SocketAddr>()
                .with_context(|| format!("LINK_CONNECT={}", v))?;
            info!("Connect address overridden by environment: {}", self.connect_addr);
        }
        if let Some(v) = lookup("LINK_SESSION_ID") {
            let session_id = v
                .parse::<u64>()
                .with_context(|| format!("LINK_SESSION_ID={}", v))?;
            self.session_id = Some(session_id);
        }

        let session = &mut self.session;
        if let Some(v) = lookup("LINK_MAX_PENDING_MESSAGES") {
            session.max_pending_messages = v
                .parse::<usize>()
                .with_context(|| format!("LINK_MAX_PENDING_MESSAGES={}", v))?;
        }
        if let Some(v) = lookup("LINK_MAX_CACHE_MESSAGES") {
            session.max_cache_messages = v
                .parse::<usize>()
                .with_context(|| format!("LINK_MAX_CACHE_MESSAGES={}", v))?;
        }

        let durations = [
            ("LINK_ACK_TIMEOUT", &mut session.ack_timeout),
            ("LINK_CONNECT_TIMEOUT", &mut session.connect_timeout),
            ("LINK_HEARTBEAT_INTERVAL", &mut session.heartbeat_interval),
            ("LINK_IDLE_TIMEOUT", &mut session.idle_timeout),
        ];
        for (key, slot) in durations {
            if let Some(v) = lookup(key) {
                *slot = parse_duration(key, &v)?;
                info!("{} overridden by environment: {:?}", key, slot);
            }
        }
        Ok(())
    }
}

fn parse_duration(key: &str, text: &str) -> Result<Duration> {
    humantime::parse_duration(text.trim())
        .with_context(|| format!("Invalid duration for {}: {:?}", key, text))
}
