use std::{net::SocketAddr, str::FromStr, time::Duration};

use crate::{RelayError, RelayResult};

pub const BIND: &str = "RELAY_BIND";
pub const HANDSHAKE_TIMEOUT_MS: &str = "RELAY_HANDSHAKE_TIMEOUT_MS";
pub const SEND_TIMEOUT_MS: &str = "RELAY_SEND_TIMEOUT_MS";
pub const OUTBOX_CAPACITY: &str = "RELAY_OUTBOX_CAPACITY";
pub const HISTORY_LIMIT: &str = "RELAY_HISTORY_LIMIT";
pub const PRUNE_EMPTY_ROOMS: &str = "RELAY_PRUNE_EMPTY_ROOMS";

/// Runtime settings for the relay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayConfig {
    pub bind_addr: SocketAddr,
    /// Bounds both the upgrade request and the room join that follows it.
    pub handshake_timeout: Duration,
    /// Bounds every individual socket write.
    pub send_timeout: Duration,
    /// Frames queued per peer before further frames to it are dropped.
    pub outbox_capacity: usize,
    /// Records kept per peer for replay. `None` keeps everything.
    pub history_limit: Option<usize>,
    pub prune_empty_rooms: bool,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 8443)),
            handshake_timeout: Duration::from_secs(10),
            send_timeout: Duration::from_secs(5),
            outbox_capacity: 256,
            history_limit: None,
            prune_empty_rooms: true,
        }
    }
}

impl RelayConfig {
    /// Loads `.env` if present, then reads the `RELAY_*` variables.
    pub fn from_env() -> RelayResult<Self> {
        dotenv::dotenv().ok();
        Self::from_lookup(|key| dotenv::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> RelayResult<Self> {
        let defaults = Self::default();

        let outbox_capacity = parse(&lookup, OUTBOX_CAPACITY)?.unwrap_or(defaults.outbox_capacity);
        if outbox_capacity == 0 {
            return Err(RelayError::Config(format!("{OUTBOX_CAPACITY} must be at least 1")));
        }

        Ok(Self {
            bind_addr: parse(&lookup, BIND)?.unwrap_or(defaults.bind_addr),
            handshake_timeout: parse(&lookup, HANDSHAKE_TIMEOUT_MS)?
                .map(Duration::from_millis)
                .unwrap_or(defaults.handshake_timeout),
            send_timeout: parse(&lookup, SEND_TIMEOUT_MS)?
                .map(Duration::from_millis)
                .unwrap_or(defaults.send_timeout),
            outbox_capacity,
            history_limit: parse(&lookup, HISTORY_LIMIT)?.or(defaults.history_limit),
            prune_empty_rooms: parse(&lookup, PRUNE_EMPTY_ROOMS)?.unwrap_or(defaults.prune_empty_rooms),
        })
    }
}

fn parse<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> RelayResult<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    let Some(raw) = lookup(key) else {
        return Ok(None);
    };
    let raw = raw.trim();
    if raw.is_empty() {
        return Ok(None);
    }

    raw.parse()
        .map(Some)
        .map_err(|e| RelayError::Config(format!("{key}={raw:?}: {e}")))
}
