use crate::error::{Error, Result};
use std::env;

pub const DEFAULT_RELAY_ADDRESS: &str = "ws://127.0.0.1:5000";
pub const DEFAULT_ICE_SERVER: &str = "stun:stun.l.google.com:19302";

/// Everything needed to enter a room.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    pub room_id: String,
    pub display_name: String,
    pub relay_address: String,
    pub ice_servers: Vec<String>,
}

impl SessionConfig {
    pub fn new(room_id: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            room_id: room_id.into(),
            display_name: display_name.into(),
            relay_address: DEFAULT_RELAY_ADDRESS.to_string(),
            ice_servers: vec![DEFAULT_ICE_SERVER.to_string()],
        }
    }

    pub fn with_relay(mut self, relay_address: impl Into<String>) -> Self {
        self.relay_address = relay_address.into();
        self
    }

    /// Reads `MESHROOM_*` variables, after loading a `.env` file if present.
    pub fn from_env() -> Result<Self> {
        dotenv::dotenv().ok();

        let config = Self {
            room_id: env::var("MESHROOM_ROOM").unwrap_or_default(),
            display_name: env::var("MESHROOM_NAME").unwrap_or_default(),
            relay_address: env::var("MESHROOM_RELAY")
                .unwrap_or_else(|_| DEFAULT_RELAY_ADDRESS.to_string()),
            ice_servers: env::var("MESHROOM_ICE_SERVERS")
                .map(|v| parse_ice_servers(&v))
                .unwrap_or_else(|_| vec![DEFAULT_ICE_SERVER.to_string()]),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.room_id.trim().is_empty() {
            return Err(Error::Config("room id must not be empty".to_string()));
        }
        if self.display_name.trim().is_empty() {
            return Err(Error::Config("display name must not be empty".to_string()));
        }
        if self.relay_address.trim().is_empty() {
            return Err(Error::Config("relay address must not be empty".to_string()));
        }
        Ok(())
    }
}

fn parse_ice_servers(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}
