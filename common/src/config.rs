use serde::{Deserialize, Serialize};

use crate::error::BridgeError;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RaptConfig {
    pub username: String,
    pub secret: String,
    pub client_id: String,
    pub auth_url: String,
    pub api_url: String,
    pub request_timeout_secs: u64,
}

impl Default for RaptConfig {
    fn default() -> Self {
        Self {
            username: String::new(),
            secret: String::new(),
            client_id: "rapt-user".to_string(),
            auth_url: "https://id.rapt.io/connect/token".to_string(),
            api_url: "https://api.rapt.io/api/".to_string(),
            request_timeout_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MqttConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub pass: String,
    pub client_id: String,
    pub keep_alive_secs: u64,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 1883,
            user: String::new(),
            pass: String::new(),
            client_id: "rapt-bridge".to_string(),
            keep_alive_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoopConfig {
    pub poll_interval_secs: u64,
    pub settle_delay_secs: u64,
    pub token_path: String,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: 60,
            settle_delay_secs: 5,
            token_path: "token.txt".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    pub rapt: RaptConfig,
    pub mqtt: MqttConfig,
    #[serde(rename = "loop")]
    pub timing: LoopConfig,
}

impl BridgeConfig {
    pub fn from_json(raw: &[u8]) -> Result<Self, BridgeError> {
        serde_json::from_slice(raw)
            .map_err(|err| BridgeError::Config(format!("invalid config file: {err}")))
    }

    /// Overlays environment variables on top of the file values. Numbers that
    /// do not parse leave the current value alone.
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let set = |target: &mut String, key: &str| {
            if let Some(value) = lookup(key) {
                *target = value;
            }
        };

        set(&mut self.rapt.username, "RAPT_USERNAME");
        set(&mut self.rapt.secret, "RAPT_SECRET");
        set(&mut self.rapt.auth_url, "RAPT_AUTH_URL");
        set(&mut self.rapt.api_url, "RAPT_API_URL");
        set(&mut self.timing.token_path, "RAPT_TOKEN_PATH");
        set(&mut self.mqtt.host, "MQTT_HOST");
        set(&mut self.mqtt.user, "MQTT_USER");
        set(&mut self.mqtt.pass, "MQTT_PASS");
        set(&mut self.mqtt.client_id, "MQTT_CLIENT_ID");

        if let Some(port) = lookup("MQTT_PORT").and_then(|value| value.parse::<u16>().ok()) {
            self.mqtt.port = port;
        }
        if let Some(secs) =
            lookup("RAPT_POLL_INTERVAL_SECS").and_then(|value| value.parse::<u64>().ok())
        {
            self.timing.poll_interval_secs = secs;
        }
        if let Some(secs) =
            lookup("RAPT_SETTLE_DELAY_SECS").and_then(|value| value.parse::<u64>().ok())
        {
            self.timing.settle_delay_secs = secs;
        }
    }

    pub fn sanitize(&mut self) {
        self.timing.poll_interval_secs = self.timing.poll_interval_secs.clamp(10, 3_600);
        self.timing.settle_delay_secs = self.timing.settle_delay_secs.clamp(0, 60);
        self.mqtt.keep_alive_secs = self.mqtt.keep_alive_secs.clamp(5, 600);
        self.rapt.request_timeout_secs = self.rapt.request_timeout_secs.clamp(1, 300);

        if !self.rapt.api_url.ends_with('/') {
            self.rapt.api_url.push('/');
        }
    }

    pub fn validate(&self) -> Result<(), BridgeError> {
        if self.rapt.username.trim().is_empty() {
            return Err(BridgeError::Config(
                "RAPT username is not set (RAPT_USERNAME)".to_string(),
            ));
        }
        if self.rapt.secret.is_empty() {
            return Err(BridgeError::Config(
                "RAPT API secret is not set (RAPT_SECRET)".to_string(),
            ));
        }
        if self.mqtt.host.trim().is_empty() {
            return Err(BridgeError::Config("MQTT host cannot be empty".to_string()));
        }
        if self.timing.token_path.trim().is_empty() {
            return Err(BridgeError::Config("token path cannot be empty".to_string()));
        }
        Ok(())
    }
}
