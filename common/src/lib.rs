pub mod config;
pub mod error;
pub mod topics;
pub mod types;

pub use config::{BridgeConfig, LoopConfig, MqttConfig, RaptConfig};
pub use error::{BridgeError, Result};
pub use topics::*;
pub use types::{
    ControllerStatus, Credential, StatusPayload, Temperature, TemperatureCommand,
    TOKEN_FRESHNESS_SECS,
};
