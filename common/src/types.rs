use std::{fmt, str::FromStr};

use serde::{
    de::{self, Visitor},
    Deserialize, Deserializer, Serialize, Serializer,
};

use crate::error::BridgeError;

/// Seconds a token is trusted after issue; the server side lifetime is one hour.
pub const TOKEN_FRESHNESS_SECS: i64 = 3590;

/// Fixed-point temperature in hundredths of a degree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Temperature(i64);

impl Temperature {
    pub const fn from_hundredths(hundredths: i64) -> Self {
        Self(hundredths)
    }

    pub const fn hundredths(self) -> i64 {
        self.0
    }

    /// Rounds to the nearest hundredth. API readings arrive as JSON numbers.
    pub fn from_f64(value: f64) -> Option<Self> {
        if !value.is_finite() {
            return None;
        }
        let scaled = (value * 100.0).round();
        if scaled.abs() >= i64::MAX as f64 {
            return None;
        }
        Some(Self(scaled as i64))
    }
}

impl fmt::Display for Temperature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sign = if self.0 < 0 { "-" } else { "" };
        let magnitude = self.0.unsigned_abs();
        write!(f, "{sign}{}.{:02}", magnitude / 100, magnitude % 100)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseTemperatureError(String);

impl fmt::Display for ParseTemperatureError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid temperature {:?}", self.0)
    }
}

impl std::error::Error for ParseTemperatureError {}

impl FromStr for Temperature {
    type Err = ParseTemperatureError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let invalid = || ParseTemperatureError(raw.to_string());
        let trimmed = raw.trim();
        let (negative, digits) = match trimmed.strip_prefix('-') {
            Some(rest) => (true, rest),
            None => (false, trimmed.strip_prefix('+').unwrap_or(trimmed)),
        };
        let (whole, frac) = digits.split_once('.').unwrap_or((digits, ""));

        if whole.is_empty() && frac.is_empty() {
            return Err(invalid());
        }
        if !whole.bytes().chain(frac.bytes()).all(|b| b.is_ascii_digit()) {
            return Err(invalid());
        }

        let whole: i64 = if whole.is_empty() {
            0
        } else {
            whole.parse().map_err(|_| invalid())?
        };

        // Anything past the second fractional digit rounds half away from zero.
        let mut frac_digits = frac.bytes().map(|b| i64::from(b - b'0'));
        let tenths = frac_digits.next().unwrap_or(0);
        let hundredths = frac_digits.next().unwrap_or(0);
        let carry = i64::from(frac_digits.next().is_some_and(|digit| digit >= 5));

        let magnitude = whole
            .checked_mul(100)
            .and_then(|value| value.checked_add(tenths * 10 + hundredths + carry))
            .ok_or_else(invalid)?;

        Ok(Self(if negative { -magnitude } else { magnitude }))
    }
}

impl Serialize for Temperature {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

struct TemperatureVisitor;

impl<'de> Visitor<'de> for TemperatureVisitor {
    type Value = Temperature;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("a temperature as a number or a decimal string")
    }

    fn visit_f64<E: de::Error>(self, value: f64) -> Result<Temperature, E> {
        Temperature::from_f64(value)
            .ok_or_else(|| E::custom(format!("temperature out of range: {value}")))
    }

    fn visit_i64<E: de::Error>(self, value: i64) -> Result<Temperature, E> {
        value
            .checked_mul(100)
            .map(Temperature)
            .ok_or_else(|| E::custom(format!("temperature out of range: {value}")))
    }

    fn visit_u64<E: de::Error>(self, value: u64) -> Result<Temperature, E> {
        i64::try_from(value)
            .map_err(|_| E::custom(format!("temperature out of range: {value}")))
            .and_then(|value| self.visit_i64(value))
    }

    fn visit_str<E: de::Error>(self, value: &str) -> Result<Temperature, E> {
        value.parse().map_err(E::custom)
    }
}

impl<'de> Deserialize<'de> for Temperature {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_any(TemperatureVisitor)
    }
}

/// One entry of `GetTemperatureControllers`. Unknown fields are ignored.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ControllerStatus {
    #[serde(rename = "id")]
    pub device_id: String,
    #[serde(rename = "temperature")]
    pub current_temperature: Temperature,
    #[serde(rename = "targetTemperature")]
    pub target_temperature: Temperature,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusPayload {
    pub device_id: String,
    pub current_temp: String,
    pub target_temp: String,
}

impl From<&ControllerStatus> for StatusPayload {
    fn from(status: &ControllerStatus) -> Self {
        Self {
            device_id: status.device_id.clone(),
            current_temp: status.current_temperature.to_string(),
            target_temp: status.target_temperature.to_string(),
        }
    }
}

impl StatusPayload {
    pub fn to_bytes(&self) -> Result<Vec<u8>, BridgeError> {
        serde_json::to_vec(self)
            .map_err(|err| BridgeError::Transport(format!("failed to encode status: {err}")))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct TemperatureCommand {
    #[serde(rename = "Temperature")]
    pub temperature: Temperature,
}

impl TemperatureCommand {
    /// Home Assistant publishes a bare fragment such as `"Temperature": "18.50"`;
    /// it is wrapped in braces before parsing. Full objects are accepted as-is.
    pub fn from_payload(payload: &[u8]) -> Result<Self, BridgeError> {
        let text = std::str::from_utf8(payload)
            .map_err(|err| BridgeError::MalformedCommand(format!("non utf8 payload: {err}")))?
            .trim();

        let document = if text.starts_with('{') {
            text.to_string()
        } else {
            format!("{{{text}}}")
        };

        serde_json::from_str(&document)
            .map_err(|err| BridgeError::MalformedCommand(format!("{err} in {text:?}")))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credential {
    pub issued_at: i64,
    pub token: String,
}

/// Last second of year 9999; stamps past it are not clock readings.
const LATEST_PLAUSIBLE_STAMP: i64 = 253_402_300_799;

impl Credential {
    pub fn age(&self, now: i64) -> i64 {
        now.saturating_sub(self.issued_at)
    }

    pub fn is_fresh(&self, now: i64) -> bool {
        self.age(now) <= TOKEN_FRESHNESS_SECS
    }

    /// Line one is the issue timestamp, line two the token.
    pub fn to_file_contents(&self) -> String {
        format!("{}\n{}", self.issued_at, self.token)
    }

    pub fn parse(contents: &str) -> Option<Self> {
        let mut lines = contents.lines();
        let stamp = lines.next()?.trim();
        let issued_at = stamp
            .parse::<i64>()
            .ok()
            .or_else(|| {
                stamp
                    .parse::<f64>()
                    .ok()
                    .filter(|value| (0.0..=LATEST_PLAUSIBLE_STAMP as f64).contains(value))
                    .map(|value| value.round() as i64)
            })
            .filter(|stamp| (0..=LATEST_PLAUSIBLE_STAMP).contains(stamp))?;

        let token = lines.next()?.trim();
        if token.is_empty() {
            return None;
        }

        Some(Self {
            issued_at,
            token: token.to_string(),
        })
    }
}
