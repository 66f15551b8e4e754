use rapt_common::{BridgeError, ControllerStatus, Result, Temperature};
use reqwest::header::ACCEPT;

const LIST_CONTROLLERS: &str = "TemperatureControllers/GetTemperatureControllers";
const SET_TARGET_TEMPERATURE: &str = "TemperatureControllers/SetTargetTemperature";

pub trait ControllerApi {
    async fn list_controllers(&self, token: &str) -> Result<Vec<ControllerStatus>>;

    /// Returns the raw acknowledgement body.
    async fn set_target_temperature(
        &self,
        token: &str,
        device_id: &str,
        target: Temperature,
    ) -> Result<String>;
}

pub struct RaptApiClient {
    http: reqwest::Client,
    base_url: String,
}

impl RaptApiClient {
    /// `base_url` must end with a slash, e.g. `https://api.rapt.io/api/`.
    pub fn new(http: reqwest::Client, base_url: impl Into<String>) -> Self {
        Self {
            http,
            base_url: base_url.into(),
        }
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    async fn read_body(endpoint: &str, response: reqwest::Response) -> Result<String> {
        let status = response.status();
        if !status.is_success() {
            return Err(BridgeError::Api {
                status: status.as_u16(),
                endpoint: endpoint.to_string(),
            });
        }
        response
            .text()
            .await
            .map_err(|err| network_error(endpoint, err))
    }
}

impl ControllerApi for RaptApiClient {
    async fn list_controllers(&self, token: &str) -> Result<Vec<ControllerStatus>> {
        let endpoint = self.endpoint(LIST_CONTROLLERS);
        let response = self
            .http
            .get(&endpoint)
            .header(ACCEPT, "application/json")
            .bearer_auth(token)
            .send()
            .await
            .map_err(|err| network_error(&endpoint, err))?;

        let body = Self::read_body(&endpoint, response).await?;
        parse_controllers(&endpoint, &body)
    }

    async fn set_target_temperature(
        &self,
        token: &str,
        device_id: &str,
        target: Temperature,
    ) -> Result<String> {
        let endpoint = self.endpoint(SET_TARGET_TEMPERATURE);
        let target = target.to_string();
        let form = [
            ("temperatureControllerId", device_id),
            ("target", target.as_str()),
        ];

        let response = self
            .http
            .post(&endpoint)
            .header(ACCEPT, "application/json")
            .bearer_auth(token)
            .form(&form)
            .send()
            .await
            .map_err(|err| network_error(&endpoint, err))?;

        Self::read_body(&endpoint, response).await
    }
}

pub fn parse_controllers(endpoint: &str, body: &str) -> Result<Vec<ControllerStatus>> {
    serde_json::from_str(body).map_err(|err| BridgeError::Protocol {
        endpoint: endpoint.to_string(),
        detail: err.to_string(),
    })
}

/// Only one controller is addressed. Extra entries are ignored.
pub fn first_controller(controllers: Vec<ControllerStatus>) -> Result<ControllerStatus> {
    controllers
        .into_iter()
        .next()
        .ok_or(BridgeError::NoController)
}

pub fn network_error(endpoint: &str, err: reqwest::Error) -> BridgeError {
    BridgeError::Network {
        endpoint: endpoint.to_string(),
        detail: err.to_string(),
    }
}
