use std::time::Duration;

use rapt_common::{
    BridgeError, ControllerStatus, MqttConfig, Result, StatusPayload, TemperatureCommand,
    TOPIC_CONTROLLER_COMMAND, TOPIC_CONTROLLER_STATUS,
};
use rumqttc::{AsyncClient, Event, EventLoop, Incoming, MqttOptions, Outgoing, QoS};
use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinHandle;
use tracing::{info, warn};

const MAX_COMMAND_PAYLOAD_BYTES: usize = 512;
const REQUEST_CHANNEL_CAPACITY: usize = 64;

pub trait StatusSink {
    async fn publish_status(&self, status: &ControllerStatus) -> Result<()>;
}

pub fn build_options(config: &MqttConfig) -> MqttOptions {
    let mut options = MqttOptions::new(config.client_id.clone(), config.host.clone(), config.port);
    options.set_keep_alive(Duration::from_secs(config.keep_alive_secs));
    if !config.user.is_empty() {
        options.set_credentials(config.user.clone(), config.pass.clone());
    }
    options
}

/// Client half of the broker connection. Every request is queued without
/// waiting, so a broker outage surfaces as a `Transport` error instead of
/// stalling the caller once the request channel is full.
#[derive(Clone)]
pub struct MqttBus {
    client: AsyncClient,
}

impl MqttBus {
    pub fn connect(config: &MqttConfig) -> (Self, EventLoop) {
        info!("connecting to MQTT broker at {}:{}", config.host, config.port);
        let (client, eventloop) = AsyncClient::new(build_options(config), REQUEST_CHANNEL_CAPACITY);
        (Self { client }, eventloop)
    }

    /// Called on every ConnAck so a reconnect with a clean session resubscribes.
    pub fn subscribe_commands(&self) -> Result<()> {
        self.client
            .try_subscribe(TOPIC_CONTROLLER_COMMAND, QoS::AtMostOnce)
            .map_err(|err| BridgeError::Transport(format!("subscribe failed: {err}")))?;
        info!("subscribed to {TOPIC_CONTROLLER_COMMAND}");
        Ok(())
    }

    /// Queues a DISCONNECT; the event loop task stops once it has been sent.
    pub fn disconnect(&self) -> Result<()> {
        self.client
            .try_disconnect()
            .map_err(|err| BridgeError::Transport(format!("disconnect failed: {err}")))
    }
}

impl StatusSink for MqttBus {
    async fn publish_status(&self, status: &ControllerStatus) -> Result<()> {
        let payload = StatusPayload::from(status).to_bytes()?;
        self.client
            .try_publish(TOPIC_CONTROLLER_STATUS, QoS::AtMostOnce, false, payload)
            .map_err(|err| BridgeError::Transport(format!("publish failed: {err}")))
    }
}

/// What the event loop task does with one transport event.
#[derive(Debug, PartialEq)]
pub enum BusAction {
    Subscribe,
    Forward(TemperatureCommand),
    Stop,
    Ignore,
}

pub fn classify_event(event: Event) -> BusAction {
    match event {
        Event::Incoming(Incoming::ConnAck(_)) => BusAction::Subscribe,
        Event::Incoming(Incoming::Publish(message)) => {
            match decode_command(&message.topic, &message.payload) {
                Some(Ok(command)) => BusAction::Forward(command),
                Some(Err(err)) => {
                    warn!("dropping command: {err}");
                    BusAction::Ignore
                }
                None => BusAction::Ignore,
            }
        }
        Event::Outgoing(Outgoing::Disconnect) => BusAction::Stop,
        _ => BusAction::Ignore,
    }
}

/// Polls the broker connection on its own task and forwards decoded commands.
/// Ends after our DISCONNECT went out or once nobody receives commands.
pub fn spawn_event_loop(
    bus: MqttBus,
    mut eventloop: EventLoop,
    commands: UnboundedSender<TemperatureCommand>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match eventloop.poll().await {
                Ok(event) => match classify_event(event) {
                    BusAction::Subscribe => {
                        info!("mqtt connected");
                        if let Err(err) = bus.subscribe_commands() {
                            warn!("{err}; retrying on next connect");
                        }
                    }
                    BusAction::Forward(command) => {
                        if commands.send(command).is_err() {
                            break;
                        }
                    }
                    BusAction::Stop => {
                        info!("mqtt disconnected");
                        break;
                    }
                    BusAction::Ignore => {}
                },
                Err(err) => {
                    warn!("mqtt poll error: {err}");
                    tokio::time::sleep(Duration::from_secs(2)).await;
                }
            }
        }
    })
}

/// `None` for traffic on other topics.
pub fn decode_command(topic: &str, payload: &[u8]) -> Option<Result<TemperatureCommand>> {
    if topic != TOPIC_CONTROLLER_COMMAND {
        return None;
    }
    if payload.len() > MAX_COMMAND_PAYLOAD_BYTES {
        return Some(Err(BridgeError::MalformedCommand(format!(
            "oversized payload ({} bytes)",
            payload.len()
        ))));
    }
    Some(TemperatureCommand::from_payload(payload))
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use rapt_common::Temperature;
    use rumqttc::{ConnAck, ConnectReturnCode, Publish};

    use super::*;

    #[test]
    fn decodes_commands_on_command_topic_only() {
        let payload = br#""Temperature": "18.50""#;

        assert!(decode_command(TOPIC_CONTROLLER_STATUS, payload).is_none());
        assert!(decode_command("RAPT/other", payload).is_none());

        let command = decode_command(TOPIC_CONTROLLER_COMMAND, payload)
            .unwrap()
            .unwrap();
        assert_eq!(command.temperature, Temperature::from_hundredths(1850));
    }

    #[test]
    fn rejects_oversized_payload() {
        let payload = format!(r#""Temperature": "18.50", "pad": "{}""#, "x".repeat(600));
        let result = decode_command(TOPIC_CONTROLLER_COMMAND, payload.as_bytes()).unwrap();
        assert!(matches!(result, Err(BridgeError::MalformedCommand(_))));
    }

    #[test]
    fn malformed_command_is_reported_not_panicked() {
        let result = decode_command(TOPIC_CONTROLLER_COMMAND, br#"{"Foo": "bar"}"#).unwrap();
        assert!(matches!(result, Err(BridgeError::MalformedCommand(_))));
    }

    #[test]
    fn options_follow_config() {
        let mut config = MqttConfig::default();
        config.host = "192.168.0.252".to_string();
        config.keep_alive_secs = 45;

        let options = build_options(&config);

        assert_eq!(options.client_id(), "rapt-bridge");
        assert_eq!(
            options.broker_address(),
            ("192.168.0.252".to_string(), 1883)
        );
        assert_eq!(options.keep_alive(), Duration::from_secs(45));
    }

    fn status() -> ControllerStatus {
        ControllerStatus {
            device_id: "dev-1".to_string(),
            current_temperature: Temperature::from_hundredths(1910),
            target_temperature: Temperature::from_hundredths(1800),
        }
    }

    #[tokio::test]
    async fn publish_fails_fast_when_request_channel_is_full() {
        let (client, _eventloop) = AsyncClient::new(build_options(&MqttConfig::default()), 1);
        let bus = MqttBus { client };

        bus.publish_status(&status()).await.unwrap();
        let err = bus.publish_status(&status()).await.unwrap_err();

        assert!(matches!(err, BridgeError::Transport(_)));
        assert!(!err.is_fatal());
    }

    #[tokio::test]
    async fn subscribe_failure_is_a_transport_error() {
        let (client, eventloop) = AsyncClient::new(build_options(&MqttConfig::default()), 1);
        drop(eventloop);
        let bus = MqttBus { client };

        let err = bus.subscribe_commands().unwrap_err();

        assert!(matches!(err, BridgeError::Transport(_)));
        assert!(!err.is_fatal());
        assert!(bus.disconnect().is_err());
    }

    #[test]
    fn connack_requests_subscription() {
        let event = Event::Incoming(Incoming::ConnAck(ConnAck::new(
            ConnectReturnCode::Success,
            false,
        )));
        assert_eq!(classify_event(event), BusAction::Subscribe);
    }

    #[test]
    fn command_publish_is_forwarded_and_other_traffic_ignored() {
        let command = Event::Incoming(Incoming::Publish(Publish::new(
            TOPIC_CONTROLLER_COMMAND,
            QoS::AtMostOnce,
            br#""Temperature": "18.50""#.to_vec(),
        )));
        let malformed = Event::Incoming(Incoming::Publish(Publish::new(
            TOPIC_CONTROLLER_COMMAND,
            QoS::AtMostOnce,
            b"18.50".to_vec(),
        )));
        let own_status = Event::Incoming(Incoming::Publish(Publish::new(
            TOPIC_CONTROLLER_STATUS,
            QoS::AtMostOnce,
            b"{}".to_vec(),
        )));

        assert_eq!(
            classify_event(command),
            BusAction::Forward(TemperatureCommand {
                temperature: Temperature::from_hundredths(1850),
            })
        );
        assert_eq!(classify_event(malformed), BusAction::Ignore);
        assert_eq!(classify_event(own_status), BusAction::Ignore);
        assert_eq!(classify_event(Event::Outgoing(Outgoing::PingReq)), BusAction::Ignore);
    }

    #[test]
    fn sent_disconnect_stops_the_event_loop() {
        assert_eq!(
            classify_event(Event::Outgoing(Outgoing::Disconnect)),
            BusAction::Stop
        );
    }
}
