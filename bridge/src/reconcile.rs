use std::{future::Future, time::Duration};

use rapt_common::{ControllerStatus, Result, TemperatureCommand};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn};

use crate::api::{first_controller, ControllerApi};
use crate::bus::StatusSink;
use crate::token::{TokenEndpoint, TokenManager};

pub fn unix_now() -> i64 {
    chrono::Utc::now().timestamp()
}

/// Serialises polls and commands against the controller. All network I/O
/// for one action happens inline; nothing runs in parallel.
pub struct Reconciler<E, A, S> {
    tokens: TokenManager<E>,
    api: A,
    sink: S,
    settle_delay: Duration,
    clock: fn() -> i64,
}

impl<E, A, S> Reconciler<E, A, S>
where
    E: TokenEndpoint,
    A: ControllerApi,
    S: StatusSink,
{
    pub fn new(tokens: TokenManager<E>, api: A, sink: S, settle_delay: Duration) -> Self {
        Self {
            tokens,
            api,
            sink,
            settle_delay,
            clock: unix_now,
        }
    }

    /// One tick: read the controller and publish what it reports.
    pub async fn poll_and_publish(&mut self) -> Result<ControllerStatus> {
        let status = self.read_controller().await?;
        info!(
            device_id = %status.device_id,
            current_temp = %status.current_temperature,
            target_temp = %status.target_temperature,
            "controller status"
        );
        self.sink.publish_status(&status).await?;
        Ok(status)
    }

    /// Sets the new target, waits for the backend to apply it and publishes
    /// the state read back afterwards rather than echoing the request.
    pub async fn apply_command(&mut self, command: TemperatureCommand) -> Result<ControllerStatus> {
        info!(target_temp = %command.temperature, "new temperature requested");

        let device = self.read_controller().await?;
        let token = self.tokens.get_valid_token((self.clock)()).await?;
        let ack = self
            .api
            .set_target_temperature(&token, &device.device_id, command.temperature)
            .await;
        let ack = self.note_rejection(ack)?;
        info!(device_id = %device.device_id, %ack, "set target temperature acknowledged");

        if !self.settle_delay.is_zero() {
            tokio::time::sleep(self.settle_delay).await;
        }
        self.poll_and_publish().await
    }

    async fn read_controller(&mut self) -> Result<ControllerStatus> {
        let token = self.tokens.get_valid_token((self.clock)()).await?;
        let controllers = self.api.list_controllers(&token).await;
        first_controller(self.note_rejection(controllers)?)
    }

    fn note_rejection<T>(&mut self, result: Result<T>) -> Result<T> {
        if let Err(err) = &result {
            if err.is_unauthorized() {
                warn!("controller API rejected the token; it will be renewed");
                self.tokens.invalidate();
            }
        }
        result
    }
}

/// Logs a failed action and decides whether the loop may continue.
fn survive(action: &str, result: Result<ControllerStatus>) -> Result<()> {
    match result {
        Ok(_) => Ok(()),
        Err(err) if err.is_fatal() => {
            error!("{action} failed: {err}");
            Err(err)
        }
        Err(err) => {
            warn!("{action} failed, retrying next tick: {err}");
            Ok(())
        }
    }
}

/// Drives the bridge until `shutdown` resolves or a fatal error occurs.
///
/// Inbound commands are parked in a single slot and applied between polls,
/// so at most one is in flight. Commands that queued up meanwhile collapse
/// into the latest one.
pub async fn run<E, A, S, F>(
    mut reconciler: Reconciler<E, A, S>,
    mut commands: UnboundedReceiver<TemperatureCommand>,
    poll_interval: Duration,
    shutdown: F,
) -> Result<()>
where
    E: TokenEndpoint,
    A: ControllerApi,
    S: StatusSink,
    F: Future<Output = ()>,
{
    let mut interval = tokio::time::interval(poll_interval);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

    tokio::pin!(shutdown);

    let mut pending: Option<TemperatureCommand> = None;

    loop {
        if let Some(command) = pending.take() {
            survive("temperature command", reconciler.apply_command(command).await)?;
        }

        tokio::select! {
            biased;
            _ = &mut shutdown => {
                info!("shutdown requested");
                return Ok(());
            }
            Some(command) = commands.recv() => {
                park(&mut pending, command);
                while let Ok(command) = commands.try_recv() {
                    park(&mut pending, command);
                }
            }
            _ = interval.tick() => {
                survive("poll", reconciler.poll_and_publish().await)?;
            }
        }
    }
}

fn park(pending: &mut Option<TemperatureCommand>, command: TemperatureCommand) {
    if let Some(dropped) = pending.replace(command) {
        warn!(target_temp = %dropped.temperature, "superseded pending command");
    }
}

pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!("failed to listen for ctrl-c: {err}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                warn!("failed to listen for SIGTERM: {err}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
