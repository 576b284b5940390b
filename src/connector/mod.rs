//! Connector runtime.
//!
//! Wires the relay link, the bridge, and the gateway client together and
//! supervises them until shutdown. The gateway's terminal auth failure is
//! the only error that escapes; everything else retries internally.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::Config;
use crate::gateway::{GatewayClient, GatewayError, GatewayHandlers};
use crate::protocol::Event;

pub mod bridge;
pub mod relay_link;

use bridge::{Bridge, EchoBridge, GatewayBridge, GatewaySender, RelaySender};
use relay_link::RelayLink;

impl GatewaySender for GatewayClient {
    fn send_user_message(&self, session_id: &str, event: &Event) -> Result<(), GatewayError> {
        GatewayClient::send_user_message(self, session_id, event)
    }

    fn send_cancel(&self, session_id: &str) -> Result<(), GatewayError> {
        GatewayClient::send_cancel(self, session_id)
    }

    fn is_ready(&self) -> bool {
        GatewayClient::is_ready(self)
    }
}

/// Run the connector until the shutdown token fires. Returns `Err` only for
/// the gateway's terminal auth failure so the caller can exit distinctly.
pub async fn run_connector(
    cfg: Config,
    echo: bool,
    shutdown: CancellationToken,
) -> Result<(), GatewayError> {
    let cfg = Arc::new(cfg);
    let link = RelayLink::new(cfg.clone());

    if echo {
        info!(
            relay_url = %cfg.relay_url,
            access_code_hash = %cfg.access_code_hash,
            "connector starting in echo mode"
        );
        let echo_bridge: Arc<dyn Bridge> =
            EchoBridge::new(link.clone() as Arc<dyn RelaySender>);
        link.run(echo_bridge, shutdown).await;
        return Ok(());
    }

    let gateway_bridge = GatewayBridge::new(link.clone() as Arc<dyn RelaySender>);

    let event_bridge = gateway_bridge.clone();
    let disconnect_bridge = gateway_bridge.clone();
    let gateway = GatewayClient::new(
        cfg.gateway.clone(),
        GatewayHandlers {
            on_event: Box::new(move |session_id, event| {
                event_bridge.handle_gateway_event(session_id, event);
            }),
            on_disconnected: Box::new(move |error| {
                disconnect_bridge.handle_gateway_disconnected(error);
            }),
            on_ready: Box::new(|| info!("gateway connected and ready")),
        },
    );
    gateway_bridge.bind_gateway(gateway.clone() as Arc<dyn GatewaySender>);

    info!(
        relay_url = %cfg.relay_url,
        access_code_hash = %cfg.access_code_hash,
        gateway_url = %cfg.gateway.url,
        "connector starting"
    );

    let relay_task = tokio::spawn(
        link.run(gateway_bridge.clone() as Arc<dyn Bridge>, shutdown.clone()),
    );

    let result = gateway.run(shutdown.clone()).await;

    // Whether the gateway exited for shutdown or auth failure, take the
    // relay link down with it.
    shutdown.cancel();
    let _ = relay_task.await;
    result
}
