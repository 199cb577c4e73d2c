//! Optional MQTT wake-up listener (`--features mqtt`).
//!
//! Subscribes to `agent/{uuid}/update`; any message pokes the poll loop for
//! an immediate, coalesced poll. The broker is an external collaborator;
//! nothing here publishes.

use std::time::Duration;

use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS, TlsConfiguration, Transport};
use skiff_domain::{MqttConfig, MqttProtocol};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::wakeup::Wakeup;

const RECONNECT_DELAY: Duration = Duration::from_secs(5);

pub async fn run_wake_listener(
    config: MqttConfig,
    device_uuid: Uuid,
    wakeup: Wakeup,
    cancel: CancellationToken,
) {
    let topic = format!("agent/{}/update", device_uuid);

    loop {
        if cancel.is_cancelled() {
            return;
        }

        let mut options = MqttOptions::new(
            format!("skiff-{}", device_uuid),
            config.broker_host.clone(),
            config.broker_port,
        );
        options.set_keep_alive(Duration::from_secs(30));
        if let (Some(user), Some(pass)) = (&config.username, &config.password) {
            options.set_credentials(user.clone(), pass.expose().to_string());
        }
        if config.protocol == MqttProtocol::Tls {
            let ca = config
                .ca_chain
                .as_ref()
                .map(|pem| pem.as_bytes().to_vec())
                .unwrap_or_default();
            options.set_transport(Transport::Tls(TlsConfiguration::Simple {
                ca,
                alpn: None,
                client_auth: None,
            }));
        }

        let (client, mut eventloop) = AsyncClient::new(options, 16);
        if let Err(e) = client.subscribe(&topic, QoS::AtLeastOnce).await {
            warn!(error = %e, "mqtt subscribe failed");
        } else {
            info!(topic = %topic, "mqtt wake listener subscribed");
        }

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                event = eventloop.poll() => match event {
                    Ok(Event::Incoming(Packet::Publish(publish))) if publish.topic == topic => {
                        debug!("mqtt update message, waking poll loop");
                        wakeup.poke();
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!(error = %e, "mqtt connection lost, reconnecting");
                        break;
                    }
                }
            }
        }

        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(RECONNECT_DELAY) => {}
        }
    }
}
