use serde::{Deserialize, Serialize};
use skiff_domain::{MqttConfig, MqttProtocol, Secret};
use uuid::Uuid;

use crate::error::ProvisionError;

// ── Phase 1: key exchange ─────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
pub struct KeyExchangeRequest<'a> {
    pub device_uuid: Uuid,
    pub provisioning_secret: &'a str,
}

#[derive(Debug, Deserialize)]
pub struct KeyExchangeResponse {
    /// Cloud-side RSA public key, PEM.
    pub public_key: String,
    pub key_id: String,
}

#[derive(Debug, Serialize)]
pub struct PublicKeyUpload<'a> {
    pub device_uuid: Uuid,
    pub provisioning_secret: &'a str,
    pub device_public_key: String,
}

// ── Phase 2: registration ─────────────────────────────────────────────────────

/// Plaintext of the encrypted registration payload.
#[derive(Debug, Serialize)]
pub struct Registration<'a> {
    pub device_uuid: Uuid,
    pub provisioning_secret: &'a str,
    pub device_name: &'a str,
    pub device_type: &'a str,
    pub mac: Option<String>,
    pub os_version: String,
    pub agent_version: &'a str,
}

#[derive(Debug, Serialize)]
pub struct RegisterRequest {
    pub device_uuid: Uuid,
    pub key_id: String,
    /// base64 of the concatenated OAEP ciphertext blocks.
    pub encrypted_payload: String,
}

#[derive(Debug, Deserialize)]
pub struct RegisterResponse {
    pub device_id: String,
    pub mqtt: MqttGrant,
    pub api: ApiGrant,
}

#[derive(Debug, Deserialize)]
pub struct MqttGrant {
    /// e.g. `mqtts://broker.example:8883`
    pub broker_url: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub broker_config: Option<BrokerConfig>,
}

#[derive(Debug, Deserialize, Default)]
pub struct BrokerConfig {
    #[serde(default)]
    pub ca_chain: Option<String>,
    #[serde(default)]
    pub verify: Option<bool>,
}

#[derive(Debug, Deserialize)]
pub struct ApiGrant {
    pub endpoint: String,
    pub device_api_key: String,
    #[serde(default)]
    pub tls_config: Option<TlsGrant>,
}

#[derive(Debug, Deserialize, Default)]
pub struct TlsGrant {
    #[serde(default)]
    pub ca_chain: Option<String>,
    #[serde(default)]
    pub verify: Option<bool>,
}

impl MqttGrant {
    /// Split the broker URL into the identity's MQTT config. Scheme selects
    /// the protocol tag; the port defaults per scheme.
    pub fn into_config(self) -> Result<MqttConfig, ProvisionError> {
        let (protocol, rest, default_port) =
            if let Some(rest) = self.broker_url.strip_prefix("mqtts://") {
                (MqttProtocol::Tls, rest, 8883)
            } else if let Some(rest) = self.broker_url.strip_prefix("ssl://") {
                (MqttProtocol::Tls, rest, 8883)
            } else if let Some(rest) = self.broker_url.strip_prefix("mqtt://") {
                (MqttProtocol::Plain, rest, 1883)
            } else if let Some(rest) = self.broker_url.strip_prefix("tcp://") {
                (MqttProtocol::Plain, rest, 1883)
            } else {
                return Err(ProvisionError::Protocol(format!(
                    "unrecognized broker url scheme: {}",
                    self.broker_url
                )));
            };

        let rest = rest.trim_end_matches('/');
        let (host, port) = match rest.rsplit_once(':') {
            Some((host, port)) => {
                let port = port.parse::<u16>().map_err(|_| {
                    ProvisionError::Protocol(format!("bad broker port in {}", self.broker_url))
                })?;
                (host.to_string(), port)
            }
            None => (rest.to_string(), default_port),
        };
        if host.is_empty() {
            return Err(ProvisionError::Protocol(format!(
                "empty broker host in {}",
                self.broker_url
            )));
        }

        let broker = self.broker_config.unwrap_or_default();
        Ok(MqttConfig {
            broker_host: host,
            broker_port: port,
            protocol,
            username: self.username,
            password: self.password.map(Secret::new),
            ca_chain: broker.ca_chain,
            verify: broker.verify.unwrap_or(true),
        })
    }
}
