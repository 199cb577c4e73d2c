use std::sync::Arc;

use base64::Engine as _;
use chrono::Utc;
use skiff_domain::{Identity, Secret, TlsConfig};
use skiff_http::{CloudClient, CloudClientConfig, HttpResponse};
use skiff_store::{DeviceStore, StoreError};
use tracing::{info, warn};
use uuid::Uuid;

use crate::crypto;
use crate::error::ProvisionError;
use crate::host_facts;
use crate::protocol::{
    KeyExchangeRequest, KeyExchangeResponse, PublicKeyUpload, RegisterRequest, RegisterResponse,
    Registration,
};

pub const AGENT_VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Debug, Clone)]
pub struct ProvisionRequest {
    pub api_endpoint: String,
    pub provisioning_secret: Secret,
    pub device_name: String,
    pub device_type: String,
}

/// Run the two-phase provisioning protocol and persist the resulting
/// identity. Idempotent: an already provisioned identity is returned as-is.
///
/// The provisioning secret lives only on this call stack; it is neither
/// persisted nor logged.
pub async fn provision(
    store: Arc<dyn DeviceStore>,
    req: &ProvisionRequest,
) -> Result<Identity, ProvisionError> {
    // Mint and persist the uuid before the first network call so a crash
    // mid-protocol keeps the same device identity on retry.
    let identity = match store.load_identity().await? {
        Some(id) => id,
        None => {
            let id = Identity::unprovisioned(
                Uuid::new_v4(),
                &req.device_name,
                &req.device_type,
                &req.api_endpoint,
            );
            store.save_identity(&id).await?;
            id
        }
    };
    if identity.provisioned {
        return Ok(identity);
    }

    let client = CloudClient::new(CloudClientConfig::new(
        req.api_endpoint.trim_end_matches('/'),
    ))
    .map_err(|e| ProvisionError::Protocol(e.to_string()))?;
    let secret = req.provisioning_secret.expose();

    // ── Phase 1: key exchange ────────────────────────────────────────────────
    info!(device_uuid = %identity.uuid, "provisioning phase 1: key exchange");
    let resp = client
        .post_json(
            "/provisioning/v2/key-exchange",
            &to_value(&KeyExchangeRequest {
                device_uuid: identity.uuid,
                provisioning_secret: secret,
            })?,
        )
        .await?;
    check_status(&resp)?;
    let kx: KeyExchangeResponse = serde_json::from_slice(&resp.body)
        .map_err(|e| ProvisionError::Protocol(format!("key-exchange response: {e}")))?;
    let cloud_key = crypto::parse_public_key_pem(&kx.public_key)?;

    // The device keypair: the public half goes up, the private half never
    // leaves this function. Nothing in the agent consumes cloud-encrypted
    // payloads after registration, so it is not retained.
    let (_device_private, device_public) = crypto::generate_keypair()?;
    let resp = client
        .post_json(
            "/provisioning/v2/key-exchange",
            &to_value(&PublicKeyUpload {
                device_uuid: identity.uuid,
                provisioning_secret: secret,
                device_public_key: crypto::public_key_pem(&device_public)?,
            })?,
        )
        .await?;
    check_status(&resp)?;

    // ── Phase 2: registration ────────────────────────────────────────────────
    info!(device_uuid = %identity.uuid, "provisioning phase 2: registration");
    let registration = Registration {
        device_uuid: identity.uuid,
        provisioning_secret: secret,
        device_name: &req.device_name,
        device_type: &req.device_type,
        mac: host_facts::mac_address(),
        os_version: host_facts::os_version(),
        agent_version: AGENT_VERSION,
    };
    let plaintext = serde_json::to_vec(&registration)
        .map_err(|e| ProvisionError::Protocol(e.to_string()))?;
    let ciphertext = crypto::encrypt_chunked(&cloud_key, &plaintext)?;

    let resp = client
        .post_json(
            "/provisioning/v2/register",
            &to_value(&RegisterRequest {
                device_uuid: identity.uuid,
                key_id: kx.key_id,
                encrypted_payload: base64::engine::general_purpose::STANDARD.encode(ciphertext),
            })?,
        )
        .await?;
    check_status(&resp)?;
    let grants: RegisterResponse = serde_json::from_slice(&resp.body)
        .map_err(|e| ProvisionError::Protocol(format!("register response: {e}")))?;

    let mqtt = grants.mqtt.into_config()?;
    if grants.api.device_api_key.is_empty() {
        return Err(ProvisionError::Protocol("empty device_api_key".into()));
    }

    let mut provisioned = identity;
    provisioned.device_id = Some(grants.device_id);
    provisioned.device_name = req.device_name.clone();
    provisioned.device_type = req.device_type.clone();
    provisioned.api_endpoint = grants.api.endpoint;
    provisioned.device_api_key = Some(Secret::new(grants.api.device_api_key));
    provisioned.mqtt = Some(mqtt);
    provisioned.api_tls = grants.api.tls_config.map(|t| TlsConfig {
        ca_chain: t.ca_chain,
        verify: t.verify.unwrap_or(true),
    });
    provisioned.provisioned = true;
    provisioned.registered_at = Some(Utc::now());

    // All fields land in one store write.
    store.save_identity(&provisioned).await?;
    info!(
        device_uuid = %provisioned.uuid,
        device_id = provisioned.device_id.as_deref().unwrap_or("?"),
        "device provisioned"
    );
    Ok(provisioned)
}

/// Inform the cloud, then clear everything but uuid and device_api_key.
pub async fn deprovision(
    store: Arc<dyn DeviceStore>,
    client: &CloudClient,
) -> Result<(), ProvisionError> {
    let identity = store
        .load_identity()
        .await?
        .ok_or(StoreError::IdentityMissing)?;
    let resp = client
        .post_json(
            "/provisioning/v2/deprovision",
            &serde_json::json!({ "device_uuid": identity.uuid }),
        )
        .await;
    match resp {
        Ok(r) if r.is_success() => {}
        Ok(r) => warn!(status = r.status, "cloud deprovision rejected; clearing local credentials anyway"),
        Err(e) => warn!(error = %e, "cloud deprovision unreachable; clearing local credentials anyway"),
    }
    store.clear_identity_credentials().await?;
    Ok(())
}

/// Destroy identity and target state. The next boot is a first boot.
pub async fn factory_reset(store: Arc<dyn DeviceStore>) -> Result<(), ProvisionError> {
    store.delete_target_state().await?;
    store.delete_identity().await?;
    info!("factory reset complete");
    Ok(())
}

fn to_value<T: serde::Serialize>(value: &T) -> Result<serde_json::Value, ProvisionError> {
    serde_json::to_value(value).map_err(|e| ProvisionError::Protocol(e.to_string()))
}

fn check_status(resp: &HttpResponse) -> Result<(), ProvisionError> {
    match resp.status {
        200..=299 => Ok(()),
        401 | 403 => Err(ProvisionError::Denied {
            status: resp.status,
        }),
        500..=599 => Err(ProvisionError::TransientNetwork(format!(
            "cloud returned {}",
            resp.status
        ))),
        other => Err(ProvisionError::Protocol(format!(
            "unexpected status {}: {}",
            other,
            String::from_utf8_lossy(&resp.body)
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use skiff_domain::MqttProtocol;
    use skiff_store::MemoryStore;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn request_for(server: &MockServer) -> ProvisionRequest {
        ProvisionRequest {
            api_endpoint: server.uri(),
            provisioning_secret: Secret::new("sk_live_abc"),
            device_name: "bench-pi".into(),
            device_type: "raspberrypi4-64".into(),
        }
    }

    fn grants_body() -> serde_json::Value {
        serde_json::json!({
            "device_id": "d-42",
            "mqtt": {
                "broker_url": "mqtts://broker.example:8883",
                "username": "device",
                "password": "mq-pass",
                "broker_config": {"verify": true}
            },
            "api": {
                "endpoint": "https://api.example",
                "device_api_key": "key-123",
                "tls_config": {"verify": true}
            }
        })
    }

    async fn mount_happy_path(server: &MockServer, cloud_public_pem: String) {
        Mock::given(method("POST"))
            .and(path("/provisioning/v2/key-exchange"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "public_key": cloud_public_pem,
                "key_id": "k1"
            })))
            .up_to_n_times(1)
            .mount(server)
            .await;
        Mock::given(method("POST"))
            .and(path("/provisioning/v2/key-exchange"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({})))
            .up_to_n_times(1)
            .mount(server)
            .await;
        Mock::given(method("POST"))
            .and(path("/provisioning/v2/register"))
            .respond_with(ResponseTemplate::new(200).set_body_json(grants_body()))
            .expect(1)
            .mount(server)
            .await;
    }

    #[tokio::test]
    async fn cold_boot_provisioning_writes_identity() {
        let (cloud_private, cloud_public) = crypto::generate_keypair().unwrap();
        let server = MockServer::start().await;
        mount_happy_path(&server, crypto::public_key_pem(&cloud_public).unwrap()).await;

        let store: Arc<dyn DeviceStore> = Arc::new(MemoryStore::new());
        let identity = provision(store.clone(), &request_for(&server)).await.unwrap();

        assert!(identity.provisioned);
        assert_eq!(identity.device_id.as_deref(), Some("d-42"));
        assert_eq!(identity.api_endpoint, "https://api.example");
        assert_eq!(identity.device_api_key.as_ref().unwrap().expose(), "key-123");
        let mqtt = identity.mqtt.as_ref().unwrap();
        assert_eq!(mqtt.broker_host, "broker.example");
        assert_eq!(mqtt.protocol, MqttProtocol::Tls);
        assert!(identity.registered_at.is_some());

        // exactly two key-exchange calls and one register call
        let requests = server.received_requests().await.unwrap();
        assert_eq!(requests.len(), 3);

        // the cloud can decrypt the registration payload with its private key
        let register_body: serde_json::Value =
            serde_json::from_slice(&requests[2].body).unwrap();
        let ciphertext = base64::engine::general_purpose::STANDARD
            .decode(register_body["encrypted_payload"].as_str().unwrap())
            .unwrap();
        let plaintext = crypto::decrypt_chunked(&cloud_private, &ciphertext).unwrap();
        let registration: serde_json::Value = serde_json::from_slice(&plaintext).unwrap();
        assert_eq!(registration["provisioning_secret"], "sk_live_abc");
        assert_eq!(registration["device_name"], "bench-pi");
        assert_eq!(register_body["key_id"], "k1");

        // persisted identity matches the returned one
        let stored = store.load_identity().await.unwrap().unwrap();
        assert_eq!(stored, identity);
    }

    #[tokio::test]
    async fn provisioning_is_idempotent_once_provisioned() {
        let (_, cloud_public) = crypto::generate_keypair().unwrap();
        let server = MockServer::start().await;
        mount_happy_path(&server, crypto::public_key_pem(&cloud_public).unwrap()).await;

        let store: Arc<dyn DeviceStore> = Arc::new(MemoryStore::new());
        let first = provision(store.clone(), &request_for(&server)).await.unwrap();
        let second = provision(store.clone(), &request_for(&server)).await.unwrap();
        assert_eq!(first.uuid, second.uuid);
        // no further HTTP traffic on the second call
        assert_eq!(server.received_requests().await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn bad_secret_is_denied_not_retried() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/provisioning/v2/key-exchange"))
            .respond_with(ResponseTemplate::new(403))
            .expect(1)
            .mount(&server)
            .await;

        let store: Arc<dyn DeviceStore> = Arc::new(MemoryStore::new());
        let err = provision(store.clone(), &request_for(&server)).await.unwrap_err();
        assert!(matches!(err, ProvisionError::Denied { status: 403 }));
        assert!(!err.is_retryable());

        // uuid was still minted and persisted for the next attempt
        let stored = store.load_identity().await.unwrap().unwrap();
        assert!(!stored.provisioned);
    }

    #[tokio::test]
    async fn server_errors_are_transient() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let store: Arc<dyn DeviceStore> = Arc::new(MemoryStore::new());
        let err = provision(store, &request_for(&server)).await.unwrap_err();
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn malformed_key_exchange_is_a_protocol_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/provisioning/v2/key-exchange"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(serde_json::json!({"nope": true})),
            )
            .mount(&server)
            .await;

        let store: Arc<dyn DeviceStore> = Arc::new(MemoryStore::new());
        let err = provision(store, &request_for(&server)).await.unwrap_err();
        assert!(matches!(err, ProvisionError::Protocol(_)));
    }

    #[tokio::test]
    async fn factory_reset_clears_identity_and_target() {
        let store: Arc<dyn DeviceStore> = Arc::new(MemoryStore::new());
        let id = Identity::unprovisioned(Uuid::new_v4(), "n", "t", "https://x");
        store.save_identity(&id).await.unwrap();
        store
            .save_target_state(&serde_json::from_str(r#"{"apps":{},"config":{}}"#).unwrap())
            .await
            .unwrap();

        factory_reset(store.clone()).await.unwrap();
        assert!(store.load_identity().await.unwrap().is_none());
        assert!(store.load_target_state().await.unwrap().is_none());
    }
}
