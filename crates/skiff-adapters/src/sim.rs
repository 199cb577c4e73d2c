//! Simulated protocol, always compiled in. Used for bench rigs without real
//! sensors and by the adapter tests.
//!
//! Addresses: `const:<x>` reads a fixed value, `counter` increments per
//! read, `flaky:<x>` fails transiently every other read, `bad` always fails
//! with a protocol error. Anything else fails validation.

use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use skiff_domain::{DataPoint, SensorConfig};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::AdapterError;
use crate::session::{ProtocolAdapter, ProtocolSession};

pub struct SimAdapter {
    connect_attempts: AtomicU64,
}

impl SimAdapter {
    pub fn new() -> Self {
        Self {
            connect_attempts: AtomicU64::new(0),
        }
    }
}

impl Default for SimAdapter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ProtocolAdapter for SimAdapter {
    fn protocol(&self) -> &'static str {
        "sim"
    }

    async fn connect(
        &self,
        config: &SensorConfig,
    ) -> Result<Box<dyn ProtocolSession>, AdapterError> {
        let attempt = self.connect_attempts.fetch_add(1, Ordering::Relaxed);
        if let Some(fail_connects) = config
            .connection
            .get("fail_connects")
            .and_then(|v| v.as_u64())
        {
            if attempt < fail_connects {
                return Err(AdapterError::Connect(format!(
                    "simulated connect failure {attempt}"
                )));
            }
        }
        Ok(Box::new(SimSession {
            counter: 0.0,
            flaky_fail_next: true,
        }))
    }
}

struct SimSession {
    counter: f64,
    flaky_fail_next: bool,
}

#[derive(Debug)]
enum Address {
    Const(f64),
    Counter,
    Flaky(f64),
    Bad,
}

fn parse_address(point: &DataPoint) -> Result<Address, AdapterError> {
    let addr = point.address.as_str();
    if let Some(x) = addr.strip_prefix("const:") {
        return x
            .parse::<f64>()
            .map(Address::Const)
            .map_err(|_| AdapterError::protocol(format!("bad const address '{addr}'")));
    }
    if let Some(x) = addr.strip_prefix("flaky:") {
        return x
            .parse::<f64>()
            .map(Address::Flaky)
            .map_err(|_| AdapterError::protocol(format!("bad flaky address '{addr}'")));
    }
    match addr {
        "counter" => Ok(Address::Counter),
        "bad" => Ok(Address::Bad),
        other => Err(AdapterError::protocol(format!(
            "unknown sim address '{other}'"
        ))),
    }
}

#[async_trait]
impl ProtocolSession for SimSession {
    async fn probe(&mut self, point: &DataPoint) -> Result<(), AdapterError> {
        parse_address(point).map(|_| ())
    }

    async fn read(&mut self, point: &DataPoint) -> Result<f64, AdapterError> {
        match parse_address(point)? {
            Address::Const(x) => Ok(x),
            Address::Counter => {
                self.counter += 1.0;
                Ok(self.counter)
            }
            Address::Flaky(x) => {
                self.flaky_fail_next = !self.flaky_fail_next;
                if !self.flaky_fail_next {
                    Ok(x)
                } else {
                    Err(AdapterError::Transient("simulated flaky read".into()))
                }
            }
            Address::Bad => Err(AdapterError::Protocol {
                message: "simulated bad register".into(),
                code: Some(4),
            }),
        }
    }

    fn supports_subscription(&self) -> bool {
        true
    }

    async fn subscribe(
        &mut self,
        points: &[DataPoint],
        tx: mpsc::Sender<(String, f64)>,
        cancel: CancellationToken,
    ) -> Result<(), AdapterError> {
        let mut tick = tokio::time::interval(std::time::Duration::from_millis(25));
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                _ = tick.tick() => {
                    for point in points {
                        self.counter += 1.0;
                        if tx.send((point.name.clone(), self.counter)).await.is_err() {
                            return Ok(());
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn point(address: &str) -> DataPoint {
        serde_json::from_value(serde_json::json!({
            "name": "p",
            "address": address,
        }))
        .unwrap()
    }

    fn config(connection: serde_json::Value) -> SensorConfig {
        serde_json::from_value(serde_json::json!({
            "config_id": "c1",
            "name": "rig",
            "protocol": "sim",
            "connection": connection,
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn const_and_counter_addresses() {
        let adapter = SimAdapter::new();
        let mut session = adapter.connect(&config(serde_json::json!({}))).await.unwrap();
        assert_eq!(session.read(&point("const:42.5")).await.unwrap(), 42.5);
        assert_eq!(session.read(&point("counter")).await.unwrap(), 1.0);
        assert_eq!(session.read(&point("counter")).await.unwrap(), 2.0);
    }

    #[tokio::test]
    async fn probe_rejects_unknown_addresses() {
        let adapter = SimAdapter::new();
        let mut session = adapter.connect(&config(serde_json::json!({}))).await.unwrap();
        assert!(session.probe(&point("const:1")).await.is_ok());
        assert!(session.probe(&point("nonsense")).await.is_err());
    }

    #[tokio::test]
    async fn flaky_reads_alternate() {
        let adapter = SimAdapter::new();
        let mut session = adapter.connect(&config(serde_json::json!({}))).await.unwrap();
        let first = session.read(&point("flaky:7")).await;
        let second = session.read(&point("flaky:7")).await;
        assert!(first.is_ok() != second.is_ok(), "flaky alternates");
    }

    #[tokio::test]
    async fn scripted_connect_failures() {
        let adapter = SimAdapter::new();
        let cfg = config(serde_json::json!({"fail_connects": 2}));
        assert!(adapter.connect(&cfg).await.is_err());
        assert!(adapter.connect(&cfg).await.is_err());
        assert!(adapter.connect(&cfg).await.is_ok());
    }
}
