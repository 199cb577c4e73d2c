use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::Utc;
use rand::Rng;
use serde_json::Value;
use tracing::field::{Field, Visit};
use tracing::{Event, Subscriber};
use tracing_subscriber::layer::Context;
use tracing_subscriber::Layer;

use crate::component::Component;
use crate::record::{redact_fields, LogLevel, LogRecord};
use crate::ring::LogRing;

/// Per-level admission rates for the remote buffer. A record is admitted iff
/// a uniform[0,1) draw is below its level's rate; sampled-out records still
/// reach the local sink through the fmt layer.
#[derive(Debug, Clone, Copy)]
pub struct SampleRates {
    pub error: f64,
    pub warn: f64,
    pub info: f64,
    pub debug: f64,
}

impl Default for SampleRates {
    fn default() -> Self {
        Self {
            error: 1.0,
            warn: 1.0,
            info: 0.5,
            debug: 0.1,
        }
    }
}

impl SampleRates {
    pub fn always() -> Self {
        Self {
            error: 1.0,
            warn: 1.0,
            info: 1.0,
            debug: 1.0,
        }
    }

    fn rate(&self, level: LogLevel) -> f64 {
        match level {
            LogLevel::Error => self.error,
            LogLevel::Warn => self.warn,
            LogLevel::Info => self.info,
            LogLevel::Debug => self.debug,
        }
    }
}

/// tracing layer feeding the remote upload ring. Does nothing until enabled
/// (the orchestrator arms it once cloud credentials exist).
pub struct RemoteLogLayer {
    ring: Arc<LogRing>,
    rates: SampleRates,
    enabled: Arc<AtomicBool>,
}

impl RemoteLogLayer {
    pub fn new(ring: Arc<LogRing>, rates: SampleRates) -> Self {
        Self {
            ring,
            rates,
            enabled: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn enabled_flag(&self) -> Arc<AtomicBool> {
        self.enabled.clone()
    }
}

impl<S: Subscriber> Layer<S> for RemoteLogLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        if !self.enabled.load(Ordering::Relaxed) {
            return;
        }

        let level = LogLevel::from(event.metadata().level());
        let rate = self.rates.rate(level);
        if rate < 1.0 && rand::thread_rng().gen::<f64>() >= rate {
            return;
        }

        let mut visitor = FieldVisitor::default();
        event.record(&mut visitor);
        let mut fields = visitor.fields;
        redact_fields(&mut fields);

        self.ring.push(LogRecord {
            timestamp: Utc::now(),
            level,
            component: Component::from_target(event.metadata().target()),
            message: visitor.message.unwrap_or_default(),
            fields,
            sampled: rate < 1.0,
        });
    }
}

#[derive(Default)]
struct FieldVisitor {
    message: Option<String>,
    fields: BTreeMap<String, Value>,
}

impl Visit for FieldVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message = Some(value.to_string());
        } else {
            self.fields
                .insert(field.name().to_string(), Value::String(value.to_string()));
        }
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        self.fields.insert(field.name().to_string(), value.into());
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        self.fields.insert(field.name().to_string(), value.into());
    }

    fn record_f64(&mut self, field: &Field, value: f64) {
        self.fields.insert(
            field.name().to_string(),
            serde_json::Number::from_f64(value)
                .map(Value::Number)
                .unwrap_or(Value::Null),
        );
    }

    fn record_bool(&mut self, field: &Field, value: bool) {
        self.fields.insert(field.name().to_string(), value.into());
    }

    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        let rendered = format!("{:?}", value);
        if field.name() == "message" {
            self.message = Some(rendered);
        } else {
            self.fields
                .insert(field.name().to_string(), Value::String(rendered));
        }
    }
}
