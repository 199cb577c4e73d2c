pub mod component;
pub mod layer;
pub mod record;
pub mod ring;
pub mod uploader;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{reload, EnvFilter, Registry};

pub use component::Component;
pub use layer::{RemoteLogLayer, SampleRates};
pub use record::{LogLevel, LogRecord};
pub use ring::LogRing;
pub use uploader::{LogUploader, LogUploaderConfig};

/// Handle over the installed logging stack: runtime level changes and the
/// switch that arms the remote sink once credentials exist.
#[derive(Clone)]
pub struct LogHandle {
    reload: reload::Handle<EnvFilter, Registry>,
    ring: Arc<LogRing>,
    remote_enabled: Arc<AtomicBool>,
    level: Arc<std::sync::Mutex<String>>,
}

impl LogHandle {
    /// Change the active log level filter at runtime.
    pub fn set_level(&self, directive: &str) -> Result<(), String> {
        let filter = EnvFilter::try_new(directive).map_err(|e| e.to_string())?;
        self.reload.reload(filter).map_err(|e| e.to_string())?;
        *self.level.lock().unwrap() = directive.to_string();
        Ok(())
    }

    pub fn level(&self) -> String {
        self.level.lock().unwrap().clone()
    }

    /// Start admitting records into the remote buffer.
    pub fn enable_remote(&self) {
        self.remote_enabled.store(true, Ordering::Relaxed);
    }

    pub fn disable_remote(&self) {
        self.remote_enabled.store(false, Ordering::Relaxed);
    }

    pub fn ring(&self) -> Arc<LogRing> {
        self.ring.clone()
    }
}

/// Install the logging stack: stdout line-delimited JSON (write-through) plus
/// the sampled remote buffer. The remote sink starts disabled; the
/// orchestrator arms it after provisioning.
pub fn init(default_directive: &str, rates: SampleRates, ring_capacity: usize) -> LogHandle {
    let directive = if default_directive.is_empty() {
        "info"
    } else {
        default_directive
    };
    let filter =
        EnvFilter::try_new(directive).unwrap_or_else(|_| EnvFilter::new("info"));
    let (filter, reload_handle) = reload::Layer::new(filter);

    let ring = Arc::new(LogRing::new(ring_capacity));
    let remote = RemoteLogLayer::new(ring.clone(), rates);
    let remote_enabled = remote.enabled_flag();

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().json().with_target(true))
        .with(remote)
        .init();

    LogHandle {
        reload: reload_handle,
        ring,
        remote_enabled,
        level: Arc::new(std::sync::Mutex::new(directive.to_string())),
    }
}
