use std::collections::HashMap;
use std::sync::Arc;

use crate::error::AdapterError;
use crate::session::ProtocolAdapter;

/// Maps protocol tags from [`skiff_domain::SensorConfig`] to compiled-in
/// implementations. A tag with no entry (e.g. `opcua` in a build without
/// that feature) is a configuration error surfaced per adapter, not a crash.
pub struct AdapterRegistry {
    adapters: HashMap<&'static str, Arc<dyn ProtocolAdapter>>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self {
            adapters: HashMap::new(),
        }
    }

    /// Registry with everything this build compiles in.
    pub fn builtin() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(crate::sim::SimAdapter::new()));
        #[cfg(feature = "modbus")]
        registry.register(Arc::new(crate::modbus::ModbusAdapter::new()));
        registry
    }

    pub fn register(&mut self, adapter: Arc<dyn ProtocolAdapter>) -> &mut Self {
        self.adapters.insert(adapter.protocol(), adapter);
        self
    }

    pub fn get(&self, protocol: &str) -> Result<Arc<dyn ProtocolAdapter>, AdapterError> {
        self.adapters.get(protocol).cloned().ok_or_else(|| {
            AdapterError::Config(format!(
                "no adapter compiled in for protocol '{protocol}'"
            ))
        })
    }

    pub fn protocols(&self) -> Vec<&'static str> {
        let mut tags: Vec<_> = self.adapters.keys().copied().collect();
        tags.sort_unstable();
        tags
    }
}

impl Default for AdapterRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}
