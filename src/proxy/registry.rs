//! Lookup table from transport type to implementation

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::debug;

use crate::config::ProvidersConfig;
use crate::error::{Result, RotaError};
use crate::proxy::providers::{BrightdataTransport, DatacenterTransport, ZyteTransport};
use crate::proxy::transport::Transport;

/// Process wide set of transports, keyed by [`Transport::transport_type`]
#[derive(Clone, Default)]
pub struct TransportRegistry {
    transports: Arc<RwLock<HashMap<String, Arc<dyn Transport>>>>,
}

impl TransportRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding the built-in providers
    pub fn with_defaults(providers: &ProvidersConfig) -> Result<Self> {
        let registry = Self::new();
        registry.register(Arc::new(DatacenterTransport::default()))?;
        registry.register(Arc::new(ZyteTransport::new(providers.zyte.clone())))?;
        registry.register(Arc::new(BrightdataTransport::new(
            providers.brightdata.clone(),
        )))?;
        Ok(registry)
    }

    /// Add a transport; its type must not be taken yet
    pub fn register(&self, transport: Arc<dyn Transport>) -> Result<()> {
        let transport_type = transport.transport_type().to_string();
        let mut transports = self.transports.write();

        if transports.contains_key(&transport_type) {
            return Err(RotaError::DuplicateTransport(transport_type));
        }

        debug!(transport_type = %transport_type, "Registered transport");
        transports.insert(transport_type, transport);
        Ok(())
    }

    pub fn get(&self, transport_type: &str) -> Result<Arc<dyn Transport>> {
        self.transports
            .read()
            .get(transport_type)
            .cloned()
            .ok_or_else(|| RotaError::TransportNotFound(transport_type.to_string()))
    }

    /// Registered types, sorted
    pub fn types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.transports.read().keys().cloned().collect();
        types.sort();
        types
    }
}

impl std::fmt::Debug for TransportRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportRegistry")
            .field("types", &self.types())
            .finish()
    }
}
