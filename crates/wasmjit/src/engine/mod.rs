use wasmparser::{Validator, WasmFeatures};

/// Shared compilation configuration.
pub struct Engine {
    features: WasmFeatures,
}

impl Engine {
    /// Create a new validator with the engine's features.
    pub(crate) fn new_validator(&self) -> Validator {
        Validator::new_with_features(self.features)
    }
}

impl Default for Engine {
    fn default() -> Self {
        Self {
            features: WasmFeatures::default(),
        }
    }
}
