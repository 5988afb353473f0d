//! Session-scoped cache of the models each backend offers.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use termpilot_core::{Provider, ProviderKind};
use tracing::{debug, warn};

pub struct ModelCatalog {
    timeout: Duration,
    models: Mutex<HashMap<ProviderKind, Vec<String>>>,
}

impl ModelCatalog {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            models: Mutex::new(HashMap::new()),
        }
    }

    /// Whether `model` can be requested from `provider`.
    ///
    /// Permissive: when the backend cannot list its models in time, or lists
    /// none, every model is assumed to be supported.
    pub async fn is_supported(&self, provider: &dyn Provider, model: &str) -> bool {
        let kind = provider.kind();
        if !kind.validates_models() || model.trim().is_empty() {
            return true;
        }
        if kind.recommended_models().contains(&model) {
            return true;
        }

        let Some(models) = self.models(provider).await else {
            warn!(provider = %kind, model, "Model list unavailable, assuming the model is supported");
            return true;
        };
        if models.is_empty() {
            debug!(provider = %kind, model, "Backend lists no models, assuming the model is supported");
            return true;
        }
        models.iter().any(|available| available == model)
    }

    /// The backend's model list, fetched once per session. `None` when the
    /// backend did not answer within the timeout.
    pub async fn models(&self, provider: &dyn Provider) -> Option<Vec<String>> {
        let kind = provider.kind();
        if let Some(cached) = self.lock().get(&kind) {
            return Some(cached.clone());
        }

        let models = tokio::time::timeout(self.timeout, provider.list_available_models())
            .await
            .ok()?;
        if !models.is_empty() {
            debug!(provider = %kind, count = models.len(), "Cached model list");
            self.lock().insert(kind, models.clone());
        }
        Some(models)
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<ProviderKind, Vec<String>>> {
        self.models.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
