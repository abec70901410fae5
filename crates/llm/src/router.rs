use std::sync::Arc;

use snafu::ensure;

use super::model::{Model, Provider, default_models};
use super::provider::{MissingApiKeySnafu, ModelClient, ProviderResult};

/// Constructs provider clients. Production uses rig; tests substitute a scripted factory.
pub trait ClientFactory: Send + Sync {
    fn build(&self, provider: Provider, api_key: &str) -> ProviderResult<Arc<dyn ModelClient>>;
}

/// Maps model ids to providers and hands out credentialed clients.
#[derive(Clone)]
pub struct ModelRouter {
    models: Vec<Model>,
    factory: Arc<dyn ClientFactory>,
}

impl ModelRouter {
    pub fn new(factory: Arc<dyn ClientFactory>) -> Self {
        Self::with_models(default_models(), factory)
    }

    pub fn with_models(models: Vec<Model>, factory: Arc<dyn ClientFactory>) -> Self {
        Self { models, factory }
    }

    pub fn models(&self) -> &[Model] {
        &self.models
    }

    pub fn model(&self, model_id: &str) -> Option<&Model> {
        self.models.iter().find(|model| model.id == model_id)
    }

    pub fn get_provider(&self, model_id: &str) -> Option<Provider> {
        self.model(model_id).map(|model| model.provider)
    }

    pub fn build_client(
        &self,
        provider: Provider,
        credential: &str,
    ) -> ProviderResult<Arc<dyn ModelClient>> {
        ensure!(
            !credential.trim().is_empty(),
            MissingApiKeySnafu {
                stage: "router-build-client",
                provider,
            }
        );

        self.factory.build(provider, credential.trim())
    }
}

impl std::fmt::Debug for ModelRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelRouter")
            .field("models", &self.models.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::{ProviderError, ProviderStreamHandle, StreamRequest};

    struct NoopClient(Provider);

    impl ModelClient for NoopClient {
        fn provider(&self) -> Provider {
            self.0
        }

        fn stream_chat(&self, _request: StreamRequest) -> ProviderResult<ProviderStreamHandle> {
            unreachable!("router tests never stream")
        }
    }

    struct NoopFactory;

    impl ClientFactory for NoopFactory {
        fn build(
            &self,
            provider: Provider,
            _api_key: &str,
        ) -> ProviderResult<Arc<dyn ModelClient>> {
            Ok(Arc::new(NoopClient(provider)))
        }
    }

    fn router() -> ModelRouter {
        ModelRouter::new(Arc::new(NoopFactory))
    }

    #[test]
    fn known_models_resolve_to_their_provider() {
        let router = router();

        assert_eq!(
            router.get_provider("llama-3.3-70b-versatile"),
            Some(Provider::Groq)
        );
        assert_eq!(router.get_provider("gemini-2.0-flash"), Some(Provider::Google));
        assert_eq!(router.get_provider("gpt-nonexistent"), None);
    }

    #[test]
    fn blank_credential_is_rejected_before_factory() {
        let error = router()
            .build_client(Provider::Google, "  ")
            .err()
            .unwrap();

        assert!(matches!(
            error,
            ProviderError::MissingApiKey {
                provider: Provider::Google,
                ..
            }
        ));
    }

    #[test]
    fn built_client_reports_requested_provider() {
        let client = router().build_client(Provider::Groq, "gsk_test").unwrap();

        assert_eq!(client.provider(), Provider::Groq);
    }
}
