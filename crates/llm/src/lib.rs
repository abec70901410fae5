use std::sync::Arc;

mod model;
mod provider;
mod rig_adapter;
mod router;
#[cfg(any(test, feature = "test-utils"))]
mod scripted;

pub use model::{Model, Provider, RECOMMENDED_MODEL, default_models};
pub use provider::{
    ContentPart, ModelClient, ProviderError, ProviderEventStream, ProviderResult,
    ProviderStreamHandle, ProviderWorker, Role, StreamEvent, StreamRequest, Turn, TurnContent,
};
pub use rig_adapter::{RigClientFactory, RigModelClient};
pub use router::{ClientFactory, ModelRouter};
#[cfg(any(test, feature = "test-utils"))]
pub use scripted::{ScriptStep, ScriptedClientFactory};

/// Router over the default catalog backed by real rig clients.
pub fn create_router() -> ModelRouter {
    ModelRouter::new(Arc::new(RigClientFactory))
}
