use super::error::ProviderError;
use super::types::{ModelInfo, StreamEvent, StreamRequest};
use async_trait::async_trait;
use futures::stream::BoxStream;
use tokio_util::sync::CancellationToken;

pub type EventStream = BoxStream<'static, StreamEvent>;

/// Opaque language-model client consumed by the core.
#[async_trait]
pub trait ModelProvider: Send + Sync {
    async fn model(&self, provider_id: &str, model_id: &str) -> Result<ModelInfo, ProviderError>;

    /// Cheaper model for titles and other side tasks, if the provider has one.
    async fn small_model(&self, provider_id: &str) -> Result<Option<ModelInfo>, ProviderError>;

    /// Starts one inference call. The stream ends after `Finish` or `Error`,
    /// or early once `cancel` fires.
    async fn stream(
        &self,
        request: StreamRequest,
        cancel: CancellationToken,
    ) -> Result<EventStream, ProviderError>;
}
