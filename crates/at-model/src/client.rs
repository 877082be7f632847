//! The model capability seam

use crate::{ChatMessage, ModelError};
use async_trait::async_trait;
use std::sync::Arc;

/// Conversation in, one assistant message out
#[async_trait]
pub trait ModelClient: Send + Sync {
    /// Complete the conversation with a single assistant reply
    async fn complete(&self, messages: &[ChatMessage]) -> Result<ChatMessage, ModelError>;
}

#[async_trait]
impl<T: ModelClient + ?Sized> ModelClient for Arc<T> {
    async fn complete(&self, messages: &[ChatMessage]) -> Result<ChatMessage, ModelError> {
        (**self).complete(messages).await
    }
}
