//! Portrait generation collaborator.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// What to draw.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AvatarRequest {
    pub name: String,
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
}

/// Renders character portraits. Returns an image payload (URL or data URI)
/// or `None`; implementations must not fail the caller.
#[async_trait]
pub trait AvatarArtist: Send + Sync {
    async fn render(&self, request: AvatarRequest) -> Option<String>;
}

/// An artist that never draws anything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoAvatar;

#[async_trait]
impl AvatarArtist for NoAvatar {
    async fn render(&self, _request: AvatarRequest) -> Option<String> {
        None
    }
}
