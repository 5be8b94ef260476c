//! Seams between the scheduler and its collaborators.

use async_trait::async_trait;

use crate::error::Result;
use crate::types::ChannelConfig;

/// Sends one rendered message through one channel.
///
/// Implementations perform exactly one outbound call per invocation and
/// never retry; the scheduler owns retry policy through re-arming.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(
        &self,
        channel: &str,
        config: &ChannelConfig,
        title: &str,
        body: &str,
    ) -> Result<()>;
}
