pub mod slack;

use async_trait::async_trait;

use crate::error::ChannelError;
use crate::events::NotifyEvent;

/// A destination for mesh notifications.
#[async_trait]
pub trait NotifyChannel: Send + Sync {
    /// Short label used in logs and delivery reports.
    fn name(&self) -> &'static str;

    /// False when the channel has no destination and should be skipped.
    fn enabled(&self) -> bool;

    async fn send(&self, event: &NotifyEvent) -> Result<(), ChannelError>;
}
