//! Provider fed through an mpsc channel.
//!
//! Useful when the embedding program discovers devices itself, and in
//! tests. The stream ends once every sender is dropped.

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::debug;

use super::{DeviceEventStream, DeviceProvider, DeviceProviderEvent, ProviderError, ProviderResult};

/// A [`DeviceProvider`] that forwards whatever is sent into it.
///
/// ```
/// use fleetrun::provider::{ChannelDeviceProvider, DeviceProvider};
///
/// # tokio_test::block_on(async {
/// let (mut provider, sender) = ChannelDeviceProvider::new(8);
/// drop(sender);
/// let _stream = provider.subscribe().await.unwrap();
/// assert!(provider.subscribe().await.is_err());
/// # });
/// ```
pub struct ChannelDeviceProvider {
    receiver: Option<mpsc::Receiver<DeviceProviderEvent>>,
}

impl ChannelDeviceProvider {
    pub fn new(capacity: usize) -> (Self, mpsc::Sender<DeviceProviderEvent>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { receiver: Some(rx) }, tx)
    }
}

#[async_trait]
impl DeviceProvider for ChannelDeviceProvider {
    fn name(&self) -> &str {
        "channel"
    }

    async fn subscribe(&mut self) -> ProviderResult<DeviceEventStream> {
        let receiver = self.receiver.take().ok_or(ProviderError::AlreadySubscribed)?;
        Ok(Box::pin(ReceiverStream::new(receiver)))
    }

    async fn terminate(&mut self) {
        debug!("Channel device provider terminated");
        self.receiver = None;
    }
}
