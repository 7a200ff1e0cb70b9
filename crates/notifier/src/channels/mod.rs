pub mod email;
pub mod push;
pub mod queue;

use std::collections::BTreeMap;
use std::sync::Arc;

use courier_common::types::ChannelKind;
use courier_engine::ports::ChannelSender;

/// Channel senders keyed by the channel kind they deliver.
#[derive(Default, Clone)]
pub struct ChannelRegistry {
    senders: BTreeMap<ChannelKind, Arc<dyn ChannelSender>>,
}

impl ChannelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a sender, replacing any previous one for the same channel.
    pub fn register(&mut self, sender: Arc<dyn ChannelSender>) {
        let channel = sender.channel();
        if self.senders.insert(channel, sender).is_some() {
            tracing::warn!(channel = %channel, "Replaced channel sender");
        }
    }

    pub fn with(mut self, sender: Arc<dyn ChannelSender>) -> Self {
        self.register(sender);
        self
    }

    pub fn get(&self, channel: ChannelKind) -> Option<&Arc<dyn ChannelSender>> {
        self.senders.get(&channel)
    }

    /// Channels that have a sender, in a stable order.
    pub fn channels(&self) -> Vec<ChannelKind> {
        self.senders.keys().copied().collect()
    }
}
