use std::collections::HashSet;
use std::sync::{Arc, Mutex};

/// Process-wide set of Twitch channels with an active game session. A claim
/// is an atomic insert-if-absent; the channel is released when the claim is
/// dropped, on every controller exit path.
#[derive(Debug, Clone, Default)]
pub struct ChannelRegistry {
    active: Arc<Mutex<HashSet<String>>>,
}

impl ChannelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn claim(&self, channel: &str) -> Option<ChannelClaim> {
        let key = channel.trim().to_ascii_lowercase();
        let mut active = self
            .active
            .lock()
            .expect("channel registry mutex poisoned");
        if active.insert(key.clone()) {
            Some(ChannelClaim {
                registry: self.clone(),
                channel: key,
            })
        } else {
            None
        }
    }
}

#[derive(Debug)]
pub struct ChannelClaim {
    registry: ChannelRegistry,
    channel: String,
}

impl ChannelClaim {
    pub fn channel(&self) -> &str {
        &self.channel
    }
}

impl Drop for ChannelClaim {
    fn drop(&mut self) {
        if let Ok(mut active) = self.registry.active.lock() {
            active.remove(&self.channel);
        }
    }
}
