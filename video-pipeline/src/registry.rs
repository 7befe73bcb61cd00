use crate::types::{Channel, PipelineError, Result};

const DEFAULT_CHANNELS: [(&str, &str); 12] = [
    ("UCYwLV1gDwzGbg7jXQ52bVnQ", "In The World of AI"),
    ("UCawZsQWqfGSbCI5yjkdVkTA", "Matthew Berman"),
    ("UC5LTm52VaiV-5Q3C-txWVGQ", "AI Revolution"),
    ("UCSPkiRjFYpz-8DY-aF_1wRg", "The AI Grid"),
    ("UCh0xoRjLeoMj1AjGmaSsoEQ", "Julia McCoy"),
    ("UCtuO2h6OwDueF7h3p8DYYjQ", "Theo (t3.gg)"),
    ("UCqcbQf6yw5KzRoDDcZ_wBSw", "Wes Roth"),
    ("UC0m81bQuthaQZmFbXEY9QSw", "AI Code King"),
    ("UC8ENHE5xdFSwx71u3fDH5Xw", "ThePrimeTime"),
    ("UC2Xd-TjJByJyK2w1zNwY0zQ", "Fireship"),
    ("UCOuGATIAbd2DvzJmUgXn2IQ", "NetworkChuck"),
    ("UC0yHbz4OxdQFwmVX2BBQqLg", "AI Master"),
];

/// Fixed, ordered set of monitored channels. Order is processing order.
#[derive(Debug, Clone)]
pub struct ChannelRegistry {
    channels: Vec<Channel>,
}

impl ChannelRegistry {
    pub fn new(channels: Vec<Channel>) -> Self {
        Self { channels }
    }

    pub fn builtin() -> Self {
        Self::new(
            DEFAULT_CHANNELS
                .iter()
                .map(|(id, name)| Channel::youtube(id, name))
                .collect(),
        )
    }

    /// The configured channels, or the built-in list when none are configured.
    pub fn from_config(channels: &[Channel]) -> Self {
        if channels.is_empty() {
            Self::builtin()
        } else {
            Self::new(channels.to_vec())
        }
    }

    pub fn list_channels(&self) -> &[Channel] {
        &self.channels
    }

    pub fn get_channel(&self, channel_id: &str) -> Result<&Channel> {
        self.channels
            .iter()
            .find(|channel| channel.channel_id == channel_id)
            .ok_or_else(|| PipelineError::ChannelNotFound {
                channel_id: channel_id.to_string(),
            })
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_registry_keeps_order() {
        let registry = ChannelRegistry::builtin();
        assert_eq!(registry.len(), 12);
        assert_eq!(registry.list_channels()[0].name, "In The World of AI");
        assert_eq!(registry.list_channels()[11].name, "AI Master");
        assert!(registry.get_channel("UC2Xd-TjJByJyK2w1zNwY0zQ").is_ok());
        assert!(matches!(
            registry.get_channel("UCmissing"),
            Err(PipelineError::ChannelNotFound { .. })
        ));
    }

    #[test]
    fn configured_channels_replace_builtin() {
        let registry = ChannelRegistry::from_config(&[Channel::youtube("UC123", "Test")]);
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.get_channel("UC123").unwrap().name, "Test");
    }
}
