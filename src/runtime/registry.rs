//! Topic registration and filter matching.

use heapless::{String, Vec};

use super::traits::TopicCollector;
use crate::error::ConfigError;

/// Maximum length for a single topic string.
pub const MAX_TOPIC_LEN: usize = 128;

/// Owned copies of the filters modules registered.
///
/// The runtime fills it once at construction and walks it to (re)subscribe
/// after every connect.
///
/// ```ignore
/// let mut registry = TopicRegistry::<8>::new();
/// module.register(&mut registry);
/// for filter in registry.iter() {
///     session.subscribe(filter).await?;
/// }
/// ```
#[derive(Default)]
pub struct TopicRegistry<const MAX_TOPICS: usize> {
    topics: Vec<String<MAX_TOPIC_LEN>, MAX_TOPICS>,
    rejected: Option<ConfigError>,
}

impl<const MAX_TOPICS: usize> TopicRegistry<MAX_TOPICS> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copies `topic` into the registry. Duplicates are accepted once.
    pub fn add_topic(&mut self, topic: &str) -> Result<(), ConfigError> {
        if self.contains(topic) {
            return Ok(());
        }
        let owned = String::try_from(topic).map_err(|_| ConfigError::TopicTooLong)?;
        self.topics
            .push(owned)
            .map_err(|_| ConfigError::TooManyTopics)
    }

    /// The first filter a module registered that did not fit, if any.
    pub fn rejected(&self) -> Option<ConfigError> {
        self.rejected
    }

    pub fn contains(&self, topic: &str) -> bool {
        self.topics.iter().any(|t| t.as_str() == topic)
    }

    /// Whether `topic` matches any registered filter.
    pub fn matches(&self, topic: &str) -> bool {
        self.topics.iter().any(|filter| topic_matches(filter, topic))
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.topics.iter().map(|s| s.as_str())
    }

    pub fn len(&self) -> usize {
        self.topics.len()
    }

    pub fn is_empty(&self) -> bool {
        self.topics.is_empty()
    }

    pub fn clear(&mut self) {
        self.topics.clear();
        self.rejected = None;
    }
}

impl<const MAX_TOPICS: usize> TopicCollector for TopicRegistry<MAX_TOPICS> {
    fn add(&mut self, topic: &str) -> bool {
        match self.add_topic(topic) {
            Ok(()) => true,
            Err(e) => {
                warn!("cannot register {}: {}", topic, e);
                self.rejected.get_or_insert(e);
                false
            }
        }
    }
}

/// MQTT filter matching: `+` matches one level, a trailing `#` matches the
/// parent level and everything below it.
pub fn topic_matches(filter: &str, topic: &str) -> bool {
    let mut filter_levels = filter.split('/');
    let mut topic_levels = topic.split('/');
    loop {
        match (filter_levels.next(), topic_levels.next()) {
            (Some("#"), _) => return filter_levels.next().is_none(),
            (Some("+"), Some(_)) => {}
            (Some(f), Some(t)) if f == t => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_level_wildcard() {
        let filter = "v1/devices/me/rpc/response/+";
        assert!(topic_matches(filter, "v1/devices/me/rpc/response/12"));
        assert!(!topic_matches(filter, "v1/devices/me/rpc/response"));
        assert!(!topic_matches(filter, "v1/devices/me/rpc/response/12/x"));
        assert!(!topic_matches(filter, "v1/devices/me/rpc/request/12"));
    }

    #[test]
    fn multi_level_wildcard() {
        assert!(topic_matches("v1/devices/#", "v1/devices"));
        assert!(topic_matches("v1/devices/#", "v1/devices/me/attributes"));
        assert!(topic_matches("#", "anything/at/all"));
        assert!(!topic_matches("v1/#/x", "v1/a/x"));
        assert!(topic_matches("a/b", "a/b"));
        assert!(!topic_matches("a/b", "a/bc"));
    }

    #[test]
    fn registry_dedups_and_bounds() {
        let mut registry = TopicRegistry::<2>::new();
        assert!(registry.add("a/+"));
        assert!(registry.add("a/+"));
        assert!(registry.add("b/#"));
        assert!(!registry.add("c"));
        assert_eq!(registry.rejected(), Some(ConfigError::TooManyTopics));
        assert_eq!(registry.len(), 2);
        assert!(registry.matches("b/x/y"));
        assert!(!registry.matches("c"));

        let long = "x".repeat(MAX_TOPIC_LEN + 1);
        registry.clear();
        assert_eq!(registry.rejected(), None);
        assert!(!registry.add(&long));
        assert_eq!(registry.rejected(), Some(ConfigError::TopicTooLong));
        assert!(registry.is_empty());
    }
}
