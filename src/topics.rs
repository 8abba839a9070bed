//! Topic filter module
//!
//! Holds the configured subscription filters of a trace and decides which
//! concrete topics they cover.
//!
//! # MQTT Wildcards
//!
//! - `+` matches exactly one level (e.g., `sensors/+/temperature`)
//! - `#` matches any number of trailing levels and is only legal as the final
//!   level (e.g., `sensors/#`). `sensors/#` also matches the parent `sensors`.
//!
//! # Example
//!
//! ```
//! use mqtt_tracer::topics::{matches, TopicFilter};
//!
//! let filter = TopicFilter::parse_list("sensors/+/temp, sensors/#").unwrap();
//! assert_eq!(filter.topics(), &["sensors/+/temp", "sensors/#"]);
//! assert!(matches("sensors/+/temp", "sensors/a/temp"));
//! assert!(!matches("foo/#", "bar/foo"));
//! ```

use crate::error::TracerError;

const SINGLE_LEVEL: &str = "+";
const MULTI_LEVEL: &str = "#";

/// Reports whether `topic` is covered by the subscription `filter`.
///
/// Levels are compared byte-exact and case-sensitive; empty levels compare
/// literally. A `#` that is not the final level carries no wildcard meaning
/// here and is compared literally; [`validate_filter`] rejects such filters
/// before they reach a tracer.
pub fn matches(filter: &str, topic: &str) -> bool {
    let filter_levels: Vec<&str> = filter.split('/').collect();
    let topic_levels: Vec<&str> = topic.split('/').collect();

    if let Some((&MULTI_LEVEL, prefix)) = filter_levels.split_last() {
        return topic_levels.len() >= prefix.len()
            && levels_match(prefix, &topic_levels[..prefix.len()]);
    }

    filter_levels.len() == topic_levels.len() && levels_match(&filter_levels, &topic_levels)
}

fn levels_match(filter: &[&str], topic: &[&str]) -> bool {
    filter
        .iter()
        .zip(topic)
        .all(|(f, t)| *f == SINGLE_LEVEL || f == t)
}

/// Checks that `filter` is a well-formed MQTT subscription filter.
///
/// Rejects empty filters, `#` anywhere but the final level, and wildcard
/// characters that share a level with other characters (`foo+`, `a#`).
pub fn validate_filter(filter: &str) -> Result<(), TracerError> {
    if filter.is_empty() {
        return Err(TracerError::Config("empty topic filter".to_string()));
    }

    let levels: Vec<&str> = filter.split('/').collect();
    let last = levels.len() - 1;
    for (i, level) in levels.iter().enumerate() {
        if *level == MULTI_LEVEL && i != last {
            return Err(TracerError::Config(format!(
                "invalid topic filter '{}': '#' must be the last level",
                filter
            )));
        }
        if level.len() > 1 && (level.contains('+') || level.contains('#')) {
            return Err(TracerError::Config(format!(
                "invalid topic filter '{}': wildcards must occupy a whole level",
                filter
            )));
        }
    }
    Ok(())
}

/// The filters a trace subscribes to, in configuration order.
///
/// # Examples
///
/// ```
/// use mqtt_tracer::topics::TopicFilter;
///
/// let filter = TopicFilter::from_single("home/temperature".to_string());
/// assert!(!filter.is_empty());
/// assert_eq!(filter.topics().len(), 1);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicFilter {
    topics: Vec<String>,
}

impl TopicFilter {
    /// Create a TopicFilter from a single filter string.
    pub fn from_single(topic: String) -> Self {
        Self {
            topics: vec![topic],
        }
    }

    /// Create a TopicFilter from already separated filters.
    pub fn new(topics: Vec<String>) -> Self {
        Self { topics }
    }

    /// Parse a comma-separated filter list, trimming whitespace around each
    /// entry and validating every filter.
    ///
    /// # Errors
    ///
    /// Returns [`TracerError::Config`] if the list is empty or any filter is
    /// malformed (see [`validate_filter`]).
    pub fn parse_list(list: &str) -> Result<Self, TracerError> {
        if list.trim().is_empty() {
            return Err(TracerError::Config("no topic filters given".to_string()));
        }
        let filter = Self {
            topics: list.split(',').map(|t| t.trim().to_string()).collect(),
        };
        filter.validate()?;
        Ok(filter)
    }

    /// Validate every filter; an empty list is rejected as well.
    pub fn validate(&self) -> Result<(), TracerError> {
        if self.topics.is_empty() {
            return Err(TracerError::Config("no topic filters given".to_string()));
        }
        self.topics.iter().try_for_each(|t| validate_filter(t))
    }

    /// Filters from this list that cover `topic`.
    pub fn matching<'a>(&'a self, topic: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.topics
            .iter()
            .map(String::as_str)
            .filter(move |f| matches(f, topic))
    }

    /// Get the list of filters.
    pub fn topics(&self) -> &[String] {
        &self.topics
    }

    /// Check if the list contains no filters.
    pub fn is_empty(&self) -> bool {
        self.topics.is_empty()
    }

    /// Consume the filter list.
    pub fn into_topics(self) -> Vec<String> {
        self.topics
    }
}
