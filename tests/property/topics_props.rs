//! Property-based tests for topic matching
//!
//! Checks the level-wise matching rule for filters without `#` and the span
//! rule for filters ending in `/#`, plus filter list parsing.

use proptest::prelude::*;

use mqtt_tracer::topics::{matches, validate_filter, TopicFilter};

/// Strategy for a single topic level; empty levels are legal
fn level_strategy() -> impl Strategy<Value = String> {
    "[a-c]{0,2}"
}

/// Strategy for a concrete topic split into levels
fn topic_levels_strategy() -> impl Strategy<Value = Vec<String>> {
    prop::collection::vec(level_strategy(), 1..6)
}

/// How a filter level relates to the topic level at the same position
#[derive(Debug, Clone)]
enum FilterLevel {
    Plus,
    Same,
    Other(String),
}

fn filter_level_strategy() -> impl Strategy<Value = FilterLevel> {
    prop_oneof![
        Just(FilterLevel::Plus),
        Just(FilterLevel::Same),
        level_strategy().prop_map(FilterLevel::Other),
    ]
}

/// Build filter levels against `topic`; returns the levels and whether each
/// one covers its topic level.
fn build_filter(topic: &[String], shape: &[FilterLevel]) -> (Vec<String>, bool) {
    let mut covered = true;
    let levels = topic
        .iter()
        .zip(shape)
        .map(|(t, s)| match s {
            FilterLevel::Plus => "+".to_string(),
            FilterLevel::Same => t.clone(),
            FilterLevel::Other(o) => {
                covered &= o == t;
                o.clone()
            }
        })
        .collect();
    (levels, covered)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(200))]

    /// Filters without `#` match iff every level is `+` or equal.
    #[test]
    fn prop_level_wise_matching(
        topic in topic_levels_strategy(),
        shape in prop::collection::vec(filter_level_strategy(), 6),
    ) {
        let (filter, expected) = build_filter(&topic, &shape);
        prop_assert_eq!(matches(&filter.join("/"), &topic.join("/")), expected);
    }

    /// Filters and topics with different level counts never match without `#`.
    #[test]
    fn prop_level_count_must_agree(
        topic in topic_levels_strategy(),
        extra in level_strategy(),
    ) {
        let filter = format!("{}/{}", topic.join("/"), extra);
        prop_assert!(!matches(&filter, &topic.join("/")));
        prop_assert!(!matches(&topic.join("/"), &filter));
    }

    /// `prefix/#` matches iff the topic has at least the prefix's levels and
    /// the leading levels match level-wise.
    #[test]
    fn prop_multi_level_span(
        prefix_source in topic_levels_strategy(),
        shape in prop::collection::vec(filter_level_strategy(), 6),
        topic in topic_levels_strategy(),
    ) {
        let (prefix, _) = build_filter(&prefix_source, &shape);
        let filter = if prefix.is_empty() {
            "#".to_string()
        } else {
            format!("{}/#", prefix.join("/"))
        };

        let expected = topic.len() >= prefix.len()
            && prefix
                .iter()
                .zip(&topic)
                .all(|(f, t)| f == "+" || f == t);
        prop_assert_eq!(matches(&filter, &topic.join("/")), expected);
    }

    /// A filter identical to the topic always matches it.
    #[test]
    fn prop_literal_filter_matches_itself(topic in topic_levels_strategy()) {
        let topic = topic.join("/");
        prop_assert!(matches(&topic, &topic));
    }

    /// Parsing a comma-joined list of valid filters yields them back trimmed.
    #[test]
    fn prop_parse_list_roundtrip(
        filters in prop::collection::vec("[a-c]{1,3}(/(\\+|[a-c]{1,3})){0,3}(/#)?", 1..6),
    ) {
        for f in &filters {
            prop_assert!(validate_filter(f).is_ok());
        }
        let joined = filters.join(" , ");
        let parsed = TopicFilter::parse_list(&joined).unwrap();
        prop_assert_eq!(parsed.topics(), filters.as_slice());
    }

    /// Any level after `#` makes a filter invalid.
    #[test]
    fn prop_non_terminal_hash_rejected(
        head in topic_levels_strategy(),
        tail in topic_levels_strategy(),
    ) {
        let filter = format!("{}/#/{}", head.join("/"), tail.join("/"));
        prop_assert!(validate_filter(&filter).is_err());
    }
}
