// MIT License
//
// Copyright (c) 2025 Takatoshi Kondo
//
// SPDX-License-Identifier: MIT

use mqttd::matcher::{topic_matches_filter, validate_filter, TopicMatcher};

#[test]
fn exact_match() {
    let mut matcher = TopicMatcher::new();
    matcher.add("sensors/temp", 1u32);

    assert_eq!(matcher.matches("sensors/temp"), vec![1]);
    assert!(matcher.matches("sensors/humidity").is_empty());
    assert!(matcher.matches("sensors").is_empty());
    assert!(matcher.matches("sensors/temp/inner").is_empty());
}

#[test]
fn single_level_wildcard() {
    let mut matcher = TopicMatcher::new();
    matcher.add("sensors/+/temp", 1u32);

    assert_eq!(matcher.matches("sensors/room1/temp"), vec![1]);
    assert_eq!(matcher.matches("sensors/room2/temp"), vec![1]);
    assert!(matcher.matches("sensors/room1/humidity").is_empty());
    assert!(matcher.matches("sensors/temp").is_empty());
    assert!(matcher.matches("sensors/a/b/temp").is_empty());
}

#[test]
fn single_level_wildcard_requires_nonempty_level() {
    let mut matcher = TopicMatcher::new();
    matcher.add("a/+/c", 1u32);

    assert_eq!(matcher.matches("a/b/c"), vec![1]);
    assert!(matcher.matches("a//c").is_empty());
}

#[test]
fn multi_level_wildcard() {
    let mut matcher = TopicMatcher::new();
    matcher.add("sensors/#", 1u32);

    assert_eq!(matcher.matches("sensors/temp"), vec![1]);
    assert_eq!(matcher.matches("sensors/room1/temp"), vec![1]);
    // `#` also matches zero trailing levels
    assert_eq!(matcher.matches("sensors"), vec![1]);
    assert!(matcher.matches("actuators/light").is_empty());
}

#[test]
fn root_multi_level_wildcard_matches_everything() {
    let mut matcher = TopicMatcher::new();
    matcher.add("#", 1u32);

    assert_eq!(matcher.matches("a"), vec![1]);
    assert_eq!(matcher.matches("a/b/c"), vec![1]);
}

#[test]
fn distinct_tokens_reported_once_each() {
    let mut matcher = TopicMatcher::new();
    matcher.add("a/#", 1u32);
    matcher.add("a/+", 2u32);
    matcher.add("a/b", 3u32);

    let mut found = matcher.matches("a/b");
    found.sort_unstable();
    assert_eq!(found, vec![1, 2, 3]);
}

#[test]
fn duplicate_add_is_noop() {
    let mut matcher = TopicMatcher::new();
    matcher.add("a/b", 7u32);
    matcher.add("a/b", 7u32);

    assert_eq!(matcher.matches("a/b"), vec![7]);
    assert_eq!(matcher.len(), 1);
}

#[test]
fn re_adding_token_under_new_filter_moves_it() {
    let mut matcher = TopicMatcher::new();
    matcher.add("a/b", 7u32);
    matcher.add("c/d", 7u32);

    assert!(matcher.matches("a/b").is_empty());
    assert_eq!(matcher.matches("c/d"), vec![7]);
}

#[test]
fn remove_by_token() {
    let mut matcher = TopicMatcher::new();
    matcher.add("a/+/c", 1u32);
    matcher.add("a/#", 2u32);

    assert!(matcher.remove(&1));
    assert_eq!(matcher.matches("a/b/c"), vec![2]);

    assert!(!matcher.remove(&1));
    assert!(matcher.remove(&2));
    assert!(matcher.is_empty());
}

#[test]
fn filter_matching_against_topics() {
    assert!(topic_matches_filter("a/b/c", "a/b/c"));
    assert!(topic_matches_filter("a/b/c", "a/+/c"));
    assert!(topic_matches_filter("a/b/c", "a/#"));
    assert!(topic_matches_filter("a", "#"));
    assert!(topic_matches_filter("a/b", "a/b/#"));

    assert!(!topic_matches_filter("a/b/c", "a/b"));
    assert!(!topic_matches_filter("a/b", "a/b/c"));
    assert!(!topic_matches_filter("a/b/c", "a/+"));
    assert!(!topic_matches_filter("b/b/c", "a/#"));
    // `+` needs a non-empty level
    assert!(!topic_matches_filter("a//c", "a/+/c"));
}

#[test]
fn filter_validation() {
    assert!(validate_filter("a/b/c").is_ok());
    assert!(validate_filter("a/+/c").is_ok());
    assert!(validate_filter("a/#").is_ok());
    assert!(validate_filter("#").is_ok());
    assert!(validate_filter("+").is_ok());

    assert!(validate_filter("").is_err());
    // `#` only as the final token
    assert!(validate_filter("a/#/c").is_err());
    // wildcards must stand alone in their level
    assert!(validate_filter("a/b+").is_err());
    assert!(validate_filter("a/b#").is_err());
}
