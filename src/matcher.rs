// MIT License
//
// Copyright (c) 2025 Takatoshi Kondo
//
// Permission is hereby granted, free of charge, to any person obtaining a copy
// of this software and associated documentation files (the "Software"), to deal
// in the Software without restriction, including without limitation the rights
// to use, copy, modify, merge, publish, distribute, sublicense, and/or sell
// copies of the Software, and to permit persons to whom the Software is
// furnished to do so, subject to the following conditions:
//
// The above copyright notice and this permission notice shall be included in all
// copies or substantial portions of the Software.
//
// THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
// IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
// FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
// AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
// LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING FROM,
// OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER DEALINGS IN THE
// SOFTWARE.

//! Wildcard topic-filter trie.
//!
//! Registers opaque tokens under `/`-separated filters and matches concrete
//! topic names against them. `+` matches exactly one non-empty level, `#`
//! matches the remaining levels (including none) and may only appear as the
//! final token of a filter.

use std::collections::{HashMap, HashSet};
use std::hash::Hash;

use crate::error::{ProtocolError, Result};

/// Trie node holding tokens registered at this position.
#[derive(Debug)]
struct TrieNode<T> {
    /// Tokens whose filter ends exactly at this node.
    leaf: Vec<T>,
    /// Tokens whose filter ends with `#` at this node.
    multi_wildcard: Vec<T>,
    /// Child nodes for each literal segment.
    children: HashMap<String, TrieNode<T>>,
    /// Child for the single-level wildcard (`+`).
    wildcard_child: Option<Box<TrieNode<T>>>,
}

impl<T> Default for TrieNode<T> {
    fn default() -> Self {
        Self {
            leaf: Vec::new(),
            multi_wildcard: Vec::new(),
            children: HashMap::new(),
            wildcard_child: None,
        }
    }
}

/// Wildcard topic matcher.
#[derive(Debug, Default)]
pub struct TopicMatcher<T: Clone + Eq + Hash> {
    root: TrieNode<T>,
    /// Filter each token was registered under, so removal needs only the
    /// original token.
    filters: HashMap<T, String>,
}

impl<T: Clone + Eq + Hash> TopicMatcher<T> {
    pub fn new() -> Self {
        Self {
            root: TrieNode::default(),
            filters: HashMap::new(),
        }
    }

    /// Register a token under a filter. Re-adding the same `(filter, token)`
    /// pair is a no-op; re-adding the token under a different filter moves it.
    pub fn add(&mut self, filter: &str, token: T) {
        let registered_elsewhere = match self.filters.get(&token) {
            Some(existing) if existing == filter => return,
            Some(_) => true,
            None => false,
        };
        if registered_elsewhere {
            self.remove(&token);
        }

        let segments: Vec<&str> = filter.split('/').collect();
        Self::insert(&mut self.root, &segments, token.clone());
        self.filters.insert(token, filter.to_string());
    }

    /// Remove a previously added token. Returns whether it was present.
    pub fn remove(&mut self, token: &T) -> bool {
        let Some(filter) = self.filters.remove(token) else {
            return false;
        };
        let segments: Vec<&str> = filter.split('/').collect();
        Self::delete(&mut self.root, &segments, token)
    }

    /// Return every registered token whose filter matches the topic, each
    /// token at most once.
    pub fn matches(&self, topic: &str) -> Vec<T> {
        let segments: Vec<&str> = topic.split('/').collect();
        let mut found = Vec::new();
        Self::collect(&self.root, &segments, &mut found);

        let mut seen = HashSet::new();
        found.retain(|t| seen.insert(t.clone()));
        found
    }

    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }

    pub fn len(&self) -> usize {
        self.filters.len()
    }

    fn insert(node: &mut TrieNode<T>, segments: &[&str], token: T) {
        let Some((segment, rest)) = segments.split_first() else {
            if !node.leaf.contains(&token) {
                node.leaf.push(token);
            }
            return;
        };

        match *segment {
            "#" => {
                if !node.multi_wildcard.contains(&token) {
                    node.multi_wildcard.push(token);
                }
            }
            "+" => {
                let child = node
                    .wildcard_child
                    .get_or_insert_with(|| Box::new(TrieNode::default()));
                Self::insert(child, rest, token);
            }
            _ => {
                let child = node.children.entry(segment.to_string()).or_default();
                Self::insert(child, rest, token);
            }
        }
    }

    fn delete(node: &mut TrieNode<T>, segments: &[&str], token: &T) -> bool {
        let Some((segment, rest)) = segments.split_first() else {
            return remove_token(&mut node.leaf, token);
        };

        match *segment {
            "#" => remove_token(&mut node.multi_wildcard, token),
            "+" => node
                .wildcard_child
                .as_deref_mut()
                .is_some_and(|child| Self::delete(child, rest, token)),
            _ => node
                .children
                .get_mut(*segment)
                .is_some_and(|child| Self::delete(child, rest, token)),
        }
    }

    fn collect(node: &TrieNode<T>, segments: &[&str], out: &mut Vec<T>) {
        // `#` matches the rest of the topic including zero levels
        out.extend(node.multi_wildcard.iter().cloned());

        let Some((segment, rest)) = segments.split_first() else {
            out.extend(node.leaf.iter().cloned());
            return;
        };

        if let Some(child) = node.children.get(*segment) {
            Self::collect(child, rest, out);
        }

        // `+` matches exactly one non-empty level
        if !segment.is_empty() {
            if let Some(ref child) = node.wildcard_child {
                Self::collect(child, rest, out);
            }
        }
    }
}

fn remove_token<T: PartialEq>(tokens: &mut Vec<T>, token: &T) -> bool {
    if let Some(pos) = tokens.iter().position(|t| t == token) {
        tokens.remove(pos);
        true
    } else {
        false
    }
}

/// Check a single topic name against a single filter.
pub fn topic_matches_filter(topic: &str, filter: &str) -> bool {
    let topic_levels: Vec<&str> = topic.split('/').collect();
    let filter_levels: Vec<&str> = filter.split('/').collect();

    let mut ti = 0;
    for (fi, filter_level) in filter_levels.iter().enumerate() {
        if *filter_level == "#" {
            return fi == filter_levels.len() - 1;
        }

        if ti >= topic_levels.len() {
            return false;
        }

        if *filter_level == "+" {
            if topic_levels[ti].is_empty() {
                return false;
            }
            ti += 1;
        } else if *filter_level == topic_levels[ti] {
            ti += 1;
        } else {
            return false;
        }
    }

    ti == topic_levels.len()
}

/// Validate a subscription filter: non-empty, `#` only as the final token,
/// wildcards only as complete levels.
pub fn validate_filter(filter: &str) -> Result<()> {
    if filter.is_empty() {
        return Err(ProtocolError::InvalidTopicFilter(filter.to_string()).into());
    }

    let count = filter.split('/').count();
    for (i, segment) in filter.split('/').enumerate() {
        match segment {
            "#" => {
                if i != count - 1 {
                    return Err(ProtocolError::InvalidTopicFilter(filter.to_string()).into());
                }
            }
            "+" => {}
            _ => {
                if segment.contains('+') || segment.contains('#') {
                    return Err(ProtocolError::InvalidTopicFilter(filter.to_string()).into());
                }
            }
        }
    }

    Ok(())
}

/// Topic names used in PUBLISH must not contain wildcards.
pub fn validate_topic_name(topic: &str) -> Result<()> {
    if topic.is_empty() || topic.contains('+') || topic.contains('#') {
        return Err(ProtocolError::InvalidTopicFilter(topic.to_string()).into());
    }
    Ok(())
}
