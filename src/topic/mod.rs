//! Topic namespace: validation, normalization and the subscription tree
//!
//! Topic names (PUBLISH) are concrete; topic filters (SUBSCRIBE) may
//! carry the single-level `+` and trailing multi-level `#` wildcards.
//! The accepted filter grammar follows the MQTT specification: `+`
//! must occupy a whole level, `#` must be the final level.

mod tree;


pub use tree::{NodeData, NodeId, TopicTree};

/// Normalize a topic by collapsing consecutive `/` separators and
/// stripping a trailing `/`. A lone `/` is preserved.
pub fn normalize(topic: &str) -> String {
    let mut out = String::with_capacity(topic.len());
    let mut prev_slash = false;

    for (i, c) in topic.chars().enumerate() {
        if c == '/' && prev_slash && i > 0 {
            continue;
        }
        prev_slash = c == '/';
        out.push(c);
    }

    if out.len() > 1 && out.ends_with('/') {
        out.pop();
    }

    out
}

/// Validate a topic name as used in PUBLISH: non-empty, no wildcard
/// characters, no NUL.
pub fn validate_topic_name(topic: &str) -> bool {
    !topic.is_empty()
        && !topic.contains('+')
        && !topic.contains('#')
        && !topic.contains('\0')
}

/// Validate a topic filter as used in SUBSCRIBE/UNSUBSCRIBE
pub fn validate_topic_filter(filter: &str) -> bool {
    if filter.is_empty() || filter.contains('\0') {
        return false;
    }

    let mut levels = filter.split('/').peekable();
    while let Some(level) = levels.next() {
        let is_last = levels.peek().is_none();

        match level {
            "#" => {
                if !is_last {
                    return false;
                }
            }
            "+" => {}
            _ => {
                if level.contains('+') || level.contains('#') {
                    return false;
                }
            }
        }
    }

    true
}
