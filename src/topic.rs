//! Topic pattern matching and topic-derived helpers.
//!
//! Topics are `/`-delimited strings. Subscription patterns may contain the
//! MQTT wildcards `+` (one segment) and `#`. Matching here requires the
//! pattern and the topic to have the same number of segments before any
//! segment comparison happens, so `#` short-circuits the remaining
//! comparison but never matches a suffix deeper than the pattern itself.
//! That makes it a same-depth wildcard rather than the conventional
//! "rest of topic" wildcard. Subscribers rely on this, so it stays.

/// Returns true if `topic` matches the subscription `pattern`.
///
/// `devices/+/data` matches `devices/ABC123/data` but not
/// `devices/ABC123/data/extra` (segment counts differ).
pub fn topic_matches(pattern: &str, topic: &str) -> bool {
    let pattern_segments: Vec<&str> = pattern.split('/').collect();
    let topic_segments: Vec<&str> = topic.split('/').collect();

    if pattern_segments.len() != topic_segments.len() {
        return false;
    }

    for (pattern_segment, topic_segment) in pattern_segments.iter().zip(&topic_segments) {
        match *pattern_segment {
            "+" => continue,
            "#" => return true,
            literal if literal == *topic_segment => continue,
            _ => return false,
        }
    }

    true
}

/// Extracts the device id from a topic following the `devices/<id>/<suffix>`
/// convention: the second segment, present only when the topic has at least
/// two segments.
pub fn device_id_from_topic(topic: &str) -> Option<&str> {
    let mut segments = topic.split('/');
    let _first = segments.next()?;
    segments.next()
}

/// Returns the concrete device id from a registered pattern of the shape
/// `devices/<id>/<suffix>`, skipping wildcard ids.
pub fn device_id_from_pattern(pattern: &str) -> Option<&str> {
    let segments: Vec<&str> = pattern.split('/').collect();
    if segments.len() < 3 || segments[0] != "devices" {
        return None;
    }
    match segments[1] {
        "+" | "#" => None,
        id => Some(id),
    }
}
