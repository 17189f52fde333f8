//! Configuration of contexts from the environment.

use crate::{ContextDescriptor, MAX_CALLSTACK_DEPTH, MIN_QUERIES};

/// Parses a query slot count. Counts below [`MIN_QUERIES`] are rejected.
pub fn parse_query_capacity(string: &str) -> Option<u32> {
    match string.trim().parse::<u32>() {
        Ok(count) if count >= MIN_QUERIES => Some(count),
        _ => None,
    }
}

/// Parses a call stack depth.
///
/// `off` and `0` disable call stack capture, larger depths are clamped to
/// [`MAX_CALLSTACK_DEPTH`].
pub fn parse_callstack_depth(string: &str) -> Option<u8> {
    let string = string.trim().to_lowercase();
    if string == "off" {
        return Some(0);
    }
    let depth = string.parse::<u32>().ok()?;
    Some(depth.min(MAX_CALLSTACK_DEPTH as u32) as u8)
}

/// Get a query slot count from the environment variable GPU_TIMELINE_QUERY_CAPACITY.
pub fn query_capacity_from_env() -> Option<u32> {
    std::env::var("GPU_TIMELINE_QUERY_CAPACITY")
        .ok()
        .as_deref()
        .and_then(parse_query_capacity)
}

/// Get a call stack depth from the environment variable GPU_TIMELINE_CALLSTACK.
pub fn callstack_depth_from_env() -> Option<u8> {
    std::env::var("GPU_TIMELINE_CALLSTACK")
        .ok()
        .as_deref()
        .and_then(parse_callstack_depth)
}

impl<'a> ContextDescriptor<'a> {
    /// Default descriptor with overrides taken from the environment.
    ///
    /// Unset or unparsable variables leave the default in place.
    pub fn from_env(label: crate::Label<'a>) -> Self {
        let mut desc = Self {
            label,
            ..Self::default()
        };
        if let Some(capacity) = query_capacity_from_env() {
            desc.query_capacity = capacity;
        }
        if let Some(depth) = callstack_depth_from_env() {
            desc.callstack_depth = depth;
        }
        desc
    }
}
