// Copyright (c) The disttest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! General support code for disttest-runner.

/// Utilities for pluralizing various words based on count.
pub(crate) mod plural {
    /// Returns "test" if `count` is 1, otherwise "tests".
    pub(crate) fn tests_str(count: usize) -> &'static str {
        if count == 1 { "test" } else { "tests" }
    }

    /// Returns "worker" if `count` is 1, otherwise "workers".
    pub(crate) fn workers_str(count: usize) -> &'static str {
        if count == 1 { "worker" } else { "workers" }
    }

    /// Returns "violation" if `count` is 1, otherwise "violations".
    pub(crate) fn violations_str(count: usize) -> &'static str {
        if count == 1 {
            "violation"
        } else {
            "violations"
        }
    }
}

/// Marker appended to text cut short by [`truncate_text`].
pub(crate) const TRUNCATION_MARKER: &str = "\n[... truncated by disttest ...]";

/// Truncates `text` to at most `max_bytes` bytes (plus the marker), cutting
/// on a char boundary.
pub(crate) fn truncate_text(mut text: String, max_bytes: usize) -> String {
    if text.len() <= max_bytes {
        return text;
    }
    let mut end = max_bytes;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    text.truncate(end);
    text.push_str(TRUNCATION_MARKER);
    text
}
