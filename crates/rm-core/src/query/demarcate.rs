//! Locating JSON arrays inside an interactive query-tool transcript.
//!
//! The interactive shell interleaves prompts and banners with result
//! output, so results are found by scanning for the first `[` and its
//! matching `]`. Brackets inside JSON strings are ignored.

use std::ops::Range;

/// Byte range of the first complete top-level JSON array in `buf`.
///
/// Returns `None` when no `[` is present or the array is still incomplete.
pub fn next_array(buf: &[u8]) -> Option<Range<usize>> {
    let start = buf.iter().position(|&b| b == b'[')?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (offset, &b) in buf[start..].iter().enumerate() {
        if in_string {
            if escaped {
                escaped = false;
            } else if b == b'\\' {
                escaped = true;
            } else if b == b'"' {
                in_string = false;
            }
            continue;
        }
        match b {
            b'"' => in_string = true,
            b'[' | b'{' => depth += 1,
            b']' | b'}' => {
                depth = depth.saturating_sub(1);
                if depth == 0 {
                    return Some(start..start + offset + 1);
                }
            }
            _ => {}
        }
    }
    None
}
