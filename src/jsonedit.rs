//! # In-Place JSON Editing
//!
//! Byte-preserving edits of raw event JSON. Clients may hash or compare
//! event bytes, so stripping or injecting `unsigned.transaction_id` must not
//! disturb any other byte of the blob. A decode/re-encode round-trip would
//! reorder fields and renormalise numbers; instead these functions scan the
//! original text with a small cursor and splice exactly the affected span.
//!
//! Inputs are events that already passed [`crate::types::Event::parse`], so
//! the text is known-valid JSON; on any scan inconsistency the original text
//! is returned unchanged rather than risking a torn blob.

use std::borrow::Cow;

// =============================================================================
// Public API
// =============================================================================

/// Removes `unsigned.transaction_id` from a raw event, if present.
///
/// When `transaction_id` was the only member of `unsigned`, the entire
/// `unsigned` member is removed so the output matches an event that never
/// carried one. All other bytes are preserved verbatim. Returns borrowed
/// input when there is nothing to strip.
pub fn strip_transaction_id(raw: &str) -> Cow<'_, str> {
    let bytes = raw.as_bytes();
    let Some(unsigned) = find_member(bytes, root_object_start(bytes), "unsigned") else {
        return Cow::Borrowed(raw);
    };
    // unsigned must itself be an object to hold a transaction_id
    let val_start = skip_ws(bytes, unsigned.value_start);
    if bytes.get(val_start) != Some(&b'{') {
        return Cow::Borrowed(raw);
    }
    let Some(txn) = find_member(bytes, val_start, "transaction_id") else {
        return Cow::Borrowed(raw);
    };

    if sole_member(bytes, val_start, &txn) {
        // drop the whole "unsigned" member
        let (cut_start, cut_end) = widen_to_comma(bytes, unsigned.member_start, unsigned.value_end);
        return Cow::Owned(splice(raw, cut_start, cut_end, ""));
    }
    let (cut_start, cut_end) = widen_to_comma(bytes, txn.member_start, txn.value_end);
    Cow::Owned(splice(raw, cut_start, cut_end, ""))
}

/// Ensures `unsigned.transaction_id` is set to `txn_id` in a raw event.
///
/// Used when serving an event back to its sender after the stored copy
/// arrived via another user's poller (and so was stored without the
/// transaction id). Returns borrowed input when the id is already present
/// with the same value; an existing different value is left untouched
/// (the stored copy is authoritative for its own sender).
pub fn set_transaction_id<'a>(raw: &'a str, txn_id: &str) -> Cow<'a, str> {
    let bytes = raw.as_bytes();
    let encoded = serde_json::to_string(txn_id).unwrap_or_else(|_| "\"\"".to_string());

    if let Some(unsigned) = find_member(bytes, root_object_start(bytes), "unsigned") {
        let val_start = skip_ws(bytes, unsigned.value_start);
        if bytes.get(val_start) != Some(&b'{') {
            return Cow::Borrowed(raw);
        }
        if find_member(bytes, val_start, "transaction_id").is_some() {
            return Cow::Borrowed(raw);
        }
        // insert as the first member of the existing unsigned object
        let insert_at = val_start + 1;
        let empty = skip_ws(bytes, insert_at) == close_of(bytes, val_start);
        let member = if empty {
            format!("\"transaction_id\":{encoded}")
        } else {
            format!("\"transaction_id\":{encoded},")
        };
        return Cow::Owned(splice(raw, insert_at, insert_at, &member));
    }

    // no unsigned object at all: append one before the final brace
    let root = root_object_start(bytes);
    let close = close_of(bytes, root);
    let empty_root = skip_ws(bytes, root + 1) == close;
    let member = if empty_root {
        format!("\"unsigned\":{{\"transaction_id\":{encoded}}}")
    } else {
        format!(",\"unsigned\":{{\"transaction_id\":{encoded}}}")
    };
    Cow::Owned(splice(raw, close, close, &member))
}

// =============================================================================
// Scanner
// =============================================================================

/// Span of one `"key": value` member inside an object.
struct MemberSpan {
    /// Index of the opening quote of the key.
    member_start: usize,
    /// Index of the first byte of the value (may be whitespace-preceded).
    value_start: usize,
    /// Index one past the last byte of the value.
    value_end: usize,
}

fn root_object_start(bytes: &[u8]) -> usize {
    skip_ws(bytes, 0)
}

fn skip_ws(bytes: &[u8], mut i: usize) -> usize {
    while i < bytes.len() && matches!(bytes[i], b' ' | b'\t' | b'\n' | b'\r') {
        i += 1;
    }
    i
}

/// Index of the closing brace of the object opening at `open` (which must
/// point at `{`). Falls back to the last byte on scan failure.
fn close_of(bytes: &[u8], open: usize) -> usize {
    match skip_value(bytes, open) {
        Some(end) => end - 1,
        None => bytes.len().saturating_sub(1),
    }
}

/// Index one past the end of the string starting at `i` (which must point
/// at the opening quote).
fn skip_string(bytes: &[u8], i: usize) -> Option<usize> {
    debug_assert_eq!(bytes.get(i), Some(&b'"'));
    let mut j = i + 1;
    while j < bytes.len() {
        match bytes[j] {
            b'\\' => j += 2,
            b'"' => return Some(j + 1),
            _ => j += 1,
        }
    }
    None
}

/// Index one past the end of the JSON value starting at `i`.
fn skip_value(bytes: &[u8], i: usize) -> Option<usize> {
    let i = skip_ws(bytes, i);
    match *bytes.get(i)? {
        b'"' => skip_string(bytes, i),
        b'{' | b'[' => {
            let mut depth = 0usize;
            let mut j = i;
            while j < bytes.len() {
                match bytes[j] {
                    b'"' => j = skip_string(bytes, j)?,
                    b'{' | b'[' => {
                        depth += 1;
                        j += 1;
                    }
                    b'}' | b']' => {
                        depth -= 1;
                        j += 1;
                        if depth == 0 {
                            return Some(j);
                        }
                    }
                    _ => j += 1,
                }
            }
            None
        }
        _ => {
            // number, true, false, null: scan to a delimiter
            let mut j = i;
            while j < bytes.len() && !matches!(bytes[j], b',' | b'}' | b']' | b' ' | b'\t' | b'\n' | b'\r') {
                j += 1;
            }
            Some(j)
        }
    }
}

/// Finds the top-level member `key` of the object opening at `open`.
fn find_member(bytes: &[u8], open: usize, key: &str) -> Option<MemberSpan> {
    if bytes.get(open) != Some(&b'{') {
        return None;
    }
    let mut i = skip_ws(bytes, open + 1);
    loop {
        match *bytes.get(i)? {
            b'}' => return None,
            b'"' => {
                let key_start = i;
                let key_end = skip_string(bytes, i)?;
                let colon = skip_ws(bytes, key_end);
                if bytes.get(colon) != Some(&b':') {
                    return None;
                }
                let value_start = colon + 1;
                let value_end = skip_value(bytes, value_start)?;
                if &bytes[key_start + 1..key_end - 1] == key.as_bytes() {
                    return Some(MemberSpan {
                        member_start: key_start,
                        value_start,
                        value_end,
                    });
                }
                i = skip_ws(bytes, value_end);
                if bytes.get(i) == Some(&b',') {
                    i = skip_ws(bytes, i + 1);
                }
            }
            _ => return None,
        }
    }
}

/// Whether `member` is the only member of the object opening at `open`.
fn sole_member(bytes: &[u8], open: usize, member: &MemberSpan) -> bool {
    let before = skip_ws(bytes, open + 1) == member.member_start;
    let after = bytes.get(skip_ws(bytes, member.value_end)) == Some(&b'}');
    before && after
}

/// Widens a member span to swallow exactly one adjacent comma, so removal
/// leaves a valid object.
fn widen_to_comma(bytes: &[u8], start: usize, end: usize) -> (usize, usize) {
    let after = skip_ws(bytes, end);
    if bytes.get(after) == Some(&b',') {
        return (start, skip_ws(bytes, after + 1));
    }
    // last member: eat the comma before it
    let mut before = start;
    while before > 0 && matches!(bytes[before - 1], b' ' | b'\t' | b'\n' | b'\r') {
        before -= 1;
    }
    if before > 0 && bytes[before - 1] == b',' {
        return (before - 1, end);
    }
    (start, end)
}

fn splice(raw: &str, start: usize, end: usize, replacement: &str) -> String {
    let mut out = String::with_capacity(raw.len() + replacement.len());
    out.push_str(&raw[..start]);
    out.push_str(replacement);
    out.push_str(&raw[end..]);
    out
}

// =============================================================================
// Tests
// =============================================================================
