//! Size bound for job updates on the wire.
//!
//! Postgres rejects a `NOTIFY` payload of [`NOTIFY_PAYLOAD_LIMIT`] bytes or
//! more. Every event is measured after JSON encoding, so escapes in tool
//! output (quotes, backslashes, control characters) count at their encoded
//! width.

use a6hub_core::job_events::JobUpdate;

/// Hard limit Postgres puts on a `NOTIFY` payload, in bytes.
pub const NOTIFY_PAYLOAD_LIMIT: usize = 8000;

/// Largest encoded update any bus will carry.
pub const MAX_PAYLOAD_BYTES: usize = NOTIFY_PAYLOAD_LIMIT - 1;

/// Appended to text that was cut to fit.
pub const TRUNCATION_MARKER: &str = " [truncated]";

/// Shrink the free-form text of `update` until its JSON encoding is at most
/// `limit` bytes. Returns whether the update now fits.
///
/// The longest prefix that fits is found by binary search over char
/// boundaries, since the encoded width of a prefix is not its byte length.
/// Updates without text, or whose other fields alone are too large, are
/// left with whatever was cut.
pub fn shrink_to_fit(update: &mut JobUpdate, limit: usize) -> Result<bool, serde_json::Error> {
    if encoded_len(update)? <= limit {
        return Ok(true);
    }
    let Some(text) = update.kind.text_mut() else {
        return Ok(false);
    };
    let original = std::mem::take(text);
    let boundaries: Vec<usize> = original.char_indices().map(|(i, _)| i).collect();

    if cut_to(update, &original, 0)? > limit {
        return Ok(false);
    }
    // `lo` always fits; the whole text never does.
    let (mut lo, mut hi) = (0, boundaries.len());
    while hi - lo > 1 {
        let mid = lo + (hi - lo) / 2;
        if cut_to(update, &original, boundaries[mid])? <= limit {
            lo = mid;
        } else {
            hi = mid;
        }
    }
    let end = boundaries.get(lo).copied().unwrap_or(0);
    Ok(cut_to(update, &original, end)? <= limit)
}

/// Replace the text with `original[..end]` plus the marker; returns the new
/// encoded length.
fn cut_to(update: &mut JobUpdate, original: &str, end: usize) -> Result<usize, serde_json::Error> {
    if let Some(text) = update.kind.text_mut() {
        text.clear();
        text.push_str(&original[..end]);
        text.push_str(TRUNCATION_MARKER);
    }
    encoded_len(update)
}

fn encoded_len(update: &JobUpdate) -> Result<usize, serde_json::Error> {
    Ok(serde_json::to_string(update)?.len())
}

#[cfg(test)]
mod tests {
    use a6hub_core::job_events::UpdateKind;
    use a6hub_core::job_status::JobStatus;
    use assert_matches::assert_matches;

    use super::*;

    fn encoded(update: &JobUpdate) -> usize {
        serde_json::to_string(update).unwrap().len()
    }

    #[test]
    fn small_updates_are_untouched() {
        let mut update = JobUpdate::log(1, "hello");
        assert!(shrink_to_fit(&mut update, MAX_PAYLOAD_BYTES).unwrap());
        assert_matches!(update.kind, UpdateKind::Log { ref log_line } if log_line == "hello");
    }

    #[test]
    fn escaped_text_is_measured_encoded() {
        // Each of these encodes to two or six bytes.
        let line = "\"\\\u{1b}".repeat(1500);
        let mut update = JobUpdate::log(1, line.clone());
        assert!(line.len() < MAX_PAYLOAD_BYTES);
        assert!(encoded(&update) > MAX_PAYLOAD_BYTES);

        assert!(shrink_to_fit(&mut update, MAX_PAYLOAD_BYTES).unwrap());
        assert!(encoded(&update) <= MAX_PAYLOAD_BYTES);
        assert_matches!(
            update.kind,
            UpdateKind::Log { ref log_line } if log_line.ends_with(TRUNCATION_MARKER)
        );
    }

    #[test]
    fn multibyte_text_is_cut_on_a_char_boundary() {
        let mut update = JobUpdate::error(1, "é".repeat(6000));
        assert!(shrink_to_fit(&mut update, MAX_PAYLOAD_BYTES).unwrap());
        assert!(encoded(&update) <= MAX_PAYLOAD_BYTES);
    }

    #[test]
    fn failure_message_with_output_tail_fits() {
        let tail: Vec<String> = (0..50).map(|i| format!("{i:03} {}", "x".repeat(195))).collect();
        let message = format!("synthesis failed\nLast output:\n{}", tail.join("\n"));
        let mut update = JobUpdate::complete(1, JobStatus::Failed, Some(message));

        assert!(shrink_to_fit(&mut update, MAX_PAYLOAD_BYTES).unwrap());
        assert!(encoded(&update) <= MAX_PAYLOAD_BYTES);
        assert_matches!(
            update.kind,
            UpdateKind::Complete { status: JobStatus::Failed, message: Some(ref m) }
                if m.starts_with("synthesis failed")
        );
    }

    #[test]
    fn cut_keeps_as_much_as_fits() {
        let mut update = JobUpdate::log(1, "a".repeat(9000));
        assert!(shrink_to_fit(&mut update, MAX_PAYLOAD_BYTES).unwrap());
        assert!(encoded(&update) > MAX_PAYLOAD_BYTES - 2);
    }

    #[test]
    fn updates_without_text_cannot_shrink() {
        let data = a6hub_core::progress::ProgressData {
            current_step: None,
            progress_percent: 10,
            completed_steps: vec!["s".repeat(100); 100],
            steps_info: vec![],
        };
        let mut update = JobUpdate::progress(1, &data);
        assert!(!shrink_to_fit(&mut update, MAX_PAYLOAD_BYTES).unwrap());
    }
}
