//! Repeat-first-field (RFF/telecine) expansion: walks a video track's
//! `repeat_pict` flags to build the virtual field-pair space consumers see
//! when the track's frame count doesn't match its field count.

use crate::index::VideoFrameRecord;

/// `rff_fields[i] = (top_frame_idx, bottom_frame_idx)`; when both halves of
/// a pair come from the same physical frame (`top == bottom`), the consumer
/// can return that frame unmodified instead of merging fields.
pub type RffFields = Vec<(i64, i64)>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RffState {
    /// Frame count equals field-pair count: no telecine present.
    Unused,
    Ready,
}

/// Builds the field-pair table for `frames`. Each frame contributes
/// `repeat_pict + 2` fields, alternating parity starting from its own TFF
/// flag. An odd total is padded with one repeat of the last known opposite
/// field, matching the source library's trailing-parity handling.
pub fn build_rff_fields(frames: &[VideoFrameRecord]) -> (RffFields, RffState) {
    let mut fields: Vec<(i64, bool)> = Vec::new(); // (frame_idx, is_top)

    for (idx, frame) in frames.iter().enumerate() {
        let count = frame.repeat_pict + 2;
        let mut top = frame.tff;
        for _ in 0..count {
            fields.push((idx as i64, top));
            top = !top;
        }
    }

    if fields.len() % 2 != 0 {
        let (last_idx, last_top) = *fields.last().expect("non-empty track has at least one field");
        fields.push((last_idx, !last_top));
    }

    let mut rff_fields = Vec::with_capacity(fields.len() / 2);
    for pair in fields.chunks_exact(2) {
        let (a_idx, a_top) = pair[0];
        let (b_idx, b_top) = pair[1];
        let (top_idx, bottom_idx) = if a_top { (a_idx, b_idx) } else { (b_idx, a_idx) };
        debug_assert!(a_top != b_top || a_idx == b_idx);
        rff_fields.push((top_idx, bottom_idx));
    }

    let state = if rff_fields.len() == frames.len() {
        RffState::Unused
    } else {
        RffState::Ready
    };

    (rff_fields, state)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rec(repeat_pict: i32, tff: bool) -> VideoFrameRecord {
        VideoFrameRecord {
            pts: 0,
            repeat_pict,
            key_frame: false,
            tff,
            hash: 0,
        }
    }

    #[test]
    fn progressive_track_without_repeats_is_unused() {
        let frames = vec![rec(0, false), rec(0, false), rec(0, false)];
        let (fields, state) = build_rff_fields(&frames);
        assert_eq!(state, RffState::Unused);
        assert_eq!(fields.len(), frames.len());
        for (i, (top, bottom)) in fields.iter().enumerate() {
            assert_eq!(*top, i as i64);
            assert_eq!(*bottom, i as i64);
        }
    }

    #[test]
    fn matches_worked_example_from_the_component_design() {
        let frames = vec![rec(0, true), rec(2, true), rec(0, true), rec(2, true)];
        let (fields, state) = build_rff_fields(&frames);
        assert_eq!(state, RffState::Ready);
        assert_eq!(fields.len(), 6);
        assert_eq!(fields[0], (0, 0));
        assert_eq!(fields[1], (1, 1));
        assert_eq!(fields[2], (1, 2));
        assert_eq!(fields[3], (2, 3));
        assert_eq!(fields[4], (3, 3));
        // Trailing parity is padded with a repeat of the last known field.
        assert_eq!(fields[5].0, 3);
    }

    #[test]
    fn field_count_conservation_holds_within_one() {
        let frames = vec![rec(0, true), rec(1, false), rec(0, true)];
        let total_fields: i64 = frames.iter().map(|f| (f.repeat_pict + 2) as i64).sum();
        let (fields, _) = build_rff_fields(&frames);
        let observed = 2 * fields.len() as i64;
        assert!(observed == total_fields || observed == total_fields + 1);
    }
}
