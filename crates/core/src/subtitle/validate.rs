//! Structural fidelity checks based on timestamp-marker counts.

use super::TIMESTAMP_MARKER;
use crate::error::{MismatchScope, Result, TranslateError};
use tracing::debug;

/// Percentage of the original cue count a translated document must reach.
const MIN_PERCENT: usize = 95;
/// Absolute number of extra cues a translated document may carry.
const MAX_SURPLUS: usize = 5;

/// Count structural units (cues) by their timestamp markers.
pub fn count_units(text: &str) -> usize {
    text.matches(TIMESTAMP_MARKER).count()
}

/// Check a whole translated document against the tolerance band.
pub fn validate_document(original: usize, translated_text: &str) -> Result<()> {
    let actual = count_units(translated_text);
    let lower = (original * MIN_PERCENT).div_ceil(100);
    let upper = original + MAX_SURPLUS;
    debug!("validate_document original={original} actual={actual} band={lower}..={upper}");
    if actual >= lower && actual <= upper {
        Ok(())
    } else {
        Err(TranslateError::StructuralMismatch {
            scope: MismatchScope::Document,
            expected: original,
            actual,
        })
    }
}

/// Check a single chunk reply; the count has to match exactly.
pub fn validate_chunk(expected: usize, translated_text: &str) -> Result<()> {
    let actual = count_units(translated_text);
    if actual == expected {
        Ok(())
    } else {
        Err(TranslateError::StructuralMismatch {
            scope: MismatchScope::Chunk,
            expected,
            actual,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cues(n: usize) -> String {
        (0..n)
            .map(|i| format!("{}\n00:00:{:02},000 --> 00:00:{:02},500\nline", i + 1, i % 60, i % 60))
            .collect::<Vec<_>>()
            .join("\n\n")
    }

    #[test]
    fn counts_markers_regardless_of_spacing() {
        assert_eq!(count_units(""), 0);
        assert_eq!(count_units("WEBVTT"), 0);
        assert_eq!(count_units("a --> b\nc --> d\n\n\n\n   e --> f"), 3);
        assert_eq!(count_units(&cues(12)), 12);
    }

    #[test]
    fn document_tolerance_band_edges() {
        assert!(validate_document(100, &cues(95)).is_ok());
        assert!(validate_document(100, &cues(105)).is_ok());
        assert!(validate_document(100, &cues(100)).is_ok());
        let low = validate_document(100, &cues(94)).unwrap_err();
        assert!(matches!(
            low,
            TranslateError::StructuralMismatch {
                scope: MismatchScope::Document,
                expected: 100,
                actual: 94
            }
        ));
        assert!(validate_document(100, &cues(106)).is_err());
    }

    #[test]
    fn small_documents_round_the_lower_bound_up() {
        // ceil(3 * 0.95) = 3, so losing a single cue of three fails.
        assert!(validate_document(3, &cues(2)).is_err());
        assert!(validate_document(0, "").is_ok());
        assert!(validate_document(0, &cues(5)).is_ok());
    }

    #[test]
    fn chunk_validation_requires_exact_count() {
        assert!(validate_chunk(3, &cues(3)).is_ok());
        assert!(matches!(
            validate_chunk(3, &cues(4)),
            Err(TranslateError::StructuralMismatch {
                scope: MismatchScope::Chunk,
                expected: 3,
                actual: 4
            })
        ));
        assert!(validate_chunk(3, &cues(2)).is_err());
    }
}
