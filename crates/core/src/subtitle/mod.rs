//! This module is responsible for cue-level subtitle handling.
//! It splits raw subtitle text into a header and opaque cue blocks, groups
//! cues into bounded chunks and derives output file names.

use crate::error::{Result, TranslateError};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::trace;

pub mod validate;

/// Token that marks the timestamp line of a cue (`00:00:01,000 --> 00:00:02,000`).
pub const TIMESTAMP_MARKER: &str = "-->";

/// Separator placed between cues and between the header and the first cue.
pub const CUE_SEPARATOR: &str = "\n\n";

/// A subtitle file split into the part before the first cue and the cues.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubtitleDocument {
    /// Signature line and metadata preceding the first cue, trimmed.
    pub header: String,
    /// Cue blocks in source order, each without surrounding blank lines.
    pub cues: Vec<String>,
}

/// An ordered run of cues sent to the translator as one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    /// Zero-based position of the chunk within its document.
    pub index: usize,
    /// Member cues joined by blank lines.
    pub text: String,
    /// Number of cues joined into `text`.
    pub cue_count: usize,
}

/// Split raw subtitle text into header and cues.
/// The way this works is by locating the first timestamp line, walking back
/// to the preceding blank line so a cue identifier stays with its cue, and
/// then cutting the remainder on blank lines.
pub fn split(raw: &str) -> SubtitleDocument {
    let text = normalize_line_endings(raw);
    let lines: Vec<&str> = text.split('\n').collect();
    let Some(first_marker) = lines.iter().position(|l| l.contains(TIMESTAMP_MARKER)) else {
        trace!("split: no timestamp marker, treating input as header");
        return SubtitleDocument {
            header: text.trim().to_string(),
            cues: Vec::new(),
        };
    };
    let mut start = first_marker;
    while start > 0 && !is_blank(lines[start - 1]) {
        start -= 1;
    }
    let header = lines[..start].join("\n").trim().to_string();
    let cues = split_blocks(&lines[start..]);
    trace!("split: header_len={} cues={}", header.len(), cues.len());
    SubtitleDocument { header, cues }
}

/// Recombine a document into subtitle text.
pub fn join(doc: &SubtitleDocument) -> String {
    let mut parts: Vec<&str> = Vec::with_capacity(doc.cues.len() + 1);
    if !doc.header.is_empty() {
        parts.push(&doc.header);
    }
    parts.extend(doc.cues.iter().map(String::as_str));
    if parts.is_empty() {
        return String::new();
    }
    let mut out = parts.join(CUE_SEPARATOR);
    out.push('\n');
    out
}

/// Group cues into chunks of at most `size` cues, preserving order.
pub fn chunk_cues(cues: &[String], size: usize) -> Result<Vec<Chunk>> {
    if size == 0 {
        return Err(TranslateError::InvalidArgument(
            "chunk size must be positive".to_string(),
        ));
    }
    Ok(cues
        .chunks(size)
        .enumerate()
        .map(|(index, members)| Chunk {
            index,
            text: members.join(CUE_SEPARATOR),
            cue_count: members.len(),
        })
        .collect())
}

/// Derive the translated file name for `input`.
/// A trailing language suffix such as `movie.en.srt` is replaced, otherwise
/// the language is inserted before the extension.
pub fn output_file_name(input: &Path, target_language: &str) -> PathBuf {
    let stem = input
        .file_stem()
        .unwrap_or_default()
        .to_string_lossy()
        .to_string();
    let base = match stem.rsplit_once('.') {
        Some((rest, suffix)) if !rest.is_empty() && looks_like_language_tag(suffix) => {
            rest.to_string()
        }
        _ => stem,
    };
    let name = match input.extension() {
        Some(ext) => format!("{base}.{target_language}.{}", ext.to_string_lossy()),
        None => format!("{base}.{target_language}"),
    };
    input.with_file_name(name)
}

/// ISO 639-1 codes.
const LANGUAGE_CODES_2: &[&str] = &[
    "aa", "ab", "ae", "af", "ak", "am", "an", "ar", "as", "av", "ay", "az", "ba", "be", "bg",
    "bh", "bi", "bm", "bn", "bo", "br", "bs", "ca", "ce", "ch", "co", "cr", "cs", "cu", "cv",
    "cy", "da", "de", "dv", "dz", "ee", "el", "en", "eo", "es", "et", "eu", "fa", "ff", "fi",
    "fj", "fo", "fr", "fy", "ga", "gd", "gl", "gn", "gu", "gv", "ha", "he", "hi", "ho", "hr",
    "ht", "hu", "hy", "hz", "ia", "id", "ie", "ig", "ii", "ik", "io", "is", "it", "iu", "ja",
    "jv", "ka", "kg", "ki", "kj", "kk", "kl", "km", "kn", "ko", "kr", "ks", "ku", "kv", "kw",
    "ky", "la", "lb", "lg", "li", "ln", "lo", "lt", "lu", "lv", "mg", "mh", "mi", "mk", "ml",
    "mn", "mr", "ms", "mt", "my", "na", "nb", "nd", "ne", "ng", "nl", "nn", "no", "nr", "nv",
    "ny", "oc", "oj", "om", "or", "os", "pa", "pi", "pl", "ps", "pt", "qu", "rm", "rn", "ro",
    "ru", "rw", "sa", "sc", "sd", "se", "sg", "si", "sk", "sl", "sm", "sn", "so", "sq", "sr",
    "ss", "st", "su", "sv", "sw", "ta", "te", "tg", "th", "ti", "tk", "tl", "tn", "to", "tr",
    "ts", "tt", "tw", "ty", "ug", "uk", "ur", "uz", "ve", "vi", "vo", "wa", "wo", "xh", "yi",
    "yo", "za", "zh", "zu",
];

/// ISO 639-2 codes commonly seen in subtitle file names.
const LANGUAGE_CODES_3: &[&str] = &[
    "ara", "bul", "cat", "ces", "chi", "cze", "dan", "deu", "dut", "ell", "eng", "est", "fin",
    "fra", "fre", "ger", "gre", "heb", "hin", "hrv", "hun", "ind", "ita", "jpn", "kor", "lav",
    "lit", "may", "msa", "nld", "nob", "nor", "per", "fas", "pol", "por", "rum", "ron", "rus",
    "slk", "slo", "slv", "spa", "srp", "swe", "tha", "tur", "ukr", "vie", "zho",
];

/// `en`, `por`, `pt-BR`, `zh_Hant` and similar. The primary subtag must be
/// a known lowercase code so title words like `Dr.No` are left alone.
fn looks_like_language_tag(s: &str) -> bool {
    let (primary, region) = match s.split_once(['-', '_']) {
        Some((p, r)) => (p, Some(r)),
        None => (s, None),
    };
    let primary_ok = LANGUAGE_CODES_2.contains(&primary) || LANGUAGE_CODES_3.contains(&primary);
    let region_ok = region
        .map(|r| (2..=4).contains(&r.len()) && r.chars().all(|c| c.is_ascii_alphanumeric()))
        .unwrap_or(true);
    primary_ok && region_ok
}

fn normalize_line_endings(raw: &str) -> String {
    raw.replace("\r\n", "\n").replace('\r', "\n")
}

fn is_blank(line: &str) -> bool {
    line.trim().is_empty()
}

/// Collect runs of non-blank lines; blank lines only separate.
fn split_blocks(lines: &[&str]) -> Vec<String> {
    let mut blocks = Vec::new();
    let mut current: Vec<&str> = Vec::new();
    for &line in lines {
        if is_blank(line) {
            if !current.is_empty() {
                blocks.push(current.join("\n"));
                current.clear();
            }
        } else {
            current.push(line);
        }
    }
    if !current.is_empty() {
        blocks.push(current.join("\n"));
    }
    blocks
}

#[cfg(test)]
mod tests {
    use super::*;

    const VTT: &str = "WEBVTT\nKind: captions\n\n1\n00:00:00.000 --> 00:00:01.000\n<v Bob>Hello</v>\n\n2\n00:00:01.000 --> 00:00:02.000\nWorld\nagain\n\n\n\n00:00:02.000 --> 00:00:03.000\nBye\n";

    #[test]
    fn splits_header_and_cues_keeping_identifiers() {
        let doc = split(VTT);
        assert_eq!(doc.header, "WEBVTT\nKind: captions");
        assert_eq!(
            doc.cues,
            vec![
                "1\n00:00:00.000 --> 00:00:01.000\n<v Bob>Hello</v>".to_string(),
                "2\n00:00:01.000 --> 00:00:02.000\nWorld\nagain".to_string(),
                "00:00:02.000 --> 00:00:03.000\nBye".to_string(),
            ]
        );
    }

    #[test]
    fn srt_without_header_has_empty_header() {
        let doc = split("1\n00:00:00,000 --> 00:00:01,000\nHello\n\n2\n00:00:01,000 --> 00:00:02,000\nWorld\n");
        assert_eq!(doc.header, "");
        assert_eq!(doc.cues.len(), 2);
        assert!(doc.cues[0].starts_with("1\n"));
    }

    #[test]
    fn normalizes_crlf_and_whitespace_only_separators() {
        let doc = split("WEBVTT\r\n\r\n00:00:00.000 --> 00:00:01.000\r\nA\r\n   \r\n00:00:01.000 --> 00:00:02.000\rB\r");
        assert_eq!(doc.header, "WEBVTT");
        assert_eq!(
            doc.cues,
            vec![
                "00:00:00.000 --> 00:00:01.000\nA".to_string(),
                "00:00:01.000 --> 00:00:02.000\nB".to_string(),
            ]
        );
    }

    #[test]
    fn input_without_marker_is_all_header() {
        let doc = split("  WEBVTT\n\nNOTE nothing here\n ");
        assert_eq!(doc.header, "WEBVTT\n\nNOTE nothing here");
        assert!(doc.cues.is_empty());
    }

    #[test]
    fn resplitting_a_recombined_document_is_stable() {
        let doc = split(VTT);
        let rejoined = join(&doc);
        assert_eq!(split(&rejoined), doc);
        assert_eq!(join(&split(&rejoined)), rejoined);
    }

    #[test]
    fn join_omits_empty_header() {
        let doc = SubtitleDocument {
            header: String::new(),
            cues: vec!["a --> b".into(), "c --> d".into()],
        };
        assert_eq!(join(&doc), "a --> b\n\nc --> d\n");
        assert_eq!(join(&SubtitleDocument::default()), "");
    }

    #[test]
    fn chunks_conserve_cues_in_order() {
        let cues: Vec<String> = (0..7).map(|i| format!("{i}\n00:00 --> 00:01\nline {i}")).collect();
        for size in 1..=8 {
            let chunks = chunk_cues(&cues, size).unwrap();
            assert_eq!(chunks.len(), cues.len().div_ceil(size));
            assert_eq!(chunks.iter().map(|c| c.cue_count).sum::<usize>(), cues.len());
            let rebuilt: Vec<String> = chunks
                .iter()
                .flat_map(|c| c.text.split(CUE_SEPARATOR).map(str::to_string).collect::<Vec<_>>())
                .collect();
            assert_eq!(rebuilt, cues);
            for (i, c) in chunks.iter().enumerate() {
                assert_eq!(c.index, i);
            }
        }
    }

    #[test]
    fn last_chunk_may_be_smaller() {
        let cues: Vec<String> = vec!["a".into(), "b".into(), "c".into()];
        let chunks = chunk_cues(&cues, 2).unwrap();
        assert_eq!(chunks[0].text, "a\n\nb");
        assert_eq!(chunks[1].text, "c");
        assert_eq!(chunks[1].cue_count, 1);
        assert!(chunk_cues(&[], 2).unwrap().is_empty());
    }

    #[test]
    fn zero_chunk_size_is_invalid() {
        let err = chunk_cues(&["a".to_string()], 0).unwrap_err();
        assert!(matches!(err, TranslateError::InvalidArgument(_)));
    }

    #[test]
    fn output_name_replaces_or_inserts_language() {
        assert_eq!(
            output_file_name(Path::new("/tmp/movie.en.srt"), "pt-BR"),
            PathBuf::from("/tmp/movie.pt-BR.srt")
        );
        assert_eq!(
            output_file_name(Path::new("show.s01e01.vtt"), "de"),
            PathBuf::from("show.s01e01.de.vtt")
        );
        assert_eq!(
            output_file_name(Path::new("movie.vtt"), "fr"),
            PathBuf::from("movie.fr.vtt")
        );
        assert_eq!(
            output_file_name(Path::new("notes"), "es"),
            PathBuf::from("notes.es")
        );
        assert_eq!(
            output_file_name(Path::new("film.por.srt"), "en"),
            PathBuf::from("film.en.srt")
        );
        assert_eq!(
            output_file_name(Path::new("film.zh_Hant.srt"), "ja"),
            PathBuf::from("film.ja.srt")
        );
    }

    #[test]
    fn title_words_are_not_mistaken_for_language_tags() {
        assert_eq!(
            output_file_name(Path::new("Dr.No.srt"), "pt-BR"),
            PathBuf::from("Dr.No.pt-BR.srt")
        );
        assert_eq!(
            output_file_name(Path::new("Mr.Big.vtt"), "de"),
            PathBuf::from("Mr.Big.de.vtt")
        );
        assert_eq!(
            output_file_name(Path::new("show.xyz.srt"), "fr"),
            PathBuf::from("show.xyz.fr.srt")
        );
    }
}
