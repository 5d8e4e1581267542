//! Status text formatting for the PLC's fixed-width HMI fields.
//!
//! The PLC text fields only take ASCII, so Turkish diacritics are folded
//! before writing. The analysis text is split across three blocks and each
//! warning gets its numbered `N.UYARI:` prefix, matching what the HMI screens
//! were built against.

/// Fold Turkish diacritics to their ASCII counterparts. Other characters are
/// passed through unchanged.
pub fn transliterate(text: &str) -> String {
    text.chars()
        .map(|c| match c {
            'ç' => 'c',
            'Ç' => 'C',
            'ğ' => 'g',
            'Ğ' => 'G',
            'ı' => 'i',
            'İ' => 'I',
            'ö' => 'o',
            'Ö' => 'O',
            'ş' => 's',
            'Ş' => 'S',
            'ü' => 'u',
            'Ü' => 'U',
            other => other,
        })
        .collect()
}

/// Split the analysis text into the three analysis-block segments
/// (characters 0..100, 100..200, 200..250). Text beyond 250 characters is
/// dropped; short text leaves trailing segments empty.
pub fn analysis_segments(analysis: &str) -> [String; 3] {
    let folded = transliterate(analysis);
    let chars: Vec<char> = folded.chars().collect();
    let slice = |start: usize, end: usize| -> String {
        if start >= chars.len() {
            return String::new();
        }
        chars[start..end.min(chars.len())].iter().collect()
    };
    [slice(0, 100), slice(100, 200), slice(200, 250)]
}

/// Numbered warning line for warning block `index` (zero-based).
pub fn warning_line(index: usize, warning: &str) -> String {
    let folded = transliterate(warning);
    let body: String = folded.chars().take(100).collect();
    format!("{}.UYARI: {}", index + 1, body)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn folds_all_turkish_diacritics() {
        assert_eq!(
            transliterate("çÇğĞıİöÖşŞüÜ"),
            "cCgGiIoOsSuU"
        );
        assert_eq!(transliterate("Isıtıcı açıldı"), "Isitici acildi");
    }

    #[test]
    fn ascii_text_is_untouched() {
        assert_eq!(transliterate("plain ascii 123"), "plain ascii 123");
    }

    #[test]
    fn long_analysis_splits_into_100_100_50() {
        let text: String = std::iter::repeat('a').take(300).collect();
        let segments = analysis_segments(&text);
        assert_eq!(segments[0].len(), 100);
        assert_eq!(segments[1].len(), 100);
        assert_eq!(segments[2].len(), 50);
    }

    #[test]
    fn short_analysis_leaves_trailing_segments_empty() {
        let segments = analysis_segments("kisa analiz");
        assert_eq!(segments[0], "kisa analiz");
        assert_eq!(segments[1], "");
        assert_eq!(segments[2], "");
    }

    #[test]
    fn segments_split_on_characters_not_bytes() {
        // 150 multi-byte characters must split at char 100, not panic on a
        // byte boundary.
        let text: String = std::iter::repeat('ğ').take(150).collect();
        let segments = analysis_segments(&text);
        assert_eq!(segments[0], "g".repeat(100));
        assert_eq!(segments[1], "g".repeat(50));
    }

    #[test]
    fn warning_lines_are_numbered_and_bounded() {
        assert_eq!(warning_line(0, "nem düşük"), "1.UYARI: nem dusuk");
        let long = "u".repeat(300);
        let line = warning_line(4, &long);
        assert!(line.starts_with("5.UYARI: "));
        assert_eq!(line.len(), "5.UYARI: ".len() + 100);
    }
}
