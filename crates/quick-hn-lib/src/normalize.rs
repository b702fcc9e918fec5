//! Street name and house number normalization
//!
//! [`normalize`] canonicalizes look-alike punctuation from several scripts, collapses
//! whitespace and rewrites street suffixes that are spelled in more than one way in Nepal.
//! Suffixes match in any case and are rewritten to one canonical spelling; the rest of
//! the name keeps its case. Callers fold case through [`matching_key`] before comparing.

use once_cell::sync::Lazy;
use regex::Regex;
use unicode_normalization::UnicodeNormalization;

/// Whole-word rewrites applied after punctuation cleanup, in order
static SUFFIX_REWRITES: Lazy<Vec<(Regex, &'static str)>> = Lazy::new(|| {
    [
        (r"(?i)\bMarg\b", "Marga"),
        (r"(?i)\bRoad\b", "Rd"),
        (r"(?i)\bStreet\b", "St"),
        (r"(?i)\bPrithivi\b", "Prithvi"),
    ]
    .into_iter()
    .map(|(pattern, replacement)| {
        (
            Regex::new(pattern).expect("suffix rewrite pattern is valid"),
            replacement,
        )
    })
    .collect()
});

/// Map look-alike punctuation to its ASCII equivalent
fn ascii_punctuation(c: char) -> char {
    match c {
        '\u{1806}' | '\u{2010}' | '\u{2011}' | '\u{2012}' | '\u{2013}' | '\u{FE58}'
        | '\u{FE63}' | '\u{FF0D}' => '-',
        '<' | '>' | '\u{2018}' | '\u{2019}' | '\u{201A}' | '\u{201B}' | '\u{2039}'
        | '\u{203A}' | '\u{275B}' | '\u{275C}' | '\u{276E}' | '\u{276F}' | '\u{FF07}'
        | '\u{300C}' | '\u{300D}' => '\'',
        '\u{00AB}' | '\u{00BB}' | '\u{201C}' | '\u{201D}' | '\u{201E}' | '\u{201F}'
        | '\u{275D}' | '\u{275E}' | '\u{2E42}' | '\u{301D}' | '\u{301E}' | '\u{301F}'
        | '\u{FF02}' | '\u{300E}' | '\u{300F}' => '"',
        other => other,
    }
}

/// Canonicalize a street name
///
/// Idempotent: `normalize(&normalize(x)) == normalize(x)`.
pub fn normalize(name: &str) -> String {
    let cleaned: String = name.nfc().map(ascii_punctuation).collect();
    let mut collapsed = cleaned.split_whitespace().collect::<Vec<_>>().join(" ");

    for (pattern, replacement) in SUFFIX_REWRITES.iter() {
        if pattern.is_match(&collapsed) {
            collapsed = pattern.replace_all(&collapsed, *replacement).into_owned();
        }
    }
    collapsed
}

/// Case-folded normalized name used for set membership and equality tests
pub fn matching_key(name: &str) -> String {
    normalize(name).to_lowercase()
}

/// Fold house-number separators to one form for matching only
///
/// `12/3`, `12-3` and `12_3` compare equal. Never use the result for display.
pub fn simplify_number(number: &str) -> String {
    number.trim().replace(['/', '-'], "_")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_suffix_rewrites() {
        assert_eq!(normalize("Prithvi Narayan  Marg"), "Prithvi Narayan Marga");
        assert_eq!(normalize("Main Street"), "Main St");
        assert_eq!(normalize("Ring Road"), "Ring Rd");
        assert_eq!(normalize("Prithivi Path"), "Prithvi Path");
    }

    #[test]
    fn test_whole_words_only() {
        assert_eq!(normalize("Margaret Road"), "Margaret Rd");
        assert_eq!(normalize("Roadside Street"), "Roadside St");
        assert_eq!(normalize("Araniko Marga"), "Araniko Marga");
    }

    #[test]
    fn test_suffix_case_folded() {
        assert_eq!(normalize("MAIN STREET"), "MAIN St");
        assert_eq!(normalize("main street"), "main St");
        assert_eq!(normalize("jhamsikhel marg"), "jhamsikhel Marga");
        assert_eq!(normalize("PRITHIVI path"), "Prithvi path");
    }

    #[test]
    fn test_punctuation_and_whitespace() {
        assert_eq!(normalize("  Jhamsikhel\u{2013}Sanepa  "), "Jhamsikhel-Sanepa");
        assert_eq!(normalize("\u{201C}Tole\u{201D}"), "\"Tole\"");
        assert_eq!(normalize("Ram\u{2019}s\tMarg"), "Ram's Marga");
        assert_eq!(normalize("\u{300C}x\u{300D}"), "'x'");
    }

    #[test]
    fn test_unicode_composition() {
        // Decomposed e + combining acute composes to a single scalar
        assert_eq!(normalize("Cafe\u{0301}"), "Caf\u{00E9}");
    }

    #[test]
    fn test_idempotent() {
        let inputs = [
            "Prithvi Narayan  Marg",
            "Main Street",
            "  Ring\u{2010}Road  ",
            "Prithivi Marg Road Street",
            "prithivi MARG road street",
            "",
            "\u{0928}\u{0947}\u{092A}\u{093E}\u{0932}",
        ];
        for input in inputs {
            let once = normalize(input);
            assert_eq!(normalize(&once), once, "not idempotent for {input:?}");
        }
    }

    #[test]
    fn test_matching_key() {
        assert_eq!(matching_key("Araniko Marg"), matching_key("araniko marga"));
        assert_eq!(matching_key("jhamsikhel marg"), matching_key("Jhamsikhel Marga"));
        assert_eq!(matching_key("RING ROAD"), matching_key("Ring Rd"));
        assert_ne!(matching_key("Araniko Marga"), matching_key("Araniko Rd"));
    }

    #[test]
    fn test_simplify_number() {
        assert_eq!(simplify_number("12/3"), "12_3");
        assert_eq!(simplify_number("12-3-4"), "12_3_4");
        assert_eq!(simplify_number(" 7 "), "7");
        assert_eq!(simplify_number("12/3"), simplify_number("12-3"));
    }
}
