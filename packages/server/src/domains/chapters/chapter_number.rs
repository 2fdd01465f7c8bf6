//! Chapter-number normalization.
//!
//! Upstream sources print chapter numbers every way imaginable: "12",
//! "Chapter 12.5", "Ch. 3", "Prologue", "Extra 2", "Vol. 4 Ch. 31". All of
//! them normalize to a decomposed sortable key so ordering never goes
//! through a float and special chapters land in fixed bands:
//!
//! ```text
//! prologue/oneshot  <  1 < 1.5 < 2 < ...  <  extra/omake  <  epilogue
//!     band 0              band 1               band 2         band 3
//! ```

use lazy_static::lazy_static;
use regex::Regex;
use sha2::{Digest, Sha256};

/// Sort band for a chapter key. Ordering is the derived integer ordering.
pub const BAND_FRONT: i16 = 0;
pub const BAND_NUMERIC: i16 = 1;
pub const BAND_EXTRA: i16 = 2;
pub const BAND_BACK: i16 = 3;

/// Fractional parts scale to four digits: "12.5" → sub 5000, "12.25" → 2500.
const SUB_SCALE: u32 = 4;

/// Decomposed sortable chapter key: `(band, main, sub)` with plain integer
/// ordering. This is the canonical identity of a chapter within a series.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ChapterKey {
    pub band: i16,
    pub main: i64,
    pub sub: i32,
}

impl ChapterKey {
    pub fn numeric(main: i64, sub: i32) -> Self {
        Self {
            band: BAND_NUMERIC,
            main,
            sub,
        }
    }
}

/// A normalized chapter number, with the fallback flag for observability.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedChapterNumber {
    pub key: ChapterKey,
    /// True when the raw text did not match any known form and the key was
    /// derived from a hash of the text instead.
    pub fallback: bool,
}

/// Special tokens and the band/offset they pin to. Offsets are spaced so a
/// trailing index ("Extra 2") stays inside its token's slot.
const SPECIAL_TOKENS: &[(&str, i16, i64)] = &[
    ("prologue", BAND_FRONT, 0),
    ("prelude", BAND_FRONT, 1_000),
    ("intro", BAND_FRONT, 2_000),
    ("introduction", BAND_FRONT, 2_000),
    ("oneshot", BAND_FRONT, 3_000),
    ("one-shot", BAND_FRONT, 3_000),
    ("extra", BAND_EXTRA, 0),
    ("omake", BAND_EXTRA, 1_000),
    ("special", BAND_EXTRA, 2_000),
    ("bonus", BAND_EXTRA, 3_000),
    ("side story", BAND_EXTRA, 4_000),
    ("sidestory", BAND_EXTRA, 4_000),
    ("epilogue", BAND_BACK, 0),
    ("afterword", BAND_BACK, 1_000),
    ("postscript", BAND_BACK, 2_000),
];

lazy_static! {
    /// "chapter 12", "ch. 12", "ep 3", "#12", optionally after a volume
    /// qualifier like "vol. 4".
    static ref PREFIX_RE: Regex = Regex::new(
        r"(?i)^\s*(?:vol(?:ume)?\.?\s*\d+\s*[,:\-]?\s*)?(?:chapter|chap\.?|ch\.?|episode|ep\.?|#)\s*"
    )
    .expect("prefix regex");

    /// Plain number with optional fraction ("12", "12.5", "12,5") and an
    /// optional letter suffix ("12a").
    static ref NUMBER_RE: Regex =
        Regex::new(r"^(\d{1,9})(?:[.,](\d{1,4}))?([a-z])?$").expect("number regex");

    /// Special token with an optional trailing index ("extra", "extra 2").
    static ref SPECIAL_RE: Regex =
        Regex::new(r"^([a-z][a-z\- ]*?)\s*(\d{1,3})?$").expect("special regex");
}

/// Normalize a raw chapter-number string into a sortable key.
///
/// Never fails: text that matches no known form gets a deterministic
/// fallback key in the extras band, derived from a hash of the cleaned text,
/// so one bad row cannot sink a batch and re-syncs converge on the same key.
pub fn parse_chapter_number(raw: &str) -> ParsedChapterNumber {
    let cleaned = raw.trim().to_lowercase();
    let stripped = PREFIX_RE.replace(&cleaned, "");
    let stripped = stripped.trim();

    if let Some(caps) = NUMBER_RE.captures(stripped) {
        let main: i64 = match caps[1].parse() {
            Ok(v) => v,
            Err(_) => return fallback_key(&cleaned),
        };

        let mut sub: i32 = 0;
        if let Some(frac) = caps.get(2) {
            let digits = frac.as_str();
            let scaled = format!("{:0<width$}", digits, width = SUB_SCALE as usize);
            sub = scaled[..SUB_SCALE as usize].parse().unwrap_or(0);
        } else if let Some(letter) = caps.get(3) {
            // "12a" reads as a split chapter just after 12.
            let index = (letter.as_str().as_bytes()[0] - b'a' + 1) as i32;
            sub = index * 100;
        }

        return ParsedChapterNumber {
            key: ChapterKey::numeric(main, sub),
            fallback: false,
        };
    }

    if let Some(caps) = SPECIAL_RE.captures(stripped) {
        let token = caps[1].trim();
        let index: i64 = caps
            .get(2)
            .and_then(|m| m.as_str().parse().ok())
            .unwrap_or(0);
        for (name, band, offset) in SPECIAL_TOKENS {
            if *name == token {
                return ParsedChapterNumber {
                    key: ChapterKey {
                        band: *band,
                        main: offset + index,
                        sub: 0,
                    },
                    fallback: false,
                };
            }
        }
    }

    fallback_key(&cleaned)
}

/// Deterministic key for text nothing else matched. Distinct inputs land on
/// distinct keys (hash of the cleaned text), identical inputs always land on
/// the same one.
fn fallback_key(cleaned: &str) -> ParsedChapterNumber {
    let mut hasher = Sha256::new();
    hasher.update(cleaned.as_bytes());
    let digest = hasher.finalize();
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    // Offset past the special-token slots so hashed keys never collide with
    // a pinned token position.
    let main = 1_000_000 + (i64::from_be_bytes(bytes) & i64::MAX) % 1_000_000_000;
    ParsedChapterNumber {
        key: ChapterKey {
            band: BAND_EXTRA,
            main,
            sub: 0,
        },
        fallback: true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(raw: &str) -> ChapterKey {
        parse_chapter_number(raw).key
    }

    #[test]
    fn plain_numbers_sort_numerically() {
        assert!(key("1") < key("2"));
        assert!(key("2") < key("10"));
        assert!(key("9") < key("10"));
    }

    #[test]
    fn decimal_chapters_sort_between_integers() {
        assert!(key("12") < key("12.5"));
        assert!(key("12.5") < key("13"));
        assert!(key("12.25") < key("12.5"));
    }

    #[test]
    fn comma_decimal_is_accepted() {
        assert_eq!(key("12,5"), key("12.5"));
    }

    #[test]
    fn fraction_does_not_go_through_a_float() {
        // ".5" and ".50" are the same position; ".05" is not.
        assert_eq!(key("12.5"), key("12.50"));
        assert!(key("12.05") < key("12.5"));
    }

    #[test]
    fn prefixes_are_stripped() {
        assert_eq!(key("Chapter 12"), key("12"));
        assert_eq!(key("ch. 12"), key("12"));
        assert_eq!(key("Ch 12"), key("12"));
        assert_eq!(key("#12"), key("12"));
        assert_eq!(key("Episode 12"), key("12"));
        assert_eq!(key("Vol. 4 Ch. 12"), key("12"));
    }

    #[test]
    fn letter_suffix_sorts_after_base() {
        assert!(key("12") < key("12a"));
        assert!(key("12a") < key("12b"));
        assert!(key("12b") < key("13"));
    }

    #[test]
    fn special_bands_bracket_the_numeric_range() {
        assert!(key("Prologue") < key("1"));
        assert!(key("Oneshot") < key("1"));
        assert!(key("9999") < key("Extra"));
        assert!(key("Extra") < key("Epilogue"));
        assert!(key("Omake") < key("Epilogue"));
        assert!(key("Epilogue") < key("Afterword"));
    }

    #[test]
    fn indexed_specials_stay_in_their_slot() {
        assert!(key("Extra") < key("Extra 2"));
        assert!(key("Extra 2") < key("Omake"));
    }

    #[test]
    fn unparseable_text_gets_deterministic_fallback() {
        let a = parse_chapter_number("???");
        let b = parse_chapter_number("???");
        assert!(a.fallback);
        assert_eq!(a.key, b.key);
    }

    #[test]
    fn distinct_unparseable_texts_get_distinct_keys() {
        assert_ne!(key("???"), key("?!?"));
    }

    #[test]
    fn fallback_sorts_into_the_extras_band() {
        let parsed = parse_chapter_number("complete garbage");
        assert_eq!(parsed.key.band, BAND_EXTRA);
        assert!(key("9999") < parsed.key);
        assert!(parsed.key < key("Epilogue"));
    }

    #[test]
    fn normal_forms_are_not_fallbacks() {
        assert!(!parse_chapter_number("12").fallback);
        assert!(!parse_chapter_number("Prologue").fallback);
        assert!(!parse_chapter_number("Extra 2").fallback);
    }
}
