// 🧹 Text Normalizer - raw verse markup → clean text
//
// Pure functions, no I/O. Garbage in → empty string out; callers treat an
// empty result as "no content" and skip the verse.
//
// Pipeline (order matters):
//   1. strip markup (script/style dropped wholesale, breaks → spaces)
//   2. decode character references (&amp; &#8220; &nbsp; ...)
//   3. map typographic oddities (no-break/thin spaces, soft hyphens, ligatures)
//   4. collapse whitespace
//   5. repair line-break hyphenation ("begin- ning" → "beginning")
//   6. tighten punctuation and bracket spacing

use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use serde::{Deserialize, Serialize};

static SCRIPT_STYLE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?is)<script\b.*?</script\s*>|<style\b.*?</style\s*>").unwrap());
static COMMENT_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?s)<!--.*?-->").unwrap());
static BREAK_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)<br\s*/?>|</?(?:p|div|li|ul|ol|tr|td|th|table|h[1-6]|blockquote|section)\b[^>]*>")
        .unwrap()
});
static TAG_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?s)</?[a-zA-Z][^>]*>").unwrap());
static ENTITY_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"&(#[0-9]{1,7}|#[xX][0-9a-fA-F]{1,6}|[a-zA-Z][a-zA-Z0-9]{1,9});").unwrap());
static WHITESPACE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").unwrap());
static HYPHEN_BREAK_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(\p{L}+)-\s+(\p{Ll}+)").unwrap());
static SPACE_BEFORE_PUNCT_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+([,.;:!?])").unwrap());
static SPACE_AFTER_OPEN_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"([(\[{])\s+").unwrap());
static SPACE_BEFORE_CLOSE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+([)\]}])").unwrap());
static LEADING_NUMBER_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^(\d{1,3})(?:[\s.:)]+|$)").unwrap());

// ============================================================================
// CLEAN STATS
// ============================================================================

/// Tally of repairs made while normalizing a batch of verses
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CleanStats {
    pub verses_seen: usize,
    pub hyphen_repairs: usize,
    pub verse_numbers_stripped: usize,
    pub emptied: usize,
}

impl CleanStats {
    pub fn merge(&mut self, other: &CleanStats) {
        self.verses_seen += other.verses_seen;
        self.hyphen_repairs += other.hyphen_repairs;
        self.verse_numbers_stripped += other.verse_numbers_stripped;
        self.emptied += other.emptied;
    }
}

// ============================================================================
// MARKUP + ENTITIES
// ============================================================================

/// Remove markup. Script/style blocks and comments vanish with their
/// content; line breaks and block boundaries become spaces; inline tags
/// are removed without leaving a gap.
pub fn strip_tags(raw: &str) -> String {
    let text = SCRIPT_STYLE_RE.replace_all(raw, " ");
    let text = COMMENT_RE.replace_all(&text, " ");
    let text = BREAK_RE.replace_all(&text, " ");
    TAG_RE.replace_all(&text, "").into_owned()
}

fn named_entity(name: &str) -> Option<char> {
    let c = match name {
        "amp" => '&',
        "lt" => '<',
        "gt" => '>',
        "quot" => '"',
        "apos" => '\'',
        "nbsp" => '\u{00A0}',
        "ensp" => '\u{2002}',
        "emsp" => '\u{2003}',
        "thinsp" => '\u{2009}',
        "shy" => '\u{00AD}',
        "ndash" => '–',
        "mdash" => '—',
        "lsquo" => '‘',
        "rsquo" => '’',
        "sbquo" => '‚',
        "ldquo" => '“',
        "rdquo" => '”',
        "bdquo" => '„',
        "laquo" => '«',
        "raquo" => '»',
        "hellip" => '…',
        "middot" => '·',
        "bull" => '•',
        "para" => '¶',
        "sect" => '§',
        "copy" => '©',
        "dagger" => '†',
        "Dagger" => '‡',
        "aacute" => 'á',
        "agrave" => 'à',
        "acirc" => 'â',
        "auml" => 'ä',
        "eacute" => 'é',
        "egrave" => 'è',
        "ecirc" => 'ê',
        "euml" => 'ë',
        "iacute" => 'í',
        "icirc" => 'î',
        "iuml" => 'ï',
        "oacute" => 'ó',
        "ocirc" => 'ô',
        "ouml" => 'ö',
        "uacute" => 'ú',
        "ucirc" => 'û',
        "uuml" => 'ü',
        "ntilde" => 'ñ',
        "ccedil" => 'ç',
        "Eacute" => 'É',
        _ => return None,
    };
    Some(c)
}

/// Decode numeric (`&#8220;`, `&#x201C;`) and named (`&amp;`) character
/// references. Unknown names and invalid code points are left untouched.
pub fn decode_entities(text: &str) -> String {
    if !text.contains('&') {
        return text.to_string();
    }

    ENTITY_RE
        .replace_all(text, |caps: &Captures| {
            let body = &caps[1];
            let decoded = if let Some(hex) = body.strip_prefix("#x").or_else(|| body.strip_prefix("#X")) {
                u32::from_str_radix(hex, 16).ok().and_then(char::from_u32)
            } else if let Some(dec) = body.strip_prefix('#') {
                dec.parse::<u32>().ok().and_then(char::from_u32)
            } else {
                named_entity(body)
            };

            match decoded {
                Some(c) => c.to_string(),
                None => caps[0].to_string(),
            }
        })
        .into_owned()
}

/// No-break and thin spaces → plain spaces, soft hyphens and zero-width
/// characters removed, ligatures unfolded
fn map_typography(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '\u{00A0}' | '\u{2002}' | '\u{2003}' | '\u{2009}' | '\u{202F}' | '\u{2007}' => out.push(' '),
            '\u{00AD}' | '\u{200B}' | '\u{200C}' | '\u{200D}' | '\u{FEFF}' => {}
            'ﬁ' => out.push_str("fi"),
            'ﬂ' => out.push_str("fl"),
            'ﬀ' => out.push_str("ff"),
            'ﬃ' => out.push_str("ffi"),
            'ﬄ' => out.push_str("ffl"),
            _ => out.push(c),
        }
    }
    out
}

// ============================================================================
// WHITESPACE + PUNCTUATION
// ============================================================================

pub fn collapse_whitespace(text: &str) -> String {
    WHITESPACE_RE.replace_all(text, " ").trim().to_string()
}

/// Join words broken across lines: "begin- ning" → "beginning".
/// Only joins when the continuation starts lowercase, so "Jerusalem- Judah"
/// style compounds are left alone. Returns the repaired text and the
/// number of joins.
pub fn repair_hyphenation(text: &str) -> (String, usize) {
    let count = HYPHEN_BREAK_RE.find_iter(text).count();
    if count == 0 {
        return (text.to_string(), 0);
    }
    (HYPHEN_BREAK_RE.replace_all(text, "$1$2").into_owned(), count)
}

pub fn tighten_punctuation(text: &str) -> String {
    let text = SPACE_BEFORE_PUNCT_RE.replace_all(text, "$1");
    let text = SPACE_AFTER_OPEN_RE.replace_all(&text, "$1");
    SPACE_BEFORE_CLOSE_RE.replace_all(&text, "$1").into_owned()
}

// ============================================================================
// VERSE NUMBER PREFIX
// ============================================================================

/// Remove a leading verse-number token when it repeats the number already
/// known from the anchor. A different leading number is real content
/// ("12 tribes ...") and stays.
pub fn strip_verse_number(text: &str, expected: u32) -> (String, bool) {
    if let Some(caps) = LEADING_NUMBER_RE.captures(text) {
        if caps[1].parse::<u32>().ok() == Some(expected) {
            let rest = &text[caps[0].len()..];
            return (rest.trim_start().to_string(), true);
        }
    }
    (text.to_string(), false)
}

// ============================================================================
// ENTRY POINTS
// ============================================================================

fn clean(raw: &str, stats: &mut CleanStats) -> String {
    let text = strip_tags(raw);
    let text = decode_entities(&text);
    let text = map_typography(&text);
    let text = collapse_whitespace(&text);
    let (text, repairs) = repair_hyphenation(&text);
    stats.hyphen_repairs += repairs;
    tighten_punctuation(&text).trim().to_string()
}

/// Normalize an arbitrary fragment (headings, titles, free text)
pub fn normalize(raw: &str) -> String {
    let mut stats = CleanStats::default();
    clean(raw, &mut stats)
}

/// Normalize one verse's markup, stripping a duplicated verse-number prefix
pub fn normalize_verse(raw: &str, verse: u32) -> String {
    let mut stats = CleanStats::default();
    normalize_verse_with_stats(raw, verse, &mut stats)
}

pub fn normalize_verse_with_stats(raw: &str, verse: u32, stats: &mut CleanStats) -> String {
    stats.verses_seen += 1;
    let text = clean(raw, stats);
    let (text, stripped) = strip_verse_number(&text, verse);
    if stripped {
        stats.verse_numbers_stripped += 1;
    }
    if text.is_empty() {
        stats.emptied += 1;
    }
    text
}

// ============================================================================
// KEYS
// ============================================================================

fn fold_char(c: char) -> Option<&'static str> {
    let folded = match c {
        'à' | 'á' | 'â' | 'ã' | 'ä' | 'å' | 'ā' | 'ă' | 'ą' => "a",
        'ç' | 'ć' | 'č' => "c",
        'ď' | 'đ' => "d",
        'è' | 'é' | 'ê' | 'ë' | 'ē' | 'ė' | 'ę' | 'ě' => "e",
        'ì' | 'í' | 'î' | 'ï' | 'ī' | 'į' => "i",
        'ñ' | 'ń' | 'ň' => "n",
        'ò' | 'ó' | 'ô' | 'õ' | 'ö' | 'ø' | 'ō' | 'ő' => "o",
        'ŕ' | 'ř' => "r",
        'ś' | 'š' | 'ş' => "s",
        'ť' | 'ţ' => "t",
        'ù' | 'ú' | 'û' | 'ü' | 'ū' | 'ů' | 'ű' => "u",
        'ý' | 'ÿ' => "y",
        'ź' | 'ż' | 'ž' => "z",
        'ß' => "ss",
        'æ' => "ae",
        'œ' => "oe",
        _ => return None,
    };
    Some(folded)
}

/// Strip diacritics from lowercase Latin letters
pub fn fold_diacritics(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match fold_char(c) {
            Some(s) => out.push_str(s),
            None => out.push(c),
        }
    }
    out
}

/// Diacritic-, case- and punctuation-insensitive key.
/// "1 Raja-Raja" → "1 raja raja", "Kéjadian" → "kejadian"
pub fn normalize_key(name: &str) -> String {
    let lowered = fold_diacritics(&name.to_lowercase());
    let spaced: String = lowered
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .collect();
    collapse_whitespace(&spaced)
}

// ============================================================================
// TESTS
// ============================================================================
