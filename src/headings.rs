// 🏷️ Heading Associator - attach section titles to the verse they introduce
//
// Headings in source markup float between verses. We locate every verse
// anchor and every heading candidate by character offset, then pair each
// heading with the first anchor after it, provided the gap is short enough.
//
// Two failure modes we guard against:
// - A heading at the bottom of a page that belongs to the NEXT chapter's
//   front matter (too far from any anchor → dropped)
// - A heading captured for verse N when the chapter has no verse N
//   (markup skipped a number → remapped, counted as a fallback)

use crate::normalizer::normalize;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

static NAME_ANCHOR_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?i)<[a-z]+\b[^>]*?\b(?:name|id)\s*=\s*["']?v(?:erse)?[-_]?(\d{1,3})["'\s>/][^>]*>?"#).unwrap()
});
static DATA_ANCHOR_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"(?i)<[a-z]+\b[^>]*?\bdata-verse\s*=\s*["']?(\d{1,3})["']?[^>]*>"#).unwrap());
static SUP_ANCHOR_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)<sup\b[^>]*>\s*(\d{1,3})\s*</sup\s*>").unwrap());

static H_TAG_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?is)<h[2-6]\b[^>]*>(.*?)</h[2-6]\s*>").unwrap());
static CLASS_HEADING_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r#"(?is)<(?:div|p|span)\b[^>]*\bclass\s*=\s*["'][^"']*\b(?:heading|title|pericope|judul)\b[^"']*["'][^>]*>(.*?)</(?:div|p|span)\s*>"#,
    )
    .unwrap()
});
static BOLD_LINE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?is)(?:<p\b[^>]*>|<br\s*/?>|<div\b[^>]*>)\s*<(?:b|strong)\b[^>]*>([^<]*?)</(?:b|strong)\s*>\s*(?:</p\s*>|<br\s*/?>|</div\s*>)",
    )
    .unwrap()
});

static CHAPTER_LINE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^(?:chapter|chap\.?|pasal|psalm|psalms|mazmur|bab|kapitel|chapitre)\s+[0-9ivxlcdm]+\.?$").unwrap()
});
static ROMAN_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[IVXLCDM]+\.?$").unwrap());

// ============================================================================
// SETTINGS
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HeadingSettings {
    /// Max raw-markup characters between a heading's end and its verse anchor
    pub max_distance: usize,

    /// Longer "headings" are prose that happened to be bold
    pub max_title_len: usize,

    /// Remap headings whose verse is missing (nearest greater, else last)
    pub fallback: bool,
}

impl Default for HeadingSettings {
    fn default() -> Self {
        HeadingSettings {
            max_distance: 400,
            max_title_len: 120,
            fallback: true,
        }
    }
}

// ============================================================================
// CORE TYPES
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VerseAnchor {
    /// Offset where the anchor markup starts
    pub offset: usize,

    /// Offset just past the anchor markup (verse text starts here)
    pub end: usize,

    pub verse: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeadingCandidate {
    pub start: usize,
    pub end: usize,
    pub title: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeadingAssignment {
    pub verse: u32,
    pub title: String,
}

/// Headings placed onto a concrete verse set
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Resolution {
    /// Sorted by verse; every verse is a member of the chapter's verse set
    pub headings: Vec<HeadingAssignment>,

    /// Headings remapped because their captured verse was absent
    pub fallbacks: usize,

    /// Headings that could not be placed
    pub dropped: usize,
}

impl Resolution {
    pub fn title_for(&self, verse: u32) -> Option<&str> {
        self.headings
            .iter()
            .find(|h| h.verse == verse)
            .map(|h| h.title.as_str())
    }
}

// ============================================================================
// SCANNING
// ============================================================================

/// Verse anchors in offset order.
///
/// Several anchor styles can mark the same verse back to back
/// (`<a name="v3"></a><sup>3</sup>`); adjacent anchors for one verse with
/// no text between them collapse into a single anchor spanning both.
pub fn scan_verse_anchors(section: &str) -> Vec<VerseAnchor> {
    let mut found: Vec<VerseAnchor> = Vec::new();
    for re in [&*NAME_ANCHOR_RE, &*DATA_ANCHOR_RE, &*SUP_ANCHOR_RE] {
        for caps in re.captures_iter(section) {
            let (Some(whole), Some(num)) = (caps.get(0), caps.get(1)) else {
                continue;
            };
            if let Ok(verse) = num.as_str().parse::<u32>() {
                found.push(VerseAnchor {
                    offset: whole.start(),
                    end: whole.end(),
                    verse,
                });
            }
        }
    }

    found.sort_by_key(|a| (a.offset, std::cmp::Reverse(a.end)));

    let mut anchors: Vec<VerseAnchor> = Vec::with_capacity(found.len());
    for anchor in found {
        if let Some(last) = anchors.last_mut() {
            // Same tag matched by two patterns
            if anchor.offset < last.end {
                last.end = last.end.max(anchor.end);
                continue;
            }
            if anchor.verse == last.verse && normalize(&section[last.end..anchor.offset]).is_empty() {
                last.end = anchor.end;
                continue;
            }
        }
        anchors.push(anchor);
    }
    anchors
}

/// Reject strings that look like headings but are not section titles
pub fn is_heading_text(title: &str, max_len: usize) -> bool {
    if title.is_empty() || title.chars().count() > max_len {
        return false;
    }
    if !title.chars().any(|c| c.is_alphabetic()) {
        return false;
    }
    if CHAPTER_LINE_RE.is_match(title) || ROMAN_RE.is_match(title) {
        return false;
    }
    true
}

/// Heading candidates in offset order, already normalized and filtered.
/// Overlapping matches (a titled div wrapping an `<h3>`) keep the outermost.
pub fn scan_heading_candidates(section: &str, settings: &HeadingSettings) -> Vec<HeadingCandidate> {
    let mut found: Vec<HeadingCandidate> = Vec::new();
    for re in [&*H_TAG_RE, &*CLASS_HEADING_RE, &*BOLD_LINE_RE] {
        for caps in re.captures_iter(section) {
            let (Some(whole), Some(inner)) = (caps.get(0), caps.get(1)) else {
                continue;
            };
            let title = normalize(inner.as_str());
            if is_heading_text(&title, settings.max_title_len) {
                found.push(HeadingCandidate {
                    start: whole.start(),
                    end: whole.end(),
                    title,
                });
            }
        }
    }

    found.sort_by_key(|c| (c.start, std::cmp::Reverse(c.end)));

    let mut candidates: Vec<HeadingCandidate> = Vec::with_capacity(found.len());
    for cand in found {
        if let Some(last) = candidates.last() {
            if cand.start < last.end {
                continue;
            }
        }
        candidates.push(cand);
    }
    candidates
}

// ============================================================================
// ASSOCIATION + RESOLUTION
// ============================================================================

/// Pair each heading with the first verse anchor at or after its end.
/// Pairings farther than `max_distance` are discarded. When several
/// headings land on one verse the last (nearest) wins.
///
/// Returns the assignments in verse order and the number discarded.
pub fn associate(
    anchors: &[VerseAnchor],
    candidates: &[HeadingCandidate],
    settings: &HeadingSettings,
) -> (Vec<HeadingAssignment>, usize) {
    let mut by_verse: BTreeMap<u32, String> = BTreeMap::new();
    let mut discarded = 0;

    for cand in candidates {
        let idx = anchors.partition_point(|a| a.offset < cand.end);
        let Some(anchor) = anchors.get(idx) else {
            discarded += 1;
            continue;
        };

        if anchor.offset - cand.end > settings.max_distance {
            discarded += 1;
            continue;
        }

        by_verse.insert(anchor.verse, cand.title.clone());
    }

    let assignments = by_verse
        .into_iter()
        .map(|(verse, title)| HeadingAssignment { verse, title })
        .collect();
    (assignments, discarded)
}

/// ExtractHeadings: section markup → ordered {verse, title} list
pub fn extract_headings(section: &str, settings: &HeadingSettings) -> Vec<HeadingAssignment> {
    let anchors = scan_verse_anchors(section);
    let candidates = scan_heading_candidates(section, settings);
    associate(&anchors, &candidates, settings).0
}

/// Place assignments onto the chapter's actual verse numbers.
///
/// Exact matches go first. A heading whose verse is missing moves to the
/// nearest greater verse, else the last verse. A fallback never displaces
/// an exact heading.
pub fn resolve(assignments: &[HeadingAssignment], verse_numbers: &[u32], settings: &HeadingSettings) -> Resolution {
    let mut verses: Vec<u32> = verse_numbers.to_vec();
    verses.sort_unstable();
    verses.dedup();

    let mut resolution = Resolution::default();
    if verses.is_empty() {
        resolution.dropped = assignments.len();
        return resolution;
    }

    let mut placed: BTreeMap<u32, String> = BTreeMap::new();
    let mut misses: Vec<&HeadingAssignment> = Vec::new();

    for a in assignments {
        if verses.binary_search(&a.verse).is_ok() {
            placed.insert(a.verse, a.title.clone());
        } else {
            misses.push(a);
        }
    }

    let exact: Vec<u32> = placed.keys().copied().collect();

    for a in misses {
        if !settings.fallback {
            resolution.dropped += 1;
            continue;
        }

        let idx = verses.partition_point(|v| *v < a.verse);
        let target = match verses.get(idx) {
            Some(v) => *v,
            None => verses[verses.len() - 1],
        };

        if exact.contains(&target) {
            resolution.dropped += 1;
            continue;
        }

        placed.insert(target, a.title.clone());
        resolution.fallbacks += 1;
    }

    resolution.headings = placed
        .into_iter()
        .map(|(verse, title)| HeadingAssignment { verse, title })
        .collect();
    resolution
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn assignment(verse: u32, title: &str) -> HeadingAssignment {
        HeadingAssignment {
            verse,
            title: title.to_string(),
        }
    }

    #[test]
    fn test_scan_anchor_styles() {
        let section = r#"<a name="v1"></a>One <span id="verse-2">Two</span> <sup>3</sup>Three <span data-verse="4">Four</span>"#;
        let verses: Vec<u32> = scan_verse_anchors(section).iter().map(|a| a.verse).collect();
        assert_eq!(verses, vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_adjacent_anchors_for_same_verse_collapse() {
        let section = r#"<a name="v3"></a><sup>3</sup>In the beginning <a name="v4"></a>Next"#;
        let anchors = scan_verse_anchors(section);
        assert_eq!(anchors.len(), 2);
        assert_eq!(&section[anchors[0].end..anchors[1].offset], "In the beginning ");
    }

    #[test]
    fn test_heading_filters() {
        assert!(is_heading_text("The Creation", 120));
        assert!(!is_heading_text("Chapter 3", 120));
        assert!(!is_heading_text("PASAL 12", 120));
        assert!(!is_heading_text("Psalm 23", 120));
        assert!(!is_heading_text("XIV", 120));
        assert!(!is_heading_text("12:1-5", 120));
        assert!(!is_heading_text(&"a".repeat(121), 120));
    }

    #[test]
    fn test_extract_headings_basic() {
        let section = r#"<h3>The Creation</h3><p><a name="v1"></a>In the beginning.</p>
<p><a name="v2"></a>The earth was void.</p>
<p><b>The Seventh Day</b></p><p><a name="v3"></a>And God rested.</p>"#;

        let headings = extract_headings(section, &HeadingSettings::default());
        assert_eq!(headings, vec![assignment(1, "The Creation"), assignment(3, "The Seventh Day")]);
        println!("✅ Heading extraction PASSED");
    }

    #[test]
    fn test_chapter_lines_are_not_headings() {
        let section = r#"<h2>Chapter 5</h2><h3>A Psalm of David</h3><a name="v1"></a>Text"#;
        let headings = extract_headings(section, &HeadingSettings::default());
        assert_eq!(headings, vec![assignment(1, "A Psalm of David")]);
    }

    #[test]
    fn test_far_heading_discarded() {
        let filler = "x".repeat(500);
        let section = format!(r#"<a name="v1"></a>Text {}<h3>Next Chapter Title</h3>{}<a name="v2"></a>More"#, "", filler);
        let anchors = scan_verse_anchors(&section);
        let candidates = scan_heading_candidates(&section, &HeadingSettings::default());
        let (assigned, discarded) = associate(&anchors, &candidates, &HeadingSettings::default());
        assert!(assigned.is_empty());
        assert_eq!(discarded, 1);

        let trailing = r#"<a name="v1"></a>Text<h3>Orphan At End</h3>"#;
        assert!(extract_headings(trailing, &HeadingSettings::default()).is_empty());
    }

    #[test]
    fn test_last_heading_wins_for_same_verse() {
        let section = r#"<h3>Outer Section</h3><h4>Inner Section</h4><a name="v1"></a>Text"#;
        let headings = extract_headings(section, &HeadingSettings::default());
        assert_eq!(headings, vec![assignment(1, "Inner Section")]);
    }

    #[test]
    fn test_resolve_fallbacks_land_in_verse_set() {
        let settings = HeadingSettings::default();
        let verses = vec![1, 2, 4, 5];
        let assignments = vec![assignment(1, "A"), assignment(3, "B"), assignment(9, "C")];

        let resolution = resolve(&assignments, &verses, &settings);
        assert_eq!(resolution.fallbacks, 2);
        assert_eq!(resolution.title_for(4), Some("B"));
        assert_eq!(resolution.title_for(5), Some("C"));
        for h in &resolution.headings {
            assert!(verses.contains(&h.verse));
        }
        println!("✅ Fallback correctness PASSED");
    }

    #[test]
    fn test_fallback_never_displaces_exact() {
        let verses = vec![1, 4];
        let resolution = resolve(
            &[assignment(3, "Missed"), assignment(4, "Exact")],
            &verses,
            &HeadingSettings::default(),
        );
        assert_eq!(resolution.title_for(4), Some("Exact"));
        assert_eq!(resolution.dropped, 1);
        assert_eq!(resolution.fallbacks, 0);
    }

    #[test]
    fn test_fallback_disabled_or_no_verses() {
        let settings = HeadingSettings {
            fallback: false,
            ..HeadingSettings::default()
        };
        let resolution = resolve(&[assignment(3, "Missed")], &[1, 2], &settings);
        assert!(resolution.headings.is_empty());
        assert_eq!(resolution.dropped, 1);

        let empty = resolve(&[assignment(1, "A")], &[], &HeadingSettings::default());
        assert_eq!(empty.dropped, 1);
    }
}
