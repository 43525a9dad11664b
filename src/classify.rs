//! Address classification.
//!
//! Station addresses in fuel price feeds are a grab-bag: ordinary postal
//! addresses, highway intersections ("I-95 & US-1"), bare route references
//! ("US-46"), and mile markers ("I-75 MM 120"). The geocoding router picks
//! its provider strategy based on which of these we're looking at, so
//! classification has to be deterministic and cheap. Everything in this
//! module is a pure function over the input string.

use regex::Regex;
use std::sync::LazyLock;
use strum_macros::{Display, EnumString};

static WHITESPACE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\s+").expect("valid regex"));

static EXIT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\bEXIT\s*\d+\b").expect("valid regex"));

static MILE_MARKER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\b(MM|MILE\s*MARKER)\s*\d+\b").expect("valid regex"));

static COMMA_SPACING_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\s*,\s*").expect("valid regex"));

static INTERSECTION_SEP_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\s*(&| AND )\s*").expect("valid regex"));

/// Joins "I-75, EXIT 15" into "I-75 EXIT 15" so the exit rides along with
/// its road instead of looking like a separate address component.
static COMMA_BEFORE_EXIT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i),\s*(EXIT\s*\d+)\b").expect("valid regex"));

/// Road tokens we recognize: Interstates, US routes and state routes.
static ROAD_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(I-\d{1,3}|US-\d{1,3}|SR-\d{1,4})\b").expect("valid regex")
});

static STREET_SUFFIX_RE: LazyLock<Regex> = LazyLock::new(|| {
    let suffixes = [
        "ST", "STREET", "AVE", "AVENUE", "RD", "ROAD", "DR", "DRIVE", "LN", "LANE",
        "BLVD", "BOULEVARD", "HWY", "HIGHWAY", "PKWY", "PARKWAY", "CT", "COURT",
        "PL", "PLACE", "CIR", "CIRCLE", "WAY", "TER", "TERRACE", "PLZ", "PLAZA",
        "TRL", "TRAIL", "PIKE", "SQ", "SQUARE",
    ];
    Regex::new(&format!(r"(?i)\b({})\b", suffixes.join("|"))).expect("valid regex")
});

/// Typical "123 Something" pattern.
static NUMBER_THEN_WORD_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b\d{1,6}\s+[A-Za-z]").expect("valid regex"));

static STREET_NUMBER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b\d{1,6}\b").expect("valid regex"));

/// What kind of address are we looking at?
///
/// The string forms are recorded verbatim in `geocode_source` labels
/// (`unresolved:<classification>:<reason>`), so they must stay stable.
#[derive(Clone, Copy, Debug, Display, EnumString, Eq, PartialEq)]
pub enum AddressKind {
    #[strum(serialize = "POSTAL_ADDRESS")]
    PostalAddress,
    #[strum(serialize = "HIGHWAY_INTERSECTION_2")]
    HighwayIntersection2,
    #[strum(serialize = "HIGHWAY_INTERSECTION_MULTI")]
    HighwayIntersectionMulti,
    #[strum(serialize = "SINGLE_ROUTE")]
    SingleRoute,
    #[strum(serialize = "MILE_MARKER")]
    MileMarker,
    #[strum(serialize = "UNKNOWN")]
    Unknown,
}

/// The result of classifying a raw address.
#[derive(Clone, Debug)]
pub struct Classified {
    /// Which bucket the address fell into.
    pub kind: AddressKind,
    /// Road tokens found in the address, uppercased, first-seen order.
    pub roads: Vec<String>,
    /// A short human-readable explanation, recorded in the audit trail.
    pub reason: &'static str,
}

/// Trim a field and collapse internal whitespace.
pub fn clean_piece(s: &str) -> String {
    WHITESPACE_RE.replace_all(s.trim(), " ").into_owned()
}

/// Normalize the (address, city, state) triple from a feed row: collapsed
/// whitespace, ", " comma spacing, " & " intersection separators, exits
/// joined to their roads, and an uppercased state code.
pub fn normalize_address_components(
    address: &str,
    city: &str,
    state: &str,
) -> (String, String, String) {
    let mut address = clean_piece(address);
    let city = clean_piece(city);
    let state = clean_piece(state).to_uppercase();

    address = COMMA_SPACING_RE.replace_all(&address, ", ").into_owned();
    address = INTERSECTION_SEP_RE.replace_all(&address, " & ").into_owned();
    address = COMMA_BEFORE_EXIT_RE.replace_all(&address, " $1").into_owned();

    (address, city, state)
}

/// Remove EXIT tokens and collapse whitespace.
pub fn remove_exit_and_noise(address: &str) -> String {
    let a = EXIT_RE.replace_all(address, "");
    let a = WHITESPACE_RE.replace_all(a.trim(), " ");
    a.trim_matches(|c| c == ',' || c == ' ').to_owned()
}

/// Remove EXIT/MM fragments so their numbers don't look like street numbers.
fn strip_exit_mm_numbers(address: &str) -> String {
    let a = EXIT_RE.replace_all(address, "");
    let a = MILE_MARKER_RE.replace_all(&a, "");
    WHITESPACE_RE.replace_all(a.trim(), " ").into_owned()
}

/// Extract road tokens, uppercased, de-duplicated preserving first-seen order.
pub fn extract_roads(address: &str) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for m in ROAD_RE.find_iter(address) {
        let road = m.as_str().to_uppercase();
        if !out.contains(&road) {
            out.push(road);
        }
    }
    out
}

/// Does this look like a highway reference, even if it contains numbers
/// (exit numbers)?
fn looks_like_highway_reference(address: &str) -> bool {
    let roads = extract_roads(address);
    if MILE_MARKER_RE.is_match(address) {
        return true;
    }
    if EXIT_RE.is_match(address) && !roads.is_empty() {
        return true;
    }
    // Single route like "US-46".
    if roads.len() == 1 && !address.contains(' ') && !STREET_SUFFIX_RE.is_match(address) {
        return true;
    }
    // Pure road tokens / intersections without postal cues.
    if !roads.is_empty()
        && !STREET_SUFFIX_RE.is_match(address)
        && !NUMBER_THEN_WORD_RE.is_match(&strip_exit_mm_numbers(address))
    {
        return true;
    }
    false
}

/// The stricter postal check, applied only after highway detection fails.
fn is_postal_address(address: &str) -> bool {
    let a = strip_exit_mm_numbers(address);
    if looks_like_highway_reference(address) {
        return false;
    }
    // Postal cues: "123 Main" or "123 Main St".
    if NUMBER_THEN_WORD_RE.is_match(&a) {
        return true;
    }
    if STREET_SUFFIX_RE.is_match(&a) && STREET_NUMBER_RE.is_match(&a) {
        return true;
    }
    false
}

/// Classify a raw address. Deterministic, no I/O.
///
/// Highway detection runs before postal detection so that exit numbers
/// are never mistaken for street numbers.
pub fn classify(address: &str) -> Classified {
    // Mile markers are never geocodable as such.
    if MILE_MARKER_RE.is_match(address) {
        return Classified {
            kind: AddressKind::MileMarker,
            roads: extract_roads(address),
            reason: "mile_marker_detected",
        };
    }

    let roads = extract_roads(address);

    if looks_like_highway_reference(address) {
        match roads.len() {
            1 => {
                return Classified {
                    kind: AddressKind::SingleRoute,
                    roads,
                    reason: "highway_single_route",
                }
            }
            2 => {
                return Classified {
                    kind: AddressKind::HighwayIntersection2,
                    roads,
                    reason: "highway_two_roads",
                }
            }
            n if n >= 3 => {
                return Classified {
                    kind: AddressKind::HighwayIntersectionMulti,
                    roads,
                    reason: "highway_multi_roads",
                }
            }
            _ => {}
        }
    }

    if is_postal_address(address) {
        return Classified {
            kind: AddressKind::PostalAddress,
            roads,
            reason: "postal_cues_detected",
        };
    }

    Classified {
        kind: AddressKind::Unknown,
        roads,
        reason: "unable_to_classify",
    }
}

/// Preference score for a pair of roads. Lower is better: an Interstate
/// crossing a US or state route is the most likely to geocode cleanly.
fn rank_pair(a: &str, b: &str) -> u8 {
    let ta = a.split('-').next().unwrap_or("");
    let tb = b.split('-').next().unwrap_or("");
    let has = |t: &str| ta == t || tb == t;
    if has("I") && (has("US") || has("SR")) {
        0
    } else if ta == "I" && tb == "I" {
        1
    } else if has("US") && has("SR") {
        2
    } else if ta == "US" && tb == "US" {
        3
    } else if ta == "SR" && tb == "SR" {
        4
    } else {
        5
    }
}

/// The best `max_pairs` road pairs for a multi-road address, ordered by
/// `rank_pair` score. The sort is stable, so equally-ranked pairs keep
/// their first-seen order.
pub fn best_road_pairs(roads: &[String], max_pairs: usize) -> Vec<(String, String)> {
    let mut pairs: Vec<(String, String)> = Vec::new();
    for i in 0..roads.len() {
        for j in (i + 1)..roads.len() {
            pairs.push((roads[i].clone(), roads[j].clone()));
        }
    }
    pairs.sort_by_key(|(a, b)| rank_pair(a, b));
    pairs.truncate(max_pairs);
    pairs
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_two_road_intersection() {
        let c = classify("I-95 & US-1");
        assert_eq!(c.kind, AddressKind::HighwayIntersection2);
        assert_eq!(c.roads, vec!["I-95".to_owned(), "US-1".to_owned()]);
    }

    #[test]
    fn classifies_postal_address() {
        let c = classify("123 Main St, Miami, FL");
        assert_eq!(c.kind, AddressKind::PostalAddress);
    }

    #[test]
    fn classifies_mile_marker() {
        assert_eq!(classify("I-75 MM 120").kind, AddressKind::MileMarker);
        assert_eq!(
            classify("I-10 Mile Marker 7").kind,
            AddressKind::MileMarker
        );
    }

    #[test]
    fn classifies_single_route() {
        let c = classify("US-46");
        assert_eq!(c.kind, AddressKind::SingleRoute);
        assert_eq!(c.roads, vec!["US-46".to_owned()]);
    }

    #[test]
    fn classifies_multi_road_interchange() {
        let c = classify("I-80 & I-76 & SR-14");
        assert_eq!(c.kind, AddressKind::HighwayIntersectionMulti);
        assert_eq!(c.roads.len(), 3);
    }

    #[test]
    fn exit_numbers_are_not_street_numbers() {
        // "EXIT 15" must not trigger the "number then word" postal cue.
        let c = classify("I-75 EXIT 15");
        assert_eq!(c.kind, AddressKind::SingleRoute);
    }

    #[test]
    fn classification_is_stable_under_spacing() {
        let variants = [
            "I-95 & US-1",
            "I-95  &  US-1",
            " I-95 & US-1 ",
            "I-95 and US-1",
        ];
        for v in &variants {
            let (normalized, _, _) = normalize_address_components(v, "", "");
            assert_eq!(
                classify(&normalized).kind,
                AddressKind::HighwayIntersection2,
                "variant {:?}",
                v
            );
        }
    }

    #[test]
    fn classifies_unknown() {
        assert_eq!(classify("Flying J Travel Center").kind, AddressKind::Unknown);
        assert_eq!(classify("").kind, AddressKind::Unknown);
    }

    #[test]
    fn normalization_joins_exits_and_uppercases_state() {
        let (addr, city, state) =
            normalize_address_components("I-75,  EXIT 15", " Lake  City ", "fl");
        assert_eq!(addr, "I-75 EXIT 15");
        assert_eq!(city, "Lake City");
        assert_eq!(state, "FL");
    }

    #[test]
    fn normalization_standardizes_separators() {
        let (addr, _, _) = normalize_address_components("I-95 and US-1", "", "");
        assert_eq!(addr, "I-95 & US-1");
        let (addr, _, _) = normalize_address_components("123 Main St,Miami", "", "");
        assert_eq!(addr, "123 Main St, Miami");
    }

    #[test]
    fn removes_exit_tokens() {
        assert_eq!(remove_exit_and_noise("I-75 EXIT 15"), "I-75");
        assert_eq!(remove_exit_and_noise("EXIT 2, I-80"), "I-80");
    }

    #[test]
    fn extracts_roads_in_first_seen_order() {
        assert_eq!(
            extract_roads("US-1 & I-95 & us-1"),
            vec!["US-1".to_owned(), "I-95".to_owned()]
        );
    }

    #[test]
    fn ranks_interstate_pairs_first() {
        let roads = vec![
            "SR-7".to_owned(),
            "US-30".to_owned(),
            "I-76".to_owned(),
        ];
        let pairs = best_road_pairs(&roads, 2);
        // I+US and I+SR both rank 0; stable sort keeps first-seen order.
        assert_eq!(pairs[0], ("SR-7".to_owned(), "I-76".to_owned()));
        assert_eq!(pairs[1], ("US-30".to_owned(), "I-76".to_owned()));
    }

    #[test]
    fn classification_tags_render_stably() {
        assert_eq!(AddressKind::PostalAddress.to_string(), "POSTAL_ADDRESS");
        assert_eq!(
            AddressKind::HighwayIntersection2.to_string(),
            "HIGHWAY_INTERSECTION_2"
        );
        assert_eq!(AddressKind::MileMarker.to_string(), "MILE_MARKER");
    }
}
