//! Version ordering.
//!
//! Versions are opaque strings assigned by whoever signs the bundle. The
//! installer only needs an ordering over them, supplied through the
//! [`VersionComparator`] trait. Two implementations are provided:
//!
//! - [`StandardVersionComparator`]: tokenizing comparison that handles
//!   dotted numbers and pre-release suffixes (`1.0b1 < 1.0 < 1.0.1`)
//! - [`SemverComparator`]: semantic-version precedence, falling back to the
//!   standard comparison when a string is not valid semver
//!
//! Any `Fn(&str, &str) -> Ordering` closure is also a comparator.

use std::cmp::Ordering;

/// Ordering over version strings.
pub trait VersionComparator: Send + Sync {
    /// Compare two version strings. `Greater` means `a` is newer than `b`.
    fn compare_versions(&self, a: &str, b: &str) -> Ordering;
}

impl<F> VersionComparator for F
where
    F: Fn(&str, &str) -> Ordering + Send + Sync,
{
    fn compare_versions(&self, a: &str, b: &str) -> Ordering {
        self(a, b)
    }
}

/// Default comparator.
///
/// Each version is split into runs of digits, runs of other non-separator
/// characters, and single separator characters (`.`, `-`, `_`, `+`,
/// whitespace and other punctuation). Runs are compared pairwise:
///
/// - two numbers compare numerically (arbitrary length, leading zeros ignored)
/// - two strings compare lexicographically
/// - a number beats a string or a separator
/// - a separator beats a string, since the string starts a pre-release
///
/// When one version runs out of parts, the next non-separator part of the
/// longer one decides: a string means a pre-release, so the shorter version
/// is newer; anything else makes the longer version newer.
#[derive(Debug, Clone, Copy, Default)]
pub struct StandardVersionComparator;

impl StandardVersionComparator {
    /// Create the default comparator.
    pub fn new() -> Self {
        Self
    }
}

impl VersionComparator for StandardVersionComparator {
    fn compare_versions(&self, a: &str, b: &str) -> Ordering {
        compare_standard(a, b)
    }
}

/// Semantic-version comparator.
///
/// Both strings are parsed as semver (an optional leading `v` is accepted).
/// If either fails to parse, the [`StandardVersionComparator`] ordering is
/// used instead.
#[derive(Debug, Clone, Copy, Default)]
pub struct SemverComparator;

impl SemverComparator {
    /// Create a semver comparator.
    pub fn new() -> Self {
        Self
    }
}

impl VersionComparator for SemverComparator {
    fn compare_versions(&self, a: &str, b: &str) -> Ordering {
        match (parse_semver(a), parse_semver(b)) {
            (Some(a), Some(b)) => a.cmp(&b),
            _ => compare_standard(a, b),
        }
    }
}

fn parse_semver(s: &str) -> Option<semver::Version> {
    let s = s.trim();
    let s = s.strip_prefix('v').unwrap_or(s);
    semver::Version::parse(s).ok()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PartKind {
    Number,
    String,
    Separator,
}

fn kind_of(c: char) -> PartKind {
    if c.is_ascii_digit() {
        PartKind::Number
    } else if c.is_whitespace() || c.is_ascii_punctuation() {
        PartKind::Separator
    } else {
        PartKind::String
    }
}

fn split_parts(version: &str) -> Vec<(PartKind, &str)> {
    let mut parts = Vec::new();
    let mut start = 0;
    let mut current: Option<PartKind> = None;

    for (idx, c) in version.char_indices() {
        let kind = kind_of(c);
        match current {
            Some(prev) if prev == kind && kind != PartKind::Separator => {}
            Some(prev) => {
                parts.push((prev, &version[start..idx]));
                start = idx;
                current = Some(kind);
            }
            None => {
                start = idx;
                current = Some(kind);
            }
        }
    }
    if let Some(kind) = current {
        parts.push((kind, &version[start..]));
    }
    parts
}

fn compare_numbers(a: &str, b: &str) -> Ordering {
    let a = a.trim_start_matches('0');
    let b = b.trim_start_matches('0');
    a.len().cmp(&b.len()).then_with(|| a.cmp(b))
}

fn compare_standard(a: &str, b: &str) -> Ordering {
    let parts_a = split_parts(a.trim());
    let parts_b = split_parts(b.trim());

    for (&(kind_a, text_a), &(kind_b, text_b)) in parts_a.iter().zip(parts_b.iter()) {
        let ord = match (kind_a, kind_b) {
            (PartKind::Number, PartKind::Number) => compare_numbers(text_a, text_b),
            (PartKind::String, PartKind::String) => text_a.cmp(text_b),
            (PartKind::Separator, PartKind::Separator) => Ordering::Equal,
            (PartKind::Number, _) => Ordering::Greater,
            (_, PartKind::Number) => Ordering::Less,
            // A string where the other side continues with a separator is a
            // pre-release of that version.
            (PartKind::String, PartKind::Separator) => Ordering::Less,
            (PartKind::Separator, PartKind::String) => Ordering::Greater,
        };
        if ord != Ordering::Equal {
            return ord;
        }
    }

    let shared = parts_a.len().min(parts_b.len());
    let (longer, longer_wins) = match parts_a.len().cmp(&parts_b.len()) {
        Ordering::Equal => return Ordering::Equal,
        Ordering::Greater => (&parts_a, Ordering::Greater),
        Ordering::Less => (&parts_b, Ordering::Less),
    };

    let next = longer[shared..]
        .iter()
        .find(|(kind, _)| *kind != PartKind::Separator);
    match next {
        Some((PartKind::String, _)) => longer_wins.reverse(),
        Some(_) => longer_wins,
        // Only trailing separators: "1.0." is the same release as "1.0".
        None => Ordering::Equal,
    }
}
