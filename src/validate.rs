//! Input validation and synonym normalization.
//!
//! Policy and resolution strings accept a few natural spellings. Three-tier
//! resolution: exact match → synonym lookup → error with suggestion.

use std::collections::{HashMap, HashSet};
use std::sync::LazyLock;

use crate::error::{Error, Result};
use crate::sync::{CheckoutPolicy, ResolutionType};

// ── Valid value sets ─────────────────────────────────────────

pub static VALID_POLICIES: LazyLock<HashSet<&str>> = LazyLock::new(|| {
    ["abort", "commit_first", "carry", "reset_first"]
        .into_iter()
        .collect()
});

pub static VALID_RESOLUTIONS: LazyLock<HashSet<&str>> =
    LazyLock::new(|| ["keep_ours", "keep_theirs"].into_iter().collect());

// ── Synonym maps ─────────────────────────────────────────────

pub static POLICY_SYNONYMS: LazyLock<HashMap<&str, &str>> = LazyLock::new(|| {
    [
        ("fail", "abort"),
        ("refuse", "abort"),
        ("commit", "commit_first"),
        ("autocommit", "commit_first"),
        ("stash", "carry"),
        ("keep", "carry"),
        ("bring", "carry"),
        ("reset", "reset_first"),
        ("discard", "reset_first"),
        ("force", "reset_first"),
    ]
    .into_iter()
    .collect()
});

pub static RESOLUTION_SYNONYMS: LazyLock<HashMap<&str, &str>> = LazyLock::new(|| {
    [
        ("ours", "keep_ours"),
        ("mine", "keep_ours"),
        ("local", "keep_ours"),
        ("target", "keep_ours"),
        ("theirs", "keep_theirs"),
        ("incoming", "keep_theirs"),
        ("remote", "keep_theirs"),
        ("source", "keep_theirs"),
    ]
    .into_iter()
    .collect()
});

/// Lowercase and fold `-` and spaces to `_`.
fn canonical_form(input: &str) -> String {
    input.trim().to_lowercase().replace(['-', ' '], "_")
}

fn normalize(
    input: &str,
    valid: &HashSet<&str>,
    synonyms: &HashMap<&str, &str>,
) -> std::result::Result<String, (String, Option<String>)> {
    let lower = canonical_form(input);

    // Tier 1: exact match
    if valid.contains(lower.as_str()) {
        return Ok(lower);
    }

    // Tier 2: synonym lookup
    if let Some(&canonical) = synonyms.get(lower.as_str()) {
        return Ok(canonical.to_string());
    }

    // Tier 3: closest suggestion
    Err((input.to_string(), find_closest_match(&lower, valid, synonyms)))
}

fn invalid(kind: &str, input: &str, suggestion: Option<String>) -> Error {
    match suggestion {
        Some(s) => Error::Validation(format!("invalid {kind} '{input}' (did you mean '{s}'?)")),
        None => Error::Validation(format!("invalid {kind} '{input}'")),
    }
}

/// Parse a checkout policy, accepting synonyms.
///
/// # Errors
///
/// Returns [`Error::Validation`] naming the closest valid policy, if any.
pub fn parse_checkout_policy(input: &str) -> Result<CheckoutPolicy> {
    match normalize(input, &VALID_POLICIES, &POLICY_SYNONYMS) {
        Ok(value) => Ok(match value.as_str() {
            "commit_first" => CheckoutPolicy::CommitFirst,
            "carry" => CheckoutPolicy::Carry,
            "reset_first" => CheckoutPolicy::ResetFirst,
            _ => CheckoutPolicy::Abort,
        }),
        Err((input, suggestion)) => Err(invalid("checkout policy", &input, suggestion)),
    }
}

/// Parse a merge resolution strategy, accepting synonyms.
///
/// Only `keep_ours` and `keep_theirs` can be named; custom resolutions
/// carry values and come in as structured input.
///
/// # Errors
///
/// Returns [`Error::Validation`] naming the closest valid resolution, if any.
pub fn parse_resolution(input: &str) -> Result<ResolutionType> {
    match normalize(input, &VALID_RESOLUTIONS, &RESOLUTION_SYNONYMS) {
        Ok(value) if value == "keep_theirs" => Ok(ResolutionType::KeepTheirs),
        Ok(_) => Ok(ResolutionType::KeepOurs),
        Err((input, suggestion)) => Err(invalid("merge resolution", &input, suggestion)),
    }
}

/// Check a collection name.
///
/// # Errors
///
/// Returns [`Error::Validation`] for empty names, surrounding whitespace,
/// control characters or more than 255 bytes.
pub fn validate_collection_name(name: &str) -> Result<()> {
    validate_identifier("collection name", name)
}

/// Check a document id. Same rules as collection names.
///
/// # Errors
///
/// Returns [`Error::Validation`] when the id is unusable.
pub fn validate_doc_id(id: &str) -> Result<()> {
    validate_identifier("document id", id)
}

fn validate_identifier(kind: &str, value: &str) -> Result<()> {
    if value.is_empty() {
        return Err(Error::Validation(format!("{kind} must not be empty")));
    }
    if value.trim() != value {
        return Err(Error::Validation(format!(
            "{kind} '{value}' has leading or trailing whitespace"
        )));
    }
    if value.chars().any(char::is_control) {
        return Err(Error::Validation(format!("{kind} contains control characters")));
    }
    if value.len() > 255 {
        return Err(Error::Validation(format!("{kind} is longer than 255 bytes")));
    }
    Ok(())
}

/// Find the closest matching value across valid set and synonyms.
fn find_closest_match(
    input: &str,
    valid: &HashSet<&str>,
    synonyms: &HashMap<&str, &str>,
) -> Option<String> {
    let mut best: Option<(&str, usize)> = None;

    for &v in valid.iter().chain(synonyms.keys()) {
        let dist = levenshtein_distance(input, v);
        if dist <= 3 && best.is_none_or(|(_, d)| dist < d) {
            // For synonyms, show what it maps to
            let shown = synonyms.get(v).copied().unwrap_or(v);
            best = Some((shown, dist));
        }
    }

    best.map(|(v, _)| v.to_string())
}

// ── Levenshtein distance ─────────────────────────────────────

/// Compute the Levenshtein edit distance between two strings.
#[must_use]
pub fn levenshtein_distance(a: &str, b: &str) -> usize {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    let a_len = a.len();
    let b_len = b.len();

    if a_len == 0 {
        return b_len;
    }
    if b_len == 0 {
        return a_len;
    }

    // Use single-row optimization (O(min(m,n)) space)
    let mut prev: Vec<usize> = (0..=b_len).collect();
    let mut curr = vec![0; b_len + 1];

    for i in 1..=a_len {
        curr[0] = i;
        for j in 1..=b_len {
            let cost = usize::from(a[i - 1] != b[j - 1]);
            curr[j] = (prev[j] + 1) // deletion
                .min(curr[j - 1] + 1) // insertion
                .min(prev[j - 1] + cost); // substitution
        }
        std::mem::swap(&mut prev, &mut curr);
    }

    prev[b_len]
}
