//! Reference-graph engine.
//!
//! Documents mention each other — PR shorthand, pull-request URLs, wiki-style
//! page links, explicit `ref:` markers. This module extracts those mentions
//! into per-document `referenced_docs` maps, diffs them across re-indexes,
//! and produces the [`ReferrerUpdate`] commands that keep the inverse
//! `referrers` maps on *other* documents consistent. It also derives the
//! scalar authority score the search layer ranks by.
//!
//! Storing `referrers` denormalized on each document (rather than joining at
//! query time) lets the search engines filter and sort on `referrer_score`
//! directly; the diff-based update keeps that denormalization correct
//! incrementally instead of recomputing the graph on every write.

use std::collections::BTreeSet;

use anyhow::Result;
use once_cell::sync::Lazy;
use regex::Regex;

use crate::models::{RefCountMap, ReferrerUpdate};
use crate::store::DocumentStore;

/// `[[page-slug]]` wiki-style page mention, any source.
static WIKI_LINK: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\[\[([A-Za-z0-9][A-Za-z0-9_.:-]*)\]\]").unwrap());

/// Explicit `ref:<id>` marker, any source. Trailing punctuation is not
/// part of the ID, so the class stops at word characters and dashes.
static REF_MARKER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\bref:([A-Za-z0-9][A-Za-z0-9_-]*)").unwrap());

/// `#123` shorthand. Only meaningful for GitHub content; a bare `#123` in a
/// Slack message is as likely a channel or color as a pull request.
static PR_SHORTHAND: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?:^|[\s(])#(\d+)\b").unwrap());

/// Full pull-request / issue URL, unambiguous in any source.
static PR_URL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"github\.com/[\w.-]+/[\w.-]+/(?:pull|issues)/(\d+)").unwrap());

/// Scan content for cross-document references and tally occurrence counts
/// per distinct target reference ID. Self-references are excluded.
pub fn find_references(content: &str, source: &str, own_reference_id: &str) -> RefCountMap {
    let mut refs = RefCountMap::new();

    for caps in WIKI_LINK.captures_iter(content) {
        *refs.entry(caps[1].to_string()).or_insert(0) += 1;
    }
    for caps in REF_MARKER.captures_iter(content) {
        *refs.entry(caps[1].to_string()).or_insert(0) += 1;
    }
    for caps in PR_URL.captures_iter(content) {
        *refs.entry(format!("pr_{}", &caps[1])).or_insert(0) += 1;
    }
    if source == "github" {
        for caps in PR_SHORTHAND.captures_iter(content) {
            *refs.entry(format!("pr_{}", &caps[1])).or_insert(0) += 1;
        }
    }

    refs.remove(own_reference_id);
    refs
}

/// Diff between two outbound-reference maps.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReferencedDocsDiff {
    /// Keys present in `new` whose count differs from (or is absent in) `old`.
    pub added_or_changed: RefCountMap,
    /// Keys present in `old` but absent from `new`.
    pub removed: Vec<String>,
}

impl ReferencedDocsDiff {
    pub fn is_empty(&self) -> bool {
        self.added_or_changed.is_empty() && self.removed.is_empty()
    }
}

/// Compute which outbound references were added, changed, or removed between
/// two indexing passes. Keys with identical counts in both maps appear in
/// neither output.
pub fn compute_referenced_docs_diff(old: &RefCountMap, new: &RefCountMap) -> ReferencedDocsDiff {
    let mut diff = ReferencedDocsDiff::default();

    for (key, count) in new {
        if old.get(key) != Some(count) {
            diff.added_or_changed.insert(key.clone(), *count);
        }
    }
    for key in old.keys() {
        if !new.contains_key(key) {
            diff.removed.push(key.clone());
        }
    }

    diff
}

/// Compute the referrer updates a content change to one document imposes on
/// the documents it references.
///
/// Fetches every affected target's current `referrers` and `document_id` in
/// one batched query. Targets not present in storage are silently skipped:
/// they have not been indexed yet, and the link stays one-sided until they
/// are.
pub async fn prepare_referrer_updates(
    store: &dyn DocumentStore,
    own_reference_id: &str,
    old_referenced_docs: &RefCountMap,
    new_referenced_docs: &RefCountMap,
) -> Result<Vec<ReferrerUpdate>> {
    let diff = compute_referenced_docs_diff(old_referenced_docs, new_referenced_docs);
    if diff.is_empty() {
        return Ok(Vec::new());
    }

    let affected: BTreeSet<String> = diff
        .added_or_changed
        .keys()
        .chain(diff.removed.iter())
        .cloned()
        .collect();
    let affected: Vec<String> = affected.into_iter().collect();

    let targets = store.referrer_targets(&affected).await?;

    let mut updates = Vec::with_capacity(targets.len());
    for target in targets {
        let mut referrers = target.referrers;
        if let Some(count) = diff.added_or_changed.get(&target.reference_id) {
            referrers.insert(own_reference_id.to_string(), *count);
        } else {
            referrers.remove(own_reference_id);
        }
        updates.push(ReferrerUpdate::new(
            target.reference_id,
            target.document_id,
            referrers,
        ));
    }

    Ok(updates)
}

/// Referrer updates for deleting a document: remove its reference ID from
/// every document it pointed to.
pub async fn prepare_referrer_updates_for_deletion(
    store: &dyn DocumentStore,
    own_reference_id: &str,
    referenced_docs: &RefCountMap,
) -> Result<Vec<ReferrerUpdate>> {
    if referenced_docs.is_empty() {
        return Ok(Vec::new());
    }

    let affected: Vec<String> = referenced_docs.keys().cloned().collect();
    let targets = store.referrer_targets(&affected).await?;

    let mut updates = Vec::with_capacity(targets.len());
    for target in targets {
        let mut referrers = target.referrers;
        if referrers.remove(own_reference_id).is_none() {
            continue;
        }
        updates.push(ReferrerUpdate::new(
            target.reference_id,
            target.document_id,
            referrers,
        ));
    }

    Ok(updates)
}

/// Reverse lookup: every document whose `referenced_docs` contains the given
/// reference ID, as `{that document's reference_id: its recorded count}`.
///
/// Backed by an inverted-index containment query in the relational store
/// (GIN on the `referenced_docs` keys), since this runs once per indexed
/// document.
pub async fn calculate_referrers(
    store: &dyn DocumentStore,
    reference_id: &str,
) -> Result<RefCountMap> {
    store.find_referrers(reference_id).await
}

/// Scalar authority score from a referrers map.
///
/// `sum(log10(count + 9))` over positive counts: a single reference
/// contributes exactly `log10(10) = 1.0`, and heavily-referenced documents
/// grow with diminishing returns. Zero or negative counts contribute 0.
pub fn calculate_referrer_score(referrers: &RefCountMap) -> f64 {
    referrers
        .values()
        .filter(|&&count| count > 0)
        .map(|&count| (count as f64 + 9.0).log10())
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn refs(pairs: &[(&str, i64)]) -> RefCountMap {
        pairs.iter().map(|(k, v)| (k.to_string(), *v)).collect()
    }

    #[test]
    fn test_find_references_counts_occurrences() {
        let found = find_references(
            "See [[runbook]] and [[runbook]] again, plus ref:incident-42.",
            "notion",
            "page_1",
        );
        assert_eq!(found, refs(&[("runbook", 2), ("incident-42", 1)]));
    }

    #[test]
    fn test_find_references_github_shorthand() {
        let found = find_references("Fixed in #42, see also #42 and #7.", "github", "pr_99");
        assert_eq!(found, refs(&[("pr_42", 2), ("pr_7", 1)]));
    }

    #[test]
    fn test_find_references_shorthand_ignored_outside_github() {
        let found = find_references("posting in #42 today", "slack", "msg_1");
        assert!(found.is_empty());
    }

    #[test]
    fn test_find_references_pull_url_any_source() {
        let found = find_references(
            "https://github.com/acme/api/pull/17 landed",
            "slack",
            "msg_1",
        );
        assert_eq!(found, refs(&[("pr_17", 1)]));
    }

    #[test]
    fn test_find_references_excludes_self() {
        let found = find_references("see [[page_1]] and [[page_2]]", "notion", "page_1");
        assert_eq!(found, refs(&[("page_2", 1)]));
    }

    #[test]
    fn test_diff_added_changed_removed() {
        let old = refs(&[("a", 1), ("b", 2), ("c", 3)]);
        let new = refs(&[("a", 1), ("b", 5), ("d", 1)]);
        let diff = compute_referenced_docs_diff(&old, &new);
        assert_eq!(diff.added_or_changed, refs(&[("b", 5), ("d", 1)]));
        assert_eq!(diff.removed, vec!["c".to_string()]);
    }

    #[test]
    fn test_diff_no_key_in_both_outputs() {
        let old = refs(&[("a", 1), ("b", 2)]);
        let new = refs(&[("b", 3), ("c", 1)]);
        let diff = compute_referenced_docs_diff(&old, &new);
        for key in diff.added_or_changed.keys() {
            assert!(!diff.removed.contains(key));
        }
    }

    #[test]
    fn test_diff_identical_maps_empty() {
        let m = refs(&[("a", 1), ("b", 2)]);
        assert!(compute_referenced_docs_diff(&m, &m).is_empty());
    }

    #[test]
    fn test_diff_swap_symmetry() {
        let old = refs(&[("a", 1)]);
        let new = refs(&[("b", 2)]);
        let forward = compute_referenced_docs_diff(&old, &new);
        let backward = compute_referenced_docs_diff(&new, &old);
        assert_eq!(forward.removed, vec!["a".to_string()]);
        assert!(backward.added_or_changed.contains_key("a"));
        assert_eq!(backward.removed, vec!["b".to_string()]);
        assert!(forward.added_or_changed.contains_key("b"));
    }

    #[test]
    fn test_score_empty_is_zero() {
        assert_eq!(calculate_referrer_score(&RefCountMap::new()), 0.0);
    }

    #[test]
    fn test_score_single_reference_is_one() {
        let score = calculate_referrer_score(&refs(&[("a", 1)]));
        assert!((score - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_score_ignores_non_positive_counts() {
        let score = calculate_referrer_score(&refs(&[("a", 0), ("b", -3), ("c", 1)]));
        assert!((score - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_score_monotonic_in_count() {
        let low = calculate_referrer_score(&refs(&[("a", 2)]));
        let high = calculate_referrer_score(&refs(&[("a", 3)]));
        assert!(high > low);
        // and grows slowly
        assert!(high - low < 1.0);
    }

    #[test]
    fn test_score_monotonic_in_referrer_set() {
        let base = calculate_referrer_score(&refs(&[("a", 1)]));
        let more = calculate_referrer_score(&refs(&[("a", 1), ("b", 1)]));
        assert!(more > base);
    }
}
