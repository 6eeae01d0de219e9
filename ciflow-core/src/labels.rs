//! Classification of PR labels into CI trigger tags.
//!
//! A trigger label such as `ciflow/trunk` on PR 12345 maps to the tag
//! `ciflow/trunk/12345`, which lives at `refs/tags/ciflow/trunk/12345`.

use std::collections::BTreeSet;

/// Label namespaces that request CI workflows.
pub const TRIGGER_PREFIXES: &[&str] = &["ciflow/", "ci/"];

/// Returns true if `label` lives in one of the trigger namespaces.
///
/// Matching is an exact, case-sensitive prefix match.
pub fn is_trigger_label(label: &str) -> bool {
    TRIGGER_PREFIXES
        .iter()
        .any(|prefix| label.starts_with(prefix))
}

/// Tag name for `label` on PR `pr_number`, e.g. `ciflow/trunk/12345`.
pub fn tag_name(label: &str, pr_number: u64) -> String {
    format!("{}/{}", label, pr_number)
}

/// The full set of tags a PR with `labels` should have.
pub fn desired_tags<I, S>(labels: I, pr_number: u64) -> BTreeSet<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    labels
        .into_iter()
        .filter(|label| is_trigger_label(label.as_ref()))
        .map(|label| tag_name(label.as_ref(), pr_number))
        .collect()
}

/// Fully-qualified ref path of a tag: `refs/tags/<tag>`.
pub fn tag_ref_path(tag: &str) -> String {
    format!("refs/tags/{}", tag)
}

/// Short ref form accepted by the matching-refs and delete-ref endpoints: `tags/<tag>`.
pub fn tag_ref_query(tag: &str) -> String {
    format!("tags/{}", tag)
}
