//! Hierarchical capability scopes.
//!
//! Scopes are dot-separated paths (`session`, `session.create`,
//! `agent.spawn`). A granted scope implies every descendant: holding
//! `session` satisfies a method requiring `session.create`. The wildcard
//! `*` implies everything. Checks are pure set logic over string slices.

use std::collections::BTreeSet;

/// The scope that implies all others.
pub const WILDCARD: &str = "*";

/// Does `granted` satisfy `needed`?
///
/// True when they are equal, when `granted` is the wildcard, or when
/// `granted` is a segment-wise ancestor of `needed` (`session` implies
/// `session.create` but not `sessions`).
pub fn scope_implies(granted: &str, needed: &str) -> bool {
    if granted == WILDCARD || granted == needed {
        return true;
    }
    needed
        .strip_prefix(granted)
        .is_some_and(|rest| rest.starts_with('.'))
}

/// Does the granted set cover every needed scope?
pub fn has_required_scopes<G, N>(granted: &[G], needed: &[N]) -> bool
where
    G: AsRef<str>,
    N: AsRef<str>,
{
    needed.iter().all(|need| {
        granted
            .iter()
            .any(|grant| scope_implies(grant.as_ref(), need.as_ref()))
    })
}

/// Flatten granted scopes to the known scopes they imply.
///
/// `known` is the universe of scopes registered methods require; the result
/// contains the granted scopes themselves plus every known descendant.
pub fn expand_scopes<'a, G>(
    granted: &[G],
    known: impl IntoIterator<Item = &'a str>,
) -> BTreeSet<String>
where
    G: AsRef<str>,
{
    let mut expanded: BTreeSet<String> = granted
        .iter()
        .map(|scope| scope.as_ref().to_string())
        .collect();

    for candidate in known {
        if granted
            .iter()
            .any(|grant| scope_implies(grant.as_ref(), candidate))
        {
            expanded.insert(candidate.to_string());
        }
    }

    expanded
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_match() {
        assert!(scope_implies("session.create", "session.create"));
        assert!(!scope_implies("session.create", "session.stop"));
    }

    #[test]
    fn parent_implies_descendants() {
        assert!(scope_implies("session", "session.create"));
        assert!(scope_implies("agent", "agent.spawn"));
        assert!(!scope_implies("session.create", "session"));
    }

    #[test]
    fn prefix_is_segment_wise() {
        // "session" must not leak into "sessions.list"
        assert!(!scope_implies("session", "sessions.list"));
    }

    #[test]
    fn wildcard_implies_everything() {
        assert!(scope_implies("*", "config.set"));
        assert!(has_required_scopes(&["*"], &["memory.delete", "agent.stop"]));
    }

    #[test]
    fn required_scope_check() {
        let granted = vec!["session".to_string(), "health.ping".to_string()];
        assert!(has_required_scopes(&granted, &["session.create"]));
        assert!(has_required_scopes(&granted, &["health.ping"]));
        assert!(!has_required_scopes(&granted, &["memory.query"]));
        assert!(!has_required_scopes(
            &granted,
            &["session.create", "memory.query"]
        ));
    }

    #[test]
    fn empty_needed_always_passes() {
        assert!(has_required_scopes::<String, String>(&[], &[]));
    }

    #[test]
    fn expansion_flattens_to_known_descendants() {
        let known = [
            "session.create",
            "session.stop",
            "memory.query",
            "health.ping",
        ];
        let expanded = expand_scopes(&["session".to_string()], known);
        assert!(expanded.contains("session"));
        assert!(expanded.contains("session.create"));
        assert!(expanded.contains("session.stop"));
        assert!(!expanded.contains("memory.query"));
    }
}
