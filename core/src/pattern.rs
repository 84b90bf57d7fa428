//! Event-type pattern matching
//!
//! Subscription patterns are literal event types with an optional `*`
//! wildcard: `*` alone matches everything, `issue.*` matches any segment
//! suffix, and a bare literal matches exactly. Matching is case-insensitive.

/// True when `event_type` matches `pattern`.
pub fn matches_pattern(pattern: &str, event_type: &str) -> bool {
    let pattern = pattern.trim();
    if pattern.is_empty() {
        return false;
    }
    if pattern == "*" {
        return true;
    }

    if let Some(star) = pattern.find('*') {
        let (prefix, rest) = pattern.split_at(star);
        // Only a single trailing-style wildcard is supported; anything after
        // the star must match the end of the event type.
        let suffix = &rest[1..];
        let et = event_type.to_ascii_lowercase();
        let prefix = prefix.to_ascii_lowercase();
        let suffix = suffix.to_ascii_lowercase();
        et.starts_with(&prefix) && et.ends_with(&suffix) && et.len() >= prefix.len() + suffix.len()
    } else {
        pattern.eq_ignore_ascii_case(event_type)
    }
}

/// True when `event_type` matches any of `patterns`.
pub fn matches_any(patterns: &[String], event_type: &str) -> bool {
    patterns.iter().any(|p| matches_pattern(p, event_type))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn literal_match_is_case_insensitive() {
        assert!(matches_pattern("issue.created", "issue.created"));
        assert!(matches_pattern("Issue.Created", "issue.created"));
        assert!(!matches_pattern("issue.created", "issue.deleted"));
    }

    #[test]
    fn star_matches_everything() {
        assert!(matches_pattern("*", "issue.created"));
        assert!(matches_pattern("*", "project.archived"));
    }

    #[test]
    fn segment_wildcard() {
        assert!(matches_pattern("issue.*", "issue.created"));
        assert!(matches_pattern("issue.*", "issue.status_changed"));
        assert!(!matches_pattern("issue.*", "project.created"));
    }

    #[test]
    fn infix_wildcard() {
        assert!(matches_pattern("issue.*ed", "issue.created"));
        assert!(!matches_pattern("issue.*ed", "issue.assigned.note"));
        assert!(matches_pattern("issue.*ed", "issue.assigned"));
    }

    #[test]
    fn empty_pattern_matches_nothing() {
        assert!(!matches_pattern("", "issue.created"));
        assert!(!matches_pattern("   ", "issue.created"));
    }

    #[test]
    fn any_of_list() {
        let patterns = vec!["project.*".to_string(), "issue.deleted".to_string()];
        assert!(matches_any(&patterns, "project.updated"));
        assert!(matches_any(&patterns, "issue.deleted"));
        assert!(!matches_any(&patterns, "issue.created"));
    }
}
