//! Rule → Gmail search query synthesis
//!
//! Pattern values are wrapped in double quotes without escaping; a pattern
//! containing `"` produces a query the search grammar will read differently.

use crate::rules::Rule;

/// Build the effective search query for a rule
///
/// An explicit `query` wins over every pattern field. Otherwise the sender,
/// subject, and subject-contains clauses are ANDed with single spaces. Returns
/// an empty string when the rule has no criteria; callers must treat that as
/// an error, never as "match everything".
pub fn effective_query(rule: &Rule) -> String {
    if let Some(query) = non_blank(rule.query.as_deref()) {
        return query.to_owned();
    }

    let mut clauses = Vec::new();
    if let Some(sender) = non_blank(rule.sender_pattern.as_deref()) {
        clauses.push(format!("from:{sender}"));
    }
    if let Some(subject) = non_blank(rule.subject_pattern.as_deref()) {
        clauses.push(format!("subject:\"{subject}\""));
    }
    if let Some(terms) = &rule.subject_contains {
        let terms: Vec<String> = terms
            .iter()
            .filter(|t| !t.trim().is_empty())
            .map(|t| format!("subject:\"{t}\""))
            .collect();
        if !terms.is_empty() {
            clauses.push(format!("({})", terms.join(" OR ")));
        }
    }
    clauses.join(" ")
}

/// Whether the rule resolves to a non-empty query
pub fn has_criteria(rule: &Rule) -> bool {
    !effective_query(rule).is_empty()
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.filter(|v| !v.trim().is_empty())
}

#[cfg(test)]
mod tests {
    use super::{effective_query, has_criteria};
    use crate::rules::Rule;

    fn rule() -> Rule {
        Rule::new("Receipts")
    }

    #[test]
    fn sender_only_rule_is_a_bare_from_clause() {
        for pattern in ["billing@shop.example", "*@newsletter.io", "alerts"] {
            let mut r = rule();
            r.sender_pattern = Some(pattern.to_owned());
            assert_eq!(effective_query(&r), format!("from:{pattern}"));
        }
    }

    #[test]
    fn subject_contains_becomes_one_or_group() {
        let mut r = rule();
        r.subject_contains = Some(vec!["invoice".to_owned(), "receipt".to_owned()]);
        assert_eq!(
            effective_query(&r),
            "(subject:\"invoice\" OR subject:\"receipt\")"
        );
    }

    #[test]
    fn clauses_are_joined_with_single_spaces() {
        let mut r = rule();
        r.sender_pattern = Some("shop.example".to_owned());
        r.subject_pattern = Some("Order shipped".to_owned());
        r.subject_contains = Some(vec!["UPS".to_owned()]);
        assert_eq!(
            effective_query(&r),
            "from:shop.example subject:\"Order shipped\" (subject:\"UPS\")"
        );
    }

    #[test]
    fn explicit_query_bypasses_patterns() {
        let mut r = rule();
        r.query = Some("label:inbox older_than:30d".to_owned());
        r.sender_pattern = Some("ignored@example.com".to_owned());
        assert_eq!(effective_query(&r), "label:inbox older_than:30d");
    }

    #[test]
    fn rule_without_criteria_yields_empty_query() {
        let mut r = rule();
        r.subject_contains = Some(Vec::new());
        r.query = Some("   ".to_owned());
        assert_eq!(effective_query(&r), "");
        assert!(!has_criteria(&r));
    }

    #[test]
    fn embedded_quotes_are_passed_through() {
        let mut r = rule();
        r.subject_pattern = Some("say \"hi\"".to_owned());
        assert_eq!(effective_query(&r), "subject:\"say \"hi\"\"");
    }
}
