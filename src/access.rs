//! Number normalization and flat allow/deny lists.
//!
//! Grounded on `numhash.h`: a black/white-list lookup is membership in a
//! flat set of exact numbers, not a prefix match (prefix matching is the
//! separate allowed/denied/preferred-prefix mechanism of §3.2/§4.5).

use std::collections::HashSet;

/// A flat, exact-match set of numbers (§3's white/black lists).
#[derive(Clone, Debug, Default)]
pub struct NumberSet {
    numbers: HashSet<String>,
}

impl NumberSet {
    pub fn new() -> Self {
        NumberSet { numbers: HashSet::new() }
    }

    pub fn from_numbers<I: IntoIterator<Item = String>>(numbers: I) -> Self {
        NumberSet { numbers: numbers.into_iter().collect() }
    }

    pub fn contains(&self, number: &str) -> bool {
        self.numbers.contains(number)
    }

    pub fn is_empty(&self) -> bool {
        self.numbers.is_empty()
    }
}

/// One `<from>;<to>` rewriting rule from a unified-prefix table.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PrefixRule {
    pub from: String,
    pub to: String,
}

/// A table of rewriting rules applied to sender/receiver numbers for
/// normalization (§3.1 invariants, §9 glossary "Unified prefix").
#[derive(Clone, Debug, Default)]
pub struct UnifiedPrefix {
    rules: Vec<PrefixRule>,
}

impl UnifiedPrefix {
    pub fn new(rules: Vec<PrefixRule>) -> Self {
        UnifiedPrefix { rules }
    }

    pub fn empty() -> Self {
        UnifiedPrefix { rules: Vec::new() }
    }

    /// Parses the conventional `"+358;00358,0;+358"`-style config string:
    /// comma-separated rules, each a `from:to` pair separated by `;`.
    pub fn parse(spec: &str) -> Self {
        let rules = spec
            .split(',')
            .filter_map(|rule| rule.split_once(';'))
            .map(|(from, to)| PrefixRule { from: from.trim().to_string(), to: to.trim().to_string() })
            .collect();
        UnifiedPrefix { rules }
    }

    /// Applies the first matching rule, longest `from` prefix wins.
    pub fn apply(&self, number: &str) -> String {
        let mut best: Option<&PrefixRule> = None;
        for rule in &self.rules {
            if number.starts_with(rule.from.as_str())
                && best.map(|b| rule.from.len() > b.from.len()).unwrap_or(true)
            {
                best = Some(rule);
            }
        }
        match best {
            Some(rule) => format!("{}{}", rule.to, &number[rule.from.len()..]),
            None => number.to_string(),
        }
    }
}

/// Literal longest-prefix match against a semicolon-separated pattern list
/// (§4.5 "Prefix matching is literal longest-prefix on the receiver's
/// canonicalized number").
pub fn matches_prefix_list(number: &str, patterns: &str) -> bool {
    patterns.split(';').map(str::trim).filter(|p| !p.is_empty()).any(|p| number.starts_with(p))
}

/// `;`-separated id pattern list membership (exact match — ids are not
/// hierarchical like prefixes).
pub fn matches_id_list(id: &str, patterns: &str) -> bool {
    patterns.split(';').map(str::trim).any(|p| p == id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn number_set_exact_match_only() {
        let set = NumberSet::from_numbers(vec!["+491761234".to_string()]);
        assert!(set.contains("+491761234"));
        assert!(!set.contains("+4917612340"));
        assert!(!set.contains("+49176"));
    }

    #[test]
    fn unified_prefix_rewrites_longest_match() {
        let table = UnifiedPrefix::parse("00358;+358,0;+358");
        assert_eq!(table.apply("00358401234"), "+358401234");
        assert_eq!(table.apply("0401234"), "+358401234");
        assert_eq!(table.apply("+49123"), "+49123");
    }

    #[test]
    fn prefix_list_matching_is_literal() {
        assert!(matches_prefix_list("+491761234", "+4915;+49176"));
        assert!(!matches_prefix_list("+491781234", "+4915;+49176"));
    }

    #[test]
    fn id_list_matching_is_exact() {
        assert!(matches_id_list("smsc1", "smsc1;smsc2"));
        assert!(!matches_id_list("smsc11", "smsc1;smsc2"));
    }
}
