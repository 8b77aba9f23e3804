//! Utility helpers shared across the service: cached keyword matchers and
//! small text formatting routines used by prompt construction and the
//! fallback heuristic.

use ahash::AHasher;
use aho_corasick::{AhoCorasick, AhoCorasickBuilder};
use dashmap::DashMap;
use once_cell::sync::Lazy;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

/// A memoising wrapper around `AhoCorasick::new` to avoid recompiling
/// automata for repeated keyword lists. The cache key is a hash of the
/// pattern list; baseline facts are constant per process, so the cache
/// usually holds a single entry.
static AC_CACHE: Lazy<DashMap<u64, Arc<AhoCorasick>>> = Lazy::new(DashMap::new);

/// Fact keys can vary per request, so the cache is capped; lists past the
/// cap are compiled per call instead of cached.
const AC_CACHE_MAX: usize = 256;

/// Given a list of literal patterns, return a shared case-insensitive
/// `AhoCorasick` matcher. Pattern indices in match results correspond to
/// positions in `list`.
pub fn ac_for(list: &[String]) -> Arc<AhoCorasick> {
    let mut hasher = AHasher::default();
    for pat in list {
        pat.hash(&mut hasher);
    }
    let key = hasher.finish();
    if let Some(existing) = AC_CACHE.get(&key) {
        return existing.clone();
    }
    let mut lower = Vec::with_capacity(list.len());
    for p in list {
        lower.push(p.to_lowercase());
    }
    let ac = AhoCorasickBuilder::new()
        .ascii_case_insensitive(true)
        .build(lower)
        .unwrap();
    let arc = Arc::new(ac);
    if AC_CACHE.len() < AC_CACHE_MAX {
        AC_CACHE.insert(key, arc.clone());
    }
    arc
}

/// Turn a fact key like `class_year` into a display label like `Class Year`.
pub fn title_case_key(key: &str) -> String {
    key.split('_')
        .filter(|w| !w.is_empty())
        .map(|w| {
            let mut chars = w.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matcher_is_case_insensitive_and_cached() {
        let patterns = vec!["email".to_string(), "class year".to_string()];
        let ac = ac_for(&patterns);
        let found = ac.find(&"Your CLASS YEAR please".to_lowercase());
        assert_eq!(found.map(|m| m.pattern().as_usize()), Some(1));
        // Second call returns the cached automaton.
        let again = ac_for(&patterns);
        assert!(Arc::ptr_eq(&ac, &again));
    }

    #[test]
    fn title_cases_underscored_keys() {
        assert_eq!(title_case_key("full_name"), "Full Name");
        assert_eq!(title_case_key("email"), "Email");
        assert_eq!(title_case_key("residence__number"), "Residence Number");
    }
}
