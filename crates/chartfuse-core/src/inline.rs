//! Dataset URLs that name a caller-supplied table instead of a location.
//!
//! `table://NAME` and `vegafusion+dataset://NAME` are both accepted.

use std::collections::HashMap;
use std::sync::OnceLock;

use chartfuse_data::Table;
use regex::Regex;

fn inline_url() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^(?:table|vegafusion\+dataset)://(.+)$").ok())
        .as_ref()
}

/// The inline dataset name encoded in `url`, if it uses an inline scheme.
pub fn inline_dataset_name(url: &str) -> Option<&str> {
    inline_url()?.captures(url)?.get(1).map(|m| m.as_str())
}

pub fn is_inline_url(url: &str) -> bool {
    inline_dataset_name(url).is_some()
}

/// Content fingerprints of the supplied inline tables, keyed by name.
pub fn fingerprints(inline: &HashMap<String, Table>) -> HashMap<String, String> {
    inline
        .iter()
        .map(|(name, table)| (name.clone(), table.fingerprint()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn both_schemes_are_recognized() {
        assert_eq!(inline_dataset_name("table://order_items"), Some("order_items"));
        assert_eq!(
            inline_dataset_name("vegafusion+dataset://movies"),
            Some("movies")
        );
        assert_eq!(inline_dataset_name("data/cars.json"), None);
        assert_eq!(inline_dataset_name("table://"), None);
        assert!(!is_inline_url("https://example.com/table://x"));
    }
}
