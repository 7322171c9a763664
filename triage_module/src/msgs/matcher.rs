use std::collections::{BTreeMap, HashMap};

use regex::Regex;
use tracing::debug;

use crate::normalize::normalize;

use super::types::Label;

/// Apply a keyword map to message text, returning every label whose keyword
/// appears as a whole word. Matching is case- and diacritic-insensitive via
/// normalization; duplicate hits for one label collapse. Pure: neither the
/// message nor the registry is touched.
///
/// The result is ordered by label id only for determinism; callers must not
/// attach meaning to the order.
pub fn match_labels<'a>(text: &str, keyword_map: &'a HashMap<String, Label>) -> Vec<&'a Label> {
    let norm_text = normalize(text);
    let mut matches: BTreeMap<i64, &Label> = BTreeMap::new();

    for (keyword, label) in keyword_map {
        let pattern = format!(r"(?i)\b{}\b", regex::escape(keyword));
        let regex = match Regex::new(&pattern) {
            Ok(regex) => regex,
            Err(err) => {
                debug!("skipping unmatchable keyword {}: {}", keyword, err);
                continue;
            }
        };
        if regex.is_match(&norm_text) {
            matches.insert(label.id, label);
        }
    }

    matches.into_values().collect()
}
