use std::ops::Range;

use fuzzy_matcher::FuzzyMatcher;
use fuzzy_matcher::skim::SkimMatcherV2;
use serde::{Deserialize, Serialize};

use crate::{Entity, ResultItem};

/// Scores assigned to each match tier. Within a tier every match scores
/// the same, so ties fall back to listing order.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MatchWeights {
    #[serde(default = "default_prefix")]
    pub prefix: f64,
    #[serde(default = "default_substring")]
    pub substring: f64,
    /// Enables subsequence matching for names that do not contain the
    /// query. Unset means substring-only.
    #[serde(default)]
    pub fuzzy: Option<f64>,
}

impl Default for MatchWeights {
    fn default() -> Self {
        Self {
            prefix: default_prefix(),
            substring: default_substring(),
            fuzzy: None,
        }
    }
}

fn default_prefix() -> f64 {
    2.0
}

fn default_substring() -> f64 {
    1.0
}

impl MatchWeights {
    pub fn validate(&self) -> Result<(), &'static str> {
        let finite = self.prefix.is_finite()
            && self.substring.is_finite()
            && self.fuzzy.is_none_or(f64::is_finite);
        if !finite {
            return Err("weights must be finite");
        }
        if self.prefix < self.substring {
            return Err("prefix weight must not be below substring weight");
        }
        if self.fuzzy.is_some_and(|fuzzy| fuzzy > self.substring) {
            return Err("fuzzy weight must not exceed substring weight");
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default)]
pub struct Matcher {
    weights: MatchWeights,
}

impl Matcher {
    pub fn new(weights: MatchWeights) -> Self {
        Self { weights }
    }

    pub fn weights(&self) -> &MatchWeights {
        &self.weights
    }

    /// Filters and orders `entities` against `text`.
    ///
    /// Case-insensitive substring match on the display name; prefix matches
    /// rank first. Only the empty string matches everything; whitespace is
    /// part of the query. The sort is stable, so equal scores keep listing
    /// order and repeated calls give identical output.
    pub fn rank(&self, entities: &[Entity], text: &str) -> Vec<ResultItem> {
        let needle: Vec<char> = text.chars().flat_map(char::to_lowercase).collect();

        if needle.is_empty() {
            return entities
                .iter()
                .map(|entity| ResultItem {
                    entity: entity.clone(),
                    score: self.weights.prefix,
                    highlights: Vec::new(),
                })
                .collect();
        }

        let fuzzy = self.weights.fuzzy.map(|w| (w, SkimMatcherV2::default().ignore_case()));

        let mut items: Vec<ResultItem> = entities
            .iter()
            .filter_map(|entity| {
                if let Some((start, span)) = find_folded(&entity.display_name, &needle) {
                    let score = if start == 0 {
                        self.weights.prefix
                    } else {
                        self.weights.substring
                    };
                    return Some(ResultItem {
                        entity: entity.clone(),
                        score,
                        highlights: vec![span],
                    });
                }

                let (weight, skim) = fuzzy.as_ref()?;
                let (_, indices) = skim.fuzzy_indices(&entity.display_name, text)?;
                Some(ResultItem {
                    entity: entity.clone(),
                    score: *weight,
                    highlights: coalesce(&indices),
                })
            })
            .collect();

        items.sort_by(|a, b| b.score.total_cmp(&a.score));
        items
    }
}

/// Finds the first case-folded occurrence of `needle` in `haystack`.
/// Returns the folded start offset and the matching character range of the
/// original string.
fn find_folded(haystack: &str, needle: &[char]) -> Option<(usize, Range<usize>)> {
    let mut folded = Vec::with_capacity(haystack.len());
    let mut origin = Vec::with_capacity(haystack.len());
    for (index, c) in haystack.chars().enumerate() {
        for lower in c.to_lowercase() {
            folded.push(lower);
            origin.push(index);
        }
    }

    let start = folded.windows(needle.len()).position(|window| window == needle)?;
    let end = origin[start + needle.len() - 1] + 1;
    Some((start, origin[start]..end))
}

fn coalesce(indices: &[usize]) -> Vec<Range<usize>> {
    let mut ranges: Vec<Range<usize>> = Vec::new();
    for &index in indices {
        match ranges.last_mut() {
            Some(last) if last.end == index => last.end = index + 1,
            _ => ranges.push(index..index + 1),
        }
    }
    ranges
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::EntityState;
    use proptest::prelude::*;

    fn entity(id: &str, name: &str) -> Entity {
        Entity {
            id: id.into(),
            display_name: name.into(),
            state: EntityState::Unknown,
            raw: format!("{id}:{name}"),
        }
    }

    fn names(items: &[ResultItem]) -> Vec<&str> {
        items.iter().map(|i| i.entity.display_name.as_str()).collect()
    }

    #[test]
    fn wifi_scenario_keeps_listing_order_with_equal_scores() {
        let entities = [entity("1", "Home WiFi"), entity("2", "Office-WiFi-5G")];
        let items = Matcher::default().rank(&entities, "wifi");

        assert_eq!(names(&items), ["Home WiFi", "Office-WiFi-5G"]);
        assert_eq!(items[0].score, items[1].score);
        assert_eq!(items[0].highlights, [5..9]);
        assert_eq!(items[1].highlights, [7..11]);
    }

    #[test]
    fn prefix_ranks_above_substring() {
        let entities = [
            entity("1", "Guest Office"),
            entity("2", "office printer"),
            entity("3", "Back Office"),
        ];
        let items = Matcher::default().rank(&entities, "OFFICE");

        assert_eq!(names(&items), ["office printer", "Guest Office", "Back Office"]);
        assert!(items[0].score > items[1].score);
        assert_eq!(items[1].score, items[2].score);
    }

    #[test]
    fn empty_query_returns_everything_in_order() {
        let entities = [entity("1", "b"), entity("2", "a"), entity("3", "c")];
        let items = Matcher::default().rank(&entities, "");

        assert_eq!(names(&items), ["b", "a", "c"]);
        assert!(items.iter().all(|i| i.score == items[0].score));
        assert!(items.iter().all(|i| i.highlights.is_empty()));
    }

    #[test]
    fn whitespace_is_part_of_the_query() {
        let entities = [entity("1", "HomeWiFi"), entity("2", "Office"), entity("3", "Office 5G")];

        assert_eq!(names(&Matcher::default().rank(&entities, " ")), ["Office 5G"]);
        assert_eq!(names(&Matcher::default().rank(&entities, "office ")), ["Office 5G"]);
        assert_eq!(Matcher::default().rank(&entities, "office ")[0].highlights, [0..7]);
    }

    #[test]
    fn no_match_is_empty() {
        let entities = [entity("1", "Home WiFi")];
        assert!(Matcher::default().rank(&entities, "ethernet").is_empty());
    }

    #[test]
    fn highlights_count_characters_not_bytes() {
        let entities = [entity("1", "Café Ünïcode")];
        let items = Matcher::default().rank(&entities, "ünï");

        assert_eq!(items[0].highlights, [5..8]);
    }

    #[test]
    fn fuzzy_is_off_by_default() {
        let entities = [entity("1", "Home WiFi")];
        assert!(Matcher::default().rank(&entities, "hwf").is_empty());
    }

    #[test]
    fn fuzzy_fallback_ranks_below_substring() {
        let matcher = Matcher::new(MatchWeights {
            fuzzy: Some(0.5),
            ..MatchWeights::default()
        });
        let entities = [entity("1", "Home WiFi"), entity("2", "hwf lab")];
        let items = matcher.rank(&entities, "hwf");

        assert_eq!(names(&items), ["hwf lab", "Home WiFi"]);
        assert_eq!(items[1].score, 0.5);
        assert_eq!(items[1].highlights, [0..1, 5..6, 7..8]);
    }

    #[test]
    fn weights_validation() {
        assert!(MatchWeights::default().validate().is_ok());
        let inverted = MatchWeights {
            prefix: 0.5,
            ..MatchWeights::default()
        };
        assert!(inverted.validate().is_err());
        let loud_fuzzy = MatchWeights {
            fuzzy: Some(3.0),
            ..MatchWeights::default()
        };
        assert!(loud_fuzzy.validate().is_err());
    }

    fn listing() -> impl Strategy<Value = Vec<Entity>> {
        proptest::collection::vec("[a-cA-C -]{0,10}", 0..24).prop_map(|names| {
            names
                .iter()
                .enumerate()
                .map(|(i, name)| entity(&i.to_string(), name))
                .collect()
        })
    }

    proptest! {
        #[test]
        fn empty_query_is_identity(entities in listing()) {
            let items = Matcher::default().rank(&entities, "");
            prop_assert_eq!(items.len(), entities.len());
            for (item, entity) in items.iter().zip(&entities) {
                prop_assert_eq!(&item.entity, entity);
                prop_assert_eq!(item.score, items[0].score);
            }
        }

        #[test]
        fn every_result_contains_query(entities in listing(), query in "[a-cA-C ]{1,3}") {
            let lowered = query.to_lowercase();
            for item in Matcher::default().rank(&entities, &query) {
                prop_assert!(item.entity.display_name.to_lowercase().contains(&lowered));
            }
        }

        #[test]
        fn prefix_matches_come_first(entities in listing(), query in "[a-cA-C ]{1,2}") {
            let lowered = query.to_lowercase();
            let items = Matcher::default().rank(&entities, &query);
            let prefix: Vec<bool> = items
                .iter()
                .map(|i| i.entity.display_name.to_lowercase().starts_with(&lowered))
                .collect();
            prop_assert!(prefix.windows(2).all(|w| w[0] || !w[1]));
        }

        #[test]
        fn ranking_is_deterministic(entities in listing(), query in "[a-cA-C ]{0,3}") {
            let matcher = Matcher::default();
            prop_assert_eq!(matcher.rank(&entities, &query), matcher.rank(&entities, &query));
        }
    }
}
