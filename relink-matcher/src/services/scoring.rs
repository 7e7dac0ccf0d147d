//! Match scoring engine
//!
//! Pure, deterministic scoring of a knowledge-base snapshot against an
//! external entry. Weighted components (name similarity, date comparison,
//! exact-match property rules) are renormalized over whichever components
//! both sides actually provide, so a sparse snapshot is not penalized for
//! data it never had.

use crate::config::ScoringConfig;
use crate::models::Entry;
use crate::services::wikidata_client::EntitySnapshot;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Score awarded when only the years of two dates agree
const YEAR_MATCH_SCORE: i64 = 80;

/// Review-facing confidence band derived from the final score
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Confidence {
    /// Score >= 80
    High,
    /// Score >= 50
    Low,
    /// Score < 50
    None,
}

impl Confidence {
    pub fn from_score(score: i64) -> Self {
        if score >= 80 {
            Confidence::High
        } else if score >= 50 {
            Confidence::Low
        } else {
            Confidence::None
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Confidence::High => "high",
            Confidence::Low => "low",
            Confidence::None => "none",
        }
    }
}

/// Per-component scores plus the derived confidence band
///
/// Serialized into the candidate's `score_breakdown` column for the
/// review UI.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScoreBreakdown {
    /// Component key → component score, one entry per present component
    pub components: BTreeMap<String, i64>,
    pub confidence: Confidence,
}

/// Result of scoring one snapshot against one entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScoreResult {
    /// Final weighted score, 0..=100
    pub score: i64,
    pub breakdown: ScoreBreakdown,
}

/// Score a knowledge-base snapshot against an entry
///
/// Components:
/// - `name`: best fuzzy similarity of the entry's display name against the
///   snapshot's label and aliases
/// - the configured date attribute (default `date_of_birth`) against the
///   configured date property (default P569)
/// - each configured exact-match property rule, splitting
///   `property_weight` between the rules both sides provide
///
/// A component with either side absent is skipped. The final score is the
/// weight-renormalized rounded average over present components; no present
/// components scores 0.
pub fn score_candidate(
    entry: &Entry,
    snapshot: &EntitySnapshot,
    config: &ScoringConfig,
) -> ScoreResult {
    // (weight, breakdown key, component score)
    let mut weighted: Vec<(f64, String, i64)> = Vec::new();

    let entry_name = normalize(&entry.display_name);
    if !entry_name.is_empty() {
        let mut names: Vec<&str> = Vec::new();
        if let Some(label) = snapshot.label.as_deref() {
            names.push(label);
        }
        names.extend(snapshot.aliases.iter().map(String::as_str));
        let score = name_score(&entry_name, &names, config.name_fuzzy_threshold);
        weighted.push((config.name_weight, "name".to_string(), score));
    }

    if let (Some(entry_date), Some(kb_date)) = (
        entry.attribute(&config.date_attribute),
        snapshot.claims.get(&config.date_property),
    ) {
        let score = date_score(entry_date, kb_date, config.date_tolerance_days);
        weighted.push((config.date_weight, config.date_attribute.clone(), score));
    }

    let present_rules: Vec<(&String, &str, &str)> = config
        .property_rules
        .iter()
        .filter_map(|(attribute, property)| {
            let entry_value = entry.attribute(attribute)?;
            let kb_value = snapshot.claims.get(property)?;
            Some((attribute, entry_value, kb_value.as_str()))
        })
        .collect();
    if !present_rules.is_empty() {
        let rule_weight = config.property_weight / present_rules.len() as f64;
        for (attribute, entry_value, kb_value) in present_rules {
            let score = if normalize(entry_value) == normalize(kb_value) {
                100
            } else {
                0
            };
            weighted.push((rule_weight, attribute.clone(), score));
        }
    }

    let total_weight: f64 = weighted.iter().map(|(w, _, _)| *w).sum();
    let score = if total_weight > 0.0 {
        let accumulated: f64 = weighted.iter().map(|(w, _, s)| w * *s as f64).sum();
        (accumulated / total_weight).round().clamp(0.0, 100.0) as i64
    } else {
        0
    };

    let components: BTreeMap<String, i64> = weighted
        .into_iter()
        .map(|(_, key, component)| (key, component))
        .collect();

    ScoreResult {
        score,
        breakdown: ScoreBreakdown {
            components,
            confidence: Confidence::from_score(score),
        },
    }
}

fn normalize(s: &str) -> String {
    s.trim().to_lowercase()
}

/// Best name similarity across the candidate names, 0..=100
///
/// Exact normalized equality short-circuits to 100; fuzzy results below
/// `threshold` score 0 to keep superficially-similar strangers out of the
/// review queue.
fn name_score(entry_normalized: &str, candidate_names: &[&str], threshold: i64) -> i64 {
    let mut best = 0i64;
    for name in candidate_names {
        let candidate = normalize(name);
        if candidate.is_empty() {
            continue;
        }
        if candidate == entry_normalized {
            return 100;
        }
        let scaled = (fuzzy_ratio(entry_normalized, &candidate) * 100.0).round() as i64;
        best = best.max(scaled);
    }
    if best < threshold {
        0
    } else {
        best
    }
}

fn fuzzy_ratio(a: &str, b: &str) -> f64 {
    strsim::normalized_levenshtein(a, b)
        .max(strsim::jaro_winkler(a, b))
        .max(token_set_ratio(a, b))
}

/// Sorted unique whitespace tokens compared by normalized Levenshtein,
/// which makes "Gretzky Wayne" and "Wayne Gretzky" equal.
fn token_set_ratio(a: &str, b: &str) -> f64 {
    let a_sorted = sorted_tokens(a);
    let b_sorted = sorted_tokens(b);
    if a_sorted.is_empty() || b_sorted.is_empty() {
        return 0.0;
    }
    strsim::normalized_levenshtein(&a_sorted, &b_sorted)
}

fn sorted_tokens(s: &str) -> String {
    let tokens: BTreeSet<&str> = s.split_whitespace().collect();
    tokens.into_iter().collect::<Vec<_>>().join(" ")
}

/// A date with optional month/day precision; `month == 0` means the source
/// only carried the year.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ParsedDate {
    year: i32,
    month: u32,
    day: u32,
}

impl ParsedDate {
    fn is_full(&self) -> bool {
        self.month != 0 && self.day != 0
    }

    fn to_naive(self) -> Option<chrono::NaiveDate> {
        chrono::NaiveDate::from_ymd_opt(self.year, self.month, self.day)
    }
}

/// Parse an ISO-ish date, accepting entry values (`1961-01-26`, `1961-01`,
/// `1961`) and Wikidata time strings (`+1961-01-26T00:00:00Z`, month/day
/// `00` meaning unknown, leading `-` for BCE years).
///
/// Returns None only when no year can be read; anything with a year but
/// without usable month/day degrades to year precision.
fn parse_date(raw: &str) -> Option<ParsedDate> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    let (negative, rest) = match trimmed.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, trimmed.strip_prefix('+').unwrap_or(trimmed)),
    };
    let date_part = rest.split_once('T').map(|(d, _)| d).unwrap_or(rest);
    let mut parts = date_part.splitn(3, '-');
    let year: i32 = parts.next()?.parse().ok()?;
    let year = if negative { -year } else { year };
    let month: u32 = parts.next().and_then(|p| p.parse().ok()).unwrap_or(0);
    let day: u32 = parts.next().and_then(|p| p.parse().ok()).unwrap_or(0);
    if month == 0 || month > 12 || day == 0 || day > 31 {
        return Some(ParsedDate {
            year,
            month: 0,
            day: 0,
        });
    }
    Some(ParsedDate { year, month, day })
}

/// Compare two date strings, 0..=100
///
/// Exact match 100; within `tolerance_days` 100 − 5×days floored at the
/// year-match score; same year 80; otherwise 0. Either side at year
/// precision drops the comparison to year granularity.
fn date_score(entry_raw: &str, kb_raw: &str, tolerance_days: i64) -> i64 {
    let (Some(entry), Some(kb)) = (parse_date(entry_raw), parse_date(kb_raw)) else {
        return 0;
    };

    if entry.is_full() && kb.is_full() {
        if let (Some(a), Some(b)) = (entry.to_naive(), kb.to_naive()) {
            let days = (a - b).num_days().abs();
            if days == 0 {
                return 100;
            }
            if days <= tolerance_days {
                return (100 - 5 * days).max(YEAR_MATCH_SCORE);
            }
        }
    }

    if entry.year == kb.year {
        YEAR_MATCH_SCORE
    } else {
        0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn entry_with(display_name: &str, attributes: &[(&str, &str)]) -> Entry {
        Entry {
            id: Uuid::new_v4(),
            project_id: Uuid::new_v4(),
            display_name: display_name.to_string(),
            attributes: attributes
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            external_ref: None,
            created_at: relink_common::time::now(),
            updated_at: relink_common::time::now(),
        }
    }

    fn snapshot_with(label: &str, aliases: &[&str], claims: &[(&str, &str)]) -> EntitySnapshot {
        EntitySnapshot {
            id: "Q231480".to_string(),
            label: if label.is_empty() {
                None
            } else {
                Some(label.to_string())
            },
            description: None,
            aliases: aliases.iter().map(|a| a.to_string()).collect(),
            claims: claims
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        }
    }

    #[test]
    fn test_exact_name_and_date_scores_100() {
        let entry = entry_with("Wayne Gretzky", &[("date_of_birth", "1961-01-26")]);
        let snapshot = snapshot_with(
            "Wayne Gretzky",
            &[],
            &[("P569", "+1961-01-26T00:00:00Z")],
        );

        let result = score_candidate(&entry, &snapshot, &ScoringConfig::default());
        assert_eq!(result.score, 100);
        assert_eq!(result.breakdown.components.get("name"), Some(&100));
        assert_eq!(result.breakdown.components.get("date_of_birth"), Some(&100));
        assert_eq!(result.breakdown.confidence, Confidence::High);
    }

    #[test]
    fn test_name_matched_through_alias() {
        let entry = entry_with("The Great One", &[]);
        let snapshot = snapshot_with("Wayne Gretzky", &["the great one"], &[]);

        let result = score_candidate(&entry, &snapshot, &ScoringConfig::default());
        assert_eq!(result.breakdown.components.get("name"), Some(&100));
    }

    #[test]
    fn test_name_is_token_order_insensitive() {
        let entry = entry_with("Gretzky Wayne", &[]);
        let snapshot = snapshot_with("Wayne Gretzky", &[], &[]);

        let result = score_candidate(&entry, &snapshot, &ScoringConfig::default());
        assert_eq!(result.breakdown.components.get("name"), Some(&100));
    }

    #[test]
    fn test_dissimilar_name_scores_zero() {
        let entry = entry_with("Wayne Gretzky", &[]);
        let snapshot = snapshot_with("Mario Lemieux", &[], &[]);

        let result = score_candidate(&entry, &snapshot, &ScoringConfig::default());
        assert_eq!(result.breakdown.components.get("name"), Some(&0));
        assert_eq!(result.score, 0);
        assert_eq!(result.breakdown.confidence, Confidence::None);
    }

    #[test]
    fn test_date_tolerance_ladder() {
        assert_eq!(date_score("1961-01-26", "+1961-01-26T00:00:00Z", 3), 100);
        assert_eq!(date_score("1961-01-26", "+1961-01-27T00:00:00Z", 3), 95);
        assert_eq!(date_score("1961-01-26", "+1961-01-28T00:00:00Z", 3), 90);
        assert_eq!(date_score("1961-01-26", "+1961-01-29T00:00:00Z", 3), 85);
        // beyond tolerance but same year
        assert_eq!(date_score("1961-01-26", "+1961-01-30T00:00:00Z", 3), 80);
        assert_eq!(date_score("1961-01-26", "+1961-07-01T00:00:00Z", 3), 80);
        assert_eq!(date_score("1961-01-26", "+1962-01-26T00:00:00Z", 3), 0);
    }

    #[test]
    fn test_year_precision_compares_years() {
        // entry carries only a year
        assert_eq!(date_score("1961", "+1961-01-26T00:00:00Z", 3), 80);
        assert_eq!(date_score("1961", "+1962-01-26T00:00:00Z", 3), 0);
        // Wikidata year precision marks month/day as 00
        assert_eq!(date_score("1961-01-26", "+1961-00-00T00:00:00Z", 3), 80);
        // month-only entry value also drops to year precision
        assert_eq!(date_score("1961-01", "+1961-01-26T00:00:00Z", 3), 80);
    }

    #[test]
    fn test_bce_years() {
        assert_eq!(date_score("-0427", "-0427-00-00T00:00:00Z", 3), 80);
        assert_eq!(date_score("-0427", "-0347-00-00T00:00:00Z", 3), 0);
    }

    #[test]
    fn test_unreadable_date_scores_zero() {
        assert_eq!(date_score("someday", "+1961-01-26T00:00:00Z", 3), 0);
        assert_eq!(date_score("1961-01-26", "unknown", 3), 0);
    }

    #[test]
    fn test_absent_components_are_skipped() {
        // no date attribute on the entry, no claims on the snapshot
        let entry = entry_with("Wayne Gretzky", &[]);
        let snapshot = snapshot_with("Wayne Gretzky", &[], &[]);

        let result = score_candidate(&entry, &snapshot, &ScoringConfig::default());
        assert_eq!(result.score, 100);
        assert_eq!(result.breakdown.components.len(), 1);
        assert!(result.breakdown.components.contains_key("name"));
    }

    #[test]
    fn test_no_components_scores_zero() {
        let entry = entry_with("   ", &[]);
        let snapshot = snapshot_with("Wayne Gretzky", &[], &[]);

        let result = score_candidate(&entry, &snapshot, &ScoringConfig::default());
        assert_eq!(result.score, 0);
        assert!(result.breakdown.components.is_empty());
        assert_eq!(result.breakdown.confidence, Confidence::None);
    }

    #[test]
    fn test_weight_renormalization_over_present_components() {
        // name exact, date in a different year: (0.5*100 + 0.3*0) / 0.8
        let entry = entry_with("Wayne Gretzky", &[("date_of_birth", "1955-01-26")]);
        let snapshot = snapshot_with(
            "Wayne Gretzky",
            &[],
            &[("P569", "+1961-01-26T00:00:00Z")],
        );

        let result = score_candidate(&entry, &snapshot, &ScoringConfig::default());
        assert_eq!(result.score, 63);
        assert_eq!(result.breakdown.confidence, Confidence::Low);
    }

    #[test]
    fn test_property_rule_exact_match() {
        let mut config = ScoringConfig::default();
        config
            .property_rules
            .insert("place_of_birth".to_string(), "P19".to_string());

        let entry = entry_with(
            "Wayne Gretzky",
            &[("place_of_birth", "Brantford"), ("date_of_birth", "1961-01-26")],
        );
        let snapshot = snapshot_with(
            "Wayne Gretzky",
            &[],
            &[("P569", "+1961-01-26T00:00:00Z"), ("P19", "brantford ")],
        );

        let result = score_candidate(&entry, &snapshot, &config);
        assert_eq!(result.score, 100);
        assert_eq!(
            result.breakdown.components.get("place_of_birth"),
            Some(&100)
        );

        let mismatched = snapshot_with(
            "Wayne Gretzky",
            &[],
            &[("P569", "+1961-01-26T00:00:00Z"), ("P19", "Edmonton")],
        );
        let result = score_candidate(&entry, &mismatched, &config);
        // (0.5*100 + 0.3*100 + 0.2*0) / 1.0
        assert_eq!(result.score, 80);
        assert_eq!(result.breakdown.components.get("place_of_birth"), Some(&0));
    }

    #[test]
    fn test_scoring_is_deterministic() {
        let entry = entry_with("Wayne Gretzky", &[("date_of_birth", "1961-01-26")]);
        let snapshot = snapshot_with(
            "Wayne Gretzky",
            &["The Great One"],
            &[("P569", "+1961-01-26T00:00:00Z")],
        );
        let config = ScoringConfig::default();

        let first = score_candidate(&entry, &snapshot, &config);
        let second = score_candidate(&entry, &snapshot, &config);
        assert_eq!(first, second);
    }
}
