//! Name similarity, tool suggestions and argument diagnostics.
//!
//! Scores are normalized Levenshtein similarities in `[0.0, 1.0]` computed
//! over case- and separator-insensitive forms of the names, so
//! `Terminal-Command` and `terminal_command` compare as identical.
//!
//! Everything here is a pure function of its inputs: for a fixed set of
//! registered names the suggestions for a given request never change.

use std::cmp::Ordering;

use serde::Serialize;
use serde_json::{Map, Value as JsonValue};

use crate::tool::ParamSchema;

/// Maximum number of close matches reported for an unknown tool.
pub const MAX_SUGGESTIONS: usize = 5;

/// Maximum number of close matches reported per unknown argument.
pub const MAX_ARGUMENT_SUGGESTIONS: usize = 3;

/// Minimum similarity for a name to be listed as a close match.
pub const CLOSE_MATCH_CUTOFF: f64 = 0.66;

/// Minimum similarity for a name to be offered as the single suggestion.
pub const STRICT_MATCH_CUTOFF: f64 = 0.92;

/// Minimum lead of the best candidate over the runner-up for a single
/// suggestion.
pub const MIN_CONFIDENCE_GAP: f64 = 0.08;

/// Reduces a name to its comparison form: lowercase with separators removed.
pub fn normalize_name(name: &str) -> String {
    name.chars()
        .filter(|c| !matches!(c, '_' | '-' | '.' | '/') && !c.is_whitespace())
        .flat_map(char::to_lowercase)
        .collect()
}

/// Similarity between two names in `[0.0, 1.0]`.
///
/// An adjacent transposition costs one edit, the same as a single typo.
pub fn similarity(a: &str, b: &str) -> f64 {
    strsim::normalized_damerau_levenshtein(&normalize_name(a), &normalize_name(b))
}

/// A candidate name together with its similarity score.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScoredName {
    pub name: String,
    pub score: f64,
}

/// Scores every candidate against `requested`, best first.
///
/// Ties are broken by name so the ordering is total and deterministic.
pub fn rank<'a>(requested: &str, candidates: impl IntoIterator<Item = &'a str>) -> Vec<ScoredName> {
    let mut scored: Vec<ScoredName> = candidates
        .into_iter()
        .map(|name| ScoredName {
            name: name.to_string(),
            score: similarity(requested, name),
        })
        .collect();
    scored.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(Ordering::Equal)
            .then_with(|| a.name.cmp(&b.name))
    });
    scored
}

/// Returns up to `limit` candidates scoring at least `cutoff`, best first.
pub fn close_matches<'a>(
    requested: &str,
    candidates: impl IntoIterator<Item = &'a str>,
    limit: usize,
    cutoff: f64,
) -> Vec<String> {
    rank(requested, candidates)
        .into_iter()
        .filter(|s| s.score >= cutoff)
        .take(limit)
        .map(|s| s.name)
        .collect()
}

/// Suggestions for an unresolved tool name.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Suggestions {
    /// Single high-confidence suggestion, if one candidate clearly stands out.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub suggested: Option<String>,
    /// Close matches, best first.
    pub candidates: Vec<String>,
}

/// Computes suggestions for `requested` over the registered `known` names.
///
/// A single suggestion is only produced when exactly one name clears
/// [`STRICT_MATCH_CUTOFF`] and leads the runner-up by at least
/// [`MIN_CONFIDENCE_GAP`]. Otherwise callers get the candidate list alone,
/// which keeps them from anchoring on a wrong guess.
pub fn suggest<'a>(requested: &str, known: impl IntoIterator<Item = &'a str>) -> Suggestions {
    let ranked = rank(requested, known);

    let strict: Vec<&ScoredName> = ranked
        .iter()
        .filter(|s| s.score >= STRICT_MATCH_CUTOFF)
        .collect();

    let suggested = match strict.as_slice() {
        [only] => {
            let runner_up = ranked
                .iter()
                .filter(|s| s.name != only.name)
                .map(|s| s.score)
                .next()
                .unwrap_or(0.0);
            (only.score - runner_up >= MIN_CONFIDENCE_GAP).then(|| only.name.clone())
        }
        _ => None,
    };

    let candidates = ranked
        .into_iter()
        .filter(|s| s.score >= CLOSE_MATCH_CUTOFF)
        .take(MAX_SUGGESTIONS)
        .map(|s| s.name)
        .collect();

    Suggestions {
        suggested,
        candidates,
    }
}

/// An argument name the schema does not declare.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UnknownArgument {
    pub name: String,
    pub suggestions: Vec<String>,
}

/// Mismatch between supplied argument names and a declared schema.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ArgumentDiagnostics {
    pub unknown_arguments: Vec<UnknownArgument>,
    pub missing_arguments: Vec<String>,
    pub required_arguments: Vec<String>,
    pub optional_arguments: Vec<String>,
}

impl ArgumentDiagnostics {
    /// One-line human summary of the mismatch.
    pub fn summary(&self) -> String {
        let mut parts = Vec::new();
        if !self.unknown_arguments.is_empty() {
            let names: Vec<&str> = self
                .unknown_arguments
                .iter()
                .map(|u| u.name.as_str())
                .collect();
            parts.push(format!("unknown arguments: {}", names.join(", ")));
        }
        if !self.missing_arguments.is_empty() {
            parts.push(format!(
                "missing required arguments: {}",
                self.missing_arguments.join(", ")
            ));
        }
        parts.join("; ")
    }
}

/// Compares supplied argument names against a declared schema.
///
/// Returns `None` when the names match. Unknown names are ignored for
/// schemas that accept extra arguments; missing required names are always
/// reported. Argument values are not inspected.
pub fn diagnose_arguments(
    schema: &ParamSchema,
    arguments: &Map<String, JsonValue>,
) -> Option<ArgumentDiagnostics> {
    let declared: Vec<&str> = schema.params().iter().map(|p| p.name.as_str()).collect();

    let mut unknown_arguments: Vec<UnknownArgument> = if schema.accepts_extra() {
        Vec::new()
    } else {
        arguments
            .keys()
            .filter(|name| !declared.contains(&name.as_str()))
            .map(|name| UnknownArgument {
                name: name.clone(),
                suggestions: close_matches(
                    name,
                    declared.iter().copied(),
                    MAX_ARGUMENT_SUGGESTIONS,
                    CLOSE_MATCH_CUTOFF,
                ),
            })
            .collect()
    };
    unknown_arguments.sort_by(|a, b| a.name.cmp(&b.name));

    let missing_arguments: Vec<String> = schema
        .required()
        .filter(|name| !arguments.contains_key(*name))
        .map(String::from)
        .collect();

    if unknown_arguments.is_empty() && missing_arguments.is_empty() {
        return None;
    }

    Some(ArgumentDiagnostics {
        unknown_arguments,
        missing_arguments,
        required_arguments: schema.required().map(String::from).collect(),
        optional_arguments: schema.optional().map(String::from).collect(),
    })
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::tool::{ParamKind, ParamSpec};

    fn args(value: JsonValue) -> Map<String, JsonValue> {
        match value {
            JsonValue::Object(map) => map,
            _ => panic!("expected object"),
        }
    }

    #[test]
    fn test_normalize_name_ignores_case_and_separators() {
        assert_eq!(normalize_name("Terminal-Command"), "terminalcommand");
        assert_eq!(normalize_name("fetch.url"), "fetchurl");
        assert_eq!(normalize_name("list issues"), "listissues");
    }

    #[test]
    fn test_similarity_identical_after_normalization() {
        assert!((similarity("Terminal-Command", "terminal_command") - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_transposed_letters_count_as_one_edit() {
        assert!((similarity("ecoh", "echo") - 0.75).abs() < f64::EPSILON);
        assert_eq!(suggest("ecoh", ["echo", "fetch_url"]).candidates, vec!["echo".to_string()]);
    }

    #[test]
    fn test_close_candidates_suppress_single_suggestion() {
        let known = ["terminal_command", "terminal_commands"];
        let suggestions = suggest("terminal_comand", known);

        assert_eq!(suggestions.suggested, None);
        assert_eq!(
            suggestions.candidates,
            vec!["terminal_command".to_string(), "terminal_commands".to_string()]
        );
    }

    #[test]
    fn test_lone_strong_candidate_is_suggested() {
        let suggestions = suggest("terminal_comand", ["terminal_command"]);
        assert_eq!(suggestions.suggested.as_deref(), Some("terminal_command"));
        assert_eq!(suggestions.candidates, vec!["terminal_command".to_string()]);
    }

    #[test]
    fn test_strong_candidate_with_distant_runner_up_is_suggested() {
        let known = ["terminal_command", "fetch_url", "list_issues"];
        let suggestions = suggest("terminal_comand", known);
        assert_eq!(suggestions.suggested.as_deref(), Some("terminal_command"));
    }

    #[test]
    fn test_unrelated_name_yields_nothing() {
        let suggestions = suggest("zzz", ["terminal_command", "fetch_url"]);
        assert_eq!(suggestions, Suggestions::default());
    }

    #[test]
    fn test_candidates_are_capped_and_deterministic() {
        let known = [
            "issue_a", "issue_b", "issue_c", "issue_d", "issue_e", "issue_f", "issue_g",
        ];
        let first = suggest("issue_x", known);
        let second = suggest("issue_x", known.iter().rev().copied());

        assert_eq!(first.candidates.len(), MAX_SUGGESTIONS);
        assert_eq!(first, second);
        assert_eq!(first.candidates[0], "issue_a");
    }

    #[test]
    fn test_empty_registry_yields_no_suggestions() {
        let suggestions = suggest("anything", std::iter::empty());
        assert_eq!(suggestions, Suggestions::default());
    }

    fn schema(accepts_extra: bool) -> ParamSchema {
        ParamSchema::new(vec![
            ParamSpec::required("command", ParamKind::String),
            ParamSpec::optional("cwd", ParamKind::String),
            ParamSpec::optional("installing_dependencies", ParamKind::Boolean),
        ])
        .with_extra(accepts_extra)
    }

    #[test]
    fn test_diagnose_arguments_matching_names_is_none() {
        let supplied = args(json!({"command": "ls", "cwd": "/tmp"}));
        assert_eq!(diagnose_arguments(&schema(false), &supplied), None);
    }

    #[test]
    fn test_diagnose_arguments_reports_unknown_and_missing() {
        let supplied = args(json!({"comand": "ls", "cwdd": "/tmp"}));
        let diagnostics = diagnose_arguments(&schema(false), &supplied).expect("mismatch");

        assert_eq!(diagnostics.missing_arguments, vec!["command".to_string()]);
        assert_eq!(diagnostics.unknown_arguments.len(), 2);
        assert_eq!(diagnostics.unknown_arguments[0].name, "comand");
        assert_eq!(
            diagnostics.unknown_arguments[0].suggestions,
            vec!["command".to_string()]
        );
        assert_eq!(diagnostics.unknown_arguments[1].name, "cwdd");
        assert_eq!(
            diagnostics.unknown_arguments[1].suggestions,
            vec!["cwd".to_string()]
        );
        assert_eq!(diagnostics.required_arguments, vec!["command".to_string()]);
        assert_eq!(
            diagnostics.optional_arguments,
            vec!["cwd".to_string(), "installing_dependencies".to_string()]
        );
        assert!(diagnostics.summary().contains("missing required arguments: command"));
    }

    #[test]
    fn test_diagnose_arguments_variadic_schema_only_reports_missing() {
        let supplied = args(json!({"anything": 1}));
        let diagnostics = diagnose_arguments(&schema(true), &supplied).expect("mismatch");
        assert!(diagnostics.unknown_arguments.is_empty());
        assert_eq!(diagnostics.missing_arguments, vec!["command".to_string()]);

        let supplied = args(json!({"command": "ls", "anything": 1}));
        assert_eq!(diagnose_arguments(&schema(true), &supplied), None);
    }
}
