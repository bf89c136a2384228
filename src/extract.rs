//! Result extraction: pull cited sources and the answer text out of a phase
//! result in one deterministic pass.

use crate::plan::{PhaseResult, Plan};
use crate::tools::StepOutput;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Relevance bucket for a cited source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Relevance {
    High,
    Medium,
}

/// A deduplicated, relevance-ranked source reference.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Source {
    pub url: String,
    pub title: String,
    pub relevance: Relevance,
}

/// Search scores above this count as high relevance.
const HIGH_RELEVANCE_SCORE: f64 = 0.7;

/// Extract `(sources, output)` from a phase result.
///
/// Sources: every search-result sequence in the step results, deduplicated by
/// URL keeping the higher-relevance record, sorted high-first (insertion
/// order within a bucket). Output: the first synthesis-shaped step's
/// non-empty text, else the first text output longer than `min_output_length`,
/// else the empty string.
pub fn extract_phase_output(
    phase_result: &PhaseResult,
    min_output_length: usize,
) -> (Vec<Source>, String) {
    let mut sources: Vec<Source> = Vec::new();
    for result in &phase_result.step_results {
        let Some(StepOutput::SearchResults(records)) = &result.output else {
            continue;
        };
        for record in records {
            let relevance = match record.score {
                Some(score) if score > HIGH_RELEVANCE_SCORE => Relevance::High,
                _ => Relevance::Medium,
            };
            sources.push(Source {
                url: record.url.clone(),
                title: record.title.clone(),
                relevance,
            });
        }
    }
    let sources = deduplicate_sources(sources);

    let mut output = String::new();
    for result in &phase_result.step_results {
        let is_synthesis = result.tool_name.contains("synth") || result.tool_name == "llm";
        if !is_synthesis {
            continue;
        }
        if let Some(text) = result.output.as_ref().and_then(|o| o.as_text())
            && !text.is_empty()
        {
            output = text.to_string();
            break;
        }
    }
    if output.is_empty() {
        for result in &phase_result.step_results {
            if let Some(text) = result.output.as_ref().and_then(|o| o.as_text())
                && text.len() > min_output_length
            {
                output = text.to_string();
                break;
            }
        }
    }

    (sources, output)
}

/// Deduplicate by URL keeping the higher-relevance record, then sort
/// high-first. Stable: within a relevance bucket, first-seen order wins.
pub fn deduplicate_sources(sources: Vec<Source>) -> Vec<Source> {
    let mut by_url: HashMap<String, usize> = HashMap::new();
    let mut deduped: Vec<Source> = Vec::new();

    for source in sources {
        match by_url.get(&source.url) {
            Some(&idx) => {
                if source.relevance < deduped[idx].relevance {
                    deduped[idx] = source;
                }
            }
            None => {
                by_url.insert(source.url.clone(), deduped.len());
                deduped.push(source);
            }
        }
    }

    deduped.sort_by_key(|s| s.relevance);
    deduped
}

/// Search queries present in a plan: every `tavily_search` / `web_search`
/// step with a non-empty string `query` in its config.
pub fn extract_search_queries(plan: &Plan) -> Vec<String> {
    plan.phases
        .iter()
        .flat_map(|phase| &phase.steps)
        .filter(|step| step.tool_name == "tavily_search" || step.tool_name == "web_search")
        .filter_map(|step| step.config.get("query").and_then(|v| v.as_str()))
        .filter(|query| !query.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::{JsonMap, Phase, Step, StepResult, StepType};
    use crate::tools::SearchResult;
    use serde_json::json;

    fn search_step_result(results: Vec<SearchResult>) -> StepResult {
        let step = Step::new(
            "phase-1",
            StepType::Search,
            "tavily_search",
            JsonMap::new(),
            vec![],
            0,
        );
        StepResult::completed(
            &step,
            JsonMap::new(),
            StepOutput::SearchResults(results),
            5,
            None,
        )
    }

    fn text_step_result(tool: &str, text: &str) -> StepResult {
        let step = Step::new("phase-1", StepType::Llm, tool, JsonMap::new(), vec![], 1);
        StepResult::completed(&step, JsonMap::new(), StepOutput::Text(text.into()), 5, None)
    }

    fn record(url: &str, score: Option<f64>) -> SearchResult {
        SearchResult {
            url: url.to_string(),
            title: format!("Title for {url}"),
            content: "content".to_string(),
            score,
        }
    }

    #[test]
    fn sources_deduplicate_by_url_keeping_higher_relevance() {
        let phase_result = PhaseResult::completed(vec![
            search_step_result(vec![
                record("https://a.example", Some(0.5)),
                record("https://b.example", Some(0.9)),
            ]),
            search_step_result(vec![record("https://a.example", Some(0.95))]),
        ]);

        let (sources, _) = extract_phase_output(&phase_result, 50);
        assert_eq!(sources.len(), 2);
        // High-relevance sources sort first.
        assert_eq!(sources[0].relevance, Relevance::High);
        let a = sources.iter().find(|s| s.url == "https://a.example").unwrap();
        assert_eq!(a.relevance, Relevance::High);
    }

    #[test]
    fn synthesis_output_wins_over_longer_text() {
        let long_text = "x".repeat(120);
        let phase_result = PhaseResult::completed(vec![
            text_step_result("web_fetch", &long_text),
            text_step_result("synthesize", "the synthesized answer"),
        ]);

        let (_, output) = extract_phase_output(&phase_result, 50);
        assert_eq!(output, "the synthesized answer");
    }

    #[test]
    fn falls_back_to_first_long_text_output() {
        let phase_result = PhaseResult::completed(vec![
            text_step_result("web_fetch", "short"),
            text_step_result("web_fetch", &"y".repeat(80)),
        ]);

        let (_, output) = extract_phase_output(&phase_result, 50);
        assert_eq!(output, "y".repeat(80));
    }

    #[test]
    fn no_usable_output_yields_empty_string() {
        let phase_result =
            PhaseResult::completed(vec![text_step_result("web_fetch", "too short")]);
        let (sources, output) = extract_phase_output(&phase_result, 50);
        assert!(sources.is_empty());
        assert!(output.is_empty());
    }

    #[test]
    fn extraction_is_deterministic() {
        let phase_result = PhaseResult::completed(vec![
            search_step_result(vec![
                record("https://a.example", Some(0.9)),
                record("https://b.example", Some(0.2)),
                record("https://c.example", Some(0.8)),
            ]),
            text_step_result("synthesize", "answer"),
        ]);

        let first = extract_phase_output(&phase_result, 50);
        let second = extract_phase_output(&phase_result, 50);
        assert_eq!(first, second);
    }

    #[test]
    fn dedup_is_idempotent_over_duplicated_input() {
        let xs = vec![
            Source {
                url: "https://a.example".into(),
                title: "A".into(),
                relevance: Relevance::Medium,
            },
            Source {
                url: "https://b.example".into(),
                title: "B".into(),
                relevance: Relevance::High,
            },
        ];
        let mut doubled = xs.clone();
        doubled.extend(xs.clone());

        assert_eq!(deduplicate_sources(doubled), deduplicate_sources(xs));
    }

    #[test]
    fn search_queries_come_from_search_steps_only() {
        let mut plan = Plan::new("q");
        let mut phase = Phase::new(&plan.id, "Search", "", false, 0);
        let phase_id = phase.id.clone();

        let mut config = JsonMap::new();
        config.insert("query".into(), json!("rust async"));
        phase.steps.push(Step::new(
            &phase_id,
            StepType::Search,
            "tavily_search",
            config,
            vec![],
            0,
        ));

        let mut empty_query = JsonMap::new();
        empty_query.insert("query".into(), json!(""));
        phase.steps.push(Step::new(
            &phase_id,
            StepType::Search,
            "web_search",
            empty_query,
            vec![],
            1,
        ));

        let mut fetch_config = JsonMap::new();
        fetch_config.insert("url".into(), json!("https://a.example"));
        phase.steps.push(Step::new(
            &phase_id,
            StepType::Fetch,
            "web_fetch",
            fetch_config,
            vec![],
            2,
        ));
        plan.phases.push(phase);

        assert_eq!(extract_search_queries(&plan), vec!["rust async"]);
    }
}
