use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const FALLBACK_LLM_MODEL: &str = "gemini-2.5-flash";

const REFLECTION_TEXT: &str = "Analysing Web Research Results";
const FINALIZE_TEXT: &str = "Composing and presenting the final answer.";
const LABEL_SAMPLE_LIMIT: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventTitle {
    #[serde(rename = "Generating Search Queries")]
    GeneratingSearchQueries,
    #[serde(rename = "Web Research")]
    WebResearch,
    #[serde(rename = "Reflection")]
    Reflection,
    #[serde(rename = "Planner")]
    Planner,
    #[serde(rename = "Actor")]
    Actor,
    #[serde(rename = "Self-Check")]
    SelfCheck,
    #[serde(rename = "Finalizing Answer")]
    FinalizingAnswer,
    #[serde(rename = "LLM")]
    Llm,
}

impl EventTitle {
    pub fn as_str(self) -> &'static str {
        match self {
            EventTitle::GeneratingSearchQueries => "Generating Search Queries",
            EventTitle::WebResearch => "Web Research",
            EventTitle::Reflection => "Reflection",
            EventTitle::Planner => "Planner",
            EventTitle::Actor => "Actor",
            EventTitle::SelfCheck => "Self-Check",
            EventTitle::FinalizingAnswer => "Finalizing Answer",
            EventTitle::Llm => "LLM",
        }
    }

    pub fn is_research(self) -> bool {
        matches!(
            self,
            EventTitle::GeneratingSearchQueries | EventTitle::WebResearch
        )
    }
}

impl std::fmt::Display for EventTitle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SourceRef {
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub snippet: Option<String>,
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default)]
    pub short_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessedEvent {
    pub title: EventTitle,
    pub data: Value,
    #[serde(default)]
    pub sources: Option<Vec<SourceRef>>,
    #[serde(default)]
    pub queries: Option<Vec<String>>,
    #[serde(default)]
    pub details: Option<Value>,
}

impl ProcessedEvent {
    fn text(title: EventTitle, data: impl Into<String>) -> Self {
        Self {
            title,
            data: Value::String(data.into()),
            sources: None,
            queries: None,
            details: None,
        }
    }
}

/// Maps one backend node event to its timeline row, or `None` when the
/// event carries no recognized node key.
pub fn classify(event: &Value) -> Option<ProcessedEvent> {
    if let Some(node) = event.get("generate_query") {
        let queries = string_list(node.get("search_query"));
        let mut processed =
            ProcessedEvent::text(EventTitle::GeneratingSearchQueries, queries.join(", "));
        processed.queries = Some(queries);
        return Some(processed);
    }

    if let Some(node) = event.get("web_research") {
        let sources = source_list(node.get("sources_gathered"));
        let sample = label_sample(&sources);
        let mut processed = ProcessedEvent::text(
            EventTitle::WebResearch,
            format!("Gathered {} sources. Related to: {}.", sources.len(), sample),
        );
        processed.sources = Some(sources);
        return Some(processed);
    }

    if event.get("reflection").is_some() {
        return Some(ProcessedEvent::text(EventTitle::Reflection, REFLECTION_TEXT));
    }

    if let Some(node) = event.get("planner") {
        let plan = node
            .get("plan")
            .cloned()
            .filter(|value| !value.is_null())
            .unwrap_or_else(|| Value::Object(serde_json::Map::new()));
        return Some(ProcessedEvent {
            title: EventTitle::Planner,
            data: plan.clone(),
            sources: None,
            queries: None,
            details: Some(serde_json::json!({ "plan": plan })),
        });
    }

    if let Some(node) = event.get("actor") {
        let artifacts = node
            .get("artifacts")
            .cloned()
            .filter(|value| !value.is_null())
            .unwrap_or_else(|| Value::Array(Vec::new()));
        return Some(ProcessedEvent {
            title: EventTitle::Actor,
            data: artifacts.clone(),
            sources: None,
            queries: None,
            details: Some(serde_json::json!({ "artifacts": artifacts })),
        });
    }

    if let Some(node) = event.get("self_check") {
        let feedback = node
            .get("feedback")
            .and_then(Value::as_str)
            .unwrap_or_default();
        return Some(ProcessedEvent::text(EventTitle::SelfCheck, feedback));
    }

    if event.get("finalize_answer").is_some() {
        return Some(ProcessedEvent::text(
            EventTitle::FinalizingAnswer,
            FINALIZE_TEXT,
        ));
    }

    if let Some(node) = event.get("llm") {
        let model = node
            .get("model")
            .and_then(Value::as_str)
            .filter(|model| !model.is_empty())
            .unwrap_or(FALLBACK_LLM_MODEL);
        return Some(ProcessedEvent::text(EventTitle::Llm, model));
    }

    None
}

fn string_list(value: Option<&Value>) -> Vec<String> {
    value
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

fn source_list(value: Option<&Value>) -> Vec<SourceRef> {
    value
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(|item| serde_json::from_value(item.clone()).ok())
                .collect()
        })
        .unwrap_or_default()
}

fn label_sample(sources: &[SourceRef]) -> String {
    let mut labels: Vec<&str> = Vec::new();
    for source in sources {
        let Some(label) = source.label.as_deref() else {
            continue;
        };
        if label.is_empty() || labels.contains(&label) {
            continue;
        }
        labels.push(label);
        if labels.len() == LABEL_SAMPLE_LIMIT {
            break;
        }
    }

    if labels.is_empty() {
        "N/A".to_string()
    } else {
        labels.join(", ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn classifies_generate_query_with_queries() {
        let event = json!({
            "generate_query": { "search_query": ["rust async", "tokio select"] }
        });

        let processed = classify(&event).expect("classified");
        assert_eq!(processed.title, EventTitle::GeneratingSearchQueries);
        assert_eq!(processed.data, json!("rust async, tokio select"));
        assert_eq!(
            processed.queries,
            Some(vec!["rust async".to_string(), "tokio select".to_string()])
        );
    }

    #[test]
    fn generate_query_without_list_yields_empty_queries() {
        let processed = classify(&json!({ "generate_query": {} })).expect("classified");
        assert_eq!(processed.data, json!(""));
        assert_eq!(processed.queries, Some(Vec::new()));
    }

    #[test]
    fn web_research_counts_sources_and_samples_unique_labels() {
        let event = json!({
            "web_research": {
                "sources_gathered": [
                    { "label": "wikipedia.org", "url": "https://a" },
                    { "label": "wikipedia.org", "url": "https://b" },
                    { "label": "nature.com", "url": "https://c" },
                    { "label": "arxiv.org", "url": "https://d" },
                    { "label": "mit.edu", "url": "https://e" }
                ]
            }
        });

        let processed = classify(&event).expect("classified");
        assert_eq!(processed.title, EventTitle::WebResearch);
        assert_eq!(
            processed.data,
            json!("Gathered 5 sources. Related to: wikipedia.org, nature.com, arxiv.org.")
        );
        assert_eq!(processed.sources.as_ref().map(Vec::len), Some(5));
    }

    #[test]
    fn web_research_without_sources_reports_na() {
        let processed = classify(&json!({ "web_research": {} })).expect("classified");
        assert_eq!(processed.data, json!("Gathered 0 sources. Related to: N/A."));
        assert_eq!(processed.sources, Some(Vec::new()));
    }

    #[test]
    fn planner_captures_plan_in_details() {
        let event = json!({
            "planner": { "plan": { "steps": ["outline", "draft"] } }
        });

        let processed = classify(&event).expect("classified");
        assert_eq!(processed.title, EventTitle::Planner);
        assert_eq!(processed.data, json!({ "steps": ["outline", "draft"] }));
        assert_eq!(
            processed.details,
            Some(json!({ "plan": { "steps": ["outline", "draft"] } }))
        );
    }

    #[test]
    fn actor_defaults_to_empty_artifact_list() {
        let processed = classify(&json!({ "actor": {} })).expect("classified");
        assert_eq!(processed.data, json!([]));
        assert_eq!(processed.details, Some(json!({ "artifacts": [] })));
    }

    #[test]
    fn llm_falls_back_to_default_model() {
        let named = classify(&json!({ "llm": { "model": "gemini-2.0-flash-exp" } }))
            .expect("classified");
        assert_eq!(named.data, json!("gemini-2.0-flash-exp"));

        let unnamed = classify(&json!({ "llm": {} })).expect("classified");
        assert_eq!(unnamed.data, json!(FALLBACK_LLM_MODEL));

        let empty = classify(&json!({ "llm": { "model": "" } })).expect("classified");
        assert_eq!(empty.data, json!(FALLBACK_LLM_MODEL));
    }

    #[test]
    fn finalize_answer_has_fixed_description() {
        let processed = classify(&json!({ "finalize_answer": {} })).expect("classified");
        assert_eq!(processed.title, EventTitle::FinalizingAnswer);
        assert_eq!(
            processed.data,
            json!("Composing and presenting the final answer.")
        );
    }

    #[test]
    fn unrecognized_node_maps_to_nothing() {
        assert!(classify(&json!({ "messages": [] })).is_none());
        assert!(classify(&json!({})).is_none());
        assert!(classify(&json!({ "route_mode": {} })).is_none());
    }

    #[test]
    fn titles_serialize_as_display_strings() {
        let processed = classify(&json!({ "self_check": { "feedback": "ok" } }))
            .expect("classified");
        let serialized = serde_json::to_value(&processed).expect("serialize");
        assert_eq!(serialized["title"], json!("Self-Check"));

        let back: ProcessedEvent = serde_json::from_value(serialized).expect("deserialize");
        assert_eq!(back, processed);
    }
}
