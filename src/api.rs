use anyhow::{bail, Context, Result};
use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use reqwest::multipart;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

use crate::config::ClientConfig;
use crate::transcript::{Message, MessageRole};

/// Minimum classifier confidence for routing a prompt to image generation.
pub const IMAGE_INTENT_THRESHOLD: f32 = 0.5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EffortLevel {
    Low,
    #[default]
    Medium,
    High,
}

impl EffortLevel {
    /// Maps effort to (initial_search_query_count, max_research_loops).
    pub fn search_parameters(self) -> (u32, u32) {
        match self {
            EffortLevel::Low => (1, 1),
            EffortLevel::Medium => (2, 1),
            EffortLevel::High => (3, 3),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            EffortLevel::Low => "low",
            EffortLevel::Medium => "medium",
            EffortLevel::High => "high",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum AspectRatio {
    #[default]
    #[serde(rename = "1:1")]
    Square,
    #[serde(rename = "16:9")]
    Wide,
    #[serde(rename = "9:16")]
    Tall,
    #[serde(rename = "4:3")]
    Classic,
    #[serde(rename = "3:4")]
    ClassicPortrait,
    #[serde(rename = "3:2")]
    Photo,
    #[serde(rename = "2:3")]
    PhotoPortrait,
}

impl AspectRatio {
    pub fn as_str(self) -> &'static str {
        match self {
            AspectRatio::Square => "1:1",
            AspectRatio::Wide => "16:9",
            AspectRatio::Tall => "9:16",
            AspectRatio::Classic => "4:3",
            AspectRatio::ClassicPortrait => "3:4",
            AspectRatio::Photo => "3:2",
            AspectRatio::PhotoPortrait => "2:3",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim() {
            "1:1" => Some(AspectRatio::Square),
            "16:9" => Some(AspectRatio::Wide),
            "9:16" => Some(AspectRatio::Tall),
            "4:3" => Some(AspectRatio::Classic),
            "3:4" => Some(AspectRatio::ClassicPortrait),
            "3:2" => Some(AspectRatio::Photo),
            "2:3" => Some(AspectRatio::PhotoPortrait),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunMessage {
    #[serde(rename = "type")]
    pub role: MessageRole,
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
}

impl From<&Message> for RunMessage {
    fn from(message: &Message) -> Self {
        Self {
            role: message.role,
            content: message.content.clone(),
            id: Some(message.id.clone()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunRequest {
    pub messages: Vec<RunMessage>,
    pub initial_search_query_count: u32,
    pub max_research_loops: u32,
    pub reasoning_model: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ImageResponse {
    #[serde(default)]
    pub data_url: Option<String>,
    #[serde(default)]
    pub mime_type: Option<String>,
    #[serde(default)]
    pub caption: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IntentKind {
    Create,
    #[serde(alias = "ask")]
    Chat,
}

#[derive(Debug, Clone, Deserialize)]
pub struct IntentResponse {
    pub intent: IntentKind,
    #[serde(default)]
    pub confidence: f32,
    #[serde(default)]
    pub keywords: Vec<String>,
    #[serde(default)]
    pub model: Option<String>,
}

impl IntentResponse {
    /// Conservative fallback when the classifier is unreachable.
    pub fn fallback() -> Self {
        Self {
            intent: IntentKind::Chat,
            confidence: 0.0,
            keywords: Vec::new(),
            model: None,
        }
    }

    pub fn wants_image(&self) -> bool {
        self.intent == IntentKind::Create && self.confidence >= IMAGE_INTENT_THRESHOLD
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PreviewMetadata {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub image: Option<String>,
}

#[derive(Clone)]
pub struct ApiClient {
    http: reqwest::Client,
    base_url: String,
    request_timeout: Duration,
}

impl ApiClient {
    pub fn from_config(config: &ClientConfig) -> Self {
        Self::new(
            config.base_url.clone(),
            Duration::from_secs(config.request_timeout_secs),
        )
    }

    pub fn from_env() -> Self {
        Self::from_config(&ClientConfig::from_env())
    }

    pub fn new(base_url: String, request_timeout: Duration) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: normalize_base_url(&base_url),
            request_timeout,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Opens the research run stream. The connection stays up for the whole
    /// turn, so no request timeout is applied here.
    pub async fn start_run(&self, request: &RunRequest) -> Result<RunEventStream> {
        let response = self
            .http
            .post(self.endpoint("/runs/stream"))
            .json(request)
            .send()
            .await
            .context("POST /runs/stream failed")?
            .error_for_status()
            .context("POST /runs/stream rejected")?;

        Ok(RunEventStream::from_response(response))
    }

    pub async fn generate_image(
        &self,
        prompt: &str,
        aspect_ratio: AspectRatio,
    ) -> Result<ImageResponse> {
        #[derive(Serialize)]
        struct GenerateImageRequest<'a> {
            prompt: &'a str,
            aspect_ratio: &'a str,
        }

        let response = self
            .http
            .post(self.endpoint("/api/image/generate"))
            .timeout(self.request_timeout)
            .json(&GenerateImageRequest {
                prompt,
                aspect_ratio: aspect_ratio.as_str(),
            })
            .send()
            .await
            .context("POST /api/image/generate failed")?;

        decode_image_response(response, "/api/image/generate").await
    }

    pub async fn edit_image(
        &self,
        prompt: &str,
        aspect_ratio: AspectRatio,
        file_name: &str,
        file_bytes: Vec<u8>,
    ) -> Result<ImageResponse> {
        let form = multipart::Form::new()
            .text("prompt", prompt.to_string())
            .text("aspect_ratio", aspect_ratio.as_str())
            .part(
                "file",
                multipart::Part::bytes(file_bytes).file_name(file_name.to_string()),
            );

        let response = self
            .http
            .post(self.endpoint("/api/image/edit"))
            .timeout(self.request_timeout)
            .multipart(form)
            .send()
            .await
            .context("POST /api/image/edit failed")?;

        decode_image_response(response, "/api/image/edit").await
    }

    pub async fn classify_intent(&self, user_input: &str) -> Result<IntentResponse> {
        #[derive(Serialize)]
        struct IntentRequest<'a> {
            user_input: &'a str,
        }

        self.http
            .post(self.endpoint("/api/intent/image"))
            .timeout(self.request_timeout)
            .json(&IntentRequest { user_input })
            .send()
            .await
            .context("POST /api/intent/image failed")?
            .error_for_status()
            .context("POST /api/intent/image rejected")?
            .json::<IntentResponse>()
            .await
            .context("Failed to decode intent response")
    }

    /// Fetches OpenGraph metadata for a source link. Returns None for blank
    /// URLs and for pages without enough metadata to render a card.
    pub async fn preview_metadata(&self, url: &str) -> Result<Option<PreviewMetadata>> {
        if url.trim().is_empty() {
            return Ok(None);
        }

        let preview = self
            .http
            .get(self.endpoint("/api/preview"))
            .timeout(self.request_timeout)
            .query(&[("url", url)])
            .send()
            .await
            .context("GET /api/preview failed")?
            .error_for_status()
            .context("GET /api/preview rejected")?
            .json::<PreviewMetadata>()
            .await
            .context("Failed to decode preview response")?;

        if preview.title.is_none() && preview.image.is_none() {
            return Ok(None);
        }
        Ok(Some(preview))
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }
}

async fn decode_image_response(response: reqwest::Response, path: &str) -> Result<ImageResponse> {
    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        bail!("POST {path} returned {status}: {}", error_detail(&body));
    }

    response
        .json::<ImageResponse>()
        .await
        .with_context(|| format!("Failed to decode response from {path}"))
}

/// Image endpoints report failures as JSON with a `detail` field; fall back
/// to a raw body preview when that shape is missing.
fn error_detail(body: &str) -> String {
    #[derive(Deserialize)]
    struct ErrorBody {
        detail: String,
    }

    if let Ok(parsed) = serde_json::from_str::<ErrorBody>(body) {
        return parsed.detail;
    }
    body.chars().take(200).collect()
}

fn normalize_base_url(raw: &str) -> String {
    let trimmed = raw.trim().trim_end_matches('/');
    if trimmed.is_empty() {
        "http://localhost:8123".to_string()
    } else {
        trimmed.to_string()
    }
}

/// Server-sent event stream of run updates. Each event is one `data:` line
/// holding a JSON object keyed by graph-node name; the stream closes after a
/// `[DONE]` sentinel or when the connection ends.
pub struct RunEventStream {
    chunks: BoxStream<'static, reqwest::Result<Vec<u8>>>,
    buffer: String,
    done: bool,
}

impl RunEventStream {
    fn from_response(response: reqwest::Response) -> Self {
        let chunks = response
            .bytes_stream()
            .map(|chunk| chunk.map(|bytes| bytes.to_vec()))
            .boxed();
        Self {
            chunks,
            buffer: String::new(),
            done: false,
        }
    }

    #[cfg(test)]
    fn from_chunks(chunks: Vec<reqwest::Result<Vec<u8>>>) -> Self {
        Self {
            chunks: futures_util::stream::iter(chunks).boxed(),
            buffer: String::new(),
            done: false,
        }
    }

    pub async fn next_event(&mut self) -> Result<Option<Value>> {
        loop {
            if self.done {
                return Ok(None);
            }

            while let Some(line_end) = self.buffer.find('\n') {
                let line = self.buffer[..line_end].trim().to_string();
                self.buffer.drain(..=line_end);
                if let Some(event) = self.decode_line(&line)? {
                    return Ok(Some(event));
                }
                if self.done {
                    return Ok(None);
                }
            }

            match self.chunks.next().await {
                Some(chunk) => {
                    let chunk = chunk.context("Run stream read failed")?;
                    self.buffer.push_str(&String::from_utf8_lossy(&chunk));
                }
                None => {
                    self.done = true;
                    let line = std::mem::take(&mut self.buffer);
                    return self.decode_line(line.trim());
                }
            }
        }
    }

    fn decode_line(&mut self, line: &str) -> Result<Option<Value>> {
        let Some(data) = line.strip_prefix("data:") else {
            return Ok(None);
        };
        let data = data.trim();
        if data.is_empty() {
            return Ok(None);
        }
        if data == "[DONE]" {
            self.done = true;
            return Ok(None);
        }

        serde_json::from_str::<Value>(data).map(Some).with_context(|| {
            format!(
                "Failed to decode stream event. Payload preview: {}",
                data.chars().take(200).collect::<String>()
            )
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn effort_maps_to_search_parameters() {
        assert_eq!(EffortLevel::Low.search_parameters(), (1, 1));
        assert_eq!(EffortLevel::Medium.search_parameters(), (2, 1));
        assert_eq!(EffortLevel::High.search_parameters(), (3, 3));
    }

    #[test]
    fn aspect_ratio_parses_known_values() {
        assert_eq!(AspectRatio::parse("16:9"), Some(AspectRatio::Wide));
        assert_eq!(AspectRatio::parse(" 1:1 "), Some(AspectRatio::Square));
        assert_eq!(AspectRatio::parse("5:4"), None);
        assert_eq!(AspectRatio::default().as_str(), "1:1");
    }

    #[test]
    fn run_request_serializes_flat_payload() {
        let request = RunRequest {
            messages: vec![RunMessage {
                role: MessageRole::Human,
                content: "Giải thích về AI".to_string(),
                id: Some("1000".to_string()),
            }],
            initial_search_query_count: 1,
            max_research_loops: 1,
            reasoning_model: "gemini-2.0-flash-exp".to_string(),
        };

        let value = serde_json::to_value(&request).unwrap();
        assert_eq!(
            value,
            json!({
                "messages": [{"type": "human", "content": "Giải thích về AI", "id": "1000"}],
                "initial_search_query_count": 1,
                "max_research_loops": 1,
                "reasoning_model": "gemini-2.0-flash-exp"
            })
        );
    }

    #[test]
    fn intent_response_accepts_ask_alias() {
        let parsed: IntentResponse =
            serde_json::from_value(json!({"intent": "ask", "confidence": 0.9})).unwrap();
        assert_eq!(parsed.intent, IntentKind::Chat);
        assert!(!parsed.wants_image());

        let parsed: IntentResponse =
            serde_json::from_value(json!({"intent": "create", "confidence": 0.62})).unwrap();
        assert!(parsed.wants_image());

        let parsed: IntentResponse =
            serde_json::from_value(json!({"intent": "create", "confidence": 0.4})).unwrap();
        assert!(!parsed.wants_image());
    }

    #[test]
    fn error_detail_prefers_detail_field() {
        assert_eq!(error_detail(r#"{"detail": "quota exceeded"}"#), "quota exceeded");
        assert_eq!(error_detail("plain failure"), "plain failure");
    }

    #[test]
    fn normalizes_base_url() {
        assert_eq!(normalize_base_url("http://x:1/"), "http://x:1");
        assert_eq!(normalize_base_url(""), "http://localhost:8123");
    }

    #[tokio::test]
    async fn stream_yields_events_across_chunk_boundaries() {
        let mut stream = RunEventStream::from_chunks(vec![
            Ok(b"data: {\"generate_query\"".to_vec()),
            Ok(b": {\"search_query\": [\"AI\"]}}\n".to_vec()),
            Ok(b"data: [DONE]\n".to_vec()),
        ]);

        let event = stream.next_event().await.unwrap().unwrap();
        assert_eq!(event["generate_query"]["search_query"][0], "AI");
        assert!(stream.next_event().await.unwrap().is_none());
        assert!(stream.next_event().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn stream_skips_non_data_lines() {
        let mut stream = RunEventStream::from_chunks(vec![Ok(
            b"event: update\n: heartbeat\n\ndata: {\"x\": 2}\n".to_vec(),
        )]);

        let event = stream.next_event().await.unwrap().unwrap();
        assert_eq!(event["x"], 2);
        assert!(stream.next_event().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn stream_flushes_unterminated_final_line() {
        let mut stream = RunEventStream::from_chunks(vec![Ok(b"data: {\"y\": 3}".to_vec())]);

        let event = stream.next_event().await.unwrap().unwrap();
        assert_eq!(event["y"], 3);
        assert!(stream.next_event().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn stream_stops_at_done_sentinel() {
        let mut stream = RunEventStream::from_chunks(vec![Ok(
            b"data: [DONE]\ndata: {\"z\": 4}\n".to_vec()
        )]);

        assert!(stream.next_event().await.unwrap().is_none());
        assert!(stream.next_event().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn stream_reports_malformed_event_payload() {
        let mut stream =
            RunEventStream::from_chunks(vec![Ok(b"data: {not json}\n".to_vec())]);

        let error = stream.next_event().await.unwrap_err();
        assert!(error.to_string().contains("Payload preview"));
    }
}
