use std::collections::HashMap;

use anyhow::{Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;

use crate::api::AspectRatio;
use crate::transcript::{
    Message, MessageKind, MessageRole, PENDING_IMAGE_ID_PREFIX, RESOLVED_IMAGE_ID_PREFIX,
    USER_IMAGE_ID_PREFIX,
};

pub const IMAGE_PENDING_TEXT: &str = "Đang tạo ảnh...";
pub const IMAGE_EMPTY_TEXT: &str = "Không có ảnh để hiển thị";
pub const IMAGE_FAILED_TEXT: &str = "Tạo/Chỉnh sửa ảnh thất bại. Vui lòng thử lại.";

const PNG_DATA_URL_PREFIX: &str = "data:image/png;base64,";

#[derive(Debug, Clone)]
pub enum ImageTaskOutcome {
    Payload {
        image: Option<String>,
        caption: Option<String>,
    },
    Failed,
}

/// Locally-synthesized chat entries for image operations. Each started task
/// contributes a human request entry plus an AI placeholder that is later
/// rewritten in place when the operation settles.
#[derive(Debug, Default)]
pub struct ImageTaskTracker {
    messages: Vec<Message>,
    prompts: HashMap<String, String>,
}

impl ImageTaskTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn clear(&mut self) {
        self.messages.clear();
        self.prompts.clear();
    }

    pub fn start_task(&mut self, op_id: &str, prompt: &str, aspect_ratio: AspectRatio, edit: bool) {
        self.start_task_at(op_id, prompt, aspect_ratio, edit, now_millis());
    }

    fn start_task_at(
        &mut self,
        op_id: &str,
        prompt: &str,
        aspect_ratio: AspectRatio,
        edit: bool,
        now_ms: i64,
    ) {
        let request = if edit {
            format!("Chỉnh sửa ảnh: {prompt}")
        } else {
            format!("Tạo ảnh: {prompt} ({})", aspect_ratio.as_str())
        };
        self.messages.push(Message {
            id: format!("{USER_IMAGE_ID_PREFIX}{op_id}"),
            role: MessageRole::Human,
            content: request,
            timestamp: Some(now_ms),
            kind: MessageKind::LocalImagePending,
        });
        self.messages.push(Message {
            id: format!("{PENDING_IMAGE_ID_PREFIX}{op_id}"),
            role: MessageRole::Ai,
            content: IMAGE_PENDING_TEXT.to_string(),
            timestamp: Some(now_ms + 1),
            kind: MessageKind::LocalImagePending,
        });
        self.prompts.insert(op_id.to_string(), prompt.to_string());
    }

    /// Rewrites the pending placeholder for `op_id` with the operation's
    /// outcome. Returns false when no placeholder is waiting, so a late or
    /// duplicate completion leaves the thread untouched.
    pub fn complete_task(&mut self, op_id: &str, outcome: ImageTaskOutcome) -> bool {
        let pending_id = format!("{PENDING_IMAGE_ID_PREFIX}{op_id}");
        let Some(entry) = self
            .messages
            .iter_mut()
            .find(|message| message.id == pending_id)
        else {
            return false;
        };

        let prompt = self.prompts.remove(op_id).unwrap_or_default();
        entry.id = format!("{RESOLVED_IMAGE_ID_PREFIX}{op_id}");
        entry.kind = MessageKind::LocalImageResolved;
        entry.content = match outcome {
            ImageTaskOutcome::Payload { image, caption } => {
                render_image_content(&prompt, image.as_deref(), caption.as_deref())
            }
            ImageTaskOutcome::Failed => IMAGE_FAILED_TEXT.to_string(),
        };
        true
    }
}

fn render_image_content(prompt: &str, image: Option<&str>, caption: Option<&str>) -> String {
    match image.map(normalize_image_url) {
        Some(url) => {
            let mut content = format!("![Generated]({url})\n\n**Prompt:** {prompt}");
            if let Some(caption) = caption.filter(|text| !text.trim().is_empty()) {
                content.push_str("\n\n");
                content.push_str(caption);
            }
            content
        }
        None => IMAGE_EMPTY_TEXT.to_string(),
    }
}

/// Accepts a data URL or absolute URL as-is; anything else is treated as a
/// bare base64 payload and wrapped as a PNG data URL.
pub fn normalize_image_url(raw: &str) -> String {
    if raw.starts_with("data:") || raw.starts_with("http://") || raw.starts_with("https://") {
        raw.to_string()
    } else {
        format!("{PNG_DATA_URL_PREFIX}{raw}")
    }
}

/// Extracts the first markdown image URL from resolved content.
pub fn extract_image_url(content: &str) -> Option<&str> {
    let start = content.find("![")?;
    let open = content[start..].find("](")? + start + 2;
    let close = content[open..].find(')')? + open;
    let url = content[open..close].trim();
    (!url.is_empty()).then_some(url)
}

/// Decodes a data URL into raw bytes for saving to disk.
pub fn decode_data_url(url: &str) -> Result<Vec<u8>> {
    let encoded = url
        .split_once("base64,")
        .map(|(_, rest)| rest)
        .context("not a base64 data URL")?;
    BASE64
        .decode(encoded.trim())
        .context("invalid base64 image payload")
}

fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn start_task_appends_request_and_placeholder() {
        let mut tracker = ImageTaskTracker::new();
        tracker.start_task_at("42", "a red car", AspectRatio::Square, false, 1000);

        let messages = tracker.messages();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].id, "user-img-42");
        assert_eq!(messages[0].content, "Tạo ảnh: a red car (1:1)");
        assert_eq!(messages[0].timestamp, Some(1000));
        assert_eq!(messages[1].id, "ai-img-pending-42");
        assert_eq!(messages[1].content, IMAGE_PENDING_TEXT);
        assert_eq!(messages[1].timestamp, Some(1001));
    }

    #[test]
    fn edit_task_uses_edit_verb_without_ratio() {
        let mut tracker = ImageTaskTracker::new();
        tracker.start_task_at("7", "add a hat", AspectRatio::Wide, true, 1000);
        assert_eq!(tracker.messages()[0].content, "Chỉnh sửa ảnh: add a hat");
    }

    #[test]
    fn completion_wraps_bare_base64_and_records_prompt() {
        let mut tracker = ImageTaskTracker::new();
        tracker.start_task_at("42", "a red car", AspectRatio::Square, false, 1000);

        let replaced = tracker.complete_task(
            "42",
            ImageTaskOutcome::Payload {
                image: Some("iVBORw0KG...".to_string()),
                caption: None,
            },
        );

        assert!(replaced);
        assert!(tracker
            .messages()
            .iter()
            .all(|message| message.id != "ai-img-pending-42"));
        let entry = &tracker.messages()[1];
        assert_eq!(entry.id, "ai-img-42");
        assert_eq!(entry.kind, MessageKind::LocalImageResolved);
        assert!(entry
            .content
            .contains("![Generated](data:image/png;base64,iVBORw0KG...)"));
        assert!(entry.content.contains("**Prompt:** a red car"));
    }

    #[test]
    fn completion_keeps_data_url_and_appends_caption() {
        let mut tracker = ImageTaskTracker::new();
        tracker.start_task_at("9", "sunset", AspectRatio::Square, false, 1000);

        tracker.complete_task(
            "9",
            ImageTaskOutcome::Payload {
                image: Some("data:image/webp;base64,AAAA".to_string()),
                caption: Some("A warm sunset".to_string()),
            },
        );

        let content = &tracker.messages()[1].content;
        assert!(content.starts_with("![Generated](data:image/webp;base64,AAAA)"));
        assert!(content.contains("**Prompt:** sunset"));
        assert!(content.ends_with("A warm sunset"));
    }

    #[test]
    fn completion_without_image_reports_empty_text() {
        let mut tracker = ImageTaskTracker::new();
        tracker.start_task_at("3", "nothing", AspectRatio::Square, false, 1000);

        tracker.complete_task(
            "3",
            ImageTaskOutcome::Payload {
                image: None,
                caption: None,
            },
        );
        assert_eq!(tracker.messages()[1].content, IMAGE_EMPTY_TEXT);
    }

    #[test]
    fn failed_completion_reports_failure_text() {
        let mut tracker = ImageTaskTracker::new();
        tracker.start_task_at("5", "a dog", AspectRatio::Square, false, 1000);

        tracker.complete_task("5", ImageTaskOutcome::Failed);
        assert_eq!(tracker.messages()[1].content, IMAGE_FAILED_TEXT);
    }

    #[test]
    fn duplicate_completion_is_ignored() {
        let mut tracker = ImageTaskTracker::new();
        tracker.start_task_at("42", "a red car", AspectRatio::Square, false, 1000);

        assert!(tracker.complete_task(
            "42",
            ImageTaskOutcome::Payload {
                image: Some("AAAA".to_string()),
                caption: None,
            },
        ));
        let settled = tracker.messages()[1].clone();

        assert!(!tracker.complete_task("42", ImageTaskOutcome::Failed));
        assert_eq!(tracker.messages()[1], settled);
    }

    #[test]
    fn completion_for_unknown_op_is_ignored() {
        let mut tracker = ImageTaskTracker::new();
        assert!(!tracker.complete_task("missing", ImageTaskOutcome::Failed));
        assert!(tracker.messages().is_empty());
    }

    #[test]
    fn extracts_url_from_resolved_content() {
        let content = "![Generated](data:image/png;base64,AAAA)\n\n**Prompt:** x";
        assert_eq!(
            extract_image_url(content),
            Some("data:image/png;base64,AAAA")
        );
        assert_eq!(extract_image_url("no image here"), None);
    }

    #[test]
    fn decodes_data_url_payload() {
        let bytes = decode_data_url("data:image/png;base64,aGVsbG8=").unwrap();
        assert_eq!(bytes, b"hello");
        assert!(decode_data_url("https://example.com/x.png").is_err());
    }
}
