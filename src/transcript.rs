use serde::{Deserialize, Serialize};

pub const USER_IMAGE_ID_PREFIX: &str = "user-img-";
pub const PENDING_IMAGE_ID_PREFIX: &str = "ai-img-pending-";
pub const RESOLVED_IMAGE_ID_PREFIX: &str = "ai-img-";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageRole {
    Human,
    Ai,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Remote,
    LocalImagePending,
    LocalImageResolved,
}

impl MessageKind {
    pub fn is_image_task(self) -> bool {
        matches!(
            self,
            MessageKind::LocalImagePending | MessageKind::LocalImageResolved
        )
    }
}

fn default_kind() -> MessageKind {
    MessageKind::Remote
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    #[serde(rename = "type")]
    pub role: MessageRole,
    pub content: String,
    #[serde(default)]
    pub timestamp: Option<i64>,
    #[serde(default = "default_kind")]
    pub kind: MessageKind,
}

impl Message {
    pub fn remote(id: impl Into<String>, role: MessageRole, content: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            role,
            content: content.into(),
            timestamp: None,
            kind: MessageKind::Remote,
        }
    }

    /// Creation-order token used to interleave locally-synthesized messages
    /// with the remote thread. Explicit timestamps win over the numeric id
    /// suffix; anything unparseable sorts first.
    pub fn order_token(&self) -> i64 {
        if let Some(timestamp) = self.timestamp {
            return timestamp;
        }
        self.id
            .rsplit('-')
            .next()
            .and_then(|suffix| suffix.parse::<i64>().ok())
            .unwrap_or(0)
    }
}

/// Produces the render-ready transcript from the remote chat thread and the
/// locally-synthesized image-task thread.
///
/// While the stream is loading, a trailing AI entry in the remote thread is
/// suppressed so a half-streamed bubble never flickers into the transcript.
/// Consecutive remote AI entries are compressed into one, keeping the longer
/// content and the most recent non-empty id. Remote entries keep their
/// relative order; image-task entries slot in by creation token.
pub fn merge_transcript(remote: &[Message], local: &[Message], loading: bool) -> Vec<Message> {
    let mut working: Vec<Message> = remote.to_vec();
    if loading {
        if working
            .last()
            .is_some_and(|message| message.role == MessageRole::Ai)
        {
            working.pop();
        }
    }

    let mut compressed: Vec<Message> = Vec::with_capacity(working.len());
    for message in working {
        match compressed.last_mut() {
            Some(previous)
                if previous.role == MessageRole::Ai && message.role == MessageRole::Ai =>
            {
                if message.content.len() > previous.content.len() {
                    previous.content = message.content;
                }
                if !message.id.is_empty() {
                    previous.id = message.id;
                }
            }
            _ => compressed.push(message),
        }
    }

    let remote_tokens: Vec<i64> = compressed.iter().map(Message::order_token).collect();
    let slot_for_token = |token: i64| -> usize {
        remote_tokens
            .iter()
            .position(|&remote_token| remote_token > token)
            .unwrap_or(remote_tokens.len())
    };

    // Composite key: (slot, class, token, arrival). Remote entries occupy
    // their own slot with class 1; an image entry lands in the slot of the
    // first remote entry whose token exceeds its own, with class 0 so it
    // sorts just before that entry. The key is a total order, so the merge
    // is deterministic for fixed inputs.
    let mut decorated: Vec<((usize, u8, i64, usize), Message)> =
        Vec::with_capacity(compressed.len() + local.len());
    for (index, message) in compressed.into_iter().enumerate() {
        decorated.push(((index, 1, 0, index), message));
    }
    for (index, message) in local.iter().enumerate() {
        let token = message.order_token();
        decorated.push(((slot_for_token(token), 0, token, index), message.clone()));
    }

    decorated.sort_by(|a, b| a.0.cmp(&b.0));
    decorated.into_iter().map(|(_, message)| message).collect()
}
