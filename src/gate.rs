use serde::{Deserialize, Serialize};

/// Decides when a half-streamed reply has matured enough to show. The
/// research backend drafts in English before switching to Vietnamese, so the
/// default policy holds the bubble back until diacritics appear, enough text
/// has arrived, or markdown structure shows up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GatePolicy {
    /// Show every chunk as it arrives.
    Always,
    /// Show once the trimmed text reaches the configured length.
    MinLength,
    #[default]
    Heuristic,
}

const VIETNAMESE_MARKS: &str = "àáảãạăắằẳẵặâấầẩẫậèéẻẽẹêếềểễệìíỉĩịòóỏõọôốồổỗộơớờởỡợùúủũụưứừửữựỳýỷỹỵđÀÁẢÃẠĂẮẰẲẴẶÂẤẦẨẪẬÈÉẺẼẸÊẾỀỂỄỆÌÍỈĨỊÒÓỎÕỌÔỐỒỔỖỘƠỚỜỞỠỢÙÚỦŨỤƯỨỪỬỮỰỲÝỶỸỴĐ";

impl GatePolicy {
    pub fn ready(self, content: &str, min_length: usize) -> bool {
        let trimmed = content.trim();
        match self {
            GatePolicy::Always => true,
            GatePolicy::MinLength => trimmed.chars().count() >= min_length,
            GatePolicy::Heuristic => {
                trimmed.chars().any(|c| VIETNAMESE_MARKS.contains(c))
                    || trimmed.chars().count() >= min_length
                    || has_markdown_structure(content)
            }
        }
    }
}

fn has_markdown_structure(content: &str) -> bool {
    if content.contains("```") {
        return true;
    }
    for (index, line) in content.lines().enumerate() {
        let hashes = line.chars().take_while(|&c| c == '#').count();
        if (1..=6).contains(&hashes)
            && line.chars().nth(hashes).is_some_and(char::is_whitespace)
        {
            return true;
        }
        if index == 0 {
            continue;
        }
        let mut chars = line.chars();
        match chars.next() {
            Some('-') | Some('*') => {
                if chars.next().is_some_and(char::is_whitespace) {
                    return true;
                }
            }
            Some(c) if c.is_ascii_digit() => {
                let digits = line.chars().take_while(char::is_ascii_digit).count();
                let mut rest = line.chars().skip(digits);
                if rest.next() == Some('.') && rest.next().is_some_and(char::is_whitespace) {
                    return true;
                }
            }
            _ => {}
        }
    }
    false
}
