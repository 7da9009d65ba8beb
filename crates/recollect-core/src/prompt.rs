//! Prompt assembly for grounded answers.
//!
//! Builds the single prompt string sent to the generative model: persona
//! preamble, capped document summary, retrieved passages, a window of recent
//! conversation turns, and the latest user message as the instruction target.
//!
//! All user-derived content is escaped before it enters the prompt so that
//! markdown control characters in captured pages cannot act as formatting or
//! link instructions downstream. This is an injection mitigation, not
//! cosmetics.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Hard cap on turns accepted per request.
pub const MAX_TURNS: usize = 30;
/// Hard cap on characters per turn.
pub const MAX_TURN_CHARS: usize = 10_000;

/// Characters with meaning in the downstream markdown renderer.
const ESCAPED: &[char] = &[
    '*', '_', '[', ']', '(', ')', '~', '`', '>', '#', '+', '=', '|', '{', '}', '.', '!', '-',
];

/// One message in the conversation supplied by the caller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationTurn {
    pub role: TurnRole,
    pub content: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TurnRole {
    User,
    Assistant,
    System,
}

impl TurnRole {
    fn label(self) -> &'static str {
        match self {
            TurnRole::User => "USER",
            TurnRole::Assistant => "ASSISTANT",
            TurnRole::System => "SYSTEM",
        }
    }
}

#[derive(Debug, Error)]
pub enum TurnValidationError {
    #[error("conversation has {count} turns, maximum is {MAX_TURNS}")]
    TooManyTurns { count: usize },
    #[error("turn {index} has {chars} characters, maximum is {MAX_TURN_CHARS}")]
    TurnTooLong { index: usize, chars: usize },
}

/// Validate caller-supplied turns before any network work happens.
pub fn validate_turns(turns: &[ConversationTurn]) -> Result<(), TurnValidationError> {
    if turns.len() > MAX_TURNS {
        return Err(TurnValidationError::TooManyTurns { count: turns.len() });
    }
    for (index, turn) in turns.iter().enumerate() {
        let chars = turn.content.chars().count();
        if chars > MAX_TURN_CHARS {
            return Err(TurnValidationError::TurnTooLong { index, chars });
        }
    }
    Ok(())
}

/// The most recent user turn, which drives retrieval.
pub fn latest_user_turn(turns: &[ConversationTurn]) -> Option<&ConversationTurn> {
    turns.iter().rev().find(|t| t.role == TurnRole::User)
}

/// Backslash-escape markdown control characters in untrusted text.
///
/// Link syntax `[text](url)` is first rewritten to `[text](<url>)` so the
/// URL cannot auto-link even if an escape is stripped later.
pub fn escape_markdown(text: &str) -> String {
    let text = neutralize_links(text);
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        if ESCAPED.contains(&c) {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

/// Rewrite `[text](url)` into `[text](<url>)`.
fn neutralize_links(text: &str) -> String {
    let bytes = text.as_bytes();
    let mut out = String::with_capacity(text.len());
    let mut i = 0;

    while i < bytes.len() {
        if bytes[i] == b'[' {
            if let Some(rewritten) = match_link(&text[i..]) {
                out.push_str(&rewritten.text);
                i += rewritten.consumed;
                continue;
            }
        }
        // Safe: we only land on char boundaries ('[' is single-byte ASCII).
        let c = text[i..].chars().next().unwrap();
        out.push(c);
        i += c.len_utf8();
    }
    out
}

struct RewrittenLink {
    text: String,
    consumed: usize,
}

/// Match a `[label](url)` at the start of `s`, without nesting.
fn match_link(s: &str) -> Option<RewrittenLink> {
    let close = s.find(']')?;
    let rest = &s[close + 1..];
    if !rest.starts_with('(') {
        return None;
    }
    let url_end = rest.find(')')?;
    let label = &s[1..close];
    let url = &rest[1..url_end];
    if label.contains('[') || url.contains('(') {
        return None;
    }
    Some(RewrittenLink {
        text: format!("[{label}](<{url}>)"),
        consumed: close + 1 + url_end + 1,
    })
}

/// Truncate to at most `max_chars` characters on a char boundary.
fn truncate_chars(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((byte_index, _)) => &text[..byte_index],
        None => text,
    }
}

/// Inputs for one prompt.
pub struct PromptInputs<'a> {
    pub user_name: &'a str,
    pub document_summary: &'a str,
    pub turns: &'a [ConversationTurn],
    pub retrieved_context: &'a str,
}

/// Assemble the full prompt string.
///
/// `summary_max_chars` caps the summary block; `window` is how many of the
/// most recent turns are rendered. The latest user message is repeated
/// verbatim at the end as the explicit instruction target.
pub fn build_prompt(inputs: &PromptInputs<'_>, summary_max_chars: usize, window: usize) -> String {
    let mut prompt = String::new();

    prompt.push_str(&format!(
        "You are Recollect, a reading assistant helping {} with a document they saved. \
         Answer using only the document summary and passages below. \
         If they do not contain the answer, say you could not find it in this document. \
         Be concise and conversational.\n\n",
        inputs.user_name
    ));

    prompt.push_str("DOCUMENT SUMMARY:\n");
    prompt.push_str(&escape_markdown(truncate_chars(
        inputs.document_summary,
        summary_max_chars,
    )));
    prompt.push_str("\n\n");

    prompt.push_str("RELEVANT PASSAGES:\n");
    prompt.push_str(&escape_markdown(inputs.retrieved_context));
    prompt.push_str("\n\n");

    prompt.push_str("CONVERSATION SO FAR:\n");
    let start = inputs.turns.len().saturating_sub(window);
    for turn in &inputs.turns[start..] {
        prompt.push_str(turn.role.label());
        prompt.push_str(": ");
        prompt.push_str(&escape_markdown(&turn.content));
        prompt.push('\n');
    }

    if let Some(latest) = latest_user_turn(inputs.turns) {
        prompt.push_str(&format!(
            "\nRespond to the latest message from {}: {}",
            inputs.user_name, latest.content
        ));
    }

    prompt
}

#[cfg(test)]
mod tests {
    use super::*;

    fn turn(role: TurnRole, content: &str) -> ConversationTurn {
        ConversationTurn {
            role,
            content: content.to_string(),
        }
    }

    #[test]
    fn bold_markup_is_escaped() {
        assert_eq!(escape_markdown("*bold*"), "\\*bold\\*");
    }

    #[test]
    fn links_are_bracketed_and_escaped() {
        let escaped = escape_markdown("see [link](http://x) now");
        assert!(escaped.contains("<http://x>"), "got: {escaped}");
        assert!(escaped.contains("\\[link\\]"), "got: {escaped}");
        // No live markdown link survives.
        assert!(!escaped.contains("[link]("), "got: {escaped}");
    }

    #[test]
    fn plain_brackets_without_url_are_just_escaped() {
        assert_eq!(escape_markdown("[note]"), "\\[note\\]");
    }

    #[test]
    fn punctuation_set_is_escaped() {
        let escaped = escape_markdown("a.b!c-d#e");
        assert_eq!(escaped, "a\\.b\\!c\\-d\\#e");
    }

    #[test]
    fn summary_is_capped_and_escaped_in_prompt() {
        let summary = format!("*{}*", "s".repeat(3000));
        let prompt = build_prompt(
            &PromptInputs {
                user_name: "Ada",
                document_summary: &summary,
                turns: &[turn(TurnRole::User, "hi")],
                retrieved_context: "ctx",
            },
            1500,
            6,
        );
        assert!(prompt.contains("\\*"));
        // Capped before escaping: the closing '*' is gone.
        let summary_block = prompt
            .split("DOCUMENT SUMMARY:\n")
            .nth(1)
            .unwrap()
            .split("\n\n")
            .next()
            .unwrap();
        assert!(summary_block.chars().count() <= 1500 * 2); // escapes double at most
        assert!(!summary_block.ends_with("\\*"));
    }

    #[test]
    fn only_last_window_turns_are_rendered() {
        let turns: Vec<ConversationTurn> = (0..10)
            .map(|i| turn(TurnRole::User, &format!("message-{i}")))
            .collect();
        let prompt = build_prompt(
            &PromptInputs {
                user_name: "Ada",
                document_summary: "sum",
                turns: &turns,
                retrieved_context: "ctx",
            },
            1500,
            6,
        );
        assert!(!prompt.contains("USER: message\\-3\n"));
        assert!(prompt.contains("message\\-4"));
        assert!(prompt.contains("message\\-9"));
    }

    #[test]
    fn latest_user_message_is_the_instruction_target() {
        let turns = vec![
            turn(TurnRole::User, "first question"),
            turn(TurnRole::Assistant, "an answer"),
            turn(TurnRole::User, "second question"),
        ];
        let prompt = build_prompt(
            &PromptInputs {
                user_name: "Ada",
                document_summary: "sum",
                turns: &turns,
                retrieved_context: "ctx",
            },
            1500,
            6,
        );
        assert!(prompt.ends_with("Respond to the latest message from Ada: second question"));
    }

    #[test]
    fn turn_roles_render_as_labels() {
        let turns = vec![
            turn(TurnRole::System, "be brief"),
            turn(TurnRole::User, "q"),
            turn(TurnRole::Assistant, "a"),
        ];
        let prompt = build_prompt(
            &PromptInputs {
                user_name: "Ada",
                document_summary: "",
                turns: &turns,
                retrieved_context: "",
            },
            1500,
            6,
        );
        assert!(prompt.contains("SYSTEM: be brief\n"));
        assert!(prompt.contains("USER: q\n"));
        assert!(prompt.contains("ASSISTANT: a\n"));
    }

    #[test]
    fn validation_limits() {
        let too_many: Vec<ConversationTurn> =
            (0..31).map(|_| turn(TurnRole::User, "x")).collect();
        assert!(matches!(
            validate_turns(&too_many),
            Err(TurnValidationError::TooManyTurns { count: 31 })
        ));

        let too_long = vec![turn(TurnRole::User, &"y".repeat(10_001))];
        assert!(matches!(
            validate_turns(&too_long),
            Err(TurnValidationError::TurnTooLong { index: 0, .. })
        ));

        assert!(validate_turns(&[turn(TurnRole::User, "fine")]).is_ok());
    }

    #[test]
    fn latest_user_turn_skips_assistant_tail() {
        let turns = vec![
            turn(TurnRole::User, "question"),
            turn(TurnRole::Assistant, "answer"),
        ];
        assert_eq!(latest_user_turn(&turns).unwrap().content, "question");
        assert!(latest_user_turn(&[]).is_none());
    }
}
