//! Conversation log for the repair loop.
//!
//! The log is owned and append-only between truncations, and it maintains one
//! structural invariant throughout: an assistant message carrying N tool
//! calls is always followed by exactly N tool messages, one per call, in call
//! order, before any other message. Appends go through constructors that
//! accept the assistant turn together with its replies, and both truncation
//! passes re-establish the invariant before the log is sent back to a
//! provider.

use crate::providers::ToolCall;
use crate::util::{head_chars, tail_chars};
use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};

/// Single tool response produced by the runtime for one tool call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolReply {
    pub call_id: String,
    pub name: String,
    pub content: String,
}

/// One conversation message.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "role", rename_all = "snake_case")]
pub enum Message {
    System {
        content: String,
    },
    User {
        content: String,
    },
    Assistant {
        content: String,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        tool_calls: Vec<ToolCall>,
    },
    Tool {
        call_id: String,
        name: String,
        content: String,
    },
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Message::System {
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Message::User {
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Message::Assistant {
            content: content.into(),
            tool_calls: Vec::new(),
        }
    }

    pub fn is_system(&self) -> bool {
        matches!(self, Message::System { .. })
    }

    pub fn is_tool(&self) -> bool {
        matches!(self, Message::Tool { .. })
    }

    /// Tool-call count for assistant messages, 0 otherwise.
    fn tool_call_count(&self) -> usize {
        match self {
            Message::Assistant { tool_calls, .. } => tool_calls.len(),
            _ => 0,
        }
    }

    pub fn user_content(&self) -> Option<&str> {
        match self {
            Message::User { content } => Some(content),
            _ => None,
        }
    }
}

/// Single tool response larger than this is rewritten to head + tail.
const TOOL_CONTENT_CAP: usize = 10_000;
const TOOL_CONTENT_HEAD: usize = 5_000;
const TOOL_CONTENT_TAIL: usize = 500;

/// Conversation cap: prune once the list grows past this many messages.
const MAX_MESSAGES: usize = 30;
const KEEP_FIRST: usize = 3;
const KEEP_LAST: usize = 15;

/// Cap one tool response body. Oversized content keeps the first 5000 and
/// last 500 characters around a truncation marker.
pub fn cap_tool_content(content: &str) -> String {
    if content.chars().count() <= TOOL_CONTENT_CAP {
        return content.to_string();
    }
    format!(
        "{}\n\n[... truncated ...]\n\n{}",
        head_chars(content, TOOL_CONTENT_HEAD),
        tail_chars(content, TOOL_CONTENT_TAIL)
    )
}

/// Ordered, append-only message log. Cloning is cheap enough for the patch
/// phase to fork its own copy of the localization history.
#[derive(Debug, Clone, Default)]
pub struct Conversation {
    messages: Vec<Message>,
}

impl Conversation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_system(system_prompt: impl Into<String>) -> Self {
        let mut conv = Self::new();
        conv.messages.push(Message::system(system_prompt));
        conv
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn as_slice(&self) -> &[Message] {
        &self.messages
    }

    pub fn last(&self) -> Option<&Message> {
        self.messages.last()
    }

    pub fn push_user(&mut self, content: impl Into<String>) {
        self.messages.push(Message::user(content));
    }

    pub fn push_assistant(&mut self, content: impl Into<String>) {
        self.messages.push(Message::assistant(content));
    }

    /// Atomically append an assistant turn with tool calls and its replies.
    /// Rejects the append when replies do not line up one-to-one, in call
    /// order, with the calls.
    pub fn push_tool_exchange(
        &mut self,
        assistant_content: impl Into<String>,
        tool_calls: Vec<ToolCall>,
        replies: Vec<ToolReply>,
    ) -> Result<()> {
        if tool_calls.is_empty() {
            bail!("tool exchange requires at least one tool call");
        }
        if replies.len() != tool_calls.len() {
            bail!(
                "tool exchange mismatch: {} calls but {} replies",
                tool_calls.len(),
                replies.len()
            );
        }
        for (call, reply) in tool_calls.iter().zip(&replies) {
            if call.id != reply.call_id {
                bail!(
                    "tool exchange out of order: call id {} answered by {}",
                    call.id,
                    reply.call_id
                );
            }
        }
        self.messages.push(Message::Assistant {
            content: assistant_content.into(),
            tool_calls,
        });
        for reply in replies {
            self.messages.push(Message::Tool {
                call_id: reply.call_id,
                name: reply.name,
                content: cap_tool_content(&reply.content),
            });
        }
        Ok(())
    }

    /// Remove user messages matching `predicate` (used to keep exactly one
    /// `PATCH_FAIL_SUMMARY` in the patch history).
    pub fn retain_user(&mut self, mut predicate: impl FnMut(&str) -> bool) {
        self.messages.retain(|m| match m {
            Message::User { content } => predicate(content),
            _ => true,
        });
    }

    /// Prune the history once it exceeds the message cap.
    ///
    /// Preserves all system messages plus the first [`KEEP_FIRST`] and last
    /// [`KEEP_LAST`] non-system messages. The cut point moves left past any
    /// assistant whose tool replies would straddle the boundary, and a final
    /// pass drops any assistant/tool group the cut still left incomplete.
    pub fn truncate_if_needed(&mut self) -> bool {
        if self.messages.len() <= MAX_MESSAGES {
            return false;
        }

        let system: Vec<Message> = self
            .messages
            .iter()
            .filter(|m| m.is_system())
            .cloned()
            .collect();
        let other: Vec<Message> = self
            .messages
            .iter()
            .filter(|m| !m.is_system())
            .cloned()
            .collect();

        let mut kept = if other.len() > KEEP_FIRST + KEEP_LAST {
            let mut cut = other.len() - KEEP_LAST;
            // Never cut between an assistant and its tool replies: walk left
            // and move the cut in front of any assistant whose replies reach
            // into the kept range.
            for i in (KEEP_FIRST..cut).rev() {
                let calls = other[i].tool_call_count();
                if calls > 0 {
                    let replies_after = other[i + 1..]
                        .iter()
                        .take_while(|m| m.is_tool())
                        .count();
                    if replies_after > 0 && i + replies_after >= cut {
                        cut = i;
                        break;
                    }
                }
            }
            let mut kept = other[..KEEP_FIRST].to_vec();
            kept.extend_from_slice(&other[cut..]);
            kept
        } else {
            other
        };

        remove_incomplete_exchanges(&mut kept);

        let total = system.len() + kept.len();
        tracing::debug!(kept = total, "conversation truncated");
        let mut rebuilt = system;
        rebuilt.extend(kept);
        self.messages = rebuilt;
        true
    }

    /// True when every assistant with N tool calls is followed by exactly N
    /// tool messages before any other message. Exposed for tests and debug
    /// assertions.
    pub fn tool_sequences_complete(&self) -> bool {
        let mut i = 0;
        while i < self.messages.len() {
            let calls = self.messages[i].tool_call_count();
            if calls > 0 {
                let replies = self.messages[i + 1..]
                    .iter()
                    .take_while(|m| m.is_tool())
                    .count();
                if replies != calls {
                    return false;
                }
                i += 1 + calls;
            } else {
                if self.messages[i].is_tool() {
                    // Orphan tool message.
                    return false;
                }
                i += 1;
            }
        }
        true
    }
}

/// Drop every assistant-with-tool-calls whose replies the cut left
/// incomplete, together with those replies. Indices stay valid because
/// removal runs back-to-front.
fn remove_incomplete_exchanges(messages: &mut Vec<Message>) {
    let mut broken: Vec<usize> = Vec::new();
    for (i, msg) in messages.iter().enumerate() {
        let calls = msg.tool_call_count();
        if calls > 0 {
            let replies = messages[i + 1..].iter().take_while(|m| m.is_tool()).count();
            if replies < calls {
                broken.push(i);
            }
        }
    }
    for idx in broken.into_iter().rev() {
        let mut end = idx + 1;
        while end < messages.len() && messages[end].is_tool() {
            end += 1;
        }
        tracing::warn!(index = idx, "dropping incomplete tool-call exchange");
        messages.drain(idx..end);
    }
    // Leading tool messages whose assistant fell on the far side of the cut.
    while messages.first().is_some_and(Message::is_tool) {
        messages.remove(0);
    }
}
