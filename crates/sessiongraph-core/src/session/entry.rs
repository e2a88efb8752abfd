//! Session transcript entry model
//!
//! A session file is JSON lines: one header line (`type = "session"`) followed
//! by entries that reference their parent entry, forming a tree.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// First line of a session file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionHeader {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub cwd: String,
    /// Path of the session this one was forked from
    #[serde(default)]
    pub parent_session: Option<String>,
}

impl SessionHeader {
    /// Project name derived from the working directory (its last component)
    pub fn project(&self) -> String {
        Path::new(&self.cwd)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }
}

/// One event in a session transcript
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionEntry {
    pub id: String,
    #[serde(default)]
    pub parent_id: Option<String>,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub kind: EntryKind,
}

/// Entry payload, tagged by the `type` field
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EntryKind {
    Message {
        message: AgentMessage,
    },
    BranchSummary {
        #[serde(rename = "fromId")]
        from_id: String,
        #[serde(default)]
        summary: String,
    },
    Compaction {
        #[serde(default)]
        summary: String,
        #[serde(rename = "tokensBefore", default)]
        tokens_before: u64,
        #[serde(rename = "firstKeptEntryId", default)]
        first_kept_entry_id: Option<String>,
    },
    ModelChange {
        #[serde(default)]
        provider: String,
        #[serde(rename = "modelId")]
        model_id: String,
    },
    ThinkingLevelChange {
        #[serde(rename = "thinkingLevel")]
        thinking_level: String,
    },
    Label {
        #[serde(rename = "targetId")]
        target_id: String,
        #[serde(default)]
        label: Option<String>,
    },
    SessionInfo {
        #[serde(default)]
        name: Option<String>,
    },
}

impl EntryKind {
    /// Get the string representation of the entry type
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Message { .. } => "message",
            Self::BranchSummary { .. } => "branch_summary",
            Self::Compaction { .. } => "compaction",
            Self::ModelChange { .. } => "model_change",
            Self::ThinkingLevelChange { .. } => "thinking_level_change",
            Self::Label { .. } => "label",
            Self::SessionInfo { .. } => "session_info",
        }
    }

    /// Labels and session info annotate the tree but are not part of it
    pub fn is_metadata(&self) -> bool {
        matches!(self, Self::Label { .. } | Self::SessionInfo { .. })
    }
}

impl SessionEntry {
    pub fn is_metadata(&self) -> bool {
        self.kind.is_metadata()
    }

    /// The agent message carried by this entry, if it is a message
    pub fn message(&self) -> Option<&AgentMessage> {
        match &self.kind {
            EntryKind::Message { message } => Some(message),
            _ => None,
        }
    }
}

/// Author of a message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Role {
    User,
    Assistant,
    #[serde(alias = "tool_result", alias = "tool")]
    ToolResult,
}

/// A message exchanged between the user, the agent and its tools
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentMessage {
    pub role: Role,
    #[serde(default)]
    pub content: MessageContent,
    /// Tool that produced a `toolResult` message
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,
    #[serde(default)]
    pub is_error: bool,
    /// Model that produced an assistant message
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

/// Message body: either plain text or a list of blocks
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Blocks(Vec<ContentBlock>),
}

impl Default for MessageContent {
    fn default() -> Self {
        Self::Text(String::new())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ContentBlock {
    Text { text: String },
    Thinking { thinking: String },
    ToolCall(ToolCall),
    /// Images and block types this crate does not interpret
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub arguments: serde_json::Value,
}

impl ToolCall {
    /// File path argument, for tools that operate on a single file
    pub fn path(&self) -> Option<&str> {
        ["path", "file_path", "filePath"]
            .iter()
            .find_map(|key| self.arguments.get(*key).and_then(|v| v.as_str()))
    }
}

impl AgentMessage {
    pub fn is_user(&self) -> bool {
        self.role == Role::User
    }

    pub fn is_assistant(&self) -> bool {
        self.role == Role::Assistant
    }

    pub fn is_tool_result(&self) -> bool {
        self.role == Role::ToolResult
    }

    /// Concatenated text blocks, newline separated
    pub fn text(&self) -> String {
        match &self.content {
            MessageContent::Text(text) => text.clone(),
            MessageContent::Blocks(blocks) => blocks
                .iter()
                .filter_map(|b| match b {
                    ContentBlock::Text { text } => Some(text.as_str()),
                    _ => None,
                })
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }

    pub fn tool_calls(&self) -> Vec<&ToolCall> {
        match &self.content {
            MessageContent::Text(_) => Vec::new(),
            MessageContent::Blocks(blocks) => blocks
                .iter()
                .filter_map(|b| match b {
                    ContentBlock::ToolCall(call) => Some(call),
                    _ => None,
                })
                .collect(),
        }
    }

    pub fn has_text(&self) -> bool {
        !self.text().trim().is_empty()
    }
}
