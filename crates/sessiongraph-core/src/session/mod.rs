//! Session transcripts
//!
//! Entry model for coding-agent session files and a tolerant JSONL parser.

mod entry;
mod parser;

pub use entry::{
    AgentMessage, ContentBlock, EntryKind, MessageContent, Role, SessionEntry, SessionHeader,
    ToolCall,
};
pub use parser::{parse_session_file, parse_session_str, SessionFile};
