//! Write-only log of the conversation each agent has during a run.

use std::io::{self, Write};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::EntityId;

/// Who produced a transcript message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// One message exchanged with one agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TranscriptEntry {
    pub environment: String,
    pub run_id: Uuid,
    pub episode: usize,
    pub agent_id: EntityId,
    pub role: Role,
    pub content: String,
}

/// Receives transcript entries. The scheduler never reads them back.
pub trait TranscriptSink {
    fn record(&mut self, entry: &TranscriptEntry) -> io::Result<()>;
}

/// Discards everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullTranscript;

impl TranscriptSink for NullTranscript {
    fn record(&mut self, _entry: &TranscriptEntry) -> io::Result<()> {
        Ok(())
    }
}

/// Keeps entries in memory.
#[derive(Debug, Clone, Default)]
pub struct MemoryTranscript {
    pub entries: Vec<TranscriptEntry>,
}

impl MemoryTranscript {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn for_agent(&self, agent_id: EntityId) -> impl Iterator<Item = &TranscriptEntry> {
        self.entries
            .iter()
            .filter(move |entry| entry.agent_id == agent_id)
    }
}

impl TranscriptSink for MemoryTranscript {
    fn record(&mut self, entry: &TranscriptEntry) -> io::Result<()> {
        self.entries.push(entry.clone());
        Ok(())
    }
}

/// Writes one JSON object per line.
#[derive(Debug)]
pub struct JsonlTranscript<W: Write> {
    writer: W,
}

impl<W: Write> JsonlTranscript<W> {
    pub fn new(writer: W) -> Self {
        JsonlTranscript { writer }
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

impl<W: Write> TranscriptSink for JsonlTranscript<W> {
    fn record(&mut self, entry: &TranscriptEntry) -> io::Result<()> {
        serde_json::to_writer(&mut self.writer, entry)?;
        self.writer.write_all(b"\n")?;
        self.writer.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(role: Role, content: &str) -> TranscriptEntry {
        TranscriptEntry {
            environment: "corners".to_string(),
            run_id: Uuid::nil(),
            episode: 2,
            agent_id: 1,
            role,
            content: content.to_string(),
        }
    }

    #[test]
    fn jsonl_writes_one_line_per_entry() {
        let mut sink = JsonlTranscript::new(Vec::new());
        sink.record(&entry(Role::User, "Your current position is: (0, 0)"))
            .unwrap();
        sink.record(&entry(Role::Assistant, "{\"action_name\": \"north\"}"))
            .unwrap();
        let text = String::from_utf8(sink.into_inner()).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);

        let parsed: TranscriptEntry = serde_json::from_str(lines[1]).unwrap();
        assert_eq!(parsed.role, Role::Assistant);
        assert_eq!(parsed.episode, 2);
        assert!(lines[0].contains("\"role\":\"user\""));
    }
}
