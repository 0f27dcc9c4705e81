//! Per-run JSON interaction log.
//!
//! Each agent run owns one log file that external readers (the web UI, a
//! `tail`ing operator) can open at any moment, so the file is rewritten as a
//! complete JSON document on every mutation. While the LLM is streaming, an
//! in-progress assistant message with `"streaming": true` is appended
//! periodically and replaced by the final message on the next rewrite.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ai::types::{ChatMessage, Role};

/// The serialized shape of a run log file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunLogDocument {
    pub run_id: String,
    pub agent_name: String,
    pub parent_run_id: Option<String>,
    pub parent_agent_name: String,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub final_response: Option<String>,
    pub total_iterations: Option<u32>,
    pub session_ended_explicitly: Option<bool>,
    pub model: String,
    pub interactions: Vec<ChatMessage>,
}

/// Writer for one run's log file.
pub struct RunLog {
    path: PathBuf,
    document: RunLogDocument,
}

impl RunLog {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        logs_dir: &Path,
        run_id: &str,
        agent_name: &str,
        parent_run_id: Option<&str>,
        parent_agent_name: &str,
        model: &str,
    ) -> Self {
        let timestamp = Utc::now().format("%Y_%m_%d_%H_%M_%S");
        let path = logs_dir.join(format!("{timestamp}_{agent_name}_{run_id}.log"));
        Self {
            path,
            document: RunLogDocument {
                run_id: run_id.to_string(),
                agent_name: agent_name.to_string(),
                parent_run_id: parent_run_id.map(str::to_string),
                parent_agent_name: parent_agent_name.to_string(),
                started_at: Utc::now(),
                completed_at: None,
                final_response: None,
                total_iterations: None,
                session_ended_explicitly: None,
                model: model.to_string(),
                interactions: Vec::new(),
            },
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Rewrite the log with the current conversation. Write failures are
    /// logged and swallowed: the log is advisory, the run must not die for
    /// it.
    pub fn save(&mut self, conversation: &[ChatMessage]) {
        self.document.interactions = conversation.to_vec();
        self.flush();
    }

    /// Rewrite the log with an in-progress assistant message appended, so
    /// external readers can tail generation progress. The file remains a
    /// complete, valid JSON document.
    pub fn save_streaming(&mut self, conversation: &[ChatMessage], partial_content: &str) {
        self.document.interactions = conversation.to_vec();
        self.document.interactions.push(ChatMessage {
            role: Role::Assistant,
            content: partial_content.to_string(),
            timestamp: Utc::now(),
            streaming: Some(true),
        });
        self.flush();
    }

    /// Record the final outcome and write the log one last time.
    pub fn finalize(
        &mut self,
        conversation: &[ChatMessage],
        final_response: &str,
        total_iterations: u32,
        session_ended_explicitly: bool,
    ) {
        self.document.completed_at = Some(Utc::now());
        self.document.final_response = Some(final_response.to_string());
        self.document.total_iterations = Some(total_iterations);
        self.document.session_ended_explicitly = Some(session_ended_explicitly);
        self.save(conversation);
    }

    fn flush(&self) {
        let json = match serde_json::to_string_pretty(&self.document) {
            Ok(json) => json,
            Err(e) => {
                log::warn!("run log: failed to serialize {}: {e}", self.path.display());
                return;
            }
        };
        if let Some(parent) = self.path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        if let Err(e) = std::fs::write(&self.path, json) {
            log::warn!("run log: failed to write {}: {e}", self.path.display());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_log(dir: &Path) -> RunLog {
        RunLog::new(dir, "run-1", "helper", None, "root", "test-model")
    }

    fn read_doc(log: &RunLog) -> RunLogDocument {
        let text = std::fs::read_to_string(log.path()).unwrap();
        serde_json::from_str(&text).unwrap()
    }

    #[test]
    fn file_name_contains_agent_and_run_id() {
        let dir = tempfile::tempdir().unwrap();
        let log = make_log(dir.path());
        let name = log.path().file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.contains("helper"));
        assert!(name.contains("run-1"));
    }

    #[test]
    fn save_writes_valid_json_with_interactions() {
        let dir = tempfile::tempdir().unwrap();
        let mut log = make_log(dir.path());
        log.save(&[ChatMessage::system("sys"), ChatMessage::user("hi")]);

        let doc = read_doc(&log);
        assert_eq!(doc.interactions.len(), 2);
        assert_eq!(doc.run_id, "run-1");
        assert!(doc.completed_at.is_none());
    }

    #[test]
    fn streaming_entry_is_marked_and_replaced() {
        let dir = tempfile::tempdir().unwrap();
        let mut log = make_log(dir.path());
        let conversation = vec![ChatMessage::user("question")];

        log.save_streaming(&conversation, "partial ans");
        let doc = read_doc(&log);
        let last = doc.interactions.last().unwrap();
        assert_eq!(last.streaming, Some(true));
        assert_eq!(last.content, "partial ans");

        // The next plain save drops the streaming entry.
        log.save(&conversation);
        let doc = read_doc(&log);
        assert_eq!(doc.interactions.len(), 1);
        assert!(doc.interactions[0].streaming.is_none());
    }

    #[test]
    fn finalize_records_outcome() {
        let dir = tempfile::tempdir().unwrap();
        let mut log = make_log(dir.path());
        log.finalize(&[ChatMessage::user("q")], "the answer", 3, true);

        let doc = read_doc(&log);
        assert_eq!(doc.final_response.as_deref(), Some("the answer"));
        assert_eq!(doc.total_iterations, Some(3));
        assert_eq!(doc.session_ended_explicitly, Some(true));
        assert!(doc.completed_at.is_some());
    }
}
