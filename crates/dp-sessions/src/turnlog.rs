//! The append-only turn log: one JSON object per line in
//! `memory.jsonl` under the session root.
//!
//! Lines are either turn boundary markers or role-tagged messages.
//! A turn is append-only once terminal; `retry` appends a supersede
//! marker instead of rewriting history.

use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::{Deserialize, Serialize};

use dp_domain::error::{Error, Result};
use dp_domain::message::{Message, Usage};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnStatus {
    Done,
    Stopped,
    Failed,
}

/// One line of `memory.jsonl`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "record", rename_all = "snake_case")]
pub enum LogLine {
    TurnStart {
        turn_id: u64,
        timestamp: String,
    },
    Message {
        turn_id: u64,
        timestamp: String,
        #[serde(flatten)]
        message: Message,
    },
    TurnEnd {
        turn_id: u64,
        timestamp: String,
        status: TurnStatus,
        usage: Usage,
        iterations: u32,
    },
    /// The named turn's assistant/tool output no longer counts toward
    /// history (a retry re-ran the user message).
    Superseded {
        turn_id: u64,
        timestamp: String,
    },
    /// Compression checkpoint: messages before this line are
    /// represented by the cumulative summary, except for the last
    /// `kept_messages`, which stay in the prompt verbatim.
    CompressionMarker {
        turn_id: u64,
        timestamp: String,
        summary_chars: usize,
        kept_messages: usize,
    },
}

impl LogLine {
    pub fn turn_id(&self) -> u64 {
        match self {
            LogLine::TurnStart { turn_id, .. }
            | LogLine::Message { turn_id, .. }
            | LogLine::TurnEnd { turn_id, .. }
            | LogLine::Superseded { turn_id, .. }
            | LogLine::CompressionMarker { turn_id, .. } => *turn_id,
        }
    }
}

/// Append-only writer/reader for one session's turn log.
pub struct TurnLog {
    path: PathBuf,
}

impl TurnLog {
    pub fn new(session_root: &Path) -> Self {
        Self {
            path: session_root.join("memory.jsonl"),
        }
    }

    pub fn append(&self, lines: &[LogLine]) -> Result<()> {
        if lines.is_empty() {
            return Ok(());
        }
        let mut buf = String::new();
        for line in lines {
            buf.push_str(&serde_json::to_string(line)?);
            buf.push('\n');
        }
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(Error::Io)?;
        file.write_all(buf.as_bytes()).map_err(Error::Io)?;
        Ok(())
    }

    /// Read the whole log, skipping malformed lines with a warning.
    pub fn read(&self) -> Result<Vec<LogLine>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let raw = std::fs::read_to_string(&self.path)?;
        let mut lines = Vec::new();
        for (idx, line) in raw.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str(line) {
                Ok(parsed) => lines.push(parsed),
                Err(e) => {
                    tracing::warn!(line = idx + 1, error = %e, "skipping malformed log line");
                }
            }
        }
        Ok(lines)
    }

    /// Raw bytes, for byte-identical round-trip checks and export.
    pub fn raw(&self) -> Result<Vec<u8>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        Ok(std::fs::read(&self.path)?)
    }

    /// The highest turn id present (0 when empty).
    pub fn last_turn_id(&self) -> Result<u64> {
        Ok(self.read()?.iter().map(LogLine::turn_id).max().unwrap_or(0))
    }

    /// Reconstruct conversation messages for prompt assembly.
    ///
    /// Superseded turns are dropped. When a compression marker is
    /// present, only its `kept_messages` trailing messages from before
    /// the marker survive (the rest live in the cumulative summary),
    /// plus everything after the marker.
    pub fn replay_messages(&self) -> Result<(Vec<Message>, Option<u64>)> {
        let lines = self.read()?;
        let superseded: Vec<u64> = lines
            .iter()
            .filter_map(|l| match l {
                LogLine::Superseded { turn_id, .. } => Some(*turn_id),
                _ => None,
            })
            .collect();

        let extract = |slice: &[LogLine]| -> Vec<Message> {
            slice
                .iter()
                .filter_map(|l| match l {
                    LogLine::Message {
                        turn_id, message, ..
                    } if !superseded.contains(turn_id) => Some(message.clone()),
                    _ => None,
                })
                .collect()
        };

        let boundary = lines
            .iter()
            .rposition(|l| matches!(l, LogLine::CompressionMarker { .. }));
        match boundary {
            Some(idx) => {
                let kept = match &lines[idx] {
                    LogLine::CompressionMarker { kept_messages, .. } => *kept_messages,
                    _ => 0,
                };
                let mut before = extract(&lines[..idx]);
                let split = before.len().saturating_sub(kept);
                let mut messages = before.split_off(split);
                messages.extend(extract(&lines[idx + 1..]));
                Ok((messages, Some(lines[idx].turn_id())))
            }
            None => Ok((extract(&lines), None)),
        }
    }

    pub fn line(turn_id: u64, message: Message) -> LogLine {
        LogLine::Message {
            turn_id,
            timestamp: Utc::now().to_rfc3339(),
            message,
        }
    }

    pub fn turn_start(turn_id: u64) -> LogLine {
        LogLine::TurnStart {
            turn_id,
            timestamp: Utc::now().to_rfc3339(),
        }
    }

    pub fn turn_end(turn_id: u64, status: TurnStatus, usage: Usage, iterations: u32) -> LogLine {
        LogLine::TurnEnd {
            turn_id,
            timestamp: Utc::now().to_rfc3339(),
            status,
            usage,
            iterations,
        }
    }

    pub fn superseded(turn_id: u64) -> LogLine {
        LogLine::Superseded {
            turn_id,
            timestamp: Utc::now().to_rfc3339(),
        }
    }

    pub fn compression_marker(turn_id: u64, summary_chars: usize, kept_messages: usize) -> LogLine {
        LogLine::CompressionMarker {
            turn_id,
            timestamp: Utc::now().to_rfc3339(),
            summary_chars,
            kept_messages,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_is_byte_identical() {
        let tmp = tempfile::tempdir().unwrap();
        let log = TurnLog::new(tmp.path());

        log.append(&[
            TurnLog::turn_start(1),
            TurnLog::line(1, Message::user("load sales.csv")),
            TurnLog::line(1, Message::assistant("done")),
            TurnLog::turn_end(1, TurnStatus::Done, Usage::default(), 2),
        ])
        .unwrap();

        let raw_before = log.raw().unwrap();
        let lines = log.read().unwrap();
        assert_eq!(lines.len(), 4);

        // Re-serialize what we read: identical bytes.
        let mut rebuilt = String::new();
        for line in &lines {
            rebuilt.push_str(&serde_json::to_string(line).unwrap());
            rebuilt.push('\n');
        }
        assert_eq!(rebuilt.as_bytes(), raw_before.as_slice());
    }

    #[test]
    fn replay_drops_superseded_turns() {
        let tmp = tempfile::tempdir().unwrap();
        let log = TurnLog::new(tmp.path());

        log.append(&[
            TurnLog::turn_start(1),
            TurnLog::line(1, Message::user("hi")),
            TurnLog::line(1, Message::assistant("first answer")),
            TurnLog::turn_end(1, TurnStatus::Done, Usage::default(), 1),
            TurnLog::superseded(1),
            TurnLog::turn_start(2),
            TurnLog::line(2, Message::user("hi")),
            TurnLog::line(2, Message::assistant("second answer")),
            TurnLog::turn_end(2, TurnStatus::Done, Usage::default(), 1),
        ])
        .unwrap();

        let (messages, _) = log.replay_messages().unwrap();
        let texts: Vec<String> = messages.iter().map(|m| m.content.all_text()).collect();
        assert!(!texts.contains(&"first answer".to_string()));
        assert!(texts.contains(&"second answer".to_string()));
    }

    #[test]
    fn replay_starts_after_compression_marker() {
        let tmp = tempfile::tempdir().unwrap();
        let log = TurnLog::new(tmp.path());

        log.append(&[
            TurnLog::line(1, Message::user("oldest")),
            TurnLog::line(1, Message::user("old but kept")),
            TurnLog::compression_marker(1, 120, 1),
            TurnLog::line(2, Message::user("new")),
        ])
        .unwrap();

        let (messages, marker_turn) = log.replay_messages().unwrap();
        let texts: Vec<String> = messages.iter().map(|m| m.content.all_text()).collect();
        assert_eq!(texts, vec!["old but kept", "new"]);
        assert_eq!(marker_turn, Some(1));
    }

    #[test]
    fn malformed_lines_skipped() {
        let tmp = tempfile::tempdir().unwrap();
        let log = TurnLog::new(tmp.path());
        log.append(&[TurnLog::turn_start(1)]).unwrap();
        std::fs::OpenOptions::new()
            .append(true)
            .open(tmp.path().join("memory.jsonl"))
            .unwrap()
            .write_all(b"{garbage\n")
            .unwrap();
        log.append(&[TurnLog::turn_start(2)]).unwrap();

        assert_eq!(log.read().unwrap().len(), 2);
    }

    #[test]
    fn last_turn_id_tracks_appends() {
        let tmp = tempfile::tempdir().unwrap();
        let log = TurnLog::new(tmp.path());
        assert_eq!(log.last_turn_id().unwrap(), 0);
        log.append(&[TurnLog::turn_start(3)]).unwrap();
        assert_eq!(log.last_turn_id().unwrap(), 3);
    }
}
