use askia_contracts::{ActiveTrigger, TriggerKind, TriggerPriority};
use askia_kernel::{is_blank_conversation, jcs_sha256_hex, priority_for};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::warn;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum JournalEvent {
    TriggerShown,
    TriggerCompleted,
    TriggerDismissed,
    NewChatBlocked,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JournalRecord {
    pub record_id: String,
    pub session_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<String>,
    pub event: JournalEvent,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<TriggerKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<TriggerPriority>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rating: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
    pub ts: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prev_hash: Option<String>,
    pub record_hash: String,
}

impl JournalRecord {
    pub fn new(session_id: &str, event: JournalEvent) -> Self {
        Self {
            record_id: format!("jr_{}", uuid::Uuid::new_v4().as_simple()),
            session_id: session_id.to_string(),
            conversation_id: None,
            event,
            kind: None,
            priority: None,
            rating: None,
            resolved: None,
            comment: None,
            ts: Utc::now().to_rfc3339(),
            prev_hash: None,
            record_hash: String::new(),
        }
    }

    pub fn for_trigger(session_id: &str, event: JournalEvent, trigger: &ActiveTrigger) -> Self {
        let mut rec = Self::new(session_id, event);
        rec.conversation_id = Some(trigger.conversation_id.clone());
        rec.kind = Some(trigger.kind);
        rec.priority = Some(trigger.priority);
        rec
    }

    /// Field rules each event must satisfy, independent of the hash chain.
    fn check_event_fields(&self) -> Result<(), String> {
        let conversation_id = self.conversation_id.as_deref().unwrap_or_default();
        if is_blank_conversation(conversation_id) {
            return Err(format!("{:?} record without conversation_id", self.event));
        }
        let kind = self
            .kind
            .ok_or_else(|| format!("{:?} record without trigger kind", self.event))?;
        if self.priority != Some(priority_for(kind)) {
            return Err(format!(
                "{} trigger recorded with priority {:?}",
                kind.as_str(),
                self.priority
            ));
        }
        if self.event == JournalEvent::NewChatBlocked && kind != TriggerKind::BeforeNewChat {
            return Err(format!("new chat blocked by {} trigger", kind.as_str()));
        }
        if self.event != JournalEvent::TriggerCompleted
            && (self.rating.is_some() || self.resolved.is_some() || self.comment.is_some())
        {
            return Err(format!("{:?} record carries feedback payload", self.event));
        }
        if let Some(rating) = self.rating.filter(|r| !(1..=5).contains(r)) {
            return Err(format!("rating {rating} out of range"));
        }
        Ok(())
    }

    fn content_hash(&self) -> Result<String, String> {
        let mut seeded = self.clone();
        seeded.record_hash.clear();
        let value = serde_json::to_value(&seeded).map_err(|e| e.to_string())?;
        jcs_sha256_hex(&value)
    }
}

struct JournalTail {
    file: tokio::fs::File,
    last_hash: Option<String>,
}

/// Append-only JSONL log of prompts shown, completed, dismissed and blocking
/// new chats. Each record carries the hash of its predecessor.
pub struct DecisionJournal {
    tail: Mutex<JournalTail>,
}

impl DecisionJournal {
    pub async fn open(path: &str) -> Result<Self, String> {
        let last_hash = tokio::fs::read_to_string(path).await.ok().and_then(|text| {
            text.lines().rev().find_map(|line| {
                serde_json::from_str::<JournalRecord>(line)
                    .ok()
                    .map(|rec| rec.record_hash)
            })
        });

        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await
            .map_err(|e| format!("open journal {path} failed: {e}"))?;

        Ok(Self {
            tail: Mutex::new(JournalTail { file, last_hash }),
        })
    }

    /// Write failures are logged; scheduling never depends on the journal.
    pub async fn append(&self, mut rec: JournalRecord) {
        let mut tail = self.tail.lock().await;
        rec.prev_hash = tail.last_hash.clone();
        rec.record_hash = match rec.content_hash() {
            Ok(v) => v,
            Err(e) => {
                warn!(error = %e, "journal record hash failed");
                return;
            }
        };
        let mut line = match serde_json::to_string(&rec) {
            Ok(v) => v,
            Err(e) => {
                warn!(error = %e, "journal record serialize failed");
                return;
            }
        };
        line.push('\n');
        if let Err(e) = tail.file.write_all(line.as_bytes()).await {
            warn!(error = %e, "journal write failed");
            return;
        }
        if let Err(e) = tail.file.flush().await {
            warn!(error = %e, "journal flush failed");
        }
        tail.last_hash = Some(rec.record_hash);
    }
}

/// Walks the journal and returns how many records it holds.
///
/// A record must link to the hash of the one before it (the first links to
/// nothing), hash to its own `record_hash`, and carry the fields its event
/// implies.
pub fn verify_journal_chain(path: &str) -> Result<usize, String> {
    let text = std::fs::read_to_string(path).map_err(|e| format!("read {path} failed: {e}"))?;
    let mut last_hash: Option<String> = None;
    let mut count = 0usize;

    let records = text
        .lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty());
    for (idx, line) in records {
        let line_no = idx + 1;
        let rec: JournalRecord = serde_json::from_str(line)
            .map_err(|e| format!("line {line_no}: not a journal record: {e}"))?;

        if rec.prev_hash != last_hash {
            return Err(format!(
                "line {line_no}: chain broken, links to {:?} after {:?}",
                rec.prev_hash, last_hash
            ));
        }
        let recomputed = rec
            .content_hash()
            .map_err(|e| format!("line {line_no}: {e}"))?;
        if recomputed != rec.record_hash {
            return Err(format!("line {line_no}: content does not match record_hash"));
        }
        rec.check_event_fields()
            .map_err(|e| format!("line {line_no}: {e}"))?;

        last_hash = Some(rec.record_hash);
        count += 1;
    }

    Ok(count)
}
