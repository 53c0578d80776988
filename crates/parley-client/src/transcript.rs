//! Per-session message log.
//!
//! Insertion order is display order. A session holds at most one
//! `Streaming` message at any time; every mutating call preserves that.

use std::collections::{HashMap, HashSet};

use parley_types::{Message, MessageAck, MessageRole, MessageStatus, MISSING_TIMESTAMP};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CacheError {
    #[error("session {session_id} already has a streaming message")]
    StreamingConflict { session_id: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AppendOutcome {
    Appended,
    /// An entry with the same identity was replaced at this index.
    Replaced(usize),
}

/// Result of folding one fragment into the streaming message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamingUpdate {
    pub key: String,
    pub created: bool,
    pub delta: String,
}

#[derive(Debug, Default)]
pub struct TranscriptCache {
    transcripts: HashMap<String, Vec<Message>>,
    /// Sessions that have merged at least one server snapshot.
    synced: HashSet<String>,
}

impl TranscriptCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn messages(&self, session_id: &str) -> &[Message] {
        self.transcripts
            .get(session_id)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn get(&self, session_id: &str, key: &str) -> Option<&Message> {
        self.messages(session_id)
            .iter()
            .find(|m| m.id.as_deref() == Some(key) || m.local_id.as_deref() == Some(key))
    }

    pub fn streaming(&self, session_id: &str) -> Option<&Message> {
        self.messages(session_id).iter().find(|m| m.is_streaming())
    }

    pub fn streaming_count(&self, session_id: &str) -> usize {
        self.messages(session_id)
            .iter()
            .filter(|m| m.is_streaming())
            .count()
    }

    pub fn remove_session(&mut self, session_id: &str) {
        self.transcripts.remove(session_id);
        self.synced.remove(session_id);
    }

    pub fn is_synced(&self, session_id: &str) -> bool {
        self.synced.contains(session_id)
    }

    /// The delivered user message the streaming reply answers.
    pub fn outstanding_user(&self, session_id: &str) -> Option<&Message> {
        let entries = self.messages(session_id);
        let streaming = entries.iter().position(Message::is_streaming)?;
        entries[..streaming]
            .iter()
            .rev()
            .find(|m| m.role == MessageRole::User && m.status != MessageStatus::Failed)
    }

    /// Put earlier server history in front of the local entries. Entries
    /// already present are skipped and an unfinished server entry is failed,
    /// so a local streaming reply stays the only one. Marks the session
    /// synced; returns whether anything was added.
    pub fn seed_history(&mut self, session_id: &str, history: Vec<Message>) -> bool {
        self.synced.insert(session_id.to_string());
        let entries = self.transcripts.entry(session_id.to_string()).or_default();
        let mut seeded: Vec<Message> = history
            .into_iter()
            .filter(|m| !entries.iter().any(|e| e.same_identity(m)))
            .collect();
        if seeded.is_empty() {
            return false;
        }
        for message in &mut seeded {
            message.session_id = session_id.to_string();
            if message.is_streaming() {
                message.status = MessageStatus::Failed;
            }
        }
        seeded.append(entries);
        *entries = seeded;
        true
    }

    /// Append, or replace in place when an entry with the same id or local
    /// id already exists.
    pub fn append(&mut self, message: Message) -> Result<AppendOutcome, CacheError> {
        let session_id = message.session_id.clone();
        let entries = self.transcripts.entry(session_id.clone()).or_default();

        if let Some(idx) = entries.iter().position(|m| m.same_identity(&message)) {
            let replacing_streaming = entries[idx].is_streaming();
            if message.is_streaming()
                && !replacing_streaming
                && entries.iter().any(Message::is_streaming)
            {
                return Err(CacheError::StreamingConflict { session_id });
            }
            entries[idx] = message;
            return Ok(AppendOutcome::Replaced(idx));
        }

        if message.is_streaming() && entries.iter().any(Message::is_streaming) {
            return Err(CacheError::StreamingConflict { session_id });
        }
        entries.push(message);
        Ok(AppendOutcome::Appended)
    }

    /// Append a fragment to the session's streaming message, creating an
    /// assistant message when none is streaming.
    pub fn upsert_streaming(&mut self, session_id: &str, fragment: &str) -> StreamingUpdate {
        let entries = self.transcripts.entry(session_id.to_string()).or_default();
        if let Some(message) = entries.iter_mut().find(|m| m.is_streaming()) {
            message.content.push_str(fragment);
            return StreamingUpdate {
                key: message.key().unwrap_or_default().to_string(),
                created: false,
                delta: fragment.to_string(),
            };
        }

        let mut message = Message::assistant_streaming(session_id);
        message.content.push_str(fragment);
        let key = message.key().unwrap_or_default().to_string();
        entries.push(message);
        StreamingUpdate {
            key,
            created: true,
            delta: fragment.to_string(),
        }
    }

    /// Freeze the streaming message with a terminal status.
    ///
    /// Returns `None` when nothing is streaming, so repeated terminal events
    /// leave the transcript untouched.
    pub fn finalize(&mut self, session_id: &str, status: MessageStatus) -> Option<&Message> {
        if !status.is_terminal() {
            return None;
        }
        let message = self
            .transcripts
            .get_mut(session_id)?
            .iter_mut()
            .find(|m| m.is_streaming())?;
        message.status = status;
        Some(&*message)
    }

    /// Finalize with content (and optionally an id) taken from the server.
    pub fn finalize_with(
        &mut self,
        session_id: &str,
        status: MessageStatus,
        content: String,
        server_id: Option<String>,
    ) -> Option<&Message> {
        if !status.is_terminal() {
            return None;
        }
        let message = self
            .transcripts
            .get_mut(session_id)?
            .iter_mut()
            .find(|m| m.is_streaming())?;
        message.content = content;
        message.status = status;
        if server_id.is_some() {
            message.id = server_id;
        }
        Some(&*message)
    }

    /// Set the status of a non-streaming entry. Terminal entries keep their
    /// status.
    pub fn set_status(&mut self, session_id: &str, key: &str, status: MessageStatus) -> Option<&Message> {
        let message = self
            .transcripts
            .get_mut(session_id)?
            .iter_mut()
            .find(|m| m.id.as_deref() == Some(key) || m.local_id.as_deref() == Some(key))?;
        if message.is_streaming() || message.status.is_terminal() {
            return None;
        }
        message.status = status;
        Some(&*message)
    }

    /// Attach the server id from an acknowledgement to the matching user
    /// message: by local id, else the newest id-less user entry with the
    /// same content.
    pub fn acknowledge(&mut self, session_id: &str, ack: &MessageAck) -> Option<&Message> {
        let entries = self.transcripts.get_mut(session_id)?;
        let idx = ack
            .local_id
            .as_deref()
            .and_then(|local| {
                entries
                    .iter()
                    .position(|m| m.local_id.as_deref() == Some(local))
            })
            .or_else(|| {
                entries.iter().rposition(|m| {
                    m.role == ack.role && m.id.is_none() && m.content == ack.content
                })
            })?;

        let message = &mut entries[idx];
        if ack.id.is_some() {
            message.id = ack.id.clone();
        }
        if let Some(timestamp) = ack.timestamp {
            message.timestamp = timestamp;
        }
        if message.status == MessageStatus::Pending {
            message.status = MessageStatus::Complete;
        }
        Some(&*message)
    }

    /// Overwrite the session's transcript with the server's copy.
    ///
    /// Server entries are matched to local ones by id, then id-less user
    /// entries by content and id-less assistant entries by position. A
    /// matched pair keeps a terminal local status unless the server entry is
    /// terminal too, and a local `Failed` always stays failed. Unmatched
    /// local `Pending`/`Streaming` entries are dropped; unmatched terminal
    /// ones stay behind the entry they followed. Applying the same snapshot
    /// twice yields the same transcript.
    pub fn replace_all(&mut self, session_id: &str, server: Vec<Message>) -> bool {
        self.synced.insert(session_id.to_string());
        let local = self.transcripts.remove(session_id).unwrap_or_default();
        let mut matched: Vec<Option<usize>> = vec![None; local.len()];
        let mut merged: Vec<Message> = Vec::with_capacity(server.len());
        let mut cursor = 0usize;

        for mut incoming in server {
            incoming.session_id = session_id.to_string();
            let found = find_match(&local, &matched, &incoming, cursor);
            match found {
                Some(idx) => {
                    matched[idx] = Some(merged.len());
                    cursor = cursor.max(idx + 1);
                    merged.push(merge_entry(&local[idx], incoming));
                }
                None => merged.push(incoming),
            }
        }

        // Kept local entries, grouped behind the merged position of the
        // nearest preceding matched local entry.
        let mut anchored: Vec<(Option<usize>, Message)> = Vec::new();
        let mut anchor: Option<usize> = None;
        for (idx, message) in local.iter().enumerate() {
            if let Some(position) = matched[idx] {
                anchor = Some(position);
                continue;
            }
            if message.status.is_terminal() {
                anchored.push((anchor, message.clone()));
            } else {
                tracing::debug!(
                    session_id,
                    key = message.key().unwrap_or_default(),
                    status = %message.status,
                    "dropping unconfirmed entry during resync"
                );
            }
        }

        let mut result = Vec::with_capacity(merged.len() + anchored.len());
        let mut pending = anchored.into_iter().peekable();
        while let Some((None, _)) = pending.peek() {
            if let Some((_, message)) = pending.next() {
                result.push(message);
            }
        }
        for (position, message) in merged.into_iter().enumerate() {
            result.push(message);
            while let Some((Some(anchor), _)) = pending.peek() {
                if *anchor != position {
                    break;
                }
                if let Some((_, message)) = pending.next() {
                    result.push(message);
                }
            }
        }
        result.extend(pending.map(|(_, message)| message));

        enforce_single_streaming(&mut result);

        let changed = result != local;
        self.transcripts.insert(session_id.to_string(), result);
        changed
    }
}

fn find_match(
    local: &[Message],
    matched: &[Option<usize>],
    incoming: &Message,
    cursor: usize,
) -> Option<usize> {
    let unused = |idx: &usize| matched[*idx].is_none();

    if let Some(id) = incoming.id.as_deref() {
        if let Some(idx) = (0..local.len())
            .filter(unused)
            .find(|idx| local[*idx].id.as_deref() == Some(id))
        {
            return Some(idx);
        }
    }

    (cursor..local.len()).filter(unused).find(|idx| {
        let candidate = &local[*idx];
        if candidate.id.is_some() || candidate.role != incoming.role {
            return false;
        }
        match incoming.role {
            // Never delivered, so it cannot be the server's copy.
            MessageRole::User => {
                candidate.status != MessageStatus::Failed && candidate.content == incoming.content
            }
            _ => true,
        }
    })
}

fn merge_entry(local: &Message, incoming: Message) -> Message {
    let keep_local = local.status == MessageStatus::Failed
        || (local.status.is_terminal() && !incoming.status.is_terminal())
        || (!local.status.is_terminal() && !incoming.status.is_terminal());

    if keep_local {
        Message {
            id: incoming.id.or_else(|| local.id.clone()),
            ..local.clone()
        }
    } else {
        let timestamp = if incoming.timestamp == MISSING_TIMESTAMP {
            local.timestamp
        } else {
            incoming.timestamp
        };
        Message {
            local_id: local.local_id.clone(),
            timestamp,
            ..incoming
        }
    }
}

/// Only the last streaming entry may stay streaming.
fn enforce_single_streaming(entries: &mut [Message]) {
    let Some(last) = entries.iter().rposition(Message::is_streaming) else {
        return;
    };
    for message in entries[..last].iter_mut().filter(|m| m.is_streaming()) {
        message.status = MessageStatus::Failed;
    }
}
