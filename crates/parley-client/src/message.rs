//! Message records and the per-contact message log.

use parley_shared::codec::{WireReader, WireRecord, WireWriter};
use parley_shared::error::CodecError;
use parley_shared::types::{now_timestamp, Address, MessageId};
use serde::Serialize;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[repr(i32)]
pub enum MessageKind {
    Standard = 0,
    ContactRequest = 1,
    FundsRequest = 2,
    FundsSent = 3,
    FileHeader = 4,
}

impl MessageKind {
    pub fn from_i32(value: i32) -> Result<Self, CodecError> {
        match value {
            0 => Ok(Self::Standard),
            1 => Ok(Self::ContactRequest),
            2 => Ok(Self::FundsRequest),
            3 => Ok(Self::FundsSent),
            4 => Ok(Self::FileHeader),
            other => Err(CodecError::UnknownTag {
                field: "message kind",
                value: other,
            }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FriendMessage {
    id: MessageId,
    pub kind: MessageKind,
    pub body: String,
    /// Sender-asserted time, seconds.
    pub timestamp: i64,
    local_sender: bool,
    read: bool,
    confirmed: bool,
    /// Sub-identity that authored a message relayed by a bot contact.
    pub sender_address: Option<Address>,
    pub sender_nick: String,
    pub transfer_id: String,
    pub completed: bool,
    pub file_path: String,
    pub file_size: u64,
    /// Local receive time; authoritative for ordering.
    pub received_timestamp: i64,
}

impl FriendMessage {
    /// New message. A fresh id is generated unless one is supplied.
    pub fn new(
        id: Option<MessageId>,
        kind: MessageKind,
        body: impl Into<String>,
        timestamp: i64,
        local_sender: bool,
    ) -> Self {
        Self {
            id: id.unwrap_or_else(MessageId::generate),
            kind,
            body: body.into(),
            timestamp,
            local_sender,
            read: false,
            confirmed: false,
            sender_address: None,
            sender_nick: String::new(),
            transfer_id: String::new(),
            completed: false,
            file_path: String::new(),
            file_size: 0,
            received_timestamp: now_timestamp(),
        }
    }

    pub fn id(&self) -> &MessageId {
        &self.id
    }

    pub fn local_sender(&self) -> bool {
        self.local_sender
    }

    pub fn read(&self) -> bool {
        self.read
    }

    pub fn confirmed(&self) -> bool {
        self.confirmed
    }

    /// Remote messages only. Returns whether the flag changed.
    pub fn mark_read(&mut self) -> bool {
        if self.local_sender || self.read {
            return false;
        }
        self.read = true;
        true
    }

    /// Local messages only. Returns whether the flag changed.
    pub fn mark_confirmed(&mut self) -> bool {
        if !self.local_sender || self.confirmed {
            return false;
        }
        self.confirmed = true;
        true
    }

    fn is_unread(&self) -> bool {
        !self.local_sender && !self.read
    }
}

impl WireRecord for FriendMessage {
    fn write_to(&self, w: &mut WireWriter) {
        w.write_bytes(self.id.as_bytes());
        w.write_i32(self.kind as i32);
        w.write_string(&self.body);
        w.write_i64(self.timestamp);
        w.write_bool(self.local_sender);
        w.write_bool(self.read);
        w.write_bool(self.confirmed);
        w.write_optional_bytes(self.sender_address.as_ref().map(|a| a.as_bytes()));
        w.write_string(&self.sender_nick);
        w.write_string(&self.transfer_id);
        w.write_bool(self.completed);
        w.write_string(&self.file_path);
        w.write_u64(self.file_size);
        w.write_i64(self.received_timestamp);
    }

    fn read_from(r: &mut WireReader<'_>) -> Result<Self, CodecError> {
        let id = r.read_bytes()?;
        // Records written before ids were assigned eagerly may carry none.
        let id = if id.is_empty() {
            MessageId::generate()
        } else {
            MessageId(id)
        };

        Ok(Self {
            id,
            kind: MessageKind::from_i32(r.read_i32()?)?,
            body: r.read_string()?,
            timestamp: r.read_i64()?,
            local_sender: r.read_bool()?,
            read: r.read_bool()?,
            confirmed: r.read_bool()?,
            sender_address: r.read_optional_bytes()?.map(Address),
            sender_nick: r.read_string()?,
            transfer_id: r.read_string()?,
            completed: r.read_bool()?,
            file_path: r.read_string()?,
            file_size: r.read_u64()?,
            received_timestamp: r.read_i64()?,
        })
    }
}

/// Outcome of a flag update on a logged message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlagUpdate {
    Changed,
    Unchanged,
    NotFound,
}

/// Append-ordered history with one contact.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageLog {
    messages: Vec<FriendMessage>,
}

impl MessageLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild a log from stored records. Records that fail to decode are
    /// skipped so one bad entry never hides the rest of the history.
    pub fn from_records(records: &[Vec<u8>]) -> Self {
        let mut messages = Vec::with_capacity(records.len());
        for (index, record) in records.iter().enumerate() {
            match FriendMessage::from_wire(record) {
                Ok(message) => messages.push(message),
                Err(e) => warn!(index, error = %e, "skipping undecodable message record"),
            }
        }
        Self { messages }
    }

    pub fn to_records(&self) -> Vec<Vec<u8>> {
        self.messages.iter().map(WireRecord::to_wire).collect()
    }

    pub fn append(&mut self, message: FriendMessage) {
        self.messages.push(message);
    }

    pub fn pop(&mut self) -> Option<FriendMessage> {
        self.messages.pop()
    }

    pub fn messages(&self) -> &[FriendMessage] {
        &self.messages
    }

    pub fn find(&self, id: &MessageId) -> Option<&FriendMessage> {
        self.messages.iter().find(|m| m.id == *id)
    }

    pub fn contains(&self, id: &MessageId) -> bool {
        self.find(id).is_some()
    }

    pub fn last(&self) -> Option<&FriendMessage> {
        self.messages.last()
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn set_read(&mut self, id: &MessageId) -> FlagUpdate {
        self.update(id, FriendMessage::mark_read)
    }

    pub fn set_received(&mut self, id: &MessageId) -> FlagUpdate {
        self.update(id, FriendMessage::mark_confirmed)
    }

    /// Unread remote messages at the tail, stopping at the first read or
    /// locally sent one.
    pub fn unread_count(&self) -> usize {
        self.messages
            .iter()
            .rev()
            .take_while(|m| m.is_unread())
            .count()
    }

    pub fn last_unread(&self) -> bool {
        self.messages.last().is_some_and(FriendMessage::is_unread)
    }

    /// Mark the last message read. Returns the id when something changed.
    pub fn set_last_read(&mut self) -> Option<MessageId> {
        let last = self.messages.last_mut()?;
        last.mark_read().then(|| last.id.clone())
    }

    /// Drop the in-memory history.
    pub fn flush(&mut self) {
        self.messages.clear();
    }

    fn update(&mut self, id: &MessageId, mark: fn(&mut FriendMessage) -> bool) -> FlagUpdate {
        match self.messages.iter_mut().find(|m| m.id == *id) {
            None => FlagUpdate::NotFound,
            Some(message) => {
                if mark(message) {
                    FlagUpdate::Changed
                } else {
                    FlagUpdate::Unchanged
                }
            }
        }
    }
}

/// One row of a conversation list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConversationSummary {
    pub address: Address,
    pub nickname: String,
    pub last_timestamp: Option<i64>,
    pub excerpt: String,
    pub unread: usize,
}

const EXCERPT_CHARS: usize = 48;

impl ConversationSummary {
    pub fn new(address: Address, nickname: String, log: &MessageLog) -> Self {
        let last = log.last();
        Self {
            address,
            nickname,
            last_timestamp: last.map(|m| m.received_timestamp),
            excerpt: last
                .map(|m| m.body.chars().take(EXCERPT_CHARS).collect())
                .unwrap_or_default(),
            unread: log.unread_count(),
        }
    }
}
