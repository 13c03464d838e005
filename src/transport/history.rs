//! Bounded per-topic message history, used to honor subscription start positions

use super::StartPosition;
use std::collections::VecDeque;
use std::time::{Duration, SystemTime};

/// A message retained in a topic's history
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredMessage {
    pub seq: u64,
    pub payload: Vec<u8>,
    pub timestamp: SystemTime,
}

/// Ring buffer of recent messages for one topic
#[derive(Debug)]
pub struct TopicHistory {
    /// Maximum number of messages to retain
    capacity: usize,
    /// Messages in sequence order
    messages: VecDeque<StoredMessage>,
    /// Next sequence number
    next_seq: u64,
}

impl TopicHistory {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            messages: VecDeque::with_capacity(capacity.min(1024)),
            next_seq: 1,
        }
    }

    /// Append a message and return it with its assigned sequence number
    pub fn push(&mut self, payload: Vec<u8>) -> StoredMessage {
        let msg = StoredMessage {
            seq: self.next_seq,
            payload,
            timestamp: SystemTime::now(),
        };
        self.next_seq += 1;

        if self.capacity == 0 {
            return msg;
        }

        while self.messages.len() >= self.capacity {
            self.messages.pop_front();
        }
        self.messages.push_back(msg.clone());

        msg
    }

    /// Messages a subscriber starting at `start` should see first
    pub fn replay(&self, start: &StartPosition) -> Vec<StoredMessage> {
        match start {
            StartPosition::NewOnly => Vec::new(),
            StartPosition::LastReceived => self.messages.back().cloned().into_iter().collect(),
            StartPosition::AllAvailable => self.messages.iter().cloned().collect(),
            StartPosition::Sequence(seq) => self.from_sequence(*seq),
            StartPosition::TimeDelta(age) => self.newer_than(*age),
        }
    }

    /// Messages with `seq >= from`. Sequence numbers are ordered, so this is
    /// a binary search.
    fn from_sequence(&self, from: u64) -> Vec<StoredMessage> {
        let start = self.messages.partition_point(|m| m.seq < from);
        self.messages.iter().skip(start).cloned().collect()
    }

    fn newer_than(&self, age: Duration) -> Vec<StoredMessage> {
        let cutoff = SystemTime::now()
            .checked_sub(age)
            .unwrap_or(SystemTime::UNIX_EPOCH);
        let start = self.messages.partition_point(|m| m.timestamp < cutoff);
        self.messages.iter().skip(start).cloned().collect()
    }

    /// Sequence number of the most recent message (0 if none yet)
    pub fn last_seq(&self) -> u64 {
        self.next_seq - 1
    }

    /// Oldest sequence number still retained
    pub fn oldest_seq(&self) -> Option<u64> {
        self.messages.front().map(|m| m.seq)
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}
