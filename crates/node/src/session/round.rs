//! Per-round bookkeeping for a running session.
//!
//! Tracks which participants have delivered their message for each round,
//! remembers a digest of every accepted payload for duplicate and
//! equivocation detection, and holds messages for rounds the session has not
//! reached yet.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::time::{Duration, Instant};

use common::PartyId;
use protocols::RoundMessage;
use sha2::{Digest, Sha256};

/// Where an inbound round message belongs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    /// For the round being collected.
    Current,
    /// For a later round; hold it.
    Future,
    /// For a round already advanced past; discard.
    Stale,
    /// Same payload as one already accepted.
    Duplicate,
    /// Different payload for a round the sender already delivered.
    Equivocation,
    /// Round number outside the protocol.
    OutOfRange,
}

fn digest(payload: &[u8]) -> [u8; 32] {
    Sha256::digest(payload).into()
}

/// Tracks the rounds of a single session.
#[derive(Debug)]
pub struct RoundTracker {
    current: u16,
    total: u16,
    /// Parties expected to send in every round.
    expected: BTreeSet<PartyId>,
    /// round -> sender -> payload digest.
    seen: HashMap<u16, HashMap<PartyId, [u8; 32]>>,
    /// round -> sender -> held message.
    pending: BTreeMap<u16, BTreeMap<PartyId, RoundMessage>>,
    round_started: Instant,
}

impl RoundTracker {
    pub fn new(total: u16, expected: impl IntoIterator<Item = PartyId>) -> Self {
        Self {
            current: 1,
            total,
            expected: expected.into_iter().collect(),
            seen: HashMap::new(),
            pending: BTreeMap::new(),
            round_started: Instant::now(),
        }
    }

    pub fn current(&self) -> u16 {
        self.current
    }

    pub fn total(&self) -> u16 {
        self.total
    }

    pub fn classify(&self, round: u16, sender: &PartyId, payload: &[u8]) -> Classification {
        if round == 0 || round > self.total {
            return Classification::OutOfRange;
        }

        let incoming = digest(payload);
        if let Some(recorded) = self.seen.get(&round).and_then(|r| r.get(sender)) {
            return if *recorded == incoming {
                Classification::Duplicate
            } else {
                Classification::Equivocation
            };
        }

        if round < self.current {
            return Classification::Stale;
        }

        if round > self.current {
            return match self.pending.get(&round).and_then(|r| r.get(sender)) {
                Some(held) if held.payload == payload => Classification::Duplicate,
                Some(_) => Classification::Equivocation,
                None => Classification::Future,
            };
        }

        Classification::Current
    }

    /// Record an accepted message. Returns false if the sender already
    /// delivered for this round.
    pub fn record(&mut self, round: u16, sender: &PartyId, payload: &[u8]) -> bool {
        let round_seen = self.seen.entry(round).or_default();
        if round_seen.contains_key(sender) {
            return false;
        }
        round_seen.insert(sender.clone(), digest(payload));
        true
    }

    /// Hold a message for a later round.
    pub fn buffer(&mut self, msg: RoundMessage) {
        self.pending
            .entry(msg.round)
            .or_default()
            .entry(msg.sender.clone())
            .or_insert(msg);
    }

    /// Take the held messages for `round`, ordered by sender.
    pub fn take_pending(&mut self, round: u16) -> Vec<RoundMessage> {
        self.pending
            .remove(&round)
            .map(|held| held.into_values().collect())
            .unwrap_or_default()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.values().map(|r| r.len()).sum()
    }

    /// Expected senders whose message for the current round is outstanding.
    pub fn missing(&self) -> Vec<PartyId> {
        let received = self.seen.get(&self.current);
        self.expected
            .iter()
            .filter(|p| received.map_or(true, |r| !r.contains_key(*p)))
            .cloned()
            .collect()
    }

    /// Move to the next round and return its number.
    pub fn advance(&mut self) -> u16 {
        self.current += 1;
        self.round_started = Instant::now();
        self.current
    }

    pub fn round_elapsed(&self) -> Duration {
        self.round_started.elapsed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::SessionId;

    fn parties() -> Vec<PartyId> {
        vec!["p2".into(), "p3".into(), "p4".into()]
    }

    fn msg(sender: &str, round: u16, payload: &[u8]) -> RoundMessage {
        RoundMessage::new(
            SessionId::from("s"),
            sender.into(),
            1,
            None,
            round,
            payload.to_vec(),
            0,
        )
    }

    #[test]
    fn test_round_tracking() {
        let mut tracker = RoundTracker::new(2, parties());
        assert_eq!(tracker.current(), 1);
        assert_eq!(tracker.missing().len(), 3);

        assert!(tracker.record(1, &"p2".into(), b"a"));
        assert!(!tracker.record(1, &"p2".into(), b"a"));
        assert_eq!(tracker.missing(), vec![PartyId::from("p3"), PartyId::from("p4")]);
    }

    #[test]
    fn test_duplicate_vs_equivocation() {
        let mut tracker = RoundTracker::new(2, parties());
        tracker.record(1, &"p2".into(), b"payload");

        assert_eq!(
            tracker.classify(1, &"p2".into(), b"payload"),
            Classification::Duplicate
        );
        assert_eq!(
            tracker.classify(1, &"p2".into(), b"different"),
            Classification::Equivocation
        );
        assert_eq!(
            tracker.classify(1, &"p3".into(), b"payload"),
            Classification::Current
        );
    }

    #[test]
    fn test_future_round_buffering() {
        let mut tracker = RoundTracker::new(3, parties());
        let early = msg("p3", 2, b"r2");

        assert_eq!(
            tracker.classify(2, &"p3".into(), b"r2"),
            Classification::Future
        );
        tracker.buffer(early.clone());
        assert_eq!(tracker.pending_count(), 1);

        // The same message again is a duplicate, a different one equivocates
        assert_eq!(
            tracker.classify(2, &"p3".into(), b"r2"),
            Classification::Duplicate
        );
        assert_eq!(
            tracker.classify(2, &"p3".into(), b"other"),
            Classification::Equivocation
        );

        assert_eq!(tracker.advance(), 2);
        assert_eq!(tracker.take_pending(2), vec![early]);
        assert_eq!(tracker.pending_count(), 0);
    }

    #[test]
    fn test_stale_and_out_of_range() {
        let mut tracker = RoundTracker::new(2, parties());
        tracker.advance();

        assert_eq!(tracker.classify(1, &"p4".into(), b"x"), Classification::Stale);
        assert_eq!(
            tracker.classify(0, &"p4".into(), b"x"),
            Classification::OutOfRange
        );
        assert_eq!(
            tracker.classify(3, &"p4".into(), b"x"),
            Classification::OutOfRange
        );
    }
}
