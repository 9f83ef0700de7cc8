use std::collections::BTreeMap;

/// Releases acknowledgements in the order their messages were received.
///
/// Shards settle messages independently and out of order. A settled ack is held
/// back until every earlier message has settled. A message settled without an
/// ack (left for redelivery) unblocks its successors and emits nothing.
#[derive(Debug)]
pub struct AckSequencer<T> {
    next_seq: u64,
    release_from: u64,
    settled: BTreeMap<u64, Option<T>>,
}

impl<T> Default for AckSequencer<T> {
    fn default() -> Self {
        Self {
            next_seq: 0,
            release_from: 0,
            settled: BTreeMap::new(),
        }
    }
}

impl<T> AckSequencer<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sequence number for the next received message.
    pub fn register(&mut self) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        seq
    }

    /// Settle `seq` and return every ack that is now releasable, in receipt order.
    ///
    /// Unknown or already released sequence numbers are ignored.
    pub fn settle(&mut self, seq: u64, ack: Option<T>) -> Vec<T> {
        if seq < self.release_from || seq >= self.next_seq {
            return Vec::new();
        }
        self.settled.insert(seq, ack);

        let mut ready = Vec::new();
        while let Some(entry) = self.settled.remove(&self.release_from) {
            self.release_from += 1;
            ready.extend(entry);
        }
        ready
    }

    /// Forget everything registered so far, e.g. after a reconnect.
    ///
    /// Acks of earlier messages are never released; the broker redelivers them.
    pub fn reset(&mut self) {
        self.settled.clear();
        self.release_from = self.next_seq;
    }

    pub fn outstanding(&self) -> u64 {
        self.next_seq - self.release_from
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn out_of_order_settlement_releases_in_receipt_order() {
        let mut seq = AckSequencer::new();
        let ids: Vec<u64> = (0..4).map(|_| seq.register()).collect();

        assert!(seq.settle(ids[2], Some("c")).is_empty());
        assert!(seq.settle(ids[1], Some("b")).is_empty());
        assert_eq!(seq.settle(ids[0], Some("a")), vec!["a", "b", "c"]);
        assert_eq!(seq.outstanding(), 1);
        assert_eq!(seq.settle(ids[3], Some("d")), vec!["d"]);
        assert_eq!(seq.outstanding(), 0);
    }

    #[test]
    fn unacked_message_does_not_block_successors() {
        let mut seq = AckSequencer::new();
        let a = seq.register();
        let b = seq.register();

        assert!(seq.settle(b, Some("b")).is_empty());
        assert_eq!(seq.settle(a, None), vec!["b"]);
    }

    #[test]
    fn reset_discards_acks_from_the_previous_session() {
        let mut seq = AckSequencer::new();
        let old = seq.register();
        seq.reset();
        let fresh = seq.register();

        assert!(seq.settle(old, Some("old")).is_empty());
        assert_eq!(seq.settle(fresh, Some("fresh")), vec!["fresh"]);
    }

    #[test]
    fn duplicate_and_unknown_sequence_numbers_are_ignored() {
        let mut seq = AckSequencer::new();
        let a = seq.register();

        assert!(seq.settle(7, Some("bogus")).is_empty());
        assert_eq!(seq.settle(a, Some("a")), vec!["a"]);
        assert!(seq.settle(a, Some("again")).is_empty());
    }
}
