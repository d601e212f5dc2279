//! Byte-credit accounting towards the overflow sink.

use tracing::warn;

#[derive(Debug, Clone)]
/// Tracks bytes sent to and acknowledged by one overflow sink.
///
/// Sending is permitted while `sent - acked <= window`. Acknowledgments are
/// absolute running totals reported by the sink.
pub struct CreditTracker {
    sent_bytes: u64,
    acked_bytes: u64,
    window_bytes: u64,
}

impl CreditTracker {
    pub fn new(window_bytes: u64) -> Self {
        Self {
            sent_bytes: 0,
            acked_bytes: 0,
            window_bytes,
        }
    }

    pub fn can_send(&self) -> bool {
        self.in_flight() <= self.window_bytes
    }

    pub fn record_send(&mut self, bytes: u64) {
        self.sent_bytes = self.sent_bytes.saturating_add(bytes);
    }

    /// Apply the sink's reported running total.
    ///
    /// Totals never move backwards and never exceed what was sent.
    pub fn record_ack(&mut self, total_acked: u64) {
        if total_acked > self.sent_bytes {
            warn!(
                reported = total_acked,
                sent = self.sent_bytes,
                "overflow sink acknowledged more bytes than were sent"
            );
        }
        self.acked_bytes = self.acked_bytes.max(total_acked.min(self.sent_bytes));
    }

    pub fn in_flight(&self) -> u64 {
        self.sent_bytes - self.acked_bytes
    }

    pub fn sent_bytes(&self) -> u64 {
        self.sent_bytes
    }

    pub fn acked_bytes(&self) -> u64 {
        self.acked_bytes
    }

    pub fn window_bytes(&self) -> u64 {
        self.window_bytes
    }
}

#[cfg(test)]
mod tests {
    use super::CreditTracker;

    #[test]
    fn window_gates_sends_until_acked() {
        let mut c = CreditTracker::new(100);
        assert!(c.can_send());
        c.record_send(60);
        assert!(c.can_send());
        c.record_send(60);
        assert_eq!(c.in_flight(), 120);
        assert!(!c.can_send());

        c.record_ack(60);
        assert_eq!(c.in_flight(), 60);
        assert!(c.can_send());
    }

    #[test]
    fn exactly_full_window_still_allows_send() {
        let mut c = CreditTracker::new(100);
        c.record_send(100);
        assert!(c.can_send());
        c.record_send(1);
        assert!(!c.can_send());
    }

    #[test]
    fn acks_are_absolute_monotonic_and_capped() {
        let mut c = CreditTracker::new(10);
        c.record_send(50);
        c.record_ack(30);
        c.record_ack(20);
        assert_eq!(c.acked_bytes(), 30);
        c.record_ack(80);
        assert_eq!(c.acked_bytes(), 50);
        assert_eq!(c.in_flight(), 0);
    }
}
