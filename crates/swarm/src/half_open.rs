use std::collections::HashSet;

/// Token handed out for one pending outbound connect attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectTicket(u64);

/// Bounded budget of concurrent outbound TCP SYNs. A limit of zero means
/// unlimited; the historical platform ceiling (Windows XP SP2 era) is
/// unknown here, so absent a configured limit everything is allowed.
pub struct HalfOpen {
    limit: i32,
    pending: HashSet<u64>,
    next_ticket: u64,
    closed: bool,
}

impl HalfOpen {
    pub fn new(limit: i32) -> Self {
        Self { limit: limit.max(0), pending: HashSet::new(), next_ticket: 0, closed: false }
    }

    pub fn limit(&self) -> i32 {
        self.limit
    }

    pub fn set_limit(&mut self, limit: i32) {
        self.limit = limit.max(0);
    }

    pub fn in_flight(&self) -> usize {
        self.pending.len()
    }

    pub fn free_slots(&self) -> i32 {
        if self.limit == 0 {
            i32::MAX
        } else {
            self.limit - self.pending.len() as i32
        }
    }

    /// Claim a slot for a connect attempt. `None` when the budget is
    /// exhausted or the connector is closed.
    pub fn enqueue(&mut self) -> Option<ConnectTicket> {
        if self.closed {
            return None;
        }
        if self.limit != 0 && self.pending.len() as i32 >= self.limit {
            return None;
        }
        let ticket = ConnectTicket(self.next_ticket);
        self.next_ticket += 1;
        self.pending.insert(ticket.0);
        Some(ticket)
    }

    /// The attempt finished (success or failure); its slot is released.
    pub fn done(&mut self, ticket: ConnectTicket) {
        self.pending.remove(&ticket.0);
    }

    /// Cancel a pending attempt. Returns whether it was still pending.
    pub fn cancel(&mut self, ticket: ConnectTicket) -> bool {
        self.pending.remove(&ticket.0)
    }

    pub fn close(&mut self) {
        self.closed = true;
        self.pending.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_limit_is_unlimited() {
        let mut ho = HalfOpen::new(0);
        for _ in 0..1000 {
            assert!(ho.enqueue().is_some());
        }
        assert_eq!(ho.free_slots(), i32::MAX);
    }

    #[test]
    fn limit_enforced_and_released() {
        let mut ho = HalfOpen::new(2);
        let a = ho.enqueue().unwrap();
        let _b = ho.enqueue().unwrap();
        assert!(ho.enqueue().is_none());
        assert_eq!(ho.free_slots(), 0);
        ho.done(a);
        assert_eq!(ho.free_slots(), 1);
        assert!(ho.enqueue().is_some());
    }

    #[test]
    fn cancel_is_idempotent() {
        let mut ho = HalfOpen::new(1);
        let t = ho.enqueue().unwrap();
        assert!(ho.cancel(t));
        assert!(!ho.cancel(t));
        assert_eq!(ho.in_flight(), 0);
    }

    #[test]
    fn closed_rejects() {
        let mut ho = HalfOpen::new(0);
        ho.close();
        assert!(ho.enqueue().is_none());
    }
}
