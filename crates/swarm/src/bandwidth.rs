use crate::peer_class::{PeerClassPool, PeerClassSet};
use std::collections::VecDeque;
use std::time::Duration;

pub const UPLOAD_CHANNEL: usize = 0;
pub const DOWNLOAD_CHANNEL: usize = 1;
pub const NUM_CHANNELS: usize = 2;

/// One direction of a peer class. A throttle of zero means unlimited.
#[derive(Debug, Clone, Default)]
pub struct BandwidthChannel {
    throttle: i64,
    quota: i64,
}

impl BandwidthChannel {
    /// Bytes of burst the quota may accumulate, in throttle-seconds.
    const BURST_WINDOW: i64 = 3;

    pub fn throttle(&self) -> i64 {
        self.throttle
    }

    pub fn set_throttle(&mut self, limit: i64) {
        self.throttle = limit.max(0);
        if self.throttle == 0 {
            self.quota = 0;
        }
    }

    pub fn quota_left(&self) -> i64 {
        if self.throttle == 0 {
            i64::MAX
        } else {
            self.quota
        }
    }

    /// Consume quota. Unthrottled channels accept everything; throttled
    /// channels may go negative (overhead accounting charges after the
    /// fact).
    pub fn use_quota(&mut self, amount: i64) {
        if self.throttle == 0 {
            return;
        }
        self.quota -= amount;
    }

    /// Refill proportionally to elapsed wall time.
    pub fn update_quota(&mut self, elapsed: Duration) {
        if self.throttle == 0 {
            return;
        }
        let add = self.throttle * elapsed.as_millis() as i64 / 1000;
        self.quota = (self.quota + add).min(self.throttle * Self::BURST_WINDOW);
    }
}

#[derive(Debug)]
struct BandwidthRequest {
    amount: i64,
    classes: PeerClassSet,
}

/// Quota accounting for one direction across all peer classes. Requests
/// that cannot be satisfied from the pertinent channels' quotas queue up
/// and drain FIFO as quota refills; the queue depth feeds the auto-expand
/// choker.
pub struct BandwidthManager {
    channel: usize,
    queue: VecDeque<BandwidthRequest>,
    closed: bool,
}

impl BandwidthManager {
    pub fn new(channel: usize) -> Self {
        Self { channel, queue: VecDeque::new(), closed: false }
    }

    pub fn queue_size(&self) -> usize {
        self.queue.len()
    }

    /// Try to grant `amount` bytes against every throttled channel in
    /// `classes`. Returns the granted amount, or 0 if the request was
    /// queued.
    pub fn request_bandwidth(
        &mut self,
        pool: &mut PeerClassPool,
        classes: &PeerClassSet,
        amount: i64,
    ) -> i64 {
        if self.closed {
            return 0;
        }
        if self.try_grant(pool, classes, amount) {
            amount
        } else {
            self.queue.push_back(BandwidthRequest { amount, classes: classes.clone() });
            0
        }
    }

    fn try_grant(&self, pool: &mut PeerClassPool, classes: &PeerClassSet, amount: i64) -> bool {
        let channel = self.channel;
        for id in classes.iter() {
            if let Some(pc) = pool.at(id) {
                if pc.channel[channel].quota_left() < amount {
                    return false;
                }
            }
        }
        for id in classes.iter() {
            if let Some(pc) = pool.at_mut(id) {
                pc.channel[channel].use_quota(amount);
            }
        }
        true
    }

    /// Refill all throttled channels and drain the head of the queue while
    /// quota lasts. Returns the total bytes granted from the queue.
    pub fn update_quotas(&mut self, pool: &mut PeerClassPool, elapsed: Duration) -> i64 {
        if self.closed {
            return 0;
        }
        let channel = self.channel;
        pool.for_each_class(|pc| pc.channel[channel].update_quota(elapsed));

        let mut granted = 0;
        while let Some(head) = self.queue.front() {
            let amount = head.amount;
            let classes = head.classes.clone();
            if !self.try_grant(pool, &classes, amount) {
                break;
            }
            granted += amount;
            self.queue.pop_front();
        }
        granted
    }

    pub fn close(&mut self) {
        self.closed = true;
        self.queue.clear();
    }
}
