use rand::rngs::SmallRng;
use rand::{RngCore, SeedableRng};
use tokio::time::Instant;

/// Session-time counters wrap around 18.2 hours; past this point the epoch
/// is stepped forward to pull them back (see the per-second tick).
pub const SESSION_TIME_WRAP_THRESHOLD: u64 = 65_000;

/// Cached monotonic clock. `now` is refreshed once per tick so that every
/// decision inside a tick sees the same timestamp.
#[derive(Debug, Clone)]
pub struct SessionClock {
    created: Instant,
    now: Instant,
}

impl SessionClock {
    pub fn new() -> Self {
        let now = Instant::now();
        Self { created: now, now }
    }

    /// Refresh the cached time. Called at the top of each tick.
    pub fn update(&mut self) -> Instant {
        self.now = Instant::now();
        self.now
    }

    pub fn now(&self) -> Instant {
        self.now
    }

    /// Seconds since the session epoch, as stored in per-peer timestamps.
    pub fn session_time(&self) -> u64 {
        self.now.saturating_duration_since(self.created).as_secs()
    }

    /// Step the epoch forward, shrinking `session_time` by `secs`. Every
    /// stored session-time counter must be stepped by the same amount.
    pub fn step_epoch(&mut self, secs: u64) {
        self.created += std::time::Duration::from_secs(secs);
        if self.created > self.now {
            self.created = self.now;
        }
    }
}

impl Default for SessionClock {
    fn default() -> Self {
        Self::new()
    }
}

/// Session-wide PRNG. Seeded from entropy at startup; tests seed it
/// explicitly for reproducible shuffles.
pub struct SessionRng(SmallRng);

impl SessionRng {
    pub fn new() -> Self {
        Self(SmallRng::from_entropy())
    }

    pub fn from_seed(seed: u64) -> Self {
        Self(SmallRng::seed_from_u64(seed))
    }

    pub fn next_u32(&mut self) -> u32 {
        self.0.next_u32()
    }

    pub fn fill_bytes(&mut self, dest: &mut [u8]) {
        self.0.fill_bytes(dest)
    }

    pub fn rng(&mut self) -> &mut SmallRng {
        &mut self.0
    }
}

impl Default for SessionRng {
    fn default() -> Self {
        Self::new()
    }
}

/// 20-byte peer id: client fingerprint prefix, random remainder.
pub fn generate_peer_id(fingerprint: &str, rng: &mut SessionRng) -> [u8; 20] {
    let mut id = [0u8; 20];
    let prefix = fingerprint.as_bytes();
    let n = prefix.len().min(20);
    id[..n].copy_from_slice(&prefix[..n]);
    rng.fill_bytes(&mut id[n..]);
    id
}
