use crate::clock::SessionRng;
use crate::config::{ChokingAlgorithm, SessionSettings};
use crate::peer::PeerConnection;
use rand::seq::SliceRandom;
use std::sync::Arc;
use tracing::debug;

/// Inputs the unchoke pass needs from the wider session.
pub struct UnchokeCtx<'a> {
    pub settings: &'a SessionSettings,
    pub session_time: u64,
    /// Milliseconds since the previous unchoke pass.
    pub interval_ms: u64,
    /// Global upload throttle (0 = unlimited).
    pub upload_throttle: i64,
    /// Measured session-wide upload rate, bytes/s.
    pub upload_rate: i64,
    /// Depth of the upload bandwidth-manager queue.
    pub upload_queue_size: usize,
    /// Highest observed session upload rate, bytes/s.
    pub peak_upload_rate: i64,
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct UnchokeOutcome {
    pub num_unchoked: usize,
    pub allowed_upload_slots: i32,
    /// An optimistically-unchoked peer was promoted or invalidated; force
    /// a fresh optimistic rotation next tick.
    pub reset_optimistic_scaler: bool,
    /// BitTyrant is running without an upload limit; warn once.
    pub bittyrant_without_limit: bool,
}

/// Count upload slots for the rate-based choker: walk rates in descending
/// order, including peers while their rate crosses a threshold that starts
/// at 1024 B/s and grows 1024 per included peer, then allow one optimistic
/// slot on top.
pub fn rate_based_slots(sorted_rates: &[i64]) -> i32 {
    let mut threshold = 1024i64;
    let mut slots = 0i32;
    for &rate in sorted_rates {
        if rate < threshold {
            break;
        }
        slots += 1;
        threshold += 1024;
    }
    slots + 1
}

fn peer_upload_rate(p: &PeerConnection, interval_ms: u64) -> i64 {
    p.statistics().uploaded_in_last_round() * 1000 / interval_ms.max(1) as i64
}

/// The periodic unchoke pass: pick the unchoked set among all interested,
/// unchokable peers according to the configured algorithm.
pub fn recalculate_unchoke_slots(
    ctx: &UnchokeCtx<'_>,
    connections: &[Arc<PeerConnection>],
    mut allowed_upload_slots: i32,
) -> UnchokeOutcome {
    let algorithm = ctx.settings.choking_algorithm;
    let mut out = UnchokeOutcome::default();

    // build the list of unchokable peers; choke the ones that dropped out
    // of the candidate set while unchoked
    let mut peers: Vec<Arc<PeerConnection>> = Vec::with_capacity(connections.len());
    for p in connections {
        let t = match p.associated_torrent() {
            Some(t) => t,
            None => continue,
        };
        if p.ignore_unchoke_slots() || p.is_web_seed() || t.is_paused() {
            continue;
        }

        if algorithm == ChokingAlgorithm::BitTyrant && !p.is_choked() && p.is_interesting() {
            if !p.has_peer_choked() {
                // we're unchoked by this peer, the estimate may come down
                p.decrease_est_reciprocation_rate();
            } else {
                // unchoked it and it has not reciprocated
                p.increase_est_reciprocation_rate();
            }
        }

        if !p.is_peer_interested() || p.is_disconnecting() || p.is_connecting() {
            // not unchokable; if it's currently unchoked, take the slot back
            if p.is_choked() {
                continue;
            }
            if p.is_optimistically_unchoked() {
                p.set_optimistically_unchoked(false);
                out.reset_optimistic_scaler = true;
            }
            t.choke_peer(p);
            continue;
        }
        if !t.valid_metadata() || !t.free_upload_slots() {
            continue;
        }
        peers.push(p.clone());
    }

    if algorithm == ChokingAlgorithm::RateBased {
        peers.sort_by(PeerConnection::upload_rate_compare);
        let rates: Vec<i64> =
            peers.iter().map(|p| peer_upload_rate(p, ctx.interval_ms)).collect();
        allowed_upload_slots = rate_based_slots(&rates);
    }

    if algorithm == ChokingAlgorithm::BitTyrant {
        // sort by return on investment: download rate per reciprocation
        peers.sort_by(PeerConnection::bittyrant_unchoke_compare);
    } else {
        peers.sort_by(PeerConnection::unchoke_compare);
    }

    // auto-expand: grow the budget while upload capacity is going unused,
    // shrink it when the upload queue backs up
    if algorithm == ChokingAlgorithm::AutoExpand && ctx.upload_throttle > 0 {
        let num_unchoked_now = connections
            .iter()
            .filter(|p| !p.is_choked() && !p.ignore_unchoke_slots())
            .count() as i32;
        if ctx.upload_rate < ctx.upload_throttle * 9 / 10
            && allowed_upload_slots <= num_unchoked_now + 1
            && ctx.upload_queue_size < 2
        {
            allowed_upload_slots += 1;
        } else if ctx.upload_queue_size > 1
            && allowed_upload_slots > ctx.settings.unchoke_slots_limit
            && ctx.settings.unchoke_slots_limit >= 0
        {
            allowed_upload_slots -= 1;
        }
    }

    let mut num_opt_unchoke = ctx.settings.num_optimistic_unchoke_slots as i32;
    if num_opt_unchoke == 0 {
        num_opt_unchoke = 1.max(allowed_upload_slots / 5);
    }

    // reserve slots for the optimistic rotation
    let mut unchoke_set_size = allowed_upload_slots - num_opt_unchoke;

    let mut upload_capacity_left = 0i64;
    if algorithm == ChokingAlgorithm::BitTyrant {
        upload_capacity_left = ctx.upload_throttle;
        if upload_capacity_left == 0 {
            // no limit configured; fall back to the measured peak plus
            // headroom, or a floor when there is no measurement yet
            upload_capacity_left = 20_000.max(ctx.peak_upload_rate + 10_000);
            out.bittyrant_without_limit = true;
        }
    }

    let mut num_unchoked = 0usize;
    for p in peers.iter() {
        let t = match p.associated_torrent() {
            Some(t) => t,
            None => continue,
        };

        p.reset_choke_counters();

        let unchoke = if algorithm == ChokingAlgorithm::BitTyrant {
            p.est_reciprocation_rate() <= upload_capacity_left
        } else {
            unchoke_set_size > 0
        };

        if unchoke {
            upload_capacity_left -= p.est_reciprocation_rate();

            if p.is_choked() && !t.unchoke_peer(p, false) {
                continue;
            }

            unchoke_set_size -= 1;
            num_unchoked += 1;

            if p.is_optimistically_unchoked() {
                // promoted into the proper set; force a new optimistic
                // rotation next tick
                out.reset_optimistic_scaler = true;
                p.set_optimistically_unchoked(false);
            }
        } else {
            if !p.is_choked() && !p.is_optimistically_unchoked() {
                t.choke_peer(p);
            }
            if !p.is_choked() {
                num_unchoked += 1;
            }
        }
    }

    debug!(
        num_unchoked,
        allowed_upload_slots,
        algorithm = ?algorithm,
        "unchoke pass done"
    );

    out.num_unchoked = num_unchoked;
    out.allowed_upload_slots = allowed_upload_slots;
    out
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct OptimisticOutcome {
    /// Net change to the session's unchoked-peer count.
    pub num_unchoked_delta: i64,
}

/// The optimistic-unchoke rotation: pick the peers that have waited
/// longest for an optimistic slot, unchoke the first N and choke the
/// previously-optimistic peers beyond N.
pub fn recalculate_optimistic_unchoke_slots(
    ctx: &UnchokeCtx<'_>,
    connections: &[Arc<PeerConnection>],
    allowed_upload_slots: i32,
    rng: &mut SessionRng,
) -> OptimisticOutcome {
    let mut out = OptimisticOutcome::default();
    if allowed_upload_slots == 0 {
        return out;
    }

    let mut opt_unchoke: Vec<Arc<PeerConnection>> = Vec::new();
    for p in connections {
        if p.is_web_seed() {
            continue;
        }
        let t = match p.associated_torrent() {
            Some(t) => t,
            None => continue,
        };
        if t.is_paused() {
            continue;
        }

        if p.is_optimistically_unchoked() {
            debug_assert!(!p.is_choked());
            opt_unchoke.push(p.clone());
        } else if !p.is_connecting()
            && !p.is_disconnecting()
            && p.is_peer_interested()
            && t.free_upload_slots()
            && p.is_choked()
            && !p.ignore_unchoke_slots()
            && t.valid_metadata()
        {
            opt_unchoke.push(p.clone());
        }
    }

    // avoid a bias towards peers that happen to be listed first
    opt_unchoke.shuffle(rng.rng());
    // oldest optimistic unchoke first
    opt_unchoke.sort_by_key(|p| p.last_optimistically_unchoked());

    let mut num_opt_unchoke = ctx.settings.num_optimistic_unchoke_slots as i32;
    if num_opt_unchoke == 0 {
        num_opt_unchoke = 1.max(allowed_upload_slots / 5);
    }

    for p in opt_unchoke.iter() {
        let t = match p.associated_torrent() {
            Some(t) => t,
            None => continue,
        };
        if num_opt_unchoke > 0 {
            num_opt_unchoke -= 1;
            if !p.is_optimistically_unchoked() {
                if t.unchoke_peer(p, true) {
                    p.set_optimistically_unchoked(true);
                    p.set_last_optimistically_unchoked(ctx.session_time);
                    out.num_unchoked_delta += 1;
                } else {
                    // failed to unchoke it, give the slot back
                    num_opt_unchoke += 1;
                }
            }
        } else if p.is_optimistically_unchoked() {
            p.set_optimistically_unchoked(false);
            t.choke_peer(p);
            out.num_unchoked_delta -= 1;
        }
    }

    out
}
