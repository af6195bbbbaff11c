use crate::config::SessionSettings;
use crate::torrent::{Torrent, TorrentState};
use std::sync::Arc;
use tracing::debug;

pub struct AutoManageCtx<'a> {
    pub settings: &'a SessionSettings,
    pub session_time: u64,
}

/// Torrents in the *checking* state allowed at a time.
const CHECKING_LIMIT: i64 = 1;

fn unlimited(v: i32) -> i64 {
    if v == -1 {
        i64::MAX
    } else {
        v as i64
    }
}

/// Whether a torrent counts against the active limits. With
/// `dont_count_slow_torrents` every torrent is active; otherwise torrents
/// in their startup grace or with measurable payload traffic are.
fn is_active(t: &Torrent, ctx: &AutoManageCtx<'_>) -> bool {
    if !ctx.settings.dont_count_slow_torrents {
        return true;
    }
    // rates are not meaningful right after start
    if ctx.session_time.saturating_sub(t.started()) < ctx.settings.auto_manage_startup as u64 {
        return true;
    }
    t.upload_payload_rate() != 0 || t.download_payload_rate() != 0
}

struct Limits {
    checking: i64,
    dht: i64,
    tracker: i64,
    lsd: i64,
    hard: i64,
}

fn auto_manage_list(
    list: &[Arc<Torrent>],
    limits: &mut Limits,
    mut type_limit: i64,
    ctx: &AutoManageCtx<'_>,
) {
    for t in list {
        if t.state() == TorrentState::Checking {
            if limits.checking <= 0 {
                t.pause(false);
            } else {
                t.resume();
                t.start_checking();
                limits.checking -= 1;
            }
            continue;
        }

        limits.dht -= 1;
        limits.lsd -= 1;
        limits.tracker -= 1;
        t.set_announce_to_dht(limits.dht >= 0);
        t.set_announce_to_trackers(limits.tracker >= 0);
        t.set_announce_to_lsd(limits.lsd >= 0);

        // inactive torrents occupy a hard slot but keep whatever
        // allow-peers state they have
        if !t.is_paused() && !is_active(t, ctx) && limits.hard > 0 {
            limits.hard -= 1;
            continue;
        }

        if type_limit > 0 && limits.hard > 0 {
            limits.hard -= 1;
            type_limit -= 1;
            if !t.allows_peers() {
                debug!(infohash = %hex::encode(t.info_hash()), "auto manager starting torrent");
            }
            t.set_allow_peers(true, false);
        } else {
            if t.allows_peers() {
                debug!(infohash = %hex::encode(t.info_hash()), "auto manager pausing torrent");
            }
            // graceful pause for auto-managed torrents
            t.set_allow_peers(false, true);
        }
    }
}

/// The periodic auto-manage pass: enforce the active/seed/download and
/// announce limits over every auto-managed torrent.
pub fn recalculate_auto_managed_torrents(
    ctx: &AutoManageCtx<'_>,
    torrents: &[Arc<Torrent>],
    session_paused: bool,
) {
    if session_paused {
        return;
    }

    let settings = ctx.settings;
    let num_downloaders = unlimited(settings.active_downloads);
    let num_seeds = unlimited(settings.active_seeds);
    let mut limits = Limits {
        checking: CHECKING_LIMIT,
        dht: unlimited(settings.active_dht_limit),
        tracker: unlimited(settings.active_tracker_limit),
        lsd: unlimited(settings.active_lsd_limit),
        hard: unlimited(settings.active_limit),
    };

    let mut checking: Vec<Arc<Torrent>> = Vec::new();
    let mut downloaders: Vec<Arc<Torrent>> = Vec::with_capacity(torrents.len());
    let mut seeds: Vec<Arc<Torrent>> = Vec::with_capacity(torrents.len());

    for t in torrents {
        if t.is_auto_managed() && !t.has_error() {
            if t.state() == TorrentState::Checking {
                checking.push(t.clone());
                continue;
            }
            if t.is_finished() {
                seeds.push(t.clone());
            } else {
                downloaders.push(t.clone());
            }
        } else if !t.is_paused() {
            // non-auto-managed torrents still occupy slots
            if t.state() == TorrentState::Checking {
                if limits.checking > 0 {
                    limits.checking -= 1;
                }
                continue;
            }
            limits.hard -= 1;
        }
    }

    checking.sort_by_key(|t| t.sequence_number());
    downloaders.sort_by_key(|t| t.sequence_number());
    seeds.sort_by(|a, b| b.seed_rank(settings).cmp(&a.seed_rank(settings)));

    auto_manage_list(&checking, &mut limits, num_downloaders, ctx);

    if settings.auto_manage_prefer_seeds {
        auto_manage_list(&seeds, &mut limits, num_seeds, ctx);
        auto_manage_list(&downloaders, &mut limits, num_downloaders, ctx);
    } else {
        auto_manage_list(&downloaders, &mut limits, num_downloaders, ctx);
        auto_manage_list(&seeds, &mut limits, num_seeds, ctx);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::torrent::AddTorrentParams;

    fn torrent(tag: u8, seq: u64) -> Arc<Torrent> {
        let mut ih = [0u8; 20];
        ih[0] = tag;
        let mut params = AddTorrentParams::with_info_hash(ih);
        params.metadata = Some(vec![1]);
        Torrent::new(params, seq, 0)
    }

    fn ctx<'a>(settings: &'a SessionSettings) -> AutoManageCtx<'a> {
        AutoManageCtx { settings, session_time: 0 }
    }

    #[test]
    fn downloaders_picked_by_sequence_number() {
        // three downloaders with sequence numbers 2, 0, 1 and room for two:
        // seq 0 and 1 get peers, seq 2 is gracefully paused
        let torrents =
            vec![torrent(1, 2), torrent(2, 0), torrent(3, 1)];
        let mut settings = SessionSettings::default();
        settings.active_downloads = 2;
        settings.active_limit = 5;
        settings.dont_count_slow_torrents = false;
        recalculate_auto_managed_torrents(&ctx(&settings), &torrents, false);

        assert!(!torrents[0].allows_peers());
        assert!(torrents[1].allows_peers());
        assert!(torrents[2].allows_peers());
    }

    #[test]
    fn hard_limit_caps_across_types() {
        let torrents: Vec<_> = (0..4).map(|i| torrent(i as u8 + 1, i)).collect();
        torrents[2].set_finished(true);
        torrents[3].set_finished(true);
        let mut settings = SessionSettings::default();
        settings.active_downloads = 10;
        settings.active_seeds = 10;
        settings.active_limit = 3;
        settings.dont_count_slow_torrents = false;
        recalculate_auto_managed_torrents(&ctx(&settings), &torrents, false);

        let active = torrents.iter().filter(|t| t.allows_peers()).count();
        assert_eq!(active, 3);
    }

    #[test]
    fn announce_sub_limits_assigned_in_order() {
        let torrents: Vec<_> = (0..3).map(|i| torrent(i as u8 + 1, i)).collect();
        let mut settings = SessionSettings::default();
        settings.active_dht_limit = 2;
        settings.dont_count_slow_torrents = false;
        recalculate_auto_managed_torrents(&ctx(&settings), &torrents, false);

        assert!(torrents[0].announce_to_dht());
        assert!(torrents[1].announce_to_dht());
        assert!(!torrents[2].announce_to_dht());
    }

    #[test]
    fn non_auto_managed_consume_hard_slots() {
        let managed = torrent(1, 0);
        let manual = torrent(2, 1);
        manual.set_auto_managed(false);
        let mut settings = SessionSettings::default();
        settings.active_downloads = 5;
        settings.active_limit = 1;
        settings.dont_count_slow_torrents = false;
        recalculate_auto_managed_torrents(&ctx(&settings), &[managed.clone(), manual], false);

        // the manual torrent ate the only hard slot
        assert!(!managed.allows_peers());
    }

    #[test]
    fn startup_grace_counts_as_active() {
        let t = torrent(1, 0);
        let settings = SessionSettings::default();
        // dont_count_slow_torrents is on by default; the torrent just
        // started, so it must consume an active slot
        recalculate_auto_managed_torrents(
            &AutoManageCtx { settings: &settings, session_time: 10 },
            &[t.clone()],
            false,
        );
        assert!(t.allows_peers());
    }

    #[test]
    fn slow_torrent_keeps_state_without_consuming_type_slot() {
        let slow = torrent(1, 0);
        let fresh = torrent(2, 1);
        let mut settings = SessionSettings::default();
        settings.active_downloads = 1;
        settings.active_limit = 5;
        settings.auto_manage_startup = 60;
        // past the startup grace with zero rates: slow
        let c = AutoManageCtx { settings: &settings, session_time: 1000 };
        slow.restart_started(0);
        fresh.restart_started(990);
        recalculate_auto_managed_torrents(&c, &[slow.clone(), fresh.clone()], false);

        // the slow torrent keeps its allow-peers state and does not eat
        // the downloader slot; the fresh torrent gets it
        assert!(slow.allows_peers());
        assert!(fresh.allows_peers());
    }

    #[test]
    fn checking_limit_is_one() {
        let a = torrent(1, 0);
        let b = torrent(2, 1);
        a.start_checking();
        b.start_checking();
        let mut settings = SessionSettings::default();
        settings.dont_count_slow_torrents = false;
        recalculate_auto_managed_torrents(&ctx(&settings), &[a.clone(), b.clone()], false);

        assert!(!a.is_paused());
        assert!(b.is_paused());
    }

    #[test]
    fn session_pause_skips_the_pass() {
        let t = torrent(1, 0);
        t.set_allow_peers(false, false);
        let settings = SessionSettings::default();
        recalculate_auto_managed_torrents(&ctx(&settings), &[t.clone()], true);
        assert!(!t.allows_peers());
    }
}
