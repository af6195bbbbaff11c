//! Persisted session state: a bencoded dictionary segmented by category
//! (`settings`, `dht state`, ...). Loading is forward compatible: unknown
//! keys and unknown categories are skipped.

use crate::config::{ChokingAlgorithm, MixedModeAlgorithm, SessionSettings};
use crate::error::SwarmError;
use bendy::decoding::Decoder;
use swarm_krpc::bencode::{write_bstr, write_int, write_str};

pub const SAVE_SETTINGS: u32 = 1;
pub const SAVE_DHT_STATE: u32 = 2;
pub const SAVE_ALL: u32 = SAVE_SETTINGS | SAVE_DHT_STATE;

enum Val {
    Int(i64),
    Str(String),
}

fn choking_to_int(a: ChokingAlgorithm) -> i64 {
    match a {
        ChokingAlgorithm::FixedSlots => 0,
        ChokingAlgorithm::AutoExpand => 1,
        ChokingAlgorithm::RateBased => 2,
        ChokingAlgorithm::BitTyrant => 3,
    }
}

fn choking_from_int(v: i64) -> Option<ChokingAlgorithm> {
    match v {
        0 => Some(ChokingAlgorithm::FixedSlots),
        1 => Some(ChokingAlgorithm::AutoExpand),
        2 => Some(ChokingAlgorithm::RateBased),
        3 => Some(ChokingAlgorithm::BitTyrant),
        _ => None,
    }
}

fn mixed_to_int(a: MixedModeAlgorithm) -> i64 {
    match a {
        MixedModeAlgorithm::PreferTcp => 0,
        MixedModeAlgorithm::PeerProportional => 1,
    }
}

fn settings_pairs(s: &SessionSettings) -> Vec<(&'static str, Val)> {
    vec![
        ("active_dht_limit", Val::Int(s.active_dht_limit as i64)),
        ("active_downloads", Val::Int(s.active_downloads as i64)),
        ("active_limit", Val::Int(s.active_limit as i64)),
        ("active_loaded_limit", Val::Int(s.active_loaded_limit as i64)),
        ("active_lsd_limit", Val::Int(s.active_lsd_limit as i64)),
        ("active_seeds", Val::Int(s.active_seeds as i64)),
        ("active_tracker_limit", Val::Int(s.active_tracker_limit as i64)),
        ("anonymous_mode", Val::Int(s.anonymous_mode as i64)),
        ("auto_manage_interval", Val::Int(s.auto_manage_interval as i64)),
        ("auto_manage_startup", Val::Int(s.auto_manage_startup as i64)),
        ("choking_algorithm", Val::Int(choking_to_int(s.choking_algorithm))),
        ("connect_seed_every_n_download", Val::Int(s.connect_seed_every_n_download as i64)),
        ("connection_speed", Val::Int(s.connection_speed as i64)),
        ("connections_limit", Val::Int(s.connections_limit as i64)),
        ("connections_slack", Val::Int(s.connections_slack as i64)),
        ("dht_announce_interval", Val::Int(s.dht_announce_interval as i64)),
        ("dht_upload_rate_limit", Val::Int(s.dht_upload_rate_limit)),
        ("enable_incoming_tcp", Val::Int(s.enable_incoming_tcp as i64)),
        ("enable_incoming_utp", Val::Int(s.enable_incoming_utp as i64)),
        ("force_proxy", Val::Int(s.force_proxy as i64)),
        ("half_open_limit", Val::Int(s.half_open_limit as i64)),
        ("handshake_timeout", Val::Int(s.handshake_timeout as i64)),
        ("listen_interfaces", Val::Str(s.listen_interfaces.clone())),
        ("listen_system_port_fallback", Val::Int(s.listen_system_port_fallback as i64)),
        ("local_service_announce_interval", Val::Int(s.local_service_announce_interval as i64)),
        ("max_retry_port_bind", Val::Int(s.max_retry_port_bind as i64)),
        ("mixed_mode_algorithm", Val::Int(mixed_to_int(s.mixed_mode_algorithm))),
        ("num_optimistic_unchoke_slots", Val::Int(s.num_optimistic_unchoke_slots as i64)),
        ("outgoing_interfaces", Val::Str(s.outgoing_interfaces.clone())),
        ("peer_turnover", Val::Int(s.peer_turnover as i64)),
        ("peer_turnover_cutoff", Val::Int(s.peer_turnover_cutoff as i64)),
        ("peer_turnover_interval", Val::Int(s.peer_turnover_interval as i64)),
        ("unchoke_interval", Val::Int(s.unchoke_interval as i64)),
        ("unchoke_slots_limit", Val::Int(s.unchoke_slots_limit as i64)),
    ]
}

/// Serialize the selected categories. Keys inside each dictionary are
/// emitted sorted, as bencode requires.
pub fn save_state(
    settings: &SessionSettings,
    dht_node_id: Option<&[u8; 20]>,
    categories: u32,
) -> Vec<u8> {
    let mut out = Vec::with_capacity(1024);
    out.push(b'd');
    if categories & SAVE_DHT_STATE != 0 {
        if let Some(id) = dht_node_id {
            write_str(&mut out, "dht state");
            out.push(b'd');
            write_str(&mut out, "node-id");
            write_bstr(&mut out, id);
            out.push(b'e');
        }
    }
    if categories & SAVE_SETTINGS != 0 {
        write_str(&mut out, "settings");
        out.push(b'd');
        let mut pairs = settings_pairs(settings);
        pairs.sort_by(|a, b| a.0.cmp(b.0));
        for (key, val) in pairs {
            write_str(&mut out, key);
            match val {
                Val::Int(v) => write_int(&mut out, v),
                Val::Str(v) => write_str(&mut out, &v),
            }
        }
        out.push(b'e');
    }
    out.push(b'e');
    out
}

#[derive(Debug, Default)]
pub struct LoadedState {
    pub dht_node_id: Option<[u8; 20]>,
}

fn apply_setting(s: &mut SessionSettings, key: &[u8], int: Option<i64>, text: Option<&[u8]>) {
    let v = int.unwrap_or(0);
    match key {
        b"active_dht_limit" => s.active_dht_limit = v as i32,
        b"active_downloads" => s.active_downloads = v as i32,
        b"active_limit" => s.active_limit = v as i32,
        b"active_loaded_limit" => s.active_loaded_limit = v.max(0) as usize,
        b"active_lsd_limit" => s.active_lsd_limit = v as i32,
        b"active_seeds" => s.active_seeds = v as i32,
        b"active_tracker_limit" => s.active_tracker_limit = v as i32,
        b"anonymous_mode" => s.anonymous_mode = v != 0,
        b"auto_manage_interval" => s.auto_manage_interval = v as i32,
        b"auto_manage_startup" => s.auto_manage_startup = v.max(0) as u32,
        b"choking_algorithm" => {
            if let Some(a) = choking_from_int(v) {
                s.choking_algorithm = a;
            }
        }
        b"connect_seed_every_n_download" => s.connect_seed_every_n_download = v.max(0) as u32,
        b"connection_speed" => s.connection_speed = v as i32,
        b"connections_limit" => s.connections_limit = v.max(0) as usize,
        b"connections_slack" => s.connections_slack = v.max(0) as usize,
        b"dht_announce_interval" => s.dht_announce_interval = v.max(0) as u64,
        b"dht_upload_rate_limit" => s.dht_upload_rate_limit = v,
        b"enable_incoming_tcp" => s.enable_incoming_tcp = v != 0,
        b"enable_incoming_utp" => s.enable_incoming_utp = v != 0,
        b"force_proxy" => s.force_proxy = v != 0,
        b"half_open_limit" => s.half_open_limit = v as i32,
        b"handshake_timeout" => s.handshake_timeout = v.max(0) as u64,
        b"listen_interfaces" => {
            if let Some(t) = text {
                s.listen_interfaces = String::from_utf8_lossy(t).into_owned();
            }
        }
        b"listen_system_port_fallback" => s.listen_system_port_fallback = v != 0,
        b"local_service_announce_interval" => {
            s.local_service_announce_interval = v.max(0) as u64
        }
        b"max_retry_port_bind" => s.max_retry_port_bind = v.max(0) as u32,
        b"mixed_mode_algorithm" => {
            s.mixed_mode_algorithm = if v == 0 {
                MixedModeAlgorithm::PreferTcp
            } else {
                MixedModeAlgorithm::PeerProportional
            }
        }
        b"num_optimistic_unchoke_slots" => s.num_optimistic_unchoke_slots = v.max(0) as usize,
        b"outgoing_interfaces" => {
            if let Some(t) = text {
                s.outgoing_interfaces = String::from_utf8_lossy(t).into_owned();
            }
        }
        b"peer_turnover" => s.peer_turnover = v.max(0) as u32,
        b"peer_turnover_cutoff" => s.peer_turnover_cutoff = v.max(0) as u32,
        b"peer_turnover_interval" => s.peer_turnover_interval = v as i32,
        b"unchoke_interval" => s.unchoke_interval = v as i32,
        b"unchoke_slots_limit" => s.unchoke_slots_limit = v as i32,
        // unknown keys are ignored for forward compatibility
        _ => {}
    }
}

/// Load a state blob produced by [`save_state`] (possibly by a newer
/// version). Recognised settings overwrite `settings` in place.
pub fn load_state(data: &[u8], settings: &mut SessionSettings) -> Result<LoadedState, SwarmError> {
    let mut loaded = LoadedState::default();
    let mut decoder = Decoder::new(data);
    let obj = decoder
        .next_object()?
        .ok_or_else(|| SwarmError::Bencode("empty state".to_string()))?;
    let mut dict = obj
        .try_into_dictionary()
        .map_err(|e| SwarmError::Bencode(e.to_string()))?;

    while let Ok(Some((category, v))) = dict.next_pair() {
        match category {
            b"settings" => {
                if let Ok(mut sdict) = v.try_into_dictionary() {
                    while let Ok(Some((k, sv))) = sdict.next_pair() {
                        match sv {
                            bendy::decoding::Object::Integer(i) => {
                                apply_setting(settings, k, i.parse::<i64>().ok(), None);
                            }
                            bendy::decoding::Object::Bytes(b) => {
                                apply_setting(settings, k, None, Some(b));
                            }
                            _ => {}
                        }
                    }
                }
            }
            b"dht state" => {
                if let Ok(mut ddict) = v.try_into_dictionary() {
                    while let Ok(Some((k, dv))) = ddict.next_pair() {
                        if k == b"node-id" {
                            if let Ok(b) = dv.try_into_bytes() {
                                if b.len() == 20 {
                                    let mut id = [0u8; 20];
                                    id.copy_from_slice(b);
                                    loaded.dht_node_id = Some(id);
                                }
                            }
                        }
                    }
                }
            }
            // unknown categories are ignored for forward compatibility
            _ => {}
        }
    }
    Ok(loaded)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn settings_round_trip() {
        let mut original = SessionSettings::default();
        original.connections_limit = 77;
        original.connections_slack = 3;
        original.choking_algorithm = ChokingAlgorithm::RateBased;
        original.unchoke_slots_limit = 12;
        original.active_downloads = -1;
        original.anonymous_mode = true;

        let blob = save_state(&original, Some(&[9u8; 20]), SAVE_ALL);

        let mut restored = SessionSettings::default();
        let loaded = load_state(&blob, &mut restored).unwrap();
        assert_eq!(restored.connections_limit, 77);
        assert_eq!(restored.connections_slack, 3);
        assert_eq!(restored.choking_algorithm, ChokingAlgorithm::RateBased);
        assert_eq!(restored.unchoke_slots_limit, 12);
        assert_eq!(restored.active_downloads, -1);
        assert!(restored.anonymous_mode);
        assert_eq!(loaded.dht_node_id, Some([9u8; 20]));
    }

    #[test]
    fn unknown_keys_and_categories_ignored() {
        let mut blob = Vec::new();
        blob.push(b'd');
        write_str(&mut blob, "feeds");
        blob.push(b'l');
        blob.push(b'e');
        write_str(&mut blob, "settings");
        blob.push(b'd');
        write_str(&mut blob, "brand_new_key");
        write_int(&mut blob, 42);
        write_str(&mut blob, "connections_limit");
        write_int(&mut blob, 55);
        blob.push(b'e');
        blob.push(b'e');

        let mut settings = SessionSettings::default();
        load_state(&blob, &mut settings).unwrap();
        assert_eq!(settings.connections_limit, 55);
    }

    #[test]
    fn garbage_is_an_error() {
        let mut settings = SessionSettings::default();
        assert!(load_state(b"not bencode", &mut settings).is_err());
    }

    #[test]
    fn partial_save_skips_categories() {
        let settings = SessionSettings::default();
        let blob = save_state(&settings, Some(&[1u8; 20]), SAVE_SETTINGS);
        let mut restored = SessionSettings::default();
        let loaded = load_state(&blob, &mut restored).unwrap();
        assert_eq!(loaded.dht_node_id, None);
    }
}
