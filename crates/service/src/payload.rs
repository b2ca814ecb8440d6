//! Applies a parsed data frame onto a channel: timestamp bookkeeping,
//! sample storage, sample-rate estimation and sidecar PID mirroring.
//!
//! Takes already-parsed `(pid, value)` pairs (the shape `telehub-codec`'s
//! data frame decoder produces) rather than a raw string, so the same
//! logic serves UDP data frames and the HTTP endpoints that synthesize an
//! equivalent pair list from query parameters or a POST body. The
//! caller passes the real byte length of whatever it parsed the pairs
//! out of, for `data_received` accounting.

use crate::channel::Channel;

/// Apply a data frame's pairs to `channel`. Returns the number of samples
/// stored (pairs preceding any in-band timestamp marker, or with an
/// unparseable PID, are skipped and not counted). `payload_len` is the
/// byte length of the frame body (or request body) the pairs came from.
///
/// # Example
///
/// ```
/// use telehub_service::channel::Channel;
/// use telehub_service::payload::apply_payload;
///
/// let mut c = Channel::new("ID".into(), "DEV1234".into(), 0);
/// c.login(0, None, None, None, None);
///
/// let pairs = vec![
///     (0, "5000".to_string()),
///     (0x100, "-65".to_string()),
///     (0x104, "37".to_string()),
/// ];
///
/// let stored = apply_payload(&mut c, &pairs, 5_000, 24);
/// assert_eq!(stored, 2);
/// assert_eq!(c.rssi, Some(-65));
/// assert_eq!(c.device_tick, 5000);
/// assert_eq!(c.data_received, 24);
/// ```
pub fn apply_payload(channel: &mut Channel, pairs: &[(u32, String)], now: u64, payload_len: u64) -> usize {
    let mut timestamp: u64 = 0;
    let mut stored = 0usize;

    for (pid, value) in pairs {
        if *pid == 0 {
            timestamp = value.parse().unwrap_or(0);
            continue;
        }

        if timestamp != 0 {
            channel.store_sample(*pid, timestamp, value.clone());
            stored += 1;
        }
    }

    let new_tick = if timestamp != 0 { timestamp } else { channel.device_tick };

    let old_tick = channel.device_tick;
    if old_tick > 0 && new_tick > old_tick + 100 && stored > 0 {
        channel.sample_rate = (stored as u64) * 60_000 / (new_tick - old_tick);
    }

    channel.note_data(now, payload_len);
    channel.device_tick = new_tick;

    stored
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pairs_before_timestamp_are_skipped() {
        let mut c = Channel::new("ID".into(), "DEV1234".into(), 0);
        let pairs = vec![(104, "1".to_string()), (0, "1000".to_string()), (104, "2".to_string())];
        let stored = apply_payload(&mut c, &pairs, 1_000, 20);
        assert_eq!(stored, 1);
        assert_eq!(c.data.get(&104).unwrap().value, "2");
        assert_eq!(c.data_received, 20);
    }

    #[test]
    fn sample_rate_uses_elapsed_device_time() {
        let mut c = Channel::new("ID".into(), "DEV1234".into(), 0);
        apply_payload(&mut c, &[(0, "1000".to_string()), (104, "1".to_string())], 1_000, 16);
        apply_payload(
            &mut c,
            &[(0, "2000".to_string()), (104, "2".to_string()), (105, "3".to_string())],
            2_000,
            24,
        );
        assert_eq!(c.sample_rate, 2 * 60_000 / 1000);
    }

    #[test]
    fn mirrors_rssi_and_temperature() {
        let mut c = Channel::new("ID".into(), "DEV1234".into(), 0);
        apply_payload(
            &mut c,
            &[(0, "100".to_string()), (0x100, "-80".to_string()), (0x101, "42".to_string())],
            100,
            30,
        );
        assert_eq!(c.rssi, Some(-80));
        assert_eq!(c.device_temp, Some(42));
    }

    #[test]
    fn recv_count_bumps_once_per_frame() {
        let mut c = Channel::new("ID".into(), "DEV1234".into(), 0);
        apply_payload(&mut c, &[(0, "100".to_string()), (104, "1".to_string()), (105, "2".to_string())], 100, 10);
        assert_eq!(c.recv_count, 1);
    }
}
