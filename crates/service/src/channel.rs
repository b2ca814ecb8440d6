//! A single device's session state and last-known telemetry.

use std::collections::HashMap;
use std::net::SocketAddr;

pub const RUNNING: u32 = 0x1;
pub const SLEEPING: u32 = 0x2;

/// A device is considered resumed rather than freshly logged in only while
/// its last accepted data is within this many milliseconds.
pub const RESUME_WINDOW_MS: u64 = 60_000;

const PID_RSSI: u32 = 0x100;
const PID_DEVICE_TEMP: u32 = 0x101;

/// A single stored telemetry value, keyed by PID in `Channel::data`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sample {
    pub ts: u64,
    pub value: String,
}

/// One device's channel: identity, session flags, counters and the
/// last-seen value for every PID it has reported since its last login.
#[derive(Debug, Clone)]
pub struct Channel {
    pub id: String,
    pub devid: String,
    pub vin: Option<String>,
    pub flags: u32,
    pub dev_flags: Option<String>,
    pub rssi: Option<i64>,
    pub device_temp: Option<i64>,
    pub device_tick: u64,
    pub server_data_tick: u64,
    pub server_ping_tick: u64,
    pub server_sync_tick: u64,
    pub session_start_tick: u64,
    pub elapsed: u64,
    pub recv_count: u64,
    pub tx_count: u64,
    pub data_received: u64,
    pub sample_rate: u64,
    pub data: HashMap<u32, Sample>,
    pub udp_peer: Option<SocketAddr>,
    pub cmd_count: u64,
    pub ip_addr: Option<String>,
    pub created_at: u64,
}

impl Channel {
    pub fn new(id: String, devid: String, now: u64) -> Self {
        Self {
            id,
            devid,
            vin: None,
            flags: 0,
            dev_flags: None,
            rssi: None,
            device_temp: None,
            device_tick: 0,
            server_data_tick: 0,
            server_ping_tick: 0,
            server_sync_tick: 0,
            session_start_tick: now,
            elapsed: 0,
            recv_count: 0,
            tx_count: 0,
            data_received: 0,
            sample_rate: 0,
            data: HashMap::new(),
            udp_peer: None,
            cmd_count: 0,
            ip_addr: None,
            created_at: now,
        }
    }

    pub fn is_running(&self) -> bool {
        self.flags & RUNNING != 0
    }

    pub fn is_sleeping(&self) -> bool {
        self.flags & SLEEPING != 0
    }

    /// A channel is treated as a fresh session unless it is currently
    /// running *and* has accepted data within the resume window.
    fn is_resume(&self, now: u64) -> bool {
        self.is_running() && now.saturating_sub(self.server_data_tick) < RESUME_WINDOW_MS
    }

    /// Apply a `LOGIN` event. Returns `true` if this started a fresh
    /// session (counters reset), `false` if it resumed an existing one.
    ///
    /// # Example
    ///
    /// ```
    /// use telehub_service::channel::Channel;
    ///
    /// let mut c = Channel::new("ID".into(), "DEV1234".into(), 0);
    /// let fresh = c.login(1_000, Some("11111111111111111"), Some("3"), Some(-70), None);
    /// assert!(fresh);
    /// assert!(c.is_running());
    /// assert_eq!(c.vin.as_deref(), Some("11111111111111111"));
    /// assert_eq!(c.rssi, Some(-70));
    /// ```
    pub fn login(
        &mut self,
        now: u64,
        vin: Option<&str>,
        dev_flags: Option<&str>,
        rssi: Option<i64>,
        udp_peer: Option<SocketAddr>,
    ) -> bool {
        let fresh = !self.is_resume(now);
        if fresh {
            self.recv_count = 0;
            self.tx_count = 0;
            self.data_received = 0;
            self.elapsed = 0;
            self.data.clear();
            self.session_start_tick = now;
        }

        self.flags |= RUNNING;
        self.flags &= !SLEEPING;
        self.server_data_tick = now;

        if let Some(vin) = vin {
            if vin.len() == 17 {
                self.vin = Some(vin.to_string());
            }
        }
        if let Some(df) = dev_flags {
            self.dev_flags = Some(df.to_string());
        }
        if let Some(rssi) = rssi {
            self.rssi = Some(rssi);
        }
        if udp_peer.is_some() {
            self.udp_peer = udp_peer;
        }

        fresh
    }

    /// Apply a `LOGOUT` event.
    ///
    /// # Example
    ///
    /// ```
    /// use telehub_service::channel::Channel;
    ///
    /// let mut c = Channel::new("ID".into(), "DEV1234".into(), 0);
    /// c.login(0, None, None, None, None);
    /// c.logout(10);
    /// assert!(!c.is_running());
    /// ```
    pub fn logout(&mut self, now: u64) {
        self.flags &= !RUNNING;
        self.server_ping_tick = now;
    }

    /// Apply a `PING` event: the device reports it is going to sleep.
    pub fn ping(&mut self, now: u64) {
        self.flags |= SLEEPING;
        self.flags &= !RUNNING;
        self.server_ping_tick = now;
    }

    /// Record that one frame carrying `payload_len` bytes was just
    /// accepted.
    pub fn note_data(&mut self, now: u64, payload_len: u64) {
        self.recv_count += 1;
        self.data_received += payload_len;
        self.server_data_tick = now;
        self.elapsed = now.saturating_sub(self.session_start_tick) / 1000;
    }

    /// Store one sample under `pid`, mirroring the two sidecar PIDs onto
    /// dedicated fields.
    pub fn store_sample(&mut self, pid: u32, ts: u64, value: String) {
        if pid == PID_RSSI {
            if let Ok(v) = value.parse::<i64>() {
                self.rssi = Some(v);
            }
        } else if pid == PID_DEVICE_TEMP {
            if let Ok(v) = value.parse::<i64>() {
                self.device_temp = Some(v);
            }
        }
        self.data.insert(pid, Sample { ts, value });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_login_resets_counters() {
        let mut c = Channel::new("ID".into(), "DEV1".into(), 0);
        c.recv_count = 50;
        let fresh = c.login(100_000, None, None, None, None);
        assert!(fresh);
        assert_eq!(c.recv_count, 0);
    }

    #[test]
    fn resume_keeps_counters() {
        let mut c = Channel::new("ID".into(), "DEV1".into(), 0);
        c.login(0, None, None, None, None);
        c.note_data(0, 10);
        let fresh = c.login(1_000, None, None, None, None);
        assert!(!fresh);
        assert_eq!(c.recv_count, 1);
    }

    #[test]
    fn invalid_vin_length_ignored() {
        let mut c = Channel::new("ID".into(), "DEV1".into(), 0);
        c.login(0, Some("short"), None, None, None);
        assert_eq!(c.vin, None);
    }

    #[test]
    fn ping_then_logout_clear_running() {
        let mut c = Channel::new("ID".into(), "DEV1".into(), 0);
        c.login(0, None, None, None, None);
        c.ping(10);
        assert!(c.is_sleeping());
        assert!(!c.is_running());
    }

    #[test]
    fn login_refreshes_server_data_tick() {
        let mut c = Channel::new("ID".into(), "DEV1".into(), 0);
        c.login(5_000, None, None, None, None);
        assert_eq!(c.server_data_tick, 5_000);
    }
}
