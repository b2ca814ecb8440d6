//! The concurrent channel table.
//!
//! Every operation that reads or mutates a channel's fields acquires the
//! table's single exclusive lock for its critical section. This is
//! coarser-grained than per-record locking, but it is what the session
//! protocol's ordering guarantees require: a reply and the state
//! transition that produced it must be observed together.

use std::net::SocketAddr;

use ahash::AHashMap;
use parking_lot::RwLock;
use rand::RngCore;

use crate::channel::Channel;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum AdmitError {
    #[error("channel table is at capacity")]
    Saturated,
    #[error("device id is invalid")]
    InvalidDevid,
}

/// A point-in-time copy of a channel's public fields, used to answer
/// listing/query requests without holding the table lock for the
/// duration of a response.
#[derive(Debug, Clone)]
pub struct ChannelSnapshot {
    pub id: String,
    pub devid: String,
    pub vin: Option<String>,
    pub flags: u32,
    pub dev_flags: Option<String>,
    pub rssi: Option<i64>,
    pub device_tick: u64,
    pub server_data_tick: u64,
    pub server_ping_tick: u64,
    pub recv_count: u64,
    pub data_received: u64,
    pub elapsed: u64,
    pub sample_rate: u64,
    pub ip_addr: Option<String>,
    pub data: Vec<(u32, String, u64)>,
}

impl From<&Channel> for ChannelSnapshot {
    fn from(c: &Channel) -> Self {
        Self {
            id: c.id.clone(),
            devid: c.devid.clone(),
            vin: c.vin.clone(),
            flags: c.flags,
            dev_flags: c.dev_flags.clone(),
            rssi: c.rssi,
            device_tick: c.device_tick,
            server_data_tick: c.server_data_tick,
            server_ping_tick: c.server_ping_tick,
            recv_count: c.recv_count,
            data_received: c.data_received,
            elapsed: c.elapsed,
            sample_rate: c.sample_rate,
            ip_addr: c.ip_addr.clone(),
            data: c
                .data
                .iter()
                .map(|(pid, s)| (*pid, s.value.clone(), s.ts))
                .collect(),
        }
    }
}

struct Inner {
    by_id: AHashMap<String, Channel>,
    by_devid: AHashMap<String, String>,
}

/// The channel table.
///
/// # Example
///
/// ```
/// use telehub_service::table::ChannelTable;
///
/// let table = ChannelTable::new(10);
/// let id = table.admit("DEV1234", 0).unwrap();
/// assert_eq!(table.find_by_device_id("DEV1234").unwrap().id, id);
///
/// // admitting the same devid again is idempotent
/// let id2 = table.admit("DEV1234", 0).unwrap();
/// assert_eq!(id, id2);
/// ```
pub struct ChannelTable {
    max_channels: usize,
    inner: RwLock<Inner>,
}

impl ChannelTable {
    pub fn new(max_channels: usize) -> Self {
        Self {
            max_channels,
            inner: RwLock::new(Inner {
                by_id: AHashMap::new(),
                by_devid: AHashMap::new(),
            }),
        }
    }

    pub fn len(&self) -> usize {
        self.inner.read().by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn validate_devid(devid: &str) -> Result<(), AdmitError> {
        if devid.len() < 4 || !devid.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Err(AdmitError::InvalidDevid);
        }
        Ok(())
    }

    /// Admit a device, returning its channel id. Idempotent on an
    /// existing device id.
    pub fn admit(&self, devid: &str, now: u64) -> Result<String, AdmitError> {
        Self::validate_devid(devid)?;

        let mut inner = self.inner.write();
        if let Some(id) = inner.by_devid.get(devid) {
            return Ok(id.clone());
        }

        if inner.by_id.len() >= self.max_channels {
            return Err(AdmitError::Saturated);
        }

        let id = generate_channel_id();
        inner.by_devid.insert(devid.to_string(), id.clone());
        inner
            .by_id
            .insert(id.clone(), Channel::new(id.clone(), devid.to_string(), now));

        Ok(id)
    }

    /// Insert a channel with a caller-supplied id and vin/flags, used to
    /// repopulate the table from the persistent store at startup. Does
    /// not overwrite an already-present channel id or device id, and
    /// respects `max_channels` the same as `admit`.
    pub fn restore(&self, id: &str, devid: &str, vin: Option<&str>, flags: u32, now: u64) -> bool {
        let mut inner = self.inner.write();
        if inner.by_id.contains_key(id) || inner.by_devid.contains_key(devid) {
            return false;
        }
        if inner.by_id.len() >= self.max_channels {
            return false;
        }

        let mut channel = Channel::new(id.to_string(), devid.to_string(), now);
        channel.vin = vin.map(str::to_string);
        channel.flags = flags & !crate::channel::RUNNING;
        inner.by_devid.insert(devid.to_string(), id.to_string());
        inner.by_id.insert(id.to_string(), channel);
        true
    }

    pub fn find_by_channel_id(&self, id: &str) -> Option<ChannelSnapshot> {
        self.inner.read().by_id.get(id).map(ChannelSnapshot::from)
    }

    pub fn find_by_device_id(&self, devid: &str) -> Option<ChannelSnapshot> {
        let inner = self.inner.read();
        let id = inner.by_devid.get(devid)?;
        inner.by_id.get(id).map(ChannelSnapshot::from)
    }

    pub fn resolve_id(&self, devid: &str) -> Option<String> {
        self.inner.read().by_devid.get(devid).cloned()
    }

    pub fn evict(&self, id: &str) -> bool {
        let mut inner = self.inner.write();
        if let Some(channel) = inner.by_id.remove(id) {
            inner.by_devid.remove(&channel.devid);
            true
        } else {
            false
        }
    }

    pub fn snapshot(&self) -> Vec<ChannelSnapshot> {
        self.inner.read().by_id.values().map(ChannelSnapshot::from).collect()
    }

    /// Run `f` against the channel identified by `id` under the table's
    /// write lock, returning `None` if no such channel exists. This is
    /// the single seam every mutating operation (login, logout, ping,
    /// payload application, command bookkeeping) goes through.
    pub fn with_channel_mut<R>(&self, id: &str, f: impl FnOnce(&mut Channel) -> R) -> Option<R> {
        let mut inner = self.inner.write();
        inner.by_id.get_mut(id).map(f)
    }

    pub fn login(
        &self,
        id: &str,
        now: u64,
        vin: Option<&str>,
        dev_flags: Option<&str>,
        rssi: Option<i64>,
        udp_peer: Option<SocketAddr>,
        ip_addr: Option<&str>,
    ) -> Option<bool> {
        self.with_channel_mut(id, |c| {
            let fresh = c.login(now, vin, dev_flags, rssi, udp_peer);
            if let Some(ip) = ip_addr {
                c.ip_addr = Some(ip.to_string());
            }
            fresh
        })
    }

    pub fn logout(&self, id: &str, now: u64) -> Option<()> {
        self.with_channel_mut(id, |c| c.logout(now))
    }

    pub fn ping(&self, id: &str, now: u64) -> Option<()> {
        self.with_channel_mut(id, |c| c.ping(now))
    }

    /// Every channel whose `RUNNING` flag is clear before this call
    /// would reject a data frame with `RECONNECT`; callers check that
    /// via `is_running` before invoking this.
    pub fn is_running(&self, id: &str) -> Option<bool> {
        self.inner.read().by_id.get(id).map(|c| c.is_running())
    }

    pub fn udp_peer(&self, id: &str) -> Option<SocketAddr> {
        self.inner.read().by_id.get(id).and_then(|c| c.udp_peer)
    }

    /// Allocate the next command token for a channel, returning it along
    /// with the channel's last-known UDP peer.
    pub fn next_command_token(&self, id: &str) -> Option<(u64, Option<SocketAddr>)> {
        self.with_channel_mut(id, |c| {
            c.cmd_count += 1;
            (c.cmd_count, c.udp_peer)
        })
    }
}

fn generate_channel_id() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    bytes.iter().map(|b| format!("{:02X}", b)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_short_devid() {
        let table = ChannelTable::new(10);
        assert_eq!(table.admit("ab", 0), Err(AdmitError::InvalidDevid));
    }

    #[test]
    fn rejects_non_alphanumeric_devid() {
        let table = ChannelTable::new(10);
        assert_eq!(table.admit("abc-123", 0), Err(AdmitError::InvalidDevid));
    }

    #[test]
    fn saturates_without_mutating() {
        let table = ChannelTable::new(1);
        table.admit("DEVONE", 0).unwrap();
        assert_eq!(table.admit("DEVTWO", 0), Err(AdmitError::Saturated));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn evict_removes_both_indices() {
        let table = ChannelTable::new(10);
        let id = table.admit("DEVONE", 0).unwrap();
        assert!(table.evict(&id));
        assert!(table.find_by_device_id("DEVONE").is_none());
        assert!(table.find_by_channel_id(&id).is_none());
    }
}
