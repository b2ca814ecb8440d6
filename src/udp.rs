//! Single-socket UDP receiver and protocol state machine.
//!
//! One task owns the socket and runs `recv_from` in a tight loop,
//! tolerating a `ConnectionReset` from an unreachable peer rather than
//! treating it as fatal. Every frame is decoded and dispatched through
//! the channel table's single lock, so state transitions and the reply
//! they produce are always consistent with each other.

use std::io::ErrorKind;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use telehub_codec::{decode_frame, encode_command, encode_reply, Body, EventId};
use telehub_service::clock::Clock;
use telehub_service::payload::apply_payload;
use telehub_service::{AdmitError, ChannelTable};
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;

use crate::command::CommandDispatcher;
use crate::monitor::{Monitor, Signal};
use crate::store::{ChannelRecord, StoreAdapter};

const MAX_DATAGRAM: usize = 4096;

pub struct UdpEngine {
    socket: Arc<UdpSocket>,
    table: Arc<ChannelTable>,
    dispatcher: Arc<CommandDispatcher>,
    monitor: Arc<Monitor>,
    store: Arc<dyn StoreAdapter>,
    clock: Arc<dyn Clock>,
    sync_interval_ms: u64,
    server_key: String,
}

#[derive(Debug, thiserror::Error)]
pub enum SendCommandError {
    #[error("unknown channel")]
    UnknownChannel,
    #[error("device not connected via udp")]
    NotConnected,
    #[error("command unsent: {0}")]
    Unsent(std::io::Error),
}

impl UdpEngine {
    pub fn new(
        socket: Arc<UdpSocket>,
        table: Arc<ChannelTable>,
        dispatcher: Arc<CommandDispatcher>,
        monitor: Arc<Monitor>,
        store: Arc<dyn StoreAdapter>,
        clock: Arc<dyn Clock>,
        sync_interval_ms: u64,
        server_key: String,
    ) -> Self {
        Self {
            socket,
            table,
            dispatcher,
            monitor,
            store,
            clock,
            sync_interval_ms,
            server_key,
        }
    }

    /// Run the receive loop until `shutdown` is triggered.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        let mut buf = vec![0u8; MAX_DATAGRAM];

        loop {
            let recv = tokio::select! {
                _ = shutdown.cancelled() => break,
                recv = self.socket.recv_from(&mut buf) => recv,
            };

            match recv {
                Ok((size, peer)) => {
                    if size < 4 {
                        continue;
                    }
                    let raw = String::from_utf8_lossy(&buf[..size]).into_owned();
                    self.handle_datagram(&raw, peer).await;
                }
                Err(e) if e.kind() == ErrorKind::ConnectionReset => {
                    log::trace!("udp: connection reset from a peer, continuing");
                }
                Err(e) => {
                    log::warn!("udp: recv_from failed: {e}");
                }
            }
        }
    }

    /// Receive one datagram, for callers (tests, alternative transports)
    /// that want to drive the frame pipeline one message at a time
    /// instead of running the full receive loop.
    pub async fn recv_datagram(&self, buf: &mut [u8]) -> std::io::Result<(usize, SocketAddr)> {
        self.socket.recv_from(buf).await
    }

    /// Process one already-received datagram's bytes through the frame
    /// pipeline.
    pub async fn handle_datagram(&self, raw: &str, peer: SocketAddr) {
        let frame = match decode_frame(raw) {
            Ok(frame) => frame,
            Err(e) => {
                self.monitor.record(Signal::FrameRejected);
                log::debug!("udp: dropping malformed frame from {peer}: {e}");
                return;
            }
        };

        match frame.body {
            Body::Event(ev) => self.handle_event(&frame.id, ev, peer).await,
            Body::Data(data) => {
                self.handle_data(&frame.id, &data.pairs, data.raw_len as u64, peer).await
            }
        }
    }

    async fn handle_event(&self, raw_id: &str, ev: telehub_codec::EventFrame, peer: SocketAddr) {
        let now = self.clock.now_ms();

        match ev.event {
            EventId::Login => self.handle_login(raw_id, &ev, peer, now).await,
            EventId::Logout => {
                if let Some(channel) = self.table.find_by_channel_id(raw_id) {
                    self.table.logout(&channel.id, now);
                    self.reply(&channel.id, EventId::Logout, peer).await;
                    self.persist(&channel.id).await;
                } else {
                    self.monitor.record(Signal::FrameRejected);
                }
            }
            EventId::Ping => {
                if let Some(channel) = self.table.find_by_channel_id(raw_id) {
                    self.table.ping(&channel.id, now);
                    self.reply(&channel.id, EventId::Ping, peer).await;
                } else {
                    self.monitor.record(Signal::FrameRejected);
                }
            }
            EventId::Ack => {
                if let Some(token) = ev.field("TK") {
                    if let Ok(token) = token.parse::<u64>() {
                        if self.dispatcher.resolve(raw_id, token) {
                            self.monitor.record(Signal::CommandResolved);
                            log::debug!(
                                "udp: command {token} on {raw_id} acked: {:?}",
                                ev.field("MSG")
                            );
                        }
                    }
                }
            }
            EventId::Sync | EventId::Reconnect | EventId::Command => {
                // Server-originated only; a device would never send these.
                self.monitor.record(Signal::FrameRejected);
            }
        }
    }

    async fn handle_login(&self, raw_id: &str, ev: &telehub_codec::EventFrame, peer: SocketAddr, now: u64) {
        if !self.server_key.is_empty() {
            if ev.field("SK") != Some(self.server_key.as_str()) {
                log::debug!("udp: login with wrong server key from {peer}, dropping");
                self.monitor.record(Signal::FrameRejected);
                return;
            }
        }

        let channel_id = if let Some(existing) = self.table.find_by_channel_id(raw_id) {
            existing.id
        } else {
            match self.table.admit(raw_id, now) {
                Ok(id) => id,
                Err(AdmitError::Saturated) => {
                    log::warn!("udp: channel assignment failed, table saturated");
                    self.monitor.record(Signal::FrameRejected);
                    return;
                }
                Err(AdmitError::InvalidDevid) => {
                    self.monitor.record(Signal::FrameRejected);
                    return;
                }
            }
        };

        let vin = ev.field("VIN");
        let dev_flags = ev.field("DF");
        let rssi = ev.field("SSI").and_then(|v| v.parse().ok());

        self.table
            .login(&channel_id, now, vin, dev_flags, rssi, Some(peer), Some(&peer.ip().to_string()));

        self.monitor.record(Signal::FrameAccepted);
        self.reply(&channel_id, EventId::Login, peer).await;
        self.persist(&channel_id).await;
    }

    async fn handle_data(&self, channel_id: &str, pairs: &[(u32, String)], payload_len: u64, peer: SocketAddr) {
        let Some(running) = self.table.is_running(channel_id) else {
            self.monitor.record(Signal::FrameRejected);
            return;
        };

        if !running {
            self.reply(channel_id, EventId::Reconnect, peer).await;
            return;
        }

        let now = self.clock.now_ms();
        self.table.with_channel_mut(channel_id, |c| {
            apply_payload(c, pairs, now, payload_len);
        });
        self.monitor.record(Signal::FrameAccepted);
        self.persist(channel_id).await;

        let due = self
            .table
            .with_channel_mut(channel_id, |c| {
                let due = now.saturating_sub(c.server_sync_tick) >= self.sync_interval_ms;
                if due {
                    c.server_sync_tick = now;
                }
                due
            })
            .unwrap_or(false);

        if due {
            self.reply(channel_id, EventId::Sync, peer).await;
        }
    }

    async fn reply(&self, channel_id: &str, event: EventId, peer: SocketAddr) {
        let Some(snapshot) = self.table.find_by_channel_id(channel_id) else {
            return;
        };

        let tx = self
            .table
            .with_channel_mut(channel_id, |c| {
                c.tx_count += 1;
                c.tx_count
            })
            .unwrap_or(snapshot.recv_count);

        let wire = encode_reply(channel_id, event, snapshot.recv_count, tx);
        if let Err(e) = self.socket.send_to(wire.as_bytes(), peer).await {
            log::warn!("udp: failed to send reply to {peer}: {e}");
        }
    }

    async fn persist(&self, channel_id: &str) {
        if let Some(snapshot) = self.table.find_by_channel_id(channel_id) {
            self.store.save_channel(ChannelRecord::from(&snapshot)).await;
        }
    }

    /// Originate a command to a device, identified by its device id.
    /// Registers the token as pending and returns immediately; the
    /// device's `ACK` (or the command timeout) resolves it later.
    pub async fn send_command(&self, devid: &str, cmd: &str, command_timeout: Duration) -> Result<u64, SendCommandError> {
        let channel_id = self
            .table
            .resolve_id(devid)
            .ok_or(SendCommandError::UnknownChannel)?;

        let (token, peer) = self
            .table
            .next_command_token(&channel_id)
            .ok_or(SendCommandError::UnknownChannel)?;
        let peer = peer.ok_or(SendCommandError::NotConnected)?;

        let wire = encode_command(&channel_id, token, cmd);
        self.socket
            .send_to(wire.as_bytes(), peer)
            .await
            .map_err(SendCommandError::Unsent)?;

        self.monitor.record(Signal::CommandSent);
        self.dispatcher.register(&channel_id, token, command_timeout, self.monitor.clone());

        Ok(token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use telehub_service::clock::TestClock;
    use crate::store::NullStore;

    async fn make_engine(socket: UdpSocket, server_key: &str) -> Arc<UdpEngine> {
        Arc::new(UdpEngine::new(
            Arc::new(socket),
            Arc::new(ChannelTable::new(10)),
            Arc::new(CommandDispatcher::new()),
            Arc::new(Monitor::default()),
            Arc::new(NullStore),
            Arc::new(TestClock::new(0)),
            30_000,
            server_key.to_string(),
        ))
    }

    #[tokio::test]
    async fn login_admits_and_replies() {
        let server_sock = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let device_sock = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let server_addr = server_sock.local_addr().unwrap();

        let engine = make_engine(server_sock, "").await;

        let payload = "DEV1234#EV=1,TS=1000,SSI=-70";
        let cs = telehub_codec::checksum(payload.as_bytes());
        let wire = format!("{payload}*{:X}", cs);

        device_sock.send_to(wire.as_bytes(), server_addr).await.unwrap();

        // Drive one iteration of the engine directly instead of spawning the
        // full loop, keeping this test deterministic.
        let mut buf = [0u8; 256];
        let (size, peer) = engine.socket.recv_from(&mut buf).await.unwrap();
        let raw = String::from_utf8_lossy(&buf[..size]).into_owned();
        engine.handle_datagram(&raw, peer).await;

        assert_eq!(engine.table.len(), 1);
        assert!(engine.table.find_by_device_id("DEV1234").is_some());
    }
}
