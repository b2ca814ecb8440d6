//! Periodic task that ages running sessions out after a data-idle
//! threshold. Never evicts a channel; eviction is operator-driven via
//! the HTTP frontend's `clear` command.

use std::sync::Arc;
use std::time::Duration;

use telehub_service::clock::Clock;
use telehub_service::ChannelTable;
use tokio_util::sync::CancellationToken;

const SWEEP_INTERVAL: Duration = Duration::from_secs(10);

pub async fn run(
    table: Arc<ChannelTable>,
    clock: Arc<dyn Clock>,
    channel_timeout_ms: u64,
    shutdown: CancellationToken,
) {
    let mut ticker = tokio::time::interval(SWEEP_INTERVAL);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => sweep_once(&table, clock.as_ref(), channel_timeout_ms),
        }
    }
}

fn sweep_once(table: &ChannelTable, clock: &dyn Clock, channel_timeout_ms: u64) {
    let now = clock.now_ms();
    for channel in table.snapshot() {
        if channel.flags & telehub_service::channel::RUNNING == 0 {
            continue;
        }
        if now.saturating_sub(channel.server_data_tick) > channel_timeout_ms {
            table.with_channel_mut(&channel.id, |c| c.flags &= !telehub_service::channel::RUNNING);
            log::info!("sweeper: channel {} idle past timeout, marking stopped", channel.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use telehub_service::clock::TestClock;

    #[test]
    fn clears_running_past_timeout() {
        let table = ChannelTable::new(10);
        let id = table.admit("DEV1234", 0).unwrap();
        table.login(&id, 0, None, None, None, None, None);
        table.with_channel_mut(&id, |c| c.server_data_tick = 0);

        let clock = TestClock::new(1_000_000);
        sweep_once(&table, &clock, 300_000);

        let snapshot = table.find_by_channel_id(&id).unwrap();
        assert_eq!(snapshot.flags & telehub_service::channel::RUNNING, 0);
    }

    #[test]
    fn leaves_fresh_channels_running() {
        let table = ChannelTable::new(10);
        let id = table.admit("DEV1234", 0).unwrap();
        table.login(&id, 1_000, None, None, None, None, None);
        table.with_channel_mut(&id, |c| c.server_data_tick = 1_000);

        let clock = TestClock::new(1_100);
        sweep_once(&table, &clock, 300_000);

        let snapshot = table.find_by_channel_id(&id).unwrap();
        assert_ne!(snapshot.flags & telehub_service::channel::RUNNING, 0);
    }
}
