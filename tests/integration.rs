use std::sync::Arc;
use std::time::Duration;

use telehub::command::CommandDispatcher;
use telehub::monitor::Monitor;
use telehub::store::NullStore;
use telehub::udp::UdpEngine;
use telehub_service::clock::{Clock, TestClock};
use telehub_service::ChannelTable;
use tokio::net::UdpSocket;

async fn read_reply(sock: &UdpSocket) -> String {
    let mut buf = [0u8; 512];
    let (size, _) = sock.recv_from(&mut buf).await.unwrap();
    String::from_utf8_lossy(&buf[..size]).into_owned()
}

fn frame(body: &str) -> String {
    let cs = telehub_codec::checksum(body.as_bytes());
    format!("{body}*{:X}", cs)
}

async fn drive_one(engine: &Arc<UdpEngine>) {
    let mut buf = [0u8; 512];
    let (size, peer) = engine.recv_datagram(&mut buf).await.unwrap();
    let raw = String::from_utf8_lossy(&buf[..size]).into_owned();
    engine.handle_datagram(&raw, peer).await;
}

async fn setup() -> (Arc<UdpEngine>, UdpSocket, Arc<ChannelTable>, Arc<TestClock>) {
    let server_sock = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let device_sock = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let server_addr = server_sock.local_addr().unwrap();
    device_sock.connect(server_addr).await.unwrap();

    let table = Arc::new(ChannelTable::new(10));
    let clock = Arc::new(TestClock::new(0));
    let engine = Arc::new(UdpEngine::new(
        Arc::new(server_sock),
        table.clone(),
        Arc::new(CommandDispatcher::new()),
        Arc::new(Monitor::default()),
        Arc::new(NullStore),
        clock.clone() as Arc<dyn Clock>,
        30_000,
        String::new(),
    ));

    (engine, device_sock, table, clock)
}

#[tokio::test]
async fn cold_login_admits_channel_and_replies() {
    let (engine, device, table, _clock) = setup().await;

    device.send(frame("DEV1TEST#EV=1,TS=1000,VIN=11111111111111111,SSI=-70").as_bytes()).await.unwrap();
    drive_one(&engine).await;

    let reply = read_reply(&device).await;
    assert!(reply.contains("EV=1"));
    assert!(reply.contains("RX=0"));

    let snapshot = table.find_by_device_id("DEV1TEST").unwrap();
    assert_eq!(snapshot.vin.as_deref(), Some("11111111111111111"));
    assert_eq!(snapshot.rssi, Some(-70));
}

#[tokio::test]
async fn data_frame_stores_samples_with_in_band_timestamp() {
    let (engine, device, table, _clock) = setup().await;

    device.send(frame("DEV1TEST#EV=1,TS=1000").as_bytes()).await.unwrap();
    drive_one(&engine).await;
    let _ = read_reply(&device).await;

    let id = table.resolve_id("DEV1TEST").unwrap();
    device
        .send(frame(&format!("{id}#0:5000,100:-65,104:37,0:5100,104:38")).as_bytes())
        .await
        .unwrap();
    drive_one(&engine).await;

    let snapshot = table.find_by_device_id("DEV1TEST").unwrap();
    assert_eq!(snapshot.device_tick, 5100);
    assert_eq!(snapshot.rssi, Some(-65));
    let pid_104 = snapshot.data.iter().find(|(pid, _, _)| *pid == 104).unwrap();
    assert_eq!(pid_104.1, "38");
}

#[tokio::test]
async fn ping_then_data_triggers_reconnect() {
    let (engine, device, table, _clock) = setup().await;

    device.send(frame("DEV1TEST#EV=1,TS=1000").as_bytes()).await.unwrap();
    drive_one(&engine).await;
    let _ = read_reply(&device).await;

    let id = table.resolve_id("DEV1TEST").unwrap();
    device.send(frame(&format!("{id}#EV=7")).as_bytes()).await.unwrap();
    drive_one(&engine).await;
    let reply = read_reply(&device).await;
    assert!(reply.contains("EV=7"));

    device.send(frame(&format!("{id}#0:2000,104:1")).as_bytes()).await.unwrap();
    drive_one(&engine).await;
    let reply = read_reply(&device).await;
    assert!(reply.contains("EV=4"));
}

#[tokio::test]
async fn command_then_ack_resolves_token() {
    let (engine, device, table, _clock) = setup().await;

    device.send(frame("DEV1TEST#EV=1,TS=1000").as_bytes()).await.unwrap();
    drive_one(&engine).await;
    let _ = read_reply(&device).await;

    let token = engine.send_command("DEV1TEST", "REBOOT", Duration::from_secs(2)).await.unwrap();
    let cmd_wire = read_reply(&device).await;
    assert!(cmd_wire.contains(&format!("TK={token}")));
    assert!(cmd_wire.contains("CMD=REBOOT"));

    let id = table.resolve_id("DEV1TEST").unwrap();
    device.send(frame(&format!("{id}#EV=6,TK={token},MSG=OK")).as_bytes()).await.unwrap();
    drive_one(&engine).await;
}
