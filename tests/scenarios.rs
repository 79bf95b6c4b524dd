//! End-to-end scenarios against a `ControlPanel` driving an in-memory
//! loopback `Connection`, covering six reconnect/timeout/reassembly
//! scenarios (S1-S6).

use std::time::Duration;

use osdp_acu::test_support::{loopback_pair, FakePeripheral, ScriptedReply};
use osdp_acu::{Address, BusConfig, Command, CommandCode, ControlPanel};

fn fast_config() -> BusConfig {
    BusConfig {
        poll_interval: Duration::from_millis(20),
        reply_window: Duration::from_millis(50),
        offline_threshold: 5,
        command_timeout: Duration::from_secs(2),
        piv_timeout: Duration::from_secs(2),
    }
}

/// S1. Cold start, no secure channel: the Bus should report the device
/// online shortly after its first POLL/ACK exchange.
#[tokio::test]
async fn s1_cold_start_reports_online() {
    let (panel_side, pd_side) = loopback_pair();
    let panel = ControlPanel::new();
    let address = Address::new(1).unwrap();
    let conn = panel.start_connection(Box::new(panel_side), Some(fast_config()));
    panel.add_device(conn, address, false, false, None).await.unwrap();

    let pd = FakePeripheral::new(address, false, pd_side);
    tokio::spawn(pd.run(50));

    let deadline = tokio::time::Instant::now() + Duration::from_millis(400);
    loop {
        if panel.is_online(conn, address).await.unwrap() {
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "device never went online");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    panel.shutdown().await;
}

/// S2. `send_command(IdReport)` returns an IdReport reply, and the
/// device's sequence counter advances by exactly one.
#[tokio::test]
async fn s2_id_report_round_trip() {
    let (panel_side, pd_side) = loopback_pair();
    let panel = ControlPanel::new();
    let address = Address::new(1).unwrap();
    let conn = panel.start_connection(Box::new(panel_side), Some(fast_config()));
    panel.add_device(conn, address, false, false, None).await.unwrap();

    let mut pd = FakePeripheral::new(address, false, pd_side);
    pd.script(CommandCode::IdReport.wire_code_for_tests(), vec![ScriptedReply::Bytes(vec![0x45, 0xAA, 0xBB])]);
    tokio::spawn(pd.run(50));

    let reply = panel
        .send_command(conn, Command::new(address, CommandCode::IdReport, vec![]), None, None)
        .await
        .unwrap();
    assert_eq!(reply.kind, osdp_acu::ReplyKind::IdReport);
    assert_eq!(reply.payload, vec![0xAA, 0xBB]);

    panel.shutdown().await;
}

/// S3. A connection whose PD stops responding goes offline, and a command
/// sent to it after that times out.
#[tokio::test]
async fn s3_dead_device_times_out() {
    let (panel_side, pd_side) = loopback_pair();
    let panel = ControlPanel::new();
    let address = Address::new(1).unwrap();
    let conn = panel.start_connection(Box::new(panel_side), Some(fast_config()));
    panel.add_device(conn, address, false, false, None).await.unwrap();

    let mut pd = FakePeripheral::new(address, false, pd_side);
    let responding = pd.connection_mut().responding_handle();
    tokio::spawn(pd.run(200));

    // Let the device come online first, then cut the link: every
    // subsequent cycle is a miss, driving it offline after
    // `offline_threshold` consecutive misses.
    let online_deadline = tokio::time::Instant::now() + Duration::from_millis(300);
    loop {
        if panel.is_online(conn, address).await.unwrap() {
            break;
        }
        assert!(tokio::time::Instant::now() < online_deadline, "device never came online");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    responding.store(false, std::sync::atomic::Ordering::SeqCst);

    let deadline = tokio::time::Instant::now() + Duration::from_secs(1);
    loop {
        if !panel.is_online(conn, address).await.unwrap() {
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "device never went offline");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    let result = panel
        .send_command(
            conn,
            Command::new(address, CommandCode::IdReport, vec![]),
            Some(Duration::from_millis(300)),
            None,
        )
        .await;
    assert!(matches!(result, Err(osdp_acu::Error::Timeout)));

    panel.shutdown().await;
}

/// S4. Three PIV fragments (whole=300) reassemble into a 300-byte buffer.
#[tokio::test]
async fn s4_piv_reassembly_three_fragments() {
    let (panel_side, pd_side) = loopback_pair();
    let panel = ControlPanel::new();
    let address = Address::new(1).unwrap();
    let conn = panel.start_connection(Box::new(panel_side), Some(fast_config()));
    panel.add_device(conn, address, false, false, None).await.unwrap();

    let whole: Vec<u8> = (0u16..300).map(|i| (i % 256) as u8).collect();
    let mut fragment_payload = |off: usize, len: usize| {
        let mut p = vec![0xA1u8];
        p.extend_from_slice(&(300u16).to_le_bytes());
        p.extend_from_slice(&(off as u16).to_le_bytes());
        p.extend_from_slice(&(len as u16).to_le_bytes());
        p.extend_from_slice(&whole[off..off + len]);
        p
    };

    let mut pd = FakePeripheral::new(address, false, pd_side);
    pd.script(
        CommandCode::GetPivData.wire_code_for_tests(),
        vec![
            ScriptedReply::Bytes(fragment_payload(0, 128)),
            ScriptedReply::Bytes(fragment_payload(128, 128)),
            ScriptedReply::Bytes(fragment_payload(256, 44)),
        ],
    );
    tokio::spawn(pd.run(50));

    let data = panel.get_piv_data(conn, address, vec![], None, None).await.unwrap();
    assert_eq!(data, whole);

    panel.shutdown().await;
}

/// S5. Two concurrent `get_piv_data` callers against the same device are
/// serialised: the second suspends on the PIV lock until the first
/// finishes or its own shorter timeout elapses first.
#[tokio::test]
async fn s5_concurrent_piv_calls_are_serialised() {
    let (panel_side, pd_side) = loopback_pair();
    let panel = ControlPanel::new();
    let address = Address::new(1).unwrap();
    let conn = panel.start_connection(Box::new(panel_side), Some(fast_config()));
    panel.add_device(conn, address, false, false, None).await.unwrap();

    // The first caller's single fragment is delayed a few poll cycles by
    // silence so it's still in flight when the second caller starts.
    let mut pd = FakePeripheral::new(address, false, pd_side);
    pd.script(
        CommandCode::GetPivData.wire_code_for_tests(),
        vec![
            ScriptedReply::Silence,
            ScriptedReply::Silence,
            ScriptedReply::Silence,
            ScriptedReply::Silence,
            ScriptedReply::Silence,
            ScriptedReply::Silence,
            ScriptedReply::Silence,
            ScriptedReply::Silence,
            ScriptedReply::Silence,
            ScriptedReply::Silence,
            ScriptedReply::Silence,
            ScriptedReply::Silence,
            ScriptedReply::Silence,
            ScriptedReply::Silence,
            ScriptedReply::Silence,
            ScriptedReply::Silence,
            ScriptedReply::Silence,
            ScriptedReply::Silence,
            ScriptedReply::Silence,
            ScriptedReply::Silence,
            ScriptedReply::Silence,
            ScriptedReply::Silence,
            ScriptedReply::Silence,
            ScriptedReply::Silence,
            ScriptedReply::Bytes({
                let mut p = vec![0xA1u8];
                p.extend_from_slice(&(4u16).to_le_bytes());
                p.extend_from_slice(&(0u16).to_le_bytes());
                p.extend_from_slice(&(4u16).to_le_bytes());
                p.extend_from_slice(&[1, 2, 3, 4]);
                p
            }),
        ],
    );
    tokio::spawn(pd.run(80));

    let panel_a = panel.clone();
    let first = tokio::spawn(async move {
        panel_a
            .get_piv_data(conn, address, vec![], Some(Duration::from_millis(500)), None)
            .await
    });

    tokio::time::sleep(Duration::from_millis(30)).await;

    let second = panel
        .get_piv_data(conn, address, vec![], Some(Duration::from_millis(50)), None)
        .await;
    assert!(matches!(second, Err(osdp_acu::Error::Timeout)));

    let _ = first.await.unwrap();
    panel.shutdown().await;
}

/// S6. An unsolicited reply (e.g. card data riding in on a POLL response)
/// fires the registered listener exactly once and completes no pending
/// request.
#[tokio::test]
async fn s6_unsolicited_card_data_notifies_listener_only() {
    let (panel_side, pd_side) = loopback_pair();
    let panel = ControlPanel::new();
    let address = Address::new(1).unwrap();
    let conn = panel.start_connection(Box::new(panel_side), Some(fast_config()));
    panel.add_device(conn, address, false, false, None).await.unwrap();

    let count = std::sync::Arc::new(std::sync::atomic::AtomicUsize::new(0));
    let count_clone = std::sync::Arc::clone(&count);
    panel.on_reply(osdp_acu::ReplyKind::RawCardData, move |_reply| {
        count_clone.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
    });

    let mut pd = FakePeripheral::new(address, false, pd_side);
    pd.script(0x60, vec![ScriptedReply::Bytes(vec![0x50, 0x01, 0x02, 0x03])]);
    tokio::spawn(pd.run(10));

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(count.load(std::sync::atomic::Ordering::SeqCst), 1);

    panel.shutdown().await;
}
