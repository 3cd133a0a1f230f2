//! End-to-end scenarios: a connection driving a virtual pump over an in-memory link.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use proptest::prelude::*;
use tokio::sync::mpsc;
use tokio::time::Instant;

use pumplink::codec::{OutboundRecord, PacketCodec};
use pumplink::config::RefreshIntervals;
use pumplink::family::{FamilyDescriptor, presets};
use pumplink::transport::virtual_pump::{Behavior, VirtualPump, VirtualPumpHandle, WireEvent};
use pumplink::{
    Command, FrameFlags, Message, Opcode, PumpConnection, PumpError, RefreshSchedule,
    Refresher, ResponseShape, RetryPolicy, SessionState,
};

const SECRET: &[u8] = b"scenario-pairing-secret";

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn connect(family: FamilyDescriptor, pump: VirtualPump) -> (PumpConnection, VirtualPumpHandle) {
    init_tracing();
    let (transport, handle) = pump.connect();
    let connection = PumpConnection::open(family, transport, SECRET).expect("valid configuration");
    (connection, handle)
}

fn policy(timeout_ms: u64, attempts: u32) -> RetryPolicy {
    RetryPolicy::new(Duration::from_millis(timeout_ms), attempts)
}

#[tokio::test(start_paused = true)]
async fn silent_pump_exhausts_then_link_recovers() {
    let family = presets::dana_r();
    let pump = VirtualPump::new(family.clone(), SECRET).on(0x0302, Behavior::Silent);
    let (connection, handle) = connect(family, pump);
    connection.submit(Command::query(0x020B)).await.expect("session comes up");

    let start = Instant::now();
    let err = connection.submit(Command::query(0x0302).with_policy(policy(500, 3))).await.unwrap_err();
    let elapsed = start.elapsed();

    assert!(matches!(
        err,
        PumpError::Exhausted { opcode: Opcode(0x0302), attempts: 3, may_have_been_delivered: true }
    ));
    assert!(elapsed >= Duration::from_millis(1_500) && elapsed < Duration::from_millis(1_600));
    assert_eq!(handle.received(0x0302).len(), 3);

    handle.set_behavior(0x0302, Behavior::Respond(vec![0x01, 0x05, 0x07, 0xD0]));
    let response = connection.submit(Command::query(0x0302)).await.expect("follow-up succeeds");
    assert_eq!(response.attempts, 1);

    let status = connection.current_status();
    assert_eq!(status.extended_bolus_enabled, Some(true));
    assert!((status.bolus_step.unwrap() - 0.05).abs() < 1e-9);
    assert!((status.max_bolus.unwrap() - 20.0).abs() < 1e-9);
}

#[tokio::test(start_paused = true)]
async fn back_to_back_commands_do_not_interleave() {
    let family = presets::dana_rs();
    let pump = VirtualPump::new(family.clone(), SECRET)
        .on(0x02, Behavior::Respond(vec![0x10, 0x27, 80]))
        .on(0x04, Behavior::Respond(vec![0x05, 0xD0, 0x07]))
        .on(0x10, Behavior::Pages(vec![vec![1], vec![2], vec![3]]))
        .latency(Duration::from_millis(40));
    let (connection, handle) = connect(family.clone(), pump);

    let first = connection.submit(Command::query(0x02));
    let second = connection.submit(Command::query(0x04));
    let third = connection.submit(Command::query(0x10).with_shape(ResponseShape::MultiFrame));
    let (first, second, third) = tokio::join!(first, second, third);
    assert!(first.is_ok() && second.is_ok());
    assert_eq!(third.unwrap().message.payload, vec![1, 2, 3]);

    // every command is answered completely before the next one is received
    let mut current: Option<(Opcode, u16)> = None;
    for event in handle.events() {
        match event {
            WireEvent::Received { opcode, .. } if opcode == family.handshake_opcode => {}
            WireEvent::Replied { opcode, .. } if opcode == family.handshake_opcode => {}
            WireEvent::Received { opcode, sequence } => {
                assert!(current.is_none(), "{} received while {:?} was unanswered", opcode, current);
                current = Some((opcode, sequence));
            }
            WireEvent::Replied { opcode, sequence, .. } => {
                assert_eq!(current, Some((opcode, sequence)));
                let last_page = opcode != Opcode(0x10) || matches!(event, WireEvent::Replied { fragment: 2, .. });
                if last_page {
                    current = None;
                }
            }
        }
    }
    assert!(current.is_none());
}

#[tokio::test(start_paused = true)]
async fn lost_history_page_fails_the_command() {
    let family = presets::dana_rs();
    let pages = vec![vec![0xA1; 8], vec![0xA2; 8], vec![0xA3; 8]];
    let pump = VirtualPump::new(family.clone(), SECRET)
        .on(0x10, Behavior::PagesWithLoss { pages, dropped: vec![1] });
    let (sink_tx, mut sink_rx) = mpsc::unbounded_channel::<Message>();
    let (transport, _handle) = pump.connect();
    init_tracing();
    let connection =
        PumpConnection::builder(family).pairing_secret(SECRET).history_sink(sink_tx).open(transport).unwrap();

    let err = connection
        .submit(Command::query(0x10).with_shape(ResponseShape::MultiFrame))
        .await
        .unwrap_err();
    assert!(matches!(err, PumpError::AssemblyGap { expected: 1, received: 2 }));
    assert!(sink_rx.try_recv().is_err(), "partial history is never recorded");

    // the link stays usable
    connection.submit(Command::query(0x02)).await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn submission_during_handshake_runs_after_establishment() {
    let family = presets::patch_pump();
    let pump = VirtualPump::new(family.clone(), SECRET)
        .on(0x30, Behavior::Respond(vec![0xD0, 0x07, 55, 0x10, 0x0E]))
        .latency(Duration::from_millis(300));
    let (connection, handle) = connect(family.clone(), pump);

    let mut states = Box::pin(connection.session_updates());
    assert_eq!(states.next().await, Some(SessionState::Unpaired));

    let pending = connection.submit(Command::query(0x30));
    assert_eq!(states.next().await, Some(SessionState::Handshaking));
    let late = connection.submit(Command::query(0x30));

    let (first, second) = tokio::join!(pending, late);
    assert!(first.is_ok() && second.is_ok());
    assert_eq!(connection.session_state(), SessionState::Established);

    let events = handle.events();
    assert_eq!(events[0], WireEvent::Received { opcode: family.handshake_opcode, sequence: 0 });
    assert_eq!(handle.received(0x30), vec![1, 2]);

    let status = connection.current_status();
    assert!((status.reservoir_units.unwrap() - 100.0).abs() < 1e-9);
    assert_eq!(status.battery_percent, Some(55));
    assert!((status.battery_voltage.unwrap() - 3.6).abs() < 1e-9);
}

#[tokio::test(start_paused = true)]
async fn disconnect_resolves_every_command_once() {
    let family = presets::dana_r();
    let pump = VirtualPump::new(family.clone(), SECRET).otherwise(Behavior::Silent);
    let (connection, handle) = connect(family, pump);

    let pending: Vec<_> =
        (0..5u16).map(|i| connection.submit(Command::query(0x0200 + i).with_policy(policy(5_000, 3)))).collect();
    while handle.received(0x0200).is_empty() {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    handle.disconnect();

    for result in futures::future::join_all(pending).await {
        assert!(matches!(result, Err(PumpError::Disconnected)));
    }
    let stats = connection.stats();
    assert_eq!(stats.failed, 5);
    assert_eq!(stats.completed, 0);
    assert_eq!(connection.session_state(), SessionState::Expired);

    let err = connection.submit(Command::query(0x020B)).await.unwrap_err();
    assert!(matches!(err, PumpError::SessionNotReady { state: SessionState::Expired }));
}

#[tokio::test(start_paused = true)]
async fn corrupted_records_never_reach_the_status() {
    let family = presets::dana_r();
    let pump = VirtualPump::new(family.clone(), SECRET);
    let (connection, handle) = connect(family.clone(), pump);

    let codec = PacketCodec::new(Arc::new(family));
    let record = OutboundRecord {
        opcode: Opcode(0x020B),
        flags: FrameFlags::new(FrameFlags::FROM_PUMP),
        sequence: 0,
        fragment: 0,
        payload: &[0x13, 0x88, 90],
    };
    let mut corrupted = codec.encode_record(&record, None).unwrap();
    let payload_start = corrupted.len() - 2 - 3;
    corrupted[payload_start + 2] ^= 0x40;
    handle.inject_raw(corrupted);

    while connection.stats().malformed == 0 {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(connection.current_status().battery_percent, None);
    assert_eq!(connection.current_status().last_communication, None);

    handle.push(0x020B, vec![0x13, 0x88, 90]);
    let mut updates = Box::pin(connection.status_updates(None));
    let snapshot = loop {
        let snapshot = updates.next().await.expect("status stream open");
        if snapshot.battery_percent.is_some() {
            break snapshot;
        }
    };
    assert_eq!(snapshot.battery_percent, Some(90));
    assert!((snapshot.reservoir_units.unwrap() - 50.0).abs() < 1e-9);
}

#[tokio::test(start_paused = true)]
async fn refresher_polls_due_kinds_until_the_connection_closes() {
    let family = presets::dana_r();
    let pump = VirtualPump::new(family.clone(), SECRET).on(0x020B, Behavior::Respond(vec![0x0B, 0xB8, 71]));
    let (connection, handle) = connect(family, pump);

    let intervals = RefreshIntervals::default();
    let schedule = RefreshSchedule::all_due(intervals, Instant::now());
    let refresher = Refresher::spawn(&connection, schedule, Duration::from_secs(1));

    tokio::time::sleep(Duration::from_secs(11 * 60)).await;
    assert!(handle.received(0x020B).len() >= 4);
    assert_eq!(handle.received(0x3203).len(), 1);
    assert!(handle.received(0x3101).len() >= 2);
    assert!(handle.received(0x7001).is_empty(), "pump time refresh is disabled");
    assert_eq!(connection.current_status().battery_percent, Some(71));

    drop(connection);
    tokio::time::timeout(Duration::from_secs(5), refresher)
        .await
        .expect("refresher stops with the connection")
        .unwrap();
}

#[derive(Debug, Clone)]
enum Script {
    Respond(u8),
    Silent,
    Nack(u8),
}

fn script() -> impl Strategy<Value = (Script, bool)> {
    let reply = prop_oneof![
        any::<u8>().prop_map(Script::Respond),
        Just(Script::Silent),
        (1u8..=0xFF).prop_map(Script::Nack),
    ];
    (reply, prop::bool::weighted(0.2))
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn commands_resolve_once_in_submission_order(scripts in prop::collection::vec(script(), 1..10)) {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .start_paused(true)
            .build()
            .unwrap();

        runtime.block_on(async move {
            let family = presets::dana_r();
            let mut pump = VirtualPump::new(family.clone(), SECRET);
            for (index, (script, _)) in scripts.iter().enumerate() {
                let opcode = 0x0400 + index as u16;
                pump = pump.on(opcode, match script {
                    Script::Respond(byte) => Behavior::Respond(vec![*byte]),
                    Script::Silent => Behavior::Silent,
                    Script::Nack(code) => Behavior::Nack(*code),
                });
            }
            let (connection, handle) = connect(family, pump);

            let pending: Vec<_> = scripts
                .iter()
                .enumerate()
                .map(|(index, (_, cancel))| {
                    let response = connection.submit(Command::query(0x0400 + index as u16).with_policy(policy(100, 2)));
                    if *cancel {
                        response.cancel();
                    }
                    response
                })
                .collect();
            let results = futures::future::join_all(pending).await;

            let mut expected_order = Vec::new();
            for (index, ((script, cancel), result)) in scripts.iter().zip(&results).enumerate() {
                let opcode = Opcode(0x0400 + index as u16);
                if *cancel {
                    assert!(matches!(result, Err(PumpError::Cancelled)));
                    assert!(handle.received(opcode).is_empty());
                    continue;
                }
                expected_order.push(opcode);
                match script {
                    Script::Respond(byte) => {
                        assert_eq!(result.as_ref().unwrap().message.payload, vec![*byte]);
                    }
                    Script::Silent => {
                        assert!(matches!(result, Err(PumpError::Exhausted { attempts: 2, .. })));
                        assert_eq!(handle.received(opcode).len(), 2);
                    }
                    Script::Nack(code) => {
                        assert!(matches!(result, Err(PumpError::Rejected { code: c, .. }) if c == code));
                    }
                }
            }

            let mut seen_order: Vec<Opcode> = Vec::new();
            for event in handle.events() {
                if let WireEvent::Received { opcode, .. } = event {
                    if opcode != Opcode(0x3001) && seen_order.last() != Some(&opcode) {
                        seen_order.push(opcode);
                    }
                }
            }
            assert_eq!(seen_order, expected_order);

            let stats = connection.stats();
            assert_eq!(stats.completed + stats.failed, scripts.len() as u64);
        });
    }
}
