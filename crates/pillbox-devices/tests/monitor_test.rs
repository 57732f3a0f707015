//! Pillbox Monitor Tests
//!
//! Box events routed from a session end up as medication records.

use std::sync::Arc;
use std::time::Duration;

use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use pillbox_core::{
    FixedClock, MedicationSchedule, MedicationStatus, MedicationStatusEngine, MemoryStore,
    SessionConfig,
};
use pillbox_devices::{
    channel, BoxEvent, BoxState, DeviceMessage, DeviceSession, MessageKind, MonitorEvent,
    PillboxMonitor, StatusReport,
};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpListener;

fn day() -> NaiveDate {
    NaiveDate::from_ymd_opt(2024, 10, 15).unwrap()
}

fn hm(h: u32, m: u32) -> NaiveTime {
    NaiveTime::from_hms_opt(h, m, 0).unwrap()
}

fn now() -> NaiveDateTime {
    day().and_time(hm(12, 0))
}

fn engine(store: Arc<MemoryStore>) -> Arc<MedicationStatusEngine> {
    Arc::new(
        MedicationStatusEngine::new(store).with_clock(Arc::new(FixedClock::new(now()))),
    )
}

fn m0_store() -> Arc<MemoryStore> {
    Arc::new(MemoryStore::with_schedules(vec![MedicationSchedule::new(
        "M0",
        vec![hm(8, 0), hm(14, 0), hm(20, 0)],
        NaiveDate::from_ymd_opt(2024, 10, 1).unwrap(),
        NaiveDate::from_ymd_opt(2024, 12, 31).unwrap(),
    )]))
}

fn box_event(index: u8, state: BoxState, time: &str) -> DeviceMessage {
    DeviceMessage::BoxEvent(BoxEvent {
        compartment_index: index,
        state,
        timestamp: time.to_string(),
    })
}

#[tokio::test]
async fn test_process_pending_in_order() {
    let store = m0_store();
    let (router, receiver) = channel();
    let mut monitor = PillboxMonitor::new(receiver, engine(store.clone()));

    router.route(box_event(0, BoxState::Open, "08:05:00"));
    router.route(box_event(0, BoxState::Closed, "08:05:10"));
    router.route(box_event(5, BoxState::Open, "08:06:00"));
    router.route(DeviceMessage::Status(StatusReport {
        timestamp: "t".to_string(),
        network_info: None,
        schedule_count: Some(1),
        extra: Default::default(),
    }));

    let events = monitor.process_pending().await;
    assert_eq!(events.len(), 4);

    let MonitorEvent::DoseRecorded(record) = &events[0] else {
        panic!("expected a record, got {:?}", events[0]);
    };
    assert_eq!(record.scheduled_time, hm(8, 0));
    assert_eq!(record.status, MedicationStatus::Taken);
    assert!(record.sensor_confirmed);
    assert_eq!(record.actual_time, Some(day().and_time(NaiveTime::from_hms_opt(8, 5, 0).unwrap())));

    assert_eq!(events[1], MonitorEvent::BoxClosed { compartment: 0 });
    assert_eq!(
        events[2],
        MonitorEvent::Unscheduled {
            compartment: "5".to_string()
        }
    );
    assert!(matches!(&events[3], MonitorEvent::Device(m) if m.kind() == MessageKind::Status));
    assert_eq!(store.record_count(), 1);

    assert!(monitor.process_pending().await.is_empty());
}

#[tokio::test]
async fn test_missing_device_time_uses_engine_clock() {
    let (router, receiver) = channel();
    let mut monitor = PillboxMonitor::new(receiver, engine(m0_store()));

    router.route(box_event(0, BoxState::Open, ""));
    let events = monitor.process_pending().await;

    let MonitorEvent::DoseRecorded(record) = &events[0] else {
        panic!("expected a record");
    };
    assert_eq!(record.actual_time, Some(now()));
    assert_eq!(record.scheduled_time, hm(14, 0));
}

#[tokio::test]
async fn test_socket_to_record() {
    let store = m0_store();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let (router, receiver) = channel();
    let session = DeviceSession::new(
        &SessionConfig {
            poll_interval_ms: 50,
            ..Default::default()
        },
        router,
    );
    session.connect("127.0.0.1", port).await.unwrap();
    let (mut device, _) = listener.accept().await.unwrap();

    device
        .write_all(b"{\"type\":\"box_event\",\"box\":0,\"state\":\"open\",\"time\":\"2024-10-15 14:02:00\"}\n")
        .await
        .unwrap();

    let mut events = Vec::new();
    let monitor_task = tokio::spawn(
        PillboxMonitor::new(receiver, engine(store.clone())).run(move |event| events.push(event)),
    );

    tokio::time::timeout(Duration::from_secs(2), async {
        while store.record_count() == 0 {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("no record created");

    // Dropping the session drops the last router, which ends `run`.
    session.disconnect().await;
    drop(session);
    tokio::time::timeout(Duration::from_secs(2), monitor_task)
        .await
        .expect("monitor did not exit")
        .unwrap();
}
