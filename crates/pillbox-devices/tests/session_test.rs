//! Device Session Tests
//!
//! Drives a `DeviceSession` against an in-process mock pillbox listening on
//! loopback TCP.

use std::time::Duration;

use chrono::NaiveDate;
use pillbox_core::{MedicationSchedule, SessionConfig};
use pillbox_devices::{
    channel, BoxState, CommandStatus, ConnectionState, DeviceMessage, DeviceSession,
    MessageKind, MessageReceiver, ScheduleCommandBuilder, SessionError,
};
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpListener;
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(2);

/// Mock pillbox side of one connection.
struct MockPillbox {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl MockPillbox {
    async fn send_raw(&mut self, raw: &str) {
        self.writer.write_all(raw.as_bytes()).await.unwrap();
        self.writer.flush().await.unwrap();
    }

    async fn send(&mut self, value: Value) {
        self.send_raw(&format!("{}\n", value)).await;
    }

    async fn read_json(&mut self) -> Value {
        let mut line = String::new();
        timeout(WAIT, self.reader.read_line(&mut line))
            .await
            .expect("host wrote nothing")
            .unwrap();
        serde_json::from_str(line.trim_end()).unwrap()
    }
}

fn test_config() -> SessionConfig {
    SessionConfig {
        poll_interval_ms: 50,
        command_timeout_secs: 1,
        ..Default::default()
    }
}

async fn connected_pair() -> (DeviceSession, MessageReceiver, MockPillbox) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let (router, receiver) = channel();
    let session = DeviceSession::new(&test_config(), router);
    session.connect("127.0.0.1", port).await.unwrap();

    let (stream, _) = timeout(WAIT, listener.accept()).await.unwrap().unwrap();
    let (reader, writer) = stream.into_split();
    (
        session,
        receiver,
        MockPillbox {
            reader: BufReader::new(reader),
            writer,
        },
    )
}

async fn next_message(receiver: &mut MessageReceiver) -> DeviceMessage {
    timeout(WAIT, receiver.recv())
        .await
        .expect("no message routed")
        .expect("router closed")
        .message
}

#[tokio::test]
async fn test_welcome_is_routed_and_cached() {
    let (session, mut receiver, mut device) = connected_pair().await;
    assert_eq!(session.state(), ConnectionState::Connected);
    assert!(session.welcome().is_none());

    device
        .send(json!({
            "type": "welcome",
            "device": "ESP32-Pillbox",
            "ip": "127.0.0.1",
            "boxes": 10,
            "time": "2024-10-15 08:00:00"
        }))
        .await;

    let DeviceMessage::Welcome(welcome) = next_message(&mut receiver).await else {
        panic!("expected welcome");
    };
    assert_eq!(welcome.compartment_count, 10);
    assert_eq!(session.welcome(), Some(welcome));

    session.disconnect().await;
}

#[tokio::test]
async fn test_split_frames_reassembled_in_order() {
    let (session, mut receiver, mut device) = connected_pair().await;

    device.send_raw(r#"{"type":"box_"#).await;
    tokio::time::sleep(Duration::from_millis(80)).await;
    device
        .send_raw("event\",\"box\":1,\"state\":\"open\",\"time\":\"08:05:00\"}\n{\"type\":\"sta")
        .await;
    tokio::time::sleep(Duration::from_millis(80)).await;
    device.send_raw("tus\",\"time\":\"t\",\"scheduleCount\":3}\n").await;

    let first = next_message(&mut receiver).await;
    let DeviceMessage::BoxEvent(event) = first else {
        panic!("expected box event, got {:?}", first);
    };
    assert_eq!(event.compartment_index, 1);
    assert_eq!(event.state, BoxState::Open);

    assert_eq!(next_message(&mut receiver).await.kind(), MessageKind::Status);
    assert_eq!(session.last_status().unwrap().schedule_count, Some(3));
    assert!(receiver.is_empty());

    session.disconnect().await;
}

#[tokio::test]
async fn test_bad_lines_do_not_stop_the_loop() {
    let (session, mut receiver, mut device) = connected_pair().await;

    device
        .send_raw("garbage\n{\"no_type\":1}\n{\"type\":\"firmware\"}\n{\"type\":\"box_event\"}\n\n")
        .await;
    device
        .send(json!({"type": "compartment_status", "compartment_id": 3, "is_open": true}))
        .await;

    assert_eq!(
        next_message(&mut receiver).await.kind(),
        MessageKind::CompartmentStatus
    );
    assert!(receiver.is_empty());
    assert!(session.compartment("3").unwrap().is_open);
    assert!(session.is_connected());

    session.disconnect().await;
}

#[tokio::test]
async fn test_set_time_ok() {
    let (session, _receiver, mut device) = connected_pair().await;

    let at = NaiveDate::from_ymd_opt(2024, 10, 15)
        .unwrap()
        .and_hms_opt(8, 30, 0)
        .unwrap();
    let (response, request) = tokio::join!(session.set_time(at), async {
        let request = device.read_json().await;
        device.send(json!({"status": "OK"})).await;
        request
    });

    assert_eq!(
        request,
        json!({"cmd": "SET_TIME", "datetime": "2024-10-15 08:30:00"})
    );
    assert!(response.is_ok());

    session.disconnect().await;
}

#[tokio::test]
async fn test_typed_messages_during_command_are_routed() {
    let (session, mut receiver, mut device) = connected_pair().await;

    let ping = json!({"cmd": "PING"});
    let (response, _) = tokio::join!(
        session.send_command(&ping, Duration::from_secs(1)),
        async {
            device.read_json().await;
            device.send(json!({"type": "status", "time": "t"})).await;
            device
                .send(json!({"status": "ERROR", "message": "unknown command"}))
                .await;
        }
    );

    assert_eq!(response.status, CommandStatus::Error);
    assert_eq!(response.message.as_deref(), Some("unknown command"));
    assert_eq!(next_message(&mut receiver).await.kind(), MessageKind::Status);

    session.disconnect().await;
}

#[tokio::test]
async fn test_unparseable_reply_is_error() {
    let (session, _receiver, mut device) = connected_pair().await;

    let ping = json!({"cmd": "PING"});
    let (response, _) = tokio::join!(
        session.send_command(&ping, Duration::from_secs(1)),
        async {
            device.read_json().await;
            device.send_raw("OK!!\n").await;
        }
    );
    assert_eq!(response.status, CommandStatus::Error);
    assert!(session.is_connected());

    session.disconnect().await;
}

#[tokio::test]
async fn test_silent_device_times_out() {
    let (session, _receiver, mut device) = connected_pair().await;

    let ping = json!({"cmd": "PING"});
    let (response, _) = tokio::join!(
        session.send_command(&ping, Duration::from_millis(200)),
        device.read_json()
    );
    assert_eq!(response.status, CommandStatus::Timeout);
    assert!(session.is_connected());

    // A late reply with nothing in flight is dropped, not handed to the next command.
    device.send(json!({"status": "OK"})).await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    let ping = json!({"cmd": "PING"});
    let (response, _) = tokio::join!(
        session.send_command(&ping, Duration::from_millis(200)),
        device.read_json()
    );
    assert_eq!(response.status, CommandStatus::Timeout);

    session.disconnect().await;
}

#[tokio::test]
async fn test_send_schedule_with_assignments() {
    let (session, _receiver, mut device) = connected_pair().await;

    let schedule = MedicationSchedule::new(
        "M2",
        vec![chrono::NaiveTime::from_hms_opt(9, 0, 0).unwrap()],
        NaiveDate::from_ymd_opt(2024, 10, 1).unwrap(),
        NaiveDate::from_ymd_opt(2024, 10, 31).unwrap(),
    );
    let command = ScheduleCommandBuilder::build(&[schedule]).unwrap();

    let (response, request) = tokio::join!(session.send_schedule(&command), async {
        let request = device.read_json().await;
        device
            .send(json!({"status": "OK", "assignments": [{"medication_id": "M2", "box": 5}]}))
            .await;
        request
    });

    assert_eq!(request["cmd"], json!("SET_SCHEDULE"));
    assert_eq!(request["medications"][0]["schedule_times"], json!(["09:00"]));
    assert!(response.is_ok());
    assert_eq!(
        ScheduleCommandBuilder::assignments(&response),
        vec![("M2".to_string(), Some(5))]
    );

    session.disconnect().await;
}

#[tokio::test]
async fn test_fire_and_forget_wire_format() {
    let (session, _receiver, mut device) = connected_pair().await;

    session.send_simple_message("hello").await.unwrap();
    let sent = device.read_json().await;
    assert_eq!(sent["type"], json!("simple_message"));
    assert_eq!(sent["message"], json!("hello"));

    session.request_status().await.unwrap();
    assert_eq!(device.read_json().await["type"], json!("status_request"));

    session
        .send_display_message("M1", 2, "08:00", "With food", 30)
        .await
        .unwrap();
    let sent = device.read_json().await;
    assert_eq!(sent["type"], json!("display_message"));
    assert_eq!(sent["duration"], json!(30));

    session.disconnect().await;
}

#[tokio::test]
async fn test_disconnect_is_idempotent() {
    let (session, _receiver, _device) = connected_pair().await;

    session.disconnect().await;
    session.disconnect().await;
    assert_eq!(session.state(), ConnectionState::Disconnected);

    assert!(matches!(
        session.send_simple_message("late").await,
        Err(SessionError::NotConnected)
    ));
    let response = session
        .send_command(&json!({"cmd": "PING"}), Duration::from_millis(100))
        .await;
    assert_eq!(response.status, CommandStatus::Error);
}

#[tokio::test]
async fn test_peer_close_disconnects() {
    let (session, _receiver, device) = connected_pair().await;
    drop(device);

    timeout(WAIT, async {
        while session.is_connected() {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("session never noticed the close");
    assert_eq!(session.state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn test_writes_fail_after_peer_close() {
    let (session, _receiver, device) = connected_pair().await;
    drop(device);

    timeout(WAIT, async {
        while session.is_connected() {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("session never noticed the close");

    assert!(matches!(
        session.send_simple_message("hello").await,
        Err(SessionError::NotConnected)
    ));
    let response = session
        .send_command(&json!({"cmd": "PING"}), Duration::from_millis(500))
        .await;
    assert_eq!(response.status, CommandStatus::Error);
}

#[tokio::test]
async fn test_connect_refused() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);

    let (router, _receiver) = channel();
    let session = DeviceSession::new(&test_config(), router);
    let result = session.connect("127.0.0.1", port).await;

    assert!(matches!(result, Err(SessionError::ConnectionRefused(_))));
    assert_eq!(session.state(), ConnectionState::Disconnected);
}
