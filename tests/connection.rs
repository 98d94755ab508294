mod util;

use std::time::Duration;

use assert_matches::assert_matches;
use bytes::Bytes;

use quill_proto::{
    ConnectionError, Dir, Event, ObserverConfig, ReadError, StreamEvent, TransportConfig, VarInt,
};
use util::Pair;

fn drain_events(conn: &mut quill_proto::Connection) -> Vec<Event> {
    let mut events = Vec::new();
    while let Some(event) = conn.poll() {
        events.push(event);
    }
    events
}

#[test]
fn handshake_completes() {
    let mut pair = Pair::new();
    pair.connect();
    let client_events = drain_events(pair.client_conn());
    assert!(client_events
        .iter()
        .any(|e| matches!(e, Event::Connected)));
    let server_events = drain_events(pair.server_conn());
    assert!(server_events
        .iter()
        .any(|e| matches!(e, Event::Connected)));
    assert_eq!(pair.client_conn().side(), quill_proto::Side::Client);
}

#[test]
fn single_stream_write_fin_ack() {
    let mut pair = Pair::new();
    pair.connect();
    drain_events(pair.client_conn());

    let id = pair.client_conn().open(Dir::Uni).expect("stream limits");
    let payload = vec![0xab; 100];
    assert_eq!(pair.client_conn().write(id, &payload, true).unwrap(), 100);
    pair.drive();

    // Server reads exactly the bytes, with FIN
    let server = pair.server_conn();
    let accepted = server.accept(Dir::Uni).expect("stream opened");
    assert_eq!(accepted, id);
    let mut data = Vec::new();
    let mut fin = false;
    loop {
        match server.read(accepted, usize::MAX) {
            Ok(Some((chunk, at_end))) => {
                data.extend_from_slice(&chunk);
                fin |= at_end;
                if at_end {
                    break;
                }
            }
            Ok(None) => {
                fin = true;
                break;
            }
            Err(ReadError::Blocked) => break,
            Err(e) => panic!("read failed: {e}"),
        }
    }
    assert_eq!(data, payload);
    assert!(fin);

    // After the ack returns, the client's send side is fully closed
    pair.drive();
    let events = drain_events(pair.client_conn());
    assert!(
        events
            .iter()
            .any(|e| matches!(e, Event::Stream(StreamEvent::Finished { id: fid }) if *fid == id)),
        "no Finished event in {events:?}"
    );
}

#[test]
fn bidirectional_echo() {
    let mut pair = Pair::new();
    pair.connect();

    let id = pair.client_conn().open(Dir::Bi).unwrap();
    pair.client_conn().write(id, b"ping", true).unwrap();
    pair.drive();

    let server = pair.server_conn();
    let sid = server.accept(Dir::Bi).unwrap();
    let (data, _) = server.read(sid, usize::MAX).unwrap().unwrap();
    assert_eq!(&data[..], b"ping");
    server.write(sid, b"pong", true).unwrap();
    pair.drive();

    let (data, fin) = pair.client_conn().read(id, usize::MAX).unwrap().unwrap();
    assert_eq!(&data[..], b"pong");
    assert!(fin);
}

#[test]
fn large_transfer_flow_control() {
    let mut pair = Pair::new();
    pair.connect();

    let id = pair.client_conn().open(Dir::Uni).unwrap();
    // Larger than one packet, spans many STREAM frames
    let payload: Vec<u8> = (0..200_000u32).map(|i| i as u8).collect();
    let mut offset = 0;
    let mut received = 0usize;
    let mut accepted = false;
    let mut stalls = 0;
    while offset < payload.len() {
        match pair.client_conn().write(id, &payload[offset..], false) {
            Ok(n) => {
                offset += n;
                stalls = 0;
            }
            Err(quill_proto::WriteError::Blocked) => {
                // Let acks and window updates flow, and drain the receiver
                pair.drive();
                if !accepted {
                    accepted = pair.server_conn().accept(Dir::Uni).is_some();
                }
                while let Ok(Some((chunk, _))) = pair.server_conn().read(id, usize::MAX) {
                    received += chunk.len();
                }
                stalls += 1;
                assert!(stalls < 100, "transfer deadlocked at offset {offset}");
            }
            Err(e) => panic!("write failed: {e}"),
        }
    }
    pair.client_conn().finish(id).unwrap();
    pair.drive();
    if !accepted {
        pair.server_conn().accept(Dir::Uni);
    }
    loop {
        match pair.server_conn().read(id, usize::MAX) {
            Ok(Some((chunk, at_end))) => {
                received += chunk.len();
                if at_end {
                    break;
                }
            }
            Ok(None) => break,
            Err(ReadError::Blocked) => {
                stalls += 1;
                assert!(stalls < 200, "drain deadlocked at {received}");
                pair.drive();
            }
            Err(e) => panic!("read failed: {e}"),
        }
    }
    assert_eq!(received, payload.len());
}

#[test]
fn ack_threshold_produces_acks() {
    let mut client_cfg = TransportConfig::default();
    client_cfg.observer(ObserverConfig::all());
    let mut pair = Pair::with_config(client_cfg, TransportConfig::default());
    pair.connect();
    drain_events(pair.client_conn());

    // 50 ack-eliciting packets; with a threshold of 10 the server must generate
    // several distinct acknowledgements
    let id = pair.client_conn().open(Dir::Uni).unwrap();
    for _ in 0..50 {
        pair.client_conn().write(id, &[0u8; 1200], false).unwrap();
        pair.drive();
    }
    let events = drain_events(pair.client_conn());
    let acks = events
        .iter()
        .filter(|e| matches!(e, Event::AckProcessed(_)))
        .count();
    assert!(acks >= 5, "only {acks} ack events");
}

#[test]
fn reset_stream_surfaces_to_peer() {
    let mut pair = Pair::new();
    pair.connect();

    let id = pair.client_conn().open(Dir::Uni).unwrap();
    pair.client_conn().write(id, b"partial", false).unwrap();
    pair.drive();
    pair.client_conn().reset(id, VarInt::from_u32(17), None);
    pair.drive();

    let server = pair.server_conn();
    let sid = server.accept(Dir::Uni).unwrap();
    // Everything is discarded by a plain reset
    let mut saw_reset = false;
    for _ in 0..4 {
        match server.read(sid, usize::MAX) {
            Err(ReadError::Reset(code)) => {
                assert_eq!(code, VarInt::from_u32(17));
                saw_reset = true;
                break;
            }
            Ok(Some(_)) => continue,
            Ok(None) => break,
            Err(ReadError::Blocked) => break,
            Err(e) => panic!("unexpected: {e}"),
        }
    }
    assert!(saw_reset);
}

#[test]
fn reliable_reset_delivers_prefix() {
    let mut pair = Pair::new();
    pair.connect();

    let id = pair.client_conn().open(Dir::Uni).unwrap();
    pair.client_conn().write(id, b"0123456789", false).unwrap();
    pair.client_conn().reset(id, VarInt::from_u32(5), Some(6));
    pair.drive();

    let sid = pair.server_conn().accept(Dir::Uni).unwrap();
    let mut delivered = Vec::new();
    let mut attempts = 0;
    let reset_code = loop {
        match pair.server_conn().read(sid, usize::MAX) {
            Ok(Some((chunk, _))) => delivered.extend_from_slice(&chunk),
            Err(ReadError::Reset(code)) => break code,
            Ok(None) => panic!("unexpected eof"),
            Err(ReadError::Blocked) => {
                attempts += 1;
                assert!(attempts < 50, "prefix never delivered");
                pair.drive();
            }
            Err(e) => panic!("unexpected: {e}"),
        }
    };
    assert_eq!(delivered, b"012345");
    assert_eq!(reset_code, VarInt::from_u32(5));
}

#[test]
fn stop_sending_resets_peer_stream() {
    let mut pair = Pair::new();
    pair.connect();

    let id = pair.client_conn().open(Dir::Uni).unwrap();
    pair.client_conn().write(id, b"unwanted", false).unwrap();
    pair.drive();

    let server = pair.server_conn();
    let sid = server.accept(Dir::Uni).unwrap();
    server.stop_sending(sid, VarInt::from_u32(33));
    pair.drive();

    // The client's send half is stopped with the server's code
    let result = pair.client_conn().write(id, b"more", false);
    assert_matches!(
        result,
        Err(quill_proto::WriteError::Stopped(code)) if code == VarInt::from_u32(33)
    );
}

#[test]
fn datagrams_roundtrip() {
    let mut pair = Pair::new();
    pair.connect();

    pair.client_conn()
        .send_datagram(Bytes::from_static(b"hello datagram"))
        .unwrap();
    pair.drive();

    let server = pair.server_conn();
    let received = server.recv_datagram().expect("datagram delivered");
    assert_eq!(&received[..], b"hello datagram");
}

#[test]
fn application_close_reaches_peer() {
    let mut pair = Pair::new();
    pair.connect();
    drain_events(pair.server_conn());

    let now = pair.time;
    pair.client_conn()
        .close(now, VarInt::from_u32(42), Bytes::from_static(b"bye"));
    pair.drive();

    let events = drain_events(pair.server_conn());
    let found = events.iter().any(|e| {
        matches!(
            e,
            Event::ConnectionLost {
                reason: ConnectionError::ApplicationClosed(close)
            } if close.error_code == VarInt::from_u32(42)
        )
    });
    assert!(found, "server never learned of the close: {events:?}");
}

#[test]
fn idle_timeout_closes_silently() {
    let mut pair = Pair::new();
    pair.connect();
    drain_events(pair.client_conn());

    // No traffic for longer than the idle timeout
    pair.jump_time(Duration::from_secs(31));
    let events = drain_events(pair.client_conn());
    assert!(events.iter().any(|e| matches!(
        e,
        Event::ConnectionLost {
            reason: ConnectionError::TimedOut
        }
    )));
    assert!(pair.client_conn().is_drained());
}

#[test]
fn loss_recovered_by_retransmission() {
    let mut client_cfg = TransportConfig::default();
    client_cfg.observer(ObserverConfig::all());
    let mut pair = Pair::with_config(client_cfg, TransportConfig::default());
    pair.connect();
    drain_events(pair.client_conn());

    let id = pair.client_conn().open(Dir::Uni).unwrap();
    pair.client_conn().write(id, b"will be dropped", true).unwrap();
    // Swallow the next client datagram
    pair.drop_client_to_server = 1;
    pair.drive();

    // Retransmission must deliver the data regardless
    let sid = pair
        .server_conn()
        .accept(Dir::Uni)
        .expect("stream arrived after loss");
    let mut data = Vec::new();
    let mut attempts = 0;
    loop {
        match pair.server_conn().read(sid, usize::MAX) {
            Ok(Some((chunk, at_end))) => {
                data.extend_from_slice(&chunk);
                if at_end {
                    break;
                }
            }
            Ok(None) => break,
            Err(ReadError::Blocked) => {
                attempts += 1;
                assert!(attempts < 50, "data never retransmitted");
                pair.drive();
            }
            Err(e) => panic!("read failed: {e}"),
        }
    }
    assert_eq!(data, b"will be dropped");
}

#[test]
fn key_update_continues_connection() {
    let mut pair = Pair::new();
    pair.connect();

    // Exchange some data in phase zero
    let id = pair.client_conn().open(Dir::Uni).unwrap();
    pair.client_conn().write(id, b"before", false).unwrap();
    pair.drive();

    assert!(pair.client_conn().initiate_key_update());
    pair.client_conn().write(id, b" after", true).unwrap();
    pair.drive();

    let sid = pair.server_conn().accept(Dir::Uni).unwrap();
    let mut data = Vec::new();
    let mut attempts = 0;
    loop {
        match pair.server_conn().read(sid, usize::MAX) {
            Ok(Some((chunk, at_end))) => {
                data.extend_from_slice(&chunk);
                if at_end {
                    break;
                }
            }
            Ok(None) => break,
            Err(ReadError::Blocked) => {
                attempts += 1;
                assert!(attempts < 50, "data lost across key update");
                pair.drive();
            }
            Err(e) => panic!("read failed: {e}"),
        }
    }
    assert_eq!(data, b"before after");
    assert!(pair.client_conn().stats().key_updates >= 1);
}

#[test]
fn immediate_initial_retransmit_survives_first_loss() {
    let mut client_cfg = TransportConfig::default();
    client_cfg.immediate_initial_retransmit(true);
    let mut pair = Pair::with_config(client_cfg, TransportConfig::default());
    // The first flight vanishes; its shadow copy must carry the handshake without
    // waiting out a probe timeout
    pair.drop_client_to_server = 1;
    pair.connect();
}

#[test]
fn stream_limits_enforced() {
    let mut server_cfg = TransportConfig::default();
    server_cfg.max_concurrent_uni_streams(VarInt::from_u32(2));
    let mut pair = Pair::with_config(TransportConfig::default(), server_cfg);
    pair.connect();

    let client = pair.client_conn();
    assert!(client.open(Dir::Uni).is_some());
    assert!(client.open(Dir::Uni).is_some());
    // Limit reached; a STREAMS_BLOCKED goes out instead
    assert!(client.open(Dir::Uni).is_none());
}
