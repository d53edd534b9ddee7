//! Transport Tests
//!
//! Frame codec behavior (including partial reads and protocol violations),
//! the exact byte layout of the block-carrying payloads, and the pool's
//! request/response cycle against a live loopback server.

use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::net::TcpListener;

use crate::transport::frame::{read_frame, write_frame, Frame, FrameError, OpCode, HEADER_LEN};
use crate::transport::messages::{
    decode_ack, decode_block_get_reply, decode_block_put, encode_ack, encode_block_get_reply,
    encode_block_put, AckStatus, BlockGetReply, BlockPut, Heartbeat,
};
use crate::metadata::types::{BlockId, NodeLabel};

// ============================================================
// FRAME CODEC
// ============================================================

#[tokio::test]
async fn frame_roundtrips_over_a_duplex_pipe() {
    let (mut client, mut server) = tokio::io::duplex(4096);

    let frame = Frame::new(OpCode::BlockGet, 42, vec![1, 2, 3]);
    write_frame(&mut client, &frame).await.unwrap();

    let read = read_frame(&mut server, 1024).await.unwrap();
    assert_eq!(read.op, OpCode::BlockGet);
    assert_eq!(read.correlation, 42);
    assert_eq!(read.payload, vec![1, 2, 3]);
}

#[tokio::test]
async fn reader_survives_partial_writes() {
    let (mut client, mut server) = tokio::io::duplex(4096);

    let frame = Frame::new(OpCode::Hello, 7, vec![9u8; 300]);
    let reader = tokio::spawn(async move { read_frame(&mut server, 1024).await });

    // Dribble the frame out a few bytes at a time.
    let mut encoded = Vec::new();
    write_frame(&mut encoded, &frame).await.unwrap();
    for chunk in encoded.chunks(11) {
        client.write_all(chunk).await.unwrap();
        client.flush().await.unwrap();
        tokio::task::yield_now().await;
    }

    let read = reader.await.unwrap().unwrap();
    assert_eq!(read.correlation, 7);
    assert_eq!(read.payload.len(), 300);
}

#[tokio::test]
async fn header_layout_is_sixteen_bytes_big_endian() {
    let mut encoded = Vec::new();
    write_frame(&mut encoded, &Frame::new(OpCode::BlockPut, 0x0102_0304, vec![0xAA]))
        .await
        .unwrap();

    assert_eq!(encoded.len(), HEADER_LEN + 1);
    assert_eq!(&encoded[0..4], &5u32.to_be_bytes()); // BLOCK_PUT opcode
    assert_eq!(&encoded[4..8], &[0x01, 0x02, 0x03, 0x04]);
    assert_eq!(&encoded[8..16], &1u64.to_be_bytes());
    assert_eq!(encoded[16], 0xAA);
}

#[tokio::test]
async fn unknown_opcode_is_a_protocol_error() {
    let (mut client, mut server) = tokio::io::duplex(256);
    let mut bogus = Vec::new();
    bogus.extend_from_slice(&999u32.to_be_bytes());
    bogus.extend_from_slice(&1u32.to_be_bytes());
    bogus.extend_from_slice(&0u64.to_be_bytes());
    client.write_all(&bogus).await.unwrap();

    assert!(matches!(
        read_frame(&mut server, 1024).await,
        Err(FrameError::UnknownOpcode(999))
    ));
}

#[tokio::test]
async fn oversized_payload_is_refused_before_buffering() {
    let (mut client, mut server) = tokio::io::duplex(256);
    let mut huge = Vec::new();
    huge.extend_from_slice(&1u32.to_be_bytes());
    huge.extend_from_slice(&1u32.to_be_bytes());
    huge.extend_from_slice(&(u64::MAX).to_be_bytes());
    client.write_all(&huge).await.unwrap();

    assert!(matches!(
        read_frame(&mut server, 1024).await,
        Err(FrameError::Oversized { .. })
    ));
}

// ============================================================
// BLOCK PAYLOAD LAYOUT
// ============================================================

#[test]
fn block_put_layout_is_exact() {
    let msg = BlockPut {
        id: BlockId::new("doc.bin", 3),
        is_replica: true,
        data: vec![0xCA, 0xFE],
    };
    let encoded = encode_block_put(&msg);

    // file_name_len (2 B) | file_name | index (4 B) | is_replica (1 B) | bytes
    assert_eq!(&encoded[0..2], &7u16.to_be_bytes());
    assert_eq!(&encoded[2..9], b"doc.bin");
    assert_eq!(&encoded[9..13], &3u32.to_be_bytes());
    assert_eq!(encoded[13], 1);
    assert_eq!(&encoded[14..], &[0xCA, 0xFE]);

    assert_eq!(decode_block_put(&encoded).unwrap(), msg);
}

#[test]
fn block_put_decode_rejects_truncation() {
    let msg = BlockPut {
        id: BlockId::new("doc.bin", 0),
        is_replica: false,
        data: vec![],
    };
    let encoded = encode_block_put(&msg);
    assert!(decode_block_put(&encoded[..encoded.len() - 1]).is_err());
    assert!(decode_block_put(&[]).is_err());
}

#[test]
fn block_get_reply_layout_is_exact() {
    let reply = BlockGetReply {
        status: AckStatus::Ok,
        data: vec![1, 2, 3],
    };
    let encoded = encode_block_get_reply(&reply);
    assert_eq!(encoded[0], 0);
    assert_eq!(&encoded[1..], &[1, 2, 3]);
    assert_eq!(decode_block_get_reply(&encoded).unwrap(), reply);

    let missing = BlockGetReply {
        status: AckStatus::Missing,
        data: vec![],
    };
    let encoded = encode_block_get_reply(&missing);
    assert_eq!(encoded, vec![2]);
    assert_eq!(decode_block_get_reply(&encoded).unwrap(), missing);
}

#[test]
fn ack_is_one_status_byte() {
    assert_eq!(encode_ack(AckStatus::NoSpace), vec![1]);
    assert_eq!(decode_ack(&[0]).unwrap(), AckStatus::Ok);
    assert!(decode_ack(&[]).is_err());
    assert!(decode_ack(&[0, 0]).is_err());
    assert!(decode_ack(&[200]).is_err());
}

#[test]
fn heartbeat_datagram_roundtrips_through_bincode() {
    let heartbeat = Heartbeat {
        label: NodeLabel(2),
        seq: 17,
        capacity: 50 * 1024 * 1024,
        used: 1024,
    };
    let encoded = bincode::serialize(&heartbeat).unwrap();
    let decoded: Heartbeat = bincode::deserialize(&encoded).unwrap();
    assert_eq!(decoded.label, heartbeat.label);
    assert_eq!(decoded.seq, 17);
}

// ============================================================
// POOL + SERVER
// ============================================================

#[tokio::test]
async fn pool_request_reaches_the_server_and_reuses_the_connection() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    // Echo server: replies with an ACK carrying the request correlation.
    tokio::spawn(crate::transport::tcp::serve(listener, 1024 * 1024, |_, frame| async move {
        Some(Frame::new(OpCode::Ack, frame.correlation, encode_ack(AckStatus::Ok)))
    }));

    let pool = crate::transport::tcp::PeerPool::new(1024 * 1024);
    for _ in 0..3 {
        let reply = pool
            .request(addr, OpCode::FileDelete, vec![], Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(reply.op, OpCode::Ack);
        assert_eq!(decode_ack(&reply.payload).unwrap(), AckStatus::Ok);
    }
}

#[tokio::test]
async fn pool_request_times_out_on_a_silent_server() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    // Accept but never answer.
    tokio::spawn(async move {
        let (_stream, _) = listener.accept().await.unwrap();
        tokio::time::sleep(Duration::from_secs(60)).await;
    });

    let pool = crate::transport::tcp::PeerPool::new(1024);
    let err = pool
        .request(addr, OpCode::MetaSync, vec![], Duration::from_millis(200))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("timed out"), "{err}");
}
