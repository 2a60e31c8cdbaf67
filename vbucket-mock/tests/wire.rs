//! Socket-level protocol scenarios against a single-node bucket.

mod common;

use anyhow::Result;
use common::{get_locked, hello, request, set, TestClient};
use vbucket_mock::bucket::{Bucket, BucketOptions};
use vbucket_mock::protocol::{Opcode, Status};

async fn single_node() -> Result<(Bucket, TestClient)> {
    let bucket = Bucket::start(BucketOptions {
        num_nodes: 1,
        num_replicas: 0,
        num_vbuckets: 4,
        ..BucketOptions::default()
    })
    .await?;
    let client = TestClient::connect(bucket.node_addrs()[0]).await?;
    Ok((bucket, client))
}

#[tokio::test]
async fn store_then_get_roundtrips_flags_value_and_cas() -> Result<()> {
    let (bucket, mut client) = single_node().await?;

    let stored = client.roundtrip(&set(0, b"foo", b"bar", 9, 0, 0)).await?;
    assert_eq!(stored.status, Status::Success);
    assert_ne!(stored.cas, 0);

    let fetched = client.roundtrip(&request(Opcode::Get, 0, b"foo")).await?;
    assert_eq!(fetched.status, Status::Success);
    assert_eq!(fetched.value, b"bar");
    assert_eq!(fetched.extras, 9u32.to_be_bytes());
    assert_eq!(fetched.cas, stored.cas);

    bucket.shutdown().await
}

#[tokio::test]
async fn quiet_get_on_a_miss_emits_nothing() -> Result<()> {
    let (bucket, mut client) = single_node().await?;

    // Pipeline a quiet miss and fence it with a NOOP: the first (and only)
    // response must be the NOOP's, proving the GETQ stayed silent.
    let mut getq = request(Opcode::GetQ, 0, b"missing");
    getq.opaque = 0x01;
    let mut noop = request(Opcode::Noop, 0, b"");
    noop.opaque = 0x02;
    client.send(&getq).await?;
    client.send(&noop).await?;

    let first = client.read_response().await?;
    assert_eq!(first.opcode, Opcode::Noop as u8);
    assert_eq!(first.opaque, 0x02);
    assert_eq!(first.status, Status::Success);

    bucket.shutdown().await
}

#[tokio::test]
async fn lock_flow_over_the_wire() -> Result<()> {
    let (bucket, mut client) = single_node().await?;

    let stored = client.roundtrip(&set(0, b"foo", b"bar", 0, 0, 0)).await?;
    let real_cas = stored.cas;

    let locked = client.roundtrip(&get_locked(0, b"foo", 5)).await?;
    assert_eq!(locked.status, Status::Success);
    assert_eq!(locked.value, b"bar");
    let lock_cas = locked.cas;
    assert_ne!(lock_cas, real_cas);

    let relock = client.roundtrip(&get_locked(0, b"foo", 5)).await?;
    assert_eq!(relock.status, Status::TemporaryFailure);

    let stale = client.roundtrip(&set(0, b"foo", b"next", 0, 0, real_cas)).await?;
    assert_eq!(stale.status, Status::TemporaryFailure);

    let unlocked = client.roundtrip(&set(0, b"foo", b"next", 0, 0, lock_cas)).await?;
    assert_eq!(unlocked.status, Status::Success);
    assert!(unlocked.cas > lock_cas);

    bucket.shutdown().await
}

#[tokio::test]
async fn quit_answers_once_then_closes() -> Result<()> {
    let (bucket, mut client) = single_node().await?;

    let goodbye = client.roundtrip(&request(Opcode::Quit, 0, b"")).await?;
    assert_eq!(goodbye.status, Status::Success);
    client.expect_eof().await?;

    bucket.shutdown().await
}

#[tokio::test]
async fn quiet_quit_closes_without_a_response() -> Result<()> {
    let (bucket, mut client) = single_node().await?;

    client.send(&request(Opcode::QuitQ, 0, b"")).await?;
    client.expect_eof().await?;

    bucket.shutdown().await
}

#[tokio::test]
async fn bad_magic_closes_the_connection_silently() -> Result<()> {
    let (bucket, mut client) = single_node().await?;

    client.send_raw(&[0x42; 24]).await?;
    client.expect_eof().await?;

    // The node itself is unaffected; a fresh connection works.
    let mut fresh = TestClient::connect(bucket.node_addrs()[0]).await?;
    let pong = fresh.roundtrip(&request(Opcode::Noop, 0, b"")).await?;
    assert_eq!(pong.status, Status::Success);

    bucket.shutdown().await
}

#[tokio::test]
async fn unknown_opcodes_fail_the_command_not_the_connection() -> Result<()> {
    let (bucket, mut client) = single_node().await?;

    let mut bogus = request(Opcode::Noop, 0, b"");
    bogus.opcode = 0xee;
    bogus.opaque = 0x77;
    let answered = client.roundtrip(&bogus).await?;
    assert_eq!(answered.status, Status::UnknownCommand);
    assert_eq!(answered.opaque, 0x77);

    let pong = client.roundtrip(&request(Opcode::Noop, 0, b"")).await?;
    assert_eq!(pong.status, Status::Success);

    bucket.shutdown().await
}

#[tokio::test]
async fn hello_turns_on_error_contexts_for_this_connection_only() -> Result<()> {
    let (bucket, mut negotiated) = single_node().await?;
    let mut legacy = TestClient::connect(bucket.node_addrs()[0]).await?;

    let accepted = negotiated.roundtrip(&hello(&[0x0007])).await?;
    assert_eq!(accepted.status, Status::Success);
    assert_eq!(accepted.value, 0x0007u16.to_be_bytes());

    let miss = negotiated.roundtrip(&request(Opcode::Get, 0, b"missing")).await?;
    assert_eq!(miss.status, Status::KeyNotFound);
    assert!(!miss.value.is_empty(), "negotiated session gets a context");

    let miss = legacy.roundtrip(&request(Opcode::Get, 0, b"missing")).await?;
    assert_eq!(miss.status, Status::KeyNotFound);
    assert!(miss.value.is_empty(), "legacy session gets a bare status");

    bucket.shutdown().await
}

#[tokio::test]
async fn stat_streams_until_the_empty_terminator() -> Result<()> {
    let (bucket, mut client) = single_node().await?;

    client.roundtrip(&set(0, b"foo", b"bar", 0, 0, 0)).await?;
    client.send(&request(Opcode::Stat, 0, b"")).await?;

    let mut seen = Vec::new();
    loop {
        let frame = client.read_response().await?;
        assert_eq!(frame.status, Status::Success);
        if frame.key.is_empty() {
            break;
        }
        seen.push((
            String::from_utf8(frame.key).expect("stat keys are ascii"),
            String::from_utf8(frame.value).expect("stat values are ascii"),
        ));
    }
    assert!(seen.iter().any(|(k, v)| k == "curr_items" && v == "1"));
    assert!(seen.iter().any(|(k, _)| k == "version"));

    bucket.shutdown().await
}

#[tokio::test]
async fn version_reports_the_crate_version() -> Result<()> {
    let (bucket, mut client) = single_node().await?;

    let version = client.roundtrip(&request(Opcode::Version, 0, b"")).await?;
    assert_eq!(version.status, Status::Success);
    assert_eq!(version.value, env!("CARGO_PKG_VERSION").as_bytes());

    bucket.shutdown().await
}

#[tokio::test]
async fn append_and_counter_opcodes_work_end_to_end() -> Result<()> {
    let (bucket, mut client) = single_node().await?;

    client.roundtrip(&set(0, b"greeting", b"hello", 0, 0, 0)).await?;
    let mut append = request(Opcode::Append, 0, b"greeting");
    append.value = b" world".to_vec();
    let appended = client.roundtrip(&append).await?;
    assert_eq!(appended.status, Status::Success);
    let fetched = client.roundtrip(&request(Opcode::Get, 0, b"greeting")).await?;
    assert_eq!(fetched.value, b"hello world");

    let mut incr = request(Opcode::Increment, 0, b"hits");
    incr.extras.extend_from_slice(&1u64.to_be_bytes());
    incr.extras.extend_from_slice(&7u64.to_be_bytes());
    incr.extras.extend_from_slice(&0u32.to_be_bytes());
    let seeded = client.roundtrip(&incr).await?;
    assert_eq!(seeded.status, Status::Success);
    assert_eq!(seeded.value, 7u64.to_be_bytes());
    let bumped = client.roundtrip(&incr).await?;
    assert_eq!(bumped.value, 8u64.to_be_bytes());

    bucket.shutdown().await
}
