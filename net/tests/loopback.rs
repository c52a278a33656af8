//! End-to-end scenarios over real loopback UDP sockets, per spec.md §8
//! "End-to-end scenarios".

use std::time::{Duration, Instant};

use arq_net::{dial, dial_encrypted, listen, listen_encrypted, Mode};
use tokio::time::timeout;

#[tokio::test]
async fn echo_roundtrip_lossless() {
    let listener = listen(Mode::Fast, "127.0.0.1:0").await.unwrap();
    let server_addr = listener.local_addr();

    let server = tokio::spawn(async move {
        let session = listener.accept().await.unwrap();
        let mut buf = vec![0u8; 64];
        let n = session.read(&mut buf).await.unwrap();
        session.write(&buf[..n]).await.unwrap();
    });

    let client = dial(Mode::Fast, server_addr).await.unwrap();
    client.write(b"hello").await.unwrap();

    let mut buf = vec![0u8; 64];
    let n = timeout(Duration::from_secs(5), client.read(&mut buf))
        .await
        .expect("timed out waiting for echo")
        .unwrap();

    assert_eq!(&buf[..n], b"hello");
    server.await.unwrap();
}

#[tokio::test]
async fn large_message_reassembles_across_fragments() {
    let listener = listen(Mode::Fast, "127.0.0.1:0").await.unwrap();
    let server_addr = listener.local_addr();

    let payload: Vec<u8> = (0..5000u32).map(|i| (i % 251) as u8).collect();
    let expected = payload.clone();

    let server = tokio::spawn(async move {
        let session = listener.accept().await.unwrap();
        let mut received = Vec::new();
        let mut buf = vec![0u8; 8192];
        while received.len() < expected.len() {
            let n = session.read(&mut buf).await.unwrap();
            received.extend_from_slice(&buf[..n]);
        }
        assert_eq!(received, expected);
    });

    let client = dial(Mode::Fast, server_addr).await.unwrap();
    client.write(&payload).await.unwrap();

    timeout(Duration::from_secs(10), server).await.expect("server task timed out").unwrap();
}

#[tokio::test]
async fn obfuscation_key_mismatch_never_delivers() {
    let listener = listen_encrypted(Mode::Fast, "127.0.0.1:0", b"server-secret")
        .await
        .unwrap();
    let server_addr = listener.local_addr();

    let server = tokio::spawn(async move {
        timeout(Duration::from_millis(500), listener.accept()).await
    });

    let client = dial_encrypted(Mode::Fast, server_addr, b"wrong-secret").await.unwrap();
    client.write(b"never arrives").await.unwrap();

    let outcome = server.await.unwrap();
    assert!(outcome.is_err(), "accept should never complete with mismatched keys");
}

#[tokio::test]
async fn matching_obfuscation_keys_deliver() {
    let listener = listen_encrypted(Mode::Fast, "127.0.0.1:0", b"shared-secret")
        .await
        .unwrap();
    let server_addr = listener.local_addr();

    let server = tokio::spawn(async move {
        let session = listener.accept().await.unwrap();
        let mut buf = vec![0u8; 64];
        session.read(&mut buf).await.unwrap()
    });

    let client = dial_encrypted(Mode::Fast, server_addr, b"shared-secret").await.unwrap();
    client.write(b"secret payload").await.unwrap();

    let n = timeout(Duration::from_secs(5), server)
        .await
        .expect("server task timed out")
        .unwrap();
    assert_eq!(n, b"secret payload".len());
}

#[tokio::test]
async fn read_times_out_with_no_data() {
    let lonely_listener = listen(Mode::Fast, "127.0.0.1:0").await.unwrap();
    let lonely_addr = lonely_listener.local_addr();
    let session = dial(Mode::Fast, lonely_addr).await.unwrap();
    session.set_read_deadline(Some(Instant::now() + Duration::from_millis(200)));

    let mut buf = vec![0u8; 16];
    let result = session.read(&mut buf).await;
    assert!(matches!(result, Err(arq_net::Error::Timeout)));
}

#[tokio::test]
async fn close_is_idempotent_and_second_call_errors() {
    let client = dial(Mode::Default, "127.0.0.1:9").await.unwrap();
    assert!(client.close().is_ok());
    assert!(matches!(client.close(), Err(arq_net::Error::BrokenPipe)));
}
