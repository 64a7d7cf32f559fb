//! End-to-end write transfers against a real listener on the loopback interface.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use monitor_tftpd::tftp::{decode_block_number, decode_error_code, decode_op_code, encode_data, encode_request};
use monitor_tftpd::{ImageQueue, Listener, Operation, ServerConfig, ServerContext};
use tokio::net::UdpSocket;
use tokio::sync::watch;
use tokio::time::{sleep, timeout, Instant};

struct TestServer {
    addr: SocketAddr,
    images: Arc<ImageQueue>,
    _shutdown: watch::Sender<bool>,
}

async fn start_server(transfer_timeout: Duration) -> TestServer {
    let images = Arc::new(ImageQueue::new());
    let config = ServerConfig {
        bind_address: "127.0.0.1:0".parse().unwrap(),
        idle_timeout: Duration::from_millis(100),
        transfer_timeout,
        max_retries: 3,
        ..ServerConfig::default()
    };
    let listener = Listener::bind(ServerContext::new(config, images.clone())).unwrap();
    let addr = listener.local_addr().unwrap();
    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move { listener.run(rx).await });
    TestServer { addr, images, _shutdown: tx }
}

async fn recv(sock: &UdpSocket) -> (Vec<u8>, SocketAddr) {
    let mut buf = [0u8; 600];
    let (n, src) = timeout(Duration::from_secs(2), sock.recv_from(&mut buf))
        .await
        .expect("no packet from server")
        .unwrap();
    (buf[..n].to_vec(), src)
}

async fn nothing_received(sock: &UdpSocket, wait: Duration) -> bool {
    let mut buf = [0u8; 600];
    timeout(wait, sock.recv_from(&mut buf)).await.is_err()
}

/// Sends a WRQ and returns the session's address once ACK 0 arrives from it.
async fn open_write(client: &UdpSocket, server: &TestServer, file_name: &str) -> SocketAddr {
    let wrq = encode_request(Operation::Write, file_name, "octet").unwrap();
    client.send_to(&wrq, server.addr).await.unwrap();
    let (ack, session) = recv(client).await;
    assert_eq!(ack, vec![0x00, 0x04, 0x00, 0x00]);
    assert_ne!(session, server.addr);
    session
}

async fn send_data(client: &UdpSocket, session: SocketAddr, block: u16, payload: &[u8]) -> u16 {
    client.send_to(&encode_data(block, payload).unwrap(), session).await.unwrap();
    let (ack, src) = recv(client).await;
    assert_eq!(src, session);
    assert_eq!(decode_op_code(&ack), Ok(4));
    decode_block_number(&ack).unwrap()
}

async fn wait_for_images(images: &ImageQueue, count: usize) {
    let deadline = Instant::now() + Duration::from_secs(2);
    while images.len() < count && Instant::now() < deadline {
        sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn test_two_block_upload() {
    let server = start_server(Duration::from_millis(500)).await;
    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let session = open_write(&client, &server, "pic.jpg").await;

    assert_eq!(send_data(&client, session, 1, &[0xAB; 512]).await, 1);
    assert_eq!(send_data(&client, session, 2, &[0xCD; 10]).await, 2);

    wait_for_images(&server.images, 1).await;
    let images = server.images.take_all();
    assert_eq!(images.len(), 1);
    assert_eq!(images[0].file_name, "pic.jpg");
    assert_eq!(images[0].bytes.len(), 522);
    assert_eq!(&images[0].bytes[..512], &[0xAB; 512][..]);
    assert_eq!(&images[0].bytes[512..], &[0xCD; 10][..]);
}

#[tokio::test]
async fn test_exact_multiple_waits_for_empty_block() {
    let server = start_server(Duration::from_millis(500)).await;
    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let session = open_write(&client, &server, "pic.jpg").await;

    assert_eq!(send_data(&client, session, 1, &[0x11; 512]).await, 1);

    sleep(Duration::from_millis(200)).await;
    assert!(server.images.is_empty());

    assert_eq!(send_data(&client, session, 2, &[]).await, 2);
    wait_for_images(&server.images, 1).await;
    assert_eq!(server.images.take_all()[0].bytes, vec![0x11; 512]);
}

#[tokio::test]
async fn test_duplicate_block_is_reacked_once_stored() {
    let server = start_server(Duration::from_millis(500)).await;
    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let session = open_write(&client, &server, "pic.jpg").await;

    assert_eq!(send_data(&client, session, 1, &[0x01; 512]).await, 1);
    // The ACK "got lost", so the client sends block 1 again.
    assert_eq!(send_data(&client, session, 1, &[0x01; 512]).await, 1);
    assert_eq!(send_data(&client, session, 2, &[0x02; 10]).await, 2);

    wait_for_images(&server.images, 1).await;
    let images = server.images.take_all();
    assert_eq!(images.len(), 1);
    assert_eq!(images[0].bytes.len(), 522);
}

#[tokio::test]
async fn test_block_ahead_aborts_with_illegal_operation() {
    let server = start_server(Duration::from_millis(500)).await;
    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let session = open_write(&client, &server, "pic.jpg").await;

    assert_eq!(send_data(&client, session, 1, &[0x01; 512]).await, 1);
    client.send_to(&encode_data(3u16, &[0x03; 10]).unwrap(), session).await.unwrap();

    let (err, src) = recv(&client).await;
    assert_eq!(src, session);
    assert_eq!(decode_error_code(&err), Ok(4));

    // The session is gone: a correct block gets no answer.
    client.send_to(&encode_data(2u16, &[0x02; 10]).unwrap(), session).await.unwrap();
    assert!(nothing_received(&client, Duration::from_millis(300)).await);
    assert!(server.images.is_empty());
}

#[tokio::test]
async fn test_foreign_tid_is_rejected_without_disturbing_transfer() {
    let server = start_server(Duration::from_millis(500)).await;
    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let client_port = client.local_addr().unwrap().port();
    let session = open_write(&client, &server, "pic.jpg").await;

    // Same port as the client, different host.
    let other_host = UdpSocket::bind(("127.0.0.2", client_port)).await.unwrap();
    other_host.send_to(&encode_data(1u16, &[0xEE; 5]).unwrap(), session).await.unwrap();
    let (err, src) = recv(&other_host).await;
    assert_eq!(src, session);
    assert_eq!(decode_error_code(&err), Ok(5));

    // Same host as the client, different port.
    let other_port = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    other_port.send_to(&encode_data(1u16, &[0xEE; 5]).unwrap(), session).await.unwrap();
    let (err, _) = recv(&other_port).await;
    assert_eq!(decode_error_code(&err), Ok(5));

    assert!(nothing_received(&client, Duration::from_millis(100)).await);
    assert_eq!(send_data(&client, session, 1, b"real image").await, 1);

    wait_for_images(&server.images, 1).await;
    assert_eq!(server.images.take_all()[0].bytes, b"real image".to_vec());
}

#[tokio::test]
async fn test_silent_client_times_out() {
    let server = start_server(Duration::from_millis(100)).await;
    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let session = open_write(&client, &server, "pic.jpg").await;

    // Four waits of 100ms each, then the session gives up without an ERROR.
    assert!(nothing_received(&client, Duration::from_millis(700)).await);

    client.send_to(&encode_data(1u16, &[0x01; 10]).unwrap(), session).await.unwrap();
    assert!(nothing_received(&client, Duration::from_millis(300)).await);
    assert!(server.images.is_empty());
}

#[tokio::test]
async fn test_concurrent_uploads_share_sink() {
    let server = start_server(Duration::from_millis(500)).await;

    let mut uploads = Vec::new();
    for n in 0..4u8 {
        let clients_server = TestServer {
            addr: server.addr,
            images: server.images.clone(),
            _shutdown: watch::channel(false).0,
        };
        uploads.push(tokio::spawn(async move {
            let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
            let session = open_write(&client, &clients_server, &format!("cam{n}.jpg")).await;
            assert_eq!(send_data(&client, session, 1, &[n; 512]).await, 1);
            assert_eq!(send_data(&client, session, 2, &[n; 100]).await, 2);
        }));
    }
    for upload in uploads {
        upload.await.unwrap();
    }

    wait_for_images(&server.images, 4).await;
    let mut images = server.images.take_all();
    assert_eq!(images.len(), 4);
    images.sort_by(|a, b| a.file_name.cmp(&b.file_name));
    for (n, image) in images.iter().enumerate() {
        assert_eq!(image.file_name, format!("cam{n}.jpg"));
        assert_eq!(image.bytes.len(), 612);
        assert!(image.bytes.iter().all(|&b| b == n as u8));
    }
}

#[tokio::test]
async fn test_listener_survives_garbage() {
    let server = start_server(Duration::from_millis(500)).await;
    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();

    for garbage in [&[][..], &[0x00][..], &[0xFF; 700][..], &[0x00, 0x02, 0x61][..]] {
        client.send_to(garbage, server.addr).await.unwrap();
        let (err, _) = recv(&client).await;
        assert_eq!(decode_error_code(&err), Ok(4));
    }

    let session = open_write(&client, &server, "after.jpg").await;
    assert_eq!(send_data(&client, session, 1, b"ok").await, 1);
    wait_for_images(&server.images, 1).await;
    assert_eq!(server.images.len(), 1);
}
