//! Integration tests for TLS termination and unwrapping

use std::net::SocketAddr;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::{timeout, Duration};

use tcprelay::tls::{self, TlsMaterial, TlsMode};
use tcprelay::{Config, ConnectionHandle, ConnectionManager};

struct TestCert {
    cert_pem: String,
    key_pem: String,
}

fn test_cert() -> TestCert {
    let certified =
        rcgen::generate_simple_self_signed(vec!["localhost".to_string(), "127.0.0.1".to_string()])
            .unwrap();
    TestCert {
        cert_pem: certified.cert.pem(),
        key_pem: certified.key_pair.serialize_pem(),
    }
}

async fn start_plain_echo() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let (mut reader, mut writer) = stream.split();
                let _ = tokio::io::copy(&mut reader, &mut writer).await;
            });
        }
    });

    addr
}

async fn start_tls_echo(cert: &TestCert) -> SocketAddr {
    let acceptor = tls::build_acceptor(cert.cert_pem.as_bytes(), Some(cert.key_pem.as_bytes()))
        .unwrap();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            let acceptor = acceptor.clone();
            tokio::spawn(async move {
                let Ok(stream) = acceptor.accept(stream).await else {
                    return;
                };
                let (mut reader, mut writer) = tokio::io::split(stream);
                let _ = tokio::io::copy(&mut reader, &mut writer).await;
                let _ = writer.shutdown().await;
            });
        }
    });

    addr
}

async fn start_relay(
    remote: SocketAddr,
    mode: TlsMode,
    material: TlsMaterial,
) -> (ConnectionHandle, SocketAddr) {
    start_relay_with_replace(remote, mode, material, "").await
}

async fn start_relay_with_replace(
    remote: SocketAddr,
    mode: TlsMode,
    material: TlsMaterial,
    replace: &str,
) -> (ConnectionHandle, SocketAddr) {
    let mut config = Config::default();
    config.listener.local_addr = "127.0.0.1:0".into();
    config.listener.remote_addr = remote.to_string();
    config.tls.mode = mode;
    config.transform.replace_expr = replace.into();

    let manager = ConnectionManager::bind(&config, &material).await.unwrap();
    let handle = manager.handle();
    let addr = manager.local_addr();

    tokio::spawn(async move {
        if let Err(e) = manager.run().await {
            eprintln!("Relay error: {}", e);
        }
    });

    (handle, addr)
}

async fn plain_exchange(relay: SocketAddr, payload: &[u8]) -> Vec<u8> {
    let mut client = TcpStream::connect(relay).await.unwrap();
    client.write_all(payload).await.unwrap();

    let mut response = vec![0u8; payload.len()];
    timeout(Duration::from_secs(2), client.read_exact(&mut response))
        .await
        .unwrap()
        .unwrap();
    response
}

/// Send plaintext and expect the relay to hang up. A TLS alert record
/// (content type 0x15) may arrive before the close.
async fn expect_closed(relay: SocketAddr) {
    let mut client = TcpStream::connect(relay).await.unwrap();
    let _ = client.write_all(b"hello").await;

    let mut received = Vec::new();
    let drained = timeout(Duration::from_secs(2), client.read_to_end(&mut received))
        .await
        .expect("relay kept the connection open");

    if drained.is_ok() && !received.is_empty() {
        assert_eq!(received[0], 0x15, "unexpected bytes: {:?}", received);
    }
}

async fn tls_client(relay: SocketAddr, cert: &TestCert) -> tokio_rustls::client::TlsStream<TcpStream> {
    let connector = tls::build_connector(Some(cert.cert_pem.as_bytes()), false).unwrap();
    let tcp = TcpStream::connect(relay).await.unwrap();
    connector
        .connect(tls::server_name("localhost").unwrap(), tcp)
        .await
        .unwrap()
}

#[tokio::test]
async fn test_terminate_locally_serves_tls_clients() {
    let cert = test_cert();
    let backend = start_plain_echo().await;
    let material = TlsMaterial {
        cert_pem: cert.cert_pem.clone().into_bytes(),
        key_pem: Some(cert.key_pem.clone().into_bytes()),
        ..Default::default()
    };
    let (_handle, relay) = start_relay(backend, TlsMode::TerminateLocally, material).await;

    let mut client = tls_client(relay, &cert).await;

    client.write_all(b"over tls").await.unwrap();
    client.flush().await.unwrap();

    let mut response = [0u8; 8];
    timeout(Duration::from_secs(2), client.read_exact(&mut response))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&response, b"over tls");
}

#[tokio::test]
async fn test_terminate_locally_rewrites_decrypted_bytes() {
    let cert = test_cert();
    let backend = start_plain_echo().await;
    let material = TlsMaterial {
        cert_pem: cert.cert_pem.clone().into_bytes(),
        key_pem: Some(cert.key_pem.clone().into_bytes()),
        ..Default::default()
    };
    let (_handle, relay) =
        start_relay_with_replace(backend, TlsMode::TerminateLocally, material, "foo~bar").await;

    let mut client = tls_client(relay, &cert).await;
    client.write_all(b"foo over tls").await.unwrap();
    client.flush().await.unwrap();

    let mut response = [0u8; 12];
    timeout(Duration::from_secs(2), client.read_exact(&mut response))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&response, b"bar over tls");
}

#[tokio::test]
async fn test_terminate_handshake_failure_keeps_listener_alive() {
    let cert = test_cert();
    let backend = start_plain_echo().await;
    let material = TlsMaterial {
        cert_pem: cert.cert_pem.clone().into_bytes(),
        key_pem: Some(cert.key_pem.clone().into_bytes()),
        ..Default::default()
    };
    let (handle, relay) = start_relay(backend, TlsMode::TerminateLocally, material).await;

    // Plaintext where a ClientHello is expected
    expect_closed(relay).await;

    let mut client = tls_client(relay, &cert).await;
    client.write_all(b"again").await.unwrap();
    client.flush().await.unwrap();

    let mut response = [0u8; 5];
    timeout(Duration::from_secs(2), client.read_exact(&mut response))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&response, b"again");
    assert_eq!(handle.engine().sessions_started(), 2);
}

#[tokio::test]
async fn test_unwrap_remote_with_trusted_ca() {
    let cert = test_cert();
    let backend = start_tls_echo(&cert).await;
    let material = TlsMaterial {
        remote_ca_pem: Some(cert.cert_pem.clone().into_bytes()),
        ..Default::default()
    };
    let (_handle, relay) = start_relay(backend, TlsMode::UnwrapRemote, material).await;

    assert_eq!(plain_exchange(relay, b"plain in").await, b"plain in".to_vec());
}

#[tokio::test]
async fn test_unwrap_remote_insecure_skips_verification() {
    let cert = test_cert();
    let backend = start_tls_echo(&cert).await;
    let material = TlsMaterial {
        insecure_skip_verify: true,
        ..Default::default()
    };
    let (_handle, relay) = start_relay(backend, TlsMode::UnwrapRemote, material).await;

    assert_eq!(plain_exchange(relay, b"whatever").await, b"whatever".to_vec());
}

#[tokio::test]
async fn test_unwrap_remote_rejects_untrusted_certificate() {
    let cert = test_cert();
    let backend = start_tls_echo(&cert).await;
    let (handle, relay) =
        start_relay(backend, TlsMode::UnwrapRemote, TlsMaterial::default()).await;

    expect_closed(relay).await;

    for _ in 0..50 {
        if handle.active_sessions() == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(handle.active_sessions(), 0);
    assert_eq!(handle.engine().sessions_started(), 1);
}
