//! Handshake-level tests driven over real sockets.
//!
//! A raw protocol driver (no `ChatClient`) exercises the relay's session
//! state machine directly: key agreement, the join/list warmup, and the
//! close-on-violation paths.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use futures_util::{SinkExt, StreamExt};
use nodecrypt::codec::{self, ClientId, Envelope};
use nodecrypt::crypto::{ecdh, rsa as rsa_kem};
use nodecrypt::relay;
use nodecrypt::{RelayConfig, RelayContext};
use rsa::RsaPublicKey;
use tempfile::TempDir;
use tokio::net::TcpStream;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};

const MAX: usize = 512 * 1024;

type Ws = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Find a free local port by binding to port 0.
fn find_free_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

async fn spawn_relay(data_dir: &Path, idle_secs: u64, rotation_secs: u64) -> u16 {
    let port = find_free_port();
    let config = RelayConfig {
        bind: "127.0.0.1".into(),
        port,
        data_dir: data_dir.to_path_buf(),
        log: "error".into(),
        rsa_rotation_interval: Duration::from_secs(rotation_secs),
        idle_timeout: Duration::from_secs(idle_secs),
        max_envelope_bytes: MAX,
    };
    let ctx = Arc::new(RelayContext::new(config).unwrap());
    tokio::spawn(async move {
        let _ = relay::run(ctx).await;
    });
    tokio::time::sleep(Duration::from_millis(150)).await;
    port
}

/// Next text frame, or `None` once the relay closes the transport.
async fn next_text(ws: &mut Ws) -> Option<String> {
    loop {
        match tokio::time::timeout(Duration::from_secs(10), ws.next()).await {
            Err(_) => panic!("timed out waiting for a frame"),
            Ok(None) => return None,
            Ok(Some(Err(_))) => return None,
            Ok(Some(Ok(Message::Text(t)))) => return Some(t),
            Ok(Some(Ok(Message::Close(_)))) => return None,
            Ok(Some(Ok(_))) => continue,
        }
    }
}

/// Drive the client half of the outer handshake; returns our id and the
/// derived session key.
async fn raw_handshake(ws: &mut Ws) -> (ClientId, [u8; 32]) {
    let hello = next_text(ws).await.expect("server hello");
    let Envelope::ServerHello { client_id, key } = codec::decode(hello.as_bytes(), MAX).unwrap()
    else {
        panic!("first frame must be the server hello");
    };
    let server_rsa = rsa_kem::public_key_from_der(&BASE64.decode(key).unwrap()).unwrap();

    let rsa_priv = rsa_kem::generate_keypair().unwrap();
    let rsa_pub_der = rsa_kem::public_key_der(&RsaPublicKey::from(&rsa_priv)).unwrap();
    let (ecdh_secret, ecdh_point) = ecdh::generate_keypair();
    let wrapped = rsa_kem::oaep_encrypt(&server_rsa, &ecdh_point).unwrap();

    ws.send(Message::Text(
        codec::encode(&Envelope::KeyExchange {
            rsa: Some(BASE64.encode(rsa_pub_der)),
            key: BASE64.encode(wrapped),
        })
        .unwrap(),
    ))
    .await
    .unwrap();

    let reply = next_text(ws).await.expect("key exchange reply");
    let Envelope::KeyExchange { key, .. } = codec::decode(reply.as_bytes(), MAX).unwrap() else {
        panic!("second frame must be the key exchange reply");
    };
    let server_point = rsa_kem::oaep_decrypt(&rsa_priv, &BASE64.decode(key).unwrap()).unwrap();
    let aes_key = ecdh::derive_session_key(&ecdh_secret, &server_point).unwrap();
    (client_id, aes_key)
}

async fn send_sealed(ws: &mut Ws, aes_key: &[u8; 32], inner: &Envelope) {
    let outer = codec::seal(aes_key, inner).unwrap();
    ws.send(Message::Text(codec::encode(&outer).unwrap()))
        .await
        .unwrap();
}

/// Open a sealed frame under our key; panics if the relay sent anything else.
fn open_sealed(aes_key: &[u8; 32], text: &str) -> Envelope {
    let Envelope::Cipher { data } = codec::decode(text.as_bytes(), MAX * 2).unwrap() else {
        panic!("expected a cipher frame");
    };
    codec::open(aes_key, &data, MAX).unwrap()
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[tokio::test]
async fn handshake_keys_agree_and_join_yields_warmup_lists() {
    let dir = TempDir::new().unwrap();
    let port = spawn_relay(dir.path(), 60, 86_400).await;

    let (mut ws, _) = connect_async(format!("ws://127.0.0.1:{port}")).await.unwrap();
    let (client_id, aes_key) = raw_handshake(&mut ws).await;

    send_sealed(
        &mut ws,
        &aes_key,
        &Envelope::Join {
            user_name: "alice".into(),
            channel: "#test".into(),
        },
    )
    .await;

    // A sole joiner receives exactly its warmup pair: the individual list,
    // then its own copy of the channel-wide refresh. Both must open under
    // the key we derived — which proves both ends derived the same key.
    for _ in 0..2 {
        let frame = next_text(&mut ws).await.expect("list frame");
        let Envelope::List { clients } = open_sealed(&aes_key, &frame) else {
            panic!("expected a membership list");
        };
        assert_eq!(clients.len(), 1);
        assert_eq!(clients[0].client_id, client_id);
        assert_eq!(clients[0].user_name, "alice");
    }
}

#[tokio::test]
async fn repeated_join_closes_the_session() {
    let dir = TempDir::new().unwrap();
    let port = spawn_relay(dir.path(), 60, 86_400).await;

    let (mut ws, _) = connect_async(format!("ws://127.0.0.1:{port}")).await.unwrap();
    let (_, aes_key) = raw_handshake(&mut ws).await;

    let join = Envelope::Join {
        user_name: "alice".into(),
        channel: "#test".into(),
    };
    send_sealed(&mut ws, &aes_key, &join).await;
    for _ in 0..2 {
        next_text(&mut ws).await.expect("warmup list");
    }

    // Joining twice never duplicates membership — it kills the session.
    send_sealed(&mut ws, &aes_key, &join).await;
    assert!(next_text(&mut ws).await.is_none(), "relay must close the transport");
}

#[tokio::test]
async fn garbage_first_frame_closes_the_session() {
    let dir = TempDir::new().unwrap();
    let port = spawn_relay(dir.path(), 60, 86_400).await;

    let (mut ws, _) = connect_async(format!("ws://127.0.0.1:{port}")).await.unwrap();
    next_text(&mut ws).await.expect("server hello");

    ws.send(Message::Text("definitely not json".into())).await.unwrap();
    assert!(next_text(&mut ws).await.is_none());
}

#[tokio::test]
async fn out_of_order_envelope_closes_the_session() {
    let dir = TempDir::new().unwrap();
    let port = spawn_relay(dir.path(), 60, 86_400).await;

    let (mut ws, _) = connect_async(format!("ws://127.0.0.1:{port}")).await.unwrap();
    next_text(&mut ws).await.expect("server hello");

    // A clear-text join where the key exchange belongs.
    ws.send(Message::Text(
        codec::encode(&Envelope::Join {
            user_name: "mallory".into(),
            channel: "#test".into(),
        })
        .unwrap(),
    ))
    .await
    .unwrap();
    assert!(next_text(&mut ws).await.is_none());
}

#[tokio::test]
async fn chat_before_join_closes_the_session() {
    let dir = TempDir::new().unwrap();
    let port = spawn_relay(dir.path(), 60, 86_400).await;

    let (mut ws, _) = connect_async(format!("ws://127.0.0.1:{port}")).await.unwrap();
    let (client_id, aes_key) = raw_handshake(&mut ws).await;

    send_sealed(
        &mut ws,
        &aes_key,
        &Envelope::Direct {
            target: client_id,
            client_id: None,
            user_name: None,
            data: serde_json::json!({ "msg": "AAAA" }),
        },
    )
    .await;
    assert!(next_text(&mut ws).await.is_none());
}

#[tokio::test]
async fn rotation_hands_new_clients_a_new_key() {
    let dir = TempDir::new().unwrap();
    let port = spawn_relay(dir.path(), 60, 1).await;

    async fn server_key(port: u16) -> String {
        let (mut ws, _) = connect_async(format!("ws://127.0.0.1:{port}")).await.unwrap();
        let hello = next_text(&mut ws).await.expect("server hello");
        let Envelope::ServerHello { key, .. } = codec::decode(hello.as_bytes(), MAX).unwrap()
        else {
            panic!("expected server hello");
        };
        key
    }

    let first = server_key(port).await;
    tokio::time::sleep(Duration::from_millis(1300)).await;
    let second = server_key(port).await;
    assert_ne!(first, second, "a rotated identity must reach new clients");
}
