//! Socket transport against an in-process listener speaking the wire format.

use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixListener;

use hymoctl::rules::{RuleFlags, RuleKind};
use hymoctl::service::socket::{SocketAddress, SocketBackend};
use hymoctl::service::wire::{self, opcode, MAGIC, REQUEST_HEADER_LEN};
use hymoctl::service::{Command, ServiceBackend, ServiceError};

/// How the fake server answers each request.
#[derive(Clone, Copy)]
enum Mode {
    /// Echo the sequence number and reply per opcode.
    Normal,
    /// Answer with a sequence number the client never sent.
    WrongSeq,
}

fn le_u32(buf: &[u8], index: usize) -> u32 {
    let mut bytes = [0u8; 4];
    bytes.copy_from_slice(&buf[index * 4..index * 4 + 4]);
    u32::from_le_bytes(bytes)
}

fn answer(opcode: u32, payload: &[u8]) -> (i32, Vec<u8>) {
    match opcode {
        opcode::GET_VERSION => (0, 3i32.to_le_bytes().to_vec()),
        opcode::GET_ENGINE_VERSION => (0, 12i32.to_le_bytes().to_vec()),
        opcode::HYMO_GET_ACTIVE_RULES => (0, b"hide /foo id=1 flags=0\0".to_vec()),
        opcode::HYMO_ADD_MERGE_RULE if payload.len() == wire::PATH_FIELD_LEN * 2 + 4 => {
            (5, Vec::new())
        }
        opcode::HYMO_DELETE_RULE => (-2, Vec::new()),
        _ => (0, Vec::new()),
    }
}

/// Serve up to two connections in turn; resolves to how many were accepted.
fn spawn_server(path: &Path, mode: Mode) -> tokio::task::JoinHandle<usize> {
    let listener = match UnixListener::bind(path) {
        Ok(l) => l,
        Err(e) => panic!("bind: {e}"),
    };
    tokio::spawn(async move {
        let mut accepted = 0;
        while let Ok((mut stream, _)) = listener.accept().await {
            accepted += 1;
            loop {
                let mut header = [0u8; REQUEST_HEADER_LEN];
                if stream.read_exact(&mut header).await.is_err() {
                    break;
                }
                assert_eq!(le_u32(&header, 0), MAGIC);
                let op = le_u32(&header, 2);
                let seq = le_u32(&header, 3);
                let mut payload = vec![0u8; le_u32(&header, 4) as usize];
                if stream.read_exact(&mut payload).await.is_err() {
                    break;
                }

                let (result, body) = answer(op, &payload);
                let seq = match mode {
                    Mode::Normal => seq,
                    Mode::WrongSeq => seq.wrapping_add(100),
                };
                let mut out = Vec::with_capacity(16 + body.len());
                out.extend_from_slice(&MAGIC.to_le_bytes());
                out.extend_from_slice(&seq.to_le_bytes());
                out.extend_from_slice(&result.to_le_bytes());
                out.extend_from_slice(&u32::try_from(body.len()).unwrap_or(0).to_le_bytes());
                out.extend_from_slice(&body);
                if stream.write_all(&out).await.is_err() {
                    break;
                }
            }
            if accepted >= 2 {
                break;
            }
        }
        accepted
    })
}

fn client(path: &Path) -> SocketBackend {
    SocketBackend::new(
        SocketAddress::Path(path.to_path_buf()),
        Duration::from_secs(2),
    )
}

fn socket_path(dir: &tempfile::TempDir) -> PathBuf {
    dir.path().join("murasaki.sock")
}

fn tempdir() -> tempfile::TempDir {
    match tempfile::tempdir() {
        Ok(dir) => dir,
        Err(e) => panic!("tempdir: {e}"),
    }
}

#[tokio::test]
async fn calls_share_one_connection() {
    let dir = tempdir();
    let path = socket_path(&dir);
    let server = spawn_server(&path, Mode::Normal);
    let backend = client(&path);

    let version = match backend.call(&Command::ServiceVersion).await {
        Ok(reply) => reply,
        Err(e) => panic!("version: {e}"),
    };
    assert_eq!(version.value, Some(3));
    assert!(version.structured);

    let rules = match backend.call(&Command::ListRules).await {
        Ok(reply) => reply,
        Err(e) => panic!("list: {e}"),
    };
    assert_eq!(rules.text, "hide /foo id=1 flags=0");

    // After an explicit disconnect the next call dials again.
    if let Err(e) = backend.disconnect().await {
        panic!("disconnect: {e}");
    }
    if let Err(e) = backend.call(&Command::EngineVersion).await {
        panic!("engine version: {e}");
    }
    if let Err(e) = backend.disconnect().await {
        panic!("disconnect: {e}");
    }
    match server.await {
        Ok(accepted) => assert_eq!(accepted, 2),
        Err(e) => panic!("server task: {e}"),
    }
}

#[tokio::test]
async fn merge_rule_returns_assigned_id() {
    let dir = tempdir();
    let path = socket_path(&dir);
    let _server = spawn_server(&path, Mode::Normal);
    let backend = client(&path);

    let reply = backend
        .call(&Command::AddRule {
            kind: RuleKind::Merge,
            source: PathBuf::from("/system/etc"),
            target: Some(PathBuf::from("/data/adb/modules/m/system/etc")),
            flags: RuleFlags::DIRECTORY,
        })
        .await;
    match reply {
        Ok(reply) => {
            assert_eq!(reply.status, 5);
            assert_eq!(reply.value, Some(5));
        }
        Err(e) => panic!("add: {e}"),
    }
}

#[tokio::test]
async fn negative_result_is_a_reply_not_an_error() {
    let dir = tempdir();
    let path = socket_path(&dir);
    let _server = spawn_server(&path, Mode::Normal);
    let backend = client(&path);

    match backend
        .call(&Command::DeleteRule(hymoctl::rules::RuleId::new(9)))
        .await
    {
        Ok(reply) => {
            assert_eq!(reply.status, -2);
            assert!(reply.text.contains("-2"));
        }
        Err(e) => panic!("delete: {e}"),
    }
}

#[tokio::test]
async fn sequence_mismatch_is_protocol_error_and_reconnects() {
    let dir = tempdir();
    let path = socket_path(&dir);
    let server = spawn_server(&path, Mode::WrongSeq);
    let backend = client(&path);

    for _ in 0..2 {
        match backend.call(&Command::FixMounts).await {
            Err(ServiceError::Protocol(_)) => {}
            other => panic!("expected Protocol, got {other:?}"),
        }
    }
    drop(backend);
    match server.await {
        Ok(accepted) => assert_eq!(accepted, 2),
        Err(e) => panic!("server task: {e}"),
    }
}

#[tokio::test]
async fn missing_socket_is_unavailable() {
    let dir = tempdir();
    let backend = client(&socket_path(&dir));
    match backend.call(&Command::ServiceVersion).await {
        Err(ServiceError::Unavailable(_)) => {}
        other => panic!("expected Unavailable, got {other:?}"),
    }
}

#[tokio::test]
async fn unencodable_command_never_connects() {
    let dir = tempdir();
    let backend = client(&socket_path(&dir));
    match backend.call(&Command::SetAvcSpoof(true)).await {
        Err(ServiceError::Unsupported { command, .. }) => assert_eq!(command, "set_avc_spoof"),
        other => panic!("expected Unsupported, got {other:?}"),
    }
}
