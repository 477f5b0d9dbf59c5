use std::{
    fs,
    net::SocketAddr,
    path::{Path, PathBuf},
    thread,
    time::Duration,
};

use vssh::{
    arq::ArqConfig,
    protocol::{
        ctl_message::{ControlMessageBuilder, MessageType},
        PACKET_DATA_SIZE,
    },
    secure::{receive_file_body, write_key_pair, SecureSession},
    transport::{Connection, Listener, TransportKind},
    Error,
};

struct Fixture {
    dir: tempfile::TempDir,
    signing: PathBuf,
    verifying: PathBuf,
}

impl Fixture {
    fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let signing = dir.path().join("vsshd.key");
        let verifying = dir.path().join("vsshd.pub");
        write_key_pair(&signing, &verifying).unwrap();
        fs::create_dir(dir.path().join("uploads")).unwrap();
        Fixture {
            dir,
            signing,
            verifying,
        }
    }

    fn uploads(&self) -> PathBuf {
        self.dir.path().join("uploads")
    }
}

fn cfg() -> ArqConfig {
    ArqConfig {
        recv_timeout: Some(Duration::from_secs(5)),
        ..ArqConfig::default()
    }
}

/// A server that answers messages with their reverse and stores files.
fn spawn_server(kind: TransportKind, signing: PathBuf, uploads: PathBuf) -> SocketAddr {
    let listener = Listener::bind(kind, "127.0.0.1:0", cfg()).unwrap();
    let addr = listener.local_addr().unwrap();
    thread::spawn(move || {
        listener
            .serve(move |conn| {
                let mut session = match SecureSession::establish(conn, true, &signing) {
                    Ok(x) => x,
                    Err(_) => return,
                };
                while let Ok(msg) = session.receive_control_message_secure() {
                    match msg.msg_type() {
                        Ok(MessageType::MsgHeader) => {
                            let mut body = session.secure_receive().unwrap();
                            body.reverse();
                            session.send_buffer_secure(&body).unwrap();
                        }
                        Ok(MessageType::FileHeader) => {
                            let file = receive_file_body(&mut session, &msg, &uploads).unwrap();
                            let ack = format!("{}:{}", file.user, file.len);
                            session.send_buffer_secure(ack.as_bytes()).unwrap();
                        }
                        _ => break,
                    }
                }
            })
            .unwrap();
    });
    addr
}

fn exercise(kind: TransportKind) {
    let fixture = Fixture::new();
    let addr = spawn_server(kind, fixture.signing.clone(), fixture.uploads());

    let conn = Connection::connect(kind, addr, &cfg()).unwrap();
    let mut session = SecureSession::establish(conn, false, &fixture.verifying).unwrap();

    let text = b"hello, secure world";
    let hdr = ControlMessageBuilder::new(MessageType::MsgHeader, text.len() as u64)
        .build()
        .unwrap();
    session.send_control_message_secure(&hdr).unwrap();
    session.secure_send(text).unwrap();
    let mut expected = text.to_vec();
    expected.reverse();
    assert_eq!(session.receive_buffer_secure().unwrap(), expected);

    let src = fixture.dir.path().join("report.bin");
    let content: Vec<u8> = (0..PACKET_DATA_SIZE * 5 + 77).map(|i| (i % 13) as u8).collect();
    fs::write(&src, &content).unwrap();
    session.send_file_secure(&src, "dave").unwrap();
    assert_eq!(
        session.receive_buffer_secure().unwrap(),
        format!("dave:{}", content.len()).into_bytes()
    );
    assert_eq!(
        fs::read(fixture.uploads().join("report.bin")).unwrap(),
        content
    );

    session.close_secure().unwrap();
}

#[test]
fn over_stream() {
    exercise(TransportKind::Stream);
}

#[test]
fn over_arq() {
    exercise(TransportKind::Arq);
}

#[test]
fn untrusted_server_is_rejected() {
    let fixture = Fixture::new();
    let impostor = Fixture::new();
    let addr = spawn_server(
        TransportKind::Stream,
        impostor.signing.clone(),
        impostor.uploads(),
    );

    let conn = Connection::connect(TransportKind::Stream, addr, &cfg()).unwrap();
    match SecureSession::establish(conn, false, &fixture.verifying) {
        Err(Error::AuthenticationFailure(_)) => (),
        Err(e) => panic!("{}", e),
        Ok(_) => panic!("impostor accepted"),
    }
}

#[test]
fn key_files_round_trip() {
    let fixture = Fixture::new();
    let signing = vssh::secure::load_signing_key(Path::new(&fixture.signing)).unwrap();
    let verifying = vssh::secure::load_verifying_key(&fixture.verifying).unwrap();
    assert_eq!(signing.verifying_key(), verifying);
}
