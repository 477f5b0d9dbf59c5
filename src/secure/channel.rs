use std::{
    fs,
    io::{Read, Write},
    path::{Path, PathBuf},
};

use tracing::{debug, info, warn};

use crate::{
    error::{Error, Result},
    protocol::{
        ctl_message::{ControlMessage, ControlMessageBuilder, MessageType},
        PACKET_DATA_SIZE,
    },
    transport::{Transport, TransportKind},
};

use super::{cipher::SessionSecret, kex::execute_key_exchange};

pub fn send_control_message<T: Transport + ?Sized>(t: &mut T, msg: &ControlMessage) -> Result<()> {
    t.send_message(&msg.to_bytes())
}

pub fn receive_control_message<T: Transport + ?Sized>(t: &mut T) -> Result<ControlMessage> {
    ControlMessage::from_bytes(&t.receive_message()?)
}

/// Sends `BUF_HEADER` with the length, then the bytes as one message.
pub fn send_buffer<T: Transport + ?Sized>(t: &mut T, buf: &[u8]) -> Result<()> {
    let hdr = ControlMessageBuilder::new(MessageType::BufHeader, buf.len() as u64).build()?;
    send_control_message(t, &hdr)?;
    t.send_message(buf)
}

pub fn receive_buffer<T: Transport + ?Sized>(t: &mut T) -> Result<Vec<u8>> {
    let hdr = receive_control_message(t)?;
    if hdr.msg_type()? != MessageType::BufHeader {
        return Err(Error::Decoding { field: "buffer header" });
    }
    receive_buffer_body(t, &hdr)
}

pub fn receive_buffer_body<T: Transport + ?Sized>(t: &mut T, hdr: &ControlMessage) -> Result<Vec<u8>> {
    let buf = t.receive_message()?;
    if buf.len() as u64 != hdr.length() {
        return Err(Error::Decoding { field: "buffer length" });
    }
    Ok(buf)
}

/// Sends `FILE_HEADER` (length, user, file name) and then the content in
/// `PACKET_DATA_SIZE` chunks.
pub fn send_file<T: Transport + ?Sized>(t: &mut T, path: &Path, user: &str) -> Result<u64> {
    let name = path
        .file_name()
        .and_then(|x| x.to_str())
        .ok_or(Error::InvalidInput("path has no file name"))?;
    let mut file = fs::File::open(path)?;
    let len = file.metadata()?.len();

    let hdr = ControlMessageBuilder {
        spare_buffer1: user.as_bytes(),
        spare_buffer2: name.as_bytes(),
        ..ControlMessageBuilder::new(MessageType::FileHeader, len)
    }
    .build()?;
    send_control_message(t, &hdr)?;

    let mut chunk = [0; PACKET_DATA_SIZE];
    let mut sent = 0;
    while sent < len {
        let n = file.read(&mut chunk)?;
        if n == 0 {
            return Err(Error::InvalidInput("file shrank while sending"));
        }
        let n = n.min((len - sent) as usize);
        t.send_message(&chunk[..n])?;
        sent += n as u64;
    }
    debug!(name, len, "file sent");
    Ok(len)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedFile {
    pub user: String,
    pub path: PathBuf,
    pub len: u64,
}

pub fn receive_file<T: Transport + ?Sized>(t: &mut T, dir: &Path) -> Result<ReceivedFile> {
    let hdr = receive_control_message(t)?;
    if hdr.msg_type()? != MessageType::FileHeader {
        return Err(Error::Decoding { field: "file header" });
    }
    receive_file_body(t, &hdr, dir)
}

/// Stores the content announced by `hdr` under `dir`. Only the final
/// component of the announced name is used.
pub fn receive_file_body<T: Transport + ?Sized>(
    t: &mut T,
    hdr: &ControlMessage,
    dir: &Path,
) -> Result<ReceivedFile> {
    let announced = hdr.spare_str2();
    let name = Path::new(&announced)
        .file_name()
        .ok_or(Error::Decoding { field: "file name" })?;
    let path = dir.join(name);
    let len = hdr.length();

    let mut file = fs::File::create(&path)?;
    let mut received = 0;
    while received < len {
        let chunk = t.receive_message()?;
        if chunk.len() as u64 > len - received {
            return Err(Error::Decoding { field: "file chunk" });
        }
        file.write_all(&chunk)?;
        received += chunk.len() as u64;
    }
    file.flush()?;
    Ok(ReceivedFile {
        user: hdr.spare_str1(),
        path,
        len,
    })
}

/// A transport whose every message is sealed with the session secret.
pub struct SecureSession<T> {
    inner: T,
    secret: SessionSecret,
}

impl<T: Transport> SecureSession<T> {
    #[must_use]
    pub fn new(inner: T, secret: SessionSecret) -> Self {
        SecureSession { inner, secret }
    }

    /// Runs the key exchange over `inner`. On failure the transport is closed
    /// and nothing is ever sent unencrypted after it.
    pub fn establish(mut inner: T, is_initiator: bool, key_path: &Path) -> Result<Self> {
        match execute_key_exchange(&mut inner, is_initiator, key_path) {
            Ok(secret) => Ok(SecureSession::new(inner, secret)),
            Err(e) => {
                if let Err(close) = inner.close() {
                    warn!(%close, "close after failed key exchange");
                }
                Err(e)
            }
        }
    }

    pub fn secure_send(&mut self, msg: &[u8]) -> Result<()> {
        let frame = self.secret.seal(msg)?;
        self.inner.send_message(&frame)
    }

    pub fn secure_receive(&mut self) -> Result<Vec<u8>> {
        let frame = self.inner.receive_message()?;
        self.secret.open(&frame)
    }

    pub fn send_control_message_secure(&mut self, msg: &ControlMessage) -> Result<()> {
        send_control_message(self, msg)
    }

    pub fn receive_control_message_secure(&mut self) -> Result<ControlMessage> {
        receive_control_message(self)
    }

    pub fn send_buffer_secure(&mut self, buf: &[u8]) -> Result<()> {
        send_buffer(self, buf)
    }

    pub fn receive_buffer_secure(&mut self) -> Result<Vec<u8>> {
        receive_buffer(self)
    }

    pub fn send_file_secure(&mut self, path: &Path, user: &str) -> Result<u64> {
        send_file(self, path, user)
    }

    pub fn receive_file_secure(&mut self, dir: &Path) -> Result<ReceivedFile> {
        receive_file(self, dir)
    }

    /// Tells the peer the session is over, then closes the transport.
    pub fn close_secure(&mut self) -> Result<()> {
        let bye = ControlMessageBuilder::new(MessageType::Shutdown, 0).build()?;
        let res = self.send_control_message_secure(&bye);
        self.inner.close()?;
        info!(kind = ?self.inner.kind(), "secure session closed");
        res
    }

    #[must_use]
    pub fn inner(&self) -> &T {
        &self.inner
    }

    pub fn inner_mut(&mut self) -> &mut T {
        &mut self.inner
    }

    #[must_use]
    pub fn secret(&self) -> &SessionSecret {
        &self.secret
    }

    #[must_use]
    pub fn into_inner(self) -> T {
        self.inner
    }
}

impl<T: Transport> Transport for SecureSession<T> {
    fn send_message(&mut self, msg: &[u8]) -> Result<()> {
        self.secure_send(msg)
    }

    fn receive_message(&mut self) -> Result<Vec<u8>> {
        self.secure_receive()
    }

    fn close(&mut self) -> Result<()> {
        self.close_secure()
    }

    fn kind(&self) -> TransportKind {
        self.inner.kind()
    }
}

#[cfg(test)]
mod tests {
    use crate::secure::{
        cipher::SECRET_LEN,
        testing::{pipe, Pipe},
    };

    use super::*;

    fn pair() -> (SecureSession<Pipe>, SecureSession<Pipe>) {
        let (a, b) = pipe();
        let secret = SessionSecret::from_bytes([5; SECRET_LEN]);
        (
            SecureSession::new(a, secret.clone()),
            SecureSession::new(b, secret),
        )
    }

    #[test]
    fn secure_round_trip() {
        let (mut a, mut b) = pair();
        for len in [0, 1, 100, PACKET_DATA_SIZE] {
            let msg: Vec<u8> = (0..len).map(|i| (i * 7) as u8).collect();
            a.secure_send(&msg).unwrap();
            assert_eq!(b.secure_receive().unwrap(), msg);
        }
    }

    #[test]
    fn ciphertext_on_the_wire() {
        let (a, mut b) = pipe();
        let mut a = SecureSession::new(a, SessionSecret::from_bytes([5; SECRET_LEN]));
        a.secure_send(b"top secret").unwrap();
        let frame = b.receive_message().unwrap();
        assert!(!frame.windows(10).any(|w| w == b"top secret"));
    }

    #[test]
    fn wrong_secret() {
        let (a, b) = pipe();
        let mut a = SecureSession::new(a, SessionSecret::from_bytes([1; SECRET_LEN]));
        let mut b = SecureSession::new(b, SessionSecret::from_bytes([2; SECRET_LEN]));
        a.secure_send(b"x").unwrap();
        assert!(matches!(
            b.secure_receive(),
            Err(Error::AuthenticationFailure(_))
        ));
    }

    #[test]
    fn control_message_and_buffer() {
        let (mut a, mut b) = pair();
        let msg = ControlMessageBuilder {
            spare_fields: &[1, 2, 3],
            spare_buffer1: b"alice",
            ..ControlMessageBuilder::new(MessageType::UsersListRequest, 0)
        }
        .build()
        .unwrap();
        a.send_control_message_secure(&msg).unwrap();
        assert_eq!(b.receive_control_message_secure().unwrap(), msg);

        let buf = vec![4; 3000];
        a.send_buffer_secure(&buf).unwrap();
        assert_eq!(b.receive_buffer_secure().unwrap(), buf);
    }

    #[test]
    fn buffer_length_mismatch() {
        let (mut a, mut b) = pipe();
        let hdr = ControlMessageBuilder::new(MessageType::BufHeader, 10)
            .build()
            .unwrap();
        send_control_message(&mut a, &hdr).unwrap();
        a.send_message(&[0; 3]).unwrap();
        assert!(matches!(
            receive_buffer(&mut b),
            Err(Error::Decoding { field: "buffer length" })
        ));
    }

    #[test]
    fn file_transfer() {
        let src = tempfile::tempdir().unwrap();
        let dst = tempfile::tempdir().unwrap();
        let content: Vec<u8> = (0..PACKET_DATA_SIZE * 2 + 10).map(|i| i as u8).collect();
        let path = src.path().join("notes.txt");
        fs::write(&path, &content).unwrap();

        let (mut a, mut b) = pair();
        assert_eq!(
            a.send_file_secure(&path, "bob").unwrap(),
            content.len() as u64
        );
        let received = b.receive_file_secure(dst.path()).unwrap();
        assert_eq!(received.user, "bob");
        assert_eq!(received.path, dst.path().join("notes.txt"));
        assert_eq!(fs::read(&received.path).unwrap(), content);
    }

    #[test]
    fn empty_file() {
        let src = tempfile::tempdir().unwrap();
        let dst = tempfile::tempdir().unwrap();
        let path = src.path().join("empty");
        fs::write(&path, b"").unwrap();

        let (mut a, mut b) = pipe();
        send_file(&mut a, &path, "bob").unwrap();
        let received = receive_file(&mut b, dst.path()).unwrap();
        assert_eq!(received.len, 0);
        assert!(fs::read(&received.path).unwrap().is_empty());
    }

    #[test]
    fn announced_name_cannot_escape() {
        let dst = tempfile::tempdir().unwrap();
        let (mut a, mut b) = pipe();
        let hdr = ControlMessageBuilder {
            spare_buffer2: b"../../etc/evil",
            ..ControlMessageBuilder::new(MessageType::FileHeader, 2)
        }
        .build()
        .unwrap();
        send_control_message(&mut a, &hdr).unwrap();
        a.send_message(b"hi").unwrap();
        let received = receive_file(&mut b, dst.path()).unwrap();
        assert_eq!(received.path, dst.path().join("evil"));
    }

    #[test]
    fn close_secure_sends_shutdown() {
        let (mut a, mut b) = pair();
        a.close_secure().unwrap();
        let msg = b.receive_control_message_secure().unwrap();
        assert_eq!(msg.msg_type().unwrap(), MessageType::Shutdown);
    }
}
