//! Authenticated X25519 key exchange.
//!
//! ```text
//! initiator                                   responder
//!   ENCRYPTION_PG_NUM  { group, nonce_i }   ->
//!                                           <-  ENCRYPTION_PUBKEY { pub_r, nonce_r }
//!   ENCRYPTION_PUBKEY  { pub_i, sig }       ->
//!                                           <-  sealed confirmation | SHUTDOWN
//! ```
//!
//! `sig` is the initiator's Ed25519 signature over both nonces and both
//! public keys. The responder knows the initiator's verifying key.

use std::{fs, io::Write, path::Path};

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey, SIGNATURE_LENGTH};
use rand::{rngs::OsRng, RngCore};
use tracing::{debug, error, info};
use x25519_dalek::{EphemeralSecret, PublicKey};
use zeroize::Zeroize;

use crate::{
    error::{Error, Result},
    protocol::ctl_message::{ControlMessage, ControlMessageBuilder, MessageType},
    transport::Transport,
};

use super::{
    channel::{receive_control_message, send_control_message},
    cipher::{SessionSecret, KEX_NONCE_LEN},
};

pub const GROUP_X25519: u32 = 1;
pub const KEY_LEN: usize = 32;
const TRANSCRIPT_LABEL: &[u8] = b"vssh kex v1";
const CONFIRMATION: &[u8] = b"vssh key confirmation";
#[cfg(unix)]
const SECRET_FILE_MODE: u32 = 0o600;

/// Derives the session secret with the peer on the other end of `transport`.
///
/// The initiator signs with the key stored at `key_path`; the responder
/// verifies with the public key stored there. Any failure is fatal to the
/// session.
pub fn execute_key_exchange<T: Transport + ?Sized>(
    transport: &mut T,
    is_initiator: bool,
    key_path: &Path,
) -> Result<SessionSecret> {
    debug!(kind = ?transport.kind(), is_initiator, "key exchange started");
    let res = if is_initiator {
        let key = load_signing_key(key_path)?;
        initiate(transport, &key)
    } else {
        let key = load_verifying_key(key_path)?;
        respond(transport, &key)
    };
    match &res {
        Ok(_) => info!(kind = ?transport.kind(), "key exchange completed"),
        Err(e) => error!(%e, "key exchange failed"),
    }
    res
}

fn initiate<T: Transport + ?Sized>(t: &mut T, key: &SigningKey) -> Result<SessionSecret> {
    let nonce_i = random_nonce();
    let hello = ControlMessageBuilder {
        spare_fields: &[GROUP_X25519],
        spare_buffer1: &nonce_i,
        ..ControlMessageBuilder::new(MessageType::EncryptionPgNum, 0)
    }
    .build()?;
    send_control_message(t, &hello)?;

    let reply = expect(t, MessageType::EncryptionPubkey)?;
    let pub_r = PublicKey::from(read_array::<KEY_LEN>(reply.spare_buffer1()));
    let nonce_r = read_array::<KEX_NONCE_LEN>(reply.spare_buffer2());

    let secret = EphemeralSecret::random_from_rng(OsRng);
    let pub_i = PublicKey::from(&secret);
    let sig = key.sign(&transcript(&nonce_i, &nonce_r, &pub_i, &pub_r));
    let msg = ControlMessageBuilder {
        spare_buffer1: pub_i.as_bytes(),
        spare_buffer2: &sig.to_bytes(),
        ..ControlMessageBuilder::new(MessageType::EncryptionPubkey, 0)
    }
    .build()?;
    send_control_message(t, &msg)?;

    let shared = secret.diffie_hellman(&pub_r);
    if !shared.was_contributory() {
        return Err(Error::AuthenticationFailure("non-contributory public key".into()));
    }
    let session = SessionSecret::derive(shared.as_bytes(), &nonce_i, &nonce_r)?;

    let confirmation = t.receive_message()?;
    match session.open(&confirmation) {
        Ok(x) if x == CONFIRMATION => Ok(session),
        _ => Err(Error::AuthenticationFailure("peer rejected the key exchange".into())),
    }
}

fn respond<T: Transport + ?Sized>(t: &mut T, key: &VerifyingKey) -> Result<SessionSecret> {
    let hello = expect(t, MessageType::EncryptionPgNum)?;
    if hello.spare_fields()[0] != GROUP_X25519 {
        return Err(Error::AuthenticationFailure(format!(
            "unsupported group {}",
            hello.spare_fields()[0]
        )));
    }
    let nonce_i = read_array::<KEX_NONCE_LEN>(hello.spare_buffer1());

    let nonce_r = random_nonce();
    let secret = EphemeralSecret::random_from_rng(OsRng);
    let pub_r = PublicKey::from(&secret);
    let reply = ControlMessageBuilder {
        spare_buffer1: pub_r.as_bytes(),
        spare_buffer2: &nonce_r,
        ..ControlMessageBuilder::new(MessageType::EncryptionPubkey, 0)
    }
    .build()?;
    send_control_message(t, &reply)?;

    let msg = expect(t, MessageType::EncryptionPubkey)?;
    let pub_i = PublicKey::from(read_array::<KEY_LEN>(msg.spare_buffer1()));
    let sig = Signature::from_bytes(&read_array::<SIGNATURE_LENGTH>(msg.spare_buffer2()));
    let verified = key.verify(&transcript(&nonce_i, &nonce_r, &pub_i, &pub_r), &sig);

    let shared = secret.diffie_hellman(&pub_i);
    if verified.is_err() || !shared.was_contributory() {
        let bye = ControlMessageBuilder::new(MessageType::Shutdown, 0).build()?;
        send_control_message(t, &bye)?;
        return Err(Error::AuthenticationFailure(
            "signature over the key exchange does not verify".into(),
        ));
    }
    let session = SessionSecret::derive(shared.as_bytes(), &nonce_i, &nonce_r)?;
    t.send_message(&session.seal(CONFIRMATION)?)?;
    Ok(session)
}

fn expect<T: Transport + ?Sized>(t: &mut T, ty: MessageType) -> Result<ControlMessage> {
    let msg = receive_control_message(t)?;
    match msg.msg_type() {
        Ok(x) if x == ty => Ok(msg),
        Ok(MessageType::Shutdown) => Err(Error::AuthenticationFailure(
            "peer aborted the key exchange".into(),
        )),
        _ => Err(Error::AuthenticationFailure(format!(
            "expected {:?}, got type {}",
            ty,
            msg.raw_type()
        ))),
    }
}

fn transcript(
    nonce_i: &[u8; KEX_NONCE_LEN],
    nonce_r: &[u8; KEX_NONCE_LEN],
    pub_i: &PublicKey,
    pub_r: &PublicKey,
) -> Vec<u8> {
    let mut buf = Vec::with_capacity(TRANSCRIPT_LABEL.len() + KEX_NONCE_LEN * 2 + KEY_LEN * 2);
    buf.extend_from_slice(TRANSCRIPT_LABEL);
    buf.extend_from_slice(nonce_i);
    buf.extend_from_slice(nonce_r);
    buf.extend_from_slice(pub_i.as_bytes());
    buf.extend_from_slice(pub_r.as_bytes());
    buf
}

fn random_nonce() -> [u8; KEX_NONCE_LEN] {
    let mut nonce = [0; KEX_NONCE_LEN];
    OsRng.fill_bytes(&mut nonce);
    nonce
}

/// Spare buffers are always longer than any key, nonce or signature.
fn read_array<const N: usize>(buf: &[u8]) -> [u8; N] {
    let mut out = [0; N];
    out.copy_from_slice(&buf[..N]);
    out
}

fn read_key_file(path: &Path) -> Result<[u8; KEY_LEN]> {
    let text = fs::read_to_string(path)
        .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))?;
    let bytes = hex::decode(text.trim())
        .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))?;
    bytes
        .try_into()
        .map_err(|_e| Error::Config(format!("{}: expected {} bytes", path.display(), KEY_LEN)))
}

/// Reads a hex-encoded Ed25519 seed.
pub fn load_signing_key(path: &Path) -> Result<SigningKey> {
    Ok(SigningKey::from_bytes(&read_key_file(path)?))
}

/// Reads a hex-encoded Ed25519 public key.
pub fn load_verifying_key(path: &Path) -> Result<VerifyingKey> {
    VerifyingKey::from_bytes(&read_key_file(path)?)
        .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))
}

/// Generates a key pair and writes both halves as hex.
pub fn write_key_pair(signing_path: &Path, verifying_path: &Path) -> Result<VerifyingKey> {
    let mut seed = [0; KEY_LEN];
    OsRng.fill_bytes(&mut seed);
    let key = SigningKey::from_bytes(&seed);
    seed.zeroize();
    write_secret(signing_path, hex::encode(key.to_bytes()).as_bytes())?;
    fs::write(verifying_path, hex::encode(key.verifying_key().to_bytes()))?;
    Ok(key.verifying_key())
}

/// Writes `contents` readable by the owner only, also when `path` exists.
#[cfg(unix)]
fn write_secret(path: &Path, contents: &[u8]) -> Result<()> {
    use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};

    let mut file = fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(SECRET_FILE_MODE)
        .open(path)?;
    file.set_permissions(fs::Permissions::from_mode(SECRET_FILE_MODE))?;
    file.write_all(contents)?;
    Ok(())
}

#[cfg(not(unix))]
fn write_secret(path: &Path, contents: &[u8]) -> Result<()> {
    fs::write(path, contents)?;
    Ok(())
}
