use std::{
    fs,
    net::SocketAddr,
    path::{Path, PathBuf},
    time::Duration,
};

use serde::Deserialize;
use tracing::info;

use crate::{
    arq::{ArqConfig, ArqConfigBuilder},
    error::{Error, Result},
    transport::TransportKind,
};

pub const DEFAULT_PORT: u16 = 16161;

/// Runtime configuration shared by `vsshd` and `vssh`.
#[derive(Clone, Debug)]
pub struct Config {
    /// Where `vsshd` listens.
    pub listen: SocketAddr,
    /// Where `vssh` connects.
    pub server: SocketAddr,
    pub transport: TransportKind,
    /// Hex Ed25519 seed of the server.
    pub signing_key: PathBuf,
    /// Hex Ed25519 public key of the server, used by clients.
    pub verifying_key: PathBuf,
    pub upload_dir: PathBuf,
    /// Announced as the owner of uploaded files.
    pub user: String,
    pub arq: ArqConfig,
}

impl Config {
    /// Missing fields keep their defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("failed to read {}: {}", path.display(), e)))?;
        let config = Self::from_toml(&contents).map_err(|e| match e {
            Error::Config(msg) => Error::Config(format!("{}: {}", path.display(), msg)),
            other => other,
        })?;
        info!(path = %path.display(), "loaded configuration");
        Ok(config)
    }

    pub fn from_toml(contents: &str) -> Result<Self> {
        let raw: RawConfig =
            toml::from_str(contents).map_err(|e| Error::Config(e.to_string()))?;
        let mut config = Self::default();

        if let Some(x) = raw.listen {
            config.listen = x;
        }
        if let Some(x) = raw.server {
            config.server = x;
        }
        if let Some(x) = raw.transport {
            config.transport = x;
        }
        if let Some(x) = raw.signing_key {
            config.signing_key = x;
        }
        if let Some(x) = raw.verifying_key {
            config.verifying_key = x;
        }
        if let Some(x) = raw.upload_dir {
            config.upload_dir = x;
        }
        if let Some(x) = raw.user {
            config.user = x;
        }
        if let Some(arq) = raw.arq {
            let mut builder = ArqConfigBuilder::default();
            if let Some(ms) = arq.recv_timeout_ms {
                builder.recv_timeout = Some(Duration::from_millis(ms));
            }
            if let Some(ms) = arq.reassembly_timeout_ms {
                builder.reassembly_timeout = Duration::from_millis(ms);
            }
            if let Some(ms) = arq.ack_timeout_ms {
                builder.ack_timeout = Duration::from_millis(ms);
            }
            if let Some(n) = arq.ack_retries {
                builder.ack_retries = n;
            }
            if let Some(ms) = arq.handshake_timeout_ms {
                builder.handshake_timeout = Duration::from_millis(ms);
            }
            if let Some(n) = arq.handshake_retries {
                builder.handshake_retries = n;
            }
            config.arq = builder
                .build()
                .map_err(|e| Error::Config(format!("[arq]: {:?}", e)))?;
        }
        Ok(config)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([0, 0, 0, 0], DEFAULT_PORT)),
            server: SocketAddr::from(([127, 0, 0, 1], DEFAULT_PORT)),
            transport: TransportKind::Arq,
            signing_key: PathBuf::from("vsshd.key"),
            verifying_key: PathBuf::from("vsshd.pub"),
            upload_dir: PathBuf::from("uploads"),
            user: String::from("anonymous"),
            arq: ArqConfig::default(),
        }
    }
}

#[derive(Debug, Deserialize, Default)]
#[serde(default, deny_unknown_fields)]
struct RawConfig {
    listen: Option<SocketAddr>,
    server: Option<SocketAddr>,
    transport: Option<TransportKind>,
    signing_key: Option<PathBuf>,
    verifying_key: Option<PathBuf>,
    upload_dir: Option<PathBuf>,
    user: Option<String>,
    arq: Option<RawArqConfig>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default, deny_unknown_fields)]
struct RawArqConfig {
    recv_timeout_ms: Option<u64>,
    reassembly_timeout_ms: Option<u64>,
    ack_timeout_ms: Option<u64>,
    ack_retries: Option<u32>,
    handshake_timeout_ms: Option<u64>,
    handshake_retries: Option<u32>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_is_default() {
        let config = Config::from_toml("").unwrap();
        assert_eq!(config.listen.port(), DEFAULT_PORT);
        assert_eq!(config.transport, TransportKind::Arq);
        assert_eq!(config.arq.ack_retries, 0);
    }

    #[test]
    fn overrides() {
        let config = Config::from_toml(
            r#"
            listen = "127.0.0.1:2222"
            transport = "stream"
            upload_dir = "/tmp/up"

            [arq]
            ack_timeout_ms = 250
            ack_retries = 2
            "#,
        )
        .unwrap();
        assert_eq!(config.listen, "127.0.0.1:2222".parse().unwrap());
        assert_eq!(config.transport, TransportKind::Stream);
        assert_eq!(config.upload_dir, PathBuf::from("/tmp/up"));
        assert_eq!(config.arq.ack_timeout, Duration::from_millis(250));
        assert_eq!(config.arq.ack_retries, 2);
        assert_eq!(config.arq.handshake_retries, 3);
    }

    #[test]
    fn rejects_bad_values() {
        assert!(matches!(
            Config::from_toml("transport = \"carrier-pigeon\""),
            Err(Error::Config(_))
        ));
        assert!(matches!(
            Config::from_toml("[arq]\nack_timeout_ms = 0"),
            Err(Error::Config(_))
        ));
        assert!(matches!(
            Config::from_toml("lsiten = \"127.0.0.1:1\""),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vssh.toml");
        fs::write(&path, "user = \"carol\"\n").unwrap();
        assert_eq!(Config::load(&path).unwrap().user, "carol");
        assert!(Config::load(&dir.path().join("missing.toml")).is_err());
    }
}
