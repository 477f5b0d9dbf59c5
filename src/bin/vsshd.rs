use std::{env, fs, path::Path, process, sync::Arc};

use tracing::{error, info, warn};
use vssh::{
    config::Config,
    protocol::ctl_message::MessageType,
    secure::{receive_file_body, SecureSession},
    transport::{self, Connection},
};

const PASSWD: &str = "/etc/passwd";
const NO_SHELL: &[u8] = b"interactive shells are not available on this server";

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let config = match env::args().nth(1) {
        Some(path) => Config::load(Path::new(&path)),
        None => Ok(Config::default()),
    };
    let config = match config {
        Ok(x) => Arc::new(x),
        Err(e) => {
            error!(%e, "cannot load configuration");
            process::exit(1);
        }
    };
    if let Err(e) = fs::create_dir_all(&config.upload_dir) {
        error!(%e, dir = %config.upload_dir.display(), "cannot create upload directory");
        process::exit(1);
    }

    info!(addr = %config.listen, kind = ?config.transport, "vsshd starting");
    let session_config = Arc::clone(&config);
    let res = transport::bind(
        config.transport,
        config.listen,
        config.arq.clone(),
        move |conn| serve(conn, &session_config),
    );
    if let Err(e) = res {
        error!(%e, "listener failed");
        process::exit(1);
    }
}

fn serve(conn: Connection, config: &Config) {
    let peer = conn.peer_addr();
    let mut session = match SecureSession::establish(conn, true, &config.signing_key) {
        Ok(x) => x,
        Err(e) => {
            error!(?peer, %e, "session rejected");
            return;
        }
    };
    match dispatch(&mut session, config) {
        Ok(()) => info!(?peer, "session finished"),
        Err(e) => warn!(?peer, %e, "session ended with error"),
    }
}

fn dispatch(session: &mut SecureSession<Connection>, config: &Config) -> vssh::Result<()> {
    loop {
        let msg = session.receive_control_message_secure()?;
        match msg.msg_type() {
            Ok(MessageType::MsgHeader) => {
                let body = session.secure_receive()?;
                info!(len = body.len(), text = %String::from_utf8_lossy(&body), "message");
            }
            Ok(MessageType::FileHeader) => {
                let file = receive_file_body(session, &msg, &config.upload_dir)?;
                info!(user = %file.user, path = %file.path.display(), len = file.len, "file received");
            }
            Ok(MessageType::UsersListRequest) => {
                let passwd = fs::read_to_string(PASSWD)?;
                let users = login_users(&passwd).join("\n");
                session.send_buffer_secure(users.as_bytes())?;
            }
            Ok(MessageType::ShellRequest) => session.send_buffer_secure(NO_SHELL)?,
            Ok(MessageType::Shutdown) => return Ok(()),
            Ok(other) => warn!(?other, "unexpected control message"),
            Err(e) => warn!(%e, "unknown control message"),
        }
    }
}

/// Accounts in passwd format that have a login shell.
fn login_users(passwd: &str) -> Vec<String> {
    passwd
        .lines()
        .filter(|line| !line.trim_start().starts_with('#'))
        .filter_map(|line| {
            let fields: Vec<&str> = line.split(':').collect();
            if fields.len() < 7 || fields[0].is_empty() {
                return None;
            }
            let shell = fields[6].trim();
            if shell.is_empty() || shell.ends_with("nologin") || shell.ends_with("false") {
                return None;
            }
            Some(fields[0].to_string())
        })
        .collect()
}
