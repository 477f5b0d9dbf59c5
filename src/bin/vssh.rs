use std::{
    env,
    path::{Path, PathBuf},
    process,
    time::Duration,
};

use tracing::error;
use vssh::{
    arq,
    config::Config,
    protocol::ctl_message::{ControlMessageBuilder, MessageType},
    secure::{write_key_pair, SecureSession},
    transport::Connection,
    Error, Result,
};

const DISCOVER_TIMEOUT: Duration = Duration::from_secs(2);
const USAGE: &str = "usage: vssh <config.toml> <discover | message TEXT | file PATH | users | shell | keygen DIR>";

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::WARN.into()),
        )
        .init();

    let args: Vec<String> = env::args().skip(1).collect();
    if args.len() < 2 {
        eprintln!("{}", USAGE);
        process::exit(2);
    }
    if let Err(e) = run(&args) {
        error!(%e, "vssh failed");
        process::exit(1);
    }
}

fn run(args: &[String]) -> Result<()> {
    let config = Config::load(Path::new(&args[0]))?;
    let arg = args.get(2).map(String::as_str);

    match (args[1].as_str(), arg) {
        ("keygen", Some(dir)) => {
            let dir = PathBuf::from(dir);
            let key = write_key_pair(&dir.join("vsshd.key"), &dir.join("vsshd.pub"))?;
            println!("{}", hex::encode(key.to_bytes()));
            Ok(())
        }
        ("discover", None) => {
            let from = arq::discover(config.server, DISCOVER_TIMEOUT)?;
            println!("{} is alive", from);
            Ok(())
        }
        ("message", Some(text)) => with_session(&config, |session| {
            let hdr = ControlMessageBuilder::new(MessageType::MsgHeader, text.len() as u64).build()?;
            session.send_control_message_secure(&hdr)?;
            session.secure_send(text.as_bytes())
        }),
        ("file", Some(path)) => with_session(&config, |session| {
            let len = session.send_file_secure(Path::new(path), &config.user)?;
            println!("{} bytes sent", len);
            Ok(())
        }),
        ("users", None) => with_session(&config, |session| {
            request_buffer(session, MessageType::UsersListRequest)
        }),
        ("shell", None) => with_session(&config, |session| {
            request_buffer(session, MessageType::ShellRequest)
        }),
        _ => Err(Error::InvalidInput(USAGE)),
    }
}

fn with_session<F>(config: &Config, f: F) -> Result<()>
where
    F: FnOnce(&mut SecureSession<Connection>) -> Result<()>,
{
    let conn = Connection::connect(config.transport, config.server, &config.arq)?;
    let mut session = SecureSession::establish(conn, false, &config.verifying_key)?;
    let res = f(&mut session);
    session.close_secure()?;
    res
}

fn request_buffer(session: &mut SecureSession<Connection>, ty: MessageType) -> Result<()> {
    let request = ControlMessageBuilder::new(ty, 0).build()?;
    session.send_control_message_secure(&request)?;
    let reply = session.receive_buffer_secure()?;
    println!("{}", String::from_utf8_lossy(&reply));
    Ok(())
}
