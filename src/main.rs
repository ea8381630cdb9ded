//! Long-poll IM Client - Entry Point
//!
//! Resumes a session from credentials in the environment, loads the
//! roster and logs everything the poll loop delivers until the server
//! drops the session.

use std::env;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use webim_client::{
    background_friends_info, background_msg_drain, background_msg_poll, ClientConfig, ClientId,
    Credentials, Envelope, ReqwestTransport, Session, Signal, SignalBus, SignalKind,
};

/// How often the delivered envelope queue is drained
const DRAIN_INTERVAL: Duration = Duration::from_millis(200);

fn credentials_from_env() -> Result<Credentials, Box<dyn std::error::Error>> {
    let var = |key: &str| env::var(key).map_err(|_| format!("{} is not set", key));
    // The service lets the client pick its connection id
    let client_id = match env::var("WEBIM_CLIENTID") {
        Ok(id) if !id.is_empty() => ClientId::from_string(id),
        _ => ClientId::generate(),
    };
    Ok(Credentials {
        client_id,
        psessionid: var("WEBIM_PSESSIONID")?,
        vfwebqq: var("WEBIM_VFWEBQQ")?,
        uin: var("WEBIM_UIN")?,
    })
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Use RUST_LOG env var to control log level
    // e.g., RUST_LOG=debug or RUST_LOG=webim_client=trace
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("webim_client=info")),
        )
        .init();

    // Config file from the command line or WEBIM_CONFIG
    let config_path = env::args()
        .nth(1)
        .or_else(|| env::var("WEBIM_CONFIG").ok())
        .map(PathBuf::from);
    let config = match config_path {
        Some(path) => {
            info!("loading config from {}", path.display());
            ClientConfig::from_file(&path)?
        }
        None => ClientConfig::default(),
    }
    .with_env_overrides();

    let credentials = credentials_from_env()?;
    let transport = Arc::new(ReqwestTransport::new(config.request_timeout())?);
    let session = Session::new(config, transport, SignalBus::global(), credentials)?;
    info!("session {} resumed", session.id());

    let lost = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&lost);
    session.subscribe(SignalKind::ConnectionLost, move |_| {
        flag.store(true, Ordering::SeqCst);
    });
    session.subscribe(SignalKind::BasicInfoReady, |_| info!("roster loaded"));
    session.subscribe(SignalKind::FriendArrived, |signal| {
        if let Signal::FriendArrived(buddy) = signal {
            info!("buddy {} ({})", buddy.display_name(), buddy.uin);
        }
    });
    session.subscribe(SignalKind::SendFailed, |signal| {
        if let Signal::SendFailed { to, text, .. } = signal {
            warn!("message to {} not sent: {}", to, text);
        }
    });

    background_friends_info(&session)?;
    let (poller, handle) = background_msg_poll(&session)?;

    while !lost.load(Ordering::SeqCst) {
        for envelope in poller.drain() {
            match envelope.as_ref() {
                Envelope::Chat(msg) => {
                    info!("[{:?}] {}: {}", msg.kind, msg.from, msg.content.plain_text())
                }
                other => info!("{:?}", other),
            }
        }
        std::thread::sleep(DRAIN_INTERVAL);
    }

    background_msg_drain(&poller);
    if handle.join().is_err() {
        warn!("poll thread panicked");
    }
    info!("connection lost, exiting");
    Ok(())
}
