//! Background workflows
//!
//! Sequences the request/response operations of a session: login, the
//! bulk roster fetch, starting the poll loop and sending with error
//! reporting. Each workflow runs off the calling thread and reports
//! through signals.

use std::sync::Arc;
use std::thread::JoinHandle;

use tracing::{debug, info, warn};

use crate::error::{ClientError, LoginError, ProgrammingError, ResultCode, RETCODE_SEND_TOO_FAST};
use crate::event::{AsyncEvent, AsyncEventSet};
use crate::info::{fetch_detail, fetch_friends, fetch_group_names, fetch_online_buddies, lookup_account, Contact};
use crate::poll::PollSession;
use crate::send::{send_message, OutgoingMessage};
use crate::session::{Authenticator, Session};
use crate::signal::Signal;

/// Log in on a worker and publish the outcome
///
/// LoginComplete on success (credentials are stored on the session),
/// VerifyRequired when a verification image must be answered, LoginFailed
/// otherwise.
pub fn background_login(session: &Arc<Session>, authenticator: Arc<dyn Authenticator>) -> AsyncEvent {
    let event = AsyncEvent::for_session(session.id());
    let completer = event.clone();
    let owner = Arc::clone(session);

    session.http().workers().spawn_blocking(move || {
        let result = match authenticator.login() {
            Ok(credentials) => {
                info!("session {} logged in as {}", owner.id(), credentials.uin);
                owner.set_credentials(credentials);
                owner.publish(Signal::LoginComplete);
                ResultCode::Success
            }
            Err(LoginError::NeedVerification) => {
                info!("session {} needs verification", owner.id());
                owner.publish(Signal::VerifyRequired);
                ResultCode::Protocol
            }
            Err(e) => {
                warn!("session {} login failed: {}", owner.id(), e);
                let code = match &e {
                    LoginError::Network(err) => err.into(),
                    _ => ResultCode::Protocol,
                };
                owner.publish(Signal::LoginFailed {
                    reason: e.to_string(),
                });
                code
            }
        };
        let _ = completer.complete(result, None);
    });
    event
}

/// Fetch the whole roster on a dedicated thread
///
/// See [`fetch_basic_info`] for the sequence.
pub fn background_friends_info(session: &Arc<Session>) -> Result<JoinHandle<()>, ClientError> {
    let owner = Arc::clone(session);
    let handle = std::thread::Builder::new()
        .name("webim-info".to_string())
        .spawn(move || {
            if let Err(e) = fetch_basic_info(&owner) {
                warn!("basic info fetch aborted: {}", e);
            }
        })?;
    Ok(handle)
}

/// Friends and group names, then online presence, then our own detail,
/// then one account lookup per buddy and group
///
/// Blocks until the first three waves are done. The lookups are left in
/// flight; BasicInfoReady is published once all of them have landed,
/// whether they succeeded or not. Returns the lookup set.
pub fn fetch_basic_info(session: &Arc<Session>) -> Result<AsyncEventSet, ProgrammingError> {
    let lists = AsyncEventSet::new();
    lists.add(&fetch_friends(session))?;
    lists.add(&fetch_group_names(session))?;
    lists.wait()?;

    let presence = AsyncEventSet::new();
    presence.add(&fetch_online_buddies(session))?;
    presence.wait()?;

    let me = session.credentials().uin;
    if let Err(e) = fetch_detail(session, &me) {
        warn!("detail fetch for {} failed: {}", me, e);
    }

    let (buddies, groups): (Vec<String>, Vec<String>) = {
        let roster = session.roster();
        (
            roster.buddies.iter().map(|b| b.uin.clone()).collect(),
            roster.groups.iter().map(|g| g.code.clone()).collect(),
        )
    };
    debug!(
        "looking up accounts of {} buddies and {} groups",
        buddies.len(),
        groups.len()
    );

    let lookups = AsyncEventSet::new();
    for uin in buddies {
        lookups.add(&lookup_account(session, Contact::Buddy(uin)))?;
    }
    for code in groups {
        lookups.add(&lookup_account(session, Contact::Group(code)))?;
    }

    let owner = Arc::clone(session);
    lookups.add_listener(move || {
        info!("session {} basic info ready", owner.id());
        owner.publish(Signal::BasicInfoReady);
    });
    Ok(lookups)
}

/// Start the poll loop on its own thread
pub fn background_msg_poll(session: &Arc<Session>) -> Result<(Arc<PollSession>, JoinHandle<()>), ClientError> {
    let poller = PollSession::new(Arc::clone(session));
    let handle = poller.start()?;
    Ok((poller, handle))
}

/// Stop a poll loop started by [`background_msg_poll`]
pub fn background_msg_drain(poller: &PollSession) {
    poller.stop();
}

/// Send a message and report failures
///
/// Publishes SendFailed for any failure (noting when the server says we
/// are sending too fast) and reports the connection as lost when the
/// server invalidated the session.
pub fn background_send(session: &Arc<Session>, message: OutgoingMessage) -> AsyncEvent {
    let to = message.to.clone();
    let text = message.content.plain_text();
    let event = send_message(session, message);

    let owner = Arc::clone(session);
    event.add_listener(move |event, _| {
        let Some(code) = event.result() else {
            return;
        };
        if code.is_success() {
            return;
        }
        let text = if code == ResultCode::Server(RETCODE_SEND_TOO_FAST) {
            format!("sending too fast:\n{}", text)
        } else {
            format!("send failed:\n{}", text)
        };
        owner.publish(Signal::SendFailed { to, code, text });
        if code == ResultCode::SessionInvalidated {
            owner.report_connection_lost();
        }
    });
    event
}
