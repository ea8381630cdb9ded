//! Roster and profile fetches
//!
//! Each operation issues one request and returns an [`AsyncEvent`] that is
//! completed on a worker once the response has been applied to the
//! session's roster. [`fetch_detail`] is the one blocking call.

use std::path::PathBuf;
use std::sync::Arc;

use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::error::{ClientError, ProtocolError, ResultCode, TransportError};
use crate::event::{AsyncEvent, Payload};
use crate::json;
use crate::roster::{Buddy, Category, Group, Roster};
use crate::session::Session;
use crate::signal::Signal;
use crate::transport::{form_encode, with_query, HttpRequest, HttpResponse};

/// Target of an account or avatar request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Contact {
    /// Buddy by uin
    Buddy(String),
    /// Group by code
    Group(String),
}

impl Contact {
    fn id(&self) -> &str {
        match self {
            Contact::Buddy(uin) => uin,
            Contact::Group(code) => code,
        }
    }
}

/// Map a detail `stat` code to a status word
pub fn status_from_stat(stat: &str) -> Option<&'static str> {
    match stat {
        "10" => Some("online"),
        "20" => Some("offline"),
        "30" => Some("busy"),
        "50" => Some("away"),
        _ => None,
    }
}

fn api_referer(session: &Session) -> String {
    format!("{}/proxy.html?v=20101025002", session.config().api_host)
}

fn channel_referer(session: &Session) -> String {
    format!("{}/proxy.html?v=20101025002", session.config().channel_host)
}

/// The `result` member of a successful response
fn parse_result(outcome: Result<HttpResponse, TransportError>) -> Result<Value, ClientError> {
    let response = outcome?.require_ok()?;
    let mut tree = json::parse(&response.text())?;
    let code = json::retcode(&tree);
    if code != 0 {
        return Err(ClientError::from_retcode(code));
    }
    match tree.get_mut("result") {
        Some(result) => Ok(result.take()),
        None => Err(ProtocolError::MissingField("result").into()),
    }
}

fn finish(op: &str, outcome: Result<(), ClientError>) -> (ResultCode, Option<Payload>) {
    match outcome {
        Ok(()) => (ResultCode::Success, None),
        Err(e) => {
            warn!("{} failed: {}", op, e);
            ((&e).into(), None)
        }
    }
}

fn items<'a>(result: &'a Value, key: &str) -> &'a [Value] {
    result
        .get(key)
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or(&[])
}

/// Fetch the buddy list with categories and marknames
pub fn fetch_friends(session: &Arc<Session>) -> AsyncEvent {
    let creds = session.credentials();
    let r = json!({"h": "hello", "vfwebqq": creds.vfwebqq}).to_string();
    let request = HttpRequest::post_form(
        format!("{}/api/get_user_friends2", session.config().api_host),
        form_encode(&[("r", r.as_str())]),
    )
    .header("Referer", api_referer(session));

    let owner = Arc::clone(session);
    session
        .http()
        .request_async(session.id(), request, move |outcome| {
            finish(
                "friend list fetch",
                parse_result(outcome).and_then(|result| {
                    let mut roster = owner.roster();
                    apply_friends(&mut roster, &result)?;
                    info!("roster has {} buddies", roster.buddies.len());
                    Ok(())
                }),
            )
        })
}

fn apply_friends(roster: &mut Roster, result: &Value) -> Result<(), ProtocolError> {
    let info = result
        .get("info")
        .and_then(Value::as_array)
        .ok_or(ProtocolError::MissingField("info"))?;

    let categories = items(result, "categories")
        .iter()
        .map(|c| Category {
            index: json::int_field(c, "index").unwrap_or(0),
            sort: json::int_field(c, "sort").unwrap_or(0),
            name: json::field(c, "name").unwrap_or_default(),
            count: 0,
        })
        .collect();
    roster.set_categories(categories);

    for entry in info {
        let Some(uin) = json::field(entry, "uin") else {
            debug!("skipping friend info without uin");
            continue;
        };
        let buddy = roster.buddy_entry(&uin);
        buddy.nick = json::field(entry, "nick");
        buddy.face = json::field(entry, "face");
    }
    for entry in items(result, "marknames") {
        if let (Some(uin), Some(markname)) = (json::field(entry, "uin"), json::field(entry, "markname")) {
            if let Some(buddy) = roster.find_buddy_mut(&uin) {
                buddy.markname = Some(markname);
            }
        }
    }
    for entry in items(result, "friends") {
        if let Some(uin) = json::field(entry, "uin") {
            roster.buddy_entry(&uin).category = json::field(entry, "categories");
        }
    }
    roster.recount_categories();
    Ok(())
}

/// Fetch the list of joined groups
pub fn fetch_group_names(session: &Arc<Session>) -> AsyncEvent {
    let creds = session.credentials();
    let r = json!({"vfwebqq": creds.vfwebqq}).to_string();
    let request = HttpRequest::post_form(
        format!("{}/api/get_group_name_list_mask2", session.config().api_host),
        form_encode(&[("r", r.as_str())]),
    )
    .header("Referer", api_referer(session));

    let owner = Arc::clone(session);
    session
        .http()
        .request_async(session.id(), request, move |outcome| {
            finish(
                "group list fetch",
                parse_result(outcome).and_then(|result| {
                    let mut roster = owner.roster();
                    apply_group_names(&mut roster, &result)?;
                    info!("roster has {} groups", roster.groups.len());
                    Ok(())
                }),
            )
        })
}

fn apply_group_names(roster: &mut Roster, result: &Value) -> Result<(), ProtocolError> {
    let names = result
        .get("gnamelist")
        .and_then(Value::as_array)
        .ok_or(ProtocolError::MissingField("gnamelist"))?;

    for entry in names {
        let (Some(gid), Some(code)) = (json::field(entry, "gid"), json::field(entry, "code")) else {
            debug!("skipping group without gid or code");
            continue;
        };
        let group = roster.group_entry(&gid);
        group.code = code;
        group.name = json::field(entry, "name");
        group.flag = json::field(entry, "flag");
    }
    for entry in items(result, "gmarklist") {
        if let (Some(gid), Some(markname)) = (json::field(entry, "uin"), json::field(entry, "markname")) {
            if let Some(group) = roster.find_group_by_gid_mut(&gid) {
                group.markname = Some(markname);
            }
        }
    }
    Ok(())
}

/// Fetch presence of online buddies
pub fn fetch_online_buddies(session: &Arc<Session>) -> AsyncEvent {
    let creds = session.credentials();
    let url = with_query(
        &format!("{}/channel/get_online_buddies2", session.config().channel_host),
        &[
            ("clientid", creds.client_id.as_str()),
            ("psessionid", creds.psessionid.as_str()),
        ],
    );
    let request = HttpRequest::get(url).header("Referer", channel_referer(session));

    let owner = Arc::clone(session);
    session
        .http()
        .request_async(session.id(), request, move |outcome| {
            finish(
                "online buddies fetch",
                parse_result(outcome).and_then(|result| {
                    let entries = result.as_array().ok_or(ProtocolError::InvalidField {
                        field: "result",
                        reason: "expected an array".to_string(),
                    })?;
                    let mut roster = owner.roster();
                    let mut online = 0;
                    for entry in entries {
                        let (Some(uin), Some(status)) =
                            (json::field(entry, "uin"), json::field(entry, "status"))
                        else {
                            continue;
                        };
                        let client_type = json::field(entry, "client_type");
                        if roster.set_status(&uin, &status, client_type.as_deref()) {
                            online += 1;
                        }
                    }
                    debug!("{} buddies online", online);
                    Ok(())
                }),
            )
        })
}

/// Fetch a buddy's (or our own) profile, blocking the calling thread
pub fn fetch_detail(session: &Session, uin: &str) -> Result<(), ClientError> {
    let creds = session.credentials();
    let url = with_query(
        &format!("{}/api/get_friend_info2", session.config().api_host),
        &[
            ("tuin", uin),
            ("verifysession", ""),
            ("code", ""),
            ("vfwebqq", creds.vfwebqq.as_str()),
        ],
    );
    let request = HttpRequest::get(url).header("Referer", api_referer(session));
    let result = parse_result(session.http().request(&request))?;

    let mut roster = session.roster();
    let Some(buddy) = roster.buddy_or_myself_mut(uin) else {
        debug!("detail for unknown uin {}", uin);
        return Ok(());
    };
    apply_detail(buddy, &result);
    Ok(())
}

fn apply_detail(buddy: &mut Buddy, result: &Value) {
    let set = |slot: &mut Option<String>, key: &str| {
        if let Some(value) = json::field(result, key) {
            *slot = Some(value);
        }
    };
    set(&mut buddy.nick, "nick");
    set(&mut buddy.face, "face");
    set(&mut buddy.gender, "gender");
    set(&mut buddy.personal, "personal");
    set(&mut buddy.email, "email");
    set(&mut buddy.mobile, "mobile");
    set(&mut buddy.homepage, "homepage");
    set(&mut buddy.country, "country");
    set(&mut buddy.province, "province");
    set(&mut buddy.city, "city");
    set(&mut buddy.client_type, "client_type");
    if let Some(status) = json::field(result, "stat").as_deref().and_then(status_from_stat) {
        buddy.status = Some(status.to_string());
    }
}

/// Fetch group info, members and member presence
pub fn fetch_group_detail(session: &Arc<Session>, code: &str) -> AsyncEvent {
    let creds = session.credentials();
    let url = with_query(
        &format!("{}/api/get_group_info_ext2", session.config().api_host),
        &[("gcode", code), ("vfwebqq", creds.vfwebqq.as_str())],
    );
    let request = HttpRequest::get(url).header("Referer", api_referer(session));

    let owner = Arc::clone(session);
    let code = code.to_string();
    session
        .http()
        .request_async(session.id(), request, move |outcome| {
            finish(
                "group detail fetch",
                parse_result(outcome).and_then(|result| {
                    let mut roster = owner.roster();
                    let group = roster
                        .find_group_by_code_mut(&code)
                        .ok_or(ProtocolError::InvalidField {
                            field: "gcode",
                            reason: format!("unknown group {}", code),
                        })?;
                    apply_group_detail(group, &result);
                    Ok(())
                }),
            )
        })
}

fn apply_group_detail(group: &mut Group, result: &Value) {
    if let Some(ginfo) = result.get("ginfo") {
        group.memo = json::field(ginfo, "memo").or(group.memo.take());
        group.owner = json::field(ginfo, "owner").or(group.owner.take());
        group.name = json::field(ginfo, "name").or(group.name.take());
    }
    for entry in items(result, "minfo") {
        let (Some(uin), Some(nick)) = (json::field(entry, "uin"), json::field(entry, "nick")) else {
            continue;
        };
        let member = group.member_entry(&uin);
        member.nick = Some(nick);
        member.gender = json::field(entry, "gender");
        member.country = json::field(entry, "country");
        member.province = json::field(entry, "province");
        member.city = json::field(entry, "city");
    }
    for entry in items(result, "stats") {
        let Some(uin) = json::field(entry, "uin") else {
            continue;
        };
        if let Some(member) = group.members.iter_mut().find(|m| m.uin == uin) {
            member.client_type = json::field(entry, "client_type");
            member.status = json::field(entry, "stat")
                .as_deref()
                .and_then(status_from_stat)
                .map(str::to_string);
        }
    }
    for entry in items(result, "cards") {
        let (Some(uin), Some(card)) = (json::field(entry, "muin"), json::field(entry, "card")) else {
            continue;
        };
        if let Some(member) = group.members.iter_mut().find(|m| m.uin == uin) {
            member.markname = Some(card).filter(|c| !c.is_empty());
        }
    }
}

/// Resolve the permanent account number of a buddy or group
///
/// Publishes FriendArrived or GroupArrived once the number is stored.
pub fn lookup_account(session: &Arc<Session>, contact: Contact) -> AsyncEvent {
    let creds = session.credentials();
    let url = with_query(
        &format!("{}/api/get_friend_uin2", session.config().api_host),
        &[
            ("tuin", contact.id()),
            ("verifysession", ""),
            ("type", "1"),
            ("code", ""),
            ("vfwebqq", creds.vfwebqq.as_str()),
        ],
    );
    let request = HttpRequest::get(url).header("Referer", api_referer(session));

    let owner = Arc::clone(session);
    session
        .http()
        .request_async(session.id(), request, move |outcome| {
            finish(
                "account lookup",
                parse_result(outcome).and_then(|result| {
                    let account = json::required(&result, "account")?;
                    let signal = store_account(&owner, &contact, account)?;
                    owner.publish(signal);
                    Ok(())
                }),
            )
        })
}

fn store_account(session: &Session, contact: &Contact, account: String) -> Result<Signal, ProtocolError> {
    let mut roster = session.roster();
    match contact {
        Contact::Buddy(uin) => {
            let buddy = roster.find_buddy_mut(uin).ok_or(ProtocolError::InvalidField {
                field: "tuin",
                reason: format!("unknown buddy {}", uin),
            })?;
            buddy.account = Some(account);
            Ok(Signal::FriendArrived(buddy.clone()))
        }
        Contact::Group(code) => {
            let group = roster
                .find_group_by_code_mut(code)
                .ok_or(ProtocolError::InvalidField {
                    field: "tuin",
                    reason: format!("unknown group {}", code),
                })?;
            group.account = Some(account);
            Ok(Signal::GroupArrived(group.clone()))
        }
    }
}

/// Fetch a buddy or group avatar
///
/// Falls back to the on-disk cache when the server has nothing new or the
/// request fails. Always publishes FriendAvatar or GroupAvatar.
pub fn fetch_avatar(session: &Arc<Session>, contact: Contact) -> AsyncEvent {
    let creds = session.credentials();
    let server = session.next_avatar_server();
    let kind = match contact {
        Contact::Buddy(_) => "1",
        Contact::Group(_) => "4",
    };
    let url = with_query(
        &format!("http://face{}.{}/cgi/svr/face/getface", server, session.config().avatar_host),
        &[
            ("cache", "0"),
            ("type", kind),
            ("fid", "0"),
            ("uin", contact.id()),
            ("vfwebqq", creds.vfwebqq.as_str()),
        ],
    );
    let request = HttpRequest::get(url).header("Referer", format!("{}/", session.config().web_host));

    let cache_path = avatar_cache_path(session, &contact);
    let owner = Arc::clone(session);
    session
        .http()
        .request_async(session.id(), request, move |outcome| {
            let (avatar, result): (Option<Arc<[u8]>>, ResultCode) = match outcome {
                Ok(response) if response.is_ok() => {
                    if let Some(path) = &cache_path {
                        write_cache(path, &response.body);
                    }
                    (Some(Arc::from(response.body)), ResultCode::Success)
                }
                Ok(response) => {
                    let cached = cache_path.as_deref().and_then(read_cache);
                    let code = if response.status == 304 && cached.is_some() {
                        ResultCode::Success
                    } else {
                        ResultCode::Transport(Some(response.status))
                    };
                    (cached, code)
                }
                Err(e) => {
                    warn!("avatar fetch for {} failed: {}", contact.id(), e);
                    (cache_path.as_deref().and_then(read_cache), (&e).into())
                }
            };
            let signal = store_avatar(&owner, &contact, avatar);
            owner.publish(signal);
            (result, None)
        })
}

fn avatar_cache_path(session: &Session, contact: &Contact) -> Option<PathBuf> {
    let dir = session.config().avatar_cache_dir.clone()?;
    let roster = session.roster();
    let account = match contact {
        Contact::Buddy(uin) => roster.find_buddy(uin)?.account.clone(),
        Contact::Group(code) => roster.find_group_by_code(code)?.account.clone(),
    }?;
    Some(dir.join(account))
}

fn read_cache(path: &std::path::Path) -> Option<Arc<[u8]>> {
    std::fs::read(path).ok().map(Arc::from)
}

fn write_cache(path: &std::path::Path, bytes: &[u8]) {
    if let Some(dir) = path.parent() {
        if let Err(e) = std::fs::create_dir_all(dir) {
            warn!("cannot create avatar cache {}: {}", dir.display(), e);
            return;
        }
    }
    if let Err(e) = std::fs::write(path, bytes) {
        warn!("cannot write avatar cache {}: {}", path.display(), e);
    }
}

fn store_avatar(session: &Session, contact: &Contact, avatar: Option<Arc<[u8]>>) -> Signal {
    let mut roster = session.roster();
    match contact {
        Contact::Buddy(uin) => {
            if let Some(buddy) = roster.buddy_or_myself_mut(uin) {
                if avatar.is_some() {
                    buddy.avatar = avatar.clone();
                }
            }
            Signal::FriendAvatar {
                uin: uin.clone(),
                avatar,
            }
        }
        Contact::Group(code) => {
            if let Some(group) = roster.find_group_by_code_mut(code) {
                if avatar.is_some() {
                    group.avatar = avatar.clone();
                }
            }
            Signal::GroupAvatar {
                code: code.clone(),
                avatar,
            }
        }
    }
}

/// How a deleted buddy is treated on their side
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteMode {
    /// Remove the buddy and drop us from their list too
    Mutual,
    /// Remove the buddy only
    OneSided,
}

impl DeleteMode {
    fn wire(self) -> &'static str {
        match self {
            DeleteMode::Mutual => "1",
            DeleteMode::OneSided => "2",
        }
    }
}

fn manage_referer(session: &Session) -> String {
    format!(
        "{}/proxy.html?v=20110412001&callback=0&id=3",
        session.config().api_host
    )
}

/// Success of a call that answers with a bare retcode
fn check_retcode(outcome: Result<HttpResponse, TransportError>) -> Result<(), ClientError> {
    let response = outcome?.require_ok()?;
    let tree = json::parse(&response.text())?;
    match json::retcode(&tree) {
        0 => Ok(()),
        code => Err(ClientError::from_retcode(code)),
    }
}

/// POST a roster change to `/api/{path}` and run `apply` once the server accepts it
fn manage<F>(session: &Arc<Session>, op: &'static str, path: &str, body: String, apply: F) -> AsyncEvent
where
    F: FnOnce(&mut Roster) + Send + 'static,
{
    let api = session.config().api_host.clone();
    let request = HttpRequest::post_form(format!("{}/api/{}", api, path), body)
        .header("Origin", api)
        .header("Referer", manage_referer(session));

    let owner = Arc::clone(session);
    session
        .http()
        .request_async(session.id(), request, move |outcome| {
            finish(
                op,
                check_retcode(outcome).map(|()| {
                    let mut roster = owner.roster();
                    apply(&mut *roster);
                    debug!("{} accepted", op);
                }),
            )
        })
}

/// Set the markname of a buddy
pub fn change_buddy_markname(session: &Arc<Session>, uin: &str, markname: &str) -> AsyncEvent {
    let creds = session.credentials();
    let body = form_encode(&[
        ("tuin", uin),
        ("markname", markname),
        ("vfwebqq", creds.vfwebqq.as_str()),
    ]);
    let (uin, markname) = (uin.to_string(), markname.to_string());
    manage(session, "buddy markname change", "change_mark_name2", body, move |roster| {
        if let Some(buddy) = roster.find_buddy_mut(&uin) {
            buddy.markname = Some(markname);
        }
    })
}

/// Set the markname of a group, addressed by code
pub fn change_group_markname(session: &Arc<Session>, code: &str, markname: &str) -> AsyncEvent {
    let creds = session.credentials();
    let r = json!({
        "gcode": json::id_value(code),
        "markname": markname,
        "vfwebqq": creds.vfwebqq,
    })
    .to_string();
    let body = form_encode(&[("r", r.as_str())]);
    let (code, markname) = (code.to_string(), markname.to_string());
    manage(session, "group markname change", "update_group_info2", body, move |roster| {
        if let Some(group) = roster.find_group_by_code_mut(&code) {
            group.markname = Some(markname);
        }
    })
}

/// Move a buddy to the category with the given name
///
/// Completes with [`ResultCode::Protocol`] without a request when no
/// category has that name.
pub fn modify_buddy_category(session: &Arc<Session>, uin: &str, category: &str) -> AsyncEvent {
    let index = session
        .roster()
        .categories
        .iter()
        .find(|c| c.name == category)
        .map(|c| c.index);
    let index = match index {
        Some(index) => index.to_string(),
        None => {
            warn!("no category named {}", category);
            return AsyncEvent::completed(ResultCode::Protocol);
        }
    };

    let creds = session.credentials();
    let body = form_encode(&[
        ("tuin", uin),
        ("newid", index.as_str()),
        ("vfwebqq", creds.vfwebqq.as_str()),
    ]);
    let uin = uin.to_string();
    manage(session, "buddy category change", "modify_friend_group", body, move |roster| {
        if let Some(buddy) = roster.find_buddy_mut(&uin) {
            buddy.category = Some(index);
        }
        roster.recount_categories();
    })
}

/// Delete a buddy from the roster
pub fn delete_friend(session: &Arc<Session>, uin: &str, mode: DeleteMode) -> AsyncEvent {
    let creds = session.credentials();
    let body = form_encode(&[
        ("tuin", uin),
        ("delType", mode.wire()),
        ("vfwebqq", creds.vfwebqq.as_str()),
    ]);
    let uin = uin.to_string();
    manage(session, "friend delete", "delete_friend", body, move |roster| {
        if roster.remove_buddy(&uin).is_some() {
            roster.recount_categories();
        }
    })
}

fn added_request_body(session: &Session, account: &str, extra: &[(&str, Option<Value>)]) -> String {
    let creds = session.credentials();
    let mut r = json!({
        "account": json::id_value(account),
        "vfwebqq": creds.vfwebqq,
    });
    for (key, value) in extra {
        if let Some(value) = value {
            r[*key] = value.clone();
        }
    }
    form_encode(&[("r", r.to_string().as_str())])
}

/// Accept a pending add request from `account`
pub fn allow_added_request(session: &Arc<Session>, account: &str) -> AsyncEvent {
    let body = added_request_body(session, account, &[]);
    manage(session, "add request accept", "allow_added_request2", body, |_| {})
}

/// Refuse a pending add request, optionally telling the requester why
pub fn deny_added_request(session: &Arc<Session>, account: &str, reason: Option<&str>) -> AsyncEvent {
    let body = added_request_body(session, account, &[("msg", reason.map(Value::from))]);
    manage(session, "add request deny", "deny_added_request2", body, |_| {})
}

/// Accept a pending add request and add the requester back
///
/// The new buddy lands in the default category; `markname` is set on
/// the server side.
pub fn allow_and_add(session: &Arc<Session>, account: &str, markname: Option<&str>) -> AsyncEvent {
    let body = added_request_body(
        session,
        account,
        &[("gid", Some(Value::from(0))), ("mname", markname.map(Value::from))],
    );
    manage(session, "add request accept and add", "allow_and_add2", body, |_| {})
}
