/// Per-client session: IRC registration, gateway link, relay loop.
///
/// Each accepted connection runs one session task. The session buffers
/// registration commands (CAP/PASS/NICK/USER), opens a WebSocket to the
/// gateway once NICK and USER have both arrived, plays the welcome burst,
/// and then relays in both directions until the client quits, the gateway
/// link dies for good, or the session is cancelled by a kick or ban.
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_util::codec::Framed;
use tracing::{debug, info, warn};

use crate::backoff::ExponentialBackoff;
use crate::config::Config;
use crate::error::ProxyError;
use crate::gateway::{self, GatewayCommand, GatewayEvent, WsStream};
use crate::irc::codec::{CodecError, IrcCodec};
use crate::irc::message::{valid_nick, Message};
use crate::irc::{SERVER_NAME, SERVER_VERSION};
use crate::ratelimit::RateLimiter;
use crate::registry::{SessionHandle, SessionRegistry};

/// Keepalive: ping the client at this interval...
const PING_INTERVAL: Duration = Duration::from_secs(90);
/// ...and drop it if nothing arrives for this long.
const IDLE_TIMEOUT: Duration = Duration::from_secs(180);
/// Clients get this long to complete NICK + USER.
const REGISTRATION_TIMEOUT: Duration = Duration::from_secs(60);
/// A dead gateway link gets this long to come back before the client is cut.
const RECONNECT_DEADLINE: Duration = Duration::from_secs(180);

/// Shared dependencies handed to every session task.
#[derive(Clone)]
pub struct SessionContext {
    pub config: Arc<Config>,
    pub limiter: Arc<RateLimiter>,
    pub registry: Arc<SessionRegistry>,
}

/// Credentials collected during IRC registration.
struct Registration {
    nick: Option<String>,
    user: Option<String>,
    pass: Option<String>,
}

/// What to do with a client message once registered.
enum ClientAction {
    /// Forward commands to the gateway.
    Forward(Vec<GatewayCommand>),
    /// Answer locally.
    Reply(Vec<Message>),
    /// Client is leaving.
    Quit(Option<String>),
    /// Nothing to do.
    Ignore,
}

/// Run one client session to completion. Generic over the transport so
/// plaintext TCP and TLS streams share the same code path.
pub async fn run_session<S>(
    stream: S,
    handle: Arc<SessionHandle>,
    ctx: SessionContext,
) -> Result<(), ProxyError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut framed = Framed::new(stream, IrcCodec);
    let cancel = handle.cancelled();

    send_greeting(&mut framed).await?;

    // Phase 1: registration.
    let Some(reg) = registration_phase(&mut framed, &cancel).await? else {
        return Ok(());
    };
    let nick = reg.nick.clone().unwrap_or_default();
    let user = reg.user.clone().unwrap_or_else(|| nick.clone());
    handle.set_nick(&nick);

    // Phase 2: gateway link.
    let mut ws = match gateway::connect(&ctx.config.ws_url).await {
        Ok(ws) => ws,
        Err(e) => {
            warn!(id = handle.id, "gateway connect failed: {e}");
            framed
                .send(Message::server(
                    "NOTICE",
                    vec![
                        nick.clone(),
                        "*** The chat service is unreachable, try again later".into(),
                    ],
                ))
                .await?;
            send_error_line(&mut framed, "Gateway unavailable").await?;
            return Ok(());
        }
    };

    let hello = GatewayCommand::Hello {
        nick: nick.clone(),
        user: user.clone(),
        pass: reg.pass.clone(),
    };
    ws.send(gateway::encode_command(&hello)?).await?;

    send_welcome(&mut framed, &nick).await?;
    info!(id = handle.id, ip = %handle.ip, nick, "session registered");

    // Phase 3: relay.
    let result = relay_loop(&mut framed, ws, hello, &nick, &handle, &ctx).await;

    ctx.limiter.close_session(handle.id);
    result
}

/// The main bidirectional relay.
///
/// Every exit, including client write failures, tells the gateway the
/// identity is gone so it never lingers as a ghost.
async fn relay_loop<S>(
    framed: &mut Framed<S, IrcCodec>,
    mut ws: WsStream,
    hello: GatewayCommand,
    nick: &str,
    handle: &Arc<SessionHandle>,
    ctx: &SessionContext,
) -> Result<(), ProxyError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    ctx.limiter.open_session(handle.id);

    let result = relay(framed, &mut ws, &hello, nick, handle, ctx).await;
    if result.is_err() {
        if let Ok(frame) = gateway::encode_command(&GatewayCommand::Quit { reason: None }) {
            let _ = ws.send(frame).await;
        }
    }
    result
}

async fn relay<S>(
    framed: &mut Framed<S, IrcCodec>,
    ws: &mut WsStream,
    hello: &GatewayCommand,
    nick: &str,
    handle: &Arc<SessionHandle>,
    ctx: &SessionContext,
) -> Result<(), ProxyError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let cancel = handle.cancelled();
    let mut nick = nick.to_owned();
    let mut last_activity = Instant::now();
    let mut keepalive = tokio::time::interval(PING_INTERVAL);
    keepalive.reset();

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                let _ = ws
                    .send(gateway::encode_command(&GatewayCommand::Quit {
                        reason: Some("Connection closed by server".into()),
                    })?)
                    .await;
                send_error_line(framed, "Closing Link: connection closed by server").await?;
                return Ok(());
            }

            frame = framed.next() => {
                let msg = match frame {
                    Some(Ok(msg)) => msg,
                    // Malformed lines are skipped; transport errors end the session.
                    Some(Err(CodecError::Parse(e))) => {
                        debug!(id = handle.id, "skipping malformed line: {e}");
                        continue;
                    }
                    Some(Err(e)) => {
                        debug!(id = handle.id, "client framing error: {e}");
                        let _ = ws
                            .send(gateway::encode_command(&GatewayCommand::Quit {
                                reason: None,
                            })?)
                            .await;
                        return Ok(());
                    }
                    None => {
                        let _ = ws
                            .send(gateway::encode_command(&GatewayCommand::Quit {
                                reason: None,
                            })?)
                            .await;
                        return Ok(());
                    }
                };
                last_activity = Instant::now();

                match handle_client_message(&msg, &nick, handle, ctx) {
                    ClientAction::Forward(cmds) => {
                        for cmd in cmds {
                            ws.send(gateway::encode_command(&cmd)?).await?;
                        }
                    }
                    ClientAction::Reply(replies) => {
                        for reply in replies {
                            framed.send(reply).await?;
                        }
                    }
                    ClientAction::Quit(reason) => {
                        let _ = ws
                            .send(gateway::encode_command(&GatewayCommand::Quit { reason })?)
                            .await;
                        send_error_line(framed, "Closing Link: client quit").await?;
                        return Ok(());
                    }
                    ClientAction::Ignore => {
                        // Banned mid-session: the cancel token fires on the
                        // next loop iteration, but cut the wait short.
                        if ctx.limiter.is_banned(handle.ip) {
                            continue;
                        }
                    }
                }
            }

            frame = ws.next() => {
                match frame {
                    Some(Ok(WsMessage::Text(text))) => {
                        match gateway::parse_event(&text) {
                            Ok(Some(GatewayEvent::Registered { nick: canonical })) => {
                                // The gateway may normalize the nick.
                                if canonical != nick {
                                    framed
                                        .send(Message::from_user(
                                            &nick,
                                            "NICK",
                                            vec![canonical.clone()],
                                        ))
                                        .await?;
                                    handle.set_nick(&canonical);
                                    nick = canonical;
                                }
                            }
                            Ok(Some(event)) => {
                                for line in gateway::event_to_irc(&event, &nick) {
                                    framed.send(line).await?;
                                }
                            }
                            Ok(None) => {
                                debug!(id = handle.id, "skipping unknown gateway frame");
                            }
                            Err(e) => {
                                warn!(id = handle.id, "bad gateway frame: {e}");
                            }
                        }
                    }
                    Some(Ok(WsMessage::Ping(_) | WsMessage::Pong(_))) => {}
                    Some(Ok(WsMessage::Close(_))) | Some(Err(_)) | None => {
                        match reestablish(framed, &ctx.config.ws_url, hello, &nick, &cancel).await? {
                            Some(new_ws) => {
                                *ws = new_ws;
                            }
                            None => {
                                send_error_line(framed, "Closing Link: gateway unavailable")
                                    .await?;
                                return Ok(());
                            }
                        }
                    }
                    Some(Ok(_)) => {
                        // Binary and raw frames are not part of the protocol.
                        debug!(id = handle.id, "ignoring non-text gateway frame");
                    }
                }
            }

            _ = keepalive.tick() => {
                if last_activity.elapsed() >= IDLE_TIMEOUT {
                    info!(id = handle.id, "client idle timeout");
                    let _ = ws
                        .send(gateway::encode_command(&GatewayCommand::Quit {
                            reason: Some("Ping timeout".into()),
                        })?)
                        .await;
                    send_error_line(framed, "Closing Link: ping timeout").await?;
                    return Ok(());
                }
                framed
                    .send(Message::server("PING", vec![SERVER_NAME.into()]))
                    .await?;
            }
        }
    }
}

/// Dispatch one post-registration client message.
fn handle_client_message(
    msg: &Message,
    nick: &str,
    handle: &Arc<SessionHandle>,
    ctx: &SessionContext,
) -> ClientAction {
    let command = msg.command.to_uppercase();

    // Keepalive and teardown are never metered.
    match command.as_str() {
        "PING" => {
            let token = msg.params.first().cloned().unwrap_or_default();
            return ClientAction::Reply(vec![Message::server(
                "PONG",
                vec![SERVER_NAME.into(), token],
            )]);
        }
        "PONG" => return ClientAction::Ignore,
        "QUIT" => return ClientAction::Quit(msg.params.first().cloned()),
        "NICK" | "USER" | "PASS" => {
            return ClientAction::Reply(vec![Message::numeric(
                "462",
                nick,
                vec!["You may not reregister".into()],
            )]);
        }
        _ => {}
    }

    // Everything that reaches the gateway takes one token.
    if !ctx.limiter.allow_message(handle.id) {
        debug!(id = handle.id, ip = %handle.ip, command, "message dropped by rate limit");
        if ctx.limiter.record_violation(handle.ip) {
            warn!(id = handle.id, ip = %handle.ip, "session auto-banned");
        }
        return ClientAction::Ignore;
    }

    match command.as_str() {
        "PRIVMSG" | "NOTICE" => {
            if msg.params.len() < 2 {
                return ClientAction::Reply(vec![Message::numeric(
                    "461",
                    nick,
                    vec![command, "Not enough parameters".into()],
                )]);
            }
            ClientAction::Forward(vec![GatewayCommand::Message {
                target: msg.params[0].clone(),
                text: msg.params[1].clone(),
                notice: command == "NOTICE",
            }])
        }

        "JOIN" => match msg.params.first() {
            // IRC allows comma-separated channel lists: JOIN #a,#b
            Some(channels) => ClientAction::Forward(
                channels
                    .split(',')
                    .filter(|ch| !ch.is_empty())
                    .map(|ch| GatewayCommand::Join {
                        channel: ch.to_owned(),
                    })
                    .collect(),
            ),
            None => ClientAction::Reply(vec![Message::numeric(
                "461",
                nick,
                vec!["JOIN".into(), "Not enough parameters".into()],
            )]),
        },

        "PART" => match msg.params.first() {
            Some(channel) => ClientAction::Forward(vec![GatewayCommand::Part {
                channel: channel.clone(),
                reason: msg.params.get(1).cloned(),
            }]),
            None => ClientAction::Reply(vec![Message::numeric(
                "461",
                nick,
                vec!["PART".into(), "Not enough parameters".into()],
            )]),
        },

        "LIST" => ClientAction::Forward(vec![GatewayCommand::List]),

        "CAP" => ClientAction::Ignore,

        other => ClientAction::Reply(vec![Message::numeric(
            "421",
            nick,
            vec![other.into(), "Unknown command".into()],
        )]),
    }
}

/// Collect CAP/PASS/NICK/USER until registration completes.
///
/// Returns `None` when the client went away, timed out, or was rejected.
async fn registration_phase<S>(
    framed: &mut Framed<S, IrcCodec>,
    cancel: &tokio_util::sync::CancellationToken,
) -> Result<Option<Registration>, ProxyError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut reg = Registration {
        nick: None,
        user: None,
        pass: None,
    };
    let deadline = tokio::time::sleep(REGISTRATION_TIMEOUT);
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                send_error_line(framed, "Closing Link: connection closed by server").await?;
                return Ok(None);
            }

            _ = &mut deadline => {
                send_error_line(framed, "Closing Link: registration timeout").await?;
                return Ok(None);
            }

            frame = framed.next() => {
                let msg = match frame {
                    Some(Ok(msg)) => msg,
                    Some(Err(CodecError::Parse(e))) => {
                        debug!("skipping malformed line during registration: {e}");
                        continue;
                    }
                    Some(Err(e)) => {
                        debug!("client framing error during registration: {e}");
                        return Ok(None);
                    }
                    None => return Ok(None),
                };

                match msg.command.to_uppercase().as_str() {
                    "CAP" => {
                        // Minimal CAP handling: empty LS, ignore END.
                        if msg.params.first().is_some_and(|p| p == "LS") {
                            framed
                                .send(Message::server(
                                    "CAP",
                                    vec!["*".into(), "LS".into(), "".into()],
                                ))
                                .await?;
                        }
                    }
                    "PASS" => {
                        reg.pass = msg.params.first().cloned();
                    }
                    "NICK" => match msg.params.first() {
                        Some(nick) if valid_nick(nick) => {
                            reg.nick = Some(nick.clone());
                        }
                        Some(nick) => {
                            framed
                                .send(Message::numeric(
                                    "432",
                                    "*",
                                    vec![nick.clone(), "Erroneous nickname".into()],
                                ))
                                .await?;
                            send_error_line(framed, "Closing Link: invalid nickname").await?;
                            return Ok(None);
                        }
                        None => {
                            framed
                                .send(Message::numeric(
                                    "431",
                                    "*",
                                    vec!["No nickname given".into()],
                                ))
                                .await?;
                        }
                    },
                    "USER" => {
                        if let Some(username) = msg.params.first() {
                            reg.user = Some(username.clone());
                        }
                    }
                    "PING" => {
                        let token = msg.params.first().cloned().unwrap_or_default();
                        framed
                            .send(Message::server("PONG", vec![SERVER_NAME.into(), token]))
                            .await?;
                    }
                    "QUIT" => {
                        send_error_line(framed, "Closing Link: client quit").await?;
                        return Ok(None);
                    }
                    _ => {
                        framed
                            .send(Message::numeric(
                                "451",
                                "*",
                                vec!["You have not registered".into()],
                            ))
                            .await?;
                    }
                }

                if reg.nick.is_some() && reg.user.is_some() {
                    return Ok(Some(reg));
                }
            }
        }
    }
}

/// Bring a dead gateway link back, bounded by [`RECONNECT_DEADLINE`].
///
/// While waiting, still answers client PINGs and honors QUIT so the client
/// side of the bridge stays alive. Returns `None` when the deadline passes,
/// the session is cancelled, or the client goes away.
async fn reestablish<S>(
    framed: &mut Framed<S, IrcCodec>,
    url: &str,
    hello: &GatewayCommand,
    nick: &str,
    cancel: &tokio_util::sync::CancellationToken,
) -> Result<Option<WsStream>, ProxyError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    warn!("gateway link lost, reconnecting");
    framed
        .send(Message::server(
            "NOTICE",
            vec![
                nick.to_owned(),
                "*** Lost contact with the chat service, reconnecting...".into(),
            ],
        ))
        .await?;

    let mut backoff = ExponentialBackoff::gateway();
    let deadline = Instant::now() + RECONNECT_DEADLINE;

    loop {
        let delay = backoff.next_delay();
        if Instant::now() + delay >= deadline {
            return Ok(None);
        }

        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Ok(None),
                _ = &mut sleep => break,
                frame = framed.next() => {
                    match frame {
                        Some(Ok(msg)) => match msg.command.to_uppercase().as_str() {
                            "PING" => {
                                let token = msg.params.first().cloned().unwrap_or_default();
                                framed
                                    .send(Message::server(
                                        "PONG",
                                        vec![SERVER_NAME.into(), token],
                                    ))
                                    .await?;
                            }
                            "QUIT" => {
                                send_error_line(framed, "Closing Link: client quit").await?;
                                return Ok(None);
                            }
                            // Other traffic has nowhere to go right now.
                            _ => {}
                        },
                        Some(Err(_)) | None => return Ok(None),
                    }
                }
            }
        }

        match gateway::connect(url).await {
            Ok(mut ws) => {
                ws.send(gateway::encode_command(hello)?).await?;
                framed
                    .send(Message::server(
                        "NOTICE",
                        vec![nick.to_owned(), "*** Reconnected to the chat service".into()],
                    ))
                    .await?;
                info!("gateway link re-established");
                return Ok(Some(ws));
            }
            Err(e) => {
                debug!("gateway reconnect attempt failed: {e}");
            }
        }
    }
}

/// Pre-registration banner, sent the moment the socket opens.
async fn send_greeting<S>(framed: &mut Framed<S, IrcCodec>) -> Result<(), ProxyError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let lines = [
        "*** Welcome to the JustAChat IRC gateway",
        "*** Log in with /PASS email:password, or pick a nick to chat as a guest",
    ];
    for line in lines {
        framed
            .send(Message::server("NOTICE", vec!["*".into(), line.into()]))
            .await?;
    }
    Ok(())
}

/// The welcome burst (001-005 plus MOTD) after successful registration.
async fn send_welcome<S>(framed: &mut Framed<S, IrcCodec>, nick: &str) -> Result<(), ProxyError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let welcome = [
        Message::numeric(
            "001",
            nick,
            vec![format!("Welcome to JustAChat, {nick}")],
        ),
        Message::numeric(
            "002",
            nick,
            vec![format!(
                "Your host is {SERVER_NAME}, running {SERVER_VERSION}"
            )],
        ),
        Message::numeric(
            "003",
            nick,
            vec!["This server bridges IRC to JustAChat".into()],
        ),
        Message::numeric(
            "004",
            nick,
            vec![
                SERVER_NAME.into(),
                SERVER_VERSION.into(),
                "i".into(),
                "nt".into(),
            ],
        ),
        Message::numeric(
            "005",
            nick,
            vec![
                "CHANTYPES=#".into(),
                "NETWORK=JustAChat".into(),
                "are supported by this server".into(),
            ],
        ),
    ];
    for msg in welcome {
        framed.send(msg).await?;
    }

    framed
        .send(Message::numeric(
            "375",
            nick,
            vec![format!("- {SERVER_NAME} Message of the Day -")],
        ))
        .await?;
    let motd_lines = [
        "- Classic IRC access to the JustAChat network.",
        "- Messages relay to the same rooms the web client uses.",
    ];
    for line in motd_lines {
        framed
            .send(Message::numeric("372", nick, vec![line.into()]))
            .await?;
    }
    framed
        .send(Message::numeric(
            "376",
            nick,
            vec!["End of /MOTD command".into()],
        ))
        .await?;

    Ok(())
}

/// IRC ERROR line, the conventional last message before close.
async fn send_error_line<S>(framed: &mut Framed<S, IrcCodec>, text: &str) -> Result<(), ProxyError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    framed
        .send(Message {
            prefix: None,
            command: "ERROR".into(),
            params: vec![text.into()],
        })
        .await?;
    Ok(())
}
