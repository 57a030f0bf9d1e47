/// Gateway wire protocol.
///
/// The backend speaks JSON frames of the shape `{"type": ..., "payload": ...}`
/// over WebSocket. Outbound frames are [`GatewayCommand`]s; inbound frames are
/// [`GatewayEvent`]s. Decoding is two-stage: the `type` field is inspected
/// first so frames with an unknown type are skipped (forward compatibility)
/// while frames with a known type but a bad payload surface as errors.
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use crate::error::ProxyError;
use crate::irc::message::Message;

pub type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Frames the proxy sends to the gateway.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum GatewayCommand {
    /// Announce the client after IRC registration completes.
    Hello {
        nick: String,
        user: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        pass: Option<String>,
    },
    /// Deliver a PRIVMSG or NOTICE to a channel or nick.
    Message {
        target: String,
        text: String,
        notice: bool,
    },
    Join {
        channel: String,
    },
    Part {
        channel: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    /// Request the channel directory (IRC LIST).
    List,
    Quit {
        #[serde(skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
}

/// Frames the gateway sends to the proxy.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum GatewayEvent {
    /// The gateway accepted the hello; the session may complete registration.
    Registered { nick: String },
    /// A chat message addressed to the client or one of its channels.
    Message {
        from: String,
        target: String,
        text: String,
        #[serde(default)]
        notice: bool,
    },
    /// Another user joined, parted, quit, or changed nick.
    Presence {
        nick: String,
        kind: PresenceKind,
        #[serde(default)]
        channel: Option<String>,
        #[serde(default)]
        new_nick: Option<String>,
        #[serde(default)]
        reason: Option<String>,
    },
    /// Membership of one channel.
    Names { channel: String, nicks: Vec<String> },
    /// Channel directory, in response to a `list` command.
    Channels { entries: Vec<ChannelEntry> },
    /// A gateway-side failure the client should hear about.
    Error { code: String, text: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PresenceKind {
    Join,
    Part,
    Quit,
    Nick,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ChannelEntry {
    pub name: String,
    pub users: u32,
    #[serde(default)]
    pub topic: String,
}

/// Open the WebSocket link to the gateway.
pub async fn connect(url: &str) -> Result<WsStream, ProxyError> {
    let (stream, _response) = connect_async(url).await?;
    Ok(stream)
}

/// Serialize a command into a WebSocket text frame.
pub fn encode_command(cmd: &GatewayCommand) -> Result<WsMessage, ProxyError> {
    Ok(WsMessage::Text(serde_json::to_string(cmd)?))
}

/// Decode one inbound text frame.
///
/// Returns `Ok(None)` for frames whose `type` is unknown, so gateway
/// protocol additions never break deployed proxies. A known type with a
/// malformed payload is an error.
pub fn parse_event(text: &str) -> Result<Option<GatewayEvent>, ProxyError> {
    let value: Value = serde_json::from_str(text)?;
    let Some(kind) = value.get("type").and_then(Value::as_str) else {
        return Err(serde_json::Error::io(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "frame has no type field",
        ))
        .into());
    };
    const KNOWN: [&str; 6] = [
        "registered",
        "message",
        "presence",
        "names",
        "channels",
        "error",
    ];
    if !KNOWN.contains(&kind) {
        return Ok(None);
    }
    Ok(Some(serde_json::from_value(value)?))
}

/// Translate one gateway event into the IRC lines the client should see.
/// `me` is the client's registered nickname (numerics are addressed to it).
pub fn event_to_irc(event: &GatewayEvent, me: &str) -> Vec<Message> {
    match event {
        // Registration is a session state transition, not client output.
        GatewayEvent::Registered { .. } => Vec::new(),

        GatewayEvent::Message {
            from,
            target,
            text,
            notice,
        } => {
            let command = if *notice { "NOTICE" } else { "PRIVMSG" };
            vec![Message::from_user(
                from,
                command,
                vec![target.clone(), text.clone()],
            )]
        }

        GatewayEvent::Presence {
            nick,
            kind,
            channel,
            new_nick,
            reason,
        } => match kind {
            PresenceKind::Join => match channel {
                Some(ch) => vec![Message::from_user(nick, "JOIN", vec![ch.clone()])],
                None => Vec::new(),
            },
            PresenceKind::Part => match channel {
                Some(ch) => {
                    let mut params = vec![ch.clone()];
                    if let Some(reason) = reason {
                        params.push(reason.clone());
                    }
                    vec![Message::from_user(nick, "PART", params)]
                }
                None => Vec::new(),
            },
            PresenceKind::Quit => {
                let reason = reason.clone().unwrap_or_else(|| "Quit".into());
                vec![Message::from_user(nick, "QUIT", vec![reason])]
            }
            PresenceKind::Nick => match new_nick {
                Some(new) => vec![Message::from_user(nick, "NICK", vec![new.clone()])],
                None => Vec::new(),
            },
        },

        GatewayEvent::Names { channel, nicks } => vec![
            Message::numeric(
                "353",
                me,
                vec!["=".into(), channel.clone(), nicks.join(" ")],
            ),
            Message::numeric(
                "366",
                me,
                vec![channel.clone(), "End of /NAMES list".into()],
            ),
        ],

        GatewayEvent::Channels { entries } => {
            let mut out = vec![Message::numeric(
                "321",
                me,
                vec!["Channel".into(), "Users  Name".into()],
            )];
            for entry in entries {
                out.push(Message::numeric(
                    "322",
                    me,
                    vec![
                        entry.name.clone(),
                        entry.users.to_string(),
                        entry.topic.clone(),
                    ],
                ));
            }
            out.push(Message::numeric(
                "323",
                me,
                vec!["End of /LIST".into()],
            ));
            out
        }

        GatewayEvent::Error { code, text } => match code.as_str() {
            "auth_failed" => vec![Message::numeric("464", me, vec![text.clone()])],
            "nick_in_use" => vec![Message::numeric("433", me, vec![text.clone()])],
            "no_such_nick" => vec![Message::numeric("401", me, vec![text.clone()])],
            "no_such_channel" => vec![Message::numeric("403", me, vec![text.clone()])],
            _ => vec![Message::server(
                "NOTICE",
                vec![me.to_owned(), format!("Gateway error: {text}")],
            )],
        },
    }
}
