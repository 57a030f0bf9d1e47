/// IRC message parsing and serialization.
///
/// Implements RFC 2812 message format:
///   [`:`prefix SPACE] command [SPACE params] [SPACE `:` trailing]
///
/// Messages are terminated by CR-LF (`\r\n`) on the wire,
/// but parsing operates on the content without the terminator.
use std::fmt;

/// Maximum nickname length accepted at registration.
/// RFC 2812 says 9; the backend allows longer display names.
pub const MAX_NICK_LENGTH: usize = 30;

/// A parsed IRC message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Optional prefix (server name or `nick!user@host`).
    pub prefix: Option<String>,
    /// The command (e.g. `PRIVMSG`, `001`, `NICK`).
    pub command: String,
    /// Parameters. The last may have been a trailing param (with spaces).
    pub params: Vec<String>,
}

/// Errors that can occur during message parsing.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("empty message")]
    Empty,
    #[error("prefix present but missing command")]
    MissingCommand,
}

impl Message {
    /// Parse a single IRC message from a line (without the trailing `\r\n`).
    pub fn parse(input: &str) -> Result<Self, ParseError> {
        let input = input.trim_end_matches("\r\n");

        if input.is_empty() {
            return Err(ParseError::Empty);
        }

        let (prefix, rest) = if input.starts_with(':') {
            // Prefix runs until the first space.
            match input[1..].find(' ') {
                Some(idx) => (Some(input[1..=idx].to_owned()), &input[idx + 2..]),
                None => return Err(ParseError::MissingCommand),
            }
        } else {
            (None, input)
        };

        // Split into command and parameter portion.
        let (command, param_str) = match rest.find(' ') {
            Some(idx) => (&rest[..idx], Some(&rest[idx + 1..])),
            None => (rest, None),
        };

        if command.is_empty() {
            return Err(ParseError::MissingCommand);
        }

        let mut params = Vec::new();

        if let Some(mut remaining) = param_str {
            while !remaining.is_empty() {
                if let Some(trailing) = remaining.strip_prefix(':') {
                    // Trailing parameter: everything after the colon, including spaces.
                    params.push(trailing.to_owned());
                    break;
                }
                match remaining.find(' ') {
                    Some(idx) => {
                        params.push(remaining[..idx].to_owned());
                        remaining = &remaining[idx + 1..];
                    }
                    None => {
                        params.push(remaining.to_owned());
                        break;
                    }
                }
            }
        }

        Ok(Message {
            prefix,
            command: command.to_owned(),
            params,
        })
    }

    /// Build a server-prefixed message.
    pub fn server(command: impl Into<String>, params: Vec<String>) -> Self {
        Self {
            prefix: Some(super::SERVER_NAME.to_owned()),
            command: command.into(),
            params,
        }
    }

    /// Build a server-prefixed numeric reply addressed to `nick`.
    pub fn numeric(code: &str, nick: &str, rest: Vec<String>) -> Self {
        let mut params = vec![nick.to_owned()];
        params.extend(rest);
        Self::server(code, params)
    }

    /// Build a message prefixed as a user on the backend network.
    pub fn from_user(nick: &str, command: impl Into<String>, params: Vec<String>) -> Self {
        Self {
            prefix: Some(format!("{nick}!{nick}@{}", super::SERVER_NAME)),
            command: command.into(),
            params,
        }
    }

    /// Serialize to the IRC wire format (without trailing `\r\n`).
    pub fn to_wire(&self) -> String {
        let mut out = String::new();

        if let Some(ref prefix) = self.prefix {
            out.push(':');
            out.push_str(prefix);
            out.push(' ');
        }

        out.push_str(&self.command);

        if !self.params.is_empty() {
            let last_idx = self.params.len() - 1;
            for (i, param) in self.params.iter().enumerate() {
                out.push(' ');
                if i == last_idx {
                    // Always prefix the last parameter with `:`.
                    // This is always valid per RFC 2812 and avoids edge cases
                    // where a trailing param could be misinterpreted.
                    out.push(':');
                }
                out.push_str(param);
            }
        }

        out
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_wire())
    }
}

/// Check a nickname against IRC grammar: a letter or one of `[]\`_^{|}`
/// first, letters/digits/`-`/specials after, bounded length.
pub fn valid_nick(nick: &str) -> bool {
    if nick.is_empty() || nick.len() > MAX_NICK_LENGTH {
        return false;
    }
    let special = |c: char| "[]\\`_^{|}".contains(c);
    let mut chars = nick.chars();
    let Some(first) = chars.next() else {
        return false;
    };
    if !first.is_ascii_alphabetic() && !special(first) {
        return false;
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '-' || special(c))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    // ── Parsing basics ───────────────────────────────────────────

    #[test]
    fn parse_simple_command() {
        let msg = Message::parse("QUIT").unwrap();
        assert_eq!(msg.prefix, None);
        assert_eq!(msg.command, "QUIT");
        assert_eq!(msg.params, Vec::<String>::new());
    }

    #[test]
    fn parse_command_with_one_param() {
        let msg = Message::parse("NICK alice").unwrap();
        assert_eq!(msg.command, "NICK");
        assert_eq!(msg.params, vec!["alice"]);
    }

    #[test]
    fn parse_command_with_trailing() {
        let msg = Message::parse("PRIVMSG #general :Hello everyone!").unwrap();
        assert_eq!(msg.command, "PRIVMSG");
        assert_eq!(msg.params, vec!["#general", "Hello everyone!"]);
    }

    #[test]
    fn parse_with_prefix() {
        let msg = Message::parse(":alice!alice@jac.chat PRIVMSG #general :hey friends").unwrap();
        assert_eq!(msg.prefix.as_deref(), Some("alice!alice@jac.chat"));
        assert_eq!(msg.command, "PRIVMSG");
        assert_eq!(msg.params, vec!["#general", "hey friends"]);
    }

    #[test]
    fn parse_numeric_reply() {
        let msg = Message::parse(":jac.chat 001 alice :Welcome to JustAChat").unwrap();
        assert_eq!(msg.prefix.as_deref(), Some("jac.chat"));
        assert_eq!(msg.command, "001");
        assert_eq!(msg.params, vec!["alice", "Welcome to JustAChat"]);
    }

    #[test]
    fn parse_user_command() {
        let msg = Message::parse("USER alice 0 * :Alice").unwrap();
        assert_eq!(msg.command, "USER");
        assert_eq!(msg.params, vec!["alice", "0", "*", "Alice"]);
    }

    #[test]
    fn parse_pass_with_credentials() {
        let msg = Message::parse("PASS alice@example.com:hunter2").unwrap();
        assert_eq!(msg.command, "PASS");
        assert_eq!(msg.params, vec!["alice@example.com:hunter2"]);
    }

    #[test]
    fn parse_strips_crlf() {
        let msg = Message::parse("PING :jac.chat\r\n").unwrap();
        assert_eq!(msg.command, "PING");
        assert_eq!(msg.params, vec!["jac.chat"]);
    }

    // ── Parsing edge cases ───────────────────────────────────────

    #[test]
    fn parse_trailing_empty_string() {
        let msg = Message::parse("PART #general :").unwrap();
        assert_eq!(msg.params, vec!["#general", ""]);
    }

    #[test]
    fn parse_trailing_starts_with_colon() {
        let msg = Message::parse("PRIVMSG #general ::)").unwrap();
        assert_eq!(msg.params, vec!["#general", ":)"]);
    }

    #[test]
    fn parse_multiple_middle_params() {
        let msg = Message::parse("USER alice 0 * Alice").unwrap();
        assert_eq!(msg.params, vec!["alice", "0", "*", "Alice"]);
    }

    // ── Parse errors ─────────────────────────────────────────────

    #[test]
    fn parse_empty_input() {
        assert_eq!(Message::parse(""), Err(ParseError::Empty));
    }

    #[test]
    fn parse_prefix_only() {
        assert_eq!(
            Message::parse(":prefix_only"),
            Err(ParseError::MissingCommand)
        );
    }

    // ── Serialization ────────────────────────────────────────────

    #[test]
    fn serialize_simple() {
        let msg = Message {
            prefix: None,
            command: "QUIT".into(),
            params: vec![],
        };
        assert_eq!(msg.to_wire(), "QUIT");
    }

    #[test]
    fn serialize_with_trailing() {
        let msg = Message {
            prefix: None,
            command: "PRIVMSG".into(),
            params: vec!["#general".into(), "Hello everyone!".into()],
        };
        assert_eq!(msg.to_wire(), "PRIVMSG #general :Hello everyone!");
    }

    #[test]
    fn serialize_numeric_helper() {
        let msg = Message::numeric(
            "433",
            "alice",
            vec!["bob".into(), "Nickname is already in use".into()],
        );
        assert_eq!(
            msg.to_wire(),
            ":jac.chat 433 alice bob :Nickname is already in use"
        );
    }

    #[test]
    fn serialize_user_prefix_helper() {
        let msg = Message::from_user("alice", "PRIVMSG", vec!["#general".into(), "hey".into()]);
        assert_eq!(msg.to_wire(), ":alice!alice@jac.chat PRIVMSG #general :hey");
    }

    #[test]
    fn serialize_empty_trailing() {
        let msg = Message {
            prefix: None,
            command: "PART".into(),
            params: vec!["#general".into(), "".into()],
        };
        assert_eq!(msg.to_wire(), "PART #general :");
    }

    // ── Roundtrip ────────────────────────────────────────────────

    #[test]
    fn roundtrip_simple() {
        // Serializer always uses `:` on last param; both forms are valid IRC.
        let msg = Message::parse("NICK alice").unwrap();
        assert_eq!(msg.to_wire(), "NICK :alice");
        let reparsed = Message::parse(&msg.to_wire()).unwrap();
        assert_eq!(msg, reparsed);
    }

    #[test]
    fn roundtrip_with_prefix_and_trailing() {
        let input = ":alice!alice@jac.chat PRIVMSG #general :Hello everyone!";
        let msg = Message::parse(input).unwrap();
        assert_eq!(msg.to_wire(), input);
    }

    #[test]
    fn roundtrip_numeric() {
        let input = ":jac.chat 001 alice :Welcome to JustAChat";
        let msg = Message::parse(input).unwrap();
        assert_eq!(msg.to_wire(), input);
    }

    // ── Nickname validation ──────────────────────────────────────

    #[test]
    fn valid_nicks() {
        assert!(valid_nick("alice"));
        assert!(valid_nick("Alice42"));
        assert!(valid_nick("night-owl"));
        assert!(valid_nick("[away]bob"));
        assert!(valid_nick("x_y^z"));
        assert!(valid_nick(&"a".repeat(MAX_NICK_LENGTH)));
    }

    #[test]
    fn invalid_nicks() {
        assert!(!valid_nick(""));
        assert!(!valid_nick("1alice"));
        assert!(!valid_nick("-alice"));
        assert!(!valid_nick("al ice"));
        assert!(!valid_nick("al,ice"));
        assert!(!valid_nick(&"a".repeat(MAX_NICK_LENGTH + 1)));
    }
}
