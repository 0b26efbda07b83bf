// ABOUTME: IRC line parsing and formatting with IRCv3 message tags
// ABOUTME: Maps PRIVMSG lines to ChatMessage with role badges and stable user ids

use chirp_core::{ChatMessage, Roles, UserContext};
use std::collections::HashMap;

/// Server notices that mean the credentials were rejected
const AUTH_FAILURE_NOTICES: &[&str] = &[
    "Login authentication failed",
    "Login unsuccessful",
    "Improperly formatted auth",
];

/// One parsed IRC line: `[@tags] [:prefix] COMMAND [params...] [:trailing]`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IrcLine {
    pub tags: HashMap<String, String>,
    pub prefix: Option<String>,
    pub command: String,
    /// Middle params followed by the trailing param, if any
    pub params: Vec<String>,
}

impl IrcLine {
    pub fn parse(line: &str) -> Option<Self> {
        let mut rest = line.trim_end_matches(['\r', '\n']);

        let mut tags = HashMap::new();
        if let Some(stripped) = rest.strip_prefix('@') {
            let (raw, remainder) = stripped.split_once(' ')?;
            for pair in raw.split(';').filter(|p| !p.is_empty()) {
                let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
                tags.insert(key.to_string(), unescape_tag(value));
            }
            rest = remainder.trim_start();
        }

        let mut prefix = None;
        if let Some(stripped) = rest.strip_prefix(':') {
            let (p, remainder) = stripped.split_once(' ')?;
            prefix = Some(p.to_string());
            rest = remainder.trim_start();
        }

        let (head, trailing) = match rest.split_once(" :") {
            Some((head, trailing)) => (head, Some(trailing)),
            None => (rest, None),
        };
        let mut words = head.split_whitespace();
        let command = words.next()?.to_ascii_uppercase();
        let mut params: Vec<String> = words.map(str::to_string).collect();
        if let Some(trailing) = trailing {
            params.push(trailing.to_string());
        }

        Some(Self {
            tags,
            prefix,
            command,
            params,
        })
    }

    pub fn tag(&self, key: &str) -> Option<&str> {
        self.tags.get(key).map(String::as_str).filter(|v| !v.is_empty())
    }

    /// Nick portion of `nick!user@host`
    pub fn nick(&self) -> Option<&str> {
        let prefix = self.prefix.as_deref()?;
        Some(prefix.split(['!', '@']).next().unwrap_or(prefix))
    }

    pub fn trailing(&self) -> Option<&str> {
        self.params.last().map(String::as_str)
    }
}

fn unescape_tag(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut chars = value.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some(':') => out.push(';'),
            Some('s') => out.push(' '),
            Some('r') => out.push('\r'),
            Some('n') => out.push('\n'),
            Some(other) => out.push(other),
            None => {}
        }
    }
    out
}

/// Role flags from the `badges` and `mod` tags, plus the configured owner list
pub fn roles_from_tags(line: &IrcLine, login: &str, owners: &[String]) -> Roles {
    let mut roles = Roles::default();
    if let Some(badges) = line.tag("badges") {
        for badge in badges.split(',') {
            match badge.split('/').next().unwrap_or_default() {
                "broadcaster" => roles.broadcaster = true,
                "moderator" => roles.moderator = true,
                "vip" => roles.vip = true,
                "subscriber" | "founder" => roles.subscriber = true,
                _ => {}
            }
        }
    }
    if line.tag("mod") == Some("1") {
        roles.moderator = true;
    }
    roles.owner = owners.iter().any(|o| o.eq_ignore_ascii_case(login));
    roles
}

/// What the transport cares about in a server line
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    /// 001: registration accepted
    Welcome,
    Ping(String),
    Pong,
    Message(ChatMessage),
    AuthFailed(String),
    /// Server asks us to reconnect
    Reconnect,
    Other,
}

/// Classify a raw line. `own_nick` marks our own echoed messages.
pub fn classify(raw: &str, own_nick: &str, owners: &[String]) -> Inbound {
    let Some(line) = IrcLine::parse(raw) else {
        return Inbound::Other;
    };

    match line.command.as_str() {
        "001" => Inbound::Welcome,
        "PING" => Inbound::Ping(line.trailing().unwrap_or_default().to_string()),
        "PONG" => Inbound::Pong,
        "RECONNECT" => Inbound::Reconnect,
        "NOTICE" => {
            let text = line.trailing().unwrap_or_default();
            if AUTH_FAILURE_NOTICES.iter().any(|n| text.contains(n)) {
                Inbound::AuthFailed(text.to_string())
            } else {
                Inbound::Other
            }
        }
        "PRIVMSG" => match privmsg_to_message(&line, own_nick, owners) {
            Some(message) => Inbound::Message(message),
            None => Inbound::Other,
        },
        _ => Inbound::Other,
    }
}

fn privmsg_to_message(line: &IrcLine, own_nick: &str, owners: &[String]) -> Option<ChatMessage> {
    let target = line.params.first()?;
    let text = line.params.get(1)?;
    let login = line.nick()?.to_ascii_lowercase();

    let id = line.tag("user-id").unwrap_or(&login).to_string();
    let roles = roles_from_tags(line, &login, owners);
    let mut user = UserContext::new(id, login.clone()).with_roles(roles);
    if let Some(display) = line.tag("display-name") {
        user = user.with_display_name(display);
    }

    // CTCP ACTION (/me) carries the text inside \x01ACTION ...\x01
    let text = text
        .strip_prefix("\u{1}ACTION ")
        .and_then(|t| t.strip_suffix('\u{1}'))
        .unwrap_or(text);

    let mut message = ChatMessage::new(target.clone(), user, text);
    if let Some(id) = line.tag("id") {
        message = message.with_id(id);
    }
    message.is_self = login.eq_ignore_ascii_case(own_nick);
    Some(message)
}

// =============================================================================
// Outbound
// =============================================================================

/// Strip line breaks so a message can't smuggle extra commands
fn single_line(text: &str) -> String {
    text.chars().map(|c| if c == '\r' || c == '\n' { ' ' } else { c }).collect()
}

pub fn privmsg(target: &str, text: &str) -> String {
    format!("PRIVMSG {} :{}", target, single_line(text))
}

pub fn pong(payload: &str) -> String {
    format!("PONG :{}", single_line(payload))
}

pub fn ping(payload: &str) -> String {
    format!("PING :{}", single_line(payload))
}

pub fn join(channels: &[String]) -> String {
    format!("JOIN {}", channels.join(","))
}

/// Registration lines, in order
pub fn handshake(nick: &str, token: Option<&str>) -> Vec<String> {
    let mut lines = vec!["CAP REQ :twitch.tv/tags twitch.tv/commands".to_string()];
    if let Some(token) = token {
        let token = token.strip_prefix("oauth:").unwrap_or(token);
        lines.push(format!("PASS oauth:{}", token));
    }
    lines.push(format!("NICK {}", nick));
    lines
}

#[cfg(test)]
mod tests {
    use super::*;

    const TAGGED: &str = "@badge-info=;badges=moderator/1,subscriber/12;display-name=Alice\\sB;id=abc-123;mod=1;user-id=4242 :alice!alice@alice.tmi.twitch.tv PRIVMSG #chan :!roll 2d6";

    #[test]
    fn test_parse_tagged_privmsg() {
        let line = IrcLine::parse(TAGGED).unwrap();
        assert_eq!(line.command, "PRIVMSG");
        assert_eq!(line.nick(), Some("alice"));
        assert_eq!(line.params, vec!["#chan", "!roll 2d6"]);
        assert_eq!(line.tag("display-name"), Some("Alice B"));
        assert_eq!(line.tag("badge-info"), None);
    }

    #[test]
    fn test_parse_without_tags_or_prefix() {
        let line = IrcLine::parse("PING :tmi.twitch.tv\r\n").unwrap();
        assert_eq!(line.command, "PING");
        assert!(line.prefix.is_none());
        assert_eq!(line.trailing(), Some("tmi.twitch.tv"));
        assert!(IrcLine::parse("").is_none());
    }

    #[test]
    fn test_tag_unescaping() {
        assert_eq!(unescape_tag("a\\sb\\:c\\\\d"), "a b;c\\d");
    }

    #[test]
    fn test_classify_message() {
        let owners = vec!["Bob".to_string()];
        let Inbound::Message(msg) = classify(TAGGED, "chirpbot", &owners) else {
            panic!("expected a message");
        };
        assert_eq!(msg.id.as_deref(), Some("abc-123"));
        assert_eq!(msg.user.id, "4242");
        assert_eq!(msg.user.display(), "Alice B");
        assert!(msg.user.roles.moderator);
        assert!(msg.user.roles.subscriber);
        assert!(!msg.user.roles.owner);
        assert!(!msg.is_self);
    }

    #[test]
    fn test_owner_and_self_detection() {
        let owners = vec!["alice".to_string()];
        let raw = ":Alice!alice@host PRIVMSG #chan :hi";
        let Inbound::Message(msg) = classify(raw, "alice", &owners) else {
            panic!("expected a message");
        };
        assert!(msg.user.roles.owner);
        assert!(msg.is_self);
        // No user-id tag: fall back to login
        assert_eq!(msg.user.id, "alice");
    }

    #[test]
    fn test_action_text_unwrapped() {
        let raw = ":bob!bob@host PRIVMSG #chan :\u{1}ACTION waves\u{1}";
        let Inbound::Message(msg) = classify(raw, "bot", &[]) else {
            panic!("expected a message");
        };
        assert_eq!(msg.text, "waves");
    }

    #[test]
    fn test_classify_control_lines() {
        assert_eq!(classify(":tmi.twitch.tv 001 bot :Welcome, GLHF!", "bot", &[]), Inbound::Welcome);
        assert_eq!(classify("PING :tmi.twitch.tv", "bot", &[]), Inbound::Ping("tmi.twitch.tv".to_string()));
        assert_eq!(classify(":tmi.twitch.tv RECONNECT", "bot", &[]), Inbound::Reconnect);
        assert_eq!(
            classify(":tmi.twitch.tv NOTICE * :Login authentication failed", "bot", &[]),
            Inbound::AuthFailed("Login authentication failed".to_string())
        );
        assert_eq!(classify(":tmi.twitch.tv NOTICE #chan :slow mode", "bot", &[]), Inbound::Other);
    }

    #[test]
    fn test_outbound_formatting() {
        assert_eq!(privmsg("#chan", "hi\r\nQUIT"), "PRIVMSG #chan :hi  QUIT");
        assert_eq!(pong("tmi.twitch.tv"), "PONG :tmi.twitch.tv");
        assert_eq!(join(&["#a".to_string(), "#b".to_string()]), "JOIN #a,#b");
        let lines = handshake("bot", Some("oauth:secret"));
        assert_eq!(lines[1], "PASS oauth:secret");
        assert_eq!(lines[2], "NICK bot");
        assert_eq!(handshake("bot", None).len(), 2);
    }
}
