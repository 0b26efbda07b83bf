// ABOUTME: Chat command parsing: prefix detection, name normalization and quoted argument splitting
// ABOUTME: Platform-agnostic; several prefixes may be accepted and map to the same commands

/// Represents a parsed command from a chat message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    /// Prefix character the user typed (e.g. '!' or '~')
    pub prefix: char,
    /// The command name, lower-cased, without prefix
    pub name: String,
    /// Parsed arguments (handles quoted strings)
    pub args: Vec<String>,
    /// The raw argument string after the command name
    pub raw_args: String,
}

impl Command {
    /// Create a new command with name and arguments
    pub fn new(
        prefix: char,
        name: impl Into<String>,
        args: Vec<String>,
        raw_args: impl Into<String>,
    ) -> Self {
        Self {
            prefix,
            name: name.into(),
            args,
            raw_args: raw_args.into(),
        }
    }

    /// Get the first argument if present
    pub fn first_arg(&self) -> Option<&str> {
        self.args.first().map(|s| s.as_str())
    }

    /// Get an argument by index
    pub fn arg(&self, index: usize) -> Option<&str> {
        self.args.get(index).map(|s| s.as_str())
    }

    /// Check if the command has at least `count` arguments
    pub fn has_args(&self, count: usize) -> bool {
        self.args.len() >= count
    }
}

/// Result of parsing a message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseResult {
    /// A command was recognized
    Command(Command),
    /// A regular message (not a command)
    Message(String),
    /// Message should be ignored (empty)
    Ignore,
}

impl ParseResult {
    /// Returns true if this is a command
    pub fn is_command(&self) -> bool {
        matches!(self, ParseResult::Command(_))
    }

    /// Get the command if this is one
    pub fn as_command(&self) -> Option<&Command> {
        match self {
            ParseResult::Command(cmd) => Some(cmd),
            _ => None,
        }
    }

    pub fn into_command(self) -> Option<Command> {
        match self {
            ParseResult::Command(cmd) => Some(cmd),
            _ => None,
        }
    }
}

/// Parse arguments from a string, respecting quoted strings
pub fn parse_args(input: &str) -> Vec<String> {
    let mut args = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut quote_char = '"';

    for c in input.chars() {
        match c {
            '"' | '\'' if !in_quotes => {
                in_quotes = true;
                quote_char = c;
            }
            c if c == quote_char && in_quotes => {
                in_quotes = false;
                // Don't add empty strings from consecutive quotes
                if !current.is_empty() {
                    args.push(std::mem::take(&mut current));
                }
            }
            c if c.is_whitespace() && !in_quotes => {
                if !current.is_empty() {
                    args.push(std::mem::take(&mut current));
                }
            }
            _ => current.push(c),
        }
    }

    if !current.is_empty() {
        args.push(current);
    }

    args
}

/// Parse a chat message to determine if it's a command
///
/// The first whitespace-delimited token is the command token. Its leading
/// character must be one of `prefixes`; the rest of the token, lower-cased,
/// is the command name.
///
/// # Escape Sequences
/// - A doubled prefix (`!!wow`) is a regular message
/// - Empty messages are ignored
pub fn parse_message(body: &str, prefixes: &[char]) -> ParseResult {
    let trimmed = body.trim();

    if trimmed.is_empty() {
        return ParseResult::Ignore;
    }

    let mut chars = trimmed.chars();
    let Some(prefix) = chars.next() else {
        return ParseResult::Ignore;
    };
    if !prefixes.contains(&prefix) {
        return ParseResult::Message(trimmed.to_string());
    }

    let after_prefix = chars.as_str();
    // Must start with an alphanumeric character; rules out "!!", "! hi", "!?"
    if !after_prefix
        .chars()
        .next()
        .is_some_and(|c| c.is_alphanumeric())
    {
        return ParseResult::Message(trimmed.to_string());
    }

    let (name, rest) = match after_prefix.split_once(char::is_whitespace) {
        Some((name, rest)) => (name, rest.trim()),
        None => (after_prefix, ""),
    };

    ParseResult::Command(Command::new(
        prefix,
        name.to_lowercase(),
        parse_args(rest),
        rest,
    ))
}

/// Whether `body` starts with an accepted prefix followed by a command name
pub fn looks_like_command(body: &str, prefixes: &[char]) -> bool {
    parse_message(body, prefixes).is_command()
}

#[cfg(test)]
mod tests {
    use super::*;

    const PREFIXES: &[char] = &['!', '~'];

    #[test]
    fn test_parse_simple_command() {
        let result = parse_message("!help", PREFIXES);
        assert!(matches!(
            result,
            ParseResult::Command(ref cmd) if cmd.name == "help" && cmd.prefix == '!'
        ));
    }

    #[test]
    fn test_parse_command_with_args() {
        let result = parse_message("!roll 2d6", PREFIXES);
        match result {
            ParseResult::Command(cmd) => {
                assert_eq!(cmd.name, "roll");
                assert_eq!(cmd.args, vec!["2d6"]);
                assert_eq!(cmd.raw_args, "2d6");
            }
            _ => panic!("Expected command"),
        }
    }

    #[test]
    fn test_secondary_prefix_maps_identically() {
        let primary = parse_message("!roll 2d6", PREFIXES).into_command().unwrap();
        let legacy = parse_message("~roll 2d6", PREFIXES).into_command().unwrap();
        assert_eq!(primary.name, legacy.name);
        assert_eq!(primary.args, legacy.args);
        assert_eq!(legacy.prefix, '~');
    }

    #[test]
    fn test_command_name_is_lowercased() {
        let cmd = parse_message("!ROLL 1d20", PREFIXES).into_command().unwrap();
        assert_eq!(cmd.name, "roll");
        assert_eq!(cmd.raw_args, "1d20");
    }

    #[test]
    fn test_splits_on_first_whitespace_of_any_kind() {
        let cmd = parse_message("!say\thello   there", PREFIXES)
            .into_command()
            .unwrap();
        assert_eq!(cmd.name, "say");
        assert_eq!(cmd.raw_args, "hello   there");
        assert_eq!(cmd.args, vec!["hello", "there"]);
    }

    #[test]
    fn test_unknown_prefix_is_message() {
        let result = parse_message("?roll 2d6", PREFIXES);
        assert_eq!(result, ParseResult::Message("?roll 2d6".to_string()));
    }

    #[test]
    fn test_doubled_prefix_is_message() {
        assert!(!parse_message("!!wow", PREFIXES).is_command());
        assert!(!parse_message("! roll", PREFIXES).is_command());
    }

    #[test]
    fn test_parse_regular_message() {
        let result = parse_message("hello world", PREFIXES);
        assert_eq!(result, ParseResult::Message("hello world".to_string()));
    }

    #[test]
    fn test_parse_empty_message() {
        assert_eq!(parse_message("", PREFIXES), ParseResult::Ignore);
        assert_eq!(parse_message("   ", PREFIXES), ParseResult::Ignore);
    }

    #[test]
    fn test_parse_just_prefix() {
        assert!(matches!(parse_message("!", PREFIXES), ParseResult::Message(_)));
    }

    #[test]
    fn test_parse_quoted_args() {
        let cmd = parse_message("!say \"hello world\" today", PREFIXES)
            .into_command()
            .unwrap();
        assert_eq!(cmd.args, vec!["hello world", "today"]);
    }

    #[test]
    fn test_parse_single_quoted_args() {
        let cmd = parse_message("!say 'hello world' today", PREFIXES)
            .into_command()
            .unwrap();
        assert_eq!(cmd.args, vec!["hello world", "today"]);
    }

    #[test]
    fn test_command_accessors() {
        let cmd = Command::new('!', "test", vec!["arg1".into(), "arg2".into()], "arg1 arg2");
        assert_eq!(cmd.first_arg(), Some("arg1"));
        assert_eq!(cmd.arg(1), Some("arg2"));
        assert_eq!(cmd.arg(2), None);
        assert!(cmd.has_args(2));
        assert!(!cmd.has_args(3));
    }

    #[test]
    fn test_looks_like_command() {
        assert!(looks_like_command("~uptime", PREFIXES));
        assert!(!looks_like_command("uptime", PREFIXES));
    }
}
