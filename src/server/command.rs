//! Command line tokenizing and the GET sub-command grammar.

/// A parsed command line: verb, queue name, and normalized sub-command.
///
/// The sub-command is the `/`-join of the trailing tokens in their original
/// order, with `t=<digits>` timeout tokens stripped out. Order matters:
/// `close/open` and `open/close` are distinct.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    pub name: String,
    pub queue_name: String,
    pub sub_command: String,
}

/// Parse the second token of a GET command: `queue[/sub[/sub…]]`.
///
/// Reservation lifetimes are not honored, so `t=<digits>` tokens are parsed
/// and discarded wherever they appear.
pub fn parse_get_command(name: &str, input: &str) -> Command {
    let segments: Vec<&str> = input.split('/').filter(|s| !is_timeout_token(s)).collect();

    let queue_name = segments.first().copied().unwrap_or_default();
    let sub_command = segments
        .get(1..)
        .unwrap_or_default()
        .join("/")
        .trim_matches('/')
        .to_string();

    Command {
        name: name.to_ascii_lowercase(),
        queue_name: queue_name.to_string(),
        sub_command,
    }
}

fn is_timeout_token(token: &str) -> bool {
    token
        .strip_prefix("t=")
        .is_some_and(|digits| !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit()))
}
