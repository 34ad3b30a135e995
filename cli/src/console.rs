use std::fmt::Display;
use std::path::PathBuf;

/// A line typed by the user at the interactive prompt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UserCommand {
  Text(String),
  SendFile(PathBuf),
  Kick(String),
  Who,
  Leave,
  Help,
}

pub const HELP: &str = "/send <path> | /kick <name|peerId> | /who | /leave | /help; anything else is sent as text";

/// Returns `None` for blank lines. Unknown slash commands are reported as
/// errors rather than broadcast.
pub fn parse_command(line: &str) -> Option<Result<UserCommand, String>> {
  let line = line.trim_end_matches(['\r', '\n']);
  if line.trim().is_empty() {
    return None;
  }
  // "//text" escapes a message that starts with a slash.
  if let Some(rest) = line.strip_prefix("//") {
    return Some(Ok(UserCommand::Text(format!("/{rest}"))));
  }
  let Some(command) = line.strip_prefix('/') else {
    return Some(Ok(UserCommand::Text(line.to_string())));
  };
  let (verb, arg) = match command.split_once(char::is_whitespace) {
    Some((verb, arg)) => (verb, arg.trim()),
    None => (command, ""),
  };
  let parsed = match (verb, arg) {
    ("send", "") => Err("usage: /send <path>".to_string()),
    ("send", path) => Ok(UserCommand::SendFile(PathBuf::from(path))),
    ("kick", "") => Err("usage: /kick <name|peerId>".to_string()),
    ("kick", target) => Ok(UserCommand::Kick(target.to_string())),
    ("who", _) => Ok(UserCommand::Who),
    ("leave" | "quit", _) => Ok(UserCommand::Leave),
    ("help", _) => Ok(UserCommand::Help),
    (other, _) => Err(format!("unknown command /{other}")),
  };
  Some(parsed)
}

pub fn log_line(label: &str, value: impl Display) {
  let now = chrono::Local::now().format("%H:%M:%S%.3f");
  println!("[{now}] {label}: {value}");
}
