//! # Inbound Commands
//!
//! A client envelope is a JSON object whose keys are command names and whose
//! values are the arguments. Several commands may share one envelope; they are
//! decoded in the order the keys appear on the wire. Unknown names are skipped.
//!
//! `sudo` carries a privileged sub-command: `{"sudo": {"name": "ban", "arg": 12}}`.

use serde_json::{Map, Value};
use thiserror::Error;

use super::presence::Tab;
use super::ranklist::SessionId;

#[derive(Debug, Error, PartialEq)]
pub enum CommandError {
    #[error("{command}: expected {expected}")]
    BadArgument { command: &'static str, expected: &'static str },

    #[error("unknown sudo sub-command {0:?}")]
    UnknownSubCommand(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    /// Replace (or create) the sender's item text.
    Edit(String),
    /// Promoting vote for the item owned by a session.
    Vote(SessionId),
    Color(String),
    /// Announcement to everyone.
    Say(String),
    /// Discussion log line.
    Chat(String),
    /// Switch the part of the page the sender is looking at.
    Tab(Tab),
    Sudo(Privileged),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Privileged {
    /// Flag the sender's own item. Display only.
    Admin,
    Ban(SessionId),
    Pin(SessionId),
    Top(SessionId),
}

/// Decodes a raw envelope.
///
/// The outer error means the envelope itself is malformed. Each inner entry is
/// one recognised command, or the reason its argument was rejected.
pub fn decode_envelope(text: &str) -> Result<Vec<Result<Command, CommandError>>, serde_json::Error> {
    let envelope: Map<String, Value> = serde_json::from_str(text)?;
    Ok(envelope
        .iter()
        .filter_map(|(name, arg)| Command::decode(name, arg))
        .collect())
}

impl Command {
    /// `None` for names that are not commands.
    pub fn decode(name: &str, arg: &Value) -> Option<Result<Command, CommandError>> {
        let command = match name {
            "edit" => string_arg("edit", arg).map(Command::Edit),
            "vote" => session_arg("vote", arg).map(Command::Vote),
            "color" => string_arg("color", arg).map(Command::Color),
            "say" => string_arg("say", arg).map(Command::Say),
            "chat" => string_arg("chat", arg).map(Command::Chat),
            "tab" => arg
                .as_str()
                .and_then(Tab::parse)
                .map(Command::Tab)
                .ok_or(CommandError::BadArgument {
                    command: "tab",
                    expected: "one of story, chat, idle",
                }),
            "sudo" => Privileged::decode(arg).map(Command::Sudo),
            _ => return None,
        };
        Some(command)
    }
}

impl Privileged {
    fn decode(arg: &Value) -> Result<Privileged, CommandError> {
        let name = arg
            .get("name")
            .and_then(Value::as_str)
            .ok_or(CommandError::BadArgument {
                command: "sudo",
                expected: "an object with a string 'name'",
            })?;
        let sub_arg = arg.get("arg").unwrap_or(&Value::Null);
        match name {
            "admin" => Ok(Privileged::Admin),
            "ban" => session_arg("ban", sub_arg).map(Privileged::Ban),
            "pin" => session_arg("pin", sub_arg).map(Privileged::Pin),
            "top" => session_arg("top", sub_arg).map(Privileged::Top),
            other => Err(CommandError::UnknownSubCommand(other.to_string())),
        }
    }
}

fn string_arg(command: &'static str, arg: &Value) -> Result<String, CommandError> {
    arg.as_str().map(str::to_string).ok_or(CommandError::BadArgument {
        command,
        expected: "a string",
    })
}

fn session_arg(command: &'static str, arg: &Value) -> Result<SessionId, CommandError> {
    arg.as_u64().ok_or(CommandError::BadArgument {
        command,
        expected: "a session id",
    })
}

/// Item text: at most `max` characters, only `!`..DEL.
pub fn sanitize_word(text: &str, max: usize) -> String {
    text.chars().take(max).filter(|c| ('\x21'..='\x7f').contains(c)).collect()
}

/// Chat text: at most `max` characters, only space..DEL.
pub fn sanitize_line(text: &str, max: usize) -> String {
    text.chars().take(max).filter(|c| ('\x20'..='\x7f').contains(c)).collect()
}

/// `#rrggbb`
pub fn is_hex_color(color: &str) -> bool {
    color.len() == 7 && color.starts_with('#') && color[1..].chars().all(|c| c.is_ascii_hexdigit())
}
