//! Wire format
//!
//! The client opens with two lines, the path ID (or an absolute,
//! percent-encoded path) and the required tag (empty for none):
//!
//! ```text
//! 3141592653\n
//! Team Project\n
//! ```
//!
//! The server answers with the resolved data path, `true`/`false` for the
//! tag check, and the settings as one JSON line. After that the client sends
//! commands, a keyword line followed by one line per argument, and the
//! server sends [`ServerMessage`]s, one JSON document per line.

use std::collections::BTreeMap;
use std::io::{BufRead, Write};

use dashstore_core::DataEvent;
use serde::{Deserialize, Serialize};

use crate::error::{RemoteError, RemoteResult};

/// Default server port.
pub const DEFAULT_PORT: u16 = 2467;

/// Data path given to clients whose ID resolves to nothing.
pub const ANONYMOUS_PATH: &str = "//anonymous//";

/// `putValue` payload asking the server to restore the inherited default.
pub const RESTORE_DEFAULT_TOKEN: &str = "@@@restore_default";

/// Separates lines inside a `logMessage` payload.
pub const LOG_LINE_SEPARATOR: char = '\u{1}';

/// Client-to-server requests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    PutValue { name: String, value: String },
    RemoveValue { name: String },
    MaybeCreateValue { name: String, value: String, prefix: String },
    AddDataListener { name: String },
    RemoveDataListener { name: String },
    ListDataNames { prefix: String },
    LogMessage { text: String },
    Quit,
}

impl Command {
    pub fn keyword(&self) -> &'static str {
        match self {
            Command::PutValue { .. } => "putValue",
            Command::RemoveValue { .. } => "removeValue",
            Command::MaybeCreateValue { .. } => "maybeCreateValue",
            Command::AddDataListener { .. } => "addDataListener",
            Command::RemoveDataListener { .. } => "removeDataListener",
            Command::ListDataNames { .. } => "listDataNames",
            Command::LogMessage { .. } => "logMessage",
            Command::Quit => "quit",
        }
    }

    fn arguments(&self) -> Vec<&str> {
        match self {
            Command::PutValue { name, value } => vec![name.as_str(), value.as_str()],
            Command::RemoveValue { name } | Command::AddDataListener { name } | Command::RemoveDataListener { name } => {
                vec![name.as_str()]
            }
            Command::MaybeCreateValue { name, value, prefix } => vec![name.as_str(), value.as_str(), prefix.as_str()],
            Command::ListDataNames { prefix } => vec![prefix.as_str()],
            Command::LogMessage { text } => vec![text.as_str()],
            Command::Quit => Vec::new(),
        }
    }

    /// Write the command and flush.
    pub fn write_to(&self, out: &mut impl Write) -> RemoteResult<()> {
        let mut frame = String::from(self.keyword());
        frame.push('\n');
        for arg in self.arguments() {
            if arg.contains('\n') {
                return Err(RemoteError::Protocol(format!("{} argument contains a newline", self.keyword())));
            }
            frame.push_str(arg);
            frame.push('\n');
        }
        out.write_all(frame.as_bytes())?;
        out.flush()?;
        Ok(())
    }

    /// Read one command. `None` means the peer closed the stream.
    pub fn read_from(input: &mut impl BufRead) -> RemoteResult<Option<Command>> {
        let Some(keyword) = read_line(input)? else {
            return Ok(None);
        };
        let mut arg = || read_line(input)?.ok_or(RemoteError::Disconnected);
        let command = match keyword.as_str() {
            "putValue" => Command::PutValue { name: arg()?, value: arg()? },
            "removeValue" => Command::RemoveValue { name: arg()? },
            "maybeCreateValue" => Command::MaybeCreateValue { name: arg()?, value: arg()?, prefix: arg()? },
            "addDataListener" => Command::AddDataListener { name: arg()? },
            "removeDataListener" => Command::RemoveDataListener { name: arg()? },
            "listDataNames" => Command::ListDataNames { prefix: arg()? },
            "logMessage" => Command::LogMessage { text: arg()? },
            "quit" => Command::Quit,
            other => return Err(RemoteError::Protocol(format!("unknown command {:?}", other))),
        };
        Ok(Some(command))
    }
}

/// Client greeting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    pub id: String,
    pub required_tag: String,
}

impl Handshake {
    pub fn write_to(&self, out: &mut impl Write) -> RemoteResult<()> {
        write!(out, "{}\n{}\n", self.id, self.required_tag)?;
        out.flush()?;
        Ok(())
    }

    pub fn read_from(input: &mut impl BufRead) -> RemoteResult<Handshake> {
        let id = read_line(input)?.ok_or(RemoteError::Disconnected)?;
        let required_tag = read_line(input)?.ok_or(RemoteError::Disconnected)?;
        Ok(Handshake { id, required_tag })
    }
}

/// Server reply to the greeting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Welcome {
    pub data_path: String,
    pub tag_present: bool,
    pub settings: BTreeMap<String, String>,
}

impl Welcome {
    pub fn write_to(&self, out: &mut impl Write) -> RemoteResult<()> {
        let settings = serde_json::to_string(&self.settings)?;
        write!(out, "{}\n{}\n{}\n", self.data_path, self.tag_present, settings)?;
        out.flush()?;
        Ok(())
    }

    pub fn read_from(input: &mut impl BufRead) -> RemoteResult<Welcome> {
        let data_path = read_line(input)?.ok_or(RemoteError::Disconnected)?;
        let tag_present = match read_line(input)?.as_deref() {
            Some("true") => true,
            Some("false") => false,
            Some(other) => return Err(RemoteError::Protocol(format!("expected true/false, got {:?}", other))),
            None => return Err(RemoteError::Disconnected),
        };
        let settings = read_line(input)?.ok_or(RemoteError::Disconnected)?;
        Ok(Welcome { data_path, tag_present, settings: serde_json::from_str(&settings)? })
    }
}

/// Server-to-client messages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "body")]
pub enum ServerMessage {
    /// Changes to subscribed names, one batch per notification pass
    Events(Vec<DataEvent>),
    /// Reply to `listDataNames`
    Names(Vec<String>),
}

impl ServerMessage {
    pub fn write_to(&self, out: &mut impl Write) -> RemoteResult<()> {
        let mut line = serde_json::to_string(self)?;
        line.push('\n');
        out.write_all(line.as_bytes())?;
        out.flush()?;
        Ok(())
    }

    /// Read one message. `None` means the server closed the stream.
    pub fn read_from(input: &mut impl BufRead) -> RemoteResult<Option<ServerMessage>> {
        match read_line(input)? {
            Some(line) => Ok(Some(serde_json::from_str(&line)?)),
            None => Ok(None),
        }
    }
}

/// One line without its terminator. `None` at end of stream.
pub fn read_line(input: &mut impl BufRead) -> RemoteResult<Option<String>> {
    let mut line = String::new();
    if input.read_line(&mut line)? == 0 {
        return Ok(None);
    }
    if line.ends_with('\n') {
        line.pop();
        if line.ends_with('\r') {
            line.pop();
        }
    }
    Ok(Some(line))
}

/// Decode `%XX` escapes and `+` in an absolute path ID.
pub fn percent_decode(text: &str) -> String {
    let bytes = text.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'+' => out.push(b' '),
            b'%' if i + 2 < bytes.len() => {
                let hex = |b: u8| (b as char).to_digit(16);
                match (hex(bytes[i + 1]), hex(bytes[i + 2])) {
                    (Some(hi), Some(lo)) => {
                        out.push((hi * 16 + lo) as u8);
                        i += 2;
                    }
                    _ => out.push(b'%'),
                }
            }
            b => out.push(b),
        }
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use dashstore_core::Value;
    use std::io::Cursor;

    #[test]
    fn test_command_framing() {
        let mut buf = Vec::new();
        Command::MaybeCreateValue { name: "Size".into(), value: "10".into(), prefix: "/p".into() }
            .write_to(&mut buf)
            .unwrap();
        Command::Quit.write_to(&mut buf).unwrap();
        assert_eq!(String::from_utf8(buf.clone()).unwrap(), "maybeCreateValue\nSize\n10\n/p\nquit\n");

        let mut input = Cursor::new(buf);
        assert_eq!(
            Command::read_from(&mut input).unwrap(),
            Some(Command::MaybeCreateValue { name: "Size".into(), value: "10".into(), prefix: "/p".into() })
        );
        assert_eq!(Command::read_from(&mut input).unwrap(), Some(Command::Quit));
        assert_eq!(Command::read_from(&mut input).unwrap(), None);
    }

    #[test]
    fn test_truncated_command_is_disconnect() {
        let mut input = Cursor::new(b"putValue\n/p/A\n".to_vec());
        assert!(matches!(Command::read_from(&mut input), Err(RemoteError::Disconnected)));
    }

    #[test]
    fn test_unknown_command() {
        let mut input = Cursor::new(b"dropTables\n".to_vec());
        assert!(matches!(Command::read_from(&mut input), Err(RemoteError::Protocol(_))));
    }

    #[test]
    fn test_newline_in_argument_rejected() {
        let mut buf = Vec::new();
        let cmd = Command::PutValue { name: "A".into(), value: "\"two\nlines".into() };
        assert!(matches!(cmd.write_to(&mut buf), Err(RemoteError::Protocol(_))));
    }

    #[test]
    fn test_welcome_exchange() {
        let welcome = Welcome {
            data_path: "/proj".into(),
            tag_present: false,
            settings: BTreeMap::from([("http.port".to_string(), "2468".to_string())]),
        };
        let mut buf = Vec::new();
        welcome.write_to(&mut buf).unwrap();
        assert!(String::from_utf8(buf.clone()).unwrap().starts_with("/proj\nfalse\n{"));
        assert_eq!(Welcome::read_from(&mut Cursor::new(buf)).unwrap(), welcome);
    }

    #[test]
    fn test_server_message_lines() {
        let msg = ServerMessage::Events(vec![DataEvent::value_changed("/p/A", Some(Value::number(2.5)))]);
        let mut buf = Vec::new();
        msg.write_to(&mut buf).unwrap();
        ServerMessage::Names(vec!["/p/A".into()]).write_to(&mut buf).unwrap();

        let mut input = Cursor::new(buf);
        match ServerMessage::read_from(&mut input).unwrap() {
            Some(ServerMessage::Events(events)) => assert_eq!(events[0].value, Some(Value::number(2.5))),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(ServerMessage::read_from(&mut input).unwrap(), Some(ServerMessage::Names(vec!["/p/A".into()])));
        assert_eq!(ServerMessage::read_from(&mut input).unwrap(), None);
    }

    #[test]
    fn test_percent_decode() {
        assert_eq!(percent_decode("/Project/My%20Thing+x"), "/Project/My Thing x");
        assert_eq!(percent_decode("/a%2"), "/a%2");
        assert_eq!(percent_decode("/a%zz"), "/a%zz");
    }
}
