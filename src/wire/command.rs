//! Envelope command identifiers

use std::fmt;

/// Width of the command field in the envelope header
pub const COMMAND_SIZE: usize = 12;

/// Known envelope commands
///
/// Anything we don't recognise maps to `Unknown`; peers routinely send
/// commands we have no handler for and that must never be an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    Version,
    Verack,
    Ping,
    Pong,
    GetAddr,
    Addr,
    Inv,
    GetHeaders,
    SendHeaders,
    Headers,
    SendCmpct,
    FeeFilter,
    ProtoConf,
    XVersion,
    XVerack,
    Unknown,
}

impl Command {
    pub const ALL: [Command; 15] = [
        Command::Version,
        Command::Verack,
        Command::Ping,
        Command::Pong,
        Command::GetAddr,
        Command::Addr,
        Command::Inv,
        Command::GetHeaders,
        Command::SendHeaders,
        Command::Headers,
        Command::SendCmpct,
        Command::FeeFilter,
        Command::ProtoConf,
        Command::XVersion,
        Command::XVerack,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Command::Version => "version",
            Command::Verack => "verack",
            Command::Ping => "ping",
            Command::Pong => "pong",
            Command::GetAddr => "getaddr",
            Command::Addr => "addr",
            Command::Inv => "inv",
            Command::GetHeaders => "getheaders",
            Command::SendHeaders => "sendheaders",
            Command::Headers => "headers",
            Command::SendCmpct => "sendcmpct",
            Command::FeeFilter => "feefilter",
            Command::ProtoConf => "protoconf",
            Command::XVersion => "xversion",
            Command::XVerack => "xverack",
            Command::Unknown => "unknown",
        }
    }

    pub fn from_name(name: &str) -> Self {
        Self::ALL
            .iter()
            .copied()
            .find(|c| c.name() == name)
            .unwrap_or(Command::Unknown)
    }

    /// Parse the raw 12-byte field, stripping NUL and whitespace padding
    pub fn from_field(field: &[u8; COMMAND_SIZE]) -> Self {
        let end = field
            .iter()
            .rposition(|b| *b != 0 && !b.is_ascii_whitespace())
            .map_or(0, |i| i + 1);
        match std::str::from_utf8(&field[..end]) {
            Ok(name) => Self::from_name(name.trim()),
            Err(_) => Command::Unknown,
        }
    }

    /// NUL-padded 12-byte field
    pub fn to_field(&self) -> [u8; COMMAND_SIZE] {
        let mut field = [0u8; COMMAND_SIZE];
        let name = self.name().as_bytes();
        field[..name.len()].copy_from_slice(name);
        field
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_field_padding() {
        let field = Command::GetHeaders.to_field();
        assert_eq!(&field[..10], b"getheaders");
        assert_eq!(&field[10..], &[0, 0]);
        assert_eq!(Command::from_field(&field), Command::GetHeaders);
    }

    #[test]
    fn test_every_command_round_trips() {
        for command in Command::ALL {
            assert_eq!(Command::from_field(&command.to_field()), command);
        }
    }

    #[test]
    fn test_unknown_and_space_padding() {
        let mut field = [b' '; COMMAND_SIZE];
        field[..4].copy_from_slice(b"ping");
        assert_eq!(Command::from_field(&field), Command::Ping);

        let mut field = [0u8; COMMAND_SIZE];
        field[..7].copy_from_slice(b"mempool");
        assert_eq!(Command::from_field(&field), Command::Unknown);

        let field = [0xFFu8; COMMAND_SIZE];
        assert_eq!(Command::from_field(&field), Command::Unknown);
    }
}
