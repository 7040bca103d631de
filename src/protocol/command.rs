use std::fmt::Display;
use std::str::FromStr;

use anyhow::bail;
use bytes::Bytes;

use crate::protocol::resp::RESP;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    PING,
    ECHO,
    // storage commands
    SET,
    GET,
    INCR,
    DEL,
    TYPE,
    KEYS,
    // transactions
    MULTI,
    EXEC,
    DISCARD,
    // server commands
    INFO,
    CONFIG,
    COMMAND,
    // replication commands
    PSYNC,
    REPLCONF,
    WAIT,
    // stream commands
    XADD,
    XRANGE,
    XREAD,
}

impl Command {
    /// Command mutates the keyspace; on a primary its frame is forwarded to
    /// followers byte-for-byte.
    pub fn is_write(&self) -> bool {
        matches!(self, Command::SET | Command::INCR | Command::DEL)
    }

    /// Transaction control commands run even while a MULTI is open; anything
    /// else queues.
    pub fn is_transaction_control(&self) -> bool {
        matches!(self, Command::MULTI | Command::EXEC | Command::DISCARD)
    }
}

/// Split a request frame into its command name and arguments. Requests are
/// always arrays of bulk strings; anything else is a framing fault that
/// closes the connection, not a client error.
pub fn parse_request(message: &RESP) -> anyhow::Result<(String, Vec<Bytes>)> {
    let RESP::Array(items) = message else {
        bail!("request is not an array: {}", message);
    };
    let mut parts = Vec::with_capacity(items.len());
    for item in items {
        match item {
            RESP::Bulk(data) => parts.push(data.clone()),
            other => bail!("request argument is not a bulk string: {}", other),
        }
    }
    let Some((name, args)) = parts.split_first() else {
        bail!("empty request array");
    };
    let name = std::str::from_utf8(name)
        .map_err(|_| anyhow::anyhow!("command name is not valid utf-8"))?
        .to_string();
    Ok((name, args.to_vec()))
}

impl FromStr for Command {
    type Err = anyhow::Error;

    fn from_str(input: &str) -> anyhow::Result<Command, Self::Err> {
        match input.to_uppercase().as_str() {
            "PING" => Ok(Command::PING),
            "ECHO" => Ok(Command::ECHO),
            "SET" => Ok(Command::SET),
            "GET" => Ok(Command::GET),
            "INCR" => Ok(Command::INCR),
            "DEL" => Ok(Command::DEL),
            "TYPE" => Ok(Command::TYPE),
            "KEYS" => Ok(Command::KEYS),
            "MULTI" => Ok(Command::MULTI),
            "EXEC" => Ok(Command::EXEC),
            "DISCARD" => Ok(Command::DISCARD),
            "INFO" => Ok(Command::INFO),
            "CONFIG" => Ok(Command::CONFIG),
            "COMMAND" => Ok(Command::COMMAND),
            "PSYNC" => Ok(Command::PSYNC),
            "REPLCONF" => Ok(Command::REPLCONF),
            "WAIT" => Ok(Command::WAIT),
            "XADD" => Ok(Command::XADD),
            "XRANGE" => Ok(Command::XRANGE),
            "XREAD" => Ok(Command::XREAD),
            _ => bail!("unknown command: {}", input),
        }
    }
}

impl Display for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Command::PING => "PING",
            Command::ECHO => "ECHO",
            Command::SET => "SET",
            Command::GET => "GET",
            Command::INCR => "INCR",
            Command::DEL => "DEL",
            Command::TYPE => "TYPE",
            Command::KEYS => "KEYS",
            Command::MULTI => "MULTI",
            Command::EXEC => "EXEC",
            Command::DISCARD => "DISCARD",
            Command::INFO => "INFO",
            Command::CONFIG => "CONFIG",
            Command::COMMAND => "COMMAND",
            Command::PSYNC => "PSYNC",
            Command::REPLCONF => "REPLCONF",
            Command::WAIT => "WAIT",
            Command::XADD => "XADD",
            Command::XRANGE => "XRANGE",
            Command::XREAD => "XREAD",
        };
        write!(f, "{}", name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_name_and_args() {
        let frame = RESP::command(&["SET", "foo", "bar"]);
        let (name, args) = parse_request(&frame).unwrap();
        assert_eq!(name, "SET");
        assert_eq!(
            args,
            vec![Bytes::from_static(b"foo"), Bytes::from_static(b"bar")]
        );
    }

    #[test]
    fn command_names_are_case_insensitive() {
        assert_eq!("xadd".parse::<Command>().unwrap(), Command::XADD);
        assert_eq!("Replconf".parse::<Command>().unwrap(), Command::REPLCONF);
    }

    #[test]
    fn rejects_non_array_requests() {
        assert!(parse_request(&RESP::Int(1)).is_err());
        assert!(parse_request(&RESP::Array(vec![])).is_err());
        assert!(parse_request(&RESP::Array(vec![RESP::Int(1)])).is_err());
    }

    #[test]
    fn write_commands() {
        assert!(Command::SET.is_write());
        assert!(Command::INCR.is_write());
        assert!(Command::DEL.is_write());
        assert!(!Command::GET.is_write());
        assert!(!Command::XADD.is_write());
    }
}
