use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant, SystemTime};

use bytes::Bytes;
use rand::distributions::Alphanumeric;
use rand::Rng;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::args::{named_option, named_option_list};
use crate::config::Config;
use crate::protocol::command::Command;
use crate::protocol::rdb;
use crate::protocol::resp::RESP;
use crate::session::{QueuedCommand, Session};
use crate::store::KvStore;
use crate::stream::{
    new_listener, EntryFields, EntryIdSpec, StreamEntryId, StreamEvent, StreamIdError, StreamStore,
};

/// Client-visible errors. `Display` is the exact wire text after the `-`.
#[derive(Debug, Error)]
pub enum CommandError {
    #[error("ERR wrong number of arguments for '{0}'")]
    WrongArgs(&'static str),
    #[error("ERR value is not an integer or out of range")]
    NotInteger,
    #[error("ERR EXEC without MULTI")]
    ExecWithoutMulti,
    #[error("ERR DISCARD without MULTI")]
    DiscardWithoutMulti,
    #[error("ERR unknown command '{0}'")]
    UnknownCommand(String),
    #[error("{0}")]
    Stream(#[from] StreamIdError),
    #[error("ERR internal error")]
    Internal,
}

/// What one request produced: the replies for this connection, and the raw
/// frames of any successful writes for follower propagation. EXEC can carry
/// several propagated frames behind a single reply.
pub struct Outcome {
    pub replies: Vec<RESP>,
    pub propagate: Vec<Bytes>,
}

impl Outcome {
    fn reply(reply: RESP) -> Self {
        Self {
            replies: vec![reply],
            propagate: Vec::new(),
        }
    }
}

/// Command execution over the shared keyspace. Cloning shares the stores and
/// the replication counters; every connection worker holds one.
#[derive(Clone)]
pub struct Executor {
    config: Arc<Config>,
    kv: Arc<RwLock<KvStore>>,
    streams: Arc<RwLock<StreamStore>>,
    replid: String,
    /// On a primary: bytes of propagated write frames. On a follower: bytes
    /// of replication frames processed since the RDB transfer.
    pub(crate) repl_offset: Arc<AtomicU64>,
}

impl Executor {
    pub fn new(config: Arc<Config>) -> Self {
        let executor = Executor {
            config,
            kv: Arc::new(RwLock::new(KvStore::new())),
            streams: Arc::new(RwLock::new(StreamStore::new())),
            replid: generate_replid(),
            repl_offset: Arc::new(AtomicU64::new(0)),
        };
        executor.restore_snapshot();
        executor
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn is_master(&self) -> bool {
        self.config.is_master()
    }

    pub fn replid(&self) -> &str {
        &self.replid
    }

    pub fn current_offset(&self) -> u64 {
        self.repl_offset.load(Ordering::SeqCst)
    }

    /// Restore discipline: a missing file starts an empty keyspace, any other
    /// fault is logged and restore is skipped. None of these are fatal.
    fn restore_snapshot(&self) {
        let Some(path) = self.config.rdb_path() else {
            return;
        };
        let buf = match std::fs::read(&path) {
            Ok(buf) => buf,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                debug!("no RDB file at {:?}, starting empty", path);
                return;
            }
            Err(err) => {
                warn!("failed to read RDB file {:?}: {}; starting empty", path, err);
                return;
            }
        };
        match rdb::decode(&buf) {
            Ok(snapshot) => {
                debug!("RDB aux fields: {:?}", snapshot.aux);
                let restored = self.kv.write().unwrap().restore(snapshot);
                info!("restored {} keys from {:?}", restored, path);
            }
            Err(err) => {
                warn!("RDB restore aborted ({}); starting empty", err);
            }
        }
    }

    /// Apply the snapshot a primary ships during FULLRESYNC. A rejected
    /// snapshot leaves the keyspace as-is; command propagation still follows.
    pub fn load_snapshot_bytes(&self, buf: &[u8]) {
        match rdb::decode(buf) {
            Ok(snapshot) => {
                let restored = self.kv.write().unwrap().restore(snapshot);
                debug!("applied replication snapshot: {} keys", restored);
            }
            Err(err) => {
                warn!("replication snapshot rejected: {}", err);
            }
        }
    }

    /// Dispatch one request frame over its session. Transaction queueing
    /// happens here; everything the session is not holding back goes through
    /// `execute`.
    pub fn handle_command(
        &self,
        session: &mut Session,
        command: Command,
        args: &[Bytes],
        raw: &Bytes,
    ) -> Outcome {
        if session.in_multi && !command.is_transaction_control() {
            session.queued.push(QueuedCommand {
                command,
                args: args.to_vec(),
                raw: raw.clone(),
            });
            return Outcome::reply(RESP::String("QUEUED".to_string()));
        }
        match command {
            Command::MULTI => {
                // nested MULTI is a no-op OK
                session.in_multi = true;
                Outcome::reply(RESP::String("OK".to_string()))
            }
            Command::EXEC => {
                if !session.in_multi {
                    return Outcome::reply(RESP::Error(
                        CommandError::ExecWithoutMulti.to_string(),
                    ));
                }
                session.in_multi = false;
                let queued = std::mem::take(&mut session.queued);
                let mut replies = Vec::with_capacity(queued.len());
                let mut propagate = Vec::new();
                for entry in queued {
                    let reply = self.execute(entry.command, &entry.args);
                    if entry.command.is_write() && !matches!(reply, RESP::Error(_)) {
                        propagate.push(entry.raw);
                    }
                    replies.push(reply);
                }
                Outcome {
                    replies: vec![RESP::Array(replies)],
                    propagate,
                }
            }
            Command::DISCARD => {
                if !session.in_multi {
                    return Outcome::reply(RESP::Error(
                        CommandError::DiscardWithoutMulti.to_string(),
                    ));
                }
                session.in_multi = false;
                session.queued.clear();
                Outcome::reply(RESP::String("OK".to_string()))
            }
            _ => {
                let reply = self.execute(command, args);
                let mut outcome = Outcome::reply(reply);
                if command.is_write() && !matches!(outcome.replies[0], RESP::Error(_)) {
                    outcome.propagate.push(raw.clone());
                }
                outcome
            }
        }
    }

    /// Run one command to a single reply; client errors fold into `-ERR`
    /// frames and never unwind the connection.
    pub fn execute(&self, command: Command, args: &[Bytes]) -> RESP {
        match self.run(command, args) {
            Ok(reply) => reply,
            Err(err) => RESP::Error(err.to_string()),
        }
    }

    fn run(&self, command: Command, args: &[Bytes]) -> Result<RESP, CommandError> {
        match (command, args) {
            (Command::PING, _) => Ok(RESP::String("PONG".to_string())),
            (Command::ECHO, [message]) => Ok(RESP::Bulk(message.clone())),
            (Command::SET, [key, value, options @ ..]) => {
                let key = utf8(key)?;
                // PX is the only option; anything else is rejected, not dropped
                let expires_at = match options {
                    [] => None,
                    [name, ms] if name.eq_ignore_ascii_case(b"PX") => {
                        let ms = std::str::from_utf8(ms)
                            .ok()
                            .and_then(|s| s.parse::<u64>().ok())
                            .ok_or(CommandError::NotInteger)?;
                        Some(SystemTime::now() + Duration::from_millis(ms))
                    }
                    _ => return Err(CommandError::WrongArgs("set")),
                };
                // SET replaces any prior binding, a stream one included
                self.streams.write().unwrap().remove(&key);
                self.kv.write().unwrap().set(&key, value.clone(), expires_at);
                Ok(RESP::String("OK".to_string()))
            }
            (Command::GET, [key]) => {
                let key = utf8(key)?;
                // lazy expiry removes on read, so reads take the write lock
                Ok(self
                    .kv
                    .write()
                    .unwrap()
                    .get(&key)
                    .map_or(RESP::Null, RESP::Bulk))
            }
            (Command::INCR, [key]) => {
                let key = utf8(key)?;
                let mut kv = self.kv.write().unwrap();
                let next = match kv.get(&key) {
                    None => {
                        kv.set(&key, Bytes::from_static(b"1"), None);
                        1
                    }
                    Some(current) => {
                        let current = std::str::from_utf8(&current)
                            .ok()
                            .and_then(|s| s.parse::<i64>().ok())
                            .ok_or(CommandError::NotInteger)?;
                        let next = current.checked_add(1).ok_or(CommandError::NotInteger)?;
                        kv.update(&key, Bytes::from(next.to_string().into_bytes()))
                            .map_err(|_| CommandError::Internal)?;
                        next
                    }
                };
                Ok(RESP::Int(next))
            }
            (Command::DEL, keys) if !keys.is_empty() => {
                let mut removed = 0;
                for key in keys {
                    let key = utf8(key)?;
                    let had_string = self.kv.write().unwrap().delete(&key);
                    let had_stream = self.streams.write().unwrap().remove(&key);
                    if had_string || had_stream {
                        removed += 1;
                    }
                }
                Ok(RESP::Int(removed))
            }
            (Command::KEYS, [pattern]) => {
                let pattern = utf8(pattern)?;
                let keys = self.kv.read().unwrap().keys_matching(&pattern);
                Ok(RESP::Array(keys.iter().map(RESP::bulk).collect()))
            }
            (Command::TYPE, [key]) => {
                let key = utf8(key)?;
                let type_name = if self.kv.read().unwrap().contains_live(&key) {
                    "string"
                } else if self.streams.read().unwrap().contains(&key) {
                    "stream"
                } else {
                    "none"
                };
                Ok(RESP::String(type_name.to_string()))
            }
            (Command::CONFIG, [action, key]) => {
                let action = utf8(action)?;
                if !action.eq_ignore_ascii_case("GET") {
                    return Err(CommandError::WrongArgs("config"));
                }
                let key = utf8(key)?.to_lowercase();
                let value = match key.as_str() {
                    "dir" => Some(self.config.dir_value()),
                    "dbfilename" => Some(self.config.dbfilename.clone()),
                    _ => None,
                };
                Ok(match value {
                    Some(value) => {
                        RESP::Array(vec![RESP::bulk(&key), RESP::bulk(&value)])
                    }
                    None => RESP::Array(vec![]),
                })
            }
            (Command::INFO, rest) if rest.len() <= 1 => {
                let section = match rest.first() {
                    Some(section) => utf8(section)?.to_lowercase(),
                    None => "replication".to_string(),
                };
                if section != "replication" {
                    return Ok(RESP::bulk(""));
                }
                let role = if self.is_master() { "master" } else { "slave" };
                let mut info = format!("# Replication\r\nrole:{}\r\n", role);
                if self.is_master() {
                    info.push_str(&format!("master_replid:{}\r\n", self.replid));
                }
                info.push_str(&format!("master_repl_offset:{}\r\n", self.current_offset()));
                Ok(RESP::bulk(&info))
            }
            (Command::COMMAND, _) => Ok(RESP::Array(vec![])),
            (Command::XADD, [key, id, pairs @ ..])
                if !pairs.is_empty() && pairs.len() % 2 == 0 =>
            {
                let key = utf8(key)?;
                let id_spec = EntryIdSpec::parse(&utf8(id)?)?;
                let fields: EntryFields = pairs
                    .chunks(2)
                    .map(|pair| (pair[0].clone(), pair[1].clone()))
                    .collect();
                let id = self.streams.write().unwrap().append(&key, &id_spec, fields)?;
                Ok(RESP::bulk(id.to_string()))
            }
            (Command::XRANGE, [key, lo, hi]) => {
                let key = utf8(key)?;
                let lo = StreamEntryId::parse_range_start(&utf8(lo)?)?;
                let hi = StreamEntryId::parse_range_end(&utf8(hi)?)?;
                let entries = self.streams.read().unwrap().range(&key, lo, hi);
                Ok(RESP::Array(entries.iter().map(encode_entry).collect()))
            }
            (Command::XREAD, rest) => self.xread(rest),
            // REPLCONF outside a replication-aware connection is acknowledged
            // and otherwise ignored
            (Command::REPLCONF, _) => Ok(RESP::String("OK".to_string())),
            (Command::PSYNC | Command::WAIT, _) => Err(CommandError::Internal),
            _ => Err(CommandError::WrongArgs(command_name(command))),
        }
    }

    /// Multi-key stream read. The blocking form snapshots the start ids,
    /// parks on a listener and is woken by the first relevant append; the
    /// stores stay unlocked while parked.
    fn xread(&self, args: &[Bytes]) -> Result<RESP, CommandError> {
        let block_ms =
            named_option::<u64>(args, "BLOCK").map_err(|_| CommandError::NotInteger)?;
        let Some(spec_args) = named_option_list(args, "STREAMS") else {
            return Err(CommandError::WrongArgs("xread"));
        };
        if spec_args.is_empty() || spec_args.len() % 2 != 0 {
            return Err(CommandError::WrongArgs("xread"));
        }
        let (keys_raw, ids_raw) = spec_args.split_at(spec_args.len() / 2);
        let mut keys = Vec::with_capacity(keys_raw.len());
        for key in keys_raw {
            keys.push(utf8(key)?);
        }

        // start ids resolve once, at call time: `$` is the current top
        let mut starts = Vec::with_capacity(keys.len());
        {
            let streams = self.streams.read().unwrap();
            for (key, id) in keys.iter().zip(ids_raw) {
                let id = utf8(id)?;
                let start = if id == "$" {
                    streams.top_id(key)
                } else {
                    id.parse::<StreamEntryId>()?
                };
                starts.push(start);
            }
        }

        if let Some(reply) = self.gather_xread(&keys, &starts) {
            return Ok(reply);
        }
        let Some(block_ms) = block_ms else {
            return Ok(RESP::Null);
        };

        let deadline = (block_ms > 0).then(|| Instant::now() + Duration::from_millis(block_ms));
        let listener = new_listener();
        self.streams.write().unwrap().subscribe(&keys, &listener);
        // an append may have landed between the first check and the
        // subscription; look again before parking
        if let Some(reply) = self.gather_xread(&keys, &starts) {
            return Ok(reply);
        }

        let is_relevant = |event: &StreamEvent| {
            keys.iter()
                .zip(&starts)
                .any(|(key, start)| key == &event.0 && event.1 > *start)
        };
        let (slot, cvar) = &*listener;
        let mut event = slot.lock().unwrap();
        while !event.as_ref().map_or(false, is_relevant) {
            match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Ok(RESP::Null);
                    }
                    let (guard, _) = cvar.wait_timeout(event, deadline - now).unwrap();
                    event = guard;
                }
                None => {
                    event = cvar.wait(event).unwrap();
                }
            }
        }
        drop(event);

        Ok(self.gather_xread(&keys, &starts).unwrap_or(RESP::Null))
    }

    fn gather_xread(&self, keys: &[String], starts: &[StreamEntryId]) -> Option<RESP> {
        let streams = self.streams.read().unwrap();
        let mut results = Vec::new();
        for (key, start) in keys.iter().zip(starts) {
            let entries = streams.read_since(key, *start);
            if entries.is_empty() {
                continue;
            }
            results.push(RESP::Array(vec![
                RESP::bulk(key),
                RESP::Array(entries.iter().map(encode_entry).collect()),
            ]));
        }
        if results.is_empty() {
            None
        } else {
            Some(RESP::Array(results))
        }
    }
}

/// `[id, [field, value, field, value, ...]]`, the entry shape shared by
/// XRANGE and XREAD replies.
fn encode_entry((id, fields): &(StreamEntryId, EntryFields)) -> RESP {
    let mut flat = Vec::with_capacity(fields.len() * 2);
    for (name, value) in fields {
        flat.push(RESP::Bulk(name.clone()));
        flat.push(RESP::Bulk(value.clone()));
    }
    RESP::Array(vec![RESP::bulk(id.to_string()), RESP::Array(flat)])
}

fn utf8(arg: &Bytes) -> Result<String, CommandError> {
    std::str::from_utf8(arg)
        .map(str::to_string)
        .map_err(|_| CommandError::Internal)
}

fn command_name(command: Command) -> &'static str {
    match command {
        Command::PING => "ping",
        Command::ECHO => "echo",
        Command::SET => "set",
        Command::GET => "get",
        Command::INCR => "incr",
        Command::DEL => "del",
        Command::TYPE => "type",
        Command::KEYS => "keys",
        Command::MULTI => "multi",
        Command::EXEC => "exec",
        Command::DISCARD => "discard",
        Command::INFO => "info",
        Command::CONFIG => "config",
        Command::COMMAND => "command",
        Command::PSYNC => "psync",
        Command::REPLCONF => "replconf",
        Command::WAIT => "wait",
        Command::XADD => "xadd",
        Command::XRANGE => "xrange",
        Command::XREAD => "xread",
    }
}

fn generate_replid() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(40)
        .map(char::from)
        .collect()
}
