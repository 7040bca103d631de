use bytes::Bytes;

use crate::protocol::command::Command;

/// A command held back by an open MULTI, with its original wire bytes so a
/// write can still be propagated byte-identically when EXEC runs it.
#[derive(Debug, Clone)]
pub struct QueuedCommand {
    pub command: Command,
    pub args: Vec<Bytes>,
    pub raw: Bytes,
}

/// Per-connection state. Transactions are session-scoped: MULTI on one
/// connection never affects another. A session becomes a replica link only
/// after a successful PSYNC, at which point it stops being request/response.
#[derive(Debug, Default)]
pub struct Session {
    pub in_multi: bool,
    pub queued: Vec<QueuedCommand>,
    pub is_replica_link: bool,
}

impl Session {
    pub fn new() -> Self {
        Self::default()
    }
}
