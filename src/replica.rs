use std::sync::atomic::Ordering;
use std::thread;
use std::time::Duration;

use anyhow::Result;
use bytes::Bytes;
use tracing::{debug, error, info, warn};

use crate::client::MasterClient;
use crate::connection::ConnectionHandler;
use crate::executor::{CommandError, Executor};
use crate::net::{Binding, Port};
use crate::protocol::command::{parse_request, Command};
use crate::protocol::resp::{RespConnection, RESP};
use crate::session::Session;

const READONLY_ERROR: &str = "READONLY You can't write against a read only replica";

/// A normal client connection served by a follower: reads work as usual,
/// writes are rejected, replication control does not apply here.
pub struct ReplicaConnection {
    executor: Executor,
    session: Session,
}

impl ReplicaConnection {
    pub fn new(executor: Executor) -> Self {
        Self {
            executor,
            session: Session::new(),
        }
    }
}

impl ConnectionHandler for ReplicaConnection {
    fn handle_message(&mut self, connection: &mut RespConnection) -> Result<()> {
        let (raw, frame) = connection.read_frame()?;
        let (name, args) = parse_request(&frame)?;
        let Ok(command) = name.parse::<Command>() else {
            let err = CommandError::UnknownCommand(name);
            connection.send_frame(&RESP::Error(err.to_string()))?;
            return Ok(());
        };
        if command.is_write() {
            connection.send_frame(&RESP::Error(READONLY_ERROR.to_string()))?;
            return Ok(());
        }
        let outcome = self
            .executor
            .handle_command(&mut self.session, command, &args, &raw);
        connection.send_frames(&outcome.replies)?;
        Ok(())
    }
}

/// Spawn the replication thread: handshake with the primary, consume the
/// snapshot, then apply its write stream forever. A failure during the
/// initial handshake is fatal for the process; a link that drops later is
/// re-established with backoff.
pub fn start_replication(executor: Executor, master: Binding, listen_port: Port) -> Result<()> {
    let thread_name = format!("replica-master-{}", master);
    thread::Builder::new().name(thread_name).spawn(move || {
        let mut client = match handshake(&executor, &master, listen_port) {
            Ok(client) => client,
            Err(err) => {
                error!("replication handshake with {} failed: {}", master, err);
                std::process::exit(1);
            }
        };
        loop {
            if let Err(err) = apply_loop(&executor, &mut client) {
                warn!("replication link to {} dropped: {}", master, err);
            }
            client = loop {
                thread::sleep(Duration::from_secs(2));
                match handshake(&executor, &master, listen_port) {
                    Ok(client) => break client,
                    Err(err) => warn!("reconnect to {} failed: {}", master, err),
                }
            };
        }
    })?;
    Ok(())
}

fn handshake(executor: &Executor, master: &Binding, listen_port: Port) -> Result<MasterClient> {
    let mut client = MasterClient::connect(master)?;
    client.ping_pong()?;
    client.replconf(&["listening-port", &listen_port.to_string()])?;
    client.replconf(&["capa", "psync2"])?;
    let rdb = client.psync("?", -1)?;
    executor.load_snapshot_bytes(&rdb);
    // processed bytes count from the end of the snapshot transfer
    executor.repl_offset.store(0, Ordering::SeqCst);
    info!(
        "replication initialised with master {} ({} byte snapshot)",
        master,
        rdb.len()
    );
    Ok(client)
}

/// The inverse pipeline: read frames off the single upstream link, count
/// their bytes, apply writes locally, and never reply except to GETACK.
fn apply_loop(executor: &Executor, client: &mut MasterClient) -> Result<()> {
    loop {
        let (raw, frame) = client.read_frame()?;
        let (name, args) = parse_request(&frame)?;
        let Ok(command) = name.parse::<Command>() else {
            debug!("ignoring unknown replicated command {}", name);
            executor.repl_offset.fetch_add(raw.len() as u64, Ordering::SeqCst);
            continue;
        };

        if command == Command::REPLCONF && is_getack(&args) {
            // the ACK reports bytes processed before this GETACK frame; its
            // own bytes count only after the reply is out
            let processed = executor.current_offset();
            client.send_frame(&RESP::command(&["REPLCONF", "ACK", &processed.to_string()]))?;
            executor.repl_offset.fetch_add(raw.len() as u64, Ordering::SeqCst);
            debug!("acked {} processed bytes", processed);
            continue;
        }

        executor.repl_offset.fetch_add(raw.len() as u64, Ordering::SeqCst);
        if command.is_write() {
            let reply = executor.execute(command, &args);
            debug!("applied {} from master: {}", command, reply);
        } else if command != Command::PING {
            // PING is a counted heartbeat; anything else non-write is noise
            debug!("ignoring replicated {}", command);
        }
    }
}

fn is_getack(args: &[Bytes]) -> bool {
    args.first()
        .map_or(false, |sub| sub.eq_ignore_ascii_case(b"GETACK"))
}
