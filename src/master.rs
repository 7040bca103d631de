use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use anyhow::{bail, Result};
use bytes::Bytes;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::connection::ConnectionHandler;
use crate::executor::{CommandError, Executor};
use crate::net::{Binding, Port};
use crate::protocol::command::{parse_request, Command};
use crate::protocol::rdb::empty_rdb;
use crate::protocol::resp::{RespConnection, RESP};
use crate::session::Session;

enum FollowerMessage {
    /// Raw write frame to forward; no response expected.
    Propagate(Bytes),
    /// Probe the follower with REPLCONF GETACK and report what it answers.
    GetAck(Sender<u64>, Duration),
}

/// Primary-side record of one follower link. The link's worker thread owns
/// the socket; everyone else talks to it through the channel. `ack_offset`
/// is shared so WAIT can count without touching the socket.
struct FollowerLink {
    id: Uuid,
    sender: Sender<FollowerMessage>,
    ack_offset: Arc<AtomicU64>,
}

/// Shared primary state: the executor plus the follower set.
#[derive(Clone)]
pub struct MasterServer {
    executor: Executor,
    followers: Arc<RwLock<Vec<FollowerLink>>>,
}

impl MasterServer {
    pub fn new(executor: Executor) -> Self {
        MasterServer {
            executor,
            followers: Arc::new(RwLock::new(Vec::new())),
        }
    }

    pub fn executor(&self) -> &Executor {
        &self.executor
    }

    pub fn follower_count(&self) -> usize {
        self.followers.read().unwrap().len()
    }

    /// Fan a write frame out to every follower and grow the replication
    /// offset by its byte length. A follower whose channel is gone is stale
    /// and gets dropped from the set.
    fn propagate(&self, frames: &[Bytes]) {
        for frame in frames {
            let mut stale = Vec::new();
            {
                let followers = self.followers.read().unwrap();
                debug!("replicating {} bytes to {} follower(s)", frame.len(), followers.len());
                for link in followers.iter() {
                    if link
                        .sender
                        .send(FollowerMessage::Propagate(frame.clone()))
                        .is_err()
                    {
                        stale.push(link.id);
                    }
                }
            }
            self.remove_followers(&stale);
            self.executor
                .repl_offset
                .fetch_add(frame.len() as u64, Ordering::SeqCst);
        }
    }

    fn register_follower(&self, sender: Sender<FollowerMessage>, ack_offset: Arc<AtomicU64>) -> Uuid {
        let id = Uuid::new_v4();
        let mut followers = self.followers.write().unwrap();
        followers.push(FollowerLink {
            id,
            sender,
            ack_offset,
        });
        info!("follower {} registered, {} active", id, followers.len());
        id
    }

    fn remove_followers(&self, ids: &[Uuid]) {
        if ids.is_empty() {
            return;
        }
        let mut followers = self.followers.write().unwrap();
        followers.retain(|link| !ids.contains(&link.id));
        warn!("dropped {} follower(s), {} remain", ids.len(), followers.len());
    }

    fn ack_count(&self, target: u64) -> i64 {
        self.followers
            .read()
            .unwrap()
            .iter()
            .filter(|link| link.ack_offset.load(Ordering::SeqCst) >= target)
            .count() as i64
    }

    /// WAIT semantics: count followers that acknowledged everything
    /// propagated up to the call. With nothing propagated yet every follower
    /// trivially qualifies; with enough already acked (or zero required) no
    /// GETACK round trip happens.
    fn wait_for_acks(&self, required: i64, timeout: Duration) -> i64 {
        let target = self.executor.current_offset();
        if target == 0 {
            return self.follower_count() as i64;
        }
        let acked = self.ack_count(target);
        if required <= 0 || acked >= required {
            return acked;
        }

        let (tx, rx) = mpsc::channel();
        {
            let followers = self.followers.read().unwrap();
            for link in followers.iter() {
                if link.ack_offset.load(Ordering::SeqCst) < target {
                    let _ = link
                        .sender
                        .send(FollowerMessage::GetAck(tx.clone(), timeout));
                }
            }
        }
        drop(tx);

        let deadline = Instant::now() + timeout;
        loop {
            let acked = self.ack_count(target);
            if acked >= required {
                return acked;
            }
            let now = Instant::now();
            if now >= deadline {
                return acked;
            }
            if rx.recv_timeout(deadline - now).is_err() {
                // all probes answered or timed out
                return self.ack_count(target);
            }
        }
    }
}

/// One client connection served by the primary.
pub struct MasterConnection {
    master: MasterServer,
    session: Session,
    remote: SocketAddr,
    follower_binding: Option<Binding>,
}

impl MasterConnection {
    pub fn new(master: MasterServer, remote: SocketAddr) -> Self {
        MasterConnection {
            master,
            session: Session::new(),
            remote,
            follower_binding: None,
        }
    }

    fn handle_request(
        &mut self,
        connection: &mut RespConnection,
        raw: Bytes,
        frame: RESP,
    ) -> Result<()> {
        let (name, args) = parse_request(&frame)?;
        let Ok(command) = name.parse::<Command>() else {
            let err = CommandError::UnknownCommand(name);
            connection.send_frame(&RESP::Error(err.to_string()))?;
            return Ok(());
        };

        // replication-control commands bypass the executor, unless an open
        // MULTI is queueing everything
        if !self.session.in_multi {
            match command {
                Command::REPLCONF => return self.replconf(connection, &args),
                Command::PSYNC => return self.psync(connection, &args),
                Command::WAIT => return self.wait(connection, &args),
                _ => {}
            }
        }

        let outcome = self
            .master
            .executor()
            .handle_command(&mut self.session, command, &args, &raw);
        connection.send_frames(&outcome.replies)?;
        self.master.propagate(&outcome.propagate);
        Ok(())
    }

    fn replconf(&mut self, connection: &mut RespConnection, args: &[Bytes]) -> Result<()> {
        if let [sub, value, ..] = args {
            if sub.eq_ignore_ascii_case(b"listening-port") {
                let port = std::str::from_utf8(value)?.parse::<Port>()?;
                self.follower_binding = Some(Binding(self.remote.ip().to_string(), port));
                debug!("handshake: follower listens on {:?}", self.follower_binding);
            }
            // capa and the rest are acknowledged without effect
        }
        connection.send_frame(&RESP::String("OK".to_string()))?;
        Ok(())
    }

    fn wait(&mut self, connection: &mut RespConnection, args: &[Bytes]) -> Result<()> {
        let reply = match args {
            [required, timeout_ms] => {
                let required = std::str::from_utf8(required)
                    .ok()
                    .and_then(|s| s.parse::<i64>().ok());
                let timeout_ms = std::str::from_utf8(timeout_ms)
                    .ok()
                    .and_then(|s| s.parse::<u64>().ok());
                match (required, timeout_ms) {
                    (Some(required), Some(timeout_ms)) => RESP::Int(
                        self.master
                            .wait_for_acks(required, Duration::from_millis(timeout_ms)),
                    ),
                    _ => RESP::Error(CommandError::NotInteger.to_string()),
                }
            }
            _ => RESP::Error(CommandError::WrongArgs("wait").to_string()),
        };
        connection.send_frame(&reply)?;
        Ok(())
    }

    /// `PSYNC ? -1` turns this connection into a replication link: reply
    /// FULLRESYNC plus the snapshot, then only propagated frames flow out.
    fn psync(&mut self, connection: &mut RespConnection, args: &[Bytes]) -> Result<()> {
        let executor = self.master.executor();
        let known = matches!(args, [replid, offset]
            if (replid.as_ref() == b"?" && offset.as_ref() == b"-1")
                || replid.as_ref() == executor.replid().as_bytes());
        if !known {
            connection.send_frame(&RESP::Error(
                "ERR unsupported PSYNC arguments".to_string(),
            ))?;
            return Ok(());
        }

        let header = format!("FULLRESYNC {} {}", executor.replid(), executor.current_offset());
        connection.send_frames(&[RESP::String(header), RESP::Rdb(empty_rdb())])?;
        self.session.is_replica_link = true;
        info!("PSYNC complete, {} is now a replication link", self.remote);
        self.serve_follower(connection)
    }

    fn serve_follower(&mut self, connection: &mut RespConnection) -> Result<()> {
        let (tx, rx) = mpsc::channel();
        let ack_offset = Arc::new(AtomicU64::new(0));
        let id = self.master.register_follower(tx, ack_offset.clone());
        let result = self.follower_loop(connection, &rx, &ack_offset);
        self.master.remove_followers(&[id]);
        result
    }

    fn follower_loop(
        &self,
        connection: &mut RespConnection,
        rx: &Receiver<FollowerMessage>,
        ack_offset: &AtomicU64,
    ) -> Result<()> {
        for message in rx.iter() {
            match message {
                FollowerMessage::Propagate(frame) => {
                    connection.write_raw(&frame)?;
                }
                FollowerMessage::GetAck(reply_to, timeout) => {
                    connection.send_frame(&RESP::command(&["REPLCONF", "GETACK", "*"]))?;
                    match read_ack(connection, timeout) {
                        Ok(offset) => {
                            ack_offset.store(offset, Ordering::SeqCst);
                            // the waiter may have given up already
                            let _ = reply_to.send(offset);
                        }
                        Err(err) => debug!("follower did not ACK: {}", err),
                    }
                }
            }
        }
        Ok(())
    }
}

/// Wait for `REPLCONF ACK <offset>` under a read timeout, restoring the
/// previous timeout afterwards.
fn read_ack(connection: &mut RespConnection, timeout: Duration) -> Result<u64> {
    let saved = connection.read_timeout()?;
    connection.set_read_timeout(Some(timeout))?;
    let result: Result<u64> = (|| {
        let (_, frame) = connection.read_frame()?;
        let (name, args) = parse_request(&frame)?;
        if !name.eq_ignore_ascii_case("REPLCONF") {
            bail!("expected REPLCONF ACK, got {}", name);
        }
        match &args[..] {
            [ack, offset] if ack.eq_ignore_ascii_case(b"ACK") => {
                Ok(std::str::from_utf8(offset)?.parse::<u64>()?)
            }
            _ => bail!("malformed ACK reply"),
        }
    })();
    connection.set_read_timeout(saved)?;
    result
}

impl ConnectionHandler for MasterConnection {
    fn handle_message(&mut self, connection: &mut RespConnection) -> Result<()> {
        let (raw, frame) = connection.read_frame()?;
        debug!("{} sent: {}", self.remote, frame);
        self.handle_request(connection, raw, frame)
    }
}
