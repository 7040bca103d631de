use std::net::TcpStream;

use anyhow::{bail, Result};
use bytes::Bytes;
use tracing::debug;

use crate::net::Binding;
use crate::protocol::resp::{RespConnection, RESP};

/// A follower's connection to its primary: drives the handshake, consumes
/// the RDB bulk transfer, then hands frames to the apply loop.
pub struct MasterClient {
    connection: RespConnection,
}

impl MasterClient {
    pub fn connect(master: &Binding) -> Result<Self> {
        let stream = TcpStream::connect(master.to_string())?;
        debug!("connected to master {}", master);
        Ok(MasterClient {
            connection: RespConnection::new(stream),
        })
    }

    pub fn ping_pong(&mut self) -> Result<()> {
        self.connection.send_frame(&RESP::command(&["PING"]))?;
        if let (_, RESP::String(reply)) = self.connection.read_frame()? {
            if reply.eq_ignore_ascii_case("PONG") {
                return Ok(());
            }
        }
        bail!("ping not answered with PONG");
    }

    pub fn replconf(&mut self, params: &[&str]) -> Result<()> {
        let mut command = vec!["REPLCONF"];
        command.extend_from_slice(params);
        self.connection.send_frame(&RESP::command(&command))?;
        if let (_, RESP::String(reply)) = self.connection.read_frame()? {
            if reply.eq_ignore_ascii_case("OK") {
                return Ok(());
            }
        }
        bail!("REPLCONF {:?} not acknowledged", params);
    }

    /// `PSYNC ? -1` → `+FULLRESYNC <replid> <offset>` followed by the raw RDB
    /// blob, which is returned.
    pub fn psync(&mut self, replid: &str, offset: i64) -> Result<Vec<u8>> {
        self.connection
            .send_frame(&RESP::command(&["PSYNC", replid, &offset.to_string()]))?;
        let (_, reply) = self.connection.read_frame()?;
        let RESP::String(reply) = reply else {
            bail!("psync failed: {}", reply);
        };
        if !reply.to_uppercase().starts_with("FULLRESYNC ") {
            bail!("psync unknown response: {}", reply);
        }
        let rdb = self.connection.read_rdb_blob()?;
        debug!("received {} byte RDB snapshot", rdb.len());
        Ok(rdb)
    }

    pub fn read_frame(&mut self) -> Result<(Bytes, RESP)> {
        self.connection.read_frame()
    }

    pub fn send_frame(&mut self, message: &RESP) -> Result<usize> {
        self.connection.send_frame(message)
    }
}
