use std::net::TcpStream;

use tracing::debug;

use crate::protocol::resp::RespConnection;

/// One connection worker: pulls requests until the peer goes away or framing
/// breaks. Connection-local faults are not server faults, so they terminate
/// only this worker, with a debug line naming the peer; the socket drops on
/// return.
pub trait ConnectionHandler {
    fn handle_connection(&mut self, stream: TcpStream) {
        let peer = stream
            .peer_addr()
            .map(|addr| addr.to_string())
            .unwrap_or_else(|_| "<unknown>".to_string());
        let mut connection = RespConnection::new(stream);
        loop {
            if let Err(err) = self.handle_message(&mut connection) {
                // orderly peer closes unwind through here too
                debug!("connection {} ended: {}", peer, err);
                return;
            }
        }
    }

    fn handle_message(&mut self, connection: &mut RespConnection) -> anyhow::Result<()>;
}
