use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;
use std::thread;

use anyhow::Result;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::connection::ConnectionHandler;
use crate::executor::Executor;
use crate::master::{MasterConnection, MasterServer};
use crate::net::Binding;
use crate::replica::ReplicaConnection;

/// The accept loop: bind, build the shared state, dispatch each connection
/// to a named worker thread running the role-appropriate handler.
pub struct Server {
    listener: TcpListener,
    executor: Executor,
    master: Option<MasterServer>,
}

impl Server {
    /// Bind failure is the one error the caller treats as fatal.
    pub fn bind(config: Arc<Config>) -> Result<Self> {
        let binding = Binding("127.0.0.1".to_string(), config.port);
        let listener = TcpListener::bind(binding.to_string())?;
        let executor = Executor::new(config.clone());
        let master = config
            .is_master()
            .then(|| MasterServer::new(executor.clone()));
        info!(
            "listening on {} as {}",
            listener.local_addr()?,
            if master.is_some() { "master" } else { "replica" }
        );
        Ok(Server {
            listener,
            executor,
            master,
        })
    }

    pub fn executor(&self) -> &Executor {
        &self.executor
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub fn run(&self) -> Result<()> {
        for stream in self.listener.incoming() {
            match stream {
                Ok(stream) => self.dispatch(stream),
                Err(err) => warn!("accept failed: {}", err),
            }
        }
        Ok(())
    }

    fn dispatch(&self, stream: TcpStream) {
        let peer = match stream.peer_addr() {
            Ok(peer) => peer,
            Err(err) => {
                debug!("connection vanished before dispatch: {}", err);
                return;
            }
        };
        let master = self.master.clone();
        let executor = self.executor.clone();
        let spawned = thread::Builder::new()
            .name(format!("client-{}", peer))
            .spawn(move || match master {
                Some(master) => MasterConnection::new(master, peer).handle_connection(stream),
                None => ReplicaConnection::new(executor).handle_connection(stream),
            });
        if let Err(err) = spawned {
            warn!("failed to spawn connection worker: {}", err);
        }
    }
}
