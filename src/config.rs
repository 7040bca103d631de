use std::path::PathBuf;

use clap::Parser;

use crate::net::{Binding, Port, DEFAULT_PORT};

/// Server configuration, straight from the command line.
#[derive(Debug, Clone, Parser)]
#[command(name = "cinder", about = "Redis-compatible in-memory key/value server")]
pub struct Config {
    /// Port to listen on.
    #[arg(long, default_value_t = DEFAULT_PORT)]
    pub port: Port,

    /// Directory holding the RDB snapshot. No snapshot is restored when
    /// unset.
    #[arg(long)]
    pub dir: Option<PathBuf>,

    /// RDB snapshot file name inside --dir.
    #[arg(long, default_value = "dump.rdb")]
    pub dbfilename: String,

    /// Run as a follower of "<host> <port>".
    #[arg(long, value_name = "HOST PORT")]
    pub replicaof: Option<Binding>,
}

impl Config {
    pub fn is_master(&self) -> bool {
        self.replicaof.is_none()
    }

    /// Value reported by `CONFIG GET dir`.
    pub fn dir_value(&self) -> String {
        self.dir
            .as_ref()
            .map(|d| d.display().to_string())
            .unwrap_or_default()
    }

    pub fn rdb_path(&self) -> Option<PathBuf> {
        self.dir.as_ref().map(|dir| dir.join(&self.dbfilename))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = Config::parse_from(["cinder"]);
        assert_eq!(config.port, 6379);
        assert_eq!(config.dbfilename, "dump.rdb");
        assert!(config.dir.is_none());
        assert!(config.is_master());
    }

    #[test]
    fn replicaof_parses_host_and_port() {
        let config = Config::parse_from(["cinder", "--replicaof", "localhost 6379"]);
        assert_eq!(
            config.replicaof,
            Some(Binding("localhost".to_string(), 6379))
        );
        assert!(!config.is_master());
    }

    #[test]
    fn rdb_path_joins_dir_and_filename() {
        let config =
            Config::parse_from(["cinder", "--dir", "/tmp/data", "--dbfilename", "db.rdb"]);
        assert_eq!(config.rdb_path().unwrap(), PathBuf::from("/tmp/data/db.rdb"));
    }
}
