//! Startup configuration: CLI flags plus the peer-discovery registry file
//! (SPEC_FULL.md §4.7/§6). Mirrors the teacher's `Config`, generalized from
//! a single in-process `HashMap<u64, SocketAddr>` to the spec's on-disk
//! registry format so peers can be discovered across process restarts.

use std::collections::HashMap;
use std::fs;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};

use crate::error::ConfigError;

pub type NodeId = String;

/// Read-only `{NodeId -> address}` view of the cluster, loaded once at
/// startup (SPEC_FULL.md §4.7). Never mutated afterward: dynamic membership
/// changes are a Non-goal.
#[derive(Debug, Clone)]
pub struct PeerRegistry {
    peers: HashMap<NodeId, u16>,
}

impl PeerRegistry {
    /// Parses `<nodeId>,<port>\n` lines (SPEC_FULL.md §6). Duplicate node
    /// ids are tolerated; the last line for a given id wins.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path).map_err(|source| ConfigError::PeerRegistry {
            path: path.display().to_string(),
            source,
        })?;
        let mut peers = HashMap::new();
        for line in contents.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let (node_id, port) = line
                .split_once(',')
                .ok_or_else(|| ConfigError::MalformedRegistryLine(line.to_string()))?;
            let port: u16 = port
                .trim()
                .parse()
                .map_err(|_| ConfigError::MalformedRegistryLine(line.to_string()))?;
            peers.insert(node_id.trim().to_string(), port);
        }
        Ok(PeerRegistry { peers })
    }

    pub fn contains(&self, node_id: &str) -> bool {
        self.peers.contains_key(node_id)
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn peer_port(&self, node_id: &str) -> Option<u16> {
        self.peers.get(node_id).copied()
    }

    pub fn peer_addr(&self, node_id: &str) -> Option<SocketAddr> {
        self.peer_port(node_id)
            .map(|port| SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port))
    }

    /// Every other node in the cluster (excludes `exclude`, the local node).
    pub fn other_peers<'a>(&'a self, exclude: &'a str) -> impl Iterator<Item = (&'a str, u16)> + 'a {
        self.peers
            .iter()
            .filter(move |(id, _)| id.as_str() != exclude)
            .map(|(id, port)| (id.as_str(), *port))
    }

    /// Every registered node id and its peer-RPC port, for collaborators (the
    /// CLI client) that have no "self" id to exclude.
    pub fn all_peers(&self) -> impl Iterator<Item = (&str, u16)> {
        self.peers.iter().map(|(id, port)| (id.as_str(), *port))
    }
}

/// Startup configuration for a server node.
#[derive(Debug, Clone)]
pub struct Config {
    pub node_id: NodeId,
    pub peers_file: PathBuf,
    pub data_dir: PathBuf,
    pub client_port_override: Option<u16>,
}

impl Config {
    /// Parses `--node-id`, `--peers-file`, `--data-dir`, and the optional
    /// `--client-port` from `args` (excluding argv[0]). A small hand-rolled
    /// parser is enough for this surface, matching the original's direct use
    /// of Go's `flag` package for four flags.
    pub fn from_args<I: IntoIterator<Item = String>>(args: I) -> Result<Self, ConfigError> {
        let mut node_id = None;
        let mut peers_file = None;
        let mut data_dir = None;
        let mut client_port_override = None;

        let mut iter = args.into_iter();
        while let Some(flag) = iter.next() {
            let value = || iter.next().ok_or(ConfigError::MissingArgument("value"));
            match flag.as_str() {
                "--node-id" => node_id = Some(value()?),
                "--peers-file" => peers_file = Some(PathBuf::from(value()?)),
                "--data-dir" => data_dir = Some(PathBuf::from(value()?)),
                "--client-port" => {
                    client_port_override = Some(
                        value()?
                            .parse()
                            .map_err(|_| ConfigError::MissingArgument("client-port"))?,
                    )
                }
                _ => {}
            }
        }

        let node_id = node_id.ok_or(ConfigError::MissingArgument("node-id"))?;
        let peers_file = peers_file.ok_or(ConfigError::MissingArgument("peers-file"))?;
        let data_dir = data_dir.unwrap_or_else(|| PathBuf::from("."));

        Ok(Config {
            node_id,
            peers_file,
            data_dir,
            client_port_override,
        })
    }

    pub fn load_registry(&self) -> Result<PeerRegistry, ConfigError> {
        let registry = PeerRegistry::load(&self.peers_file)?;
        if !registry.contains(&self.node_id) {
            return Err(ConfigError::UnknownNodeId(self.node_id.clone()));
        }
        Ok(registry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn parses_registry_with_duplicate_last_write_wins() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("peers.txt");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(file, "a,9001").unwrap();
        writeln!(file, "b,9002").unwrap();
        writeln!(file, "a,9101").unwrap();
        drop(file);

        let registry = PeerRegistry::load(&path).unwrap();
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.peer_port("a"), Some(9101));
        assert_eq!(registry.peer_port("b"), Some(9002));
    }

    #[test]
    fn rejects_malformed_registry_line() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("peers.txt");
        std::fs::write(&path, "a-missing-port\n").unwrap();
        assert!(matches!(
            PeerRegistry::load(&path),
            Err(ConfigError::MalformedRegistryLine(_))
        ));
    }

    #[test]
    fn other_peers_excludes_self() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("peers.txt");
        std::fs::write(&path, "a,9001\nb,9002\nc,9003\n").unwrap();
        let registry = PeerRegistry::load(&path).unwrap();
        let mut others: Vec<&str> = registry.other_peers("a").map(|(id, _)| id).collect();
        others.sort();
        assert_eq!(others, vec!["b", "c"]);
    }

    #[test]
    fn all_peers_includes_every_registered_node() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("peers.txt");
        std::fs::write(&path, "a,9001\nb,9002\n").unwrap();
        let registry = PeerRegistry::load(&path).unwrap();
        let mut all: Vec<&str> = registry.all_peers().map(|(id, _)| id).collect();
        all.sort();
        assert_eq!(all, vec!["a", "b"]);
    }

    #[test]
    fn config_from_args_requires_node_id_and_peers_file() {
        let args = vec!["--data-dir".to_string(), "/tmp".to_string()];
        assert!(matches!(
            Config::from_args(args),
            Err(ConfigError::MissingArgument("node-id"))
        ));
    }

    #[test]
    fn config_from_args_parses_all_flags() {
        let args = vec![
            "--node-id".to_string(),
            "a".to_string(),
            "--peers-file".to_string(),
            "peers.txt".to_string(),
            "--data-dir".to_string(),
            "/tmp/raftkv".to_string(),
            "--client-port".to_string(),
            "9101".to_string(),
        ];
        let config = Config::from_args(args).unwrap();
        assert_eq!(config.node_id, "a");
        assert_eq!(config.peers_file, PathBuf::from("peers.txt"));
        assert_eq!(config.data_dir, PathBuf::from("/tmp/raftkv"));
        assert_eq!(config.client_port_override, Some(9101));
    }
}
