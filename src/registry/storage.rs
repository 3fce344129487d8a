//! Node Storage (RocksDB)
//!
//! Persistent storage for tracked nodes and the known peer set.
//! Survives restarts so previously seen peers are not treated as new.

use rocksdb::{Direction, IteratorMode, Options, WriteBatch, DB};
use std::path::Path;
use tracing::{debug, info, warn};

use super::RegistryError;
use crate::types::PeerNode;

/// Key prefixes for different data types
const PREFIX_NODE: &[u8] = b"node:";
const PREFIX_PEER: &[u8] = b"peer:";

/// Node and peer set store backed by RocksDB
pub struct NodeStore {
    db: DB,
}

impl NodeStore {
    /// Open or create the store at the given path
    pub fn open(path: &Path) -> Result<Self, RegistryError> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.set_max_open_files(100);
        opts.set_keep_log_file_num(3);

        let db = DB::open(&opts, path)?;
        Ok(Self { db })
    }

    /// Read every stored node. Undecodable rows are skipped.
    pub fn load_nodes(&self) -> Result<Vec<PeerNode>, RegistryError> {
        let mut nodes = Vec::new();

        for item in self.db.iterator(IteratorMode::From(PREFIX_NODE, Direction::Forward)) {
            let (key, value) = item?;
            if !key.starts_with(PREFIX_NODE) {
                break;
            }

            match bincode::deserialize::<PeerNode>(&value) {
                Ok(node) => nodes.push(node),
                Err(e) => warn!(
                    key = %String::from_utf8_lossy(&key),
                    "Skipping undecodable node row: {}", e
                ),
            }
        }

        info!("📦 Loaded {} nodes from store", nodes.len());
        Ok(nodes)
    }

    /// Write one node row
    pub fn put_node(&self, node: &PeerNode) -> Result<(), RegistryError> {
        let value = bincode::serialize(node)?;
        self.db.put(prefixed(PREFIX_NODE, &node.ip), value)?;
        Ok(())
    }

    /// Replace the persisted peer set with `peers` in one batch
    pub fn save_peer_set<'a, I>(&self, peers: I) -> Result<usize, RegistryError>
    where
        I: IntoIterator<Item = &'a String>,
    {
        let mut batch = WriteBatch::default();

        for item in self.db.iterator(IteratorMode::From(PREFIX_PEER, Direction::Forward)) {
            let (key, _) = item?;
            if !key.starts_with(PREFIX_PEER) {
                break;
            }
            batch.delete(key);
        }

        let mut count = 0;
        for peer in peers {
            batch.put(prefixed(PREFIX_PEER, peer), b"");
            count += 1;
        }

        self.db.write(batch)?;
        debug!("Saved {} known peers", count);
        Ok(count)
    }

    /// Read the persisted peer set
    pub fn load_peer_set(&self) -> Result<Vec<String>, RegistryError> {
        let mut peers = Vec::new();

        for item in self.db.iterator(IteratorMode::From(PREFIX_PEER, Direction::Forward)) {
            let (key, _) = item?;
            if !key.starts_with(PREFIX_PEER) {
                break;
            }
            peers.push(String::from_utf8_lossy(&key[PREFIX_PEER.len()..]).into_owned());
        }

        Ok(peers)
    }

    /// Flush all changes to disk
    pub fn flush(&self) -> Result<(), RegistryError> {
        self.db.flush()?;
        Ok(())
    }
}

/// Create storage key for an address
fn prefixed(prefix: &[u8], ip: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(prefix.len() + ip.len());
    key.extend_from_slice(prefix);
    key.extend_from_slice(ip.as_bytes());
    key
}
