use std::path::PathBuf;
use std::time::Duration;

use quorumsql_vfs::wal::is_valid_page_size;

use crate::error::Error;
use crate::raft::NodeId;
use crate::Result;

/// Default heartbeat timeout: a queued request older than this is failed
/// back to the client.
const DEFAULT_HEARTBEAT_TIMEOUT: Duration = Duration::from_millis(15000);

/// Default database page size in bytes.
const DEFAULT_PAGE_SIZE: u32 = 4096;

/// Number of committed WAL frames after which a checkpoint is triggered.
const DEFAULT_CHECKPOINT_THRESHOLD: u32 = 1000;

/// Value object holding the engine configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Unique, nonzero node id.
    pub node_id: NodeId,
    /// Address other nodes reach this one at.
    pub address: String,
    pub heartbeat_timeout: Duration,
    pub page_size: u32,
    pub checkpoint_threshold: u32,
    /// Target number of voters the role manager maintains.
    pub voters: usize,
    /// Target number of standbys the role manager maintains.
    pub standbys: usize,
    /// Opaque fault-isolation tag (rack, zone) used to spread voters.
    pub failure_domain: u64,
    /// Nodes with lower weight are preferred for promotion.
    pub weight: u64,
    /// Advisory data directory for on-disk modes; the volatile VFS ignores
    /// it.
    pub dir: Option<PathBuf>,
}

impl Config {
    pub fn new(node_id: NodeId, address: impl Into<String>) -> Self {
        Self {
            node_id,
            address: address.into(),
            heartbeat_timeout: DEFAULT_HEARTBEAT_TIMEOUT,
            page_size: DEFAULT_PAGE_SIZE,
            checkpoint_threshold: DEFAULT_CHECKPOINT_THRESHOLD,
            voters: 3,
            standbys: 0,
            failure_domain: 0,
            weight: 0,
            dir: None,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.node_id == 0 {
            return Err(Error::InvalidConfig("node id must be nonzero".into()));
        }
        crate::addr::parse(&self.address)?;
        if !is_valid_page_size(self.page_size) {
            return Err(Error::InvalidConfig(format!(
                "page size {} is not a power of two in [512, 65536]",
                self.page_size
            )));
        }
        if self.voters == 0 {
            return Err(Error::InvalidConfig(
                "at least one voter is required".into(),
            ));
        }
        if self.checkpoint_threshold == 0 {
            return Err(Error::InvalidConfig(
                "checkpoint threshold must be nonzero".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = Config::new(1, "127.0.0.1:9001");
        config.validate().unwrap();
        assert_eq!(config.heartbeat_timeout, Duration::from_millis(15000));
        assert_eq!(config.page_size, 4096);
        assert_eq!(config.checkpoint_threshold, 1000);
    }

    #[test]
    fn invalid_values_are_rejected() {
        assert!(Config::new(0, "addr").validate().is_err());
        assert!(Config::new(1, "").validate().is_err());

        let mut config = Config::new(1, "addr");
        config.page_size = 1000;
        assert!(config.validate().is_err());

        let mut config = Config::new(1, "addr");
        config.voters = 0;
        assert!(config.validate().is_err());
    }
}
