//! Quiesce/unquiesce coordination for a block-storage object owned by two
//! storage processors (SPs).
//!
//! Each SP runs its own [`object::StorageObject`]; the two agree on quiescing
//! through mirrored metadata memory and serialize updates to the persisted
//! non-paged metadata with a distributed stripe lock.
use std::fmt;

use serde::{Deserialize, Serialize};

pub mod collaborators;
pub mod config;
pub mod control_file;
pub mod error;
pub mod handshake;
pub mod metadata_memory;
pub mod metadata_service;
pub mod monitor;
pub mod nonpaged;
pub mod np_lock;
pub mod object;
pub mod quiesce;
pub mod sim;
pub mod terminator_queue;
pub mod unquiesce;

pub mod defaults {
    use std::time::Duration;

    pub const DEFAULT_MONITOR_INTERVAL: Duration = Duration::from_millis(100);
    pub const DEFAULT_NUMBER_OF_STRIPES: u64 = 64;
    pub const DEFAULT_NONPAGED_DATA_SIZE: usize = 64;
}

/// Object identifier shared by both SPs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ObjectId(pub u32);

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}
