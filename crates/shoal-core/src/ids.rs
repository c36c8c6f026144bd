use std::fmt;

use serde::{Deserialize, Serialize};

/// Logical shard identifier, shared by one back channel cluster-wide and by
/// one front channel per front process.
pub type ChannelId = String;

pub type ClientUid = String;

pub type FrontMasterIndex = u32;

pub type BackMasterIndex = u32;

/// Identity of one front channel instance: its shard plus the front process
/// hosting it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FrontUid {
    pub channel_id: ChannelId,
    pub front_master_index: FrontMasterIndex,
}

impl FrontUid {
    pub fn new(channel_id: impl Into<ChannelId>, front_master_index: FrontMasterIndex) -> Self {
        Self {
            channel_id: channel_id.into(),
            front_master_index,
        }
    }
}

impl fmt::Display for FrontUid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.channel_id, self.front_master_index)
    }
}
