use std::time::Duration;

use serde::Deserialize;
use shoal_core::{ChannelConfig, ChannelId};

/// Node settings read from `SHOAL__*` environment variables, for example
/// `SHOAL__CHANNEL_IDS=lobby,arena` or `SHOAL__BACK_MASTERS=3`.
#[derive(Debug, Clone, Deserialize)]
pub struct NodeConfig {
    /// Comma separated shard ids.
    #[serde(default = "default_channel_ids")]
    pub channel_ids: String,
    #[serde(default = "default_back_masters")]
    pub back_masters: u32,
    #[serde(default = "default_front_masters")]
    pub front_masters: u32,
    #[serde(default = "default_patch_interval")]
    pub patch_interval_ms: u64,
    #[serde(default = "default_queue_interval")]
    pub queue_interval_ms: u64,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_link_timeout")]
    pub link_timeout_ms: u64,
    #[serde(default)]
    pub log_path: Option<String>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            channel_ids: default_channel_ids(),
            back_masters: default_back_masters(),
            front_masters: default_front_masters(),
            patch_interval_ms: default_patch_interval(),
            queue_interval_ms: default_queue_interval(),
            connect_timeout_ms: default_connect_timeout(),
            link_timeout_ms: default_link_timeout(),
            log_path: None,
        }
    }
}

impl NodeConfig {
    pub fn from_env() -> Self {
        config::Config::builder()
            .add_source(config::Environment::with_prefix("SHOAL").separator("__"))
            .build()
            .and_then(|c| c.try_deserialize())
            .map(NodeConfig::normalize)
            .unwrap_or_else(|_| NodeConfig::default().normalize())
    }

    fn normalize(mut self) -> Self {
        self.log_path = self.log_path.take().and_then(|path| {
            let trimmed = path.trim();
            if trimmed.is_empty() {
                None
            } else {
                Some(trimmed.to_string())
            }
        });
        self.back_masters = self.back_masters.max(1);
        self.front_masters = self.front_masters.max(1);
        self.patch_interval_ms = self.patch_interval_ms.max(1);
        self.queue_interval_ms = self.queue_interval_ms.max(1);
        if self.channel_id_list().is_empty() {
            self.channel_ids = default_channel_ids();
        }
        self
    }

    /// Distinct ids in configuration order.
    pub fn channel_id_list(&self) -> Vec<ChannelId> {
        let mut ids: Vec<ChannelId> = Vec::new();
        for id in self.channel_ids.split(',').map(str::trim) {
            if !id.is_empty() && !ids.iter().any(|known| known == id) {
                ids.push(id.to_string());
            }
        }
        ids
    }

    /// Ids owned by back master `index`, dealt round-robin.
    pub fn channel_ids_for_back_master(&self, index: u32) -> Vec<ChannelId> {
        self.channel_id_list()
            .into_iter()
            .enumerate()
            .filter(|(position, _)| *position as u32 % self.back_masters == index)
            .map(|(_, id)| id)
            .collect()
    }

    pub fn channel_config(&self) -> ChannelConfig {
        ChannelConfig {
            connect_timeout: Duration::from_millis(self.connect_timeout_ms),
            link_timeout: Duration::from_millis(self.link_timeout_ms),
        }
    }

    pub fn patch_interval(&self) -> Duration {
        Duration::from_millis(self.patch_interval_ms)
    }

    pub fn queue_interval(&self) -> Duration {
        Duration::from_millis(self.queue_interval_ms)
    }
}

fn default_channel_ids() -> String {
    "room-0,room-1,room-2,room-3".to_string()
}

fn default_back_masters() -> u32 {
    2
}

fn default_front_masters() -> u32 {
    2
}

fn default_patch_interval() -> u64 {
    50
}

fn default_queue_interval() -> u64 {
    50
}

fn default_connect_timeout() -> u64 {
    15_000
}

fn default_link_timeout() -> u64 {
    5_000
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    const VARS: [&str; 3] = ["SHOAL__CHANNEL_IDS", "SHOAL__BACK_MASTERS", "SHOAL__LOG_PATH"];

    fn clear_env() {
        for var in VARS {
            std::env::remove_var(var);
        }
    }

    #[test]
    #[serial]
    fn defaults_apply_without_environment() {
        clear_env();
        let config = NodeConfig::from_env();
        assert_eq!(config.channel_id_list().len(), 4);
        assert_eq!(config.back_masters, 2);
        assert_eq!(config.channel_config(), ChannelConfig::default());
        assert!(config.log_path.is_none());
    }

    #[test]
    #[serial]
    fn environment_overrides_defaults() {
        clear_env();
        std::env::set_var("SHOAL__CHANNEL_IDS", "lobby, arena ,lobby,");
        std::env::set_var("SHOAL__BACK_MASTERS", "3");
        std::env::set_var("SHOAL__LOG_PATH", "   ");
        let config = NodeConfig::from_env();
        clear_env();

        assert_eq!(config.channel_id_list(), vec!["lobby", "arena"]);
        assert_eq!(config.back_masters, 3);
        assert!(config.log_path.is_none());
    }

    #[test]
    fn channels_are_dealt_round_robin() {
        let config = NodeConfig {
            channel_ids: "a,b,c,d,e".into(),
            back_masters: 2,
            ..NodeConfig::default()
        };
        assert_eq!(config.channel_ids_for_back_master(0), vec!["a", "c", "e"]);
        assert_eq!(config.channel_ids_for_back_master(1), vec!["b", "d"]);
    }

    #[test]
    fn zero_masters_are_raised_to_one() {
        let config = NodeConfig {
            back_masters: 0,
            front_masters: 0,
            channel_ids: " , ".into(),
            ..NodeConfig::default()
        }
        .normalize();
        assert_eq!(config.back_masters, 1);
        assert_eq!(config.front_masters, 1);
        assert_eq!(config.channel_id_list().len(), 4);
    }
}
