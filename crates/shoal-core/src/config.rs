use std::time::Duration;

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(15);
const DEFAULT_LINK_TIMEOUT: Duration = Duration::from_secs(5);

/// Protocol deadlines shared by every front channel of a front master.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelConfig {
    pub connect_timeout: Duration,
    pub link_timeout: Duration,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            link_timeout: DEFAULT_LINK_TIMEOUT,
        }
    }
}
