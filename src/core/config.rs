use std::time::Duration;

pub const DEFAULT_NUM_POOLS: usize = 10;
pub const DEFAULT_POOL_MAX_SIZE: usize = 1;
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// What `acquire` does when every slot of a pool is checked out.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum BlockingPolicy {
    /// Wait for a release, served in arrival order.
    Block,
    #[default]
    FailFast,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PoolConfig {
    pub max_size: usize,
    pub blocking_policy: BlockingPolicy,
    pub connect_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_size: DEFAULT_POOL_MAX_SIZE,
            blocking_policy: BlockingPolicy::default(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }
}

impl PoolConfig {
    pub fn with_max_size(mut self, max_size: usize) -> Self {
        self.max_size = max_size.max(1);
        self
    }

    pub fn with_blocking_policy(mut self, blocking_policy: BlockingPolicy) -> Self {
        self.blocking_policy = blocking_policy;
        self
    }

    pub fn with_connect_timeout(mut self, connect_timeout: Duration) -> Self {
        self.connect_timeout = connect_timeout;
        self
    }

    pub fn merged(self, overrides: &PoolOverrides) -> Self {
        Self {
            max_size: overrides.max_size.unwrap_or(self.max_size).max(1),
            blocking_policy: overrides.blocking_policy.unwrap_or(self.blocking_policy),
            connect_timeout: overrides.connect_timeout.unwrap_or(self.connect_timeout),
        }
    }
}

/// Per-call adjustments applied on top of the registry defaults when a pool
/// is created. They have no effect on a pool that already exists.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PoolOverrides {
    pub max_size: Option<usize>,
    pub blocking_policy: Option<BlockingPolicy>,
    pub connect_timeout: Option<Duration>,
}

impl PoolOverrides {
    pub fn with_max_size(mut self, max_size: usize) -> Self {
        self.max_size = Some(max_size);
        self
    }

    pub fn with_blocking_policy(mut self, blocking_policy: BlockingPolicy) -> Self {
        self.blocking_policy = Some(blocking_policy);
        self
    }

    pub fn with_connect_timeout(mut self, connect_timeout: Duration) -> Self {
        self.connect_timeout = Some(connect_timeout);
        self
    }
}
