use std::time::Duration;

/// Connection and request lifecycle settings for a single client.
#[derive(Clone)]
pub struct ClientConfig {
    /// Credentials for the authentication step of the handshake. When
    /// `username` is `None` the client enters multiplexed mode right after
    /// the greeting.
    pub username: Option<String>,
    pub password: Option<String>,
    /// Capacity of the shared write buffer (the writer-side buffer mirrors
    /// it).
    pub shared_buffer_size: usize,
    /// Packets of `direct_write_factor * shared_buffer_size` bytes and above
    /// bypass the shared buffer and go straight to the socket. Must be in
    /// (0, 1].
    pub direct_write_factor: f64,
    /// Upper bound for acquiring the buffer lock and for waiting for free
    /// buffer space.
    pub write_timeout: Duration,
    /// Default per-request deadline, armed at dispatch.
    pub operation_timeout: Duration,
    /// How long the constructor waits for the first connection.
    pub init_timeout: Duration,
    /// Per-attempt socket connect timeout.
    pub connect_timeout: Duration,
    /// Capacity hint for the in-flight request registry.
    pub predicted_futures: usize,
    /// Connect retries consumed by the address providers before they give up
    /// with a non-transient error.
    pub retry_count: usize,
    /// Selects CALL over the backward-compatible OLD_CALL opcode.
    pub use_new_call: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            username: None,
            password: None,
            shared_buffer_size: 4 * 1024 * 1024,
            direct_write_factor: 0.5,
            write_timeout: Duration::from_secs(60),
            operation_timeout: Duration::from_secs(1),
            init_timeout: Duration::from_secs(60),
            connect_timeout: Duration::from_secs(2),
            predicted_futures: 4096,
            retry_count: 3,
            use_new_call: true,
        }
    }
}

/// Settings for the cluster variant on top of [`ClientConfig`].
#[derive(Clone)]
pub struct ClusterConfig {
    pub client: ClientConfig,
    /// Period of the member discovery task.
    pub discovery_delay: Duration,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self { client: ClientConfig::default(), discovery_delay: Duration::from_secs(60) }
    }
}
