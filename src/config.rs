use std::time::Duration;

use anyhow::bail;

/// Configuration knobs for the query engine.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// How long to wait for a response to a single request before its
    /// completion handle resolves with `RequestTimedOut`.
    pub request_timeout: Duration,

    /// Minimum delay between two dispatches to the same destination for
    /// rate-sensitive protocols (the master server silently drops rapid
    /// follow-up queries and may omit the list terminator when pressed).
    /// The same delay paces the per-entry callbacks of a master server
    /// iteration.
    pub master_pacing_delay: Duration,

    /// Upper bound for outbound datagrams. Source query responses fit into
    /// 1400 bytes plus IP/UDP headers, and the transport rejects anything
    /// larger on the way out.
    pub max_datagram_bytes: usize,

    /// An RCON reassembly buffer that has not seen its terminator within
    /// this window is discarded and its command fails with `RequestTimedOut`.
    pub rcon_reassembly_timeout: Duration,

    /// A queued request that has waited this long is promoted one priority
    /// level, so LOW traffic cannot starve behind a steady HIGH stream.
    pub priority_aging: Duration,

    /// Number of per-destination last-send timestamps retained for pacing;
    /// the oldest entry is evicted when the map is full.
    pub rate_limit_window_capacity: usize,
}

impl ClientConfig {
    pub fn new() -> ClientConfig {
        ClientConfig {
            request_timeout: Duration::from_millis(3000),
            master_pacing_delay: Duration::from_millis(13),
            max_datagram_bytes: 1400,
            rcon_reassembly_timeout: Duration::from_millis(10_000),
            priority_aging: Duration::from_millis(1000),
            rate_limit_window_capacity: 256,
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.request_timeout.is_zero() {
            bail!("request timeout must be non-zero");
        }
        if self.max_datagram_bytes < 16 {
            bail!(
                "datagram size cap of {} bytes cannot hold any protocol header",
                self.max_datagram_bytes
            );
        }
        if self.rate_limit_window_capacity == 0 {
            bail!("rate limit window needs room for at least one destination");
        }
        Ok(())
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self::new()
    }
}
