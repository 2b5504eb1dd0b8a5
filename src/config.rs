use anyhow::bail;
use std::time::Duration;

/// Per-connection configuration. [ConnectionConfig::default] is a reasonable starting
///  point for typical deployments.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// The upper bound for a single payload, enforced for outgoing sends on both channels
    ///  and for length prefixes decoded from the wire.
    ///
    /// The wire format itself has no inherent maximum - a varint length can describe
    ///  payloads far bigger than anything a peer could sanely buffer. Decoding an
    ///  unchecked length would let a peer make us allocate arbitrary amounts of memory,
    ///  so the limit is applied on both sides.
    ///
    /// NB: For the datagram channel the *practical* maximum is far smaller and depends on
    ///  the network path; choosing payloads (times redundancy) bigger than the path MTU
    ///  causes datagrams to be dropped or fragmented.
    pub max_payload_len: usize,

    /// The size of the buffer handed to each stream read. This is a throughput /
    ///  memory-per-connection trade-off and has no protocol-visible effect: payloads may
    ///  span any number of reads, and one read may complete any number of payloads.
    pub read_buffer_len: usize,

    /// How often the idle timer checks whether a keep-alive is due.
    pub keep_alive_interval: Duration,

    /// Idle time after the most recent stream send before the idle timer sends an empty
    ///  keep-alive payload. Should comfortably undercut the idle timeouts of NAT gateways
    ///  and stateful firewalls on the path.
    pub idle_threshold: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> ConnectionConfig {
        ConnectionConfig {
            max_payload_len: 16*1024*1024,
            read_buffer_len: 16*1024,
            keep_alive_interval: Duration::from_secs(5),
            idle_threshold: Duration::from_secs(10),
        }
    }
}

impl ConnectionConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.max_payload_len == 0 {
            bail!("max payload length must be positive");
        }
        if self.read_buffer_len == 0 {
            bail!("read buffer length must be positive");
        }
        if self.keep_alive_interval.is_zero() {
            bail!("keep-alive interval must be positive");
        }
        if self.idle_threshold < self.keep_alive_interval {
            bail!("idle threshold below the keep-alive interval makes every timer check send a keep-alive");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::*;

    #[rstest]
    fn test_default_is_valid() {
        assert!(ConnectionConfig::default().validate().is_ok());
    }

    #[rstest]
    #[case::zero_payload(ConnectionConfig { max_payload_len: 0, ..ConnectionConfig::default() })]
    #[case::zero_read_buffer(ConnectionConfig { read_buffer_len: 0, ..ConnectionConfig::default() })]
    #[case::zero_keep_alive(ConnectionConfig { keep_alive_interval: Duration::ZERO, ..ConnectionConfig::default() })]
    #[case::idle_below_keep_alive(ConnectionConfig { idle_threshold: Duration::from_secs(1), ..ConnectionConfig::default() })]
    fn test_validate_rejects(#[case] config: ConnectionConfig) {
        assert!(config.validate().is_err());
    }
}
