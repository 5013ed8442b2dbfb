use std::net::SocketAddr;
use std::time::Duration;

use anyhow::anyhow;
use rustc_hash::FxHashMap;

use crate::packet::types::ModuleType;

/// Configuration of the dispatch core.
///
/// The module address table maps a logical module type plus a partition-set
///  offset to the leader address of that worker class. Entries are usually
///  filled in from the deployment's property file at process bootstrap (which
///  is outside this crate); tests and embedders fill them in directly.
#[derive(Debug)]
pub struct DispatchConfig {
    /// (module type, partition set) -> leader address of that worker class
    pub module_addresses: FxHashMap<(ModuleType, u32), SocketAddr>,

    /// number of tasks draining the inbound packet queue concurrently
    pub nbr_dispatch_workers: usize,

    /// how long the transport waits for an answer before invoking the
    ///  resend/timeout callback for an outgoing packet
    pub default_resend_timeout: Duration,
    /// how many retransmissions of one outgoing packet are attempted before
    ///  the attempt is given up and the timeout packet (or a synthesized
    ///  timeout reply) takes over
    pub default_max_resends: u8,
}

impl DispatchConfig {
    pub fn new() -> DispatchConfig {
        DispatchConfig {
            module_addresses: Default::default(),
            nbr_dispatch_workers: 2,
            default_resend_timeout: Duration::from_millis(2500),
            default_max_resends: 3,
        }
    }

    pub fn set_module_address(&mut self, module_type: ModuleType, map_set: u32, addr: SocketAddr) {
        self.module_addresses.insert((module_type, map_set), addr);
    }

    /// Resolve a logical destination. A module type without an entry for the
    ///  requested partition set falls back to partition set 0 before giving
    ///  up, so deployments with a single partition set only configure that.
    pub fn module_address(&self, module_type: ModuleType, map_set: u32) -> anyhow::Result<SocketAddr> {
        if let Some(addr) = self.module_addresses.get(&(module_type, map_set)) {
            return Ok(*addr);
        }
        if map_set != 0 {
            if let Some(addr) = self.module_addresses.get(&(module_type, 0)) {
                return Ok(*addr);
            }
        }
        Err(anyhow!("no address configured for module {:?} (partition set {})", module_type, map_set))
    }
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;
    use super::*;

    #[test]
    fn test_module_address_fallback_to_set_zero() {
        let mut config = DispatchConfig::new();
        let addr = SocketAddr::from_str("127.0.0.1:5000").unwrap();
        config.set_module_address(ModuleType::Map, 0, addr);

        assert_eq!(config.module_address(ModuleType::Map, 0).unwrap(), addr);
        assert_eq!(config.module_address(ModuleType::Map, 3).unwrap(), addr);
        assert!(config.module_address(ModuleType::Search, 0).is_err());
    }
}
