// (c) 2020-2022 ZeroTier, Inc. -- currently propritery pending actual release and licensing. See LICENSE.md.
//
// Adapter configuration: the validated parameters an embedder supplies at
// construction time (or updates live through the control plane). Bounds
// mirror the configuration operation in SPEC_FULL.md §6.

use crate::error::{LqsrError, Result};
use crate::metric::MetricConfig;
use crate::protocol::MetricType;

#[derive(Debug, Clone)]
pub struct AdapterConfig {
    pub node_address: lqsr_util::MacAddr,
    pub metric: MetricConfig,
    pub mac_key: [u8; 16],
    pub aes_key: [u8; 16],
    pub crypto_enabled: bool,
    pub max_hops: u8,
    pub link_info_period_ticks: i64,
    /// Route-flap damping threshold passed to `LinkCache`; `0` disables it.
    pub route_flap_damping: u32,
}

pub const MIN_MAX_HOPS: u8 = 1;
pub const MAX_MAX_HOPS: u8 = crate::protocol::MAX_SR_LEN as u8;

impl AdapterConfig {
    pub fn new(node_address: lqsr_util::MacAddr, metric_type: MetricType, mac_key: [u8; 16], aes_key: [u8; 16], crypto_enabled: bool) -> Self {
        Self {
            node_address,
            metric: MetricConfig::default_for(metric_type),
            mac_key,
            aes_key,
            crypto_enabled,
            max_hops: MAX_MAX_HOPS,
            link_info_period_ticks: lqsr_util::seconds(5),
            route_flap_damping: 0,
        }
    }

    pub fn validate(&self) -> Result<()> {
        self.metric.validate()?;
        if self.max_hops < MIN_MAX_HOPS || self.max_hops > MAX_MAX_HOPS {
            return Err(LqsrError::InvalidParameter(10));
        }
        let min_period = lqsr_util::millis(100);
        let max_period = lqsr_util::seconds(429);
        if self.link_info_period_ticks < min_period || self.link_info_period_ticks > max_period {
            return Err(LqsrError::InvalidParameter(11));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> AdapterConfig {
        AdapterConfig::new(lqsr_util::MacAddr::new([1; 6]), MetricType::Hop, [0; 16], [0; 16], true)
    }

    #[test]
    fn default_config_validates() {
        assert!(base().validate().is_ok());
    }

    #[test]
    fn max_hops_out_of_range_is_rejected() {
        let mut c = base();
        c.max_hops = 0;
        assert_eq!(c.validate(), Err(LqsrError::InvalidParameter(10)));
        c.max_hops = MAX_MAX_HOPS + 1;
        assert_eq!(c.validate(), Err(LqsrError::InvalidParameter(10)));
    }

    #[test]
    fn link_info_period_out_of_range_is_rejected() {
        let mut c = base();
        c.link_info_period_ticks = 0;
        assert_eq!(c.validate(), Err(LqsrError::InvalidParameter(11)));
    }
}
