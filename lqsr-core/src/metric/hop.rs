// (c) 2020-2022 ZeroTier, Inc. -- currently propritery pending actual release and licensing. See LICENSE.md.
//
// HOP metric: every link costs exactly 1; path metric is a plain sum.

use super::{MetricEngine, PathLink};

pub const INFINITE: u32 = 0xFFFF_FFFF;

pub struct HopEngine;

impl MetricEngine for HopEngine {
    fn is_infinite(&self, link_metric: u32) -> bool {
        link_metric == INFINITE
    }

    fn link_to_path_component(&self, link_metric: u32) -> u64 {
        link_metric as u64
    }

    fn path_metric(&self, path: &[PathLink]) -> u64 {
        path.iter().map(|l| l.metric as u64).sum()
    }

    fn init_link_metric(&self, _is_self_originating: bool) -> u32 {
        1
    }

    fn penalize(&self, _link_metric: u32) -> u32 {
        INFINITE
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn path_metric_is_sum() {
        let e = HopEngine;
        let path = vec![PathLink { metric: 1, channel: 0 }, PathLink { metric: 1, channel: 0 }, PathLink { metric: 1, channel: 0 }];
        assert_eq!(e.path_metric(&path), 3);
    }

    #[test]
    fn infinite_link_is_recognized() {
        let e = HopEngine;
        assert!(e.is_infinite(INFINITE));
        assert!(!e.is_infinite(1));
    }
}
