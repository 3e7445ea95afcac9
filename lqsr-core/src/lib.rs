// (c) 2020-2022 ZeroTier, Inc. -- currently propritery pending actual release and licensing. See LICENSE.md.
//
// LQSR routing core: link cache, pluggable metrics, the per-hop-encrypted
// frame codec, request suppression, hop-by-hop maintenance, piggyback
// coalescing, and the forwarder tying them together. No network or file
// I/O lives in this crate; everything crosses the boundary through the
// traits in `interfaces`.

pub mod adapter;
pub mod bandwidth;
pub mod codec;
pub mod config;
pub mod error;
pub mod forwarder;
pub mod interfaces;
pub mod linkcache;
pub mod maintbuf;
pub mod metric;
pub mod neighbor;
pub mod piggyback;
pub mod protocol;
pub mod reqtable;
pub mod sendbuf;

pub use adapter::{Adapter, AdapterId, AdapterRegistry};
pub use codec::{FrameKeys, LqsrOption, Packet};
pub use config::AdapterConfig;
pub use error::{LqsrError, Result};
pub use forwarder::{Forwarder, ForwarderStats};
pub use interfaces::{LinkLayer, RandomSource, VirtualAdapterHost};
pub use linkcache::LinkCache;
pub use protocol::MetricType;
