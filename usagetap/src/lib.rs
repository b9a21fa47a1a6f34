//! Usage tracking for AI provider clients.
//!
//! Wrap a client with [`WrappedClient::wrap`] or [`track_ai`] and call it
//! through the returned proxy. Every call is forwarded unchanged; afterwards a
//! [`UsageEvent`] carrying the normalized token usage, the resolved customer
//! and the merged metadata is handed to a [`UsageSink`].

pub mod client;
pub mod context;
pub mod object;
pub mod provider;
pub mod proxy;
pub mod settings;
pub mod sink;
pub mod telemetry;
pub mod usage;

pub use client::{ClientClass, TapOptions, WrapError, WrappedClient, track_ai};
pub use context::{ScopeExt, enter_customer_scope, enter_metadata_scope};
pub use object::{Args, Attr, AttributeError, CallError, Method, Object, Record, Value};
pub use proxy::{CallInterceptor, Member, Proxy};
pub use sink::{Collector, LogCollector, MemorySink, NoopSink, Reporter, UsageSink};
pub use usagetap_common::{Metadata, UsageEvent, UsageRecord};
