//! Wrapping entry points.

use std::sync::Arc;

use log::{debug, info};
use thiserror::Error;
use usagetap_common::Metadata;

use crate::{
    object::{Args, AttributeError, CallError, Object, Value},
    provider,
    proxy::{CallInterceptor, Member, Proxy, TapState},
    settings::Settings,
    sink::{LogCollector, NoopSink, Reporter, UsageSink},
};

/// How a client is tracked.
#[derive(Debug, Clone, PartialEq)]
pub struct TapOptions {
    /// Explicit provider tag; `None` or `"auto"` detects it.
    pub provider: Option<String>,
    /// Customer used when neither the call nor the ambient context names one.
    pub customer_id: Option<String>,
    /// Lowest-precedence metadata layer.
    pub metadata: Metadata,
    pub tracking_enabled: bool,
    pub auto_detect_provider: bool,
}

impl Default for TapOptions {
    fn default() -> Self {
        Self {
            provider: None,
            customer_id: None,
            metadata: Metadata::new(),
            tracking_enabled: true,
            auto_detect_provider: true,
        }
    }
}

impl TapOptions {
    pub fn from_settings(settings: &Settings) -> Self {
        let defaults = Self::default();
        Self {
            provider: settings.provider.clone(),
            customer_id: settings.customer_id.clone(),
            metadata: Metadata::new(),
            tracking_enabled: settings.tracking_enabled.unwrap_or(defaults.tracking_enabled),
            auto_detect_provider: settings
                .auto_detect_provider
                .unwrap_or(defaults.auto_detect_provider),
        }
    }

    pub fn provider(mut self, provider: impl Into<String>) -> Self {
        self.provider = Some(provider.into());
        self
    }

    pub fn customer_id(mut self, customer_id: impl Into<String>) -> Self {
        self.customer_id = Some(customer_id.into());
        self
    }

    pub fn metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn tracking_enabled(mut self, enabled: bool) -> Self {
        self.tracking_enabled = enabled;
        self
    }

    pub fn auto_detect_provider(mut self, enabled: bool) -> Self {
        self.auto_detect_provider = enabled;
        self
    }
}

#[derive(Debug, Error)]
pub enum WrapError {
    #[error("failed to construct client: {0:#}")]
    Construction(anyhow::Error),
    #[error("no collector API key: pass one explicitly or set USAGETAP_API_KEY")]
    MissingApiKey,
    #[error("failed to load settings: {0}")]
    Settings(#[from] config::ConfigError),
}

/// A client class that can be instantiated from constructor arguments.
pub trait ClientClass {
    fn construct(&self, args: Args) -> anyhow::Result<Arc<dyn Object>>;
}

impl<F> ClientClass for F
where
    F: Fn(Args) -> anyhow::Result<Arc<dyn Object>>,
{
    fn construct(&self, args: Args) -> anyhow::Result<Arc<dyn Object>> {
        (self)(args)
    }
}

/// A tracked client. Cheap to clone and safe to share across tasks.
#[derive(Clone, Debug)]
pub struct WrappedClient {
    root: Proxy,
    provider: String,
    tracking_enabled: bool,
    reporter: Option<Reporter>,
}

impl WrappedClient {
    /// Wrap an existing client object.
    pub fn wrap(client: Arc<dyn Object>, options: TapOptions, sink: Arc<dyn UsageSink>) -> Self {
        let provider = provider::detect_provider(
            client.as_ref(),
            options.provider.as_deref(),
            options.auto_detect_provider,
        );
        debug!(
            "Wrapping {} as provider {} (tracking {})",
            client.type_name(),
            provider,
            if options.tracking_enabled { "on" } else { "off" }
        );

        let state = TapState {
            provider: provider.clone(),
            customer_id: options.customer_id,
            metadata: options.metadata,
            tracking_enabled: options.tracking_enabled,
            sink,
        };
        Self {
            root: Proxy::new(client, Arc::new(state)),
            provider,
            tracking_enabled: options.tracking_enabled,
            reporter: None,
        }
    }

    /// Construct a client from its class and wrap it.
    pub fn instantiate(
        class: &dyn ClientClass,
        args: Args,
        options: TapOptions,
        sink: Arc<dyn UsageSink>,
    ) -> Result<Self, WrapError> {
        let client = class.construct(args).map_err(WrapError::Construction)?;
        Ok(Self::wrap(client, options, sink))
    }

    pub fn provider(&self) -> &str {
        &self.provider
    }

    pub fn tracking_enabled(&self) -> bool {
        self.tracking_enabled
    }

    pub fn inner(&self) -> &Arc<dyn Object> {
        self.root.inner()
    }

    pub fn proxy(&self) -> &Proxy {
        &self.root
    }

    pub fn member(&self, name: &str) -> Result<Member, AttributeError> {
        self.root.member(name)
    }

    pub fn namespace(&self, name: &str) -> Result<Proxy, AttributeError> {
        self.root.namespace(name)
    }

    pub fn method(&self, name: &str) -> Result<CallInterceptor, AttributeError> {
        self.root.method(name)
    }

    pub fn method_at(&self, path: &str) -> Result<CallInterceptor, AttributeError> {
        self.root.method_at(path)
    }

    /// Call the method at a dotted path, e.g. `chat.completions.create`.
    pub async fn call(&self, path: &str, args: Args) -> Result<Value, CallError> {
        self.root.call(path, args).await
    }

    /// Wait for queued events to reach the collector. A no-op for clients
    /// wrapped around a caller-supplied sink.
    pub async fn flush(&self) -> anyhow::Result<()> {
        match &self.reporter {
            Some(reporter) => reporter.flush().await,
            None => Ok(()),
        }
    }
}

/// Wrap `client` with a background reporter delivering to the log collector.
///
/// The key comes from `api_key`, then from `USAGETAP_API_KEY`. It is only
/// required while tracking is enabled.
pub fn track_ai(
    client: Arc<dyn Object>,
    api_key: Option<&str>,
    options: TapOptions,
) -> Result<WrappedClient, WrapError> {
    if !options.tracking_enabled {
        return Ok(WrappedClient::wrap(client, options, Arc::new(NoopSink)));
    }

    let api_key = match api_key {
        Some(key) => Some(key.to_string()),
        None => Settings::new()?.api_key,
    }
    .filter(|key| !key.is_empty())
    .ok_or(WrapError::MissingApiKey)?;

    let reporter = Reporter::spawn(Arc::new(LogCollector::new(&api_key)));
    let mut wrapped = WrappedClient::wrap(client, options, Arc::new(reporter.clone()));
    wrapped.reporter = Some(reporter);
    info!("Tracking {} client for provider {}", wrapped.inner().type_name(), wrapped.provider);
    Ok(wrapped)
}
