use std::{
    fmt,
    panic::{AssertUnwindSafe, catch_unwind},
    sync::Arc,
    time::Instant,
};

use chrono::{DateTime, Utc};
use futures::{FutureExt, future::BoxFuture};
use log::{debug, warn};
use usagetap_common::{Metadata, UsageEvent, UsageRecord};

use crate::{
    context::{self, overlay},
    object::{Args, CUSTOMER_ID_ARG, CallError, METADATA_ARG, Method, Value},
    sink::UsageSink,
    usage,
};

/// Kind reported for calls dropped before they completed.
pub const CANCELLED_KIND: &str = "Cancelled";
/// Kind reported for calls whose method panicked.
pub const PANIC_KIND: &str = "Panic";

/// Per-client tracking state shared by every proxy of one wrapped client.
pub(crate) struct TapState {
    pub(crate) provider: String,
    pub(crate) customer_id: Option<String>,
    pub(crate) metadata: Metadata,
    pub(crate) tracking_enabled: bool,
    pub(crate) sink: Arc<dyn UsageSink>,
}

impl TapState {
    /// Build an event and hand it to the sink. Failures and panics are logged.
    fn dispatch(&self, build: impl FnOnce() -> UsageEvent) {
        let outcome = catch_unwind(AssertUnwindSafe(|| {
            let event = build();
            self.sink.report_usage(event)
        }));
        match outcome {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("Failed to report usage event: {:#}", e),
            Err(_) => warn!("Usage reporting panicked; event dropped"),
        }
    }
}

/// Side-channel arguments recognized by the proxy.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct SideChannel {
    pub customer_id: Option<String>,
    pub metadata: Option<Metadata>,
}

impl SideChannel {
    /// Remove `customer_id` and `metadata` from the call's keyword arguments.
    pub fn strip(args: &mut Args) -> Self {
        let customer_id = match args.keyword.remove(CUSTOMER_ID_ARG) {
            Some(serde_json::Value::String(id)) => Some(id),
            Some(serde_json::Value::Null) | None => None,
            Some(other) => {
                debug!("Ignoring non-string customer_id argument: {}", other);
                None
            }
        };
        let metadata = match args.keyword.remove(METADATA_ARG) {
            Some(serde_json::Value::Object(map)) => Some(map),
            Some(serde_json::Value::Null) | None => None,
            Some(other) => {
                debug!("Ignoring non-mapping metadata argument: {}", other);
                None
            }
        };
        Self {
            customer_id,
            metadata,
        }
    }
}

/// Everything known about one invocation before it completes.
#[derive(Debug, Clone)]
pub struct CallContext {
    pub customer_id: Option<String>,
    pub metadata: Metadata,
    pub method: String,
    pub provider: String,
    /// `model` keyword argument, if the caller passed one.
    pub model: Option<String>,
    pub started: Instant,
    pub timestamp: DateTime<Utc>,
}

impl CallContext {
    /// Resolve customer and metadata: call site, then ambient, then client default.
    pub(crate) fn resolve(
        state: &TapState,
        method: &str,
        side: SideChannel,
        model: Option<String>,
    ) -> Self {
        let ambient = context::snapshot();

        let customer_id = side
            .customer_id
            .or(ambient.customer_id)
            .or_else(|| state.customer_id.clone());

        let mut metadata = state.metadata.clone();
        overlay(&mut metadata, ambient.metadata);
        if let Some(call) = side.metadata {
            overlay(&mut metadata, call);
        }

        Self {
            customer_id,
            metadata,
            method: method.to_string(),
            provider: state.provider.clone(),
            model,
            started: Instant::now(),
            timestamp: Utc::now(),
        }
    }

    fn into_event(
        self,
        usage: UsageRecord,
        model: Option<String>,
        error: Option<(String, String)>,
    ) -> UsageEvent {
        let latency_ms = u64::try_from(self.started.elapsed().as_millis()).unwrap_or(u64::MAX);
        let (error_type, error_message) = match error {
            Some((kind, message)) => (Some(kind), Some(message)),
            None => (None, None),
        };
        UsageEvent {
            customer_id: self.customer_id,
            provider: self.provider,
            model,
            method: self.method,
            input_tokens: usage.input_tokens,
            output_tokens: usage.output_tokens,
            total_tokens: usage.total_tokens,
            metadata: self.metadata,
            error_occurred: error_type.is_some(),
            error_type,
            error_message,
            latency_ms,
            timestamp: self.timestamp,
        }
    }

    pub fn success_event(self, response: &Value) -> UsageEvent {
        let usage = usage::normalize(response, &self.provider).unwrap_or_default();
        let model = usage::response_model(response, &self.provider).or_else(|| self.model.clone());
        self.into_event(usage, model, None)
    }

    pub fn failure_event(self, kind: &str, message: String) -> UsageEvent {
        let model = self.model.clone();
        self.into_event(UsageRecord::default(), model, Some((kind.to_string(), message)))
    }
}

/// `model` keyword argument, if the caller passed one as a string.
fn requested_model(args: &Args) -> Option<String> {
    args.get("model").and_then(|m| m.as_str()).map(str::to_string)
}

enum Stage {
    Unresolved {
        side: SideChannel,
        model: Option<String>,
    },
    Resolved(CallContext),
    Finished,
}

/// Tracks one call from creation to completion and reports a failure if the
/// call future goes away before finishing.
struct PendingCall {
    stage: Stage,
    name: String,
    state: Arc<TapState>,
}

impl PendingCall {
    /// Resolve customer and metadata against the ambient state current now.
    fn resolve(&mut self) {
        self.stage = match std::mem::replace(&mut self.stage, Stage::Finished) {
            Stage::Unresolved { side, model } => {
                Stage::Resolved(CallContext::resolve(&self.state, &self.name, side, model))
            }
            other => other,
        };
    }

    fn take_context(&mut self) -> Option<CallContext> {
        self.resolve();
        match std::mem::replace(&mut self.stage, Stage::Finished) {
            Stage::Resolved(context) => Some(context),
            _ => None,
        }
    }

    fn finish(&mut self, result: &Result<Value, CallError>) {
        let Some(context) = self.take_context() else {
            return;
        };
        match result {
            Ok(response) => self.state.dispatch(|| context.success_event(response)),
            Err(e) => self
                .state
                .dispatch(|| context.failure_event(e.kind(), e.message())),
        }
    }
}

impl Drop for PendingCall {
    fn drop(&mut self) {
        let Some(context) = self.take_context() else {
            return;
        };
        let (kind, message) = if std::thread::panicking() {
            (PANIC_KIND, "method panicked before completing")
        } else {
            (CANCELLED_KIND, "call was cancelled before completing")
        };
        self.state
            .dispatch(|| context.failure_event(kind, message.to_string()));
    }
}

/// Callable surrogate for one method of the wrapped client.
#[derive(Clone)]
pub struct CallInterceptor {
    method: Arc<dyn Method>,
    name: String,
    state: Arc<TapState>,
}

impl CallInterceptor {
    pub(crate) fn new(method: Arc<dyn Method>, name: String, state: Arc<TapState>) -> Self {
        Self {
            method,
            name,
            state,
        }
    }

    /// Dotted path of the method, e.g. `chat.completions.create`.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Invoke the method. Side-channel arguments are stripped now; customer
    /// and metadata are resolved when the returned future is first polled, so
    /// scopes applied to it with [`ScopeExt`](crate::context::ScopeExt) count.
    ///
    /// The returned future yields exactly what the method yields.
    pub fn call(&self, mut args: Args) -> BoxFuture<'static, Result<Value, CallError>> {
        let side = SideChannel::strip(&mut args);
        let method = Arc::clone(&self.method);
        if !self.state.tracking_enabled {
            return async move { method.call(args).await }.boxed();
        }

        let mut pending = PendingCall {
            stage: Stage::Unresolved {
                side,
                model: requested_model(&args),
            },
            name: self.name.clone(),
            state: Arc::clone(&self.state),
        };

        async move {
            pending.resolve();
            let result = method.call(args).await;
            pending.finish(&result);
            result
        }
        .boxed()
    }
}

impl Method for CallInterceptor {
    fn call(&self, args: Args) -> BoxFuture<'static, Result<Value, CallError>> {
        CallInterceptor::call(self, args)
    }
}

impl fmt::Debug for CallInterceptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallInterceptor")
            .field("name", &self.name)
            .field("provider", &self.state.provider)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::sink::NoopSink;

    fn state() -> TapState {
        TapState {
            provider: "openai".to_string(),
            customer_id: Some("default-customer".to_string()),
            metadata: json!({"type": "test", "source": "default"})
                .as_object()
                .cloned()
                .unwrap(),
            tracking_enabled: true,
            sink: Arc::new(NoopSink),
        }
    }

    #[test]
    fn test_strip_side_channel() {
        let mut args = Args::new()
            .kwarg("model", "gpt-4")
            .customer_id("call-customer")
            .metadata(json!({"source": "call"}).as_object().cloned().unwrap());

        let side = SideChannel::strip(&mut args);
        assert_eq!(side.customer_id.as_deref(), Some("call-customer"));
        assert_eq!(side.metadata.unwrap()["source"], "call");
        assert_eq!(args.keyword.len(), 1);
        assert!(args.get("customer_id").is_none());
        assert!(args.get("metadata").is_none());
    }

    #[test]
    fn test_malformed_side_channel_is_stripped_and_ignored() {
        let mut args = Args::new().kwarg("customer_id", 42).kwarg("metadata", "flat");
        let side = SideChannel::strip(&mut args);
        assert_eq!(side, SideChannel::default());
        assert!(args.keyword.is_empty());
    }

    #[test]
    fn test_resolve_uses_default_without_overrides() {
        context::clear_customer();
        context::clear_metadata();
        let ctx = CallContext::resolve(&state(), "create", SideChannel::default(), None);
        assert_eq!(ctx.customer_id.as_deref(), Some("default-customer"));
        assert_eq!(ctx.metadata["source"], "default");
        assert_eq!(ctx.model, None);
    }

    #[test]
    fn test_failure_event_has_zero_tokens() {
        let ctx = CallContext::resolve(
            &state(),
            "chat.completions.create",
            SideChannel::default(),
            requested_model(&Args::new().kwarg("model", "gpt-4")),
        );
        let event = ctx.failure_event("Exception", "API Error".to_string());
        assert!(event.error_occurred);
        assert_eq!(event.error_type.as_deref(), Some("Exception"));
        assert_eq!(event.error_message.as_deref(), Some("API Error"));
        assert_eq!(event.total_tokens, 0);
        assert_eq!(event.model.as_deref(), Some("gpt-4"));
    }
}
