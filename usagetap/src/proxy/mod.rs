//! Transparent proxy over a wrapped client's object graph.
//!
//! Members are resolved lazily on access: methods come back as
//! [`CallInterceptor`]s, sub-clients as nested [`Proxy`]s, and everything else
//! as the attribute value itself.

mod interceptor;

use std::{fmt, sync::Arc};

pub use interceptor::{CANCELLED_KIND, CallContext, CallInterceptor, PANIC_KIND, SideChannel};
pub(crate) use interceptor::TapState;

use crate::object::{Args, Attr, AttributeError, CallError, Object, Value};

/// A resolved attribute of a proxied object.
pub enum Member {
    Callable(CallInterceptor),
    Namespace(Proxy),
    Value(Value),
}

impl fmt::Debug for Member {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Member::Callable(interceptor) => f.debug_tuple("Callable").field(interceptor).finish(),
            Member::Namespace(proxy) => f.debug_tuple("Namespace").field(proxy).finish(),
            Member::Value(value) => f.debug_tuple("Value").field(value).finish(),
        }
    }
}

/// Surrogate for one object in the wrapped graph.
#[derive(Clone)]
pub struct Proxy {
    target: Arc<dyn Object>,
    path: String,
    state: Arc<TapState>,
}

impl Proxy {
    pub(crate) fn new(target: Arc<dyn Object>, state: Arc<TapState>) -> Self {
        Self {
            target,
            path: String::new(),
            state,
        }
    }

    /// The proxied object itself.
    pub fn inner(&self) -> &Arc<dyn Object> {
        &self.target
    }

    /// Dotted path from the client root; empty for the root.
    pub fn path(&self) -> &str {
        &self.path
    }

    fn child_path(&self, name: &str) -> String {
        if self.path.is_empty() {
            name.to_string()
        } else {
            format!("{}.{}", self.path, name)
        }
    }

    /// Resolve an attribute. Missing attributes fail exactly like [`Object::get`].
    pub fn member(&self, name: &str) -> Result<Member, AttributeError> {
        let member = match self.target.get(name)? {
            Attr::Method(method) => Member::Callable(CallInterceptor::new(
                method,
                self.child_path(name),
                Arc::clone(&self.state),
            )),
            Attr::Value(Value::Object(object)) if is_namespace(object.as_ref()) => {
                Member::Namespace(Proxy {
                    target: object,
                    path: self.child_path(name),
                    state: Arc::clone(&self.state),
                })
            }
            Attr::Value(value) => Member::Value(value),
        };
        Ok(member)
    }

    pub fn namespace(&self, name: &str) -> Result<Proxy, AttributeError> {
        match self.member(name)? {
            Member::Namespace(proxy) => Ok(proxy),
            _ => Err(AttributeError::NotNamespace {
                path: self.child_path(name),
            }),
        }
    }

    pub fn method(&self, name: &str) -> Result<CallInterceptor, AttributeError> {
        match self.member(name)? {
            Member::Callable(interceptor) => Ok(interceptor),
            _ => Err(AttributeError::NotCallable {
                path: self.child_path(name),
            }),
        }
    }

    /// Resolve a dotted method path such as `chat.completions.create`.
    pub fn method_at(&self, path: &str) -> Result<CallInterceptor, AttributeError> {
        let mut segments: Vec<&str> = path.split('.').collect();
        let last = segments.pop().unwrap_or_default();
        let mut current = self.clone();
        for segment in segments {
            current = current.namespace(segment)?;
        }
        current.method(last)
    }

    /// Resolve `path` and call it. Lookup failures surface as a `CallError`
    /// of kind `AttributeError` and are not reported.
    pub async fn call(&self, path: &str, args: Args) -> Result<Value, CallError> {
        let interceptor = self.method_at(path).map_err(CallError::from_error)?;
        interceptor.call(args).await
    }
}

impl fmt::Debug for Proxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Proxy")
            .field("type_name", &self.target.type_name())
            .field("path", &self.path)
            .finish()
    }
}

/// An object is proxied as a namespace when it has callable or object members.
pub fn is_namespace(object: &dyn Object) -> bool {
    object.attr_names().iter().any(|name| {
        matches!(
            object.attr(name),
            Some(Attr::Method(_)) | Some(Attr::Value(Value::Object(_)))
        )
    })
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::json;
    use usagetap_common::Metadata;

    use super::*;
    use crate::{
        context::{self, ScopeExt},
        object::Record,
        sink::{MemorySink, UsageSink},
    };

    fn meta(value: serde_json::Value) -> Metadata {
        value.as_object().cloned().unwrap_or_default()
    }

    fn openai_client() -> Arc<dyn Object> {
        let create = |args: Args| async move {
            let model = args.get("model").cloned().unwrap_or(json!("gpt-4"));
            assert!(args.get("customer_id").is_none());
            assert!(args.get("metadata").is_none());
            Ok::<_, CallError>(Value::Data(json!({
                "id": "chatcmpl-123",
                "model": model,
                "usage": {"prompt_tokens": 10, "completion_tokens": 20, "total_tokens": 30}
            })))
        };
        let completions = Record::new("Completions")
            .origin("openai.resources.chat.completions")
            .method("create", create);
        let chat = Record::new("Chat")
            .origin("openai.resources.chat")
            .object("completions", completions);
        Record::new("OpenAI")
            .origin("openai")
            .object("chat", chat)
            .value("api_key", json!("sk-test"))
            .object("config", Record::new("Config").value("timeout", json!(30)))
            .method("fail", |_args: Args| async {
                Err::<Value, _>(CallError::msg("Exception", "API Error"))
            })
            .method("crash", |args: Args| async move {
                if args.get("model").is_none() {
                    panic!("provider client crashed");
                }
                Ok::<_, CallError>(Value::null())
            })
            .method("slow", |_args: Args| async {
                tokio::time::sleep(Duration::from_secs(10)).await;
                Ok::<_, CallError>(Value::null())
            })
            .into_object()
    }

    fn proxy_with(sink: Arc<dyn UsageSink>, tracking_enabled: bool) -> Proxy {
        let state = TapState {
            provider: "openai".to_string(),
            customer_id: Some("default-customer".to_string()),
            metadata: meta(json!({"type": "test", "source": "default"})),
            tracking_enabled,
            sink,
        };
        Proxy::new(openai_client(), Arc::new(state))
    }

    #[tokio::test]
    async fn test_nested_method_reports_usage() {
        let sink = Arc::new(MemorySink::new());
        let proxy = proxy_with(sink.clone(), true);

        let response = proxy
            .call("chat.completions.create", Args::new().kwarg("model", "gpt-4o"))
            .await
            .unwrap();
        assert_eq!(response.path("usage.total_tokens"), Some(json!(30).into()));

        let events = sink.events();
        assert_eq!(events.len(), 1);
        let event = &events[0];
        assert_eq!(event.provider, "openai");
        assert_eq!(event.method, "chat.completions.create");
        assert_eq!(event.model.as_deref(), Some("gpt-4o"));
        assert_eq!((event.input_tokens, event.output_tokens, event.total_tokens), (10, 20, 30));
        assert!(!event.error_occurred);
    }

    #[tokio::test]
    async fn test_metadata_merge_precedence() {
        let sink = Arc::new(MemorySink::new());
        let proxy = proxy_with(sink.clone(), true);

        let ambient = meta(json!({"source": "context", "level": 1}));
        proxy
            .call(
                "chat.completions.create",
                Args::new().metadata(meta(json!({"source": "call", "extra": "value"}))),
            )
            .with_metadata(ambient)
            .await
            .unwrap();

        assert_eq!(
            sink.events()[0].metadata,
            meta(json!({"type": "test", "source": "call", "level": 1, "extra": "value"}))
        );
    }

    #[tokio::test]
    async fn test_customer_precedence() {
        let sink = Arc::new(MemorySink::new());
        let proxy = proxy_with(sink.clone(), true);
        context::clear_customer();

        proxy.call("chat.completions.create", Args::new()).await.unwrap();
        {
            let _scope = context::enter_customer_scope("context-customer");
            proxy.call("chat.completions.create", Args::new()).await.unwrap();
            proxy
                .call("chat.completions.create", Args::new().customer_id("call-customer"))
                .await
                .unwrap();
        }

        let customers: Vec<_> = sink.events().into_iter().map(|e| e.customer_id).collect();
        assert_eq!(
            customers,
            vec![
                Some("default-customer".to_string()),
                Some("context-customer".to_string()),
                Some("call-customer".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn test_error_reported_once_and_returned() {
        let sink = Arc::new(MemorySink::new());
        let proxy = proxy_with(sink.clone(), true);

        let err = proxy.call("fail", Args::new()).await.unwrap_err();
        assert_eq!(err.kind(), "Exception");
        assert_eq!(err.to_string(), "API Error");

        let events = sink.events();
        assert_eq!(events.len(), 1);
        assert!(events[0].error_occurred);
        assert_eq!(events[0].error_type.as_deref(), Some("Exception"));
        assert_eq!(events[0].error_message.as_deref(), Some("API Error"));
        assert_eq!(events[0].total_tokens, 0);
    }

    struct BrokenSink {
        panic: bool,
    }

    impl UsageSink for BrokenSink {
        fn report_usage(&self, _event: usagetap_common::UsageEvent) -> anyhow::Result<()> {
            if self.panic {
                panic!("sink exploded");
            }
            anyhow::bail!("sink unavailable")
        }
    }

    #[tokio::test]
    async fn test_broken_sink_never_breaks_the_call() {
        for panic in [false, true] {
            let proxy = proxy_with(Arc::new(BrokenSink { panic }), true);
            let response = proxy.call("chat.completions.create", Args::new()).await.unwrap();
            assert_eq!(response.path("id"), Some(json!("chatcmpl-123").into()));

            let err = proxy.call("fail", Args::new()).await.unwrap_err();
            assert_eq!(err.to_string(), "API Error");
        }
    }

    #[tokio::test]
    async fn test_disabled_tracking_strips_and_skips() {
        let sink = Arc::new(MemorySink::new());
        let proxy = proxy_with(sink.clone(), false);

        proxy
            .call(
                "chat.completions.create",
                Args::new().customer_id("c").metadata(meta(json!({"k": "v"}))),
            )
            .await
            .unwrap();
        assert!(sink.is_empty());
    }

    #[test]
    fn test_member_kinds() {
        let proxy = proxy_with(Arc::new(MemorySink::new()), true);

        assert!(matches!(proxy.member("chat"), Ok(Member::Namespace(_))));
        assert!(matches!(proxy.member("fail"), Ok(Member::Callable(_))));
        assert!(matches!(proxy.member("api_key"), Ok(Member::Value(Value::Data(_)))));
        // Objects without callable or object members pass through unproxied
        assert!(matches!(proxy.member("config"), Ok(Member::Value(Value::Object(_)))));

        let chat = proxy.namespace("chat").unwrap();
        assert_eq!(chat.path(), "chat");
        let create = chat.namespace("completions").unwrap().method("create").unwrap();
        assert_eq!(create.name(), "chat.completions.create");
    }

    #[test]
    fn test_missing_attribute_matches_direct_access() {
        let proxy = proxy_with(Arc::new(MemorySink::new()), true);
        let direct = proxy.inner().get("nonexistent").unwrap_err();
        let proxied = proxy.member("nonexistent").unwrap_err();
        assert_eq!(direct, proxied);
        assert_eq!(proxied.to_string(), "'OpenAI' object has no attribute 'nonexistent'");

        assert_eq!(
            proxy.method("chat").unwrap_err(),
            AttributeError::NotCallable { path: "chat".to_string() }
        );
        assert_eq!(
            proxy.namespace("fail").unwrap_err(),
            AttributeError::NotNamespace { path: "fail".to_string() }
        );
    }

    #[tokio::test]
    async fn test_missing_path_fails_without_event() {
        let sink = Arc::new(MemorySink::new());
        let proxy = proxy_with(sink.clone(), true);
        let err = proxy.call("chat.missing.create", Args::new()).await.unwrap_err();
        assert_eq!(err.kind(), "AttributeError");
        assert!(sink.is_empty());
    }

    #[tokio::test]
    async fn test_cancelled_call_is_reported() {
        let sink = Arc::new(MemorySink::new());
        let proxy = proxy_with(sink.clone(), true);

        let slow = proxy.method("slow").unwrap();
        let outcome = tokio::time::timeout(Duration::from_millis(10), slow.call(Args::new())).await;
        assert!(outcome.is_err());

        let events = sink.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].error_type.as_deref(), Some(CANCELLED_KIND));
        assert_eq!(events[0].method, "slow");
    }

    #[tokio::test]
    async fn test_scope_on_interceptor_future_applies() {
        let sink = Arc::new(MemorySink::new());
        let proxy = proxy_with(sink.clone(), true);
        context::clear_customer();
        context::clear_metadata();

        let create = proxy.method_at("chat.completions.create").unwrap();
        let call = create.call(Args::new());
        call.with_customer("scoped-customer")
            .with_metadata(meta(json!({"source": "scope"})))
            .await
            .unwrap();
        proxy
            .call("chat.completions.create", Args::new())
            .with_customer("scoped-customer")
            .await
            .unwrap();

        let events = sink.events();
        assert_eq!(events.len(), 2);
        assert!(
            events
                .iter()
                .all(|e| e.customer_id.as_deref() == Some("scoped-customer"))
        );
        assert_eq!(events[0].metadata, meta(json!({"type": "test", "source": "scope"})));
    }

    #[tokio::test]
    async fn test_panicking_method_is_reported_and_propagates() {
        let sink = Arc::new(MemorySink::new());
        let proxy = proxy_with(sink.clone(), true);

        let crash = proxy.method("crash").unwrap();
        let joined = tokio::spawn(crash.call(Args::new())).await;
        assert!(joined.unwrap_err().is_panic());

        let events = sink.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].error_type.as_deref(), Some(PANIC_KIND));
        assert!(events[0].error_occurred);
        assert_eq!(events[0].method, "crash");
        assert_eq!(events[0].usage(), usagetap_common::UsageRecord::default());
        assert!(events[0].usage().is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_tasks_keep_their_customer() {
        let sink = Arc::new(MemorySink::new());
        let proxy = proxy_with(sink.clone(), true);

        let tasks: Vec<_> = (0..5)
            .map(|i| {
                let proxy = proxy.clone();
                tokio::spawn(
                    async move {
                        tokio::task::yield_now().await;
                        proxy
                            .call("chat.completions.create", Args::new().kwarg("n", i))
                            .await
                            .map(|_| ())
                    }
                    .with_customer(format!("thread-{i}")),
                )
            })
            .collect();
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        let mut customers: Vec<_> = sink
            .events()
            .into_iter()
            .filter_map(|e| e.customer_id)
            .collect();
        customers.sort();
        assert_eq!(
            customers,
            (0..5).map(|i| format!("thread-{i}")).collect::<Vec<_>>()
        );
    }
}
