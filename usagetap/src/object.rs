//! Capability interface for wrapped client objects.
//!
//! A provider client is described to the proxy as a graph of [`Object`]s. Each
//! object exposes named attributes that are either callable [`Method`]s or
//! plain [`Value`]s (JSON data or further objects). [`Record`] is a ready-made
//! object for clients that are assembled at runtime.

use std::{any::Any, borrow::Cow, collections::BTreeMap, fmt, future::Future, sync::Arc};

use futures::{FutureExt, future::BoxFuture};
use serde_json::Map;
use thiserror::Error;

/// Result of an attribute read or a method call on a wrapped object.
#[derive(Clone)]
pub enum Value {
    /// Plain data: mappings, lists and primitives.
    Data(serde_json::Value),
    /// An attribute-bearing object (an SDK response type, a sub-client, ...).
    Object(Arc<dyn Object>),
}

impl Value {
    pub fn null() -> Self {
        Value::Data(serde_json::Value::Null)
    }

    pub fn object<O: Object>(object: O) -> Self {
        Value::Object(Arc::new(object))
    }

    pub fn as_data(&self) -> Option<&serde_json::Value> {
        match self {
            Value::Data(data) => Some(data),
            Value::Object(_) => None,
        }
    }

    pub fn as_object(&self) -> Option<&Arc<dyn Object>> {
        match self {
            Value::Object(object) => Some(object),
            Value::Data(_) => None,
        }
    }

    /// Borrow the concrete object behind this value, if it is a `T`.
    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.as_object()?.as_any().downcast_ref::<T>()
    }

    /// Read a field, by attribute on objects and by key on JSON mappings.
    pub fn field(&self, name: &str) -> Option<Value> {
        match self {
            Value::Data(data) => data.get(name).cloned().map(Value::Data),
            Value::Object(object) => match object.attr(name)? {
                Attr::Value(value) => Some(value),
                Attr::Method(_) => None,
            },
        }
    }

    /// Walk a dot-separated path of fields, e.g. `usage.billed_units`.
    pub fn path(&self, path: &str) -> Option<Value> {
        let mut current = self.clone();
        for key in path.split('.').filter(|k| !k.is_empty()) {
            current = current.field(key)?;
        }
        Some(current)
    }

    pub fn as_str(&self) -> Option<&str> {
        self.as_data()?.as_str()
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Data(data) => f.debug_tuple("Data").field(data).finish(),
            Value::Object(object) => write!(f, "Object({})", object.type_name()),
        }
    }
}

/// Data compares by value, objects by identity.
impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Data(a), Value::Data(b)) => a == b,
            (Value::Object(a), Value::Object(b)) => {
                Arc::as_ptr(a) as *const () == Arc::as_ptr(b) as *const ()
            }
            _ => false,
        }
    }
}

impl From<serde_json::Value> for Value {
    fn from(data: serde_json::Value) -> Self {
        Value::Data(data)
    }
}

impl From<Arc<dyn Object>> for Value {
    fn from(object: Arc<dyn Object>) -> Self {
        Value::Object(object)
    }
}

/// A named member of an [`Object`].
#[derive(Clone)]
pub enum Attr {
    Method(Arc<dyn Method>),
    Value(Value),
}

impl fmt::Debug for Attr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Attr::Method(_) => f.write_str("Method"),
            Attr::Value(value) => f.debug_tuple("Value").field(value).finish(),
        }
    }
}

/// An attribute-bearing object, as seen by the proxy.
pub trait Object: Send + Sync + 'static {
    /// Class-like name of the object, e.g. `OpenAI`.
    fn type_name(&self) -> &str;

    /// Namespace the object originates from, e.g. `openai.resources.chat`.
    fn origin(&self) -> Option<&str> {
        None
    }

    fn attr(&self, name: &str) -> Option<Attr>;

    fn attr_names(&self) -> Vec<String>;

    fn as_any(&self) -> &dyn Any;

    /// Attribute access that fails like a missing attribute would.
    fn get(&self, name: &str) -> Result<Attr, AttributeError> {
        self.attr(name).ok_or_else(|| AttributeError::NotFound {
            owner: self.type_name().to_string(),
            name: name.to_string(),
        })
    }
}

/// A callable member. Closures `Fn(Args) -> impl Future` implement this.
pub trait Method: Send + Sync + 'static {
    fn call(&self, args: Args) -> BoxFuture<'static, Result<Value, CallError>>;
}

impl<F, Fut> Method for F
where
    F: Fn(Args) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, CallError>> + Send + 'static,
{
    fn call(&self, args: Args) -> BoxFuture<'static, Result<Value, CallError>> {
        (self)(args).boxed()
    }
}

/// Positional and keyword arguments of a call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Args {
    pub positional: Vec<serde_json::Value>,
    pub keyword: Map<String, serde_json::Value>,
}

impl Args {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arg(mut self, value: impl Into<serde_json::Value>) -> Self {
        self.positional.push(value.into());
        self
    }

    pub fn kwarg(mut self, name: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.keyword.insert(name.into(), value.into());
        self
    }

    /// Attach the customer id side-channel argument.
    pub fn customer_id(self, id: impl Into<String>) -> Self {
        self.kwarg(CUSTOMER_ID_ARG, id.into())
    }

    /// Attach the metadata side-channel argument.
    pub fn metadata(self, metadata: Map<String, serde_json::Value>) -> Self {
        self.kwarg(METADATA_ARG, serde_json::Value::Object(metadata))
    }

    pub fn get(&self, name: &str) -> Option<&serde_json::Value> {
        self.keyword.get(name)
    }
}

pub(crate) const CUSTOMER_ID_ARG: &str = "customer_id";
pub(crate) const METADATA_ARG: &str = "metadata";

/// Failure raised by a wrapped method.
///
/// `kind` is a stable tag standing in for the failing condition's class name.
pub struct CallError {
    kind: Cow<'static, str>,
    error: anyhow::Error,
}

impl CallError {
    pub fn new(kind: impl Into<Cow<'static, str>>, error: impl Into<anyhow::Error>) -> Self {
        Self {
            kind: kind.into(),
            error: error.into(),
        }
    }

    /// Error with a plain message.
    pub fn msg<M>(kind: impl Into<Cow<'static, str>>, message: M) -> Self
    where
        M: fmt::Display + fmt::Debug + Send + Sync + 'static,
    {
        Self::new(kind, anyhow::Error::msg(message))
    }

    /// Wrap a typed error, tagging it with the unqualified type name of `E`.
    pub fn from_error<E>(error: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::new(short_type_name::<E>(), error)
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn message(&self) -> String {
        self.error.to_string()
    }

    pub fn downcast_ref<E>(&self) -> Option<&E>
    where
        E: fmt::Display + fmt::Debug + Send + Sync + 'static,
    {
        self.error.downcast_ref::<E>()
    }

    pub fn into_inner(self) -> anyhow::Error {
        self.error
    }
}

impl From<anyhow::Error> for CallError {
    fn from(error: anyhow::Error) -> Self {
        Self::new("Error", error)
    }
}

impl fmt::Display for CallError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.error, f)
    }
}

impl fmt::Debug for CallError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallError")
            .field("kind", &self.kind)
            .field("error", &self.error)
            .finish()
    }
}

impl std::error::Error for CallError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.error.source()
    }
}

fn short_type_name<E>() -> &'static str {
    let full = std::any::type_name::<E>();
    let base = full.split('<').next().unwrap_or(full);
    base.rsplit("::").next().unwrap_or(base)
}

/// Attribute lookup failures, identical for wrapped and unwrapped objects.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AttributeError {
    #[error("'{owner}' object has no attribute '{name}'")]
    NotFound { owner: String, name: String },
    #[error("'{path}' is not callable")]
    NotCallable { path: String },
    #[error("'{path}' is not a namespace")]
    NotNamespace { path: String },
}

/// Object with a fixed attribute table.
pub struct Record {
    type_name: String,
    origin: Option<String>,
    attrs: BTreeMap<String, Attr>,
}

impl Record {
    pub fn new(type_name: impl Into<String>) -> Self {
        Self {
            type_name: type_name.into(),
            origin: None,
            attrs: BTreeMap::new(),
        }
    }

    pub fn origin(mut self, origin: impl Into<String>) -> Self {
        self.origin = Some(origin.into());
        self
    }

    pub fn method(mut self, name: impl Into<String>, method: impl Method) -> Self {
        self.attrs.insert(name.into(), Attr::Method(Arc::new(method)));
        self
    }

    pub fn value(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.attrs.insert(name.into(), Attr::Value(value.into()));
        self
    }

    pub fn object(self, name: impl Into<String>, object: impl Object) -> Self {
        self.value(name, Value::object(object))
    }

    pub fn into_object(self) -> Arc<dyn Object> {
        Arc::new(self)
    }
}

impl Object for Record {
    fn type_name(&self) -> &str {
        &self.type_name
    }

    fn origin(&self) -> Option<&str> {
        self.origin.as_deref()
    }

    fn attr(&self, name: &str) -> Option<Attr> {
        self.attrs.get(name).cloned()
    }

    fn attr_names(&self) -> Vec<String> {
        self.attrs.keys().cloned().collect()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[derive(Debug, Error)]
    #[error("rate limited")]
    struct RateLimitError;

    #[test]
    fn test_field_reads_attributes_and_keys_alike() {
        let usage = Record::new("Usage").value("prompt_tokens", json!(10));
        let response = Value::object(Record::new("Response").object("usage", usage));
        let mapping = Value::Data(json!({"usage": {"prompt_tokens": 10}}));

        assert_eq!(response.path("usage.prompt_tokens"), Some(json!(10).into()));
        assert_eq!(mapping.path("usage.prompt_tokens"), Some(json!(10).into()));
        assert_eq!(mapping.path("usage.missing"), None);
    }

    #[test]
    fn test_methods_are_not_fields() {
        let object = Value::object(
            Record::new("Client").method("create", |_args: Args| async { Ok(Value::null()) }),
        );
        assert!(object.field("create").is_none());
    }

    #[test]
    fn test_downcast_to_concrete_object() {
        let response = Value::object(Record::new("ChatCompletion"));
        let record = response.downcast_ref::<Record>().unwrap();
        assert_eq!(record.type_name(), "ChatCompletion");
        assert!(response.downcast_ref::<String>().is_none());
        assert!(Value::Data(json!({})).downcast_ref::<Record>().is_none());
    }

    #[test]
    fn test_get_reports_missing_attribute() {
        let record = Record::new("OpenAI");
        let err = record.get("nope").unwrap_err();
        assert_eq!(err.to_string(), "'OpenAI' object has no attribute 'nope'");
    }

    #[test]
    fn test_call_error_kind_from_type_name() {
        let err = CallError::from_error(RateLimitError);
        assert_eq!(err.kind(), "RateLimitError");
        assert_eq!(err.message(), "rate limited");
        assert!(err.downcast_ref::<RateLimitError>().is_some());
    }

    #[test]
    fn test_call_error_from_anyhow() {
        let err: CallError = anyhow::anyhow!("API Error").into();
        assert_eq!(err.kind(), "Error");
        assert_eq!(err.to_string(), "API Error");
    }

    #[test]
    fn test_object_values_compare_by_identity() {
        let object = Record::new("Response").into_object();
        let a = Value::Object(object.clone());
        let b = Value::Object(object);
        let c = Value::object(Record::new("Response"));
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_args_builder() {
        let args = Args::new()
            .arg("hello")
            .kwarg("model", "gpt-4")
            .customer_id("customer-1");
        assert_eq!(args.positional, vec![json!("hello")]);
        assert_eq!(args.get("model"), Some(&json!("gpt-4")));
        assert_eq!(args.get("customer_id"), Some(&json!("customer-1")));
    }
}
