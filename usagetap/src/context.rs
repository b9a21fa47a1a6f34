//! Flow-local ambient customer id and metadata.
//!
//! Each thread carries its own ambient state. Synchronous code enters a scope
//! with a guard ([`enter_customer_scope`], [`enter_metadata_scope`]) that
//! restores the previous value when dropped. Futures use [`ScopeExt`], which
//! re-enters the scope around every poll so a task keeps its values when it
//! migrates between worker threads and never leaks them to tasks sharing the
//! same thread.
//!
//! A guard held across an `.await` stays in force for every future polled on
//! that thread meanwhile (for example siblings in a `futures::join!` on a
//! current-thread runtime), so async code should scope with [`ScopeExt`].

use std::{
    cell::RefCell,
    future::Future,
    marker::PhantomData,
    pin::Pin,
    task::{Context, Poll},
};

use usagetap_common::Metadata;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Ambient {
    pub customer_id: Option<String>,
    pub metadata: Metadata,
}

thread_local! {
    static AMBIENT: RefCell<Ambient> = RefCell::new(Ambient::default());
}

/// Innermost customer id of the current flow.
pub fn customer() -> Option<String> {
    AMBIENT.with(|a| a.borrow().customer_id.clone())
}

/// Innermost merged metadata of the current flow.
pub fn metadata() -> Metadata {
    AMBIENT.with(|a| a.borrow().metadata.clone())
}

pub fn snapshot() -> Ambient {
    AMBIENT.with(|a| a.borrow().clone())
}

/// Set the customer id without a scope. It stays until replaced or cleared.
pub fn set_customer(id: Option<String>) {
    AMBIENT.with(|a| a.borrow_mut().customer_id = id);
}

/// Replace the metadata without a scope. It stays until replaced or cleared.
pub fn set_metadata(metadata: Metadata) {
    AMBIENT.with(|a| a.borrow_mut().metadata = metadata);
}

pub fn clear_customer() {
    set_customer(None);
}

pub fn clear_metadata() {
    set_metadata(Metadata::new());
}

/// Restores the previous customer id when dropped.
#[must_use = "the scope ends as soon as the guard is dropped"]
pub struct CustomerScope {
    previous: Option<String>,
    _not_send: PhantomData<*const ()>,
}

impl Drop for CustomerScope {
    fn drop(&mut self) {
        let previous = self.previous.take();
        AMBIENT.with(|a| a.borrow_mut().customer_id = previous);
    }
}

/// Restores the previous metadata when dropped.
#[must_use = "the scope ends as soon as the guard is dropped"]
pub struct MetadataScope {
    previous: Metadata,
    _not_send: PhantomData<*const ()>,
}

impl Drop for MetadataScope {
    fn drop(&mut self) {
        let previous = std::mem::take(&mut self.previous);
        AMBIENT.with(|a| a.borrow_mut().metadata = previous);
    }
}

pub fn enter_customer_scope(id: impl Into<String>) -> CustomerScope {
    enter_customer(Some(id.into()))
}

fn enter_customer(id: Option<String>) -> CustomerScope {
    let previous = AMBIENT.with(|a| std::mem::replace(&mut a.borrow_mut().customer_id, id));
    CustomerScope {
        previous,
        _not_send: PhantomData,
    }
}

/// Overlay `metadata` onto the current metadata for the guard's lifetime.
/// Inner keys win on collision; outer keys stay visible.
pub fn enter_metadata_scope(metadata: Metadata) -> MetadataScope {
    let previous = AMBIENT.with(|a| {
        let mut ambient = a.borrow_mut();
        let mut merged = ambient.metadata.clone();
        overlay(&mut merged, metadata);
        std::mem::replace(&mut ambient.metadata, merged)
    });
    MetadataScope {
        previous,
        _not_send: PhantomData,
    }
}

/// Run `f` with `id` as the ambient customer. Restored on return and on unwind.
pub fn with_customer_scope<R>(id: impl Into<String>, f: impl FnOnce() -> R) -> R {
    let _scope = enter_customer_scope(id);
    f()
}

/// Run `f` with `metadata` overlaid on the ambient metadata.
pub fn with_metadata_scope<R>(metadata: Metadata, f: impl FnOnce() -> R) -> R {
    let _scope = enter_metadata_scope(metadata);
    f()
}

/// Shallow key-wise merge; keys from `layer` overwrite keys in `base`.
pub(crate) fn overlay(base: &mut Metadata, layer: Metadata) {
    for (key, value) in layer {
        base.insert(key, value);
    }
}

/// Future adapter entering ambient scopes around each poll.
pub struct Scoped<F> {
    inner: Pin<Box<F>>,
    customer_id: Option<String>,
    metadata: Option<Metadata>,
}

impl<F: Future> Scoped<F> {
    pub fn with_customer(mut self, id: impl Into<String>) -> Self {
        self.customer_id = Some(id.into());
        self
    }

    pub fn with_metadata(mut self, metadata: Metadata) -> Self {
        let mut merged = self.metadata.take().unwrap_or_default();
        overlay(&mut merged, metadata);
        self.metadata = Some(merged);
        self
    }
}

impl<F: Future> Future for Scoped<F> {
    type Output = F::Output;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let _customer = this.customer_id.clone().map(|id| enter_customer(Some(id)));
        let _metadata = this.metadata.clone().map(enter_metadata_scope);
        this.inner.as_mut().poll(cx)
    }
}

pub trait ScopeExt: Future + Sized {
    /// Poll this future with `id` as the ambient customer.
    fn with_customer(self, id: impl Into<String>) -> Scoped<Self> {
        Scoped {
            inner: Box::pin(self),
            customer_id: None,
            metadata: None,
        }
        .with_customer(id)
    }

    /// Poll this future with `metadata` overlaid on the ambient metadata.
    fn with_metadata(self, metadata: Metadata) -> Scoped<Self> {
        Scoped {
            inner: Box::pin(self),
            customer_id: None,
            metadata: None,
        }
        .with_metadata(metadata)
    }
}

impl<F: Future> ScopeExt for F {}
