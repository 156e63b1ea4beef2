//! # Filter Chains
//!
//! Ordered interceptors composed around a method body.
//!
//! ## Philosophy
//!
//! - **Built Once**: descriptors are resolved, sorted and frozen at setup. A built chain
//!   is an immutable slice shared by every call, so concurrent calls never contend.
//! - **Middleware, Not Hooks**: a filter receives the context and the rest of the
//!   chain. It may act before `next`, skip `next` entirely, or act after `next`
//!   returns (or fails).
//! - **Two Shapes, One Model**: the same `Filter<C>` trait serves unary calls
//!   (`CallContext`) and hub invocations (`HubContext`). A `FilterObject` says which
//!   shapes an instance can intercept.
//!
//! ## Ordering
//!
//! Ascending priority. Equal priorities keep attachment order: service-level
//! descriptors first, then method-level, each in declaration order.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::context::CallContext;
use crate::context::HubContext;
use crate::failure::Failure;

/// Errors raised while building a chain. Serving must not start after one of these.
#[derive(Debug, Clone)]
pub enum Error {
    /// The instance resolver could not produce the requested filter.
    Resolve { type_name: String, message: String },
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Resolve { type_name, message } => {
                write!(f, "Failed to resolve filter {}: {}", type_name, message)
            }
        }
    }
}

impl std::error::Error for Error {}

pub type Result<T> = std::result::Result<T, Error>;

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// An interceptor around calls of shape `C`.
#[async_trait]
pub trait Filter<C>: Send + Sync + 'static {
    async fn invoke(&self, ctx: &mut C, next: Next<'_, C>) -> std::result::Result<(), Failure>;
}

/// The stage at the end of a chain: the method body, adapted to a context.
#[async_trait]
pub trait Endpoint<C>: Send + Sync + 'static {
    async fn call(&self, ctx: &mut C) -> std::result::Result<(), Failure>;
}

/// The remainder of a chain, handed to each filter.
pub struct Next<'a, C> {
    filters: &'a [Arc<dyn Filter<C>>],
    endpoint: &'a dyn Endpoint<C>,
}

impl<'a, C: Send + 'static> Next<'a, C> {
    /// Runs the remaining filters and then the endpoint.
    pub async fn run(self, ctx: &mut C) -> std::result::Result<(), Failure> {
        match self.filters.split_first() {
            Some((head, rest)) => {
                let next = Next {
                    filters: rest,
                    endpoint: self.endpoint,
                };
                head.invoke(ctx, next).await
            }
            None => self.endpoint.call(ctx).await,
        }
    }

    /// Number of filters still ahead of the endpoint.
    pub fn remaining(&self) -> usize {
        self.filters.len()
    }
}

/// A resolved, ordered, immutable chain.
pub struct FilterChain<C> {
    filters: Arc<[Arc<dyn Filter<C>>]>,
}

impl<C> Clone for FilterChain<C> {
    fn clone(&self) -> Self {
        Self {
            filters: self.filters.clone(),
        }
    }
}

impl<C> std::fmt::Debug for FilterChain<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FilterChain").field("len", &self.filters.len()).finish()
    }
}

impl<C: Send + 'static> FilterChain<C> {
    pub fn empty() -> Self {
        Self {
            filters: Arc::from(Vec::new()),
        }
    }

    pub fn len(&self) -> usize {
        self.filters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }

    pub async fn invoke(
        &self,
        ctx: &mut C,
        endpoint: &dyn Endpoint<C>,
    ) -> std::result::Result<(), Failure> {
        Next {
            filters: &self.filters,
            endpoint,
        }
        .run(ctx)
        .await
    }
}

/// A chain bound to its endpoint. This is what binders hold.
pub struct Pipeline<C> {
    chain: FilterChain<C>,
    endpoint: Arc<dyn Endpoint<C>>,
}

impl<C> Clone for Pipeline<C> {
    fn clone(&self) -> Self {
        Self {
            chain: self.chain.clone(),
            endpoint: self.endpoint.clone(),
        }
    }
}

impl<C: Send + 'static> Pipeline<C> {
    pub fn new(chain: FilterChain<C>, endpoint: Arc<dyn Endpoint<C>>) -> Self {
        Self { chain, endpoint }
    }

    pub fn chain(&self) -> &FilterChain<C> {
        &self.chain
    }

    pub async fn invoke(&self, ctx: &mut C) -> std::result::Result<(), Failure> {
        self.chain.invoke(ctx, &*self.endpoint).await
    }
}

/// Forwards to the next stage untouched.
///
/// Stands in for a factory-made instance that cannot intercept the current shape.
pub struct PassThrough;

#[async_trait]
impl<C: Send + 'static> Filter<C> for PassThrough {
    async fn invoke(&self, ctx: &mut C, next: Next<'_, C>) -> std::result::Result<(), Failure> {
        next.run(ctx).await
    }
}

/// The call shape a chain is built for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    Call,
    Session,
}

/// The shapes a factory descriptor applies to. Not exclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Targets {
    pub call: bool,
    pub session: bool,
}

impl Targets {
    pub const CALL: Self = Self { call: true, session: false };
    pub const SESSION: Self = Self { call: false, session: true };
    pub const BOTH: Self = Self { call: true, session: true };

    pub fn includes(self, target: Target) -> bool {
        match target {
            Target::Call => self.call,
            Target::Session => self.session,
        }
    }
}

/// A concrete filter instance and the shapes it can intercept.
#[derive(Clone, Default)]
pub struct FilterObject {
    call: Option<Arc<dyn Filter<CallContext>>>,
    session: Option<Arc<dyn Filter<HubContext>>>,
}

impl FilterObject {
    pub fn call<F: Filter<CallContext>>(filter: F) -> Self {
        Self {
            call: Some(Arc::new(filter)),
            session: None,
        }
    }

    pub fn session<F: Filter<HubContext>>(filter: F) -> Self {
        Self {
            call: None,
            session: Some(Arc::new(filter)),
        }
    }

    pub fn both<F>(filter: F) -> Self
    where
        F: Filter<CallContext> + Filter<HubContext>,
    {
        let filter = Arc::new(filter);
        Self {
            call: Some(filter.clone()),
            session: Some(filter),
        }
    }

    pub fn is_call(&self) -> bool {
        self.call.is_some()
    }

    pub fn is_session(&self) -> bool {
        self.session.is_some()
    }
}

impl std::fmt::Debug for FilterObject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FilterObject")
            .field("call", &self.is_call())
            .field("session", &self.is_session())
            .finish()
    }
}

/// Context types a chain can be built for.
pub trait FilterTarget: Send + Sized + 'static {
    const TARGET: Target;

    fn select(object: &FilterObject) -> Option<Arc<dyn Filter<Self>>>;
}

impl FilterTarget for CallContext {
    const TARGET: Target = Target::Call;

    fn select(object: &FilterObject) -> Option<Arc<dyn Filter<Self>>> {
        object.call.clone()
    }
}

impl FilterTarget for HubContext {
    const TARGET: Target = Target::Session;

    fn select(object: &FilterObject) -> Option<Arc<dyn Filter<Self>>> {
        object.session.clone()
    }
}

/// How a filter gets attached to a method or service.
#[derive(Clone, Debug)]
pub enum FilterDescriptor {
    /// A ready instance.
    Instance { object: FilterObject, priority: i32 },
    /// Created on demand by the instance resolver.
    Factory {
        targets: Targets,
        type_name: String,
        args: Vec<Value>,
        priority: i32,
    },
}

impl FilterDescriptor {
    pub fn instance(object: FilterObject) -> Self {
        Self::Instance { object, priority: 0 }
    }

    pub fn factory(targets: Targets, type_name: impl Into<String>, args: Vec<Value>) -> Self {
        Self::Factory {
            targets,
            type_name: type_name.into(),
            args,
            priority: 0,
        }
    }

    pub fn priority(mut self, order: i32) -> Self {
        match &mut self {
            Self::Instance { priority, .. } | Self::Factory { priority, .. } => *priority = order,
        }
        self
    }

    pub fn order(&self) -> i32 {
        match self {
            Self::Instance { priority, .. } | Self::Factory { priority, .. } => *priority,
        }
    }
}

/// Creates filter instances by type name. Injected by the host application.
pub trait InstanceResolver: Send + Sync {
    fn create(&self, type_name: &str, args: &[Value]) -> std::result::Result<FilterObject, BoxError>;
}

type Constructor = Box<dyn Fn(&[Value]) -> std::result::Result<FilterObject, BoxError> + Send + Sync>;

/// A resolver backed by registered constructor closures.
#[derive(Default)]
pub struct TypeRegistry {
    constructors: HashMap<String, Constructor>,
}

impl TypeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(mut self, type_name: impl Into<String>, constructor: F) -> Self
    where
        F: Fn(&[Value]) -> std::result::Result<FilterObject, BoxError> + Send + Sync + 'static,
    {
        self.constructors.insert(type_name.into(), Box::new(constructor));
        self
    }
}

impl InstanceResolver for TypeRegistry {
    fn create(&self, type_name: &str, args: &[Value]) -> std::result::Result<FilterObject, BoxError> {
        match self.constructors.get(type_name) {
            Some(constructor) => constructor(args),
            None => Err(format!("type {} is not registered", type_name).into()),
        }
    }
}

/// Service-level descriptors followed by method-level ones.
pub fn attach(service: &[FilterDescriptor], method: &[FilterDescriptor]) -> Vec<FilterDescriptor> {
    service.iter().chain(method.iter()).cloned().collect()
}

/// Resolves, orders and freezes `descriptors` into a chain for shape `C`.
///
/// Instances that cannot intercept `C` are left out. Factories aimed at `C` whose
/// product cannot intercept it become `PassThrough`.
pub fn build<C: FilterTarget>(
    descriptors: &[FilterDescriptor],
    resolver: &dyn InstanceResolver,
) -> Result<FilterChain<C>> {
    let mut ordered: Vec<(i32, Arc<dyn Filter<C>>)> = Vec::with_capacity(descriptors.len());

    for descriptor in descriptors {
        match descriptor {
            FilterDescriptor::Instance { object, priority } => {
                if let Some(filter) = C::select(object) {
                    ordered.push((*priority, filter));
                }
            }
            FilterDescriptor::Factory {
                targets,
                type_name,
                args,
                priority,
            } => {
                if !targets.includes(C::TARGET) {
                    continue;
                }
                let object = resolver.create(type_name, args).map_err(|e| Error::Resolve {
                    type_name: type_name.clone(),
                    message: e.to_string(),
                })?;
                let filter: Arc<dyn Filter<C>> = match C::select(&object) {
                    Some(filter) => filter,
                    None => {
                        tracing::debug!(type_name = %type_name, shape = ?C::TARGET, "filter lacks capability, passing through");
                        Arc::new(PassThrough)
                    }
                };
                ordered.push((*priority, filter));
            }
        }
    }

    // stable: equal priorities keep attachment order
    ordered.sort_by_key(|(priority, _)| *priority);

    let filters: Vec<Arc<dyn Filter<C>>> = ordered.into_iter().map(|(_, filter)| filter).collect();
    Ok(FilterChain {
        filters: Arc::from(filters),
    })
}
