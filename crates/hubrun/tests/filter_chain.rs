//! Integration tests for filter chain construction and execution.

use std::sync::Arc;
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::json;

use hubrun::Codec;
use hubrun::Status;
use hubrun::context::CallContext;
use hubrun::context::HubContext;
use hubrun::descriptor::MethodDescriptor;
use hubrun::descriptor::MethodKind;
use hubrun::failure::Failure;
use hubrun::filter;
use hubrun::filter::Endpoint;
use hubrun::filter::Filter;
use hubrun::filter::FilterDescriptor;
use hubrun::filter::FilterObject;
use hubrun::filter::Next;
use hubrun::filter::Pipeline;
use hubrun::filter::Targets;
use hubrun::filter::TypeRegistry;
use hubrun::method::ServiceBuilder;

type Log = Arc<Mutex<Vec<String>>>;

fn log() -> Log {
    Arc::new(Mutex::new(Vec::new()))
}

fn entries(log: &Log) -> Vec<String> {
    log.lock().unwrap().clone()
}

/// Records entry and exit around the rest of the chain.
struct Tag {
    name: String,
    log: Log,
}

impl Tag {
    fn new(name: &str, log: &Log) -> Self {
        Self {
            name: name.to_string(),
            log: log.clone(),
        }
    }
}

#[async_trait]
impl<C: Send + 'static> Filter<C> for Tag {
    async fn invoke(&self, ctx: &mut C, next: Next<'_, C>) -> Result<(), Failure> {
        self.log.lock().unwrap().push(format!("enter {}", self.name));
        let result = next.run(ctx).await;
        self.log.lock().unwrap().push(format!("exit {}", self.name));
        result
    }
}

/// Refuses every call without running the rest of the chain.
struct Deny;

#[async_trait]
impl Filter<CallContext> for Deny {
    async fn invoke(&self, _ctx: &mut CallContext, _next: Next<'_, CallContext>) -> Result<(), Failure> {
        Err(Failure::new(Status::PermissionDenied, "denied"))
    }
}

/// Answers from a fixed value instead of running the body.
struct Cached(u32);

#[async_trait]
impl Filter<CallContext> for Cached {
    async fn invoke(&self, ctx: &mut CallContext, _next: Next<'_, CallContext>) -> Result<(), Failure> {
        ctx.set_response(self.0);
        Ok(())
    }
}

struct Body(Log);

#[async_trait]
impl Endpoint<CallContext> for Body {
    async fn call(&self, ctx: &mut CallContext) -> Result<(), Failure> {
        self.0.lock().unwrap().push("body".to_string());
        ctx.set_response(7u32);
        Ok(())
    }
}

fn context() -> CallContext {
    let descriptor = MethodDescriptor::new::<u32, u32>("Calc", "Answer", MethodKind::Unary);
    CallContext::new(Arc::new(descriptor), Codec::text())
}

fn pipeline(descriptors: &[FilterDescriptor], log: &Log) -> Pipeline<CallContext> {
    let chain = filter::build::<CallContext>(descriptors, &TypeRegistry::new()).unwrap();
    Pipeline::new(chain, Arc::new(Body(log.clone())))
}

// --- Ordering ---

#[tokio::test]
async fn test_filters_run_by_ascending_priority() {
    let log = log();
    let descriptors = vec![
        FilterDescriptor::instance(FilterObject::call(Tag::new("late", &log))).priority(10),
        FilterDescriptor::instance(FilterObject::call(Tag::new("early", &log))).priority(-5),
        FilterDescriptor::instance(FilterObject::call(Tag::new("first-zero", &log))),
        FilterDescriptor::instance(FilterObject::call(Tag::new("second-zero", &log))),
    ];
    let pipeline = pipeline(&descriptors, &log);

    let mut ctx = context();
    pipeline.invoke(&mut ctx).await.unwrap();

    assert_eq!(
        entries(&log),
        vec![
            "enter early",
            "enter first-zero",
            "enter second-zero",
            "enter late",
            "body",
            "exit late",
            "exit second-zero",
            "exit first-zero",
            "exit early",
        ]
    );
    assert_eq!(ctx.response::<u32>(), Some(&7));
}

#[tokio::test]
async fn test_empty_chain_runs_body_only() {
    let log = log();
    let pipeline = pipeline(&[], &log);
    assert!(pipeline.chain().is_empty());

    let mut ctx = context();
    pipeline.invoke(&mut ctx).await.unwrap();
    assert_eq!(entries(&log), vec!["body"]);
}

#[tokio::test]
async fn test_service_filters_precede_method_filters_at_equal_priority() {
    let log = log();
    let service = ServiceBuilder::new("Calc")
        .filter(FilterDescriptor::instance(FilterObject::call(Tag::new("service", &log))))
        .method_filter("Double", FilterDescriptor::instance(FilterObject::call(Tag::new("method", &log))))
        .method_filter(
            "Double",
            FilterDescriptor::instance(FilterObject::call(Tag::new("method-outer", &log))).priority(-1),
        )
        .unary("Double", |n: u32| async move { Ok(n * 2) })
        .unary("Half", |n: u32| async move { Ok(n / 2) })
        .build(&TypeRegistry::new())
        .unwrap();

    let hubrun::bind::BoundMethod::Call(double) = service.method("Double").unwrap() else {
        panic!("expected a call method");
    };
    assert_eq!(double.pipeline().chain().len(), 3);

    let mut ctx = double.context(Codec::text());
    double.decode_request(&mut ctx, b"21").unwrap();
    double.invoke(&mut ctx).await.unwrap();
    assert_eq!(double.encode_response(&mut ctx).unwrap(), b"42");

    assert_eq!(
        entries(&log),
        vec![
            "enter method-outer",
            "enter service",
            "enter method",
            "exit method",
            "exit service",
            "exit method-outer",
        ]
    );

    let hubrun::bind::BoundMethod::Call(half) = service.method("Half").unwrap() else {
        panic!("expected a call method");
    };
    assert_eq!(half.pipeline().chain().len(), 1);
}

// --- Short-Circuit ---

#[tokio::test]
async fn test_failing_filter_skips_inner_stages() {
    let log = log();
    let descriptors = vec![
        FilterDescriptor::instance(FilterObject::call(Tag::new("outer", &log))),
        FilterDescriptor::instance(FilterObject::call(Deny)).priority(1),
        FilterDescriptor::instance(FilterObject::call(Tag::new("inner", &log))).priority(2),
    ];
    let pipeline = pipeline(&descriptors, &log);

    let mut ctx = context();
    let failure = pipeline.invoke(&mut ctx).await.unwrap_err();

    assert_eq!(failure.status(), Status::PermissionDenied);
    assert_eq!(entries(&log), vec!["enter outer", "exit outer"]);
    assert!(!ctx.has_response());
}

#[tokio::test]
async fn test_filter_can_answer_without_body() {
    let log = log();
    let descriptors = vec![FilterDescriptor::instance(FilterObject::call(Cached(99)))];
    let pipeline = pipeline(&descriptors, &log);

    let mut ctx = context();
    pipeline.invoke(&mut ctx).await.unwrap();

    assert_eq!(ctx.take_response::<u32>(), Some(99));
    assert!(entries(&log).is_empty());
}

// --- Shapes and Factories ---

#[tokio::test]
async fn test_instances_without_capability_are_left_out() {
    let log = log();
    let descriptors = vec![
        FilterDescriptor::instance(FilterObject::session(Tag::new("session-only", &log))),
        FilterDescriptor::instance(FilterObject::both(Tag::new("both", &log))),
    ];

    let calls = filter::build::<CallContext>(&descriptors, &TypeRegistry::new()).unwrap();
    let sessions = filter::build::<HubContext>(&descriptors, &TypeRegistry::new()).unwrap();
    assert_eq!(calls.len(), 1);
    assert_eq!(sessions.len(), 2);
}

#[tokio::test]
async fn test_factory_without_capability_passes_through() {
    let log = log();
    let registry = {
        let log = log.clone();
        TypeRegistry::new().register("SessionAudit", move |_args| {
            Ok(FilterObject::session(Tag::new("audit", &log)))
        })
    };
    let descriptors = vec![FilterDescriptor::factory(Targets::CALL, "SessionAudit", Vec::new())];

    let chain = filter::build::<CallContext>(&descriptors, &registry).unwrap();
    assert_eq!(chain.len(), 1);
    assert_eq!(format!("{:?}", chain), "FilterChain { len: 1 }");

    let pipeline = Pipeline::new(chain, Arc::new(Body(log.clone())));
    let mut ctx = context();
    pipeline.invoke(&mut ctx).await.unwrap();
    assert_eq!(entries(&log), vec!["body"]);
}

#[tokio::test]
async fn test_factory_receives_its_arguments() {
    let log = log();
    let registry = {
        let log = log.clone();
        TypeRegistry::new().register("Named", move |args| {
            let name = args
                .first()
                .and_then(|v| v.as_str())
                .ok_or("Named takes a name")?;
            Ok(FilterObject::both(Tag::new(name, &log)))
        })
    };
    let descriptors = vec![
        FilterDescriptor::factory(Targets::BOTH, "Named", vec![json!("configured")]),
        FilterDescriptor::factory(Targets::SESSION, "Named", vec![json!("session-side")]),
    ];

    let chain = filter::build::<CallContext>(&descriptors, &registry).unwrap();
    assert_eq!(chain.len(), 1);

    let pipeline = Pipeline::new(chain, Arc::new(Body(log.clone())));
    pipeline.invoke(&mut context()).await.unwrap();
    assert_eq!(entries(&log), vec!["enter configured", "body", "exit configured"]);

    let bad = vec![FilterDescriptor::factory(Targets::CALL, "Named", Vec::new())];
    let err = filter::build::<CallContext>(&bad, &registry).unwrap_err();
    assert!(err.to_string().contains("Named takes a name"));
}

#[tokio::test]
async fn test_unresolvable_filter_fails_the_build() {
    let descriptors = vec![FilterDescriptor::factory(Targets::CALL, "Missing", Vec::new())];

    let err = filter::build::<CallContext>(&descriptors, &TypeRegistry::new()).unwrap_err();
    let filter::Error::Resolve { type_name, .. } = &err;
    assert_eq!(type_name, "Missing");

    let err = ServiceBuilder::new("Calc")
        .filter(FilterDescriptor::factory(Targets::CALL, "Missing", Vec::new()))
        .unary("Double", |n: u32| async move { Ok(n * 2) })
        .build(&TypeRegistry::new())
        .err()
        .unwrap();
    assert!(matches!(err, hubrun::method::Error::Filter(_)));
}

#[tokio::test]
async fn test_service_build_rejects_bad_registrations() {
    let duplicate = ServiceBuilder::new("Calc")
        .unary("Double", |n: u32| async move { Ok(n * 2) })
        .unary("Double", |n: u32| async move { Ok(n * 3) })
        .build(&TypeRegistry::new());
    assert!(matches!(duplicate, Err(hubrun::method::Error::DuplicateMethod { .. })));

    let stray = ServiceBuilder::new("Calc")
        .method_filter("Triple", FilterDescriptor::instance(FilterObject::call(Deny)))
        .unary("Double", |n: u32| async move { Ok(n * 2) })
        .build(&TypeRegistry::new());
    assert!(matches!(stray, Err(hubrun::method::Error::UnknownMethod { .. })));
}

#[tokio::test]
async fn test_chains_are_shared_across_concurrent_calls() {
    let log = log();
    let descriptors = vec![FilterDescriptor::instance(FilterObject::call(Tag::new("shared", &log)))];
    let pipeline = pipeline(&descriptors, &log);

    let calls: Vec<_> = (0..16)
        .map(|_| {
            let pipeline = pipeline.clone();
            tokio::spawn(async move {
                let mut ctx = context();
                pipeline.invoke(&mut ctx).await.unwrap();
                ctx.take_response::<u32>()
            })
        })
        .collect();

    for call in calls {
        assert_eq!(call.await.unwrap(), Some(7));
    }
    assert_eq!(entries(&log).len(), 16 * 3);
}
