//! # Call Failures
//!
//! `Failure` is the error type of filters and method bodies. A body may fail with a
//! structured `Fault`, which is carried to the caller intact, or with any other
//! error, which is flattened into `Status::Internal` at the binder boundary.
//!
//! Like `anyhow::Error`, `Failure` converts from every `std::error::Error` and for
//! that reason does not implement `std::error::Error` itself.

use std::any::Any;

use hubrpc::Fault;
use hubrpc::Status;

pub enum Failure {
    /// A structured failure meant for the caller.
    Fault(Fault),
    /// Anything else. Only its type name and message survive.
    Unexpected { type_name: &'static str, message: String },
}

impl Failure {
    pub fn new(status: Status, detail: impl Into<String>) -> Self {
        Self::Fault(Fault::new(status, detail))
    }

    /// The fault written to the wire for this failure.
    pub fn into_fault(self) -> Fault {
        match self {
            Self::Fault(fault) => fault,
            Self::Unexpected { type_name, message } => Fault::internal(type_name, message),
        }
    }

    pub fn as_fault(&self) -> Option<&Fault> {
        match self {
            Self::Fault(fault) => Some(fault),
            Self::Unexpected { .. } => None,
        }
    }

    pub fn status(&self) -> Status {
        match self {
            Self::Fault(fault) => fault.status,
            Self::Unexpected { .. } => Status::Internal,
        }
    }
}

impl<E> From<E> for Failure
where
    E: std::error::Error + Send + Sync + 'static,
{
    fn from(e: E) -> Self {
        let any: &dyn Any = &e;
        if let Some(fault) = any.downcast_ref::<Fault>() {
            return Self::Fault(fault.clone());
        }
        Self::Unexpected {
            type_name: std::any::type_name::<E>(),
            message: e.to_string(),
        }
    }
}

impl std::fmt::Display for Failure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Fault(fault) => write!(f, "{}", fault),
            Self::Unexpected { type_name, message } => write!(f, "{}: {}", type_name, message),
        }
    }
}

impl std::fmt::Debug for Failure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Fault(fault) => f.debug_tuple("Fault").field(fault).finish(),
            Self::Unexpected { type_name, message } => f
                .debug_struct("Unexpected")
                .field("type_name", type_name)
                .field("message", message)
                .finish(),
        }
    }
}
