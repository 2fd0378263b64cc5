pub mod handler;
pub mod key_generator;
pub mod path;
pub mod record;
pub mod wrapper;

pub use handler::{
    IdempotencyCleanupJob, IdempotencyHandler, IdempotencyMetrics, InvocationContext,
    MetricsSnapshot, ResponseHook,
};
pub use key_generator::{DerivedKey, HashFunction, IdempotencyKeyGenerator};
pub use path::{PathError, PathExpression};
pub use record::{IdempotencyRecord, IdempotencyStatus};
pub use wrapper::{idempotent, operation_scope, IdempotentFunction};
