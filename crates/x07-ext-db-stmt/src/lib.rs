//! Client-side statement execution: prepared-statement caching, batch
//! rewriting, generated-key tracking, statement/result-set lifecycle and
//! query timeouts, layered over a wire-level [`Transport`].

pub mod cache;
pub mod cancel;
pub mod config;
pub mod connection;
pub mod error;
pub mod keys;
pub mod result_set;
pub mod rewrite;
pub mod statement;
pub mod tokenizer;
pub mod transport;

pub use cache::{CacheKey, CacheStats, Concurrency, PrepareOptions, ResultSetType};
pub use config::{LifecyclePolicy, StmtConfig};
pub use connection::Connection;
pub use error::{
    BatchFailure, CancelReason, Error, HandleKind, ItemFailure, Result, TransportError,
};
pub use keys::{keys_from_last_insert_id, GeneratedKeySequence, KeyCursor};
pub use result_set::{ResultSetHandle, GENERATED_KEY_COLUMN};
pub use rewrite::{EXECUTE_FAILED, SUCCESS_NO_INFO};
pub use statement::{MoreResults, StatementHandle};
pub use tokenizer::{classify, Shape, StatementKind};
pub use transport::{
    ExecutionId, Outcome, Response, Row, RowSet, StatementId, Transport, UpdateResult, Value,
    Warning,
};
