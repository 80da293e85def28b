//! Result type aliases for Memora.

use crate::MemoraError;

/// A specialized `Result` type for Memora operations.
pub type MemoraResult<T> = Result<T, MemoraError>;

/// A boxed future returning a `MemoraResult`.
pub type BoxFuture<'a, T> = std::pin::Pin<Box<dyn std::future::Future<Output = MemoraResult<T>> + Send + 'a>>;
