/// Scripted client and record builders. Requires feature `test-fixtures`.
#[cfg(any(test, feature = "test-fixtures"))]
pub mod scripted;
pub mod twitter;
