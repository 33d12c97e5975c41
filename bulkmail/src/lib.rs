//! Library surface behind the `bulkmail` binary, kept thin: the standard
//! campaign handler, exposed so integration tests can drive it directly
//! without a running daemon.

pub mod handler;
