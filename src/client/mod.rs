//! The session-side entry point: per-request dispatch over the pools kept by
//! a [`ConnectionPoolManager`](crate::ConnectionPoolManager).

pub mod session;
