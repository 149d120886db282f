//! Engine lifecycle event distribution.

pub mod bus;
