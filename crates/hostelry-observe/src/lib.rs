//! Observability setup for Hostelry: tracing subscriber and optional
//! OpenTelemetry export.

pub mod tracing_setup;
