//! W3C trace context propagation for outbound workflow calls and published
//! event messages.

use opentelemetry::trace::TraceContextExt;
use reqwest::header::HeaderMap;
use std::collections::HashMap;
use tracing::Span;
use tracing_opentelemetry::OpenTelemetrySpanExt;

pub const TRACEPARENT_HEADER: &str = "traceparent";
pub const TRACESTATE_HEADER: &str = "tracestate";

/// Format the current span as `traceparent`/`tracestate` pairs. Empty when no
/// valid span context is active.
fn current_trace_pairs() -> Vec<(&'static str, String)> {
    let span = Span::current();
    let context = span.context();
    let otel_span = context.span();
    let span_context = otel_span.span_context();

    if !span_context.is_valid() {
        return Vec::new();
    }

    let mut pairs = vec![(
        TRACEPARENT_HEADER,
        format!(
            "00-{}-{}-{:02x}",
            span_context.trace_id(),
            span_context.span_id(),
            span_context.trace_flags().to_u8()
        ),
    )];

    let tracestate = span_context.trace_state().header();
    if !tracestate.is_empty() {
        pairs.push((TRACESTATE_HEADER, tracestate));
    }
    pairs
}

/// Inject the current trace context into HTTP request headers.
pub fn inject_trace_context(headers: &mut HeaderMap) {
    for (name, value) in current_trace_pairs() {
        if let Ok(value) = value.parse() {
            headers.insert(name, value);
        }
    }
}

/// Inject the current trace context into message metadata.
pub fn inject_trace_metadata(metadata: &mut HashMap<String, String>) {
    for (name, value) in current_trace_pairs() {
        metadata.insert(name.to_string(), value);
    }
}

/// Read the `traceparent` entry from message metadata.
pub fn extract_traceparent(metadata: &HashMap<String, String>) -> Option<String> {
    metadata.get(TRACEPARENT_HEADER).cloned()
}
