pub mod logging;
pub mod trace_context;

pub use logging::init_tracing;
pub use trace_context::{
    TRACEPARENT_HEADER, TRACESTATE_HEADER, extract_traceparent, inject_trace_context,
    inject_trace_metadata,
};
