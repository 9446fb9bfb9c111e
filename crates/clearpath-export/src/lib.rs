//! Serialized and human-readable forms of CAP-1.0 traces.
//!
//! [`export_json`] and [`import_json`] are the interchange format. Import
//! checks structure only and hands back a [`clearpath_trace::Trace::ReadOnly`];
//! run [`clearpath_trace::TraceSource::verify`] on the result to check the
//! hash chain. [`render_markdown`] produces the audit view.

#![forbid(unsafe_code)]

mod json;
mod markdown;

pub use json::{
    export_json, export_json_pretty, export_record_json, import_json, ExportError,
};
pub use markdown::{render_markdown, render_trace_markdown};
