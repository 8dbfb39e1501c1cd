//! Editor-facing glue for the stackward workflow engine.
//!
//! Tracks open templates, indexes their key paths for diagnostic
//! placement, forwards merged diagnostics to the client, and exposes the
//! validation and deployment workflows as custom requests. Connects to
//! editors via the `stackward lsp` CLI subcommand over stdio.

pub mod diagnostics;
pub mod document;
pub mod protocol;
pub mod server;
pub mod template_tree;

pub use server::{Backend, Server};

/// Run the LSP server over stdio. This is the public entry point
/// called by `stackward lsp`.
pub fn run(backend: Backend) -> Result<(), Box<dyn std::error::Error>> {
    server::run(backend)
}
