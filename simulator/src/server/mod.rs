pub mod module;

pub use module::{serve_tcp, spawn_in_memory, ModuleServer, ServerOptions};
