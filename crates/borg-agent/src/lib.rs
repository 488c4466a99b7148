pub mod claude;
pub mod codex;
pub mod event;
pub mod instruction;
pub mod ollama;

pub use ollama::OllamaBackend;
