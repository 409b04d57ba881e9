pub mod agent_loop;
pub mod error;
pub mod lifecycle;
pub mod llm;
pub mod orchestrator;
pub mod queue;
pub mod retry;
pub mod sandbox;
pub mod store;
pub mod terminal;
pub mod tools;
pub mod triggers;
pub mod version;
