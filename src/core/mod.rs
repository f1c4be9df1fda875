pub mod agent;
pub mod lifecycle;
pub mod llm;
pub mod mcp;
pub mod runner;
pub mod scheduler;
pub mod store;
pub mod terminal;
pub mod tools;
