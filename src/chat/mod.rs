//! The four stages of a chat turn: memory, planner, retriever (via
//! `crate::retrieve`), and generator, coordinated by the orchestrator.

pub mod expansion;
pub mod generator;
pub mod memory;
pub mod orchestrator;
pub mod planner;

pub use expansion::QueryExpander;
pub use generator::{GenerationEvent, GenerationStream, Generator, SourceRef};
pub use memory::{ConversationMemory, MemoryView};
pub use orchestrator::{ChatOrchestrator, OrchestratorConfig, TurnState};
pub use planner::{PlanDecision, Planner};
