pub mod engine;
pub mod error;
pub mod llm;
pub mod parse;
pub mod pricing;
pub mod prompts;
pub mod providers;

pub use engine::{TurnOrchestrator, TurnRequest, TurnResult};
pub use error::{ErrorKind, ProviderError, TurnError};
pub use llm::{ChatMessage, ChatRole, Completion, GenerateParams, LlmClient};
pub use pricing::PricingTable;
