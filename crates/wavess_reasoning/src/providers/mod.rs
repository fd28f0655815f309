pub mod mock;
pub mod openai_compat;

pub use mock::{MockFailure, MockLlmClient, MockReply};
pub use openai_compat::OpenAiCompatClient;
