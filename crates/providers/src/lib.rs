//! Narrow LLM client interface.
//!
//! The gateway never runs inference itself; the LLM substrate talks to a
//! provider through [`LlmClient`]. Two implementations ship: an
//! Anthropic-style Messages API client and a deterministic mock used in
//! tests and when no credentials are configured.

pub mod anthropic;
pub mod mock;

use async_trait::async_trait;

use p3394_domain::config::LlmConfig;
use p3394_domain::error::{Error, Result};

#[derive(Debug, Clone, Default)]
pub struct LlmRequest {
    /// Fully composed prompt: persona, session context, user text, skill
    /// instructions.
    pub prompt: String,
    pub model: Option<String>,
    pub max_tokens: Option<u32>,
}

#[derive(Debug, Clone)]
pub struct LlmReply {
    pub text: String,
    pub model: String,
    pub input_tokens: u32,
    pub output_tokens: u32,
}

#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn complete(&self, request: LlmRequest) -> Result<LlmReply>;

    /// Provider name for logs and traces.
    fn name(&self) -> &str;
}

/// Build the configured client. `provider = "anthropic"` requires
/// `ANTHROPIC_API_KEY`; anything else falls back to the mock.
pub fn create_client(config: &LlmConfig) -> Result<Box<dyn LlmClient>> {
    match config.provider.as_str() {
        "anthropic" => {
            let api_key = std::env::var("ANTHROPIC_API_KEY")
                .map_err(|_| Error::Config("ANTHROPIC_API_KEY is not set".into()))?;
            Ok(Box::new(anthropic::AnthropicClient::new(config, api_key)?))
        }
        "mock" => Ok(Box::new(mock::MockLlm::default())),
        other => Err(Error::Config(format!("unknown llm provider: {other}"))),
    }
}
