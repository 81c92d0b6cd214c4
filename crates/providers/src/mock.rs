//! Deterministic mock provider: echoes the tail of the prompt. Used by
//! tests and whenever no real provider is configured.

use p3394_domain::error::Result;

use crate::{LlmClient, LlmReply, LlmRequest};

#[derive(Debug, Default)]
pub struct MockLlm {
    /// Fixed reply override; when `None` the mock echoes the prompt tail.
    pub canned: Option<String>,
}

impl MockLlm {
    pub fn with_reply(text: impl Into<String>) -> Self {
        Self {
            canned: Some(text.into()),
        }
    }
}

#[async_trait::async_trait]
impl LlmClient for MockLlm {
    async fn complete(&self, request: LlmRequest) -> Result<LlmReply> {
        let text = match &self.canned {
            Some(canned) => canned.clone(),
            None => {
                let tail: String = request
                    .prompt
                    .lines()
                    .last()
                    .unwrap_or_default()
                    .chars()
                    .take(200)
                    .collect();
                format!("[mock] {tail}")
            }
        };
        Ok(LlmReply {
            input_tokens: (request.prompt.len() / 4) as u32,
            output_tokens: (text.len() / 4) as u32,
            model: request.model.unwrap_or_else(|| "mock".into()),
            text,
        })
    }

    fn name(&self) -> &str {
        "mock"
    }
}
