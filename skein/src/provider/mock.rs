//! Scripted provider for tests and offline development.

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::error::ProviderError;
use crate::message::{ChatRequest, ChatResponse};

use super::Provider;

/// Provider that replays a fixed script of responses (or errors) and
/// records every request it receives.
///
/// Each `chat` call pops the next script entry; an exhausted script is an
/// `Other` error so a runaway loop fails loudly instead of hanging.
pub struct MockProvider {
    name: String,
    script: Mutex<VecDeque<Result<ChatResponse, ProviderError>>>,
    requests: Mutex<Vec<ChatRequest>>,
}

impl MockProvider {
    pub fn new(script: Vec<Result<ChatResponse, ProviderError>>) -> Self {
        Self {
            name: "mock".to_string(),
            script: Mutex::new(script.into()),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Requests seen so far, in call order.
    pub fn requests(&self) -> Vec<ChatRequest> {
        self.requests.lock().expect("mock lock poisoned").clone()
    }

    /// Number of `chat` calls made.
    pub fn call_count(&self) -> usize {
        self.requests.lock().expect("mock lock poisoned").len()
    }
}

#[async_trait]
impl Provider for MockProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn chat(&self, request: &ChatRequest) -> Result<ChatResponse, ProviderError> {
        self.requests
            .lock()
            .expect("mock lock poisoned")
            .push(request.clone());
        self.script
            .lock()
            .expect("mock lock poisoned")
            .pop_front()
            .unwrap_or_else(|| {
                Err(ProviderError::Other(
                    "mock provider script exhausted".to_string(),
                ))
            })
    }
}
