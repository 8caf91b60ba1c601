//! Provider decorator stack through the agent: transparent retry of
//! transport failures and the composed `decorate` order.

mod common;

use std::sync::Arc;
use std::time::Duration;

use skein::message::ChatResponse;
use skein::{
    decorate, AgentTask, LlmAgent, MockProvider, ProviderError, RetryConfig, RetryProvider,
    RunContext, TokenUsage,
};
use skein::Agent;

fn fast_retry() -> RetryConfig {
    RetryConfig::default()
        .with_initial_delay(Duration::from_millis(1))
        .with_max_delay(Duration::from_millis(2))
}

#[tokio::test]
async fn transient_503_retries_and_the_second_attempt_wins() {
    let inner = Arc::new(MockProvider::new(vec![
        Err(ProviderError::Server {
            status: 503,
            message: "overloaded".into(),
        }),
        Ok(ChatResponse::text("recovered").with_usage(TokenUsage::new(3, 1))),
    ]));
    let provider = Arc::new(RetryProvider::new(inner.clone(), fast_retry()));
    let agent = LlmAgent::builder("resilient", provider).build();

    let result = agent
        .execute(&RunContext::new(), AgentTask::new("hi"))
        .await
        .unwrap();
    assert_eq!(result.output, "recovered");
    assert_eq!(result.usage, TokenUsage::new(3, 1));
    assert_eq!(inner.call_count(), 2, "exactly two attempts");
}

#[tokio::test]
async fn exhausted_retries_surface_the_transport_error() {
    let inner = Arc::new(MockProvider::new(vec![
        Err(ProviderError::Network("timeout".into())),
        Err(ProviderError::Network("timeout".into())),
        Err(ProviderError::Network("timeout".into())),
    ]));
    let provider = Arc::new(RetryProvider::new(inner.clone(), fast_retry()));
    let agent = LlmAgent::builder("unlucky", provider).build();

    let error = agent
        .execute(&RunContext::new(), AgentTask::new("hi"))
        .await
        .unwrap_err();
    assert!(error.to_string().contains("timeout"));
    assert_eq!(inner.call_count(), 3);
}

#[tokio::test]
async fn composed_stack_is_transparent_on_the_happy_path() {
    let inner = Arc::new(MockProvider::new(vec![Ok(ChatResponse::text("plain"))]));
    let provider = decorate(inner.clone(), fast_retry(), 600, 100_000);
    assert_eq!(provider.name(), "mock");

    let agent = LlmAgent::builder("stacked", provider).build();
    let result = agent
        .execute(&RunContext::new(), AgentTask::new("hi"))
        .await
        .unwrap();
    assert_eq!(result.output, "plain");
    assert_eq!(inner.call_count(), 1);
}
