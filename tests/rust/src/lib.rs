//! Shared test utilities and fixtures for mcpstream integration tests.

pub use mcpstream_core::{
    ArtifactFields, EventValidator, SequenceManager, SignalPayload, StreamingConfig,
    StreamingContext, StreamingEvent,
};

pub use sinks::RecordingSink;

/// Context, router and token fixtures
pub mod fixtures {
    use mcpstream_core::{AuthResult, EventValidator, SequenceManager, StreamingConfig, StreamingContext};
    use mcpstream_gateway::auth::{AuthError, CredentialResolver};
    use mcpstream_gateway::{AuthConfig, StreamRouter, TokenAuthenticator};
    use std::sync::Arc;
    use std::time::Duration;

    /// Secret shared by [`authenticator`] and the HTTP test server
    pub const TEST_SECRET: &str = "integration-test-secret";

    /// Resolver granting every scope to every caller
    pub struct AllowAll;

    impl CredentialResolver for AllowAll {
        fn resolve(&self, _credential: Option<&str>) -> Result<AuthResult, AuthError> {
            Ok(AuthResult::user("tester", vec!["*".to_string()]))
        }
    }

    /// Contexts sharing one sequence manager and validator
    pub struct ContextFactory {
        pub sequences: Arc<SequenceManager>,
        pub validator: Arc<EventValidator>,
    }

    impl Default for ContextFactory {
        fn default() -> Self {
            Self {
                sequences: Arc::new(SequenceManager::new()),
                validator: Arc::new(EventValidator::default()),
            }
        }
    }

    impl ContextFactory {
        pub fn context(&self, id: &str) -> Arc<StreamingContext> {
            Arc::new(StreamingContext::new(
                id,
                self.sequences.clone(),
                self.validator.clone(),
            ))
        }
    }

    pub fn router(config: StreamingConfig) -> StreamRouter {
        StreamRouter::new(config, Arc::new(AllowAll))
    }

    pub fn auth_config() -> AuthConfig {
        AuthConfig {
            jwt_secret: Some(TEST_SECRET.to_string().into()),
            allow_anonymous: true,
            ..Default::default()
        }
    }

    pub fn authenticator() -> TokenAuthenticator {
        TokenAuthenticator::new(auth_config())
    }

    /// `Bearer <token>` for the given scopes
    pub fn bearer(scopes: &[&str]) -> String {
        let token = authenticator()
            .issue_token("test-user", scopes, Duration::from_secs(300))
            .expect("token");
        format!("Bearer {}", token)
    }
}

/// Event decoding helpers
pub mod decode {
    use mcpstream_core::StreamingEvent;
    use mcpstream_gateway::stream::parse_records;

    /// Decode concatenated SSE records into events
    pub fn events(text: &str) -> Vec<StreamingEvent> {
        parse_records(text)
            .iter()
            .map(|record| serde_json::from_str(&record.data).expect("event json"))
            .collect()
    }

    /// Sequence numbers of sequenced events, in delivery order
    pub fn seqs(events: &[StreamingEvent]) -> Vec<u64> {
        events.iter().filter_map(StreamingEvent::seq).collect()
    }
}
