//! End-to-end scenario coverage.
//!
//! Every middleware has its own colocated unit tests; this module instead
//! assembles full chains (state-store, provider, validator, budget, duplex)
//! the way a caller would, and checks the cross-middleware invariants that
//! only show up once several of them run together — trace/message
//! consistency, cost accounting, and the source/provenance tagging a
//! multi-turn conversation relies on.

#[cfg(test)]
mod scenario_tests {
    use std::sync::Arc;

    use async_trait::async_trait;
    use serde_json::Value;

    use crate::chain::{Chain, Middleware, Next};
    use crate::context::{ExecutionContext, StreamChunk};
    use crate::error::Result;
    use crate::middleware::context_budget::{ContextBudgetMiddleware, ContextBudgetPolicy, TruncationStrategy};
    use crate::middleware::duplex::DuplexMiddleware;
    use crate::middleware::provider::ProviderMiddleware;
    use crate::middleware::state_store::{InMemoryStateStore, StateStore, StateStoreMiddleware};
    use crate::middleware::streaming_validator::{StreamingValidatorMiddleware, ValidatorConfig};
    use crate::tool::{MockOutcome, MockTool, ToolRegistry};
    use weft_llm::{
        ContentDelta, DuplexElement, DuplexProvider, MockProvider, MockStreamInputSession, Provider,
        ProviderRequest, ProviderResponse, ProviderToolCall, SharedProvider, StopReason,
        StreamInputSession, Usage,
    };
    use weft_types::{ConversationState, Message, Role, Source};

    /// S1-equivalent: a multi-round tool call. Also checks invariants 1
    /// (every trace record's `message_index` points at an assistant message
    /// whose timestamp falls within the call's measured window), 2 (a tool
    /// message's result id matches the tool call that produced it), and 4
    /// (accumulated cost equals the componentwise sum over both rounds).
    #[tokio::test]
    async fn multi_round_tool_call_keeps_trace_cost_and_message_invariants() {
        let mut registry = ToolRegistry::new();
        registry.register(MockTool::complete("echo", serde_json::json!({"result": "Hello from tool!"})));

        let first = ProviderResponse {
            id: "r1".into(),
            model: "m".into(),
            text: "Let me echo that.".into(),
            tool_calls: vec![ProviderToolCall {
                id: "call_1".into(),
                name: "echo".into(),
                arguments: serde_json::json!({"message": "Hello from tool!"}),
            }],
            stop_reason: StopReason::ToolUse,
            usage: Usage::new(10, 5),
        };
        let second = ProviderResponse {
            id: "r2".into(),
            model: "m".into(),
            text: "I've echoed your message: Hello from tool!".into(),
            tool_calls: Vec::new(),
            stop_reason: StopReason::EndTurn,
            usage: Usage::new(20, 10),
        };
        let provider: SharedProvider =
            Arc::new(MockProvider::new(vec![first, second]).with_costs(vec![0.0002, 0.0004]));
        let mw = Arc::new(ProviderMiddleware::new(provider, "mock-model").with_tool_registry(Arc::new(registry)));

        let mut ctx = ExecutionContext::new();
        ctx.allowed_tools = vec!["echo".to_string()];
        ctx.messages.push(Message::user("please echo"));

        let chain = Chain::new(vec![mw]);
        chain.process(&mut ctx).await.unwrap();

        assert_eq!(ctx.messages.len(), 4);
        assert_eq!(ctx.trace.llm_calls.len(), 2);
        assert_eq!(ctx.cost_info.input_tokens, 30);
        assert_eq!(ctx.cost_info.output_tokens, 15);
        assert!((ctx.cost_info.total_cost_usd - 0.0006).abs() < 1e-9);

        for call in &ctx.trace.llm_calls {
            let msg = &ctx.messages[call.message_index];
            assert_eq!(msg.role, Role::Assistant);
            let lower_bound = call.started_at;
            let upper_bound =
                call.started_at + chrono::Duration::from_std(call.duration).unwrap() + chrono::Duration::milliseconds(250);
            assert!(msg.timestamp >= lower_bound && msg.timestamp <= upper_bound);
        }

        let tool_msg = &ctx.messages[2];
        let tool_call_msg = &ctx.messages[1];
        assert_eq!(tool_msg.role, Role::Tool);
        assert_eq!(
            tool_msg.tool_result.as_ref().unwrap().tool_call_id,
            tool_call_msg.tool_calls[0].id
        );
    }

    /// S2-equivalent, and invariant 6 (a zero budget is covered directly in
    /// `context_budget`'s own tests; this proves the positive-budget path
    /// keeps only the most recent messages and tags the truncation).
    #[tokio::test]
    async fn budget_policy_keeps_most_recent_messages_within_budget() {
        let mut ctx = ExecutionContext::new();
        ctx.prompt = "system".to_string();
        for i in 0..4 {
            ctx.messages.push(Message::user(format!("message number {i} with several words in it")));
        }
        let last_content = ctx.messages.last().unwrap().content.clone();

        let mw = Arc::new(ContextBudgetMiddleware::new(ContextBudgetPolicy {
            budget: 30,
            reserve_for_output: 5,
            strategy: TruncationStrategy::Oldest,
            cache_breakpoints: false,
        }));
        let chain = Chain::new(vec![mw]);
        chain.process(&mut ctx).await.unwrap();

        assert!(ctx.messages.len() < 4);
        assert_eq!(ctx.messages.last().unwrap().content, last_content);
        assert_eq!(ctx.get_metadata("context_truncated"), Some(Value::Bool(true)));
        assert_eq!(ctx.get_metadata("context_original_count"), Some(Value::from(4u64)));
    }

    /// S3-equivalent, and invariant 5: a failed, non-suppressed validation
    /// both attaches its results to the assistant message *and* fails the
    /// turn, and a middleware wrapping the validator (here, state-store)
    /// observes the attached results even though the turn ultimately errors.
    #[tokio::test]
    async fn banned_word_interrupts_stream_then_fails_the_turn_and_is_observed_downstream() {
        let store = Arc::new(InMemoryStateStore::new());
        let state_mw = Arc::new(StateStoreMiddleware::new(store.clone(), "conv-validate", "user-validate"));
        let validator_mw = Arc::new(StreamingValidatorMiddleware::new(false));

        let mut ctx = ExecutionContext::new();
        ctx.set_metadata(
            "validator_configs",
            serde_json::to_value(vec![ValidatorConfig {
                validator_type: "banned_words".to_string(),
                enabled: true,
                params: serde_json::json!({"words": ["forbidden"]}),
            }])
            .unwrap(),
        );
        ctx.messages.push(Message::assistant("this has a forbidden word"));

        let chain = Chain::new(vec![state_mw, validator_mw]);
        let result = chain.process(&mut ctx).await;

        assert!(result.is_err());
        assert!(ctx.messages[0].validations.iter().any(|v| !v.passed));

        let saved = store.load("conv-validate").await.unwrap().unwrap();
        assert!(saved.messages[0].validations.iter().any(|v| !v.passed));
    }

    struct DuplexScenarioProvider {
        elements: std::sync::Mutex<Option<Vec<DuplexElement>>>,
    }

    impl DuplexScenarioProvider {
        fn new(elements: Vec<DuplexElement>) -> Self {
            Self { elements: std::sync::Mutex::new(Some(elements)) }
        }
    }

    #[async_trait]
    impl Provider for DuplexScenarioProvider {
        fn identifier(&self) -> &str {
            "scenario-duplex"
        }

        async fn predict(&self, _request: ProviderRequest) -> weft_llm::Result<ProviderResponse> {
            unimplemented!("duplex scenario never calls predict")
        }

        async fn predict_stream(&self, _request: ProviderRequest) -> weft_llm::Result<weft_llm::ResponseStream> {
            unimplemented!("duplex scenario never calls predict_stream")
        }

        fn calculate_cost(&self, _input_tokens: u64, _output_tokens: u64, _cached_tokens: u64) -> f64 {
            0.0
        }

        fn duplex_capable(&self) -> Option<&dyn DuplexProvider> {
            Some(self)
        }
    }

    #[async_trait]
    impl DuplexProvider for DuplexScenarioProvider {
        async fn open_duplex_session(
            &self,
            _request: ProviderRequest,
        ) -> weft_llm::Result<Box<dyn StreamInputSession>> {
            let elements = self.elements.lock().unwrap().take().unwrap_or_default();
            Ok(Box::new(MockStreamInputSession::new(elements)))
        }
    }

    fn metadata_flag(key: &str) -> std::collections::HashMap<String, Value> {
        let mut m = std::collections::HashMap::new();
        m.insert(key.to_string(), Value::Bool(true));
        m
    }

    /// S4-equivalent: interruption signals are purely informational (the
    /// turn keeps running), a terminal element with tool calls pauses for
    /// execution, and the next terminal element with content closes the
    /// turn.
    #[tokio::test]
    async fn duplex_interruption_signals_precede_tool_call_then_final_content() {
        let mut registry = ToolRegistry::new();
        registry.register(MockTool::new("lookup", MockOutcome::Complete(serde_json::json!("42"))));

        let elements = vec![
            DuplexElement { metadata: metadata_flag("interrupted"), ..Default::default() },
            DuplexElement { metadata: metadata_flag("interrupted_turn_complete"), ..Default::default() },
            DuplexElement {
                end_of_stream: true,
                tool_calls: vec![ProviderToolCall { id: "c1".into(), name: "lookup".into(), arguments: serde_json::json!({}) }],
                ..Default::default()
            },
            DuplexElement { end_of_stream: true, content: Some("the answer is 42".to_string()), ..Default::default() },
        ];

        let provider: SharedProvider = Arc::new(DuplexScenarioProvider::new(elements));
        let mw = Arc::new(DuplexMiddleware::new(provider, "mock-model").with_tool_registry(Arc::new(registry)));

        let mut ctx = ExecutionContext::new();
        ctx.stream_mode = true;
        let (input_tx, input_rx) = tokio::sync::mpsc::channel(1);
        let (output_tx, _output_rx) = tokio::sync::mpsc::channel(8);
        ctx.stream_input = Some(input_rx);
        ctx.stream_output = Some(output_tx);
        drop(input_tx);

        let chain = Chain::new(vec![mw]);
        chain.process(&mut ctx).await.unwrap();

        assert!(ctx.messages.iter().any(|m| m.role == Role::Tool));
        assert!(ctx.messages.iter().any(|m| m.role == Role::Assistant && m.content.contains("42")));
    }

    struct ScenarioStreamProvider {
        rounds: std::sync::Mutex<std::collections::VecDeque<Vec<weft_llm::StreamEvent>>>,
    }

    impl ScenarioStreamProvider {
        fn new(rounds: Vec<Vec<weft_llm::StreamEvent>>) -> Self {
            Self { rounds: std::sync::Mutex::new(rounds.into_iter().collect()) }
        }
    }

    #[async_trait]
    impl Provider for ScenarioStreamProvider {
        fn identifier(&self) -> &str {
            "scenario-stream"
        }

        async fn predict(&self, _request: ProviderRequest) -> weft_llm::Result<ProviderResponse> {
            unimplemented!("streaming scenario never calls predict")
        }

        async fn predict_stream(&self, _request: ProviderRequest) -> weft_llm::Result<weft_llm::ResponseStream> {
            let events = self.rounds.lock().unwrap().pop_front().unwrap_or_default();
            let events: Vec<weft_llm::Result<weft_llm::StreamEvent>> = events.into_iter().map(Ok).collect();
            Ok(Box::pin(futures::stream::iter(events)))
        }

        fn calculate_cost(&self, input_tokens: u64, output_tokens: u64, _cached_tokens: u64) -> f64 {
            input_tokens as f64 * 0.000_001 + output_tokens as f64 * 0.000_002
        }
    }

    struct InterruptAfter {
        remaining: std::sync::atomic::AtomicUsize,
    }

    impl InterruptAfter {
        fn new(n: usize) -> Self {
            Self { remaining: std::sync::atomic::AtomicUsize::new(n) }
        }
    }

    #[async_trait]
    impl Middleware for InterruptAfter {
        async fn process(&self, ctx: &mut ExecutionContext, next: Next<'_>) -> Result<()> {
            next.run(ctx).await
        }

        async fn stream_chunk(&self, ctx: &ExecutionContext, chunk: StreamChunk) -> Result<StreamChunk> {
            if self.remaining.fetch_sub(1, std::sync::atomic::Ordering::SeqCst) == 1 {
                ctx.interrupt_stream("scenario harness interrupt");
            }
            Ok(chunk)
        }
    }

    /// S5: a stream interrupted mid-turn still appends the partial content
    /// with an approximate, non-zero cost attached.
    ///
    /// The "approximate" tag lives on `ctx.metadata["cost_estimate_type"]`
    /// rather than a per-message `raw_response.cost_estimate_type` field —
    /// see DESIGN.md for why `Message` has no such bag.
    #[tokio::test]
    async fn interrupted_stream_preserves_partial_content_with_approximate_cost() {
        let events = vec![
            weft_llm::StreamEvent::ContentDelta { delta: ContentDelta::Text("Hi ".into()) },
            weft_llm::StreamEvent::ContentDelta { delta: ContentDelta::Text("there".into()) },
            weft_llm::StreamEvent::MessageDelta { stop_reason: StopReason::EndTurn, usage: Usage::new(5, 5) },
            weft_llm::StreamEvent::MessageStop,
        ];
        let provider: SharedProvider = Arc::new(ScenarioStreamProvider::new(vec![events]));
        let provider_mw = Arc::new(ProviderMiddleware::new(provider, "mock-model"));
        let interruptor = Arc::new(InterruptAfter::new(2));

        let mut ctx = ExecutionContext::new();
        ctx.stream_mode = true;
        ctx.messages.push(Message::user("hi"));

        let chain = Chain::new(vec![interruptor, provider_mw]);
        chain.process(&mut ctx).await.unwrap();

        assert_eq!(ctx.messages.len(), 2);
        assert_eq!(ctx.messages[1].content, "Hi there");
        assert!(ctx.cost_info.total_cost_usd > 0.0);
        assert_eq!(ctx.trace.llm_calls.len(), 1);
        assert!(ctx.trace.llm_calls[0].cost.is_none());
        assert_eq!(
            ctx.get_metadata("cost_estimate_type"),
            Some(Value::String("approximate".to_string()))
        );
    }

    /// S6: a message's `source` records whether it was loaded from prior
    /// state, supplied by the caller this turn, or generated by the
    /// pipeline.
    #[tokio::test]
    async fn source_field_marks_statestore_caller_and_pipeline_provenance() {
        let store = Arc::new(InMemoryStateStore::new());
        let mut seeded = ConversationState::new("conv-scenario", "user-scenario");
        seeded.messages.push(Message::user("first"));
        seeded.messages.push(Message::assistant("second"));
        store.save(seeded).await.unwrap();

        let provider: SharedProvider = Arc::new(MockProvider::with_text("reply"));
        let state_mw = Arc::new(StateStoreMiddleware::new(store.clone(), "conv-scenario", "user-scenario"));
        let provider_mw = Arc::new(ProviderMiddleware::new(provider, "mock-model"));

        let mut ctx = ExecutionContext::new();
        ctx.messages.push(Message::user("third"));

        let chain = Chain::new(vec![state_mw, provider_mw]);
        chain.process(&mut ctx).await.unwrap();

        assert_eq!(ctx.messages.len(), 4);
        assert_eq!(ctx.messages[0].source, Source::StateStore);
        assert_eq!(ctx.messages[1].source, Source::StateStore);
        assert_eq!(ctx.messages[2].source, Source::Caller);
        assert_eq!(ctx.messages[3].source, Source::Pipeline);
    }

    /// Invariant 3: once state-store saves, the persisted conversation
    /// carries every message the turn produced and every metadata key the
    /// turn set.
    #[tokio::test]
    async fn state_save_persists_every_message_and_metadata_key() {
        let store = Arc::new(InMemoryStateStore::new());
        let provider: SharedProvider = Arc::new(MockProvider::with_text("hello"));
        let state_mw = Arc::new(StateStoreMiddleware::new(store.clone(), "conv-persist", "user-persist"));
        let provider_mw = Arc::new(ProviderMiddleware::new(provider, "mock-model"));

        let mut ctx = ExecutionContext::new();
        ctx.messages.push(Message::user("hi"));
        ctx.set_metadata("custom_flag", Value::Bool(true));

        let chain = Chain::new(vec![state_mw, provider_mw]);
        chain.process(&mut ctx).await.unwrap();

        let saved = store.load("conv-persist").await.unwrap().unwrap();
        assert_eq!(saved.messages.len(), ctx.messages.len());
        for (key, value) in ctx.metadata_snapshot() {
            assert_eq!(saved.metadata.get(&key), Some(&value));
        }
    }
}
