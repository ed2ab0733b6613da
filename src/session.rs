//! Chat session: one conversation plus at most one attached document.
//!
//! The session owns the conversation between turns. A background turn takes
//! it for its duration and hands it back through [`ChatSession::finish_turn`].

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::agent_core::{Agent, AgentError, Conversation, TurnHandle, TurnOutcome};
use crate::config::RetrievalConfig;
use crate::retrieval::{
    Embedder, EmbeddingCache, HashingEmbedder, HttpEmbedder, RetrievalChunk, RetrievalIndex,
};

pub struct ChatSession {
    agent: Arc<Agent>,
    conversation: Conversation,
    document: Option<RetrievalIndex>,
    retrieval: RetrievalConfig,
    embedder: Arc<dyn Embedder>,
    cache: Option<EmbeddingCache>,
    turn_in_flight: bool,
}

impl ChatSession {
    /// Create a session with the embedder and cache selected by `retrieval`.
    pub fn new(agent: Arc<Agent>, retrieval: RetrievalConfig) -> Result<Self, AgentError> {
        let embedder: Arc<dyn Embedder> = match retrieval.embedding_endpoint.as_deref() {
            Some(endpoint) => Arc::new(HttpEmbedder::new(endpoint)?),
            None => Arc::new(HashingEmbedder::new(retrieval.embedding_dim)),
        };
        let cache = retrieval.embedding_cache.then(EmbeddingCache::in_data_dir);
        let session = Self::with_embedder(agent, retrieval, embedder);
        Ok(match cache {
            Some(cache) => session.with_cache(cache),
            None => session,
        })
    }

    pub fn with_embedder(
        agent: Arc<Agent>,
        retrieval: RetrievalConfig,
        embedder: Arc<dyn Embedder>,
    ) -> Self {
        Self {
            agent,
            conversation: Conversation::new(),
            document: None,
            retrieval,
            embedder,
            cache: None,
            turn_in_flight: false,
        }
    }

    /// Reuse document embeddings stored in `cache`.
    pub fn with_cache(mut self, cache: EmbeddingCache) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn conversation(&self) -> &Conversation {
        &self.conversation
    }

    pub fn document(&self) -> Option<&RetrievalIndex> {
        self.document.as_ref()
    }

    /// Index `text` as this conversation's document, replacing any previous
    /// one. Returns the number of chunks.
    pub async fn attach_document(&mut self, source: &str, text: &str) -> Result<usize, AgentError> {
        let index = RetrievalIndex::build_cached(
            source,
            text,
            self.retrieval.chunk_size_lines,
            self.retrieval.overlap_lines,
            self.embedder.clone(),
            self.cache.as_ref(),
        )
        .await?;

        if let Some(previous) = self.document.as_ref() {
            tracing::info!(
                conversation = %self.conversation.id,
                previous = %previous.source(),
                "replacing attached document"
            );
        }
        let chunks = index.len();
        self.document = Some(index);
        Ok(chunks)
    }

    pub fn detach_document(&mut self) {
        if let Some(index) = self.document.take() {
            tracing::info!(
                conversation = %self.conversation.id,
                source = %index.source(),
                "document detached"
            );
        }
    }

    /// Chunks of the attached document relevant to `query`.
    ///
    /// A failed query degrades to no grounding.
    pub async fn grounding_for(&self, query: &str) -> Vec<RetrievalChunk> {
        let Some(index) = self.document.as_ref() else {
            return Vec::new();
        };
        match index
            .query_with_threshold(query, self.retrieval.top_k, self.retrieval.min_similarity)
            .await
        {
            Ok(hits) => hits.into_iter().map(|hit| hit.chunk).collect(),
            Err(e) => {
                tracing::warn!(
                    conversation = %self.conversation.id,
                    source = %index.source(),
                    error = %e,
                    "retrieval query failed, continuing without grounding"
                );
                Vec::new()
            }
        }
    }

    /// Run one turn in place.
    pub async fn run_turn(
        &mut self,
        user_message: &str,
        cancel: CancellationToken,
    ) -> Result<TurnOutcome, AgentError> {
        self.ensure_idle()?;
        let grounding = self.grounding_for(user_message).await;
        self.agent
            .run_turn(&mut self.conversation, user_message, &grounding, cancel)
            .await
    }

    /// Start a background turn. The conversation is held by the turn until
    /// [`Self::finish_turn`].
    pub async fn begin_turn(&mut self, user_message: &str) -> Result<TurnHandle, AgentError> {
        self.ensure_idle()?;
        let grounding = self.grounding_for(user_message).await;
        let conversation = std::mem::take(&mut self.conversation);
        self.turn_in_flight = true;
        Ok(self
            .agent
            .spawn_turn(conversation, user_message.to_string(), grounding))
    }

    /// Wait for a background turn and take the conversation back.
    pub async fn finish_turn(&mut self, handle: TurnHandle) -> Result<TurnOutcome, AgentError> {
        let finished = handle.wait().await;
        self.turn_in_flight = false;
        let finished = finished?;
        self.conversation = finished.conversation;
        finished.result
    }

    fn ensure_idle(&self) -> Result<(), AgentError> {
        if self.turn_in_flight {
            return Err(AgentError::Config {
                reason: "a turn is already in flight for this conversation".to_string(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent_core::{AgentSettings, ContextBudget, Dispatcher, ToolPolicy};
    use crate::config::{BudgetConfig, ModelConfig, ToolTimeouts};
    use crate::inference::{ChatMessage, ChatModel, InferenceError};
    use crate::mcp_client::{ConnectionSettings, ProviderPool, ToolRegistry};
    use crate::retrieval::RetrievalError;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Answers every prompt, recording the system message it saw.
    #[derive(Default)]
    struct Echo {
        system_prompts: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl ChatModel for Echo {
        async fn complete(
            &self,
            messages: &[ChatMessage],
            _schema: Option<&serde_json::Value>,
        ) -> Result<String, InferenceError> {
            if let Some(first) = messages.first() {
                self.system_prompts.lock().unwrap().push(first.content.clone());
            }
            Ok(r#"{"action":"respond","final_text":"ok"}"#.to_string())
        }
    }

    fn session(model: Arc<Echo>) -> ChatSession {
        let dispatcher = Dispatcher::new(
            Arc::new(ProviderPool::new(ConnectionSettings::default())),
            Arc::new(ToolRegistry::new()),
            ToolPolicy::allow_all(),
            ToolTimeouts::default(),
        );
        let agent = Agent::new(
            model,
            dispatcher,
            ContextBudget::from_config(&ModelConfig::default(), &BudgetConfig::default()),
            AgentSettings::default(),
        );
        let retrieval = RetrievalConfig {
            chunk_size_lines: 1,
            overlap_lines: 0,
            top_k: 1,
            min_similarity: -1.0,
            embedding_cache: false,
            ..RetrievalConfig::default()
        };
        ChatSession::new(Arc::new(agent), retrieval).unwrap()
    }

    /// Hashing embedder that counts the texts it is asked to embed.
    struct CountingEmbedder {
        inner: HashingEmbedder,
        embedded: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Embedder for CountingEmbedder {
        async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, RetrievalError> {
            self.embedded.fetch_add(texts.len(), Ordering::SeqCst);
            self.inner.embed(texts).await
        }

        fn cache_id(&self) -> String {
            self.inner.cache_id()
        }
    }

    const DOC: &str = "The warranty lasts two years.\nReturns are accepted within 14 days.";

    #[tokio::test]
    async fn test_attached_document_grounds_the_turn() {
        let model = Arc::new(Echo::default());
        let mut session = session(model.clone());
        assert_eq!(session.attach_document("policy.txt", DOC).await.unwrap(), 2);

        let outcome = session
            .run_turn("the warranty lasts how long", CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome.final_text, "ok");

        let prompts = model.system_prompts.lock().unwrap();
        assert!(prompts[0].contains("--- DOCUMENT CONTEXT ---"));
        assert!(prompts[0].contains("[policy.txt lines 1-1]"));
        assert_eq!(session.conversation().messages[0].attachments, vec!["policy.txt"]);
    }

    #[tokio::test]
    async fn test_detach_removes_grounding() {
        let model = Arc::new(Echo::default());
        let mut session = session(model.clone());
        session.attach_document("policy.txt", DOC).await.unwrap();
        session.detach_document();
        assert!(session.document().is_none());

        session
            .run_turn("warranty?", CancellationToken::new())
            .await
            .unwrap();
        assert!(!model.system_prompts.lock().unwrap()[0].contains("DOCUMENT CONTEXT"));
    }

    #[tokio::test]
    async fn test_attach_replaces_previous_document() {
        let mut session = session(Arc::new(Echo::default()));
        session.attach_document("a.txt", DOC).await.unwrap();
        session.attach_document("b.txt", "one line").await.unwrap();
        assert_eq!(session.document().unwrap().source(), "b.txt");
    }

    #[tokio::test]
    async fn test_background_turn_returns_conversation() {
        let mut session = session(Arc::new(Echo::default()));
        let handle = session.begin_turn("hello").await.unwrap();
        assert!(session.begin_turn("again").await.is_err());

        let outcome = session.finish_turn(handle).await.unwrap();
        assert_eq!(outcome.final_text, "ok");
        assert_eq!(session.conversation().len(), 2);
    }

    #[tokio::test]
    async fn test_reattaching_same_text_uses_cached_embeddings() {
        let dir = tempfile::tempdir().unwrap();
        let embedded = Arc::new(AtomicUsize::new(0));
        let embedder = Arc::new(CountingEmbedder {
            inner: HashingEmbedder::new(64),
            embedded: embedded.clone(),
        });
        let base = session(Arc::new(Echo::default()));
        let mut session =
            ChatSession::with_embedder(base.agent.clone(), base.retrieval.clone(), embedder)
                .with_cache(EmbeddingCache::new(dir.path()));

        assert_eq!(session.attach_document("policy.txt", DOC).await.unwrap(), 2);
        assert_eq!(embedded.load(Ordering::SeqCst), 2);
        let first: Vec<Vec<f32>> = session
            .document()
            .unwrap()
            .chunks()
            .iter()
            .map(|c| c.embedding.clone())
            .collect();

        session.detach_document();
        assert_eq!(session.attach_document("copy.txt", DOC).await.unwrap(), 2);
        assert_eq!(embedded.load(Ordering::SeqCst), 2, "second attach re-embedded");
        let second: Vec<Vec<f32>> = session
            .document()
            .unwrap()
            .chunks()
            .iter()
            .map(|c| c.embedding.clone())
            .collect();
        for (a, b) in first.iter().flatten().zip(second.iter().flatten()) {
            assert!((a - b).abs() < 1e-6);
        }
        assert_eq!(session.document().unwrap().source(), "copy.txt");

        session.attach_document("other.txt", "a different line").await.unwrap();
        assert_eq!(embedded.load(Ordering::SeqCst), 3);
    }
}
