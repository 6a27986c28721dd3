//! Token-budgeted context assembly over the memory store.

use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use proto::{Conversation, ProtoError, SearchFilter};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::ContextConfig;
use crate::embedding::{EmbeddingService, cosine_similarity};
use crate::memory::SqliteMemory;

const STOP_WORDS: &[&str] = &[
    "the", "a", "an", "and", "or", "but", "in", "on", "at", "to", "for", "of", "with", "by",
    "from", "as", "is", "was", "are", "were", "been", "be", "have", "has", "had", "do", "does",
    "did", "will", "would", "should", "could", "may", "might", "can", "this", "that", "these",
    "those",
];
const MIN_KEYWORD_LEN: usize = 4;
const MAX_KEYWORDS: usize = 10;
const KEYWORDS_QUERIED: usize = 3;
const RESULTS_PER_KEYWORD: usize = 2;
const MAX_KEYWORD_CONVERSATIONS: usize = 5;
const RECENT_FALLBACK: usize = 3;
const SNIPPET_RESPONSE_CHARS: usize = 200;
const SEPARATOR: &str = "\n\n";

/// Retrieval strategy for past conversations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContextStrategy {
    #[default]
    Keyword,
    Semantic,
    Hybrid,
}

impl ContextStrategy {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Keyword => "keyword",
            Self::Semantic => "semantic",
            Self::Hybrid => "hybrid",
        }
    }
}

impl fmt::Display for ContextStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ContextStrategy {
    type Err = ProtoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "keyword" => Ok(Self::Keyword),
            "semantic" => Ok(Self::Semantic),
            "hybrid" => Ok(Self::Hybrid),
            other => Err(ProtoError::InvalidStrategy(other.to_string())),
        }
    }
}

/// Parameters of one context lookup.
#[derive(Debug, Clone, PartialEq)]
pub struct ContextRequest {
    pub strategy: ContextStrategy,
    /// Budget measured with the `chars / 4` estimator.
    pub max_tokens: usize,
    pub agent: Option<String>,
    pub min_relevance: f32,
}

impl ContextRequest {
    pub fn new(strategy: ContextStrategy) -> Self {
        Self {
            strategy,
            max_tokens: 500,
            agent: None,
            min_relevance: 0.3,
        }
    }

    pub fn from_config(config: &ContextConfig) -> Self {
        Self {
            strategy: config.strategy,
            max_tokens: config.max_tokens,
            agent: None,
            min_relevance: config.min_relevance,
        }
    }

    pub fn max_tokens(mut self, max_tokens: usize) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    pub fn agent(mut self, agent: impl Into<String>) -> Self {
        self.agent = Some(agent.into());
        self
    }

    pub fn min_relevance(mut self, min_relevance: f32) -> Self {
        self.min_relevance = min_relevance;
        self
    }
}

/// Rough token estimate used for every budget decision.
pub fn estimate_tokens(text: &str) -> usize {
    text.chars().count() / 4
}

/// Lowercased prompt words of at least four characters, stop-words removed,
/// first occurrence kept, at most ten.
pub fn extract_keywords(text: &str) -> Vec<String> {
    let mut seen = HashSet::new();
    text.to_lowercase()
        .split_whitespace()
        .map(|w| w.trim_matches(|c| matches!(c, '.' | ',' | '!' | '?' | ';' | ':')))
        .filter(|w| w.chars().count() >= MIN_KEYWORD_LEN && !STOP_WORDS.contains(w))
        .filter(|w| seen.insert(w.to_string()))
        .take(MAX_KEYWORDS)
        .map(str::to_string)
        .collect()
}

/// `[Past conversation]` block for one exchange.
pub fn format_snippet(conv: &Conversation) -> String {
    let answer: String = conv.response.chars().take(SNIPPET_RESPONSE_CHARS).collect();
    format!("[Past conversation]\nQ: {}\nA: {answer}...", conv.prompt)
}

/// Greedy budgeted join. Stops at the first snippet that would overflow.
pub fn assemble<'a>(conversations: impl IntoIterator<Item = &'a Conversation>, max_tokens: usize) -> String {
    let mut out = String::new();
    for conv in conversations {
        let snippet = format_snippet(conv);
        let mut candidate = out.clone();
        if !candidate.is_empty() {
            candidate.push_str(SEPARATOR);
        }
        candidate.push_str(&snippet);
        if estimate_tokens(&candidate) > max_tokens {
            break;
        }
        out = candidate;
    }
    out
}

/// Text that is embedded for a stored conversation.
fn embedding_text(conv: &Conversation) -> String {
    format!("{}\n{}", conv.prompt, conv.response)
}

/// Builds context strings for new prompts.
pub struct ContextAssembler {
    memory: Arc<SqliteMemory>,
    embeddings: Option<Arc<EmbeddingService>>,
    semantic_weight: f32,
    semantic_pool: usize,
}

impl ContextAssembler {
    pub fn new(memory: Arc<SqliteMemory>, embeddings: Option<Arc<EmbeddingService>>) -> Self {
        let defaults = ContextConfig::default();
        Self {
            memory,
            embeddings,
            semantic_weight: defaults.semantic_weight,
            semantic_pool: defaults.semantic_pool,
        }
    }

    pub fn with_config(mut self, config: &ContextConfig) -> Self {
        self.semantic_weight = config.semantic_weight;
        self.semantic_pool = config.semantic_pool;
        self
    }

    /// Context for `prompt`, or `""` when nothing qualifies or memory is disabled.
    pub async fn build(&self, prompt: &str, req: &ContextRequest) -> String {
        if !self.memory.is_enabled() {
            return String::new();
        }
        let context = match req.strategy {
            ContextStrategy::Keyword => self.keyword_context(prompt, req).await,
            ContextStrategy::Semantic | ContextStrategy::Hybrid => {
                match self.ranked_context(prompt, req).await {
                    Some(context) => context,
                    None => self.keyword_context(prompt, req).await,
                }
            }
        };
        debug!(
            strategy = %req.strategy,
            tokens = estimate_tokens(&context),
            "Context assembled"
        );
        context
    }

    async fn keyword_context(&self, prompt: &str, req: &ContextRequest) -> String {
        let conversations = self.keyword_matches(prompt, req).await;
        assemble(&conversations, req.max_tokens)
    }

    async fn keyword_matches(&self, prompt: &str, req: &ContextRequest) -> Vec<Conversation> {
        let keywords = extract_keywords(prompt);
        let agent = req.agent.as_deref();

        if keywords.is_empty() {
            return self
                .memory
                .recent(RECENT_FALLBACK, agent)
                .await
                .unwrap_or_else(|e| {
                    warn!(error = %e, "Recent conversation lookup failed");
                    Vec::new()
                });
        }

        let mut seen = HashSet::new();
        let mut found = Vec::new();
        for keyword in keywords.iter().take(KEYWORDS_QUERIED) {
            let mut filter = SearchFilter::query(keyword.as_str()).limit(RESULTS_PER_KEYWORD);
            filter.agent = req.agent.clone();
            match self.memory.search(&filter).await {
                Ok(hits) => found.extend(hits.into_iter().filter(|c| seen.insert(c.id))),
                Err(e) => warn!(keyword = %keyword, error = %e, "Keyword search failed"),
            }
        }
        found.truncate(MAX_KEYWORD_CONVERSATIONS);
        found
    }

    /// Semantic or hybrid ranking. `None` means fall back to keyword retrieval.
    async fn ranked_context(&self, prompt: &str, req: &ContextRequest) -> Option<String> {
        let Some(service) = &self.embeddings else {
            warn!(strategy = %req.strategy, "No embedding service, using keyword context");
            return None;
        };
        let query = match service.encode(prompt).await {
            Ok(v) => v,
            Err(e) => {
                warn!(error = %e, "Prompt embedding failed, using keyword context");
                return None;
            }
        };

        let agent = req.agent.as_deref();
        let mut candidates = match self.memory.semantic_candidates(agent, self.semantic_pool).await {
            Ok(c) => c,
            Err(e) => {
                warn!(error = %e, "Semantic candidate lookup failed, using keyword context");
                return None;
            }
        };

        let hybrid = req.strategy == ContextStrategy::Hybrid;
        let keywords = if hybrid { extract_keywords(prompt) } else { Vec::new() };
        if hybrid {
            let known: HashSet<i64> = candidates.iter().map(|c| c.id).collect();
            for conv in self.keyword_matches(prompt, req).await {
                if !known.contains(&conv.id) {
                    candidates.push(conv);
                }
            }
        }

        let mut scored: Vec<(f32, Conversation)> = Vec::new();
        for mut conv in candidates {
            let vector = match conv.embedding.take() {
                Some(v) => v,
                None => match self.embed_and_persist(service, &conv).await {
                    Some(v) => v,
                    None => continue,
                },
            };
            let semantic = cosine_similarity(&query, &vector);
            let score = if hybrid {
                let indicator = if keyword_hit(&keywords, &conv) { 1.0 } else { 0.0 };
                self.semantic_weight * semantic + (1.0 - self.semantic_weight) * indicator
            } else {
                semantic
            };
            if score >= req.min_relevance {
                scored.push((score, conv));
            }
        }
        scored.sort_by(|a, b| b.0.total_cmp(&a.0));

        Some(assemble(scored.iter().map(|(_, c)| c), req.max_tokens))
    }

    async fn embed_and_persist(&self, service: &EmbeddingService, conv: &Conversation) -> Option<Vec<f32>> {
        match service.encode(&embedding_text(conv)).await {
            Ok(vector) => {
                if let Err(e) = self.memory.update_embedding(conv.id, &vector).await {
                    warn!(conversation_id = conv.id, error = %e, "Failed to persist embedding");
                }
                Some(vector)
            }
            Err(e) => {
                warn!(conversation_id = conv.id, error = %e, "Embedding conversation failed");
                None
            }
        }
    }
}

fn keyword_hit(keywords: &[String], conv: &Conversation) -> bool {
    let prompt = conv.prompt.to_lowercase();
    let response = conv.response.to_lowercase();
    keywords
        .iter()
        .any(|k| prompt.contains(k.as_str()) || response.contains(k.as_str()))
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use proto::NewConversation;

    use super::*;
    use crate::embedding::tests::LetterLoader;

    fn conversation(id: i64, prompt: &str, response: &str) -> Conversation {
        Conversation {
            id,
            prompt: prompt.to_string(),
            response: response.to_string(),
            agent: "builder".to_string(),
            model: "openai/gpt-4o".to_string(),
            provider: "openai".to_string(),
            total_tokens: 0,
            cost_usd: 0.0,
            timestamp: Utc::now(),
            session_id: None,
            embedding: None,
        }
    }

    async fn open_memory() -> (Arc<SqliteMemory>, tempfile::TempDir) {
        let tmp = tempfile::tempdir().expect("tempdir");
        let path = tmp.path().join("context.db");
        let memory = SqliteMemory::open(&path.to_string_lossy())
            .await
            .expect("open");
        (Arc::new(memory), tmp)
    }

    #[test]
    fn keywords_drop_stop_words_short_tokens_and_punctuation() {
        let keywords = extract_keywords("How should this service deploy Redis, with Helm charts?");
        assert_eq!(keywords, vec!["service", "deploy", "redis", "helm", "charts"]);
    }

    #[test]
    fn keywords_are_capped_at_ten_and_deduplicated() {
        let text = "alpha alpha bravo charlie delta echoes foxtrot golf hotel india juliet kilo lima";
        let keywords = extract_keywords(text);
        assert_eq!(keywords.len(), 10);
        assert_eq!(keywords.iter().filter(|k| *k == "alpha").count(), 1);
        assert!(!keywords.iter().any(|k| k.len() < 4));
    }

    #[test]
    fn strategy_parses_case_insensitively() {
        assert_eq!("Hybrid".parse::<ContextStrategy>().expect("parse"), ContextStrategy::Hybrid);
        assert!("vector".parse::<ContextStrategy>().is_err());
        assert_eq!(ContextStrategy::Semantic.to_string(), "semantic");
    }

    #[test]
    fn snippet_truncates_response_to_two_hundred_chars() {
        let conv = conversation(1, "Q?", &"x".repeat(500));
        let snippet = format_snippet(&conv);
        assert!(snippet.starts_with("[Past conversation]\nQ: Q?\nA: "));
        assert!(snippet.ends_with("..."));
        assert_eq!(snippet.matches('x').count(), 200);
    }

    #[test]
    fn assemble_never_exceeds_budget() {
        let convs: Vec<Conversation> = (0..5)
            .map(|i| conversation(i, &format!("question number {i}"), &"y".repeat(150)))
            .collect();
        for budget in [0, 10, 50, 60, 100, 120, 400] {
            let out = assemble(&convs, budget);
            assert!(estimate_tokens(&out) <= budget, "budget {budget} exceeded");
        }
        assert_eq!(assemble(&convs, 0), "");
        assert_eq!(assemble(&convs, 1000).matches("[Past conversation]").count(), 5);
    }

    #[tokio::test]
    async fn keyword_strategy_finds_matching_conversations() {
        let (memory, _tmp) = open_memory().await;
        memory
            .store(&NewConversation::new("Deploy Redis with Helm", "Use the bitnami chart", "builder", "m", "p"))
            .await
            .expect("store");
        memory
            .store(&NewConversation::new("Bake bread", "Use flour", "builder", "m", "p"))
            .await
            .expect("store");

        let assembler = ContextAssembler::new(memory, None);
        let context = assembler
            .build("How do I scale redis?", &ContextRequest::new(ContextStrategy::Keyword))
            .await;
        assert!(context.contains("Deploy Redis with Helm"));
        assert!(!context.contains("Bake bread"));
    }

    #[tokio::test]
    async fn keyword_strategy_falls_back_to_recent_without_keywords() {
        let (memory, _tmp) = open_memory().await;
        for i in 0..4 {
            memory
                .store(&NewConversation::new(format!("entry {i}"), "r", "builder", "m", "p"))
                .await
                .expect("store");
        }
        let assembler = ContextAssembler::new(memory, None);
        let context = assembler
            .build("do it", &ContextRequest::new(ContextStrategy::Keyword))
            .await;
        assert_eq!(context.matches("[Past conversation]").count(), 3);
    }

    #[tokio::test]
    async fn disabled_memory_yields_empty_context() {
        let (memory, _tmp) = open_memory().await;
        memory
            .store(&NewConversation::new("Deploy Redis", "ok", "builder", "m", "p"))
            .await
            .expect("store");
        memory.disable();
        let assembler = ContextAssembler::new(memory, None);
        let context = assembler
            .build("Deploy Redis", &ContextRequest::new(ContextStrategy::Hybrid))
            .await;
        assert_eq!(context, "");
    }

    #[tokio::test]
    async fn semantic_without_service_falls_back_to_keyword() {
        let (memory, _tmp) = open_memory().await;
        memory
            .store(&NewConversation::new("Tune postgres indexes", "add btree", "builder", "m", "p"))
            .await
            .expect("store");
        let assembler = ContextAssembler::new(memory, None);
        let context = assembler
            .build("postgres is slow", &ContextRequest::new(ContextStrategy::Semantic))
            .await;
        assert!(context.contains("Tune postgres indexes"));
    }

    #[tokio::test]
    async fn semantic_strategy_ranks_and_persists_lazy_embeddings() {
        let (memory, _tmp) = open_memory().await;
        let close = memory
            .store(&NewConversation::new("zzz zzz", "zzz", "builder", "m", "p"))
            .await
            .expect("store")
            .expect("id");
        memory
            .store(&NewConversation::new("aaa", "bbb", "builder", "m", "p"))
            .await
            .expect("store");

        let service = Arc::new(EmbeddingService::new(Arc::new(LetterLoader::new())));
        let assembler = ContextAssembler::new(memory.clone(), Some(service));
        let context = assembler
            .build(
                "zzz",
                &ContextRequest::new(ContextStrategy::Semantic).min_relevance(0.5),
            )
            .await;
        assert!(context.contains("zzz zzz"));
        assert!(!context.contains("aaa"));

        let stored = memory.get(close).await.expect("get").expect("row");
        assert!(stored.embedding.is_some());
    }

    #[tokio::test]
    async fn hybrid_keyword_indicator_lifts_lexical_matches() {
        let (memory, _tmp) = open_memory().await;
        memory
            .store(&NewConversation::new("kubernetes rollout", "qqq", "builder", "m", "p"))
            .await
            .expect("store");

        let service = Arc::new(EmbeddingService::new(Arc::new(LetterLoader::new())));
        let assembler = ContextAssembler::new(memory, Some(service));
        let request = ContextRequest::new(ContextStrategy::Hybrid).min_relevance(0.3);
        let context = assembler.build("kubernetes", &request).await;
        assert!(context.contains("kubernetes rollout"));
    }
}
