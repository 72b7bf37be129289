//! OpenAI-style chat-completions gateway.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tracing::instrument;
use url::Url;

use conceptforge_shared::{
    ChunkKind, ConceptForgeError, ConceptIndexEntry, ExtractedConcept, LlmConfig, Result,
    SimilarityMatch,
};

use crate::parse;
use crate::retry::{with_retry, with_timeout};

const SYSTEM_PROMPT: &str = "You are a precise language-learning concept extractor. \
    Always respond with valid JSON and nothing else: no prose, no markdown fences.";

/// Seam between the pipeline and the model. The orchestrator only sees this
/// trait; tests script it.
#[async_trait]
pub trait ConceptModel: Send + Sync {
    /// Extract candidate concepts from one content chunk.
    async fn extract_concepts(
        &self,
        kind: ChunkKind,
        content: &str,
        min_expected: usize,
    ) -> Result<Vec<ExtractedConcept>>;

    /// Score one candidate against a subset of the stored concept index.
    async fn score_similarity(
        &self,
        candidate: &ExtractedConcept,
        index: &[ConceptIndexEntry],
    ) -> Result<Vec<SimilarityMatch>>;

    /// Raw single-prompt completion.
    async fn free_text(&self, prompt: &str) -> Result<String>;

    /// Model identifier recorded on sessions.
    fn model_name(&self) -> &str;
}

/// HTTP gateway to an OpenAI-compatible `/chat/completions` endpoint.
#[derive(Debug)]
pub struct LlmGateway {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
    timeout: Duration,
    max_attempts: u32,
    base_delay: Duration,
}

impl LlmGateway {
    pub fn new(config: &LlmConfig, api_key: String) -> Result<Self> {
        let base_url = Url::parse(&config.base_url)
            .map_err(|e| ConceptForgeError::config(format!("invalid llm base url: {e}")))?;

        let client = reqwest::Client::builder()
            .user_agent(concat!("conceptforge/", env!("CARGO_PKG_VERSION")))
            .timeout(Duration::from_secs(config.timeout_secs + 5))
            .build()
            .map_err(|e| ConceptForgeError::llm("client", e.to_string()))?;

        Ok(Self {
            client,
            base_url: base_url.as_str().trim_end_matches('/').to_string(),
            api_key,
            model: config.model.clone(),
            timeout: Duration::from_secs(config.timeout_secs),
            max_attempts: config.max_attempts,
            base_delay: Duration::from_millis(config.retry_base_delay_ms),
        })
    }

    /// One retried, timeout-bounded chat completion. Returns the content of
    /// the first choice.
    async fn chat_completion(&self, operation: &str, user_prompt: &str) -> Result<String> {
        let url = format!("{}/chat/completions", self.base_url);
        let body = json!({
            "model": self.model,
            "messages": [
                {"role": "system", "content": SYSTEM_PROMPT},
                {"role": "user", "content": user_prompt}
            ],
            "temperature": 0.1,
            "response_format": {"type": "json_object"}
        });

        with_retry(operation, self.max_attempts, self.base_delay, || {
            with_timeout(operation, self.timeout, async {
                let response = self
                    .client
                    .post(&url)
                    .bearer_auth(&self.api_key)
                    .json(&body)
                    .send()
                    .await
                    .map_err(|e| ConceptForgeError::llm(operation, e.to_string()))?;

                let status = response.status();
                if !status.is_success() {
                    let detail = response.text().await.unwrap_or_default();
                    return Err(ConceptForgeError::llm(
                        operation,
                        format!("api returned {status}: {detail}"),
                    ));
                }

                let payload: serde_json::Value = response
                    .json()
                    .await
                    .map_err(|e| ConceptForgeError::llm(operation, e.to_string()))?;

                payload["choices"][0]["message"]["content"]
                    .as_str()
                    .map(str::to_string)
                    .ok_or_else(|| {
                        ConceptForgeError::llm(operation, "no content in response")
                    })
            })
        })
        .await
    }

    fn extraction_prompt(kind: ChunkKind, content: &str, min_expected: usize) -> String {
        let focus = match kind {
            ChunkKind::Keywords => format!(
                "This is a keyword list. Extract at least one concept per keyword \
                 and no fewer than {min_expected} concepts overall."
            ),
            ChunkKind::Notes => "These are lesson notes. Extract the grammar rules and \
                 vocabulary items the lesson teaches."
                .to_string(),
            ChunkKind::Practice => "These are practice exercises. Extract the concepts \
                 the exercises drill."
                .to_string(),
            ChunkKind::Homework => "This is a homework assignment. Extract the concepts \
                 it reinforces."
                .to_string(),
        };

        format!(
            r#"Extract language-learning concepts from the course content below.
{focus}

For each concept return: name, category ("grammar" or "vocabulary"), description,
examples (array of strings), source_excerpt (short quote from the content),
confidence (0.0 to 1.0), suggested_difficulty ("A1".."C2"), suggested_tags.

Respond with JSON: {{"concepts": [...]}}

Content ({kind}):
{content}"#,
            kind = kind.as_str(),
        )
    }

    fn similarity_prompt(candidate: &ExtractedConcept, index: &[ConceptIndexEntry]) -> String {
        let existing: Vec<String> = index
            .iter()
            .map(|e| {
                format!(
                    "- id: {} | name: {} | category: {} | {}",
                    e.id,
                    e.name,
                    e.category.as_str(),
                    e.description
                )
            })
            .collect();

        format!(
            r#"Compare the candidate concept against the existing concepts and score each
plausible match. Only include existing concepts that are genuinely similar.

Candidate:
  name: {name}
  category: {category}
  description: {description}

Existing concepts:
{existing}

For each match return: concept_id (copied exactly from the list), similarity
(0.0 to 1.0), merge_score (0.0 to 1.0, how advisable a merge is), and an
optional merge_suggestion {{"reason", "conflicting_fields", "suggested_description"}}.

Respond with JSON: {{"matches": [...]}}"#,
            name = candidate.name,
            category = candidate.category.as_str(),
            description = candidate.description,
            existing = existing.join("\n"),
        )
    }
}

#[async_trait]
impl ConceptModel for LlmGateway {
    #[instrument(skip_all, fields(kind = kind.as_str(), len = content.len()))]
    async fn extract_concepts(
        &self,
        kind: ChunkKind,
        content: &str,
        min_expected: usize,
    ) -> Result<Vec<ExtractedConcept>> {
        let prompt = Self::extraction_prompt(kind, content, min_expected);
        let raw = self.chat_completion("extract_concepts", &prompt).await?;
        parse::parse_extracted_concepts(&raw)
    }

    #[instrument(skip_all, fields(candidate = %candidate.name, index_len = index.len()))]
    async fn score_similarity(
        &self,
        candidate: &ExtractedConcept,
        index: &[ConceptIndexEntry],
    ) -> Result<Vec<SimilarityMatch>> {
        if index.is_empty() {
            return Ok(Vec::new());
        }
        let prompt = Self::similarity_prompt(candidate, index);
        let raw = self.chat_completion("score_similarity", &prompt).await?;
        parse::parse_similarity_matches(&raw, index)
    }

    async fn free_text(&self, prompt: &str) -> Result<String> {
        self.chat_completion("free_text", prompt).await
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use conceptforge_shared::{Category, Difficulty};
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn test_config(base_url: &str) -> LlmConfig {
        LlmConfig {
            api_key_env: "CONCEPTFORGE_API_KEY".into(),
            base_url: base_url.into(),
            model: "test-model".into(),
            timeout_secs: 5,
            max_attempts: 3,
            retry_base_delay_ms: 0,
        }
    }

    fn completion_body(content: &str) -> serde_json::Value {
        serde_json::json!({
            "choices": [{"message": {"role": "assistant", "content": content}}]
        })
    }

    #[tokio::test]
    async fn extracts_concepts_from_fenced_response() {
        let server = MockServer::start().await;
        let content = "```json\n{\"concepts\": [{\"name\": \"Kwadrans\", \
                       \"category\": \"vocabulary\", \"description\": \"quarter hour\", \
                       \"confidence\": 0.9, \"suggested_difficulty\": \"A2\"}]}\n```";

        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .and(header("authorization", "Bearer test-key"))
            .and(body_partial_json(serde_json::json!({"model": "test-model"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(completion_body(content)))
            .mount(&server)
            .await;

        let gateway = LlmGateway::new(&test_config(&server.uri()), "test-key".into()).unwrap();
        let concepts = gateway
            .extract_concepts(ChunkKind::Keywords, "kwadrans, pół", 2)
            .await
            .unwrap();

        assert_eq!(concepts.len(), 1);
        assert_eq!(concepts[0].name, "Kwadrans");
        assert_eq!(concepts[0].category, Category::Vocabulary);
        assert_eq!(concepts[0].suggested_difficulty, Difficulty::A2);
    }

    #[tokio::test]
    async fn retries_transient_server_errors() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(500))
            .up_to_n_times(2)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(completion_body(r#"{"concepts": []}"#)),
            )
            .mount(&server)
            .await;

        let gateway = LlmGateway::new(&test_config(&server.uri()), "k".into()).unwrap();
        let concepts = gateway
            .extract_concepts(ChunkKind::Notes, "notes", 2)
            .await
            .unwrap();
        assert!(concepts.is_empty());

        assert_eq!(server.received_requests().await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn exhausted_retries_surface_llm_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let gateway = LlmGateway::new(&test_config(&server.uri()), "k".into()).unwrap();
        let err = gateway
            .free_text("hello")
            .await
            .unwrap_err()
            .to_string();
        assert!(err.contains("free_text"));
        assert!(err.contains("3 attempts"));
    }

    #[tokio::test]
    async fn empty_index_skips_the_model_entirely() {
        let server = MockServer::start().await;
        // No mock mounted: any request would 404 and fail the call

        let gateway = LlmGateway::new(&test_config(&server.uri()), "k".into()).unwrap();
        let candidate = ExtractedConcept {
            name: "pół".into(),
            category: Category::Vocabulary,
            description: "half".into(),
            examples: vec![],
            source_excerpt: String::new(),
            confidence: 0.8,
            suggested_difficulty: Difficulty::A1,
            suggested_tags: vec![],
        };

        let matches = gateway.score_similarity(&candidate, &[]).await.unwrap();
        assert!(matches.is_empty());
        assert!(server.received_requests().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn invalid_base_url_is_a_config_error() {
        let err = LlmGateway::new(&test_config("not a url"), "k".into()).unwrap_err();
        assert!(err.to_string().contains("base url"));
    }
}
