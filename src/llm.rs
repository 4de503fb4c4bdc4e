use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::config::AppConfig;

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("llm request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("llm returned status {status}: {body}")]
    Status { status: u16, body: String },
    #[error("llm returned no text")]
    EmptyResponse,
}

/// One prior exchange entry handed back to the model when continuing a
/// conversation.
#[derive(Debug, Clone)]
pub struct HistoryMessage {
    pub role: String,
    pub content: String,
}

/// External generative-text collaborator. No operation retries
/// internally; a failed `answer` or `summarize` fails the whole request,
/// and only `title_for` failures are substituted by the caller (see
/// [`fallback_title`]).
#[async_trait]
pub trait LlmGateway: Send + Sync + 'static {
    async fn answer(&self, context: &str, query: &str) -> Result<String, GatewayError>;

    async fn answer_with_history(
        &self,
        context: &str,
        history: &[HistoryMessage],
        query: &str,
    ) -> Result<String, GatewayError>;

    async fn summarize(&self, context: &str, label: &str) -> Result<String, GatewayError>;

    async fn title_for(&self, first_message: &str) -> Result<String, GatewayError>;
}

/// Deterministic substitute used when `title_for` fails: the opening
/// message truncated to 50 characters behind a fixed prefix.
pub fn fallback_title(first_message: &str) -> String {
    let prefix: String = first_message.chars().take(50).collect();
    format!("Chat about: {}", prefix.trim())
}

/// Drains a finite sequence of text chunks into a single buffer. The
/// gateway response arrives as a list of parts; this is the one place
/// they are stitched together.
pub fn drain_chunks<I>(chunks: I) -> String
where
    I: IntoIterator<Item = String>,
{
    let mut buffer = String::new();
    for chunk in chunks {
        buffer.push_str(&chunk);
    }
    buffer
}

pub struct GeminiGateway {
    client: Client,
    api_base: String,
    api_key: String,
    model: String,
}

impl GeminiGateway {
    /// Built once at startup from the loaded configuration; the key is
    /// never re-read per request.
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            client: Client::new(),
            api_base: config.gemini_api_base.trim_end_matches('/').to_string(),
            api_key: config.gemini_api_key.clone(),
            model: config.gemini_model.clone(),
        }
    }

    async fn generate(
        &self,
        system_instruction: String,
        contents: Vec<Content>,
    ) -> Result<String, GatewayError> {
        let url = format!(
            "{}/models/{}:generateContent?key={}",
            self.api_base, self.model, self.api_key
        );

        let request = GenerateContentRequest {
            system_instruction: Instruction {
                parts: vec![Part {
                    text: system_instruction,
                }],
            },
            contents,
        };

        let response = self.client.post(&url).json(&request).send().await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(GatewayError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let parsed: GenerateContentResponse = response.json().await?;
        debug!(candidates = parsed.candidates.len(), "llm response received");

        let text = drain_chunks(
            parsed
                .candidates
                .into_iter()
                .flat_map(|candidate| candidate.content.parts)
                .map(|part| part.text),
        );

        if text.trim().is_empty() {
            return Err(GatewayError::EmptyResponse);
        }

        Ok(text)
    }
}

#[async_trait]
impl LlmGateway for GeminiGateway {
    async fn answer(&self, context: &str, query: &str) -> Result<String, GatewayError> {
        self.generate(grounding_instruction(context), vec![Content::user(query)])
            .await
    }

    async fn answer_with_history(
        &self,
        context: &str,
        history: &[HistoryMessage],
        query: &str,
    ) -> Result<String, GatewayError> {
        let mut contents: Vec<Content> = history.iter().map(Content::from_history).collect();
        contents.push(Content::user(query));
        self.generate(grounding_instruction(context), contents).await
    }

    async fn summarize(&self, context: &str, label: &str) -> Result<String, GatewayError> {
        let query = format!(
            "Summarize the document '{label}' in a few concise paragraphs, \
             covering its main points."
        );
        self.generate(grounding_instruction(context), vec![Content::user(&query)])
            .await
    }

    async fn title_for(&self, first_message: &str) -> Result<String, GatewayError> {
        let instruction = "You generate titles for chat conversations. Given the \
                           opening message, respond with a single short label of at \
                           most six words. Respond with the label only."
            .to_string();
        self.generate(instruction, vec![Content::user(first_message)])
            .await
    }
}

fn grounding_instruction(context: &str) -> String {
    format!(
        "You are a helpful assistant that answers questions based on the provided \
         context delimited with triple backticks.\n\n\
         You will be given a context and a question. Your task is to generate a \
         response that is relevant to the query based on the context provided. \
         If the context is insufficient to answer the question, you will respond \
         with 'I do not have enough information to answer this question'.\n\n\
         If the context is empty, you will respond with 'I do not have any \
         information to answer this question'.\n\n\
         You should always respond in a friendly, helpful, and polite tone.\n\n\
         Context:\n```{context}```\n\n"
    )
}

#[derive(Serialize)]
struct GenerateContentRequest {
    system_instruction: Instruction,
    contents: Vec<Content>,
}

#[derive(Serialize)]
struct Instruction {
    parts: Vec<Part>,
}

#[derive(Serialize)]
struct Content {
    role: String,
    parts: Vec<Part>,
}

impl Content {
    fn user(text: &str) -> Self {
        Self {
            role: "user".to_string(),
            parts: vec![Part {
                text: text.to_string(),
            }],
        }
    }

    fn from_history(message: &HistoryMessage) -> Self {
        // Gemini's wire format calls the assistant side "model".
        let role = if message.role == crate::models::ROLE_ASSISTANT {
            "model"
        } else {
            "user"
        };
        Self {
            role: role.to_string(),
            parts: vec![Part {
                text: message.content.clone(),
            }],
        }
    }
}

#[derive(Serialize, Deserialize)]
struct Part {
    text: String,
}

#[derive(Deserialize)]
struct GenerateContentResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Deserialize)]
struct Candidate {
    content: CandidateContent,
}

#[derive(Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<Part>,
}

#[cfg(test)]
mod tests {
    use super::{drain_chunks, fallback_title};

    #[test]
    fn drains_chunks_in_order() {
        let text = drain_chunks(vec!["Hel".to_string(), "lo ".to_string(), "PDF".to_string()]);
        assert_eq!(text, "Hello PDF");
    }

    #[test]
    fn drains_empty_sequence_to_empty_buffer() {
        assert_eq!(drain_chunks(Vec::<String>::new()), "");
    }

    #[test]
    fn fallback_title_truncates_to_fifty_chars() {
        let message = "a".repeat(80);
        let title = fallback_title(&message);
        assert_eq!(title, format!("Chat about: {}", "a".repeat(50)));
    }

    #[test]
    fn fallback_title_keeps_short_messages_whole() {
        assert_eq!(
            fallback_title("What is this paper about?"),
            "Chat about: What is this paper about?"
        );
    }
}
