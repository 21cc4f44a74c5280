use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::AppConfig;
use crate::errors::{AppError, AppResult};
use crate::retry::RetryPolicy;

const SERVICE: &str = "oracle";
const TEMPERATURE: f64 = 0.3;

/// Free-text question answering. Answers are untrusted text; callers decide
/// what counts as a usable reply.
#[async_trait]
pub trait Oracle: Send + Sync {
    async fn ask(&self, prompt: &str) -> AppResult<String>;
}

#[derive(Clone)]
pub struct OracleService {
    inner: Arc<dyn Oracle>,
    retry: Arc<RetryPolicy>,
}

impl OracleService {
    pub fn new(config: &AppConfig) -> AppResult<Self> {
        let key = config.openai_api_key.clone().ok_or_else(|| {
            AppError::Config("OPENAI_API_KEY must be set to use the oracle".into())
        })?;
        let client = OpenAiClient::new(&config.openai_api_base, &config.openai_model, key)?;
        Ok(Self::with_oracle(Arc::new(client), RetryPolicy::from_config(config)))
    }

    pub fn with_oracle(oracle: Arc<dyn Oracle>, retry: RetryPolicy) -> Self {
        Self {
            inner: oracle,
            retry: Arc::new(retry),
        }
    }

    pub async fn ask(&self, prompt: &str) -> AppResult<String> {
        let answer = self
            .retry
            .run(SERVICE, move || self.inner.ask(prompt))
            .await?;
        debug!(prompt, answer = %answer, "oracle answered");
        Ok(answer)
    }

    /// True only for a bare "yes"; any other reply is a no.
    pub async fn confirms(&self, question: &str) -> AppResult<bool> {
        let answer = self.ask(question).await?;
        Ok(is_affirmative(&answer))
    }
}

pub fn is_affirmative(answer: &str) -> bool {
    answer.trim().eq_ignore_ascii_case("yes")
}

/// OpenAI chat completions, one user message per question.
pub struct OpenAiClient {
    http: reqwest::Client,
    base_url: String,
    model: String,
    api_key: SecretString,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: [ChatMessage<'a>; 1],
    temperature: f64,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: Option<ReplyMessage>,
}

#[derive(Deserialize)]
struct ReplyMessage {
    content: Option<String>,
}

impl OpenAiClient {
    pub fn new(base_url: &str, model: &str, api_key: SecretString) -> AppResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            model: model.to_string(),
            api_key,
        })
    }
}

#[async_trait]
impl Oracle for OpenAiClient {
    async fn ask(&self, prompt: &str) -> AppResult<String> {
        let body = ChatRequest {
            model: &self.model,
            messages: [ChatMessage {
                role: "user",
                content: prompt,
            }],
            temperature: TEMPERATURE,
        };
        let response = self
            .http
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(self.api_key.expose_secret())
            .json(&body)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(AppError::Upstream {
                service: SERVICE,
                status: status.as_u16(),
                message: response.text().await.unwrap_or_default(),
            });
        }

        let parsed: ChatResponse = response.json().await?;
        // an empty completion is an answer too, and it is not "yes"
        Ok(parsed
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message)
            .and_then(|message| message.content)
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use httptest::{matchers::*, responders::*, Expectation, Server};
    use serde_json::json;

    use super::*;

    #[test]
    fn only_a_bare_yes_is_affirmative() {
        assert!(is_affirmative("yes"));
        assert!(is_affirmative(" Yes\n"));
        assert!(is_affirmative("YES"));
        assert!(!is_affirmative("Yes."));
        assert!(!is_affirmative("yes, it is"));
        assert!(!is_affirmative("no"));
        assert!(!is_affirmative(""));
    }

    #[tokio::test]
    async fn posts_a_single_user_message() {
        let server = Server::run();
        server.expect(
            Expectation::matching(all_of![
                request::method_path("POST", "/v1/chat/completions"),
                request::headers(contains(("authorization", "Bearer sk-test"))),
                request::body(json_decoded(eq(json!({
                    "model": "gpt-3.5-turbo",
                    "messages": [{ "role": "user", "content": "Is Evanston in Chicago? Just return yes or no." }],
                    "temperature": 0.3
                })))),
            ])
            .respond_with(json_encoded(json!({
                "choices": [{ "message": { "role": "assistant", "content": "Yes" } }]
            }))),
        );
        let client = OpenAiClient::new(
            &server.url_str("/v1"),
            "gpt-3.5-turbo",
            SecretString::from("sk-test".to_string()),
        )
        .unwrap();
        let service = OracleService::with_oracle(Arc::new(client), RetryPolicy::immediate(1));
        assert!(service
            .confirms("Is Evanston in Chicago? Just return yes or no.")
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn server_errors_surface_after_retries() {
        let server = Server::run();
        server.expect(
            Expectation::matching(request::method_path("POST", "/chat/completions"))
                .times(2)
                .respond_with(status_code(503)),
        );
        let client = OpenAiClient::new(
            &server.url_str(""),
            "gpt-3.5-turbo",
            SecretString::from("sk-test".to_string()),
        )
        .unwrap();
        let service = OracleService::with_oracle(Arc::new(client), RetryPolicy::immediate(2));
        let err = service.ask("anything").await.unwrap_err();
        assert!(matches!(err, AppError::Lookup { service: "oracle", .. }));
    }
}
