use std::time::Duration;

use reqwest::Client;
use scout_core::error::AppError;
use scout_core::traits::RecipeGenerator;
use serde::{Deserialize, Serialize};

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
const DEFAULT_LLM_TIMEOUT: Duration = Duration::from_secs(120);
const TEMPERATURE: f32 = 0.2;

const SYSTEM_PROMPT: &str = r#"You are an expert at reading event listing pages and writing CSS selectors.

Given the URL and the (cleaned) HTML of a page that lists events, reply with a single JSON object describing how to extract every event on the page:

{
  "strategy": "css",
  "confidence": 0.0,
  "notes": "anything worth knowing about this page",
  "css": {
    "event_container": "CSS selector matching one element per event",
    "fields": {
      "title":       {"selector": "...", "attr": null},
      "start_time":  {"selector": "time", "attr": "datetime", "format": "iso"},
      "end_time":    null,
      "description": {"selector": "...", "attr": null},
      "location":    {"selector": "...", "attr": null},
      "url":         {"selector": "a", "attr": "href"},
      "price":       {"selector": "...", "attr": null},
      "image":       {"selector": "img", "attr": "src"}
    },
    "pagination": {"next_selector": "CSS selector of the next-page link, or null", "max_pages": 3}
  }
}

Rules:
- Field selectors are relative to the event_container element.
- title and start_time are required. Use null for any other field the page does not show.
- "attr" names the attribute to read; null means the element's text.
- "format" applies to start_time and end_time: "iso" for machine-readable dates, "human" for dates like "Sat, Mar 1 at 7pm", or a strftime pattern such as "%m/%d/%Y %H:%M".
- Prefer time[datetime] with "attr": "datetime" and "format": "iso" when available.
- "default" may give a fallback value for a field, e.g. "Free" for price.
- "confidence" is your estimate, between 0 and 1, that the selectors will work.
- Respond ONLY with the JSON object."#;

/// OpenAI-compatible client that asks an LLM for an extraction recipe.
///
/// Works with any OpenAI-compatible API, including:
/// - OpenAI directly (`https://api.openai.com/v1`)
/// - Gemini via compatibility layer (`https://generativelanguage.googleapis.com/v1beta/openai`)
/// - Local servers such as Ollama (`http://localhost:11434/v1`), which need no key
#[derive(Clone)]
pub struct OpenAiRecipeGenerator {
    client: Client,
    base_url: String,
    api_key: String,
    model: String,
    timeout_secs: u64,
}

impl OpenAiRecipeGenerator {
    pub fn new(api_key: &str, model: &str) -> Result<Self, AppError> {
        Self::with_base_url(api_key, model, DEFAULT_BASE_URL)
    }

    pub fn with_base_url(api_key: &str, model: &str, base_url: &str) -> Result<Self, AppError> {
        Self::build(api_key, model, base_url, DEFAULT_LLM_TIMEOUT)
    }

    pub fn with_timeout(self, timeout: Duration) -> Result<Self, AppError> {
        Self::build(&self.api_key, &self.model, &self.base_url, timeout)
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    fn build(
        api_key: &str,
        model: &str,
        base_url: &str,
        timeout: Duration,
    ) -> Result<Self, AppError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| AppError::HttpError(e.to_string()))?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            model: model.to_string(),
            timeout_secs: timeout.as_secs(),
        })
    }
}

// ---- OpenAI API types ----

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<Message<'a>>,
    temperature: f32,
    response_format: ResponseFormat,
}

#[derive(Serialize)]
struct Message<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    format_type: &'static str,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Deserialize)]
struct ResponseMessage {
    content: Option<String>,
}

#[derive(Deserialize)]
struct ApiError {
    error: ApiErrorDetail,
}

#[derive(Deserialize)]
struct ApiErrorDetail {
    message: String,
}

/// Some models wrap JSON mode replies in a markdown fence anyway.
fn strip_code_fence(content: &str) -> &str {
    let trimmed = content.trim();
    let Some(inner) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let inner = inner.strip_prefix("json").unwrap_or(inner);
    inner.strip_suffix("```").unwrap_or(inner).trim()
}

impl RecipeGenerator for OpenAiRecipeGenerator {
    async fn generate(
        &self,
        url: &str,
        cleaned_html: &str,
    ) -> Result<serde_json::Value, AppError> {
        let endpoint = format!("{}/chat/completions", self.base_url);
        let user_message = format!("Page URL: {url}\n\nHTML:\n{cleaned_html}");

        let request = ChatRequest {
            model: &self.model,
            messages: vec![
                Message {
                    role: "system",
                    content: SYSTEM_PROMPT,
                },
                Message {
                    role: "user",
                    content: &user_message,
                },
            ],
            temperature: TEMPERATURE,
            response_format: ResponseFormat {
                format_type: "json_object",
            },
        };

        tracing::debug!(%url, model = %self.model, html_chars = cleaned_html.len(), "Requesting recipe");

        let mut builder = self.client.post(&endpoint).json(&request);
        if !self.api_key.is_empty() {
            builder = builder.bearer_auth(&self.api_key);
        }

        let response = builder.send().await.map_err(|e| {
            if e.is_timeout() {
                AppError::Timeout(self.timeout_secs)
            } else if e.is_connect() {
                AppError::NetworkError(format!("Connection failed: {e}"))
            } else {
                AppError::HttpError(e.to_string())
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            let status_code = status.as_u16();
            if status_code == 429 {
                return Err(AppError::RateLimitExceeded);
            }

            let body = response.text().await.unwrap_or_default();
            let message = serde_json::from_str::<ApiError>(&body)
                .map(|e| e.error.message)
                .unwrap_or_else(|_| format!("HTTP {status_code}: {body}"));

            return Err(AppError::LlmError {
                message,
                status_code,
                retryable: status_code >= 500,
            });
        }

        let chat_response: ChatResponse = response
            .json()
            .await
            .map_err(|e| AppError::HttpError(format!("Failed to parse LLM response: {e}")))?;

        let content = chat_response
            .choices
            .first()
            .and_then(|c| c.message.content.as_deref())
            .filter(|c| !c.trim().is_empty())
            .ok_or_else(|| AppError::LlmError {
                message: "Empty response from LLM".into(),
                status_code: 200,
                retryable: false,
            })?;

        serde_json::from_str(strip_code_fence(content)).map_err(|e| {
            AppError::ParseError(format!("LLM returned invalid JSON: {e}. Raw: {content}"))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, Request, ResponseTemplate};

    fn chat_reply(content: &str) -> serde_json::Value {
        json!({
            "choices": [{"message": {"role": "assistant", "content": content}}]
        })
    }

    fn generator(server: &MockServer, key: &str) -> OpenAiRecipeGenerator {
        OpenAiRecipeGenerator::with_base_url(key, "gpt-4o-mini", &server.uri()).unwrap()
    }

    #[test]
    fn test_strip_code_fence() {
        assert_eq!(strip_code_fence("{\"a\":1}"), "{\"a\":1}");
        assert_eq!(strip_code_fence("```json\n{\"a\":1}\n```"), "{\"a\":1}");
        assert_eq!(strip_code_fence("```\n{}\n```"), "{}");
    }

    #[tokio::test]
    async fn test_generate_sends_prompt_and_parses_reply() {
        let server = MockServer::start().await;
        let recipe = json!({"strategy": "css", "confidence": 0.8, "css": {"event_container": "div.event"}});
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .and(header("authorization", "Bearer sk-test"))
            .and(body_partial_json(json!({
                "model": "gpt-4o-mini",
                "response_format": {"type": "json_object"}
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(chat_reply(&recipe.to_string())))
            .expect(1)
            .mount(&server)
            .await;

        let reply = generator(&server, "sk-test")
            .generate("https://venue.example/events", "<div class=\"event\"></div>")
            .await
            .unwrap();
        assert_eq!(reply, recipe);

        let requests: Vec<Request> = server.received_requests().await.unwrap();
        let body: serde_json::Value = serde_json::from_slice(&requests[0].body).unwrap();
        let user = body["messages"][1]["content"].as_str().unwrap();
        assert!(user.starts_with("Page URL: https://venue.example/events\n\nHTML:\n"));
        assert!(user.ends_with("<div class=\"event\"></div>"));
        assert_eq!(body["messages"][0]["role"], "system");
        assert!((body["temperature"].as_f64().unwrap() - 0.2).abs() < 1e-6);
    }

    #[tokio::test]
    async fn test_generate_without_key_skips_auth() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(chat_reply("{}")))
            .mount(&server)
            .await;

        generator(&server, "").generate("u", "h").await.unwrap();

        let requests = server.received_requests().await.unwrap();
        assert!(requests[0].headers.get("authorization").is_none());
    }

    #[tokio::test]
    async fn test_generate_fenced_reply() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(chat_reply("```json\n{\"confidence\": 0.5}\n```")),
            )
            .mount(&server)
            .await;

        let reply = generator(&server, "k").generate("u", "h").await.unwrap();
        assert_eq!(reply["confidence"], 0.5);
    }

    #[tokio::test]
    async fn test_generate_invalid_json_is_parse_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(chat_reply("not json at all")))
            .mount(&server)
            .await;

        let err = generator(&server, "k").generate("u", "h").await.unwrap_err();
        assert!(matches!(err, AppError::ParseError(_)));
        assert!(err.is_generation_error());
    }

    #[tokio::test]
    async fn test_generate_empty_content() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "choices": [{"message": {"role": "assistant", "content": null}}]
            })))
            .mount(&server)
            .await;

        let err = generator(&server, "k").generate("u", "h").await.unwrap_err();
        assert!(matches!(err, AppError::LlmError { status_code: 200, retryable: false, .. }));
    }

    #[tokio::test]
    async fn test_generate_rate_limited() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(429))
            .mount(&server)
            .await;

        let err = generator(&server, "k").generate("u", "h").await.unwrap_err();
        assert!(matches!(err, AppError::RateLimitExceeded));
    }

    #[tokio::test]
    async fn test_generate_api_error_message() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(401).set_body_json(json!({
                "error": {"message": "Incorrect API key provided"}
            })))
            .mount(&server)
            .await;

        let err = generator(&server, "bad").generate("u", "h").await.unwrap_err();
        match err {
            AppError::LlmError {
                message,
                status_code,
                retryable,
            } => {
                assert_eq!(message, "Incorrect API key provided");
                assert_eq!(status_code, 401);
                assert!(!retryable);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_generate_server_error_is_retryable() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503).set_body_string("upstream down"))
            .mount(&server)
            .await;

        let err = generator(&server, "k").generate("u", "h").await.unwrap_err();
        assert!(err.is_retryable());
        assert!(err.to_string().contains("upstream down"));
    }
}
