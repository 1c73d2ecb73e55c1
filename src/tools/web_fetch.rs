//! Fetch a URL as markdown through a reader proxy and analyse it with the model.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use sha2::{Digest, Sha256};

use crate::llm_client::LlmClient;
use crate::models::{Message, MessageRequest};

use super::spec::{ToolCapability, ToolContext, ToolError, ToolResult, ToolSpec, required_str};

const READER_BASE_URL: &str = "https://r.jina.ai";
const FETCH_TIMEOUT_SECS: u64 = 30;
const CACHE_TTL_SECS: i64 = 900;
const MAX_CONTENT_CHARS: usize = 100_000;
const ANALYSIS_MAX_TOKENS: u32 = 4096;
const REDIRECT_MARKER: &str = "**This website redirects to";
const USER_AGENT: &str = "Mozilla/5.0 (compatible; WebFetchTool/1.0)";

// === Cache ===

#[derive(Debug, Serialize, Deserialize)]
struct CacheRecord {
    url: String,
    /// Unix seconds when the entry was written.
    timestamp: i64,
    content: String,
}

/// On-disk page cache keyed by the SHA-256 of the normalized URL.
#[derive(Debug, Clone)]
pub struct PageCache {
    dir: PathBuf,
    ttl_secs: i64,
}

impl PageCache {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            ttl_secs: CACHE_TTL_SECS,
        }
    }

    fn entry_path(&self, url: &str) -> PathBuf {
        let digest = Sha256::digest(url.as_bytes());
        self.dir.join(format!("{digest:x}.json"))
    }

    /// Cached content for `url`, or `None` when absent, expired, or unreadable.
    /// Expired and corrupt entries are removed.
    pub fn get(&self, url: &str) -> Option<String> {
        let path = self.entry_path(url);
        let raw = std::fs::read_to_string(&path).ok()?;
        match serde_json::from_str::<CacheRecord>(&raw) {
            Ok(record) if chrono::Utc::now().timestamp() - record.timestamp <= self.ttl_secs => {
                Some(record.content)
            }
            Ok(_) => {
                let _ = std::fs::remove_file(&path);
                None
            }
            Err(err) => {
                tracing::debug!(path = %path.display(), error = %err, "dropping corrupt cache entry");
                let _ = std::fs::remove_file(&path);
                None
            }
        }
    }

    /// Best effort: a failed cache write never fails the fetch.
    pub fn put(&self, url: &str, content: &str) {
        let record = CacheRecord {
            url: url.to_string(),
            timestamp: chrono::Utc::now().timestamp(),
            content: content.to_string(),
        };
        let write = || -> std::io::Result<()> {
            std::fs::create_dir_all(&self.dir)?;
            let body = serde_json::to_string_pretty(&record)?;
            std::fs::write(self.entry_path(url), body)
        };
        if let Err(err) = write() {
            tracing::debug!(error = %err, "web fetch cache write failed");
        }
    }
}

// === WebFetchTool ===

pub struct WebFetchTool {
    client: Arc<dyn LlmClient>,
    http: reqwest::Client,
    reader_base: String,
    cache: PageCache,
}

impl WebFetchTool {
    pub fn new(client: Arc<dyn LlmClient>) -> Self {
        Self::with_endpoints(
            client,
            READER_BASE_URL,
            PageCache::new(std::env::temp_dir().join("webfetch_cache")),
        )
    }

    /// Point the tool at a different reader proxy and cache directory.
    pub fn with_endpoints(
        client: Arc<dyn LlmClient>,
        reader_base: impl Into<String>,
        cache: PageCache,
    ) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(FETCH_TIMEOUT_SECS))
            .user_agent(USER_AGENT)
            .build()
            .unwrap_or_default();
        Self {
            client,
            http,
            reader_base: reader_base.into().trim_end_matches('/').to_string(),
            cache,
        }
    }

    async fn fetch(&self, url: &str) -> Result<Fetched, ToolError> {
        if let Some(content) = self.cache.get(url) {
            return Ok(Fetched::Page {
                content,
                cached: true,
            });
        }

        let response = self
            .http
            .get(format!("{}/{url}", self.reader_base))
            .header("X-Return-Format", "markdown")
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(fetch_error)?;
        let text = response.text().await.map_err(fetch_error)?;
        let content = text.trim().to_string();

        if content.starts_with(REDIRECT_MARKER)
            && let Some(target) = redirect_target(&content)
        {
            return Ok(Fetched::Redirect(target));
        }

        self.cache.put(url, &content);
        Ok(Fetched::Page {
            content,
            cached: false,
        })
    }

    async fn analyse(&self, content: &str, prompt: &str) -> Result<String, ToolError> {
        let request = MessageRequest {
            model: self.client.model().to_string(),
            messages: vec![Message::user(analysis_prompt(content, prompt))],
            max_tokens: ANALYSIS_MAX_TOKENS,
            tools: None,
            stream: None,
            temperature: None,
        };
        let response = self
            .client
            .create_message(request)
            .await
            .map_err(|err| ToolError::execution_failed(format!("AI processing failed: {err}")))?;
        Ok(response.text())
    }
}

enum Fetched {
    Page { content: String, cached: bool },
    Redirect(String),
}

fn fetch_error(err: reqwest::Error) -> ToolError {
    if err.is_timeout() {
        ToolError::Timeout {
            seconds: FETCH_TIMEOUT_SECS,
            partial_output: None,
        }
    } else {
        ToolError::execution_failed(format!("Failed to fetch URL: {err}"))
    }
}

/// Upgrade plain http to https.
fn normalize_url(url: &str) -> String {
    match url.strip_prefix("http://") {
        Some(rest) => format!("https://{rest}"),
        None => url.to_string(),
    }
}

fn redirect_target(content: &str) -> Option<String> {
    content
        .lines()
        .filter(|line| line.starts_with(REDIRECT_MARKER))
        .flat_map(str::split_whitespace)
        .find(|part| part.starts_with("http"))
        .map(|part| part.trim_end_matches('*').to_string())
}

fn truncate_content(content: String) -> String {
    match content.char_indices().nth(MAX_CONTENT_CHARS) {
        Some((cut, _)) => {
            let mut truncated = content[..cut].to_string();
            truncated.push_str("\n\n[Content truncated due to size limit]");
            truncated
        }
        None => content,
    }
}

fn analysis_prompt(content: &str, prompt: &str) -> String {
    format!(
        "You are analyzing web content. Here is the content in markdown format:\n\n---\n{content}\n---\n\n\
         User request: {prompt}\n\nPlease analyze the content and respond to the user's request."
    )
}

#[async_trait]
impl ToolSpec for WebFetchTool {
    fn name(&self) -> &'static str {
        "webfetch_tool"
    }

    fn description(&self) -> &'static str {
        "Fetch content from a URL, convert it to markdown, and answer the prompt about it with the \
         model. The URL must be fully formed; http is upgraded to https. Responses are cached for \
         15 minutes. When the URL redirects to a different host the tool reports the redirect URL; \
         make a new request with it."
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "url": { "type": "string", "description": "The URL to fetch content from" },
                "prompt": { "type": "string", "description": "The prompt to run on the fetched content" }
            },
            "required": ["url", "prompt"]
        })
    }

    fn capabilities(&self) -> Vec<ToolCapability> {
        vec![ToolCapability::ReadOnly, ToolCapability::Network]
    }

    async fn execute(&self, input: Value, _context: &ToolContext) -> Result<ToolResult, ToolError> {
        let url = required_str(&input, "url")?.trim();
        let prompt = required_str(&input, "prompt")?.trim();
        if url.is_empty() {
            return Err(ToolError::invalid_input("URL cannot be empty"));
        }
        if prompt.is_empty() {
            return Err(ToolError::invalid_input("Prompt cannot be empty"));
        }
        let well_formed = reqwest::Url::parse(url).is_ok_and(|parsed| parsed.has_host());
        if !well_formed {
            return Err(ToolError::invalid_input(
                "Invalid URL format. URL must be fully-formed (e.g., https://example.com)",
            ));
        }

        let url = normalize_url(url);
        let (content, cached) = match self.fetch(&url).await? {
            Fetched::Page { content, cached } => (content, cached),
            Fetched::Redirect(target) => {
                return Ok(ToolResult::error(format!(
                    "ERROR: URL redirects to different host: {target}"
                ))
                .with_metadata(json!({
                    "url": url,
                    "redirect_url": target,
                    "is_redirect": true,
                })));
            }
        };

        let content = truncate_content(content);
        let answer = self.analyse(&content, prompt).await?;
        Ok(ToolResult::success(answer).with_metadata(json!({
            "url": url,
            "content_length": content.chars().count(),
            "cached": cached,
            "prompt": prompt,
        })))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm_client::StreamEventBox;
    use crate::models::{ContentBlock, MessageResponse, Role, Usage};
    use std::sync::Mutex;
    use wiremock::matchers::{header, method};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[derive(Default)]
    struct EchoClient {
        prompts: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl LlmClient for EchoClient {
        fn model(&self) -> &str {
            "echo"
        }

        async fn create_message(&self, request: MessageRequest) -> anyhow::Result<MessageResponse> {
            let prompt = request
                .messages
                .first()
                .map(Message::text_content)
                .unwrap_or_default();
            self.prompts
                .lock()
                .expect("prompts lock")
                .push(prompt);
            Ok(MessageResponse {
                id: "r1".to_string(),
                role: Role::Assistant,
                content: vec![ContentBlock::Text {
                    text: "summary".to_string(),
                }],
                model: "echo".to_string(),
                stop_reason: Some("stop".to_string()),
                usage: Usage::default(),
            })
        }

        async fn create_message_stream(&self, _request: MessageRequest) -> anyhow::Result<StreamEventBox> {
            anyhow::bail!("not used")
        }
    }

    fn fetch_tool(server: &MockServer, cache_dir: &std::path::Path) -> (WebFetchTool, Arc<EchoClient>) {
        let client = Arc::new(EchoClient::default());
        let tool = WebFetchTool::with_endpoints(
            client.clone(),
            server.uri(),
            PageCache::new(cache_dir),
        );
        (tool, client)
    }

    #[tokio::test]
    async fn fetches_analyses_and_caches() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(header("x-return-format", "markdown"))
            .respond_with(ResponseTemplate::new(200).set_body_string("# Title\nbody text\n"))
            .expect(1)
            .mount(&server)
            .await;
        let dir = tempfile::tempdir().expect("tempdir");
        let (tool, client) = fetch_tool(&server, dir.path());
        let ctx = ToolContext::new(dir.path());
        let input = json!({"url": "http://example.com/page", "prompt": "what is the title?"});

        let first = tool.execute(input.clone(), &ctx).await.expect("first fetch");
        assert!(first.success);
        assert_eq!(first.content, "summary");
        let metadata = first.metadata.expect("metadata");
        assert_eq!(metadata["url"], "https://example.com/page");
        assert_eq!(metadata["cached"], false);

        let second = tool.execute(input, &ctx).await.expect("second fetch");
        assert_eq!(second.metadata.expect("metadata")["cached"], true);

        let prompts = client.prompts.lock().expect("prompts lock");
        assert_eq!(prompts.len(), 2);
        assert!(prompts[0].contains("# Title\nbody text"));
        assert!(prompts[0].contains("User request: what is the title?"));
    }

    #[tokio::test]
    async fn redirect_is_reported_without_analysis() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string(
                "**This website redirects to https://other.example.org/landing**\n",
            ))
            .mount(&server)
            .await;
        let dir = tempfile::tempdir().expect("tempdir");
        let (tool, client) = fetch_tool(&server, dir.path());

        let result = tool
            .execute(
                json!({"url": "https://example.com", "prompt": "summarize"}),
                &ToolContext::new(dir.path()),
            )
            .await
            .expect("result");
        assert!(!result.success);
        assert_eq!(
            result.content,
            "ERROR: URL redirects to different host: https://other.example.org/landing"
        );
        assert_eq!(
            result.metadata.expect("metadata")["redirect_url"],
            "https://other.example.org/landing"
        );
        assert!(client.prompts.lock().expect("prompts lock").is_empty());
    }

    #[tokio::test]
    async fn malformed_input_is_rejected() {
        let server = MockServer::start().await;
        let dir = tempfile::tempdir().expect("tempdir");
        let (tool, _client) = fetch_tool(&server, dir.path());
        let ctx = ToolContext::new(dir.path());

        for input in [
            json!({"url": "  ", "prompt": "x"}),
            json!({"url": "https://example.com", "prompt": ""}),
            json!({"url": "example.com/no-scheme", "prompt": "x"}),
        ] {
            let err = tool.execute(input, &ctx).await.expect_err("invalid");
            assert!(matches!(err, ToolError::InvalidInput { .. }));
        }
    }

    #[tokio::test]
    async fn http_failure_is_an_execution_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;
        let dir = tempfile::tempdir().expect("tempdir");
        let (tool, _client) = fetch_tool(&server, dir.path());

        let err = tool
            .execute(
                json!({"url": "https://example.com", "prompt": "x"}),
                &ToolContext::new(dir.path()),
            )
            .await
            .expect_err("should fail");
        assert!(err.to_string().contains("Failed to fetch URL"));
    }

    #[test]
    fn cache_expires_and_drops_corrupt_entries() {
        let dir = tempfile::tempdir().expect("tempdir");
        let cache = PageCache::new(dir.path());
        cache.put("https://a.example", "page");
        assert_eq!(cache.get("https://a.example").as_deref(), Some("page"));

        let expired = PageCache {
            ttl_secs: -1,
            ..cache.clone()
        };
        assert_eq!(expired.get("https://a.example"), None);
        assert!(!cache.entry_path("https://a.example").exists());

        std::fs::write(cache.entry_path("https://b.example"), "not json").expect("write");
        assert_eq!(cache.get("https://b.example"), None);
        assert!(!cache.entry_path("https://b.example").exists());
    }

    #[test]
    fn long_content_is_truncated_on_a_char_boundary() {
        let content = "é".repeat(MAX_CONTENT_CHARS + 5);
        let truncated = truncate_content(content);
        assert!(truncated.ends_with("[Content truncated due to size limit]"));
        assert_eq!(
            truncated.chars().filter(|c| *c == 'é').count(),
            MAX_CONTENT_CHARS
        );
    }
}
