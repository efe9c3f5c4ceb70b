//! Web search tool backed by the Brave Search API.
//!
//! Results depend on the outside world, so the handler is
//! [`ToolKind::External`] and its responses are never cached.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Map, Value};

use super::{ToolHandler, ToolKind};

const SEARCH_ENDPOINT: &str = "https://api.search.brave.com/res/v1/web/search";
const SEARCH_TIMEOUT: Duration = Duration::from_secs(10);
const MAX_RESULTS: usize = 5;

#[derive(Deserialize)]
struct SearchResponse {
    #[serde(default)]
    web: Option<WebResults>,
}

#[derive(Deserialize)]
struct WebResults {
    #[serde(default)]
    results: Vec<WebResult>,
}

#[derive(Deserialize)]
struct WebResult {
    #[serde(default)]
    title: String,
    #[serde(default)]
    url: String,
    #[serde(default)]
    description: String,
}

pub struct WebSearch {
    client: reqwest::Client,
    api_key: String,
}

impl WebSearch {
    pub fn new(api_key: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key,
        }
    }
}

#[async_trait]
impl ToolHandler for WebSearch {
    fn name(&self) -> &str {
        "web_search"
    }

    fn description(&self) -> &str {
        "Search the web and return the top results with titles, URLs, and snippets"
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "query": {
                    "type": "string",
                    "description": "Search query"
                }
            },
            "required": ["query"]
        })
    }

    fn kind(&self) -> ToolKind {
        ToolKind::External
    }

    async fn run(&self, args: Map<String, Value>) -> Result<Value, String> {
        let query = args
            .get("query")
            .and_then(Value::as_str)
            .ok_or_else(|| "missing required argument 'query'".to_string())?;

        let response = self
            .client
            .get(SEARCH_ENDPOINT)
            .header("X-Subscription-Token", &self.api_key)
            .header("Accept", "application/json")
            .query(&[("q", query)])
            .timeout(SEARCH_TIMEOUT)
            .send()
            .await
            .map_err(|error| format!("search request failed: {error}"))?;

        let status = response.status();
        if !status.is_success() {
            return Err(format!("search request failed with status {status}"));
        }

        let parsed: SearchResponse = response
            .json()
            .await
            .map_err(|error| format!("search response was not valid JSON: {error}"))?;

        let results: Vec<Value> = parsed
            .web
            .map(|web| web.results)
            .unwrap_or_default()
            .into_iter()
            .take(MAX_RESULTS)
            .map(|result| {
                json!({
                    "title": result.title,
                    "url": result.url,
                    "snippet": result.description,
                })
            })
            .collect();

        Ok(json!({
            "success": true,
            "query": query,
            "results": results,
        }))
    }
}
