//! Read-only GraphQL fallback for transaction discovery.
//!
//! A query is tried against each endpoint in order. When the whole list
//! fails the client waits on its backoff schedule and starts over from the
//! first endpoint, up to `max_rounds` passes.

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::envelope::field;
use super::error::GraphQlError;
use super::retry::Backoff;
use super::tag::Tag;
use super::transport::HttpTransport;

/// GraphQL fallback configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphQlConfig {
    /// Endpoints, tried in order
    pub endpoints: Vec<String>,
    /// Delay after each failed round, in seconds (clamped at the last entry)
    pub round_delays_secs: Vec<f64>,
    /// Passes over the endpoint list before giving up
    pub max_rounds: u32,
}

impl Default for GraphQlConfig {
    fn default() -> Self {
        Self {
            endpoints: vec![
                "https://arweave.net/graphql".to_string(),
                "https://arweave-search.goldsky.com/graphql".to_string(),
            ],
            round_delays_secs: vec![2.0, 5.0, 10.0],
            max_rounds: 3,
        }
    }
}

/// Endpoint-rotating GraphQL client.
pub struct GraphQlClient {
    config: GraphQlConfig,
    backoff: Backoff,
    http: Arc<dyn HttpTransport>,
}

impl GraphQlClient {
    /// Client posting through `http`.
    pub fn new(config: GraphQlConfig, http: Arc<dyn HttpTransport>) -> Self {
        Self {
            backoff: Backoff::from_secs(&config.round_delays_secs, true),
            config,
            http,
        }
    }

    /// Configuration in use
    pub fn config(&self) -> &GraphQlConfig {
        &self.config
    }

    /// Run `query` and return the response's `data` object.
    pub async fn query(
        &self,
        query: &str,
        cancel: Option<CancellationToken>,
    ) -> Result<Value, GraphQlError> {
        if self.config.endpoints.is_empty() {
            return Err(GraphQlError::NoEndpoints);
        }
        let cancel = cancel.unwrap_or_default();
        let body = json!({ "query": query });
        let rounds = self.config.max_rounds.max(1);
        let mut last = String::new();

        for round in 0..rounds {
            for endpoint in &self.config.endpoints {
                let attempt = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Err(GraphQlError::Cancelled),
                    attempt = self.try_endpoint(endpoint, &body) => attempt,
                };
                match attempt {
                    Ok(data) => {
                        debug!(endpoint = %endpoint, round, "GraphQL query succeeded");
                        return Ok(data);
                    }
                    Err(err) => {
                        warn!(endpoint = %endpoint, round, error = %err, "GraphQL endpoint failed");
                        last = err;
                    }
                }
            }

            if round + 1 < rounds {
                let delay = self.backoff.delay_for(round as usize);
                debug!(
                    round,
                    delay_ms = delay.as_millis() as u64,
                    "all GraphQL endpoints failed, backing off"
                );
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Err(GraphQlError::Cancelled),
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }

        Err(GraphQlError::Exhausted { rounds, last })
    }

    /// Run a [`TransactionQuery`] and parse its nodes.
    pub async fn transactions(
        &self,
        query: &TransactionQuery,
        cancel: Option<CancellationToken>,
    ) -> Result<Vec<TransactionNode>, GraphQlError> {
        let data = self.query(&query.render(), cancel).await?;
        TransactionNode::list_from_data(&data)
    }

    async fn try_endpoint(&self, endpoint: &str, body: &Value) -> Result<Value, String> {
        let response = self
            .http
            .post_json(endpoint, body)
            .await
            .and_then(|response| response.error_for_status(endpoint))
            .map_err(|err| err.to_string())?;

        let parsed: Value =
            serde_json::from_str(&response.body).map_err(|err| format!("invalid JSON: {err}"))?;
        match parsed.get("data") {
            Some(data) if !data.is_null() => Ok(data.clone()),
            _ => {
                let errors = parsed
                    .get("errors")
                    .map(Value::to_string)
                    .unwrap_or_else(|| "response has no data".to_string());
                Err(errors)
            }
        }
    }
}

/// Builder for `transactions(...)` queries.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TransactionQuery {
    recipients: Vec<String>,
    owners: Vec<String>,
    tags: Vec<(String, Vec<String>)>,
    first: Option<u32>,
}

impl TransactionQuery {
    /// Query matching every transaction
    pub fn new() -> Self {
        Self::default()
    }

    /// Restrict to transactions sent to `id`
    pub fn recipient(mut self, id: impl Into<String>) -> Self {
        self.recipients.push(id.into());
        self
    }

    /// Restrict to transactions signed by `address`
    pub fn owner(mut self, address: impl Into<String>) -> Self {
        self.owners.push(address.into());
        self
    }

    /// Match transactions carrying `name` with any of `values`.
    pub fn tag<I, S>(mut self, name: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags
            .push((name.into(), values.into_iter().map(Into::into).collect()));
        self
    }

    /// Page size
    pub fn first(mut self, count: u32) -> Self {
        self.first = Some(count);
        self
    }

    /// GraphQL text for this query.
    pub fn render(&self) -> String {
        let mut args = Vec::new();
        if !self.recipients.is_empty() {
            args.push(format!("recipients: {}", string_list(&self.recipients)));
        }
        if !self.owners.is_empty() {
            args.push(format!("owners: {}", string_list(&self.owners)));
        }
        if !self.tags.is_empty() {
            let tags: Vec<String> = self
                .tags
                .iter()
                .map(|(name, values)| {
                    format!("{{name: {}, values: {}}}", quote(name), string_list(values))
                })
                .collect();
            args.push(format!("tags: [{}]", tags.join(", ")));
        }
        if let Some(first) = self.first {
            args.push(format!("first: {first}"));
        }

        let args = if args.is_empty() {
            String::new()
        } else {
            format!("({})", args.join(", "))
        };
        format!(
            "query {{ transactions{args} {{ edges {{ node {{ id recipient tags {{ name value }} }} }} }} }}"
        )
    }
}

fn quote(value: &str) -> String {
    Value::String(value.to_string()).to_string()
}

fn string_list(values: &[String]) -> String {
    let quoted: Vec<String> = values.iter().map(|v| quote(v)).collect();
    format!("[{}]", quoted.join(", "))
}

/// One transaction from a `transactions` query
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionNode {
    /// Transaction id
    pub id: String,
    /// Target process or wallet (empty when absent)
    pub recipient: String,
    /// Transaction tags in order
    pub tags: Vec<Tag>,
}

impl TransactionNode {
    /// Parse the nodes from a `data` object shaped like
    /// `{transactions: {edges: [{node: {...}}]}}`.
    pub fn list_from_data(data: &Value) -> Result<Vec<Self>, GraphQlError> {
        let edges = data
            .as_object()
            .and_then(|obj| field(obj, "transactions"))
            .and_then(Value::as_object)
            .and_then(|obj| field(obj, "edges"))
            .and_then(Value::as_array)
            .ok_or_else(|| GraphQlError::Shape("missing transactions.edges".to_string()))?;

        let mut nodes = Vec::with_capacity(edges.len());
        for edge in edges {
            let node = edge
                .get("node")
                .and_then(Value::as_object)
                .ok_or_else(|| GraphQlError::Shape("edge without node".to_string()))?;
            let id = node
                .get("id")
                .and_then(Value::as_str)
                .ok_or_else(|| GraphQlError::Shape("node without id".to_string()))?;
            nodes.push(TransactionNode {
                id: id.to_string(),
                recipient: node
                    .get("recipient")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
                tags: node.get("tags").map(Tag::list_from_value).unwrap_or_default(),
            });
        }
        Ok(nodes)
    }

    /// First tag value with `name`
    pub fn tag(&self, name: &str) -> Option<&str> {
        self.tags
            .iter()
            .find(|tag| tag.name == name)
            .map(|tag| tag.value.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_full_query() {
        let query = TransactionQuery::new()
            .recipient("proc-1")
            .tag("Action", ["Transfer", "Credit-Notice"])
            .first(5)
            .render();

        assert!(query.contains(r#"recipients: ["proc-1"]"#));
        assert!(query.contains(r#"tags: [{name: "Action", values: ["Transfer", "Credit-Notice"]}]"#));
        assert!(query.contains("first: 5"));
        assert!(query.contains("node { id recipient tags { name value } }"));
    }

    #[test]
    fn test_render_escapes_strings() {
        let query = TransactionQuery::new().recipient("a\"b").render();
        assert!(query.contains(r#"["a\"b"]"#));
    }

    #[test]
    fn test_render_without_arguments() {
        let query = TransactionQuery::new().render();
        assert!(query.starts_with("query { transactions { edges"));
    }

    #[test]
    fn test_parse_nodes() {
        let data = json!({
            "transactions": {
                "edges": [
                    {"node": {"id": "tx1", "recipient": "proc", "tags": [{"name": "Action", "value": "Eval"}]}},
                    {"node": {"id": "tx2", "recipient": "", "tags": []}}
                ]
            }
        });
        let nodes = TransactionNode::list_from_data(&data).unwrap();
        assert_eq!(nodes.len(), 2);
        assert_eq!(nodes[0].tag("Action"), Some("Eval"));
        assert_eq!(nodes[1].id, "tx2");
    }

    #[test]
    fn test_parse_rejects_wrong_shape() {
        assert!(matches!(
            TransactionNode::list_from_data(&json!({"blocks": []})),
            Err(GraphQlError::Shape(_))
        ));
    }
}
