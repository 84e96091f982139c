//! Sequential page fetching driven by a consumption signal.
//!
//! The paginator remembers a request template and re-issues it through the
//! queue with a page tag. State moves `Idle -> Loading -> Idle` per page and
//! settles in `Exhausted` once a response reports no next page.
//!
//! Two guards keep late responses from corrupting state: a page number older
//! than the committed one is ignored, and anything issued before the last
//! [`Paginator::reset_pagination`] is dropped.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, warn};

use super::envelope::{ResponseEnvelope, field};
use super::error::{Completion, DispatchError};
use super::queue::RequestQueue;
use super::request::Request;

/// Paginator configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaginatorConfig {
    /// Tag carrying the requested page number
    pub page_tag: String,
    /// First page requested by `start`
    pub first_page: u64,
    /// Remaining-content fraction at or below which the next page loads
    pub near_end_threshold: f64,
    /// Message whose data carries the page metadata
    pub metadata_message_index: usize,
}

impl Default for PaginatorConfig {
    fn default() -> Self {
        Self {
            page_tag: "Page".to_string(),
            first_page: 1,
            near_end_threshold: 0.1,
            metadata_message_index: 0,
        }
    }
}

/// Observable pagination state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PaginationStatus {
    /// No fetch in flight and more pages may exist
    Idle,
    /// A page fetch is outstanding
    Loading,
    /// The last response reported no next page
    Exhausted,
}

/// Page metadata parsed from a response
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageInfo {
    /// Page the response describes
    pub current_page: u64,
    /// Whether another page follows
    pub has_next_page: bool,
}

impl PageInfo {
    /// Parse `{"CurrentPage": n, "HasNextPage": b}`, optionally wrapped under `Data`.
    pub fn from_value(value: &Value) -> Option<Self> {
        let value = match value {
            Value::String(text) => serde_json::from_str(text).ok()?,
            other => other.clone(),
        };
        let obj = value.as_object()?;

        let unwrapped;
        let obj = match field(obj, "Data") {
            Some(inner) if field(obj, "CurrentPage").is_none() => {
                unwrapped = match inner {
                    Value::String(text) => serde_json::from_str::<Value>(text).ok()?,
                    other => other.clone(),
                };
                unwrapped.as_object()?
            }
            _ => obj,
        };

        let current_page = field(obj, "CurrentPage").and_then(as_page)?;
        let has_next_page = field(obj, "HasNextPage")
            .and_then(as_flag)
            .unwrap_or(false);
        Some(Self {
            current_page,
            has_next_page,
        })
    }

    /// Parse from the data of the envelope's message at `index`, falling back
    /// to the envelope payload itself.
    pub fn from_envelope(envelope: &ResponseEnvelope, index: usize) -> Option<Self> {
        envelope
            .target_message(index)
            .and_then(|message| message.data.as_deref())
            .and_then(|data| Self::from_value(&Value::String(data.to_string())))
            .or_else(|| Self::from_value(envelope.payload()))
    }
}

/// Delivered to the page callback for every page response
#[derive(Debug, Clone)]
pub struct PageResult {
    /// Page number that was requested
    pub requested_page: u64,
    /// Parsed metadata, when present
    pub info: Option<PageInfo>,
    /// The response
    pub completion: Completion,
}

/// Callback for page results.
pub type PageCallback = Arc<dyn Fn(PageResult) + Send + Sync + 'static>;

struct Template {
    request: Request,
    on_page: PageCallback,
}

struct Outstanding {
    ticket: u64,
    queue_id: Option<u64>,
}

struct PageState {
    current_page: u64,
    has_next_page: bool,
    generation: u64,
    next_ticket: u64,
    outstanding: Vec<Outstanding>,
    template: Option<Template>,
}

impl PageState {
    fn new() -> Self {
        Self {
            current_page: 0,
            has_next_page: false,
            generation: 0,
            next_ticket: 0,
            outstanding: Vec::new(),
            template: None,
        }
    }

    fn loading(&self) -> bool {
        !self.outstanding.is_empty()
    }
}

/// Drives sequential page fetches through a queue. Clones share state.
#[derive(Clone)]
pub struct Paginator {
    queue: RequestQueue,
    config: PaginatorConfig,
    state: Arc<Mutex<PageState>>,
}

impl Paginator {
    /// Paginator enqueuing through `queue`.
    pub fn new(queue: RequestQueue, config: PaginatorConfig) -> Self {
        Self {
            queue,
            config,
            state: Arc::new(Mutex::new(PageState::new())),
        }
    }

    /// Remember `template` and fetch the first page.
    pub fn start<F>(&self, template: Request, on_page: F)
    where
        F: Fn(PageResult) + Send + Sync + 'static,
    {
        self.reset_pagination();
        self.state.lock().template = Some(Template {
            request: template,
            on_page: Arc::new(on_page),
        });
        self.fetch_page(self.config.first_page);
    }

    /// Request page `page`. Returns `false` without a template.
    ///
    /// Older page requests still waiting in the queue are withdrawn first; a
    /// request already on the wire is left to finish and stays outstanding.
    pub fn fetch_page(&self, page: u64) -> bool {
        let (request, generation, ticket, stale) = {
            let mut state = self.state.lock();
            let Some(template) = state.template.as_ref() else {
                return false;
            };
            let request = template
                .request
                .with_tag_replaced(&self.config.page_tag, page.to_string())
                .reissue();
            let ticket = state.next_ticket;
            state.next_ticket += 1;
            let stale: Vec<(u64, u64)> = state
                .outstanding
                .iter()
                .filter_map(|o| o.queue_id.map(|id| (o.ticket, id)))
                .collect();
            state.outstanding.push(Outstanding {
                ticket,
                queue_id: None,
            });
            (request, state.generation, ticket, stale)
        };

        for (stale_ticket, id) in stale {
            if self.queue.remove_pending(id) {
                debug!(request_id = id, "withdrew stale page request");
                self.state
                    .lock()
                    .outstanding
                    .retain(|o| o.ticket != stale_ticket);
            }
        }

        let paginator = self.clone();
        let outcome = self.queue.enqueue(request, move |completion| {
            paginator.on_response(page, generation, ticket, completion);
        });

        let mut state = self.state.lock();
        let entry = if state.generation == generation {
            state.outstanding.iter_mut().find(|o| o.ticket == ticket)
        } else {
            None
        };
        match outcome.id() {
            Some(id) => {
                // Absent when the completion already fired on a zero-delay queue.
                if let Some(entry) = entry {
                    entry.queue_id = Some(id);
                }
                true
            }
            None => {
                warn!(page, "page request rejected by queue");
                if entry.is_some() {
                    state.outstanding.retain(|o| o.ticket != ticket);
                }
                false
            }
        }
    }

    /// Fetch the page after the committed one.
    pub fn fetch_next_page(&self) -> bool {
        let next = {
            let state = self.state.lock();
            if state.loading() || !state.has_next_page || state.template.is_none() {
                return false;
            }
            state.current_page + 1
        };
        self.fetch_page(next)
    }

    /// Consumption signal: `remaining` is the unread fraction (1.0 at the top,
    /// 0.0 at the bottom). Fetches the next page once it crosses the threshold.
    pub fn on_consumption(&self, remaining: f64) -> bool {
        if remaining > self.config.near_end_threshold {
            return false;
        }
        self.fetch_next_page()
    }

    /// Back to idle on page 0 with no template. Late responses are ignored.
    pub fn reset_pagination(&self) {
        let stale: Vec<u64> = {
            let mut state = self.state.lock();
            let generation = state.generation + 1;
            let stale = state
                .outstanding
                .drain(..)
                .filter_map(|o| o.queue_id)
                .collect();
            *state = PageState::new();
            state.generation = generation;
            stale
        };
        for id in stale {
            self.queue.remove_pending(id);
        }
    }

    /// Current state
    pub fn status(&self) -> PaginationStatus {
        let state = self.state.lock();
        if state.loading() {
            PaginationStatus::Loading
        } else if !state.has_next_page && state.current_page > 0 {
            PaginationStatus::Exhausted
        } else {
            PaginationStatus::Idle
        }
    }

    /// Last committed page (0 before any response)
    pub fn current_page(&self) -> u64 {
        self.state.lock().current_page
    }

    /// Whether another page is available
    pub fn has_next_page(&self) -> bool {
        self.state.lock().has_next_page
    }

    /// Whether a page fetch is outstanding
    pub fn is_loading(&self) -> bool {
        self.state.lock().loading()
    }

    fn on_response(
        &self,
        requested_page: u64,
        generation: u64,
        ticket: u64,
        completion: Completion,
    ) {
        let superseded = matches!(
            &completion,
            Err(failure) if matches!(failure.error, DispatchError::Superseded)
        );
        if superseded {
            let mut state = self.state.lock();
            if state.generation == generation {
                state.outstanding.retain(|o| o.ticket != ticket);
            }
            return;
        }

        let info = match &completion {
            Ok(envelope) => PageInfo::from_envelope(envelope, self.config.metadata_message_index),
            Err(failure) => failure
                .envelope
                .as_ref()
                .and_then(|env| PageInfo::from_envelope(env, self.config.metadata_message_index)),
        };

        let on_page = {
            let mut state = self.state.lock();
            if state.generation != generation {
                debug!(requested_page, "dropping page response from before reset");
                return;
            }
            state.outstanding.retain(|o| o.ticket != ticket);

            match info {
                Some(info) if info.current_page >= state.current_page => {
                    state.current_page = info.current_page;
                    state.has_next_page = info.has_next_page;
                }
                Some(info) => {
                    debug!(
                        stale_page = info.current_page,
                        committed_page = state.current_page,
                        "ignoring out-of-order page response"
                    );
                }
                None => {}
            }
            state.template.as_ref().map(|t| Arc::clone(&t.on_page))
        };

        if let Some(on_page) = on_page {
            on_page(PageResult {
                requested_page,
                info,
                completion,
            });
        }
    }
}

fn as_page(value: &Value) -> Option<u64> {
    match value {
        Value::Number(n) => n.as_u64().or_else(|| n.as_f64().map(|f| f.max(0.0) as u64)),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn as_flag(value: &Value) -> Option<bool> {
    match value {
        Value::Bool(b) => Some(*b),
        Value::String(s) => s.trim().parse().ok(),
        Value::Number(n) => n.as_u64().map(|n| n != 0),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_page_info_plain() {
        let info = PageInfo::from_value(&json!({"CurrentPage": 2, "HasNextPage": false})).unwrap();
        assert_eq!(
            info,
            PageInfo {
                current_page: 2,
                has_next_page: false
            }
        );
    }

    #[test]
    fn test_page_info_wrapped_under_data() {
        let wrapped = json!({"Data": {"CurrentPage": "3", "HasNextPage": true, "Items": []}});
        let info = PageInfo::from_value(&wrapped).unwrap();
        assert_eq!(info.current_page, 3);
        assert!(info.has_next_page);

        let encoded = Value::String(r#"{"Data":"{\"CurrentPage\":4,\"HasNextPage\":false}"}"#.into());
        assert_eq!(PageInfo::from_value(&encoded).unwrap().current_page, 4);
    }

    #[test]
    fn test_page_info_missing() {
        assert!(PageInfo::from_value(&json!({"Items": []})).is_none());
        assert!(PageInfo::from_value(&Value::String("not json".into())).is_none());
    }

    #[test]
    fn test_page_info_from_envelope_message() {
        let envelope = ResponseEnvelope::from_value(json!({
            "Messages": [{"Data": "{\"CurrentPage\":1,\"HasNextPage\":true}"}]
        }));
        let info = PageInfo::from_envelope(&envelope, 0).unwrap();
        assert_eq!(info.current_page, 1);
        assert!(info.has_next_page);
    }
}
