//! Cursor pagination over the search endpoint

use super::ApiClient;
use crate::error::FetchError;
use futures::stream::{self, Stream};
use modelfetch_types::{Model, SearchParams};
use std::collections::{HashSet, VecDeque};
use tracing::{debug, warn};

/// Safety stop for servers that never stop handing out cursors
pub const MAX_PAGES: usize = 10_000;

struct PageState<'a> {
    client: &'a ApiClient,
    params: SearchParams,
    cursor: Option<String>,
    seen_ids: HashSet<u64>,
    seen_cursors: HashSet<String>,
    buffer: VecDeque<Model>,
    hard_limit: Option<usize>,
    yielded: usize,
    pages: usize,
    exhausted: bool,
}

impl ApiClient {
    /// Lazily walk every page of a search
    ///
    /// Items are yielded once per unique id. The stream ends when the server
    /// stops returning a cursor, repeats one, `hard_limit` items have been
    /// yielded, or after the first error.
    pub fn search_all(
        &self,
        params: SearchParams,
        hard_limit: Option<usize>,
    ) -> impl Stream<Item = Result<Model, FetchError>> + '_ {
        let state = PageState {
            client: self,
            params,
            cursor: None,
            seen_ids: HashSet::new(),
            seen_cursors: HashSet::new(),
            buffer: VecDeque::new(),
            hard_limit,
            yielded: 0,
            pages: 0,
            exhausted: false,
        };

        stream::unfold(state, |mut state| async move {
            loop {
                if state.hard_limit.is_some_and(|limit| state.yielded >= limit) {
                    return None;
                }

                if let Some(model) = state.buffer.pop_front() {
                    state.yielded += 1;
                    return Some((Ok(model), state));
                }

                if state.exhausted {
                    return None;
                }

                if state.pages >= MAX_PAGES {
                    warn!("Stopping pagination after {} pages", MAX_PAGES);
                    return None;
                }

                let page = match state
                    .client
                    .search(&state.params, state.cursor.as_deref())
                    .await
                {
                    Ok(page) => page,
                    Err(e) => {
                        state.exhausted = true;
                        return Some((Err(e), state));
                    }
                };
                state.pages += 1;

                let received = page.items.len();
                for model in page.items {
                    if state.seen_ids.insert(model.id) {
                        state.buffer.push_back(model);
                    }
                }
                debug!(
                    "Page {}: {} items, {} new",
                    state.pages,
                    received,
                    state.buffer.len()
                );

                match page.next_cursor {
                    Some(next) if state.seen_cursors.insert(next.clone()) => {
                        state.cursor = Some(next);
                    }
                    Some(next) => {
                        warn!("Server repeated cursor {}, stopping", next);
                        state.exhausted = true;
                    }
                    None => state.exhausted = true,
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use crate::api::tests::test_config;
    use crate::api::ApiClient;
    use crate::error::FetchError;
    use futures::StreamExt;
    use modelfetch_types::SearchParams;
    use serde_json::{json, Value};
    use wiremock::matchers::{method, path, query_param, query_param_is_missing};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn page(ids: std::ops::RangeInclusive<u64>, next: Option<&str>) -> Value {
        let items: Vec<Value> = ids
            .map(|id| json!({"id": id, "name": format!("model-{}", id)}))
            .collect();
        json!({"items": items, "metadata": {"nextCursor": next}})
    }

    async fn mount_three_pages(server: &MockServer) {
        Mock::given(method("GET"))
            .and(path("/search"))
            .and(query_param_is_missing("cursor"))
            .respond_with(ResponseTemplate::new(200).set_body_json(page(1..=100, Some("c2"))))
            .mount(server)
            .await;
        Mock::given(method("GET"))
            .and(path("/search"))
            .and(query_param("cursor", "c2"))
            .respond_with(ResponseTemplate::new(200).set_body_json(page(81..=180, Some("c3"))))
            .mount(server)
            .await;
        Mock::given(method("GET"))
            .and(path("/search"))
            .and(query_param("cursor", "c3"))
            .respond_with(ResponseTemplate::new(200).set_body_json(page(181..=280, None)))
            .mount(server)
            .await;
    }

    #[tokio::test]
    async fn test_overlapping_pages_are_deduplicated() {
        let server = MockServer::start().await;
        mount_three_pages(&server).await;

        let client = ApiClient::new(&test_config(&server, 1)).unwrap();
        let results: Vec<_> = client
            .search_all(SearchParams::query("x"), None)
            .collect()
            .await;

        let ids: Vec<u64> = results.into_iter().map(|r| r.unwrap().id).collect();
        assert_eq!(ids.len(), 280);
        assert_eq!(ids.first(), Some(&1));
        assert_eq!(ids.last(), Some(&280));

        let unique: std::collections::HashSet<_> = ids.iter().collect();
        assert_eq!(unique.len(), 280);
    }

    #[tokio::test]
    async fn test_hard_limit_stops_early() {
        let server = MockServer::start().await;
        mount_three_pages(&server).await;

        let client = ApiClient::new(&test_config(&server, 1)).unwrap();
        let results: Vec<_> = client
            .search_all(SearchParams::default(), Some(150))
            .collect()
            .await;
        assert_eq!(results.len(), 150);

        let requests = server.received_requests().await.unwrap();
        assert_eq!(requests.len(), 2);
    }

    #[tokio::test]
    async fn test_error_ends_stream() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/search"))
            .and(query_param_is_missing("cursor"))
            .respond_with(ResponseTemplate::new(200).set_body_json(page(1..=10, Some("c2"))))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/search"))
            .and(query_param("cursor", "c2"))
            .respond_with(ResponseTemplate::new(400))
            .mount(&server)
            .await;

        let client = ApiClient::new(&test_config(&server, 1)).unwrap();
        let results: Vec<_> = client
            .search_all(SearchParams::default(), None)
            .collect()
            .await;

        assert_eq!(results.len(), 11);
        assert!(results[..10].iter().all(|r| r.is_ok()));
        assert!(matches!(
            results[10],
            Err(FetchError::ClientError { status: 400, .. })
        ));
    }

    #[tokio::test]
    async fn test_repeated_cursor_terminates() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/search"))
            .and(query_param_is_missing("cursor"))
            .respond_with(ResponseTemplate::new(200).set_body_json(page(1..=5, Some("loop"))))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/search"))
            .and(query_param("cursor", "loop"))
            .respond_with(ResponseTemplate::new(200).set_body_json(page(6..=10, Some("loop"))))
            .expect(1)
            .mount(&server)
            .await;

        let client = ApiClient::new(&test_config(&server, 1)).unwrap();
        let results: Vec<_> = client
            .search_all(SearchParams::default(), None)
            .collect()
            .await;
        assert_eq!(results.len(), 10);
    }
}
