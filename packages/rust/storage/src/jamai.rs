//! Hosted table backend (JamAI Base REST API).

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Method, RequestBuilder, StatusCode};
use serde_json::{Value, json};
use tracing::{debug, instrument};
use url::Url;

use granthub_shared::{Columns, GrantHubError, KnowledgeEntry, Result, Row, RowId, RowUpdates};

use crate::{KnowledgeStore, RowFilter, TableStore};

/// User-Agent string for store requests.
const USER_AGENT: &str = concat!("GrantHub/", env!("CARGO_PKG_VERSION"));

/// Default request timeout in seconds.
pub const DEFAULT_TIMEOUT_SECS: u64 = 60;

/// Page size used when listing without a limit.
const PAGE_SIZE: usize = 100;

const API_PREFIX: &str = "/api/v2";

/// Keys that may carry the row identifier in a row payload.
const ID_KEYS: [&str; 3] = ["ID", "id", "row_id"];

/// Connection settings for [`JamaiStore`].
#[derive(Debug, Clone)]
pub struct JamaiOptions {
    pub base_url: String,
    pub project_id: String,
    pub api_key: String,
    pub timeout_secs: u64,
}

/// REST client for action and knowledge tables.
#[derive(Debug, Clone)]
pub struct JamaiStore {
    client: Client,
    base_url: String,
    project_id: String,
    api_key: String,
}

#[derive(Clone, Copy)]
enum Access {
    Read,
    Write,
}

impl Access {
    fn error(self, message: String) -> GrantHubError {
        match self {
            Self::Read => GrantHubError::StoreRead(message),
            Self::Write => GrantHubError::StoreWrite(message),
        }
    }
}

impl JamaiStore {
    pub fn new(options: JamaiOptions) -> Result<Self> {
        let base_url = options.base_url.trim().trim_end_matches('/').to_string();
        Url::parse(&base_url).map_err(|e| {
            GrantHubError::config(format!("invalid store base_url {:?}: {e}", options.base_url))
        })?;

        let client = Client::builder()
            .user_agent(USER_AGENT)
            .timeout(Duration::from_secs(options.timeout_secs))
            .build()
            .map_err(|e| GrantHubError::config(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            base_url,
            project_id: options.project_id,
            api_key: options.api_key,
        })
    }

    /// Join an API path onto the base URL, adding the version prefix once.
    fn compose_url(&self, path: &str) -> String {
        let path = if path.starts_with('/') {
            path.to_string()
        } else {
            format!("/{path}")
        };
        if path.starts_with("/api/") || self.base_url.ends_with(API_PREFIX) {
            format!("{}{path}", self.base_url)
        } else {
            format!("{}{API_PREFIX}{path}", self.base_url)
        }
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        self.client
            .request(method, self.compose_url(path))
            .bearer_auth(&self.api_key)
            .header("X-PROJECT-ID", &self.project_id)
    }

    /// Send a request and decode the JSON body (empty bodies become `null`).
    /// A 404 yields `Ok(None)`.
    async fn send(&self, builder: RequestBuilder, access: Access) -> Result<Option<Value>> {
        let response = builder
            .send()
            .await
            .map_err(|e| access.error(e.to_string()))?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let body = response
            .text()
            .await
            .map_err(|e| access.error(format!("failed to read body: {e}")))?;
        if !status.is_success() {
            return Err(access.error(format!("HTTP {status}: {}", body.trim())));
        }
        if body.trim().is_empty() {
            return Ok(Some(Value::Null));
        }
        serde_json::from_str(&body)
            .map(Some)
            .map_err(|e| access.error(format!("invalid JSON response: {e}")))
    }

    async fn list_page(
        &self,
        table_id: &str,
        where_clause: Option<&str>,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<Row>> {
        let mut query: Vec<(&str, String)> = vec![
            ("table_id", table_id.to_string()),
            ("offset", offset.to_string()),
            ("limit", limit.to_string()),
        ];
        if let Some(clause) = where_clause {
            query.push(("where", clause.to_string()));
        }

        let body = self
            .send(
                self.request(Method::GET, "/gen_tables/action/rows/list")
                    .query(&query),
                Access::Read,
            )
            .await?
            .ok_or_else(|| GrantHubError::StoreRead(format!("table {table_id} not found")))?;

        let items = body
            .get("items")
            .or_else(|| body.get("rows"))
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        Ok(items.iter().filter_map(parse_row).collect())
    }
}

/// Turn a row payload into a [`Row`]. Columns may be nested under `columns`
/// or inline next to the identifier.
fn parse_row(value: &Value) -> Option<Row> {
    let object = value.as_object()?;
    let id = ID_KEYS.iter().find_map(|k| match object.get(*k) {
        Some(Value::String(s)) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Some(Value::Number(n)) => Some(n.to_string()),
        _ => None,
    })?;

    let columns = match object.get("columns") {
        Some(Value::Object(nested)) => nested.clone(),
        _ => object
            .iter()
            .filter(|(k, _)| !ID_KEYS.contains(&k.as_str()))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect(),
    };

    Some(Row {
        id: RowId(id),
        columns,
    })
}

#[async_trait]
impl TableStore for JamaiStore {
    #[instrument(skip_all, fields(table_id = %table_id, rows = rows.len()))]
    async fn add_rows(&self, table_id: &str, rows: Vec<Columns>) -> Result<Vec<RowId>> {
        if rows.is_empty() {
            return Ok(Vec::new());
        }
        let expected = rows.len();
        let payload = json!({
            "table_id": table_id,
            "data": rows,
            "stream": false,
            "concurrent": false,
        });

        let body = self
            .send(
                self.request(Method::POST, "/gen_tables/action/rows/add")
                    .json(&payload),
                Access::Write,
            )
            .await?
            .unwrap_or(Value::Null);

        let ids: Vec<RowId> = body
            .get("rows")
            .and_then(Value::as_array)
            .map(|rows| rows.iter().filter_map(parse_row).map(|r| r.id).collect())
            .unwrap_or_default();

        if ids.len() != expected {
            return Err(GrantHubError::StoreWrite(format!(
                "expected {expected} row id(s) from add, got {}",
                ids.len()
            )));
        }
        debug!(count = ids.len(), "rows added");
        Ok(ids)
    }

    async fn list_rows(&self, table_id: &str, filter: &RowFilter) -> Result<Vec<Row>> {
        let where_clause = filter.to_where_clause();
        let mut results = Vec::new();
        let mut offset = 0;

        loop {
            let page_size = match filter.limit {
                Some(limit) => limit.saturating_sub(results.len()).min(PAGE_SIZE),
                None => PAGE_SIZE,
            };
            if page_size == 0 {
                break;
            }
            let page = self
                .list_page(table_id, where_clause.as_deref(), offset, page_size)
                .await?;
            let fetched = page.len();
            offset += fetched;
            // The server evaluates the clause on raw cells; re-check canonical text.
            results.extend(page.into_iter().filter(|r| filter.matches(r)));
            if fetched < page_size {
                break;
            }
        }

        if let Some(limit) = filter.limit {
            results.truncate(limit);
        }
        Ok(results)
    }

    #[instrument(skip_all, fields(table_id = %table_id, rows = updates.len()))]
    async fn update_rows(&self, table_id: &str, updates: &RowUpdates) -> Result<()> {
        if updates.is_empty() {
            return Ok(());
        }
        let data: serde_json::Map<String, Value> = updates
            .iter()
            .map(|(id, cols)| (id.to_string(), Value::Object(cols.clone())))
            .collect();
        let payload = json!({ "table_id": table_id, "data": data });

        self.send(
            self.request(Method::PATCH, "/gen_tables/action/rows")
                .json(&payload),
            Access::Write,
        )
        .await?
        .ok_or_else(|| GrantHubError::StoreWrite(format!("table {table_id} not found")))?;
        Ok(())
    }

    #[instrument(skip_all, fields(table_id = %table_id, rows = row_ids.len()))]
    async fn delete_rows(&self, table_id: &str, row_ids: &[RowId]) -> Result<()> {
        if row_ids.is_empty() {
            return Ok(());
        }
        let payload = json!({ "table_id": table_id, "row_ids": row_ids });

        self.send(
            self.request(Method::POST, "/gen_tables/action/rows/delete")
                .json(&payload),
            Access::Write,
        )
        .await?
        .ok_or_else(|| GrantHubError::StoreWrite(format!("table {table_id} not found")))?;
        Ok(())
    }

    async fn get_row(&self, table_id: &str, row_id: &RowId) -> Result<Option<Row>> {
        let body = self
            .send(
                self.request(Method::GET, "/gen_tables/action/rows")
                    .query(&[("table_id", table_id), ("row_id", row_id.as_str())]),
                Access::Read,
            )
            .await?;
        Ok(body.as_ref().and_then(parse_row))
    }
}

#[async_trait]
impl KnowledgeStore for JamaiStore {
    #[instrument(skip_all, fields(table_id = %table_id, rows = entries.len()))]
    async fn add_knowledge_rows(&self, table_id: &str, entries: &[KnowledgeEntry]) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }
        let payload = json!({
            "table_id": table_id,
            "data": entries,
            "stream": false,
            "concurrent": false,
        });

        self.send(
            self.request(Method::POST, "/gen_tables/knowledge/rows/add")
                .json(&payload),
            Access::Write,
        )
        .await?
        .ok_or_else(|| GrantHubError::StoreWrite(format!("table {table_id} not found")))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Predicate;
    use wiremock::matchers::{body_json, body_partial_json, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn store_for(base_url: String) -> JamaiStore {
        JamaiStore::new(JamaiOptions {
            base_url,
            project_id: "proj_1".into(),
            api_key: "jamai_sk".into(),
            timeout_secs: 5,
        })
        .expect("store")
    }

    #[test]
    fn compose_url_adds_prefix_once() {
        let store = store_for("https://api.example.com/".into());
        assert_eq!(
            store.compose_url("/gen_tables/action/rows"),
            "https://api.example.com/api/v2/gen_tables/action/rows"
        );
        assert_eq!(
            store.compose_url("/api/v1/other"),
            "https://api.example.com/api/v1/other"
        );

        let store = store_for("https://api.example.com/api/v2".into());
        assert_eq!(
            store.compose_url("gen_tables/action/rows"),
            "https://api.example.com/api/v2/gen_tables/action/rows"
        );
    }

    #[test]
    fn parse_row_accepts_inline_and_nested_columns() {
        let inline = parse_row(&json!({ "ID": "r1", "grant_final": { "value": "x" } })).unwrap();
        assert_eq!(inline.id, RowId::from("r1"));
        assert_eq!(inline.text("grant_final").as_deref(), Some("x"));
        assert!(!inline.columns.contains_key("ID"));

        let nested =
            parse_row(&json!({ "row_id": "r2", "columns": { "grant_decider": "ok" } })).unwrap();
        assert_eq!(nested.id, RowId::from("r2"));
        assert_eq!(nested.text("grant_decider").as_deref(), Some("ok"));

        assert!(parse_row(&json!({ "grant_final": "x" })).is_none());
    }

    #[tokio::test]
    async fn list_rows_sends_where_clause_and_headers() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v2/gen_tables/action/rows/list"))
            .and(header("authorization", "Bearer jamai_sk"))
            .and(header("x-project-id", "proj_1"))
            .and(query_param("table_id", "scrap_result"))
            .and(query_param("limit", "20"))
            .and(query_param("where", "\"grant_final\" IS NOT NULL"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "items": [
                    { "ID": "r1", "grant_final": { "value": "{\"a\":1}" } },
                    { "ID": "r2", "grant_final": { "value": "" } }
                ],
                "total": 2
            })))
            .mount(&server)
            .await;

        let filter = RowFilter::all()
            .and(Predicate::Present("grant_final".into()))
            .limit(20);
        let rows = store_for(server.uri())
            .list_rows("scrap_result", &filter)
            .await
            .unwrap();
        // r2 has a blank cell and is dropped client-side.
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].id, RowId::from("r1"));
    }

    #[tokio::test]
    async fn update_rows_patches_in_one_call() {
        let server = MockServer::start().await;
        Mock::given(method("PATCH"))
            .and(path("/api/v2/gen_tables/action/rows"))
            .and(body_json(json!({
                "table_id": "scrap_result",
                "data": {
                    "r1": { "knowledge_sync_status": "synced" },
                    "r2": { "knowledge_sync_status": "failed: boom" }
                }
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "ok": true })))
            .expect(1)
            .mount(&server)
            .await;

        let mut updates = RowUpdates::new();
        for (id, status) in [("r1", "synced"), ("r2", "failed: boom")] {
            let mut cols = Columns::new();
            cols.insert("knowledge_sync_status".into(), json!(status));
            updates.insert(RowId::from(id), cols);
        }
        store_for(server.uri())
            .update_rows("scrap_result", &updates)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn add_rows_returns_ids_in_order() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/v2/gen_tables/action/rows/add"))
            .and(body_partial_json(json!({ "table_id": "scrap_result", "stream": false })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "rows": [ { "row_id": "a", "columns": {} }, { "row_id": "b", "columns": {} } ]
            })))
            .mount(&server)
            .await;

        let ids = store_for(server.uri())
            .add_rows("scrap_result", vec![Columns::new(), Columns::new()])
            .await
            .unwrap();
        assert_eq!(ids, vec![RowId::from("a"), RowId::from("b")]);
    }

    #[tokio::test]
    async fn delete_failure_is_a_write_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/v2/gen_tables/action/rows/delete"))
            .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
            .mount(&server)
            .await;

        let err = store_for(server.uri())
            .delete_rows("scrap_result", &[RowId::from("r1")])
            .await
            .unwrap_err();
        assert!(matches!(err, GrantHubError::StoreWrite(ref m) if m.contains("500")));
    }

    #[tokio::test]
    async fn get_row_missing_is_none() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v2/gen_tables/action/rows"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let row = store_for(server.uri())
            .get_row("scrap_result", &RowId::from("nope"))
            .await
            .unwrap();
        assert!(row.is_none());
    }

    #[tokio::test]
    async fn knowledge_rows_post_flat_fields() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/v2/gen_tables/knowledge/rows/add"))
            .and(body_partial_json(json!({ "table_id": "grants" })))
            .and(|req: &wiremock::Request| {
                serde_json::from_slice::<Value>(&req.body).is_ok_and(|body| {
                    body["data"][0]["grant_name"] == "Digital Grant X"
                        && body["data"][0]["grant_description"] == "Funding."
                })
            })
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "rows": [] })))
            .expect(1)
            .mount(&server)
            .await;

        let entry = KnowledgeEntry {
            name: "Digital Grant X".into(),
            period: None,
            description: "Funding.".into(),
            eligibility_criteria: None,
            application_steps: None,
            document_required: None,
        };
        store_for(server.uri())
            .add_knowledge_rows("grants", &[entry])
            .await
            .unwrap();
    }
}
