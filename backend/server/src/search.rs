//! # Search Engine
//!
//! Solr-compatible search core holding one denormalized document per activity.
//!
//!
//!
//! ## Schema
//! - One core for all activities, keyed by `id`
//! - Searchable fields: title, description, day
//! - Searchable fields are expected to be lowercase-filtered text fields. Clauses
//!   are sent in the caller's casing, but the read path cache folds case in its
//!   keys, so `Yoga` and `yoga` share one cached page
//! - Stored fields: instructor, times, capacity, available_seats, photo_url
//!
//!
//!
//! ## Writes
//! - Only the event synchronizer writes here
//! - `index` is a full-document upsert by id, so replaying an event is harmless
//! - Every write commits, a subsequent `select` sees it
//!
//!
//!
//! ## Queries
//! Filters become an AND of `field:*value*` wildcard clauses. An `id` filter
//! short-circuits to an exact id match. No filters means `*:*`.
//!
//! Pagination is offset based, `start = (page - 1) * rows`.
//!
//! No retries in here. A failing call is surfaced and the caller decides,
//! which for the synchronizer means queue redelivery.
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::json;

use crate::{
    error::SearchError,
    models::{Page, SearchDocument, SearchFilters},
};

pub const FIELD_ID: &str = "id";
pub const FIELD_TITLE: &str = "title";
pub const FIELD_DESCRIPTION: &str = "description";
pub const FIELD_DAY: &str = "day";

const MATCH_ALL: &str = "*:*";

#[async_trait]
pub trait SearchIndex: Send + Sync {
    async fn list(&self, filters: &SearchFilters) -> Result<Page, SearchError>;

    async fn index(&self, document: &SearchDocument) -> Result<(), SearchError>;

    async fn delete(&self, id: &str) -> Result<(), SearchError>;
}

pub fn build_query(filters: &SearchFilters) -> String {
    let id = filters.id.trim();
    if !id.is_empty() {
        return format!("{FIELD_ID}:{}", escape(id));
    }

    let clauses: Vec<String> = [
        (FIELD_TITLE, &filters.title),
        (FIELD_DESCRIPTION, &filters.description),
        (FIELD_DAY, &filters.day),
    ]
    .into_iter()
    .filter_map(|(field, value)| {
        let value = value.trim();
        (!value.is_empty()).then(|| format!("{field}:*{}*", escape(value)))
    })
    .collect();

    if clauses.is_empty() {
        return MATCH_ALL.to_string();
    }

    clauses.join(" AND ")
}

/// Backslash-escapes query syntax characters and whitespace in user input.
pub fn escape(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());

    for c in value.chars() {
        if c.is_whitespace() || "\\+-!():^[]\"{}~*?|&/".contains(c) {
            escaped.push('\\');
        }
        escaped.push(c);
    }

    escaped
}

/// Schemaless cores return single values as one-element arrays.
#[derive(Deserialize)]
#[serde(untagged)]
enum OneOrMany<T> {
    One(T),
    Many(Vec<T>),
}

impl<T> OneOrMany<T> {
    fn first(self) -> Option<T> {
        match self {
            OneOrMany::One(value) => Some(value),
            OneOrMany::Many(values) => values.into_iter().next(),
        }
    }
}

fn first_value<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: serde::Deserializer<'de>,
    T: Deserialize<'de> + Default,
{
    Ok(Option::<OneOrMany<T>>::deserialize(deserializer)?
        .and_then(OneOrMany::first)
        .unwrap_or_default())
}

#[derive(Deserialize)]
struct SolrDocument {
    #[serde(deserialize_with = "first_value")]
    id: String,
    #[serde(default, deserialize_with = "first_value")]
    title: String,
    #[serde(default, deserialize_with = "first_value")]
    description: String,
    #[serde(default, deserialize_with = "first_value")]
    instructor: String,
    #[serde(default, deserialize_with = "first_value")]
    day: String,
    #[serde(default, deserialize_with = "first_value")]
    start_time: String,
    #[serde(default, deserialize_with = "first_value")]
    end_time: String,
    #[serde(default, deserialize_with = "first_value")]
    capacity: u32,
    #[serde(default, deserialize_with = "first_value")]
    available_seats: u32,
    #[serde(default, deserialize_with = "first_value")]
    photo_url: String,
}

impl TryFrom<SolrDocument> for SearchDocument {
    type Error = SearchError;

    fn try_from(doc: SolrDocument) -> Result<Self, Self::Error> {
        let day = doc
            .day
            .parse()
            .map_err(|e: String| SearchError::Malformed(format!("document {}: {e}", doc.id)))?;

        Ok(SearchDocument {
            id: doc.id,
            title: doc.title,
            description: doc.description,
            instructor: doc.instructor,
            day,
            start_time: doc.start_time,
            end_time: doc.end_time,
            capacity: doc.capacity,
            available_seats: doc.available_seats,
            photo_url: doc.photo_url,
        })
    }
}

#[derive(Deserialize)]
struct SelectResponse {
    response: SelectBody,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SelectBody {
    num_found: u64,
    #[serde(default)]
    docs: Vec<SolrDocument>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct UpdateResponse {
    response_header: ResponseHeader,
}

#[derive(Deserialize)]
struct ResponseHeader {
    status: i64,
}

#[derive(Clone)]
pub struct SolrIndex {
    client: Client,
    base_url: String,
}

impl SolrIndex {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, SearchError> {
        let client = Client::builder().timeout(timeout).build()?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    async fn decode<T: DeserializeOwned>(response: reqwest::Response) -> Result<T, SearchError> {
        if response.status() != StatusCode::OK {
            return Err(SearchError::Status(response.status().as_u16()));
        }

        let body = response.bytes().await?;
        serde_json::from_slice(&body).map_err(|e| SearchError::Malformed(e.to_string()))
    }

    async fn update<B: Serialize + ?Sized>(&self, body: &B) -> Result<(), SearchError> {
        let response = self
            .client
            .post(format!("{}/update?commit=true", self.base_url))
            .json(body)
            .send()
            .await?;

        let update: UpdateResponse = Self::decode(response).await?;
        if update.response_header.status != 0 {
            return Err(SearchError::Rejected(update.response_header.status));
        }

        Ok(())
    }
}

#[async_trait]
impl SearchIndex for SolrIndex {
    async fn list(&self, filters: &SearchFilters) -> Result<Page, SearchError> {
        let query = build_query(filters);
        let start = filters.start().to_string();
        let rows = filters.count().to_string();

        let response = self
            .client
            .get(format!("{}/select", self.base_url))
            .query(&[
                ("q", query.as_str()),
                ("start", start.as_str()),
                ("rows", rows.as_str()),
                ("wt", "json"),
            ])
            .send()
            .await?;

        let select: SelectResponse = Self::decode(response).await?;
        let results = select
            .response
            .docs
            .into_iter()
            .map(SearchDocument::try_from)
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Page {
            page: filters.page(),
            count: results.len() as u32,
            total: select.response.num_found,
            results,
        })
    }

    async fn index(&self, document: &SearchDocument) -> Result<(), SearchError> {
        self.update(&json!({ "add": { "doc": document, "overwrite": true } }))
            .await
    }

    async fn delete(&self, id: &str) -> Result<(), SearchError> {
        self.update(&json!({ "delete": { "id": id } })).await
    }
}

#[cfg(test)]
mod tests {
    use std::{
        collections::BTreeMap,
        sync::{Arc, Mutex},
    };

    use axum::{
        Json, Router,
        extract::{Query, State},
        routing::{get, post},
    };
    use serde_json::Value;
    use tokio::net::TcpListener;

    use super::*;
    use crate::models::Weekday;

    #[test]
    fn test_empty_filters_match_everything() {
        assert_eq!(build_query(&SearchFilters::default()), "*:*");

        let blank = SearchFilters {
            title: "   ".to_string(),
            ..SearchFilters::default()
        };
        assert_eq!(build_query(&blank), "*:*");
    }

    #[test]
    fn test_filters_are_anded() {
        let filters = SearchFilters {
            title: "yoga".to_string(),
            day: "monday".to_string(),
            ..SearchFilters::default()
        };

        assert_eq!(build_query(&filters), "title:*yoga* AND day:*monday*");
    }

    #[test]
    fn test_id_filter_wins() {
        let filters = SearchFilters {
            id: "abc-1".to_string(),
            title: "yoga".to_string(),
            ..SearchFilters::default()
        };

        assert_eq!(build_query(&filters), r"id:abc\-1");
    }

    #[test]
    fn test_escape() {
        assert_eq!(escape("hot yoga"), r"hot\ yoga");
        assert_eq!(escape("a:b*"), r"a\:b\*");
        assert_eq!(escape("plain"), "plain");
    }

    #[test]
    fn test_multi_valued_fields_collapse() {
        let doc: SolrDocument = serde_json::from_value(serde_json::json!({
            "id": "a1",
            "title": ["Yoga"],
            "day": ["Monday"],
            "capacity": [10],
            "_version_": 1
        }))
        .unwrap();
        let doc = SearchDocument::try_from(doc).unwrap();

        assert_eq!(doc.title, "Yoga");
        assert_eq!(doc.day, Weekday::Monday);
        assert_eq!(doc.capacity, 10);
        assert_eq!(doc.description, "");
    }

    type Docs = Arc<Mutex<BTreeMap<String, Value>>>;

    async fn fake_update(State(docs): State<Docs>, Json(body): Json<Value>) -> Json<Value> {
        let mut docs = docs.lock().unwrap();

        if let Some(doc) = body.pointer("/add/doc") {
            let id = doc["id"].as_str().unwrap_or_default().to_string();
            docs.insert(id, doc.clone());
        }
        if let Some(id) = body.pointer("/delete/id").and_then(Value::as_str) {
            docs.remove(id);
        }

        Json(serde_json::json!({ "responseHeader": { "status": 0, "QTime": 1 } }))
    }

    async fn fake_select(
        State(docs): State<Docs>,
        Query(params): Query<BTreeMap<String, String>>,
    ) -> Json<Value> {
        let docs = docs.lock().unwrap();
        let start: usize = params["start"].parse().unwrap();
        let rows: usize = params["rows"].parse().unwrap();
        let all: Vec<Value> = docs.values().cloned().collect();
        let page: Vec<Value> = all.iter().skip(start).take(rows).cloned().collect();

        Json(serde_json::json!({
            "response": { "numFound": all.len(), "start": start, "docs": page }
        }))
    }

    async fn spawn_fake() -> (String, Docs) {
        let docs: Docs = Arc::default();
        let app = Router::new()
            .route("/solr/activities/update", post(fake_update))
            .route("/solr/activities/select", get(fake_select))
            .with_state(docs.clone());

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });

        (format!("http://{address}/solr/activities"), docs)
    }

    fn document(id: &str) -> SearchDocument {
        SearchDocument {
            id: id.to_string(),
            title: "Yoga".to_string(),
            description: "Morning flow".to_string(),
            instructor: "Ana".to_string(),
            day: Weekday::Tuesday,
            start_time: "09:00".to_string(),
            end_time: "10:00".to_string(),
            capacity: 10,
            available_seats: 4,
            photo_url: String::new(),
        }
    }

    #[tokio::test]
    async fn test_index_list_delete_against_engine() {
        let (url, docs) = spawn_fake().await;
        let index = SolrIndex::new(&url, Duration::from_secs(2)).unwrap();

        index.index(&document("a1")).await.unwrap();
        index.index(&document("a1")).await.unwrap();
        index.index(&document("a2")).await.unwrap();
        assert_eq!(docs.lock().unwrap().len(), 2);

        let page = index
            .list(&SearchFilters {
                page: 2,
                count: 1,
                ..SearchFilters::default()
            })
            .await
            .unwrap();
        assert_eq!(page.total, 2);
        assert_eq!(page.page, 2);
        assert_eq!(page.results, vec![document("a2")]);

        index.delete("a1").await.unwrap();
        let page = index.list(&SearchFilters::default()).await.unwrap();
        assert_eq!(page.total, 1);
    }

    #[tokio::test]
    async fn test_error_status_is_surfaced() {
        let (url, _docs) = spawn_fake().await;
        let index = SolrIndex::new(&format!("{url}/missing"), Duration::from_secs(2)).unwrap();

        let result = index.delete("a1").await;

        assert!(matches!(result, Err(SearchError::Status(404))));
    }
}
