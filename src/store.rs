use anyhow::Context;
use chrono::NaiveDate;
use reqwest::StatusCode;
use reqwest::blocking::Client;
use reqwest::header::{AUTHORIZATION, HeaderMap, HeaderName, HeaderValue};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Number, Value, json};
use std::cell::RefCell;
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

const RICH_TEXT_LIMIT: usize = 2000;
const BODY_PREVIEW_LEN: usize = 500;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("request to {url} failed: {source}")]
    Transport {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("store returned HTTP {status}: {body}")]
    Status { status: u16, body: String },
    #[error("unexpected store response: {0}")]
    Decode(String),
    #[error("unknown database {0}")]
    UnknownDatabase(String),
}

impl StoreError {
    /// Network failures, 5xx and 429 are worth another attempt; everything
    /// else will fail the same way again.
    pub fn is_transient(&self) -> bool {
        match self {
            StoreError::Transport { .. } => true,
            StoreError::Status { status, .. } => *status >= 500 || *status == 429,
            StoreError::Decode(_) | StoreError::UnknownDatabase(_) => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum PropertyValue {
    Title(String),
    RichText(String),
    Number(Option<Number>),
    Select(Option<String>),
    Date {
        start: Option<String>,
        end: Option<String>,
    },
    Checkbox(bool),
    Relation(Vec<String>),
    Formula(Box<PropertyValue>),
    Rollup(RollupValue),
    Url(Option<String>),
    Files(Vec<String>),
    Unsupported(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "items", rename_all = "snake_case")]
pub enum RollupValue {
    Array(Vec<PropertyValue>),
    Scalar(Box<PropertyValue>),
}

impl PropertyValue {
    pub fn title(text: impl Into<String>) -> Self {
        PropertyValue::Title(text.into())
    }

    pub fn text(text: impl Into<String>) -> Self {
        PropertyValue::RichText(text.into())
    }

    pub fn int(value: i64) -> Self {
        PropertyValue::Number(Some(Number::from(value)))
    }

    pub fn float(value: Option<f64>) -> Self {
        PropertyValue::Number(value.and_then(Number::from_f64))
    }

    pub fn select(name: impl Into<String>) -> Self {
        PropertyValue::Select(Some(name.into()))
    }

    pub fn date(start: impl Into<String>) -> Self {
        PropertyValue::Date {
            start: Some(start.into()),
            end: None,
        }
    }

    pub fn relation(ids: impl IntoIterator<Item = String>) -> Self {
        PropertyValue::Relation(ids.into_iter().collect())
    }

    pub fn column_type(&self) -> ColumnType {
        match self {
            PropertyValue::Title(_) => ColumnType::Title,
            PropertyValue::RichText(_) => ColumnType::RichText,
            PropertyValue::Number(_) => ColumnType::Number,
            PropertyValue::Select(_) => ColumnType::Select,
            PropertyValue::Date { .. } => ColumnType::Date,
            PropertyValue::Checkbox(_) => ColumnType::Checkbox,
            PropertyValue::Relation(_) => ColumnType::Relation,
            PropertyValue::Formula(_) => ColumnType::Formula,
            PropertyValue::Rollup(_) => ColumnType::Rollup,
            PropertyValue::Url(_) => ColumnType::Url,
            PropertyValue::Files(_) => ColumnType::Files,
            PropertyValue::Unsupported(kind) => ColumnType::Other(kind.clone()),
        }
    }

    /// Plain text view of the value, looking through formulas.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            PropertyValue::Title(v) | PropertyValue::RichText(v) => Some(v.as_str()),
            PropertyValue::Select(v) | PropertyValue::Url(v) => v.as_deref(),
            PropertyValue::Date { start, .. } => start.as_deref(),
            PropertyValue::Formula(inner) => inner.as_text(),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            PropertyValue::Number(v) => v.as_ref().and_then(Number::as_f64),
            PropertyValue::Formula(inner) => inner.as_f64(),
            PropertyValue::Rollup(RollupValue::Scalar(inner)) => inner.as_f64(),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            PropertyValue::Checkbox(v) => Some(*v),
            PropertyValue::Formula(inner) => inner.as_bool(),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnType {
    Title,
    RichText,
    Number,
    Select,
    Date,
    Checkbox,
    Relation,
    Formula,
    Rollup,
    Url,
    Files,
    Other(String),
}

impl ColumnType {
    fn from_kind(kind: &str) -> Self {
        match kind {
            "title" => ColumnType::Title,
            "rich_text" => ColumnType::RichText,
            "number" => ColumnType::Number,
            "select" => ColumnType::Select,
            "date" => ColumnType::Date,
            "checkbox" => ColumnType::Checkbox,
            "relation" => ColumnType::Relation,
            "formula" => ColumnType::Formula,
            "rollup" => ColumnType::Rollup,
            "url" => ColumnType::Url,
            "files" => ColumnType::Files,
            other => ColumnType::Other(other.to_string()),
        }
    }
}

impl fmt::Display for ColumnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ColumnType::Title => "title",
            ColumnType::RichText => "rich_text",
            ColumnType::Number => "number",
            ColumnType::Select => "select",
            ColumnType::Date => "date",
            ColumnType::Checkbox => "checkbox",
            ColumnType::Relation => "relation",
            ColumnType::Formula => "formula",
            ColumnType::Rollup => "rollup",
            ColumnType::Url => "url",
            ColumnType::Files => "files",
            ColumnType::Other(kind) => kind.as_str(),
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredRow {
    pub id: String,
    pub properties: BTreeMap<String, PropertyValue>,
}

impl StoredRow {
    pub fn get(&self, name: &str) -> Option<&PropertyValue> {
        self.properties.get(name)
    }

    /// Content of whichever column is the title, whatever it is called.
    pub fn title(&self) -> Option<&str> {
        self.properties.values().find_map(|value| match value {
            PropertyValue::Title(text) => Some(text.as_str()),
            _ => None,
        })
    }

    pub fn text(&self, name: &str) -> Option<&str> {
        self.get(name).and_then(PropertyValue::as_text)
    }

    pub fn number(&self, name: &str) -> Option<f64> {
        self.get(name).and_then(PropertyValue::as_f64)
    }

    pub fn checkbox(&self, name: &str) -> Option<bool> {
        self.get(name).and_then(PropertyValue::as_bool)
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct WritePayload {
    pub properties: BTreeMap<String, PropertyValue>,
}

impl WritePayload {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: &str, value: PropertyValue) -> Self {
        self.properties.insert(name.to_string(), value);
        self
    }

    pub fn with_opt(self, name: &str, value: Option<PropertyValue>) -> Self {
        match value {
            Some(value) => self.with(name, value),
            None => self,
        }
    }

    pub fn to_json(&self, database_id: &str) -> Value {
        let mut properties = Map::new();
        for (name, value) in &self.properties {
            if let Some(encoded) = encode_property(value) {
                properties.insert(name.clone(), encoded);
            }
        }
        json!({
            "parent": { "database_id": database_id },
            "properties": Value::Object(properties),
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    TitleStartsWith { property: String, value: String },
    FormulaCheckbox { property: String, equals: bool },
    DateOnOrAfter { property: String, date: NaiveDate },
    And(Vec<Filter>),
}

impl Filter {
    pub fn to_json(&self) -> Value {
        match self {
            Filter::TitleStartsWith { property, value } => json!({
                "property": property,
                "title": { "starts_with": value },
            }),
            Filter::FormulaCheckbox { property, equals } => json!({
                "property": property,
                "formula": { "checkbox": { "equals": equals } },
            }),
            Filter::DateOnOrAfter { property, date } => json!({
                "property": property,
                "date": { "on_or_after": date.format("%Y-%m-%d").to_string() },
            }),
            Filter::And(parts) => json!({
                "and": parts.iter().map(Filter::to_json).collect::<Vec<_>>(),
            }),
        }
    }

    /// Local evaluation for stores without a query engine. Formula columns
    /// are never computed locally, so a formula filter on a row that lacks
    /// the column matches.
    pub fn matches(&self, row: &StoredRow) -> bool {
        match self {
            Filter::TitleStartsWith { property, value } => row
                .text(property)
                .is_some_and(|title| title.starts_with(value.as_str())),
            Filter::FormulaCheckbox { property, equals } => match row.checkbox(property) {
                Some(flag) => flag == *equals,
                None => true,
            },
            Filter::DateOnOrAfter { property, date } => row
                .text(property)
                .and_then(|start| start.get(..10))
                .and_then(|day| NaiveDate::parse_from_str(day, "%Y-%m-%d").ok())
                .is_some_and(|day| day >= *date),
            Filter::And(parts) => parts.iter().all(|part| part.matches(row)),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct QueryPage {
    pub results: Vec<StoredRow>,
    pub has_more: bool,
    pub next_cursor: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Schema {
    pub database_id: String,
    pub title: Option<String>,
    pub columns: BTreeMap<String, ColumnType>,
}

pub trait RowStore {
    fn query(
        &self,
        database_id: &str,
        filter: Option<&Filter>,
        cursor: Option<&str>,
    ) -> Result<QueryPage, StoreError>;

    /// Creates one row and returns its id.
    fn insert(&self, database_id: &str, payload: &WritePayload) -> Result<String, StoreError>;

    fn schema(&self, database_id: &str) -> Result<Schema, StoreError>;
}

impl<S: RowStore + ?Sized> RowStore for std::rc::Rc<S> {
    fn query(
        &self,
        database_id: &str,
        filter: Option<&Filter>,
        cursor: Option<&str>,
    ) -> Result<QueryPage, StoreError> {
        (**self).query(database_id, filter, cursor)
    }

    fn insert(&self, database_id: &str, payload: &WritePayload) -> Result<String, StoreError> {
        (**self).insert(database_id, payload)
    }

    fn schema(&self, database_id: &str) -> Result<Schema, StoreError> {
        (**self).schema(database_id)
    }
}

pub fn query_all(
    store: &dyn RowStore,
    database_id: &str,
    filter: Option<&Filter>,
) -> Result<Vec<StoredRow>, StoreError> {
    let mut rows = Vec::new();
    let mut cursor: Option<String> = None;
    let mut seen_cursors = HashSet::new();

    loop {
        let page = store.query(database_id, filter, cursor.as_deref())?;
        debug!(
            database = %database_id,
            fetched = page.results.len(),
            has_more = page.has_more,
            "store page fetched"
        );
        rows.extend(page.results);

        match page.next_cursor {
            Some(next) if page.has_more => {
                if !seen_cursors.insert(next.clone()) {
                    warn!(database = %database_id, cursor = %next, "store repeated a cursor; stopping pagination");
                    break;
                }
                cursor = Some(next);
            }
            _ => break,
        }
    }

    Ok(rows)
}

/// Finds the id of the first row whose title contains `needle`.
pub fn find_row_id(
    store: &dyn RowStore,
    database_id: &str,
    needle: &str,
) -> Result<Option<String>, StoreError> {
    let rows = query_all(store, database_id, None)?;
    Ok(rows
        .into_iter()
        .find(|row| row.title().is_some_and(|title| title.contains(needle)))
        .map(|row| row.id))
}

pub struct NotionStore {
    client: Client,
    endpoint: String,
    page_size: u32,
}

impl NotionStore {
    pub fn new(
        endpoint: &str,
        api_version: &str,
        token: &str,
        timeout: Duration,
        page_size: u32,
    ) -> anyhow::Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {token}")).context("invalid store token")?,
        );
        headers.insert(
            HeaderName::from_static("notion-version"),
            HeaderValue::from_str(api_version).context("invalid store api version")?,
        );

        let client = Client::builder()
            .timeout(timeout)
            .default_headers(headers)
            .build()
            .context("failed to build store client")?;

        Ok(Self {
            client,
            endpoint: endpoint.trim_end_matches('/').to_string(),
            page_size,
        })
    }

    fn send(
        &self,
        request: reqwest::blocking::RequestBuilder,
        url: &str,
    ) -> Result<Value, StoreError> {
        let response = request.send().map_err(|source| StoreError::Transport {
            url: url.to_string(),
            source,
        })?;
        let status = response.status();
        let body = response.text().map_err(|source| StoreError::Transport {
            url: url.to_string(),
            source,
        })?;

        if !status.is_success() {
            return Err(StoreError::Status {
                status: status.as_u16(),
                body: preview(&body),
            });
        }
        if status == StatusCode::NO_CONTENT {
            return Ok(Value::Null);
        }

        serde_json::from_str(&body)
            .map_err(|err| StoreError::Decode(format!("{err} in body {}", preview(&body))))
    }
}

impl RowStore for NotionStore {
    fn query(
        &self,
        database_id: &str,
        filter: Option<&Filter>,
        cursor: Option<&str>,
    ) -> Result<QueryPage, StoreError> {
        let url = format!("{}/databases/{database_id}/query", self.endpoint);
        let mut body = json!({ "page_size": self.page_size });
        if let Some(filter) = filter {
            body["filter"] = filter.to_json();
        }
        if let Some(cursor) = cursor {
            body["start_cursor"] = Value::String(cursor.to_string());
        }

        let payload = self.send(self.client.post(&url).json(&body), &url)?;
        decode_query_page(&payload)
    }

    fn insert(&self, database_id: &str, payload: &WritePayload) -> Result<String, StoreError> {
        let url = format!("{}/pages", self.endpoint);
        let body = payload.to_json(database_id);
        let created = self.send(self.client.post(&url).json(&body), &url)?;
        Ok(created
            .get("id")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string())
    }

    fn schema(&self, database_id: &str) -> Result<Schema, StoreError> {
        let url = format!("{}/databases/{database_id}", self.endpoint);
        let payload = self.send(self.client.get(&url), &url)?;
        decode_schema(database_id, &payload)
    }
}

/// Accepts either a bare list of pages or the wrapped `{results, has_more,
/// next_cursor}` shape.
pub fn decode_query_page(payload: &Value) -> Result<QueryPage, StoreError> {
    let (results, has_more, next_cursor) = match payload {
        Value::Array(items) => (items.as_slice(), false, None),
        Value::Object(obj) => {
            let results = obj
                .get("results")
                .and_then(Value::as_array)
                .map(Vec::as_slice)
                .ok_or_else(|| StoreError::Decode("query response has no results".to_string()))?;
            let has_more = obj.get("has_more").and_then(Value::as_bool).unwrap_or(false);
            let next_cursor = obj
                .get("next_cursor")
                .and_then(Value::as_str)
                .map(ToString::to_string);
            (results, has_more, next_cursor)
        }
        other => {
            return Err(StoreError::Decode(format!(
                "query response is neither list nor object: {}",
                preview(&other.to_string())
            )));
        }
    };

    let mut rows = Vec::with_capacity(results.len());
    for page in results {
        let Some(id) = page.get("id").and_then(Value::as_str) else {
            warn!("store row without id skipped");
            continue;
        };
        let mut properties = BTreeMap::new();
        if let Some(props) = page.get("properties").and_then(Value::as_object) {
            for (name, value) in props {
                properties.insert(name.clone(), decode_property(value));
            }
        }
        rows.push(StoredRow {
            id: id.to_string(),
            properties,
        });
    }

    Ok(QueryPage {
        results: rows,
        has_more,
        next_cursor,
    })
}

pub fn decode_schema(database_id: &str, payload: &Value) -> Result<Schema, StoreError> {
    let props = payload
        .get("properties")
        .and_then(Value::as_object)
        .ok_or_else(|| StoreError::Decode("database response has no properties".to_string()))?;

    let columns = props
        .iter()
        .map(|(name, details)| {
            let kind = details.get("type").and_then(Value::as_str).unwrap_or("unknown");
            (name.clone(), ColumnType::from_kind(kind))
        })
        .collect();

    let title = payload
        .get("title")
        .and_then(Value::as_array)
        .map(|items| rich_text_content(items))
        .filter(|t| !t.is_empty());

    Ok(Schema {
        database_id: database_id.to_string(),
        title,
        columns,
    })
}

pub fn decode_property(value: &Value) -> PropertyValue {
    let kind = value.get("type").and_then(Value::as_str).unwrap_or("unknown");
    decode_typed(kind, value.get(kind).unwrap_or(&Value::Null))
}

fn decode_typed(kind: &str, inner: &Value) -> PropertyValue {
    match kind {
        "title" => PropertyValue::Title(
            inner
                .as_array()
                .map(|v| rich_text_content(v))
                .unwrap_or_default(),
        ),
        "rich_text" => PropertyValue::RichText(
            inner
                .as_array()
                .map(|v| rich_text_content(v))
                .unwrap_or_default(),
        ),
        "number" => PropertyValue::Number(inner.as_number().cloned()),
        "select" | "status" => PropertyValue::Select(
            inner.get("name").and_then(Value::as_str).map(ToString::to_string),
        ),
        "date" => PropertyValue::Date {
            start: inner.get("start").and_then(Value::as_str).map(ToString::to_string),
            end: inner.get("end").and_then(Value::as_str).map(ToString::to_string),
        },
        "checkbox" | "boolean" => PropertyValue::Checkbox(inner.as_bool().unwrap_or(false)),
        "relation" => PropertyValue::Relation(
            inner
                .as_array()
                .map(|items| {
                    items
                        .iter()
                        .filter_map(|r| r.get("id").and_then(Value::as_str))
                        .map(ToString::to_string)
                        .collect()
                })
                .unwrap_or_default(),
        ),
        "formula" => {
            let result_kind = inner.get("type").and_then(Value::as_str).unwrap_or("unknown");
            let result = inner.get(result_kind).unwrap_or(&Value::Null);
            let decoded = match result_kind {
                "string" => {
                    PropertyValue::RichText(result.as_str().unwrap_or_default().to_string())
                }
                other => decode_typed(other, result),
            };
            PropertyValue::Formula(Box::new(decoded))
        }
        "rollup" => {
            let result_kind = inner.get("type").and_then(Value::as_str).unwrap_or("unknown");
            if result_kind == "array" {
                let items = inner
                    .get("array")
                    .and_then(Value::as_array)
                    .map(|items| items.iter().map(decode_property).collect())
                    .unwrap_or_default();
                PropertyValue::Rollup(RollupValue::Array(items))
            } else {
                let result = inner.get(result_kind).unwrap_or(&Value::Null);
                let decoded = decode_typed(result_kind, result);
                PropertyValue::Rollup(RollupValue::Scalar(Box::new(decoded)))
            }
        }
        "url" => PropertyValue::Url(inner.as_str().map(ToString::to_string)),
        "files" => PropertyValue::Files(
            inner
                .as_array()
                .map(|items| {
                    items
                        .iter()
                        .filter_map(|f| {
                            f.pointer("/external/url")
                                .or_else(|| f.pointer("/file/url"))
                                .and_then(Value::as_str)
                        })
                        .map(ToString::to_string)
                        .collect()
                })
                .unwrap_or_default(),
        ),
        other => PropertyValue::Unsupported(other.to_string()),
    }
}

fn rich_text_content(items: &[Value]) -> String {
    items
        .iter()
        .filter_map(|item| {
            item.get("plain_text")
                .or_else(|| item.pointer("/text/content"))
                .and_then(Value::as_str)
        })
        .collect::<String>()
}

fn text_block(content: &str) -> Value {
    let truncated: String = content.chars().take(RICH_TEXT_LIMIT).collect();
    json!([{ "text": { "content": truncated } }])
}

fn encode_property(value: &PropertyValue) -> Option<Value> {
    let encoded = match value {
        PropertyValue::Title(text) => json!({ "title": text_block(text) }),
        PropertyValue::RichText(text) => json!({ "rich_text": text_block(text) }),
        PropertyValue::Number(n) => json!({ "number": n }),
        PropertyValue::Select(Some(name)) => json!({ "select": { "name": name } }),
        PropertyValue::Select(None) => json!({ "select": null }),
        PropertyValue::Date {
            start: Some(start),
            end,
        } => json!({ "date": { "start": start, "end": end } }),
        PropertyValue::Date { start: None, .. } => json!({ "date": null }),
        PropertyValue::Checkbox(flag) => json!({ "checkbox": flag }),
        PropertyValue::Relation(ids) => json!({
            "relation": ids.iter().map(|id| json!({ "id": id })).collect::<Vec<_>>(),
        }),
        PropertyValue::Url(url) => json!({ "url": url }),
        PropertyValue::Files(urls) => json!({
            "files": urls
                .iter()
                .enumerate()
                .map(|(i, url)| json!({
                    "name": format!("Cam {}", i + 1),
                    "type": "external",
                    "external": { "url": url },
                }))
                .collect::<Vec<_>>(),
        }),
        PropertyValue::Formula(_) | PropertyValue::Rollup(_) | PropertyValue::Unsupported(_) => {
            return None;
        }
    };
    Some(encoded)
}

fn preview(body: &str) -> String {
    if body.len() > BODY_PREVIEW_LEN {
        let cut: String = body.chars().take(BODY_PREVIEW_LEN).collect();
        format!("{cut}...")
    } else {
        body.to_string()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MemoryTable {
    #[serde(default)]
    pub columns: BTreeMap<String, ColumnType>,
    #[serde(default)]
    pub rows: Vec<StoredRow>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Snapshot {
    pub databases: BTreeMap<String, MemoryTable>,
}

/// In-process store with the same paging and filter behaviour as the
/// remote one.
#[derive(Debug)]
pub struct MemoryStore {
    snapshot: RefCell<Snapshot>,
    page_size: usize,
    next_id: RefCell<u64>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::with_page_size(100)
    }
}

impl MemoryStore {
    pub fn with_page_size(page_size: usize) -> Self {
        Self {
            snapshot: RefCell::new(Snapshot::default()),
            page_size: page_size.max(1),
            next_id: RefCell::new(1),
        }
    }

    pub fn from_snapshot(snapshot: Snapshot) -> Self {
        let count = snapshot
            .databases
            .values()
            .map(|t| t.rows.len() as u64)
            .sum::<u64>();
        let store = Self::default();
        *store.snapshot.borrow_mut() = snapshot;
        *store.next_id.borrow_mut() = count + 1;
        store
    }

    pub fn load_snapshot(path: &Path) -> anyhow::Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read store snapshot {}", path.display()))?;
        let snapshot: Snapshot = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse store snapshot {}", path.display()))?;
        Ok(Self::from_snapshot(snapshot))
    }

    pub fn save_snapshot(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("failed to create snapshot directory {}", parent.display())
            })?;
        }
        let serialized = serde_json::to_string_pretty(&*self.snapshot.borrow())?;
        std::fs::write(path, serialized)
            .with_context(|| format!("failed to write store snapshot {}", path.display()))?;
        info!(snapshot = %path.display(), "store snapshot written");
        Ok(())
    }

    pub fn create_database(&self, database_id: &str, columns: &[(&str, ColumnType)]) {
        let mut snapshot = self.snapshot.borrow_mut();
        let table = snapshot.databases.entry(database_id.to_string()).or_default();
        for (name, kind) in columns {
            table.columns.insert((*name).to_string(), kind.clone());
        }
    }

    pub fn seed(&self, database_id: &str, properties: BTreeMap<String, PropertyValue>) -> String {
        let id = self.allocate_id();
        let mut snapshot = self.snapshot.borrow_mut();
        let table = snapshot.databases.entry(database_id.to_string()).or_default();
        table.rows.push(StoredRow {
            id: id.clone(),
            properties,
        });
        id
    }

    pub fn rows(&self, database_id: &str) -> Vec<StoredRow> {
        self.snapshot
            .borrow()
            .databases
            .get(database_id)
            .map(|t| t.rows.clone())
            .unwrap_or_default()
    }

    pub fn total_rows(&self) -> usize {
        self.snapshot
            .borrow()
            .databases
            .values()
            .map(|t| t.rows.len())
            .sum()
    }

    fn allocate_id(&self) -> String {
        let mut next = self.next_id.borrow_mut();
        let id = format!("mem-{:06}", *next);
        *next += 1;
        id
    }
}

impl RowStore for MemoryStore {
    fn query(
        &self,
        database_id: &str,
        filter: Option<&Filter>,
        cursor: Option<&str>,
    ) -> Result<QueryPage, StoreError> {
        let snapshot = self.snapshot.borrow();
        let table = snapshot
            .databases
            .get(database_id)
            .ok_or_else(|| StoreError::UnknownDatabase(database_id.to_string()))?;

        let matching: Vec<&StoredRow> = table
            .rows
            .iter()
            .filter(|row| filter.is_none_or(|f| f.matches(row)))
            .collect();

        let start = match cursor {
            Some(c) => c
                .parse::<usize>()
                .map_err(|_| StoreError::Status {
                    status: 400,
                    body: format!("invalid start_cursor {c}"),
                })?,
            None => 0,
        };
        let end = (start + self.page_size).min(matching.len());
        let results = matching
            .get(start..end)
            .unwrap_or_default()
            .iter()
            .map(|row| (*row).clone())
            .collect();
        let has_more = end < matching.len();

        Ok(QueryPage {
            results,
            has_more,
            next_cursor: has_more.then(|| end.to_string()),
        })
    }

    fn insert(&self, database_id: &str, payload: &WritePayload) -> Result<String, StoreError> {
        {
            let snapshot = self.snapshot.borrow();
            let table = snapshot
                .databases
                .get(database_id)
                .ok_or_else(|| StoreError::UnknownDatabase(database_id.to_string()))?;
            if !table.columns.is_empty() {
                for (name, value) in &payload.properties {
                    let body = match table.columns.get(name) {
                        None => format!("{name} is not a property that exists"),
                        Some(expected) if *expected != value.column_type() => {
                            format!("{name} is expected to be {expected}")
                        }
                        Some(_) => continue,
                    };
                    return Err(StoreError::Status { status: 400, body });
                }
            }
        }

        let id = self.allocate_id();
        let mut snapshot = self.snapshot.borrow_mut();
        if let Some(table) = snapshot.databases.get_mut(database_id) {
            table.rows.push(StoredRow {
                id: id.clone(),
                properties: payload.properties.clone(),
            });
        }
        Ok(id)
    }

    fn schema(&self, database_id: &str) -> Result<Schema, StoreError> {
        let snapshot = self.snapshot.borrow();
        let table = snapshot
            .databases
            .get(database_id)
            .ok_or_else(|| StoreError::UnknownDatabase(database_id.to_string()))?;
        Ok(Schema {
            database_id: database_id.to_string(),
            title: None,
            columns: table.columns.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_wrapped_query_page() {
        let payload = json!({
            "results": [{
                "id": "page-1",
                "properties": {
                    "Lift Name": { "type": "title", "title": [{ "plain_text": "Peak Express" }] },
                    "Top Elevation (m)": { "type": "number", "number": 2182 },
                    "Latest Report?": {
                        "type": "formula",
                        "formula": { "type": "boolean", "boolean": true }
                    },
                    "Report Date": {
                        "type": "date",
                        "date": { "start": "2025-12-08T15:00:00.000-08:00", "end": null }
                    },
                    "Season": { "type": "relation", "relation": [{ "id": "season-1" }] },
                    "Total": {
                        "type": "rollup",
                        "rollup": { "type": "number", "number": 42 }
                    },
                    "Owner": { "type": "people", "people": [] }
                }
            }],
            "has_more": true,
            "next_cursor": "abc"
        });

        let page = decode_query_page(&payload).unwrap();
        assert!(page.has_more);
        assert_eq!(page.next_cursor.as_deref(), Some("abc"));
        let row = &page.results[0];
        assert_eq!(row.title(), Some("Peak Express"));
        assert_eq!(row.number("Top Elevation (m)"), Some(2182.0));
        assert_eq!(row.checkbox("Latest Report?"), Some(true));
        assert_eq!(row.text("Report Date"), Some("2025-12-08T15:00:00.000-08:00"));
        assert_eq!(
            row.get("Season"),
            Some(&PropertyValue::Relation(vec!["season-1".to_string()]))
        );
        assert_eq!(row.number("Total"), Some(42.0));
        assert_eq!(
            row.get("Owner"),
            Some(&PropertyValue::Unsupported("people".to_string()))
        );
    }

    #[test]
    fn decodes_bare_list_response() {
        let payload = json!([{ "id": "a", "properties": {} }, { "properties": {} }]);
        let page = decode_query_page(&payload).unwrap();
        assert_eq!(page.results.len(), 1);
        assert!(!page.has_more);
    }

    #[test]
    fn encodes_write_payload_in_store_shape() {
        let payload = WritePayload::new()
            .with("Date", PropertyValue::title("2025-12-04"))
            .with("Snow (cm)", PropertyValue::int(12))
            .with("Season", PropertyValue::relation(["season-1".to_string()]))
            .with("Cams", PropertyValue::Files(vec!["https://x/cam.jpg".to_string()]))
            .with(
                "Latest Report?",
                PropertyValue::Formula(Box::new(PropertyValue::Checkbox(true))),
            );

        let body = payload.to_json("db-1");
        assert_eq!(body["parent"]["database_id"], "db-1");
        assert_eq!(body["properties"]["Date"]["title"][0]["text"]["content"], "2025-12-04");
        assert_eq!(body["properties"]["Snow (cm)"]["number"], 12);
        assert_eq!(body["properties"]["Season"]["relation"][0]["id"], "season-1");
        assert_eq!(body["properties"]["Cams"]["files"][0]["name"], "Cam 1");
        assert!(body["properties"].get("Latest Report?").is_none());
    }

    #[test]
    fn rich_text_is_truncated() {
        let long = "x".repeat(2500);
        let body = WritePayload::new()
            .with("Synopsis", PropertyValue::text(long))
            .to_json("db");
        let content = body["properties"]["Synopsis"]["rich_text"][0]["text"]["content"]
            .as_str()
            .unwrap();
        assert_eq!(content.len(), 2000);
    }

    #[test]
    fn classifies_transient_errors() {
        let server = StoreError::Status { status: 503, body: String::new() };
        let limited = StoreError::Status { status: 429, body: String::new() };
        let client = StoreError::Status { status: 400, body: String::new() };
        assert!(server.is_transient());
        assert!(limited.is_transient());
        assert!(!client.is_transient());
    }

    #[test]
    fn memory_store_paginates_and_filters() {
        let store = MemoryStore::with_page_size(2);
        store.create_database("db", &[]);
        let seeded = [
            ("1480m - a", true),
            ("1480m - b", false),
            ("2248m - c", true),
            ("1480m - d", true),
        ];
        for (title, latest) in seeded {
            let mut props = BTreeMap::new();
            props.insert("Name".to_string(), PropertyValue::title(title));
            props.insert(
                "Latest Report?".to_string(),
                PropertyValue::Formula(Box::new(PropertyValue::Checkbox(latest))),
            );
            store.seed("db", props);
        }

        assert_eq!(query_all(&store, "db", None).unwrap().len(), 4);

        let filter = Filter::And(vec![
            Filter::TitleStartsWith {
                property: "Name".to_string(),
                value: "1480m".to_string(),
            },
            Filter::FormulaCheckbox {
                property: "Latest Report?".to_string(),
                equals: true,
            },
        ]);
        let rows = query_all(&store, "db", Some(&filter)).unwrap();
        let titles: Vec<_> = rows.iter().filter_map(StoredRow::title).collect();
        assert_eq!(titles, vec!["1480m - a", "1480m - d"]);
    }

    #[test]
    fn memory_store_rejects_unknown_columns() {
        let store = MemoryStore::default();
        store.create_database("db", &[("Name", ColumnType::Title)]);
        let err = store
            .insert("db", &WritePayload::new().with("Nope", PropertyValue::int(1)))
            .unwrap_err();
        assert!(!err.is_transient());
    }

    #[test]
    fn memory_store_rejects_mismatched_column_type() {
        let store = MemoryStore::default();
        store.create_database(
            "db",
            &[("Name", ColumnType::Title), ("Forecast Type", ColumnType::RichText)],
        );
        let err = store
            .insert(
                "db",
                &WritePayload::new()
                    .with("Name", PropertyValue::title("1480m - x"))
                    .with("Forecast Type", PropertyValue::select("PM")),
            )
            .unwrap_err();
        match err {
            StoreError::Status { status, body } => {
                assert_eq!(status, 400);
                assert_eq!(body, "Forecast Type is expected to be rich_text");
            }
            other => panic!("unexpected error: {other}"),
        }

        let id = store
            .insert(
                "db",
                &WritePayload::new()
                    .with("Name", PropertyValue::title("1480m - x"))
                    .with("Forecast Type", PropertyValue::text("PM")),
            )
            .unwrap();
        assert_eq!(store.rows("db")[0].id, id);
    }

    #[test]
    fn date_filter_serializes_and_matches() {
        let filter = Filter::DateOnOrAfter {
            property: "date".to_string(),
            date: NaiveDate::from_ymd_opt(2025, 12, 1).unwrap(),
        };
        assert_eq!(filter.to_json()["date"]["on_or_after"], "2025-12-01");

        let mut props = BTreeMap::new();
        props.insert("date".to_string(), PropertyValue::date("2025-12-04"));
        let row = StoredRow { id: "x".to_string(), properties: props };
        assert!(filter.matches(&row));
    }
}
