//! Tabular store client: the `TableStore` trait, an HTTP implementation
//! for the remote document store, and an in-memory implementation used by
//! tests and dry runs.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value as JsonValue};
use tokio::sync::Mutex;
use tracing::{debug, info_span, Instrument};

use formgrid_core::{ColumnSpec, ColumnType};

pub const CRATE_NAME: &str = "formgrid-store";

/// Field map for one row, keyed by column id.
pub type RowFields = BTreeMap<String, JsonValue>;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct TableInfo {
    pub id: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StoredRow {
    pub row_id: i64,
    pub fields: RowFields,
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("store request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("store returned status {status} for {url}: {body}")]
    HttpStatus {
        status: u16,
        url: String,
        body: String,
    },
    #[error("table {table} has no column {column}")]
    UnknownColumn { table: String, column: String },
    #[error("unknown table {0}")]
    UnknownTable(String),
    #[error("store rejected the payload: {0}")]
    Rejected(String),
    #[error("store response could not be decoded: {0}")]
    Decode(#[from] serde_json::Error),
}

impl StoreError {
    /// Credential problems are fatal for the whole run, unlike per-row
    /// rejections.
    pub fn is_credential(&self) -> bool {
        matches!(self, StoreError::HttpStatus { status, .. } if *status == 401 || *status == 403)
    }
}

/// Mutable tabular document store. Tables and columns can be created at any
/// time; existing columns are never dropped or retyped through this trait.
#[async_trait]
pub trait TableStore: Send + Sync {
    async fn list_tables(&self) -> Result<Vec<TableInfo>, StoreError>;

    async fn create_table(
        &self,
        table_id: &str,
        columns: &[ColumnSpec],
    ) -> Result<String, StoreError>;

    async fn add_columns(&self, table_id: &str, columns: &[ColumnSpec])
        -> Result<(), StoreError>;

    async fn list_columns(&self, table_id: &str) -> Result<Vec<ColumnSpec>, StoreError>;

    async fn list_rows(&self, table_id: &str) -> Result<Vec<StoredRow>, StoreError>;

    /// Creates all rows in one call. The call fails as a whole if any row
    /// is rejected.
    async fn create_rows(&self, table_id: &str, rows: &[RowFields])
        -> Result<Vec<i64>, StoreError>;

    /// Updates existing rows by row id in one call.
    async fn update_rows(
        &self,
        table_id: &str,
        updates: &[(i64, RowFields)],
    ) -> Result<(), StoreError>;
}

#[derive(Debug, Clone)]
pub struct StoreClientConfig {
    pub base_url: String,
    pub api_key: String,
    pub document_id: String,
    pub timeout_secs: u64,
}

/// REST client for the remote document store.
#[derive(Clone)]
pub struct HttpTableStore {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    document_id: String,
}

impl HttpTableStore {
    pub fn new(config: &StoreClientConfig) -> Result<Self, StoreError> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            document_id: config.document_id.clone(),
        })
    }

    fn doc_url(&self, suffix: &str) -> String {
        format!(
            "{}/api/docs/{}/{}",
            self.base_url, self.document_id, suffix
        )
    }

    async fn send(
        &self,
        table_id: &str,
        request: reqwest::RequestBuilder,
    ) -> Result<JsonValue, StoreError> {
        let response = request.bearer_auth(&self.api_key).send().await?;
        let status = response.status();
        let url = response.url().to_string();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            if let Some(column) = unknown_column_in_body(&body) {
                return Err(StoreError::UnknownColumn {
                    table: table_id.to_string(),
                    column,
                });
            }
            return Err(StoreError::HttpStatus {
                status: status.as_u16(),
                url,
                body,
            });
        }
        Ok(response.json().await?)
    }

    fn column_payload(columns: &[ColumnSpec]) -> Vec<JsonValue> {
        columns
            .iter()
            .map(|column| {
                json!({
                    "id": column.id,
                    "fields": { "type": column.column_type.as_str() },
                })
            })
            .collect()
    }
}

/// The store reports writes against a missing column as a 400 whose body
/// names the offending column id.
fn unknown_column_in_body(body: &str) -> Option<String> {
    let marker = "Invalid column ";
    let start = body.find(marker)? + marker.len();
    let rest = &body[start..];
    let column: String = rest
        .chars()
        .take_while(|c| c.is_ascii_alphanumeric() || *c == '_')
        .collect();
    if column.is_empty() {
        None
    } else {
        Some(column)
    }
}

#[async_trait]
impl TableStore for HttpTableStore {
    async fn list_tables(&self) -> Result<Vec<TableInfo>, StoreError> {
        let span = info_span!("store_list_tables");
        let url = self.doc_url("tables");
        let body = self.send("", self.client.get(&url)).instrument(span).await?;
        let tables = body
            .get("tables")
            .cloned()
            .unwrap_or_else(|| json!([]));
        Ok(serde_json::from_value(tables)?)
    }

    async fn create_table(
        &self,
        table_id: &str,
        columns: &[ColumnSpec],
    ) -> Result<String, StoreError> {
        let span = info_span!("store_create_table", table = table_id);
        let url = self.doc_url("tables");
        let payload = json!({
            "tables": [{
                "id": table_id,
                "columns": Self::column_payload(columns),
            }],
        });
        let body = self
            .send(table_id, self.client.post(&url).json(&payload))
            .instrument(span)
            .await?;
        let created = body
            .get("tables")
            .and_then(|t| t.get(0))
            .and_then(|t| t.get("id"))
            .and_then(|id| id.as_str())
            .unwrap_or(table_id)
            .to_string();
        debug!(table = %created, columns = columns.len(), "table created");
        Ok(created)
    }

    async fn add_columns(
        &self,
        table_id: &str,
        columns: &[ColumnSpec],
    ) -> Result<(), StoreError> {
        let span = info_span!("store_add_columns", table = table_id, count = columns.len());
        let url = self.doc_url(&format!("tables/{table_id}/columns"));
        let payload = json!({ "columns": Self::column_payload(columns) });
        self.send(table_id, self.client.post(&url).json(&payload))
            .instrument(span)
            .await?;
        Ok(())
    }

    async fn list_columns(&self, table_id: &str) -> Result<Vec<ColumnSpec>, StoreError> {
        let url = self.doc_url(&format!("tables/{table_id}/columns"));
        let body = self.send(table_id, self.client.get(&url)).await?;
        let raw = body
            .get("columns")
            .and_then(|c| c.as_array())
            .cloned()
            .unwrap_or_default();
        let mut columns = Vec::with_capacity(raw.len());
        for entry in raw {
            let id = entry
                .get("id")
                .and_then(|id| id.as_str())
                .ok_or_else(|| StoreError::Rejected("column without id".to_string()))?;
            let column_type = entry
                .pointer("/fields/type")
                .and_then(|t| t.as_str())
                .and_then(ColumnType::parse)
                .unwrap_or(ColumnType::Text);
            columns.push(ColumnSpec {
                id: id.to_string(),
                column_type,
            });
        }
        Ok(columns)
    }

    async fn list_rows(&self, table_id: &str) -> Result<Vec<StoredRow>, StoreError> {
        let span = info_span!("store_list_rows", table = table_id);
        let url = self.doc_url(&format!("tables/{table_id}/records"));
        let body = self
            .send(table_id, self.client.get(&url))
            .instrument(span)
            .await?;
        let records = body
            .get("records")
            .and_then(|r| r.as_array())
            .cloned()
            .unwrap_or_default();
        let mut rows = Vec::with_capacity(records.len());
        for record in records {
            let row_id = record
                .get("id")
                .and_then(|id| id.as_i64())
                .ok_or_else(|| StoreError::Rejected("record without id".to_string()))?;
            let fields = record
                .get("fields")
                .cloned()
                .unwrap_or_else(|| json!({}));
            rows.push(StoredRow {
                row_id,
                fields: serde_json::from_value(fields)?,
            });
        }
        Ok(rows)
    }

    async fn create_rows(
        &self,
        table_id: &str,
        rows: &[RowFields],
    ) -> Result<Vec<i64>, StoreError> {
        let span = info_span!("store_create_rows", table = table_id, count = rows.len());
        let url = self.doc_url(&format!("tables/{table_id}/records"));
        let payload = json!({
            "records": rows.iter().map(|fields| json!({ "fields": fields })).collect::<Vec<_>>(),
        });
        let body = self
            .send(table_id, self.client.post(&url).json(&payload))
            .instrument(span)
            .await?;
        let ids = body
            .get("records")
            .and_then(|r| r.as_array())
            .map(|records| {
                records
                    .iter()
                    .filter_map(|r| r.get("id").and_then(|id| id.as_i64()))
                    .collect::<Vec<_>>()
            })
            .unwrap_or_default();
        Ok(ids)
    }

    async fn update_rows(
        &self,
        table_id: &str,
        updates: &[(i64, RowFields)],
    ) -> Result<(), StoreError> {
        let span = info_span!("store_update_rows", table = table_id, count = updates.len());
        let url = self.doc_url(&format!("tables/{table_id}/records"));
        let payload = json!({
            "records": updates
                .iter()
                .map(|(id, fields)| json!({ "id": id, "fields": fields }))
                .collect::<Vec<_>>(),
        });
        self.send(table_id, self.client.patch(&url).json(&payload))
            .instrument(span)
            .await?;
        Ok(())
    }
}

#[derive(Debug, Default)]
struct MemoryTable {
    columns: Vec<ColumnSpec>,
    rows: BTreeMap<i64, RowFields>,
    next_row_id: i64,
}

impl MemoryTable {
    fn column_ids(&self) -> Vec<&str> {
        self.columns.iter().map(|c| c.id.as_str()).collect()
    }

    fn unknown_column(&self, fields: &RowFields) -> Option<String> {
        let known = self.column_ids();
        fields
            .keys()
            .find(|key| !known.contains(&key.as_str()))
            .cloned()
    }
}

/// In-process store with the same write semantics as the remote one: bulk
/// calls fail as a whole, writes against missing columns are rejected with
/// the column id, and cell values must be scalars.
#[derive(Clone, Default)]
pub struct MemoryStore {
    tables: Arc<Mutex<BTreeMap<String, MemoryTable>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of a table's column ids, for assertions.
    pub async fn column_ids(&self, table_id: &str) -> Option<Vec<String>> {
        let tables = self.tables.lock().await;
        tables
            .get(table_id)
            .map(|t| t.columns.iter().map(|c| c.id.clone()).collect())
    }

    pub async fn row_count(&self, table_id: &str) -> usize {
        let tables = self.tables.lock().await;
        tables.get(table_id).map(|t| t.rows.len()).unwrap_or(0)
    }

    fn check_scalars(fields: &RowFields) -> Result<(), StoreError> {
        for (column, value) in fields {
            if value.is_object() || value.is_array() {
                return Err(StoreError::Rejected(format!(
                    "non-scalar value for column {column}"
                )));
            }
        }
        Ok(())
    }
}

#[async_trait]
impl TableStore for MemoryStore {
    async fn list_tables(&self) -> Result<Vec<TableInfo>, StoreError> {
        let tables = self.tables.lock().await;
        Ok(tables
            .keys()
            .map(|id| TableInfo { id: id.clone() })
            .collect())
    }

    async fn create_table(
        &self,
        table_id: &str,
        columns: &[ColumnSpec],
    ) -> Result<String, StoreError> {
        let mut tables = self.tables.lock().await;
        if tables.contains_key(table_id) {
            return Err(StoreError::Rejected(format!(
                "table {table_id} already exists"
            )));
        }
        tables.insert(
            table_id.to_string(),
            MemoryTable {
                columns: columns.to_vec(),
                rows: BTreeMap::new(),
                next_row_id: 1,
            },
        );
        Ok(table_id.to_string())
    }

    async fn add_columns(
        &self,
        table_id: &str,
        columns: &[ColumnSpec],
    ) -> Result<(), StoreError> {
        let mut tables = self.tables.lock().await;
        let table = tables
            .get_mut(table_id)
            .ok_or_else(|| StoreError::UnknownTable(table_id.to_string()))?;
        for column in columns {
            if !table.columns.iter().any(|c| c.id == column.id) {
                table.columns.push(column.clone());
            }
        }
        Ok(())
    }

    async fn list_columns(&self, table_id: &str) -> Result<Vec<ColumnSpec>, StoreError> {
        let tables = self.tables.lock().await;
        let table = tables
            .get(table_id)
            .ok_or_else(|| StoreError::UnknownTable(table_id.to_string()))?;
        Ok(table.columns.clone())
    }

    async fn list_rows(&self, table_id: &str) -> Result<Vec<StoredRow>, StoreError> {
        let tables = self.tables.lock().await;
        let table = tables
            .get(table_id)
            .ok_or_else(|| StoreError::UnknownTable(table_id.to_string()))?;
        Ok(table
            .rows
            .iter()
            .map(|(row_id, fields)| StoredRow {
                row_id: *row_id,
                fields: fields.clone(),
            })
            .collect())
    }

    async fn create_rows(
        &self,
        table_id: &str,
        rows: &[RowFields],
    ) -> Result<Vec<i64>, StoreError> {
        let mut tables = self.tables.lock().await;
        let table = tables
            .get_mut(table_id)
            .ok_or_else(|| StoreError::UnknownTable(table_id.to_string()))?;
        for fields in rows {
            if let Some(column) = table.unknown_column(fields) {
                return Err(StoreError::UnknownColumn {
                    table: table_id.to_string(),
                    column,
                });
            }
            Self::check_scalars(fields)?;
        }
        let mut ids = Vec::with_capacity(rows.len());
        for fields in rows {
            let row_id = table.next_row_id;
            table.next_row_id += 1;
            table.rows.insert(row_id, fields.clone());
            ids.push(row_id);
        }
        Ok(ids)
    }

    async fn update_rows(
        &self,
        table_id: &str,
        updates: &[(i64, RowFields)],
    ) -> Result<(), StoreError> {
        let mut tables = self.tables.lock().await;
        let table = tables
            .get_mut(table_id)
            .ok_or_else(|| StoreError::UnknownTable(table_id.to_string()))?;
        for (row_id, fields) in updates {
            if !table.rows.contains_key(row_id) {
                return Err(StoreError::Rejected(format!("no row with id {row_id}")));
            }
            if let Some(column) = table.unknown_column(fields) {
                return Err(StoreError::UnknownColumn {
                    table: table_id.to_string(),
                    column,
                });
            }
            Self::check_scalars(fields)?;
        }
        for (row_id, fields) in updates {
            if let Some(row) = table.rows.get_mut(row_id) {
                for (column, value) in fields {
                    row.insert(column.clone(), value.clone());
                }
            }
        }
        Ok(())
    }
}

pub fn column(id: &str, column_type: ColumnType) -> ColumnSpec {
    ColumnSpec {
        id: id.to_string(),
        column_type,
    }
}
