//! Task board client (Monday-style GraphQL API): create an item, then attach an update to it.

use async_trait::async_trait;
use chrono::{Duration, NaiveDate};
use serde::Serialize;
use serde_json::Value;

const USER_AGENT: &str = concat!("parley/", env!("CARGO_PKG_VERSION"));
/// Board column holding the item's deadline.
const DATE_COLUMN: &str = "date";

#[derive(Debug, thiserror::Error)]
pub enum TaskBoardError {
    #[error("task board request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("task board api error: {0}")]
    Api(String),
}

#[async_trait]
pub trait TaskBoard: Send + Sync {
    /// Create an item; returns its id. `deadline` is `DD/MM/YYYY` as written by the assistant.
    async fn create_item(&self, title: &str, deadline: Option<&str>) -> Result<String, TaskBoardError>;

    /// Attach a comment (update) to an item; returns the update id.
    async fn create_comment(&self, item_id: &str, body: &str) -> Result<String, TaskBoardError>;
}

pub struct GraphqlTaskBoard {
    api_url: String,
    token: Option<String>,
    board_id: String,
    group_id: String,
    client: reqwest::Client,
}

#[derive(Serialize)]
struct GraphqlRequest<'a> {
    query: &'a str,
}

impl GraphqlTaskBoard {
    pub fn new(api_url: &str, token: Option<String>, board_id: &str, group_id: &str) -> Self {
        Self {
            api_url: api_url.trim_end_matches('/').to_string(),
            token,
            board_id: board_id.to_string(),
            group_id: group_id.to_string(),
            client: reqwest::Client::new(),
        }
    }

    /// POST the query and return `data.<field>.id`.
    async fn mutate(&self, query: &str, field: &str) -> Result<String, TaskBoardError> {
        let mut req = self
            .client
            .post(&self.api_url)
            .header(reqwest::header::USER_AGENT, USER_AGENT)
            .json(&GraphqlRequest { query });
        if let Some(ref token) = self.token {
            req = req.header(reqwest::header::AUTHORIZATION, token);
        }
        let res = req.send().await?;
        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            return Err(TaskBoardError::Api(format!("{} {}", status, body)));
        }
        let body: Value = res.json().await?;
        mutation_id(&body, field)
    }
}

#[async_trait]
impl TaskBoard for GraphqlTaskBoard {
    async fn create_item(&self, title: &str, deadline: Option<&str>) -> Result<String, TaskBoardError> {
        let date = board_date(deadline, chrono::Local::now().date_naive());
        let query = item_mutation(&self.board_id, &self.group_id, title, date);
        let id = self.mutate(&query, "create_item").await?;
        log::info!("task_board: created item {} on board {}", id, self.board_id);
        Ok(id)
    }

    async fn create_comment(&self, item_id: &str, body: &str) -> Result<String, TaskBoardError> {
        let query = update_mutation(item_id, body);
        let id = self.mutate(&query, "create_update").await?;
        log::info!("task_board: added update {} to item {}", id, item_id);
        Ok(id)
    }
}

/// Escape text for a GraphQL string literal.
pub fn escape_graphql(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '"' => out.push_str("\\\""),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            c if c.is_ascii_control() && c != '\u{7f}' => out.push_str(&format!("\\u{:04x}", c as u32)),
            c => out.push(c),
        }
    }
    out
}

/// Deadline for the board: the `DD/MM/YYYY` date when it parses, else one week from `today`.
pub fn board_date(deadline: Option<&str>, today: NaiveDate) -> NaiveDate {
    deadline
        .and_then(|d| NaiveDate::parse_from_str(d.trim(), "%d/%m/%Y").ok())
        .unwrap_or_else(|| today + Duration::weeks(1))
}

fn item_mutation(board_id: &str, group_id: &str, title: &str, date: NaiveDate) -> String {
    format!(
        r#"mutation {{ create_item(board_id: {}, group_id: "{}", item_name: "{}", column_values: "{{\"{}\":\"{}\"}}") {{ id }} }}"#,
        board_id,
        escape_graphql(group_id),
        escape_graphql(title),
        DATE_COLUMN,
        date.format("%Y-%m-%d")
    )
}

fn update_mutation(item_id: &str, body: &str) -> String {
    format!(
        r#"mutation {{ create_update(item_id: {}, body: "{}") {{ id }} }}"#,
        item_id,
        escape_graphql(body)
    )
}

fn mutation_id(body: &Value, field: &str) -> Result<String, TaskBoardError> {
    if let Some(errors) = body.get("errors").filter(|e| !e.is_null()) {
        return Err(TaskBoardError::Api(errors.to_string()));
    }
    if let Some(msg) = body.get("error_message").and_then(Value::as_str) {
        return Err(TaskBoardError::Api(msg.to_string()));
    }
    match body.get("data").and_then(|d| d.get(field)).and_then(|f| f.get("id")) {
        Some(Value::String(s)) => Ok(s.clone()),
        Some(Value::Number(n)) => Ok(n.to_string()),
        _ => Err(TaskBoardError::Api(format!("response has no data.{}.id: {}", field, body))),
    }
}
