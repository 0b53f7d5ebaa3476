//! Embedded SQL backend for data-only transforms
//!
//! Each execution gets a fresh, private in-memory SQLite database, so no
//! table or attached state can leak between executions. Tabular context
//! inputs (arrays of uniform objects) are materialized as TEXT-column
//! tables named by their input key before the caller's SQL runs. Query
//! statements return aligned row previews; other statements report
//! affected-row counts. There is no fallback path: if the engine cannot
//! open a database, `is_available` is false and the registry routes
//! elsewhere.

use crate::core_types::{
    BackendKind, ErrorCode, ExecutionContext, ExecutionResult, Language, OutputType,
    ResourceLimits,
};
use crate::sandbox::{BackendStatus, ExecutionTracker, IsolationBackend};
use async_trait::async_trait;
use rusqlite::Connection;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

const PREVIEW_ROWS: usize = 50;
const MAX_CELL_WIDTH: usize = 40;
const TRUNCATION_MARKER: &str = "...(output truncated)";

static SUPPORTED: &[Language] = &[Language::Sql];

pub struct SqlBackend {
    tracker: Arc<ExecutionTracker>,
    availability: OnceLock<bool>,
}

impl SqlBackend {
    pub fn new(tracker: ExecutionTracker) -> Self {
        Self {
            tracker: Arc::new(tracker),
            availability: OnceLock::new(),
        }
    }
}

#[async_trait]
impl IsolationBackend for SqlBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Native
    }

    fn supported_languages(&self) -> &[Language] {
        SUPPORTED
    }

    async fn execute(
        &self,
        code: &str,
        language: Language,
        context: &ExecutionContext,
        limits: Option<&ResourceLimits>,
    ) -> ExecutionResult {
        if language != Language::Sql {
            return ExecutionResult::failure(
                ErrorCode::UnsupportedLanguage,
                format!("sql backend cannot execute {}", language),
            );
        }

        let tracker = self.tracker.clone();
        tracker
            .run(code, language, context, limits, false, move |limits| async move {
                let interrupt = Arc::new(Mutex::new(None::<rusqlite::InterruptHandle>));
                let hook_interrupt = interrupt.clone();
                self.tracker.track(
                    &context.execution_id,
                    Box::new(move || {
                        if let Some(handle) =
                            hook_interrupt.lock().unwrap_or_else(|p| p.into_inner()).as_ref()
                        {
                            handle.interrupt();
                        }
                    }),
                );

                let code = code.to_string();
                let inputs = context.inputs.clone();
                let deadline_ms = limits.max_execution_time_ms;
                let max_output = limits.max_output_bytes;
                let expired = Arc::new(AtomicBool::new(false));
                let worker_expired = expired.clone();
                let worker_interrupt = interrupt.clone();
                let mut task = tokio::task::spawn_blocking(move || {
                    run_sql(&code, &inputs, max_output, worker_interrupt, worker_expired)
                });

                // On expiry the running statement must actually be stopped,
                // not just abandoned: fire the interrupt, then reap the
                // blocking task so it cannot outlive its deadline on a
                // blocking-pool thread.
                match tokio::time::timeout(Duration::from_millis(deadline_ms), &mut task).await {
                    Ok(Ok(result)) => result,
                    Ok(Err(e)) => ExecutionResult::failure(
                        ErrorCode::Internal,
                        format!("sql worker task failed: {}", e),
                    ),
                    Err(_) => {
                        expired.store(true, Ordering::SeqCst);
                        if let Some(handle) =
                            interrupt.lock().unwrap_or_else(|p| p.into_inner()).as_ref()
                        {
                            handle.interrupt();
                        }
                        let _ = task.await;
                        ExecutionResult::failure(
                            ErrorCode::Timeout,
                            format!("execution exceeded the {}ms time limit", deadline_ms),
                        )
                    }
                }
            })
            .await
    }

    async fn is_available(&self) -> bool {
        *self
            .availability
            .get_or_init(|| Connection::open_in_memory().is_ok())
    }

    async fn terminate(&self, execution_id: &str) {
        self.tracker.terminate(execution_id);
    }

    async fn status(&self) -> BackendStatus {
        BackendStatus {
            kind: BackendKind::Native,
            available: self.is_available().await,
            degraded: false,
            running: self.tracker.running_count(),
        }
    }

    async fn cleanup(&self) {
        self.tracker.terminate_all();
    }
}

fn run_sql(
    code: &str,
    inputs: &HashMap<String, Value>,
    max_output: usize,
    interrupt: Arc<Mutex<Option<rusqlite::InterruptHandle>>>,
    expired: Arc<AtomicBool>,
) -> ExecutionResult {
    let conn = match Connection::open_in_memory() {
        Ok(conn) => conn,
        Err(e) => {
            return ExecutionResult::failure(
                ErrorCode::BackendUnavailable,
                format!("could not open in-memory database: {}", e),
            )
        }
    };
    {
        let mut slot = interrupt.lock().unwrap_or_else(|p| p.into_inner());
        *slot = Some(conn.get_interrupt_handle());
    }

    if let Err(e) = materialize_inputs(&conn, inputs) {
        return ExecutionResult::failure(ErrorCode::ExecutionFault, e);
    }

    let mut output = String::new();
    for statement in code.split(';') {
        let statement = statement.trim();
        if statement.is_empty() {
            continue;
        }
        // The interrupt only reaches a statement already in progress;
        // this flag stops the script between statements.
        if expired.load(Ordering::SeqCst) {
            return ExecutionResult::failure(
                ErrorCode::Timeout,
                "execution exceeded its time limit",
            );
        }
        let rendered = if is_query_statement(statement) {
            run_query(&conn, statement)
        } else {
            conn.execute(statement, [])
                .map(|n| format!("{} row(s) affected", n))
        };
        match rendered {
            Ok(text) => {
                if !output.is_empty() {
                    output.push('\n');
                }
                output.push_str(&text);
            }
            Err(e) => {
                return ExecutionResult {
                    formatted_output: output,
                    ..ExecutionResult::failure(
                        ErrorCode::ExecutionFault,
                        format!("sql error: {}", e),
                    )
                };
            }
        }
        if output.len() > max_output {
            let mut end = max_output;
            while !output.is_char_boundary(end) {
                end -= 1;
            }
            output.truncate(end);
            output.push('\n');
            output.push_str(TRUNCATION_MARKER);
            return ExecutionResult {
                formatted_output: output,
                ..ExecutionResult::failure(
                    ErrorCode::ResourceExceeded,
                    format!("output exceeded the {} byte limit", max_output),
                )
            };
        }
    }

    ExecutionResult::success(Value::String(output.clone()), output, OutputType::String)
}

fn is_query_statement(statement: &str) -> bool {
    let lower = statement.to_lowercase();
    lower.starts_with("select") || lower.starts_with("pragma") || lower.starts_with("explain")
}

/// Quote an identifier derived from untrusted input keys.
fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', ""))
}

/// Create one TEXT-column table per tabular input (a non-empty array of
/// objects). Non-tabular inputs are skipped; SQL steps address data, not
/// scalars.
fn materialize_inputs(conn: &Connection, inputs: &HashMap<String, Value>) -> Result<(), String> {
    for (key, value) in inputs {
        let Value::Array(rows) = value else { continue };
        let Some(Value::Object(first)) = rows.first() else {
            continue;
        };
        let columns: Vec<String> = first.keys().cloned().collect();
        if columns.is_empty() {
            continue;
        }

        let column_sql = columns
            .iter()
            .map(|c| format!("{} TEXT", quote_ident(c)))
            .collect::<Vec<_>>()
            .join(", ");
        conn.execute(
            &format!("CREATE TABLE {} ({})", quote_ident(key), column_sql),
            [],
        )
        .map_err(|e| format!("could not create table for input '{}': {}", key, e))?;

        let placeholders = vec!["?"; columns.len()].join(", ");
        let insert_sql = format!(
            "INSERT INTO {} ({}) VALUES ({})",
            quote_ident(key),
            columns
                .iter()
                .map(|c| quote_ident(c))
                .collect::<Vec<_>>()
                .join(", "),
            placeholders
        );
        let mut stmt = conn
            .prepare(&insert_sql)
            .map_err(|e| format!("could not prepare insert for input '{}': {}", key, e))?;
        for row in rows {
            let Value::Object(row) = row else { continue };
            let values: Vec<String> = columns
                .iter()
                .map(|c| match row.get(c) {
                    Some(Value::String(s)) => s.clone(),
                    Some(Value::Null) | None => String::new(),
                    Some(other) => other.to_string(),
                })
                .collect();
            stmt.execute(rusqlite::params_from_iter(values.iter()))
                .map_err(|e| format!("could not insert row into '{}': {}", key, e))?;
        }
    }
    Ok(())
}

/// Run a query statement and render an aligned text-table preview capped
/// at [`PREVIEW_ROWS`] rows.
fn run_query(conn: &Connection, statement: &str) -> Result<String, rusqlite::Error> {
    let mut stmt = conn.prepare(statement)?;
    let column_names: Vec<String> = stmt.column_names().iter().map(|s| s.to_string()).collect();
    let column_count = column_names.len();

    let mut rows = stmt.query([])?;
    let mut table: Vec<Vec<String>> = Vec::new();
    let mut total_rows = 0usize;
    while let Some(row) = rows.next()? {
        total_rows += 1;
        if table.len() >= PREVIEW_ROWS {
            continue;
        }
        let mut cells = Vec::with_capacity(column_count);
        for i in 0..column_count {
            let cell: String = match row.get_ref(i)? {
                rusqlite::types::ValueRef::Null => "NULL".to_string(),
                rusqlite::types::ValueRef::Integer(v) => v.to_string(),
                rusqlite::types::ValueRef::Real(v) => v.to_string(),
                rusqlite::types::ValueRef::Text(v) => String::from_utf8_lossy(v).into_owned(),
                rusqlite::types::ValueRef::Blob(v) => format!("<{} bytes>", v.len()),
            };
            cells.push(clip_cell(cell));
        }
        table.push(cells);
    }

    let mut widths: Vec<usize> = column_names.iter().map(|c| c.len()).collect();
    for row in &table {
        for (i, cell) in row.iter().enumerate() {
            widths[i] = widths[i].max(cell.len());
        }
    }

    let mut out = String::new();
    render_row(&mut out, &column_names, &widths);
    let separator: Vec<String> = widths.iter().map(|w| "-".repeat(*w)).collect();
    render_row(&mut out, &separator, &widths);
    for row in &table {
        render_row(&mut out, row, &widths);
    }
    if total_rows > PREVIEW_ROWS {
        out.push_str(&format!("...({} more rows)\n", total_rows - PREVIEW_ROWS));
    }
    out.push_str(&format!("({} rows)", total_rows));
    Ok(out)
}

fn clip_cell(cell: String) -> String {
    if cell.len() > MAX_CELL_WIDTH {
        let mut end = MAX_CELL_WIDTH;
        while !cell.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}...", &cell[..end])
    } else {
        cell
    }
}

fn render_row(out: &mut String, cells: &[String], widths: &[usize]) {
    let line: Vec<String> = cells
        .iter()
        .zip(widths)
        .map(|(cell, width)| format!("{:<width$}", cell, width = width))
        .collect();
    out.push_str(line.join(" | ").trim_end());
    out.push('\n');
}
