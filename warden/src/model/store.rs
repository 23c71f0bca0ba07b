//! Indexed in-memory rule store.
//!
//! One store per policy definition: a SQLite `:memory:` table with a column
//! per policy token and a secondary index per column. The enforcer
//! pre-filters candidate rules with the WHERE clause produced by the SQL
//! lowering; ids returned here must be dereferenced against the policy
//! collection, which remains the source of truth for rule values.

use rusqlite::types::Value as SqlValue;
use rusqlite::{params_from_iter, Connection};

use crate::error::StoreError;

const TABLE: &str = "rule";

/// SQLite's default bound-parameter limit; batch sizes stay under it.
const MAX_BOUND_PARAMS: usize = 999;

/// An id-addressed relational table over the policy columns.
#[derive(Debug)]
pub struct RuleStore {
    conn: Connection,
    tokens: Vec<String>,
}

impl RuleStore {
    /// Build the table and its per-column indexes in one step.
    pub fn create(tokens: &[String]) -> Result<Self, StoreError> {
        for token in tokens {
            validate_column(token)?;
        }

        let conn = Connection::open_in_memory()?;

        let mut columns = vec!["id INTEGER NOT NULL PRIMARY KEY".to_string()];
        let mut indexes = Vec::new();
        for token in tokens {
            columns.push(format!("{token} TEXT"));
            indexes.push(format!("CREATE INDEX {token}_index ON {TABLE} ({token});"));
        }
        let statement = format!(
            "BEGIN; CREATE TABLE {TABLE} ({}); {} COMMIT;",
            columns.join(","),
            indexes.join(" ")
        );
        conn.execute_batch(&statement)?;

        Ok(RuleStore {
            conn,
            tokens: tokens.to_vec(),
        })
    }

    fn check_arity(&self, got: usize) -> Result<(), StoreError> {
        if got != self.tokens.len() {
            return Err(StoreError::Arity {
                expected: self.tokens.len(),
                got,
            });
        }
        Ok(())
    }

    /// Insert one rule under a caller-assigned id.
    pub fn insert(&self, id: i64, values: &[String]) -> Result<(), StoreError> {
        self.check_arity(values.len())?;

        let mut fields = vec!["id".to_string()];
        fields.extend(self.tokens.iter().cloned());
        let marks = vec!["?"; fields.len()].join(",");
        let statement = format!(
            "INSERT INTO {TABLE} ({}) VALUES ({marks})",
            fields.join(",")
        );

        let mut params = vec![SqlValue::Integer(id)];
        params.extend(values.iter().map(|v| SqlValue::Text(v.clone())));
        self.conn.execute(&statement, params_from_iter(params))?;
        Ok(())
    }

    /// Batched insertion, sized to stay under the bound-parameter limit.
    pub fn bulk_insert<'a, I>(&self, entries: I) -> Result<(), StoreError>
    where
        I: IntoIterator<Item = (i64, &'a [String])>,
    {
        let width = self.tokens.len() + 1;
        let batch_size = (MAX_BOUND_PARAMS / width).max(1);

        let mut fields = vec!["id".to_string()];
        fields.extend(self.tokens.iter().cloned());
        let row_marks = format!("({})", vec!["?"; width].join(","));
        let prefix = format!("INSERT INTO {TABLE} ({}) VALUES ", fields.join(","));

        let mut rows = 0usize;
        let mut params: Vec<SqlValue> = Vec::with_capacity(batch_size * width);
        for (id, values) in entries {
            self.check_arity(values.len())?;
            params.push(SqlValue::Integer(id));
            params.extend(values.iter().map(|v| SqlValue::Text(v.clone())));
            rows += 1;

            if rows == batch_size {
                let statement = format!("{prefix}{}", vec![row_marks.as_str(); rows].join(","));
                self.conn
                    .execute(&statement, params_from_iter(params.drain(..)))?;
                rows = 0;
            }
        }
        if rows > 0 {
            let statement = format!("{prefix}{}", vec![row_marks.as_str(); rows].join(","));
            self.conn
                .execute(&statement, params_from_iter(params.drain(..)))?;
        }
        Ok(())
    }

    /// Delete rules by id, batched under the bound-parameter limit.
    pub fn delete_by_ids(&self, ids: &[i64]) -> Result<(), StoreError> {
        for chunk in ids.chunks(MAX_BOUND_PARAMS) {
            let marks = vec!["?"; chunk.len()].join(",");
            let statement = format!("DELETE FROM {TABLE} WHERE id IN ({marks})");
            self.conn.execute(
                &statement,
                params_from_iter(chunk.iter().map(|id| SqlValue::Integer(*id))),
            )?;
        }
        Ok(())
    }

    /// Delete every rule whose columns all equal the given value tuple.
    pub fn delete_by_values(&self, values: &[String]) -> Result<(), StoreError> {
        self.check_arity(values.len())?;
        let conditions: Vec<String> = self.tokens.iter().map(|t| format!("{t} = ?")).collect();
        let statement = format!(
            "DELETE FROM {TABLE} WHERE {}",
            conditions.join(" AND ")
        );
        self.conn.execute(
            &statement,
            params_from_iter(values.iter().map(|v| SqlValue::Text(v.clone()))),
        )?;
        Ok(())
    }

    /// Candidate ids matching a WHERE clause, in insertion (id) order.
    pub fn query(&self, where_clause: &str) -> Result<Vec<i64>, StoreError> {
        let statement = format!("SELECT id FROM {TABLE} WHERE {where_clause} ORDER BY id");
        let mut stmt = self.conn.prepare(&statement)?;
        let ids = stmt
            .query_map([], |row| row.get(0))?
            .collect::<Result<Vec<i64>, _>>()?;
        Ok(ids)
    }

    /// Number of rules equal to the given value tuple; the duplicate check.
    pub fn count(&self, values: &[String]) -> Result<i64, StoreError> {
        self.check_arity(values.len())?;
        let conditions: Vec<String> = self.tokens.iter().map(|t| format!("{t} = ?")).collect();
        let statement = format!(
            "SELECT COUNT(*) FROM {TABLE} WHERE {}",
            conditions.join(" AND ")
        );
        let count = self.conn.query_row(
            &statement,
            params_from_iter(values.iter().map(|v| SqlValue::Text(v.clone()))),
            |row| row.get(0),
        )?;
        Ok(count)
    }

    /// Remove every rule.
    pub fn clear(&self) -> Result<(), StoreError> {
        self.conn
            .execute(&format!("DELETE FROM {TABLE}"), [])?;
        Ok(())
    }

    /// All ids currently present, ascending.
    pub fn ids(&self) -> Result<Vec<i64>, StoreError> {
        self.query(crate::expr::ALL_CONDITION)
    }
}

/// Column names come from model tokens; restrict them to identifier
/// characters so token text can never smuggle SQL into the schema.
fn validate_column(token: &str) -> Result<(), StoreError> {
    let mut chars = token.chars();
    let valid_head = chars
        .next()
        .map(|c| c.is_ascii_alphabetic() || c == '_')
        .unwrap_or(false);
    if valid_head && token.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        Ok(())
    } else {
        Err(StoreError::ColumnName(token.to_string()))
    }
}
