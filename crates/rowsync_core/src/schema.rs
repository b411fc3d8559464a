//! Schema registry: table declarations, relationships and row validation.
//!
//! The registry is built once at process start from a fixed set of
//! declarations and is immutable afterwards. Every mistake in the
//! declarations (duplicate tables, primary keys naming undeclared columns,
//! relationships pointing at unknown tables) is reported by
//! [`SchemaBuilder::build`], never later per request.

use crate::error::{CoreError, CoreResult};
use crate::value::{Row, RowKey, Value};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashSet};

/// Primitive column type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnType {
    /// UTF-8 text.
    Text,
    /// 64-bit signed integer.
    Integer,
    /// 64-bit float (integers are accepted and widened).
    Float,
    /// Boolean.
    Boolean,
}

impl ColumnType {
    /// Returns true if a non-null value is acceptable for this type.
    pub fn accepts(&self, value: &Value) -> bool {
        matches!(
            (self, value),
            (ColumnType::Text, Value::Text(_))
                | (ColumnType::Integer, Value::Integer(_))
                | (ColumnType::Float, Value::Float(_) | Value::Integer(_))
                | (ColumnType::Boolean, Value::Bool(_))
        )
    }

    fn name(&self) -> &'static str {
        match self {
            ColumnType::Text => "text",
            ColumnType::Integer => "integer",
            ColumnType::Float => "float",
            ColumnType::Boolean => "boolean",
        }
    }
}

/// A column declaration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnDef {
    /// Column name.
    pub name: String,
    /// Column type.
    pub column_type: ColumnType,
    /// Whether the column may be null or absent.
    pub optional: bool,
}

/// A table declaration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSchema {
    /// Table name.
    pub name: String,
    /// Columns in declaration order.
    pub columns: Vec<ColumnDef>,
    /// Primary key column names.
    pub primary_key: Vec<String>,
}

impl TableSchema {
    /// Starts a table declaration.
    pub fn builder(name: impl Into<String>) -> TableBuilder {
        TableBuilder {
            schema: TableSchema {
                name: name.into(),
                columns: Vec::new(),
                primary_key: Vec::new(),
            },
        }
    }

    /// Looks up a column.
    pub fn column(&self, name: &str) -> Option<&ColumnDef> {
        self.columns.iter().find(|c| c.name == name)
    }

    /// Returns true if the table declares the column.
    pub fn has_column(&self, name: &str) -> bool {
        self.column(name).is_some()
    }

    /// Returns an error unless the table declares the column.
    pub fn require_column(&self, name: &str) -> CoreResult<&ColumnDef> {
        self.column(name).ok_or_else(|| CoreError::UnknownColumn {
            table: self.name.clone(),
            column: name.to_string(),
        })
    }

    /// Extracts the primary key of a row.
    pub fn row_key(&self, row: &Row) -> CoreResult<RowKey> {
        self.primary_key
            .iter()
            .map(|col| match row.get(col) {
                Some(v) if !v.is_null() => Ok(v.clone()),
                _ => Err(CoreError::validation(format!(
                    "{}: missing primary key column `{col}`",
                    self.name
                ))),
            })
            .collect::<CoreResult<Vec<_>>>()
            .map(RowKey)
    }

    /// Builds a row holding only the primary key columns.
    pub fn key_row(&self, key: &RowKey) -> Row {
        self.primary_key
            .iter()
            .cloned()
            .zip(key.values().iter().cloned())
            .collect()
    }

    /// Validates a complete row.
    pub fn validate_row(&self, row: &Row) -> CoreResult<()> {
        self.check_known_columns(row)?;
        for column in &self.columns {
            match row.get(&column.name) {
                None | Some(Value::Null) if !column.optional => {
                    return Err(CoreError::validation(format!(
                        "{}: missing required column `{}`",
                        self.name, column.name
                    )));
                }
                Some(v) => self.check_type(column, v)?,
                None => {}
            }
        }
        Ok(())
    }

    /// Validates a partial row used by `update`: the primary key must be
    /// present, and only declared columns with matching types may appear.
    pub fn validate_patch(&self, patch: &Row) -> CoreResult<()> {
        self.check_known_columns(patch)?;
        self.row_key(patch)?;
        for (name, value) in patch.iter() {
            let column = self.require_column(name)?;
            if value.is_null() && !column.optional {
                return Err(CoreError::validation(format!(
                    "{}: column `{name}` cannot be null",
                    self.name
                )));
            }
            self.check_type(column, value)?;
        }
        Ok(())
    }

    fn check_known_columns(&self, row: &Row) -> CoreResult<()> {
        for name in row.columns() {
            self.require_column(name)?;
        }
        Ok(())
    }

    fn check_type(&self, column: &ColumnDef, value: &Value) -> CoreResult<()> {
        if value.is_null() || column.column_type.accepts(value) {
            Ok(())
        } else {
            Err(CoreError::validation(format!(
                "{}: column `{}` expects {}, got {value}",
                self.name,
                column.name,
                column.column_type.name()
            )))
        }
    }
}

/// Builder for a [`TableSchema`].
#[derive(Debug)]
pub struct TableBuilder {
    schema: TableSchema,
}

impl TableBuilder {
    /// Adds a required column.
    pub fn column(mut self, name: impl Into<String>, column_type: ColumnType) -> Self {
        self.schema.columns.push(ColumnDef {
            name: name.into(),
            column_type,
            optional: false,
        });
        self
    }

    /// Adds an optional column.
    pub fn optional(mut self, name: impl Into<String>, column_type: ColumnType) -> Self {
        self.schema.columns.push(ColumnDef {
            name: name.into(),
            column_type,
            optional: true,
        });
        self
    }

    /// Declares the primary key.
    pub fn primary_key<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.schema.primary_key = columns.into_iter().map(Into::into).collect();
        self
    }

    /// Finishes the declaration. Validation happens in [`SchemaBuilder::build`].
    pub fn build(self) -> TableSchema {
        self.schema
    }
}

/// Relationship cardinality.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Cardinality {
    /// At most one destination row per source row.
    One,
    /// Any number of destination rows per source row.
    Many,
}

/// A named edge between two tables, used for query composition only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Relationship {
    /// Relationship name, unique per source table.
    pub name: String,
    /// Source table.
    pub source_table: String,
    /// Source columns.
    pub source_fields: Vec<String>,
    /// Destination table.
    pub dest_table: String,
    /// Destination columns, matched positionally with `source_fields`.
    pub dest_fields: Vec<String>,
    /// Cardinality.
    pub cardinality: Cardinality,
}

impl Relationship {
    /// Declares a relationship with single-column fields.
    pub fn new(
        name: impl Into<String>,
        source_table: impl Into<String>,
        source_field: impl Into<String>,
        dest_table: impl Into<String>,
        dest_field: impl Into<String>,
        cardinality: Cardinality,
    ) -> Self {
        Self {
            name: name.into(),
            source_table: source_table.into(),
            source_fields: vec![source_field.into()],
            dest_table: dest_table.into(),
            dest_fields: vec![dest_field.into()],
            cardinality,
        }
    }

    /// Join values of a source row, or `None` if any is null.
    pub fn source_values(&self, row: &Row) -> Option<Vec<Value>> {
        join_values(&self.source_fields, row)
    }

    /// Join values of a destination row, or `None` if any is null.
    pub fn dest_values(&self, row: &Row) -> Option<Vec<Value>> {
        join_values(&self.dest_fields, row)
    }
}

fn join_values(fields: &[String], row: &Row) -> Option<Vec<Value>> {
    fields
        .iter()
        .map(|f| match row.value(f) {
            Value::Null => None,
            v => Some(v.clone()),
        })
        .collect()
}

/// The immutable set of table and relationship declarations.
#[derive(Debug, Clone)]
pub struct SchemaRegistry {
    tables: BTreeMap<String, TableSchema>,
    relationships: BTreeMap<(String, String), Relationship>,
    version: String,
}

impl SchemaRegistry {
    /// Starts a registry declaration.
    pub fn builder() -> SchemaBuilder {
        SchemaBuilder::default()
    }

    /// Looks up a table by name.
    pub fn table(&self, name: &str) -> CoreResult<&TableSchema> {
        self.tables
            .get(name)
            .ok_or_else(|| CoreError::UnknownTable(name.to_string()))
    }

    /// Returns true if the table is declared.
    pub fn has_table(&self, name: &str) -> bool {
        self.tables.contains_key(name)
    }

    /// Iterates over declared tables in name order.
    pub fn tables(&self) -> impl Iterator<Item = &TableSchema> {
        self.tables.values()
    }

    /// Looks up a relationship declared on `table`.
    pub fn relationship(&self, table: &str, name: &str) -> CoreResult<&Relationship> {
        self.relationships
            .get(&(table.to_string(), name.to_string()))
            .ok_or_else(|| CoreError::UnknownRelationship {
                table: table.to_string(),
                name: name.to_string(),
            })
    }

    /// Iterates over all relationships.
    pub fn relationships(&self) -> impl Iterator<Item = &Relationship> {
        self.relationships.values()
    }

    /// Stable fingerprint of the declarations.
    ///
    /// Client and server exchange it during the handshake; a mismatch means
    /// the two sides were built from different declarations.
    pub fn version(&self) -> &str {
        &self.version
    }
}

/// Builder for a [`SchemaRegistry`].
#[derive(Debug, Default)]
pub struct SchemaBuilder {
    tables: Vec<TableSchema>,
    relationships: Vec<Relationship>,
}

impl SchemaBuilder {
    /// Adds a table.
    pub fn table(mut self, table: TableSchema) -> Self {
        self.tables.push(table);
        self
    }

    /// Adds a relationship.
    pub fn relationship(mut self, relationship: Relationship) -> Self {
        self.relationships.push(relationship);
        self
    }

    /// Validates every declaration and freezes the registry.
    pub fn build(self) -> CoreResult<SchemaRegistry> {
        let mut tables = BTreeMap::new();
        for table in self.tables {
            validate_table(&table)?;
            if tables.contains_key(&table.name) {
                return Err(CoreError::invalid_schema(format!(
                    "table `{}` declared twice",
                    table.name
                )));
            }
            tables.insert(table.name.clone(), table);
        }

        let mut relationships = BTreeMap::new();
        for rel in self.relationships {
            validate_relationship(&rel, &tables)?;
            let key = (rel.source_table.clone(), rel.name.clone());
            if relationships.contains_key(&key) {
                return Err(CoreError::invalid_schema(format!(
                    "relationship `{}` declared twice on `{}`",
                    rel.name, rel.source_table
                )));
            }
            relationships.insert(key, rel);
        }

        let version = fingerprint(&tables, &relationships);
        Ok(SchemaRegistry {
            tables,
            relationships,
            version,
        })
    }
}

fn validate_table(table: &TableSchema) -> CoreResult<()> {
    if table.name.is_empty() {
        return Err(CoreError::invalid_schema("table name cannot be empty"));
    }
    let mut seen = HashSet::new();
    for column in &table.columns {
        if !seen.insert(column.name.as_str()) {
            return Err(CoreError::invalid_schema(format!(
                "column `{}` declared twice in `{}`",
                column.name, table.name
            )));
        }
    }
    if table.primary_key.is_empty() {
        return Err(CoreError::invalid_schema(format!(
            "table `{}` has no primary key",
            table.name
        )));
    }
    for pk in &table.primary_key {
        let column = table.column(pk).ok_or_else(|| {
            CoreError::invalid_schema(format!(
                "primary key column `{pk}` is not declared in `{}`",
                table.name
            ))
        })?;
        if column.optional {
            return Err(CoreError::invalid_schema(format!(
                "primary key column `{pk}` in `{}` cannot be optional",
                table.name
            )));
        }
    }
    Ok(())
}

fn validate_relationship(
    rel: &Relationship,
    tables: &BTreeMap<String, TableSchema>,
) -> CoreResult<()> {
    let source = tables
        .get(&rel.source_table)
        .ok_or_else(|| CoreError::UnknownTable(rel.source_table.clone()))?;
    let dest = tables
        .get(&rel.dest_table)
        .ok_or_else(|| CoreError::UnknownTable(rel.dest_table.clone()))?;
    if rel.source_fields.is_empty() || rel.source_fields.len() != rel.dest_fields.len() {
        return Err(CoreError::invalid_schema(format!(
            "relationship `{}` on `{}` has mismatched fields",
            rel.name, rel.source_table
        )));
    }
    for field in &rel.source_fields {
        source.require_column(field)?;
    }
    for field in &rel.dest_fields {
        dest.require_column(field)?;
    }
    Ok(())
}

fn fingerprint(
    tables: &BTreeMap<String, TableSchema>,
    relationships: &BTreeMap<(String, String), Relationship>,
) -> String {
    let mut hasher = Sha256::new();
    for table in tables.values() {
        hasher.update(table.name.as_bytes());
        for column in &table.columns {
            hasher.update(b"|");
            hasher.update(column.name.as_bytes());
            hasher.update(column.column_type.name().as_bytes());
            hasher.update([u8::from(column.optional)]);
        }
        hasher.update(b"#");
        hasher.update(table.primary_key.join(",").as_bytes());
        hasher.update(b";");
    }
    for rel in relationships.values() {
        hasher.update(rel.source_table.as_bytes());
        hasher.update(rel.name.as_bytes());
        hasher.update(rel.dest_table.as_bytes());
        hasher.update(rel.source_fields.join(",").as_bytes());
        hasher.update(rel.dest_fields.join(",").as_bytes());
        hasher.update([matches!(rel.cardinality, Cardinality::Many) as u8]);
    }
    hasher
        .finalize()
        .iter()
        .take(8)
        .map(|b| format!("{b:02x}"))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn block_table() -> TableSchema {
        TableSchema::builder("block")
            .column("id", ColumnType::Text)
            .column("blockerId", ColumnType::Text)
            .column("blockedId", ColumnType::Text)
            .optional("reason", ColumnType::Text)
            .primary_key(["id"])
            .build()
    }

    fn user_table() -> TableSchema {
        TableSchema::builder("user")
            .column("id", ColumnType::Text)
            .column("name", ColumnType::Text)
            .primary_key(["id"])
            .build()
    }

    #[test]
    fn registry_lookup() {
        let registry = SchemaRegistry::builder()
            .table(block_table())
            .table(user_table())
            .relationship(Relationship::new(
                "blocked",
                "block",
                "blockedId",
                "user",
                "id",
                Cardinality::One,
            ))
            .build()
            .unwrap();

        assert!(registry.has_table("block"));
        assert_eq!(registry.table("user").unwrap().primary_key, vec!["id"]);
        assert!(matches!(
            registry.table("nope"),
            Err(CoreError::UnknownTable(_))
        ));
        assert_eq!(
            registry.relationship("block", "blocked").unwrap().dest_table,
            "user"
        );
        assert!(registry.relationship("user", "blocked").is_err());
    }

    #[test]
    fn duplicate_table_is_fatal() {
        let result = SchemaRegistry::builder()
            .table(user_table())
            .table(user_table())
            .build();
        assert!(matches!(result, Err(CoreError::InvalidSchema(_))));
    }

    #[test]
    fn primary_key_must_be_declared_and_required() {
        let missing = TableSchema::builder("t")
            .column("a", ColumnType::Text)
            .primary_key(["b"])
            .build();
        assert!(SchemaRegistry::builder().table(missing).build().is_err());

        let optional = TableSchema::builder("t")
            .optional("a", ColumnType::Text)
            .primary_key(["a"])
            .build();
        assert!(SchemaRegistry::builder().table(optional).build().is_err());
    }

    #[test]
    fn relationship_to_undeclared_table_is_fatal() {
        let result = SchemaRegistry::builder()
            .table(block_table())
            .relationship(Relationship::new(
                "blocked",
                "block",
                "blockedId",
                "user",
                "id",
                Cardinality::One,
            ))
            .build();
        assert_eq!(result.unwrap_err(), CoreError::UnknownTable("user".into()));
    }

    #[test]
    fn validate_full_row() {
        let table = block_table();
        let ok = Row::new()
            .with("id", "b1")
            .with("blockerId", "A")
            .with("blockedId", "B");
        table.validate_row(&ok).unwrap();

        let missing = Row::new().with("id", "b1").with("blockerId", "A");
        assert!(table.validate_row(&missing).is_err());

        let wrong_type = ok.clone().with("reason", 5i64);
        assert!(table.validate_row(&wrong_type).is_err());

        let unknown = ok.with("extra", "x");
        assert!(matches!(
            table.validate_row(&unknown),
            Err(CoreError::UnknownColumn { .. })
        ));
    }

    #[test]
    fn validate_patch_requires_key() {
        let table = block_table();
        table
            .validate_patch(&Row::new().with("id", "b1").with("reason", "spam"))
            .unwrap();
        assert!(table
            .validate_patch(&Row::new().with("reason", "spam"))
            .is_err());
        assert!(table
            .validate_patch(&Row::new().with("id", "b1").with("blockerId", Value::Null))
            .is_err());
    }

    #[test]
    fn version_is_stable_and_sensitive() {
        let a = SchemaRegistry::builder().table(user_table()).build().unwrap();
        let b = SchemaRegistry::builder().table(user_table()).build().unwrap();
        let c = SchemaRegistry::builder()
            .table(user_table())
            .table(block_table())
            .build()
            .unwrap();
        assert_eq!(a.version(), b.version());
        assert_ne!(a.version(), c.version());
        assert_eq!(a.version().len(), 16);
    }

    #[test]
    fn key_row_roundtrip() {
        let table = block_table();
        let row = Row::new()
            .with("id", "b1")
            .with("blockerId", "A")
            .with("blockedId", "B");
        let key = table.row_key(&row).unwrap();
        assert_eq!(table.key_row(&key), Row::new().with("id", "b1"));
    }
}
