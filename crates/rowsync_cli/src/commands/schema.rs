//! Schema command implementation.

use crate::demo;
use rowsync_core::{Cardinality, Relationship, SchemaRegistry, TableSchema};
use serde::Serialize;

/// The schema as printed by `rowsync schema --format json`.
#[derive(Debug, Serialize)]
pub struct SchemaDump<'a> {
    /// Schema version hash, as exchanged in the handshake.
    pub version: &'a str,
    /// Tables in name order.
    pub tables: Vec<&'a TableSchema>,
    /// Relationships in (source table, name) order.
    pub relationships: Vec<&'a Relationship>,
}

impl<'a> SchemaDump<'a> {
    fn new(registry: &'a SchemaRegistry) -> Self {
        Self {
            version: registry.version(),
            tables: registry.tables().collect(),
            relationships: registry.relationships().collect(),
        }
    }
}

/// Runs the schema command.
pub fn run(format: &str) -> Result<(), Box<dyn std::error::Error>> {
    let registry = demo::registry()?;
    match format {
        "json" => println!("{}", serde_json::to_string_pretty(&SchemaDump::new(&registry))?),
        "text" => print!("{}", render_text(&registry)),
        other => return Err(format!("unknown format: {other}").into()),
    }
    Ok(())
}

fn render_text(registry: &SchemaRegistry) -> String {
    let mut out = format!("schema {}\n", registry.version());
    for table in registry.tables() {
        out.push_str(&format!(
            "\ntable {} (primary key: {})\n",
            table.name,
            table.primary_key.join(", ")
        ));
        for column in &table.columns {
            let column_type = serde_json::to_value(column.column_type)
                .ok()
                .and_then(|v| v.as_str().map(str::to_string))
                .unwrap_or_default();
            let suffix = if column.optional { "?" } else { "" };
            out.push_str(&format!("  {}: {column_type}{suffix}\n", column.name));
        }
        for rel in registry
            .relationships()
            .filter(|r| r.source_table == table.name)
        {
            let arrow = match rel.cardinality {
                Cardinality::One => "->",
                Cardinality::Many => "->>",
            };
            out.push_str(&format!(
                "  {} {arrow} {}({}) via ({})\n",
                rel.name,
                rel.dest_table,
                rel.dest_fields.join(", "),
                rel.source_fields.join(", ")
            ));
        }
    }
    out
}
