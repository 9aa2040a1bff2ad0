//! Definition statement rendering.
//!
//! Pure functions from catalog entities to SQL text. [`plan_artifact`] lays out the
//! whole artifact as an ordered list of [`Block`]s so ordering rules live in one place:
//!
//! 1. header and session settings
//! 2. per schema: schema, sequences, tables (with unique/check constraints and indexes),
//!    data blocks, sequence positions, partitions whose parent is now defined, and foreign
//!    keys whose target is already fully loaded
//! 3. foreign keys pointing at tables completed later (or not emitted at all)
//! 4. views and materialized views of every schema, in creation order
//! 5. footer

use crate::models::catalog::quote_literal;
use crate::models::{
    quote_ident, Column, Constraint, ConstraintKind, DatabaseCatalog, GeneratedKind, IdentityKind,
    QualifiedName, Schema, Sequence, Table, View,
};

use chrono::{DateTime, Utc};
use std::fmt::Write;

/// Context for the artifact header.
#[derive(Debug, Clone)]
pub struct ArtifactMeta {
    /// Server host the backup was taken from.
    pub host: String,
    /// Capture timestamp.
    pub captured_at: DateTime<Utc>,
}

/// One step of an artifact.
#[derive(Debug, Clone, PartialEq)]
pub enum Block<'a> {
    /// Literal SQL text, written as-is.
    Ddl(String),
    /// A COPY data block for a table, streamed under the snapshot.
    Data(&'a Table),
}

/// Lay out the full artifact for a database.
pub fn plan_artifact<'a>(catalog: &'a DatabaseCatalog, meta: &ArtifactMeta) -> Vec<Block<'a>> {
    let mut blocks = vec![Block::Ddl(render_header(catalog, meta))];
    let mut deferred: Vec<(&Table, &Constraint)> = Vec::new();

    for (position, schema) in catalog.schemas.iter().enumerate() {
        blocks.push(Block::Ddl(render_schema_preamble(schema)));

        for table in &schema.tables {
            blocks.push(Block::Ddl(render_table(table)));
        }

        for table in &schema.tables {
            // Partitioned tables hold no rows of their own.
            if !table.is_partitioned() {
                blocks.push(Block::Data(table));
            }
            if let Some(sql) = render_identity_positions(table) {
                blocks.push(Block::Ddl(sql));
            }
        }

        if let Some(sql) = render_sequence_positions(&schema.sequences) {
            blocks.push(Block::Ddl(sql));
        }

        let attachments: Vec<&Table> = catalog
            .tables()
            .filter(|t| attach_position(catalog, t) == Some(position))
            .collect();
        if !attachments.is_empty() {
            blocks.push(Block::Ddl(render_attachments(&attachments)));
        }

        let mut local = Vec::new();
        for table in &schema.tables {
            for fk in table.foreign_keys() {
                let target = fk.references.as_ref().and_then(|r| match catalog.table(r) {
                    Some(target) => ready_position(catalog, target),
                    None => catalog.schema_position(&r.schema),
                });
                match target {
                    Some(target) if target <= position => local.push((table, fk)),
                    _ => deferred.push((table, fk)),
                }
            }
        }
        if !local.is_empty() {
            blocks.push(Block::Ddl(render_foreign_keys(
                &format!("Foreign keys for schema {}", schema.name),
                &local,
            )));
        }
    }

    if !deferred.is_empty() {
        blocks.push(Block::Ddl(render_foreign_keys("Deferred foreign keys", &deferred)));
    }

    // Views may read any schema, so they wait for every table and its data.
    let mut views: Vec<&View> = catalog.schemas.iter().flat_map(|s| s.views.iter()).collect();
    if !views.is_empty() {
        views.sort_by_key(|v| v.oid);
        blocks.push(Block::Ddl(render_views(&views)));
    }

    blocks.push(Block::Ddl(render_footer(catalog)));
    blocks
}

/// Schema position at which a partition can be attached: once both it and its parent exist.
fn attach_position(catalog: &DatabaseCatalog, table: &Table) -> Option<usize> {
    let parent = catalog.table(&table.partition_of.as_ref()?.parent)?;
    let own = catalog.schema_position(&table.schema)?;
    Some(own.max(catalog.schema_position(&parent.schema)?))
}

/// Schema position after which a table holds all of its rows, partitions included.
fn ready_position(catalog: &DatabaseCatalog, table: &Table) -> Option<usize> {
    let own = catalog.schema_position(&table.schema)?;
    let key = table.qualified_name();
    let ready = catalog
        .partitions_of(&key)
        .try_fold(own, |ready, partition| Some(ready.max(ready_position(catalog, partition)?)));
    ready
}

/// `ALTER TABLE` target; constraints on a partitioned table must reach its partitions.
fn alter_table(table: &Table) -> String {
    if table.is_partitioned() {
        format!("ALTER TABLE {}", table.qualified_name())
    } else {
        format!("ALTER TABLE ONLY {}", table.qualified_name())
    }
}

/// Header comment block and session settings.
pub fn render_header(catalog: &DatabaseCatalog, meta: &ArtifactMeta) -> String {
    let mut out = String::new();
    out.push_str("--\n-- pgbackup logical backup\n--\n");
    let _ = writeln!(out, "-- Database: {}", catalog.database);
    let _ = writeln!(out, "-- Captured at: {}", meta.captured_at.format("%Y-%m-%d %H:%M:%S UTC"));
    let _ = writeln!(out, "-- Host: {}", meta.host);
    let _ = writeln!(out, "-- User: {}", catalog.current_user);
    let _ = writeln!(out, "-- Server version: {}", catalog.server_version);
    out.push_str("--\n\n");

    out.push_str("SET statement_timeout = 0;\n");
    out.push_str("SET lock_timeout = 0;\n");
    out.push_str("SET idle_in_transaction_session_timeout = 0;\n");
    out.push_str("SET client_encoding = 'UTF8';\n");
    out.push_str("SET standard_conforming_strings = on;\n");
    out.push_str("SET datestyle = 'ISO';\n");
    out.push_str("SET intervalstyle = 'postgres';\n");
    out.push_str("SET extra_float_digits = 3;\n");
    out.push_str("SELECT pg_catalog.set_config('search_path', '', false);\n");
    out.push_str("SET check_function_bodies = false;\n");
    out.push_str("SET client_min_messages = warning;\n");
    out.push_str("SET row_security = off;\n");
    out
}

/// Schema banner, `CREATE SCHEMA` and standalone sequences.
pub fn render_schema_preamble(schema: &Schema) -> String {
    let mut out = section_banner(&format!("Schema: {}", schema.name));
    if schema.name != "public" {
        let _ = writeln!(out, "CREATE SCHEMA IF NOT EXISTS {};", quote_ident(&schema.name));
    }
    let _ = writeln!(out, "SET search_path = {}, pg_catalog;", quote_ident(&schema.name));
    if schema.tables.is_empty() && schema.views.is_empty() && schema.sequences.is_empty() {
        let _ = writeln!(out, "-- No tables found in schema {}", schema.name);
    }
    for sequence in &schema.sequences {
        out.push('\n');
        out.push_str(&render_sequence(sequence));
    }
    out
}

/// Table banner, `CREATE TABLE`, unique/check constraints and indexes.
pub fn render_table(table: &Table) -> String {
    let mut out = section_banner(&format!("Table: {}", table.label()));
    out.push_str(&render_create_table(table));

    let alter = alter_table(table);
    for constraint in table
        .constraints
        .iter()
        .filter(|c| matches!(c.kind, ConstraintKind::Unique | ConstraintKind::Check))
    {
        let _ = writeln!(
            out,
            "{} ADD CONSTRAINT {} {};",
            alter,
            quote_ident(&constraint.name),
            constraint.definition
        );
    }

    for index in &table.indexes {
        let _ = writeln!(out, "{};", index.definition.trim_end_matches(';'));
    }
    out
}

/// `CREATE TABLE` with columns, the inline primary key and any partition key.
///
/// Partitions are created as plain tables and attached once their parent exists.
pub fn render_create_table(table: &Table) -> String {
    let mut lines: Vec<String> = table.columns.iter().map(render_column).collect();

    if let Some(pk) = table.primary_key() {
        lines.push(format!("    CONSTRAINT {} {}", quote_ident(&pk.name), pk.definition));
    }

    let mut out = if lines.is_empty() {
        format!("CREATE TABLE {} (\n)", table.qualified_name())
    } else {
        format!("CREATE TABLE {} (\n{}\n)", table.qualified_name(), lines.join(",\n"))
    };
    if let Some(key) = &table.partition_key {
        let _ = write!(out, "\nPARTITION BY {key}");
    }
    out.push_str(";\n");
    out
}

fn render_column(column: &Column) -> String {
    let mut def = format!("    {} {}", quote_ident(&column.name), column.data_type);

    if !column.is_nullable {
        def.push_str(" NOT NULL");
    }

    match (&column.default_value, column.identity, column.generated) {
        (Some(expr), _, Some(GeneratedKind::Stored)) => {
            let _ = write!(def, " GENERATED ALWAYS AS ({expr}) STORED");
        }
        (Some(expr), _, Some(GeneratedKind::Virtual)) => {
            let _ = write!(def, " GENERATED ALWAYS AS ({expr}) VIRTUAL");
        }
        (_, Some(IdentityKind::Always), _) => def.push_str(" GENERATED ALWAYS AS IDENTITY"),
        (_, Some(IdentityKind::ByDefault), _) => {
            def.push_str(" GENERATED BY DEFAULT AS IDENTITY")
        }
        (Some(expr), None, None) => {
            let _ = write!(def, " DEFAULT {expr}");
        }
        (None, None, _) => {}
    }
    def
}

/// `CREATE SEQUENCE IF NOT EXISTS` with its parameters.
pub fn render_sequence(sequence: &Sequence) -> String {
    let mut out = format!(
        "CREATE SEQUENCE IF NOT EXISTS {}\n",
        QualifiedName::new(&sequence.schema, &sequence.name)
    );
    let _ = writeln!(out, "    AS {}", sequence.data_type);
    let _ = writeln!(out, "    START WITH {}", sequence.start_value);
    let _ = writeln!(out, "    INCREMENT BY {}", sequence.increment_by);
    let _ = writeln!(out, "    MINVALUE {}", sequence.min_value);
    let _ = write!(out, "    MAXVALUE {}", sequence.max_value);
    if sequence.cycle {
        out.push_str("\n    CYCLE");
    }
    out.push_str(";\n");
    out
}

/// `setval` calls restoring each sequence's position in the snapshot.
pub fn render_sequence_positions(sequences: &[Sequence]) -> Option<String> {
    if sequences.is_empty() {
        return None;
    }
    let mut out = String::from("\n");
    for sequence in sequences {
        let name = QualifiedName::new(&sequence.schema, &sequence.name).to_string();
        let (value, is_called) = match sequence.last_value {
            Some(value) => (value, true),
            None => (sequence.start_value, false),
        };
        let _ = writeln!(
            out,
            "SELECT pg_catalog.setval({}, {value}, {is_called});",
            quote_literal(&name)
        );
    }
    Some(out)
}

/// Restore identity sequences to the position they had in the snapshot.
///
/// Sequences that were never called are left at their start value.
pub fn render_identity_positions(table: &Table) -> Option<String> {
    let qualified = table.qualified_name().to_string();
    let mut out = String::new();
    for column in table.columns.iter().filter(|c| c.identity.is_some()) {
        let Some(value) = column.identity_last_value else {
            continue;
        };
        let _ = writeln!(
            out,
            "SELECT pg_catalog.setval(pg_catalog.pg_get_serial_sequence({}, {}), {value}, true);",
            quote_literal(&qualified),
            quote_literal(&column.name),
        );
    }
    (!out.is_empty()).then_some(out)
}

/// `ATTACH PARTITION` for partitions created as plain tables.
pub fn render_attachments(partitions: &[&Table]) -> String {
    let mut out = section_banner("Partitions");
    for table in partitions {
        if let Some(partition) = &table.partition_of {
            let _ = writeln!(
                out,
                "ALTER TABLE {} ATTACH PARTITION {} {};",
                partition.parent,
                table.qualified_name(),
                partition.bound
            );
        }
    }
    out
}

/// Views in the given order; materialized views are refreshed after creation.
pub fn render_views(views: &[&View]) -> String {
    let mut out = section_banner("Views");
    for view in views {
        let name = QualifiedName::new(&view.schema, &view.name);
        let query = view.definition.trim().trim_end_matches(';');
        if view.is_materialized {
            let _ = writeln!(out, "CREATE MATERIALIZED VIEW {name} AS\n{query}\n  WITH NO DATA;");
            let _ = writeln!(out, "REFRESH MATERIALIZED VIEW {name};");
        } else {
            let _ = writeln!(out, "CREATE VIEW {name} AS\n{query};");
        }
        out.push('\n');
    }
    out
}

/// `ALTER TABLE ... ADD CONSTRAINT` for foreign keys.
pub fn render_foreign_keys(title: &str, fks: &[(&Table, &Constraint)]) -> String {
    let mut out = section_banner(title);
    for (table, fk) in fks {
        let _ = writeln!(
            out,
            "{} ADD CONSTRAINT {} {};",
            alter_table(table),
            quote_ident(&fk.name),
            fk.definition
        );
    }
    out
}

/// Closing statements.
pub fn render_footer(catalog: &DatabaseCatalog) -> String {
    format!(
        "\nSET search_path TO public;\n\n-- Backup of {} complete: {} tables\n",
        catalog.database,
        catalog.table_count()
    )
}

fn section_banner(title: &str) -> String {
    format!("\n\n--\n-- {title}\n--\n\n")
}
