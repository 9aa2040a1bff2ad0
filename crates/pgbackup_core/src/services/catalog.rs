//! Catalog introspection.
//!
//! Queries the PostgreSQL system catalogs inside a snapshot and maps the rows into the
//! typed entities of [`crate::models::catalog`]. One bulk query per object kind keeps the
//! round trips constant regardless of how many tables a database has.

use std::collections::HashMap;

use crate::error::{BackupError, Result};
use crate::models::{
    Column, Constraint, ConstraintKind, DatabaseCatalog, ExclusionPolicy, GeneratedKind,
    IdentityKind, Index, PartitionBound, QualifiedName, Schema, Sequence, Table, View,
};

use tokio_postgres::types::FromSql;
use tokio_postgres::{Client, Row};

/// Catalog reader.
pub struct CatalogReader;

impl CatalogReader {
    /// Load the complete object graph for the connected database.
    pub async fn load(
        client: &Client,
        database: &str,
        policy: &ExclusionPolicy,
    ) -> Result<DatabaseCatalog> {
        let (server_version, current_user) = Self::load_server_info(client).await?;
        let schema_names = Self::load_schema_names(client, policy).await?;

        let mut schemas: Vec<Schema> = schema_names.iter().map(Schema::new).collect();
        let mut tables = Self::load_tables(client, &schema_names).await?;

        for (key, column) in Self::load_columns(client, &schema_names).await? {
            if let Some(table) = tables.get_mut(&key) {
                table.columns.push(column);
            }
        }
        for (key, index) in Self::load_indexes(client, &schema_names).await? {
            if let Some(table) = tables.get_mut(&key) {
                table.indexes.push(index);
            }
        }
        for (key, constraint) in Self::load_constraints(client, &schema_names).await? {
            if let Some(table) = tables.get_mut(&key) {
                table.constraints.push(constraint);
            }
        }

        let views = Self::load_views(client, &schema_names).await?;
        let sequences = Self::load_sequences(client, &schema_names).await?;

        let position: HashMap<String, usize> =
            schema_names.iter().enumerate().map(|(i, n)| (n.clone(), i)).collect();

        // Tables within a schema are alphabetical.
        let mut ordered: Vec<(QualifiedName, Table)> = tables.into_iter().collect();
        ordered.sort_by(|a, b| a.0.cmp(&b.0));
        for (key, table) in ordered {
            if let Some(&i) = position.get(&key.schema) {
                schemas[i].tables.push(table);
            }
        }
        for view in views {
            if let Some(&i) = position.get(&view.schema) {
                schemas[i].views.push(view);
            }
        }
        for sequence in sequences {
            if let Some(&i) = position.get(&sequence.schema) {
                schemas[i].sequences.push(sequence);
            }
        }

        let catalog = DatabaseCatalog {
            database: database.to_string(),
            server_version,
            current_user,
            schemas,
        };

        tracing::debug!(
            database,
            schemas = catalog.schemas.len(),
            tables = catalog.table_count(),
            "Catalog loaded"
        );
        Ok(catalog)
    }

    async fn load_server_info(client: &Client) -> Result<(String, String)> {
        let row = client
            .query_one(
                "SELECT pg_catalog.version() AS version, current_user::text AS role_name",
                &[],
            )
            .await
            .map_err(|e| BackupError::catalog_query("Failed to read server version", e))?;
        Ok((get(&row, "version")?, get(&row, "role_name")?))
    }

    /// Schema names the policy keeps, alphabetically.
    pub async fn load_schema_names(
        client: &Client,
        policy: &ExclusionPolicy,
    ) -> Result<Vec<String>> {
        let rows = client
            .query(
                "SELECT n.nspname AS name FROM pg_catalog.pg_namespace n ORDER BY n.nspname",
                &[],
            )
            .await
            .map_err(|e| BackupError::catalog_query("Failed to load schemas", e))?;

        let mut names = Vec::with_capacity(rows.len());
        for row in &rows {
            let name: String = get(row, "name")?;
            if !policy.excludes_schema(&name) {
                names.push(name);
            }
        }
        Ok(names)
    }

    /// Ordinary and partitioned tables, with partition keys and bounds.
    async fn load_tables(
        client: &Client,
        schemas: &[String],
    ) -> Result<HashMap<QualifiedName, Table>> {
        let rows = client
            .query(
                r#"
                SELECT
                    n.nspname AS schema,
                    c.relname AS name,
                    CASE WHEN c.relkind = 'p'
                         THEN pg_catalog.pg_get_partkeydef(c.oid) END AS partition_key,
                    pn.nspname AS parent_schema,
                    pc.relname AS parent_name,
                    CASE WHEN c.relispartition
                         THEN pg_catalog.pg_get_expr(c.relpartbound, c.oid) END AS partition_bound
                FROM pg_catalog.pg_class c
                JOIN pg_catalog.pg_namespace n ON n.oid = c.relnamespace
                LEFT JOIN pg_catalog.pg_inherits i ON c.relispartition AND i.inhrelid = c.oid
                LEFT JOIN pg_catalog.pg_class pc ON pc.oid = i.inhparent
                LEFT JOIN pg_catalog.pg_namespace pn ON pn.oid = pc.relnamespace
                WHERE c.relkind IN ('r', 'p')
                  AND n.nspname = ANY($1)
                ORDER BY n.nspname, c.relname
                "#,
                &[&schemas],
            )
            .await
            .map_err(|e| BackupError::catalog_query("Failed to load tables", e))?;

        let mut tables = HashMap::with_capacity(rows.len());
        for row in &rows {
            let mut table = Table::new(get::<String>(row, "schema")?, get::<String>(row, "name")?);
            table.partition_key = get(row, "partition_key")?;

            let parent_schema: Option<String> = get(row, "parent_schema")?;
            let parent_name: Option<String> = get(row, "parent_name")?;
            let bound: Option<String> = get(row, "partition_bound")?;
            if let (Some(schema), Some(name), Some(bound)) = (parent_schema, parent_name, bound) {
                table.partition_of =
                    Some(PartitionBound { parent: QualifiedName::new(schema, name), bound });
            }
            tables.insert(table.qualified_name(), table);
        }

        // A partition whose parent is excluded is restored as a plain table.
        let keys: Vec<QualifiedName> = tables
            .values()
            .filter(|t| t.partition_of.as_ref().is_some_and(|p| !tables.contains_key(&p.parent)))
            .map(|t| t.qualified_name())
            .collect();
        for key in keys {
            if let Some(table) = tables.get_mut(&key) {
                table.partition_of = None;
            }
        }
        Ok(tables)
    }

    async fn load_columns(
        client: &Client,
        schemas: &[String],
    ) -> Result<Vec<(QualifiedName, Column)>> {
        let rows = client
            .query(
                r#"
                SELECT
                    n.nspname AS schema,
                    c.relname AS table_name,
                    a.attname AS name,
                    pg_catalog.format_type(a.atttypid, a.atttypmod) AS data_type,
                    a.attnotnull AS not_null,
                    pg_catalog.pg_get_expr(d.adbin, d.adrelid) AS default_value,
                    a.attidentity::text AS identity,
                    a.attgenerated::text AS generated,
                    a.attnum::int4 AS position,
                    (
                        SELECT s.last_value
                        FROM pg_catalog.pg_depend dep
                        JOIN pg_catalog.pg_class sc ON sc.oid = dep.objid AND sc.relkind = 'S'
                        JOIN pg_catalog.pg_namespace sn ON sn.oid = sc.relnamespace
                        JOIN pg_catalog.pg_sequences s
                          ON s.schemaname = sn.nspname AND s.sequencename = sc.relname
                        WHERE a.attidentity <> ''
                          AND dep.classid = 'pg_catalog.pg_class'::pg_catalog.regclass
                          AND dep.refclassid = 'pg_catalog.pg_class'::pg_catalog.regclass
                          AND dep.refobjid = a.attrelid
                          AND dep.refobjsubid = a.attnum
                          AND dep.deptype = 'i'
                        LIMIT 1
                    ) AS identity_last_value
                FROM pg_catalog.pg_attribute a
                JOIN pg_catalog.pg_class c ON c.oid = a.attrelid
                JOIN pg_catalog.pg_namespace n ON n.oid = c.relnamespace
                LEFT JOIN pg_catalog.pg_attrdef d ON d.adrelid = a.attrelid AND d.adnum = a.attnum
                WHERE c.relkind IN ('r', 'p')
                  AND a.attnum > 0
                  AND NOT a.attisdropped
                  AND n.nspname = ANY($1)
                ORDER BY n.nspname, c.relname, a.attnum
                "#,
                &[&schemas],
            )
            .await
            .map_err(|e| BackupError::catalog_query("Failed to load columns", e))?;

        let mut columns = Vec::with_capacity(rows.len());
        for row in &rows {
            let identity: String = get(row, "identity")?;
            let generated: String = get(row, "generated")?;
            let column = Column {
                name: get(row, "name")?,
                data_type: get(row, "data_type")?,
                is_nullable: !get::<bool>(row, "not_null")?,
                default_value: get(row, "default_value")?,
                identity: IdentityKind::from_catalog(&identity),
                identity_last_value: get(row, "identity_last_value")?,
                generated: GeneratedKind::from_catalog(&generated),
                ordinal_position: get(row, "position")?,
            };
            columns.push((table_key(row)?, column));
        }
        Ok(columns)
    }

    /// Indexes that do not back a primary key or unique constraint.
    ///
    /// Partitions of a partitioned index are left out; attaching the partition recreates them.
    async fn load_indexes(
        client: &Client,
        schemas: &[String],
    ) -> Result<Vec<(QualifiedName, Index)>> {
        let rows = client
            .query(
                r#"
                SELECT
                    n.nspname AS schema,
                    t.relname AS table_name,
                    i.relname AS name,
                    pg_catalog.pg_get_indexdef(i.oid) AS definition
                FROM pg_catalog.pg_index x
                JOIN pg_catalog.pg_class i ON i.oid = x.indexrelid
                JOIN pg_catalog.pg_class t ON t.oid = x.indrelid
                JOIN pg_catalog.pg_namespace n ON n.oid = t.relnamespace
                WHERE t.relkind IN ('r', 'p')
                  AND n.nspname = ANY($1)
                  AND NOT EXISTS (
                      SELECT 1 FROM pg_catalog.pg_inherits ih WHERE ih.inhrelid = x.indexrelid
                  )
                  AND NOT EXISTS (
                      SELECT 1 FROM pg_catalog.pg_constraint con
                      WHERE con.conindid = x.indexrelid
                        AND con.conrelid = x.indrelid
                        AND con.contype IN ('p', 'u')
                  )
                ORDER BY n.nspname, t.relname, i.relname
                "#,
                &[&schemas],
            )
            .await
            .map_err(|e| BackupError::catalog_query("Failed to load indexes", e))?;

        let mut indexes = Vec::with_capacity(rows.len());
        for row in &rows {
            let index = Index { name: get(row, "name")?, definition: get(row, "definition")? };
            indexes.push((table_key(row)?, index));
        }
        Ok(indexes)
    }

    /// Constraints defined on the table itself. Key and foreign key constraints cloned
    /// from a partitioned parent are recreated when the partition is attached.
    async fn load_constraints(
        client: &Client,
        schemas: &[String],
    ) -> Result<Vec<(QualifiedName, Constraint)>> {
        let rows = client
            .query(
                r#"
                SELECT
                    n.nspname AS schema,
                    c.relname AS table_name,
                    con.conname AS name,
                    con.contype::text AS kind,
                    pg_catalog.pg_get_constraintdef(con.oid) AS definition,
                    ARRAY(
                        SELECT a.attname::text
                        FROM unnest(con.conkey) WITH ORDINALITY AS k(attnum, ord)
                        JOIN pg_catalog.pg_attribute a
                          ON a.attrelid = con.conrelid AND a.attnum = k.attnum
                        ORDER BY k.ord
                    ) AS columns,
                    rn.nspname AS ref_schema,
                    rc.relname AS ref_table
                FROM pg_catalog.pg_constraint con
                JOIN pg_catalog.pg_class c ON c.oid = con.conrelid
                JOIN pg_catalog.pg_namespace n ON n.oid = c.relnamespace
                LEFT JOIN pg_catalog.pg_class rc ON rc.oid = con.confrelid
                LEFT JOIN pg_catalog.pg_namespace rn ON rn.oid = rc.relnamespace
                WHERE c.relkind IN ('r', 'p')
                  AND con.contype IN ('p', 'u', 'c', 'f')
                  AND con.conparentid = 0
                  AND n.nspname = ANY($1)
                ORDER BY n.nspname, c.relname, con.conname
                "#,
                &[&schemas],
            )
            .await
            .map_err(|e| BackupError::catalog_query("Failed to load constraints", e))?;

        let mut constraints = Vec::with_capacity(rows.len());
        for row in &rows {
            let code: String = get(row, "kind")?;
            let Some(kind) = ConstraintKind::from_catalog(&code) else {
                continue;
            };
            let ref_schema: Option<String> = get(row, "ref_schema")?;
            let ref_table: Option<String> = get(row, "ref_table")?;
            let constraint = Constraint {
                name: get(row, "name")?,
                kind,
                definition: get(row, "definition")?,
                columns: get(row, "columns")?,
                references: ref_schema.zip(ref_table).map(|(s, t)| QualifiedName::new(s, t)),
            };
            constraints.push((table_key(row)?, constraint));
        }
        Ok(constraints)
    }

    /// Views and materialized views in creation order.
    async fn load_views(client: &Client, schemas: &[String]) -> Result<Vec<View>> {
        let rows = client
            .query(
                r#"
                SELECT
                    c.oid AS oid,
                    n.nspname AS schema,
                    c.relname AS name,
                    pg_catalog.pg_get_viewdef(c.oid) AS definition,
                    c.relkind = 'm' AS is_materialized
                FROM pg_catalog.pg_class c
                JOIN pg_catalog.pg_namespace n ON n.oid = c.relnamespace
                WHERE c.relkind IN ('v', 'm')
                  AND n.nspname = ANY($1)
                ORDER BY c.oid
                "#,
                &[&schemas],
            )
            .await
            .map_err(|e| BackupError::catalog_query("Failed to load views", e))?;

        rows.iter()
            .map(|row| -> Result<View> {
                Ok(View {
                    oid: get(row, "oid")?,
                    schema: get(row, "schema")?,
                    name: get(row, "name")?,
                    definition: get(row, "definition")?,
                    is_materialized: get(row, "is_materialized")?,
                })
            })
            .collect()
    }

    /// Standalone sequences; those backing identity columns are recreated by the column.
    async fn load_sequences(client: &Client, schemas: &[String]) -> Result<Vec<Sequence>> {
        let rows = client
            .query(
                r#"
                SELECT
                    s.schemaname AS schema,
                    s.sequencename AS name,
                    s.data_type::text AS data_type,
                    s.start_value,
                    s.min_value,
                    s.max_value,
                    s.increment_by,
                    s.cycle,
                    s.last_value
                FROM pg_catalog.pg_sequences s
                JOIN pg_catalog.pg_namespace n ON n.nspname = s.schemaname
                JOIN pg_catalog.pg_class c ON c.relnamespace = n.oid AND c.relname = s.sequencename
                WHERE s.schemaname = ANY($1)
                  AND NOT EXISTS (
                      SELECT 1 FROM pg_catalog.pg_depend d
                      WHERE d.classid = 'pg_catalog.pg_class'::pg_catalog.regclass
                        AND d.objid = c.oid
                        AND d.deptype = 'i'
                  )
                ORDER BY s.schemaname, s.sequencename
                "#,
                &[&schemas],
            )
            .await
            .map_err(|e| BackupError::catalog_query("Failed to load sequences", e))?;

        rows.iter()
            .map(|row| -> Result<Sequence> {
                Ok(Sequence {
                    schema: get(row, "schema")?,
                    name: get(row, "name")?,
                    data_type: get(row, "data_type")?,
                    start_value: get(row, "start_value")?,
                    min_value: get(row, "min_value")?,
                    max_value: get(row, "max_value")?,
                    increment_by: get(row, "increment_by")?,
                    cycle: get(row, "cycle")?,
                    last_value: get(row, "last_value")?,
                })
            })
            .collect()
    }
}

/// Typed column access; a type mismatch is a catalog error rather than a panic.
fn get<'a, T: FromSql<'a>>(row: &'a Row, column: &str) -> Result<T> {
    row.try_get(column)
        .map_err(|e| BackupError::catalog_query(&format!("Unexpected catalog column {column}"), e))
}

fn table_key(row: &Row) -> Result<QualifiedName> {
    Ok(QualifiedName::new(get::<String>(row, "schema")?, get::<String>(row, "table_name")?))
}
