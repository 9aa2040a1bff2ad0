//! Catalog models.
//!
//! Strongly-typed projections of the PostgreSQL system catalogs for one database.
//! They are built by the catalog reader inside a snapshot and discarded once the
//! artifact has been rendered.

use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::fmt;

/// Keywords that must be quoted when used as identifiers.
const RESERVED_KEYWORDS: &[&str] = &[
    "all", "analyse", "analyze", "and", "any", "array", "as", "asc", "asymmetric",
    "authorization", "binary", "both", "case", "cast", "check", "collate", "collation",
    "column", "concurrently", "constraint", "create", "cross", "current_catalog",
    "current_date", "current_role", "current_schema", "current_time", "current_timestamp",
    "current_user", "default", "deferrable", "desc", "distinct", "do", "else", "end",
    "except", "false", "fetch", "for", "foreign", "freeze", "from", "full", "grant", "group",
    "having", "ilike", "in", "initially", "inner", "intersect", "into", "is", "isnull", "join",
    "lateral", "leading", "left", "like", "limit", "localtime", "localtimestamp", "natural",
    "not", "notnull", "null", "offset", "on", "only", "or", "order", "outer", "overlaps",
    "placing", "primary", "references", "returning", "right", "select", "session_user",
    "similar", "some", "symmetric", "system_user", "table", "tablesample", "then", "to",
    "trailing", "true", "union", "unique", "user", "using", "variadic", "verbose", "when",
    "where", "window", "with",
];

/// Quote an identifier only when PostgreSQL would not read it back unchanged.
pub fn quote_ident(name: &str) -> Cow<'_, str> {
    let mut chars = name.chars();
    let simple = match chars.next() {
        Some(c) if c.is_ascii_lowercase() || c == '_' => {
            chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '$')
        }
        _ => false,
    };

    if simple && !RESERVED_KEYWORDS.contains(&name) {
        Cow::Borrowed(name)
    } else {
        Cow::Owned(format!("\"{}\"", name.replace('"', "\"\"")))
    }
}

/// Quote a string literal.
pub fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

/// A schema-qualified relation name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct QualifiedName {
    /// Schema name.
    pub schema: String,
    /// Relation name.
    pub name: String,
}

impl QualifiedName {
    /// Create a qualified name.
    pub fn new(schema: impl Into<String>, name: impl Into<String>) -> Self {
        Self { schema: schema.into(), name: name.into() }
    }
}

impl fmt::Display for QualifiedName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", quote_ident(&self.schema), quote_ident(&self.name))
    }
}

/// Identity column flavor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IdentityKind {
    /// GENERATED ALWAYS AS IDENTITY
    Always,
    /// GENERATED BY DEFAULT AS IDENTITY
    ByDefault,
}

impl IdentityKind {
    /// Parse `pg_attribute.attidentity`.
    pub fn from_catalog(code: &str) -> Option<Self> {
        match code {
            "a" => Some(Self::Always),
            "d" => Some(Self::ByDefault),
            _ => None,
        }
    }
}

/// Generated column flavor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GeneratedKind {
    /// GENERATED ALWAYS AS (...) STORED
    Stored,
    /// GENERATED ALWAYS AS (...), computed on read
    Virtual,
}

impl GeneratedKind {
    /// Parse `pg_attribute.attgenerated`.
    pub fn from_catalog(code: &str) -> Option<Self> {
        match code {
            "s" => Some(Self::Stored),
            "v" => Some(Self::Virtual),
            _ => None,
        }
    }
}

/// A table column.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Column {
    /// Column name.
    pub name: String,
    /// Declared type exactly as `format_type` reports it.
    pub data_type: String,
    /// Whether the column allows NULL values.
    pub is_nullable: bool,
    /// Default (or generation) expression, if any.
    pub default_value: Option<String>,
    /// Identity flavor for identity columns.
    pub identity: Option<IdentityKind>,
    /// Last value handed out by the identity sequence, None if never called.
    pub identity_last_value: Option<i64>,
    /// Generation flavor for generated columns.
    pub generated: Option<GeneratedKind>,
    /// Column position (1-based `attnum`).
    pub ordinal_position: i32,
}

impl Column {
    /// Create a plain nullable column.
    pub fn new(name: impl Into<String>, data_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            data_type: data_type.into(),
            is_nullable: true,
            default_value: None,
            identity: None,
            identity_last_value: None,
            generated: None,
            ordinal_position: 0,
        }
    }

    /// Mark the column NOT NULL.
    pub fn not_null(mut self) -> Self {
        self.is_nullable = false;
        self
    }

    /// Set the default expression.
    pub fn with_default(mut self, expr: impl Into<String>) -> Self {
        self.default_value = Some(expr.into());
        self
    }

    /// Whether the value is computed by the server rather than stored from input.
    pub fn is_generated(&self) -> bool {
        self.generated.is_some()
    }

    /// Whether values are streamed as binary payloads.
    pub fn is_binary(&self) -> bool {
        self.data_type == "bytea"
    }
}

/// A non-constraint index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Index {
    /// Index name.
    pub name: String,
    /// Full `CREATE INDEX` statement from `pg_get_indexdef`, without trailing semicolon.
    pub definition: String,
}

/// Constraint flavor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConstraintKind {
    /// PRIMARY KEY
    PrimaryKey,
    /// UNIQUE
    Unique,
    /// CHECK
    Check,
    /// FOREIGN KEY
    ForeignKey,
}

impl ConstraintKind {
    /// Parse `pg_constraint.contype`.
    pub fn from_catalog(code: &str) -> Option<Self> {
        match code {
            "p" => Some(Self::PrimaryKey),
            "u" => Some(Self::Unique),
            "c" => Some(Self::Check),
            "f" => Some(Self::ForeignKey),
            _ => None,
        }
    }
}

/// A table constraint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Constraint {
    /// Constraint name.
    pub name: String,
    /// Constraint flavor.
    pub kind: ConstraintKind,
    /// Definition from `pg_get_constraintdef` (e.g. "PRIMARY KEY (id)").
    pub definition: String,
    /// Key columns on the owning table.
    pub columns: Vec<String>,
    /// Referenced table for foreign keys.
    pub references: Option<QualifiedName>,
}

/// Where a partition hangs in its parent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PartitionBound {
    /// Partitioned parent table.
    pub parent: QualifiedName,
    /// Bound from `pg_get_expr(relpartbound)`, e.g. "FOR VALUES FROM (1) TO (10)".
    pub bound: String,
}

/// A base or partitioned table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Table {
    /// Schema name containing this table.
    pub schema: String,
    /// Table name.
    pub name: String,
    /// Columns in physical order.
    pub columns: Vec<Column>,
    /// Indexes not backing a constraint, by name.
    pub indexes: Vec<Index>,
    /// Constraints, by name.
    pub constraints: Vec<Constraint>,
    /// Partition key from `pg_get_partkeydef` for partitioned tables, e.g. "RANGE (id)".
    pub partition_key: Option<String>,
    /// Parent and bound when this table is a partition.
    pub partition_of: Option<PartitionBound>,
}

impl Table {
    /// Create an empty table definition.
    pub fn new(schema: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            schema: schema.into(),
            name: name.into(),
            columns: Vec::new(),
            indexes: Vec::new(),
            constraints: Vec::new(),
            partition_key: None,
            partition_of: None,
        }
    }

    /// Schema-qualified name.
    pub fn qualified_name(&self) -> QualifiedName {
        QualifiedName::new(&self.schema, &self.name)
    }

    /// Unquoted `schema.table` label for logs and reports.
    pub fn label(&self) -> String {
        format!("{}.{}", self.schema, self.name)
    }

    /// The primary key constraint, if any.
    pub fn primary_key(&self) -> Option<&Constraint> {
        self.constraints.iter().find(|c| c.kind == ConstraintKind::PrimaryKey)
    }

    /// Foreign key constraints.
    pub fn foreign_keys(&self) -> impl Iterator<Item = &Constraint> {
        self.constraints.iter().filter(|c| c.kind == ConstraintKind::ForeignKey)
    }

    /// Columns carried in the data block (generated columns are recomputed on load).
    pub fn data_columns(&self) -> impl Iterator<Item = &Column> {
        self.columns.iter().filter(|c| !c.is_generated())
    }

    /// Whether rows live in partitions rather than in this table.
    pub fn is_partitioned(&self) -> bool {
        self.partition_key.is_some()
    }
}

/// A view or materialized view.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct View {
    /// Catalog OID; views are listed in OID (creation) order.
    pub oid: u32,
    /// Schema name containing this view.
    pub schema: String,
    /// View name.
    pub name: String,
    /// Query text from `pg_get_viewdef`.
    pub definition: String,
    /// Whether this is a materialized view.
    pub is_materialized: bool,
}

/// A standalone sequence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sequence {
    /// Schema name containing this sequence.
    pub schema: String,
    /// Sequence name.
    pub name: String,
    /// Value type (e.g. "bigint").
    pub data_type: String,
    /// START WITH value.
    pub start_value: i64,
    /// MINVALUE.
    pub min_value: i64,
    /// MAXVALUE.
    pub max_value: i64,
    /// INCREMENT BY value.
    pub increment_by: i64,
    /// Whether the sequence wraps around.
    pub cycle: bool,
    /// Last value handed out, None if never called.
    pub last_value: Option<i64>,
}

/// A schema (namespace) and the objects it owns.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Schema {
    /// Schema name.
    pub name: String,
    /// Tables, alphabetically.
    pub tables: Vec<Table>,
    /// Views, in creation order.
    pub views: Vec<View>,
    /// Standalone sequences, alphabetically.
    pub sequences: Vec<Sequence>,
}

impl Schema {
    /// Create an empty schema.
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into(), tables: Vec::new(), views: Vec::new(), sequences: Vec::new() }
    }
}

/// Complete object graph for one database, read inside its snapshot.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DatabaseCatalog {
    /// Database name.
    pub database: String,
    /// Result of `version()`.
    pub server_version: String,
    /// Role the backup runs as.
    pub current_user: String,
    /// Schemas, alphabetically.
    pub schemas: Vec<Schema>,
}

impl DatabaseCatalog {
    /// All tables across schemas, in artifact order.
    pub fn tables(&self) -> impl Iterator<Item = &Table> {
        self.schemas.iter().flat_map(|s| s.tables.iter())
    }

    /// Number of tables across schemas.
    pub fn table_count(&self) -> usize {
        self.schemas.iter().map(|s| s.tables.len()).sum()
    }

    /// Look up a table by schema and name.
    pub fn table(&self, name: &QualifiedName) -> Option<&Table> {
        self.schemas
            .iter()
            .find(|s| s.name == name.schema)
            .and_then(|s| s.tables.iter().find(|t| t.name == name.name))
    }

    /// Partitions attached directly to the given table.
    pub fn partitions_of<'a>(
        &'a self,
        parent: &'a QualifiedName,
    ) -> impl Iterator<Item = &'a Table> {
        self.tables()
            .filter(move |t| t.partition_of.as_ref().is_some_and(|p| &p.parent == parent))
    }

    /// Position of a schema in artifact order.
    pub fn schema_position(&self, name: &str) -> Option<usize> {
        self.schemas.iter().position(|s| s.name == name)
    }
}

// ========== Row data ==========

/// One field of a streamed row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Field {
    /// SQL NULL.
    Null,
    /// Canonical text output of the value.
    Text(String),
    /// Raw bytes of a binary column.
    Binary(Vec<u8>),
}

/// A row aligned to [`Table::data_columns`].
pub type Row = Vec<Field>;
