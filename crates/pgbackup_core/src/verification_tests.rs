//! End-to-end verification of the backup engine against the in-memory source.
//!
//! Covers:
//! - COPY escaping round-trips for text, NULL and binary values
//! - Statement ordering within a rendered artifact
//! - Failure isolation between databases
//! - Artifact atomicity on stream errors and cancellation
//! - The inventory and NULL scenarios
//! - Artifact naming for databases whose names differ only in punctuation
//! - Cross-schema views and partitioned tables
//! - Credential redaction

#[cfg(test)]
mod tests {
    use crate::error::{BackupError, ErrorKind};
    use crate::models::{
        BackupConfig, Column, Constraint, ConstraintKind, DatabaseCatalog, DatabaseOutcome,
        DatabasePhase, Field, Index, PartitionBound, QualifiedName, Schema, Table, View,
    };
    use crate::services::copy::{decode_hex, decode_row, encode_row, END_OF_DATA};
    use crate::services::ddl::{plan_artifact, ArtifactMeta, Block};
    use crate::services::Orchestrator;
    use crate::testing::{inventory_database, text, Failure, MemoryDatabase, MemorySource};

    use chrono::Utc;
    use std::path::{Path, PathBuf};
    use std::sync::Arc;
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio_util::sync::CancellationToken;

    fn config(dir: &Path) -> BackupConfig {
        BackupConfig::builder()
            .host("db.internal")
            .username("backup")
            .password("s3cret-pw")
            .output_dir(dir)
            .build()
            .unwrap()
    }

    fn files_in(dir: &Path) -> Vec<PathBuf> {
        let mut files: Vec<PathBuf> =
            std::fs::read_dir(dir).unwrap().map(|e| e.unwrap().path()).collect();
        files.sort();
        files
    }

    fn artifact_of(outcome: &DatabaseOutcome) -> String {
        match outcome {
            DatabaseOutcome::Succeeded { artifact, .. } => std::fs::read_to_string(artifact).unwrap(),
            other => panic!("expected success, got {other:?}"),
        }
    }

    // =========================================================================
    // Escaping
    // =========================================================================

    #[test]
    fn test_escaping_round_trip() {
        let values = [
            "plain",
            "",
            "tab\there",
            "line\nbreak",
            "carriage\rreturn",
            "back\\slash",
            "\\N",
            "mixed \t\n\r\\ all",
            "trailing\\",
            "unicode: café ✓",
        ];

        for value in values {
            let row = vec![Field::Text(value.to_string()), Field::Null];
            let mut line = String::new();
            encode_row(&row, &mut line);

            assert_eq!(line.matches('\n').count(), 1, "row must be one line: {line:?}");
            assert_eq!(line.matches('\t').count(), 1, "one delimiter expected: {line:?}");

            let decoded = decode_row(line.trim_end_matches('\n'));
            assert_eq!(decoded, vec![Some(value.to_string()), None], "value {value:?}");
        }
    }

    #[test]
    fn test_binary_round_trip() {
        let payloads: Vec<Vec<u8>> =
            vec![Vec::new(), vec![0], vec![0x5c, 0x09, 0x0a, 0x0d], (0..=255).collect()];

        for bytes in payloads {
            let mut line = String::new();
            encode_row(&[Field::Binary(bytes.clone())], &mut line);
            let decoded = decode_row(line.trim_end_matches('\n'));
            let text = decoded[0].as_deref().unwrap();
            assert_eq!(decode_hex(text).unwrap(), bytes);
        }
    }

    // =========================================================================
    // Ordering
    // =========================================================================

    fn ordering_catalog() -> DatabaseCatalog {
        let mut customers = Table::new("sales", "customers");
        customers.columns.push(Column::new("id", "integer").not_null());
        customers.constraints.push(Constraint {
            name: "customers_pkey".into(),
            kind: ConstraintKind::PrimaryKey,
            definition: "PRIMARY KEY (id)".into(),
            columns: vec!["id".into()],
            references: None,
        });

        let mut orders = Table::new("sales", "orders");
        orders.columns.push(Column::new("id", "integer").not_null());
        orders.columns.push(Column::new("customer_id", "integer"));
        orders.indexes.push(Index {
            name: "orders_customer_idx".into(),
            definition: "CREATE INDEX orders_customer_idx ON sales.orders USING btree (customer_id)"
                .into(),
        });
        orders.constraints.push(Constraint {
            name: "orders_customer_fk".into(),
            kind: ConstraintKind::ForeignKey,
            definition: "FOREIGN KEY (customer_id) REFERENCES sales.customers(id)".into(),
            columns: vec!["customer_id".into()],
            references: Some(QualifiedName::new("sales", "customers")),
        });

        // Alphabetically first, references a later table in the same schema.
        let mut audits = Table::new("sales", "audits");
        audits.columns.push(Column::new("order_id", "integer"));
        audits.constraints.push(Constraint {
            name: "audits_order_fk".into(),
            kind: ConstraintKind::ForeignKey,
            definition: "FOREIGN KEY (order_id) REFERENCES sales.orders(id)".into(),
            columns: vec!["order_id".into()],
            references: Some(QualifiedName::new("sales", "orders")),
        });

        let mut sales = Schema::new("sales");
        sales.tables = vec![audits, customers, orders];

        DatabaseCatalog {
            database: "shop".into(),
            server_version: "PostgreSQL 16.2".into(),
            current_user: "backup".into(),
            schemas: vec![sales],
        }
    }

    /// Flatten a block plan into text, writing data blocks as a marker line.
    fn render_plan(blocks: &[Block<'_>]) -> String {
        let mut out = String::new();
        for block in blocks {
            match block {
                Block::Ddl(sql) => out.push_str(sql),
                Block::Data(table) => out.push_str(&format!("<data {}>\n", table.label())),
            }
        }
        out
    }

    #[test]
    fn test_ordering_invariant() {
        let catalog = ordering_catalog();
        let meta = ArtifactMeta { host: "localhost".into(), captured_at: Utc::now() };
        let text = render_plan(&plan_artifact(&catalog, &meta));

        for table in catalog.tables() {
            let create = text
                .find(&format!("CREATE TABLE {} (", table.qualified_name()))
                .unwrap_or_else(|| panic!("missing CREATE for {}", table.label()));
            let data = text.find(&format!("<data {}>", table.label())).unwrap();
            assert!(create < data, "{} data before CREATE", table.label());
            for index in &table.indexes {
                assert!(create < text.find(&index.definition).unwrap());
            }
        }

        let last_create = text.rfind("CREATE TABLE").unwrap();
        let first_fk = text.find("FOREIGN KEY").unwrap();
        assert!(last_create < first_fk);
        assert!(text.find("<data sales.orders>").unwrap() < first_fk);
    }

    // =========================================================================
    // Scenarios
    // =========================================================================

    #[tokio::test]
    async fn test_inventory_scenario() {
        let dir = TempDir::new().unwrap();
        let source = MemorySource::new().with_database("inventory", inventory_database("inventory"));
        let orchestrator = Orchestrator::with_source(config(dir.path()), Arc::new(source)).unwrap();

        let summary = orchestrator.run(CancellationToken::new(), None).await.unwrap();
        assert!(summary.is_success());

        let outcome = &summary.databases[0];
        match outcome {
            DatabaseOutcome::Succeeded { artifact, tables, .. } => {
                let name = artifact.file_name().unwrap().to_string_lossy().into_owned();
                assert!(name.starts_with("inventory_backup_"));
                assert!(name.ends_with(".sql"));
                assert_eq!(tables.len(), 1);
                assert_eq!(tables[0].rows, 2);
            }
            other => panic!("expected success, got {other:?}"),
        }

        let sql = artifact_of(outcome);
        assert!(sql.starts_with("--\n-- pgbackup logical backup\n"));
        assert!(sql.contains("-- Database: inventory\n"));
        assert!(sql.contains("-- Host: db.internal\n"));
        assert!(sql.contains(
            "CREATE TABLE public.products (\n    \
             product_id integer NOT NULL DEFAULT nextval('public.products_product_id_seq'::regclass),\n    \
             name character varying(100),\n    \
             price numeric(10,2) DEFAULT 0.00,\n    \
             CONSTRAINT products_pkey PRIMARY KEY (product_id)\n);\n"
        ));
        assert!(sql.contains(
            "COPY public.products (product_id, name, price) FROM stdin;\n\
             1\tWidget A\t19.99\n\
             2\tGadget B\t29.50\n\
             \\.\n\
             -- 2 rows\n"
        ));
        assert!(sql.contains("SELECT pg_catalog.setval('public.products_product_id_seq', 2, true);"));

        let sequence = sql.find("CREATE SEQUENCE IF NOT EXISTS public.products_product_id_seq").unwrap();
        let create = sql.find("CREATE TABLE public.products").unwrap();
        assert!(sequence < create);
        assert!(sql.ends_with("SET search_path TO public;\n\n-- Backup of inventory complete: 1 tables\n"));

        assert_eq!(files_in(dir.path()).len(), 1);
    }

    #[tokio::test]
    async fn test_null_scenario() {
        let dir = TempDir::new().unwrap();

        let mut readings = Table::new("public", "readings");
        readings.columns.push(Column::new("label", "text"));
        readings.columns.push(Column::new("value", "integer"));
        let mut public = Schema::new("public");
        public.tables.push(readings);

        let mut db = MemoryDatabase::default();
        db.catalog = DatabaseCatalog {
            database: "metrics".into(),
            server_version: "PostgreSQL 16.2".into(),
            current_user: "backup".into(),
            schemas: vec![public],
        };
        db.rows.insert(
            "public.readings".into(),
            vec![vec![text(""), Field::Null], vec![Field::Null, text("7")]],
        );

        let source = MemorySource::new().with_database("metrics", db);
        let orchestrator = Orchestrator::with_source(config(dir.path()), Arc::new(source)).unwrap();
        let summary = orchestrator.run(CancellationToken::new(), None).await.unwrap();

        let sql = artifact_of(&summary.databases[0]);
        assert!(sql.contains("FROM stdin;\n\t\\N\n\\N\t7\n\\.\n"));
    }

    #[tokio::test]
    async fn test_similar_database_names_keep_separate_artifacts() {
        let dir = TempDir::new().unwrap();
        let source = MemorySource::new()
            .with_database("a b", inventory_database("a b"))
            .with_database("a_b", inventory_database("a_b"))
            .with_database("a/b", inventory_database("a/b"));
        let orchestrator = Orchestrator::with_source(config(dir.path()), Arc::new(source)).unwrap();

        let summary = orchestrator.run(CancellationToken::new(), None).await.unwrap();
        assert!(summary.is_success());
        assert_eq!(files_in(dir.path()).len(), 3);

        let mut paths = Vec::new();
        for (outcome, name) in summary.databases.iter().zip(["a b", "a_b", "a/b"]) {
            let sql = artifact_of(outcome);
            assert!(sql.contains(&format!("-- Database: {name}\n")), "artifact of {name}");
            if let DatabaseOutcome::Succeeded { artifact, .. } = outcome {
                paths.push(artifact.clone());
            }
        }
        paths.sort();
        paths.dedup();
        assert_eq!(paths.len(), 3);
    }

    fn orders_table() -> Table {
        let mut orders = Table::new("public", "orders");
        orders.columns.push(Column::new("id", "integer").not_null());
        orders.columns.push(Column::new("total", "numeric(10,2)"));
        orders
    }

    #[tokio::test]
    async fn test_view_over_later_schema_follows_its_data() {
        let dir = TempDir::new().unwrap();

        let mut analytics = Schema::new("analytics");
        analytics.views.push(View {
            oid: 16500,
            schema: "analytics".into(),
            name: "revenue".into(),
            definition: " SELECT sum(orders.total) AS total\n   FROM public.orders;".into(),
            is_materialized: true,
        });
        let mut public = Schema::new("public");
        public.tables.push(orders_table());

        let mut db = MemoryDatabase::default();
        db.catalog = DatabaseCatalog {
            database: "shop".into(),
            server_version: "PostgreSQL 16.2".into(),
            current_user: "backup".into(),
            schemas: vec![analytics, public],
        };
        db.rows.insert("public.orders".into(), vec![vec![text("1"), text("10.00")]]);

        let source = MemorySource::new().with_database("shop", db);
        let orchestrator = Orchestrator::with_source(config(dir.path()), Arc::new(source)).unwrap();
        let summary = orchestrator.run(CancellationToken::new(), None).await.unwrap();

        let sql = artifact_of(&summary.databases[0]);
        let create = sql.find("CREATE TABLE public.orders (").unwrap();
        let data_end = sql.find("1\t10.00\n\\.\n").unwrap();
        let view = sql.find("CREATE MATERIALIZED VIEW analytics.revenue AS").unwrap();
        let refresh = sql.find("REFRESH MATERIALIZED VIEW analytics.revenue;").unwrap();
        assert!(create < data_end);
        assert!(data_end < view);
        assert!(view < refresh);
    }

    #[tokio::test]
    async fn test_partitioned_table_scenario() {
        let dir = TempDir::new().unwrap();

        let mut parent = orders_table();
        parent.name = "ledger".into();
        parent.partition_key = Some("RANGE (id)".into());
        let mut low = orders_table();
        low.name = "ledger_low".into();
        low.partition_of = Some(PartitionBound {
            parent: parent.qualified_name(),
            bound: "FOR VALUES FROM (MINVALUE) TO (100)".into(),
        });

        let mut public = Schema::new("public");
        public.tables = vec![parent, low];
        let mut db = MemoryDatabase::default();
        db.catalog = DatabaseCatalog {
            database: "books".into(),
            server_version: "PostgreSQL 16.2".into(),
            current_user: "backup".into(),
            schemas: vec![public],
        };
        db.rows.insert("public.ledger_low".into(), vec![vec![text("7"), text("3.50")]]);

        let source = MemorySource::new().with_database("books", db);
        let orchestrator = Orchestrator::with_source(config(dir.path()), Arc::new(source)).unwrap();
        let summary = orchestrator.run(CancellationToken::new(), None).await.unwrap();

        match &summary.databases[0] {
            DatabaseOutcome::Succeeded { tables, .. } => {
                let names: Vec<&str> = tables.iter().map(|t| t.table.as_str()).collect();
                assert_eq!(names, ["ledger_low"]);
            }
            other => panic!("expected success, got {other:?}"),
        }

        let sql = artifact_of(&summary.databases[0]);
        assert!(sql.contains("\n)\nPARTITION BY RANGE (id);\n"));
        assert!(!sql.contains("COPY public.ledger ("));
        let copy = sql.find("COPY public.ledger_low (id, total) FROM stdin;\n7\t3.50\n").unwrap();
        let attach = sql
            .find(
                "ALTER TABLE public.ledger ATTACH PARTITION public.ledger_low \
                 FOR VALUES FROM (MINVALUE) TO (100);",
            )
            .unwrap();
        assert!(copy < attach);
    }

    // =========================================================================
    // Failure isolation and atomicity
    // =========================================================================

    #[tokio::test]
    async fn test_failure_isolation() {
        let dir = TempDir::new().unwrap();
        let source = MemorySource::new()
            .with_database("alpha", inventory_database("alpha"))
            .with_database("beta", inventory_database("beta"))
            .with_database("gamma", inventory_database("gamma"))
            .with_failure(
                "beta",
                Failure::Catalog(|| BackupError::catalog("permission denied for table pg_class")),
            );
        let sessions = Arc::clone(&source.sessions);
        let orchestrator = Orchestrator::with_source(config(dir.path()), Arc::new(source)).unwrap();

        let summary = orchestrator.run(CancellationToken::new(), None).await.unwrap();

        assert_eq!(summary.exit_code(), 1);
        assert_eq!(summary.succeeded().count(), 2);
        match &summary.databases[1] {
            DatabaseOutcome::Failed { database, kind, phase, message } => {
                assert_eq!(database, "beta");
                assert_eq!(*kind, ErrorKind::CatalogUnavailable);
                assert_eq!(*phase, DatabasePhase::Introspecting);
                assert!(message.contains("permission denied"));
            }
            other => panic!("expected failure, got {other:?}"),
        }

        for outcome in summary.succeeded() {
            let sql = artifact_of(outcome);
            assert!(sql.contains(END_OF_DATA));
            assert!(sql.contains("complete: 1 tables"));
        }

        let files = files_in(dir.path());
        assert_eq!(files.len(), 2);
        assert!(files.iter().all(|f| !f.to_string_lossy().contains("beta")));

        let sessions = sessions.lock().clone();
        assert!(sessions.contains(&"close:alpha".to_string()));
        assert!(sessions.contains(&"drop:beta".to_string()));
    }

    #[tokio::test]
    async fn test_stream_error_discards_artifact() {
        let dir = TempDir::new().unwrap();
        let source = MemorySource::new()
            .with_database("alpha", inventory_database("alpha"))
            .with_failure("alpha", Failure::Stream("public.products".into()));
        let orchestrator = Orchestrator::with_source(config(dir.path()), Arc::new(source)).unwrap();

        let summary = orchestrator.run(CancellationToken::new(), None).await.unwrap();

        match &summary.databases[0] {
            DatabaseOutcome::Failed { kind, phase, .. } => {
                assert_eq!(*kind, ErrorKind::DataStreamError);
                assert_eq!(*phase, DatabasePhase::Streaming);
            }
            other => panic!("expected failure, got {other:?}"),
        }
        assert!(files_in(dir.path()).is_empty());
    }

    #[tokio::test]
    async fn test_keep_partial_never_looks_complete() {
        let dir = TempDir::new().unwrap();
        let source = MemorySource::new()
            .with_database("alpha", inventory_database("alpha"))
            .with_failure("alpha", Failure::Stream("public.products".into()));
        let mut cfg = config(dir.path());
        cfg.output.keep_partial = true;
        let orchestrator = Orchestrator::with_source(cfg, Arc::new(source)).unwrap();

        orchestrator.run(CancellationToken::new(), None).await.unwrap();

        let files = files_in(dir.path());
        assert_eq!(files.len(), 1);
        assert!(files[0].to_string_lossy().ends_with(".sql.partial"));
        let partial = std::fs::read_to_string(&files[0]).unwrap();
        assert!(partial.contains("1\tWidget A\t19.99\n"));
        assert!(!partial.contains(END_OF_DATA));
    }

    #[tokio::test]
    async fn test_cancellation_mid_stream() {
        let dir = TempDir::new().unwrap();
        let source = MemorySource::new()
            .with_database("alpha", inventory_database("alpha"))
            .with_database("beta", inventory_database("beta"))
            .with_failure("alpha", Failure::Hang("public.products".into()));
        let sessions = Arc::clone(&source.sessions);
        let orchestrator = Orchestrator::with_source(config(dir.path()), Arc::new(source)).unwrap();

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let summary = orchestrator.run(cancel, None).await.unwrap();

        assert!(summary.cancelled);
        match &summary.databases[0] {
            DatabaseOutcome::Failed { kind, phase, .. } => {
                assert_eq!(*kind, ErrorKind::Cancelled);
                assert_eq!(*phase, DatabasePhase::Streaming);
            }
            other => panic!("expected cancellation, got {other:?}"),
        }
        assert!(matches!(summary.databases[1], DatabaseOutcome::Skipped { .. }));
        assert!(files_in(dir.path()).is_empty());
        assert_eq!(sessions.lock().as_slice(), ["drop:alpha".to_string()]);
    }

    // =========================================================================
    // Credentials
    // =========================================================================

    #[test]
    fn test_password_never_rendered() {
        let cfg = config(Path::new("out"));
        assert!(!format!("{cfg:?}").contains("s3cret-pw"));
        assert!(!serde_json::to_string(&cfg).unwrap().contains("s3cret-pw"));
        assert_eq!(cfg.password.expose(), "s3cret-pw");
    }
}
