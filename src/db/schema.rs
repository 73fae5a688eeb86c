use anyhow::{Context, Result};
use tokio_postgres::Client;

/// Tables backing the plan store.
///
/// Plan graphs are kept as adjacency rows (`plan_edges` are the HAS_CHILD
/// relationships); traversals use recursive CTEs over them.
pub const SCHEMA: &[(&str, &str)] = &[
    (
        "statements",
        r#"
        CREATE TABLE IF NOT EXISTS statements (
            id            TEXT PRIMARY KEY,
            text          TEXT NOT NULL,
            created_on    TIMESTAMPTZ NOT NULL DEFAULT now(),
            last_log_time TIMESTAMPTZ NOT NULL,
            state         TEXT NOT NULL
                CHECK (state IN ('pending_explain', 'stale', 'explained', 'unexplainable')),
            last_attempt  TIMESTAMPTZ
        )
        "#,
    ),
    (
        "statements_last_attempt",
        "ALTER TABLE statements ADD COLUMN IF NOT EXISTS last_attempt TIMESTAMPTZ",
    ),
    (
        "statements_state_idx",
        "CREATE INDEX IF NOT EXISTS statements_state_idx ON statements (state)",
    ),
    (
        "query_logs",
        r#"
        CREATE TABLE IF NOT EXISTS query_logs (
            statement_id   TEXT NOT NULL REFERENCES statements (id),
            logged_at      TIMESTAMPTZ NOT NULL,
            level          TEXT,
            query_time_ms  BIGINT,
            planning_ms    BIGINT,
            waiting_ms     BIGINT,
            cpu_ms         BIGINT,
            page_hits      BIGINT,
            page_faults    BIGINT,
            protocol       TEXT,
            username       TEXT,
            driver_version TEXT,
            client         TEXT,
            server         TEXT,
            PRIMARY KEY (statement_id, logged_at)
        )
        "#,
    ),
    (
        "explains",
        r#"
        CREATE TABLE IF NOT EXISTS explains (
            id                  BIGSERIAL PRIMARY KEY,
            statement_id        TEXT NOT NULL REFERENCES statements (id),
            created_on          TIMESTAMPTZ NOT NULL DEFAULT now(),
            root_node_id        BIGINT,
            server_address      TEXT,
            server_version      TEXT,
            planner             TEXT,
            planner_impl        TEXT,
            planner_version     TEXT,
            runtime             TEXT,
            runtime_impl        TEXT,
            runtime_version     TEXT,
            version             TEXT,
            pending_check       BOOLEAN NOT NULL DEFAULT true,
            pending_index_check BOOLEAN NOT NULL DEFAULT true
        )
        "#,
    ),
    (
        "explains_pending_check_idx",
        "CREATE INDEX IF NOT EXISTS explains_pending_check_idx ON explains (id) WHERE pending_check",
    ),
    (
        "explains_pending_index_check_idx",
        "CREATE INDEX IF NOT EXISTS explains_pending_index_check_idx ON explains (id) WHERE pending_index_check",
    ),
    (
        "plan_nodes",
        r#"
        CREATE TABLE IF NOT EXISTS plan_nodes (
            id            BIGSERIAL PRIMARY KEY,
            explain_id    BIGINT NOT NULL REFERENCES explains (id) ON DELETE CASCADE,
            alias         INTEGER NOT NULL,
            operator_type TEXT NOT NULL,
            identifiers   TEXT[] NOT NULL DEFAULT '{}',
            arguments     JSONB NOT NULL DEFAULT '{}',
            UNIQUE (explain_id, alias)
        )
        "#,
    ),
    (
        "plan_edges",
        r#"
        CREATE TABLE IF NOT EXISTS plan_edges (
            parent_id BIGINT NOT NULL REFERENCES plan_nodes (id) ON DELETE CASCADE,
            child_id  BIGINT NOT NULL REFERENCES plan_nodes (id) ON DELETE CASCADE,
            PRIMARY KEY (parent_id, child_id)
        )
        "#,
    ),
    (
        "performance_checks",
        r#"
        CREATE TABLE IF NOT EXISTS performance_checks (
            id          BIGSERIAL PRIMARY KEY,
            name        TEXT NOT NULL UNIQUE,
            severity    INTEGER NOT NULL CHECK (severity BETWEEN 1 AND 5),
            description TEXT NOT NULL,
            predicate   TEXT NOT NULL,
            version     INTEGER NOT NULL DEFAULT 1,
            created_on  TIMESTAMPTZ NOT NULL DEFAULT now()
        )
        "#,
    ),
    (
        "violations",
        r#"
        CREATE TABLE IF NOT EXISTS violations (
            explain_id BIGINT NOT NULL REFERENCES explains (id) ON DELETE CASCADE,
            check_id   BIGINT NOT NULL REFERENCES performance_checks (id),
            severity   INTEGER NOT NULL,
            at_plan    BIGINT[] NOT NULL DEFAULT '{}',
            PRIMARY KEY (explain_id, check_id)
        )
        "#,
    ),
    (
        "index_candidates",
        r#"
        CREATE TABLE IF NOT EXISTS index_candidates (
            explain_id   BIGINT NOT NULL REFERENCES explains (id) ON DELETE CASCADE,
            plan_node_id BIGINT NOT NULL REFERENCES plan_nodes (id) ON DELETE CASCADE,
            kind         TEXT NOT NULL CHECK (kind IN ('property', 'label')),
            label        TEXT NOT NULL DEFAULT '',
            property     TEXT NOT NULL DEFAULT '',
            PRIMARY KEY (explain_id, plan_node_id, kind, label, property)
        )
        "#,
    ),
];

/// Create every missing table and index. Safe to run repeatedly.
pub async fn init_schema(client: &mut Client) -> Result<()> {
    let tx = client.transaction().await?;
    for (name, ddl) in SCHEMA {
        tx.batch_execute(ddl)
            .await
            .with_context(|| format!("Failed to create {}", name))?;
    }
    tx.commit().await?;
    Ok(())
}
