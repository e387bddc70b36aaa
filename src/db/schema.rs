//! Durable-store schema
//!
//! `init_schema` is idempotent and safe to run at every startup.
//! `verify_schema` is the startup gate: a missing table means the
//! deployment is broken and the process must not serve traffic.

use anyhow::{Result, bail};
use sqlx::PgPool;

/// Tables both services depend on. Checked at startup.
const REQUIRED_TABLES: &[&str] = &[
    "activities",
    "orders",
    "stock_logs",
    "reconciliation_logs",
    "offline_messages",
    "counter_snapshots",
    "read_receipts",
];

/// Number of hash partitions for offline_messages. Sized for 10^7+
/// users; changing it requires a table rebuild.
const OFFLINE_PARTITIONS: u32 = 16;

pub async fn init_schema(pool: &PgPool) -> Result<()> {
    tracing::info!("Initializing durable schema...");

    for ddl in [
        CREATE_ACTIVITIES,
        CREATE_ORDERS,
        CREATE_ORDERS_IDX_SKU_STATUS,
        CREATE_ORDERS_IDX_STATUS_CREATED,
        CREATE_STOCK_LOGS,
        CREATE_STOCK_LOGS_IDX,
        CREATE_RECONCILIATION_LOGS,
        CREATE_OFFLINE_MESSAGES,
        CREATE_OFFLINE_MESSAGES_IDX,
        CREATE_COUNTER_SNAPSHOTS,
        CREATE_READ_RECEIPTS,
    ] {
        sqlx::query(ddl).execute(pool).await?;
    }

    for remainder in 0..OFFLINE_PARTITIONS {
        let ddl = format!(
            "CREATE TABLE IF NOT EXISTS offline_messages_p{remainder} \
             PARTITION OF offline_messages \
             FOR VALUES WITH (MODULUS {OFFLINE_PARTITIONS}, REMAINDER {remainder})"
        );
        sqlx::query(&ddl).execute(pool).await?;
    }

    tracing::info!("Durable schema initialized");
    Ok(())
}

/// Fail startup when a required table is missing.
pub async fn verify_schema(pool: &PgPool) -> Result<()> {
    for table in REQUIRED_TABLES {
        let exists: bool = sqlx::query_scalar(
            "SELECT EXISTS (SELECT 1 FROM information_schema.tables WHERE table_name = $1)",
        )
        .bind(table)
        .fetch_one(pool)
        .await?;
        if !exists {
            bail!("required table missing: {table}");
        }
    }
    Ok(())
}

const CREATE_ACTIVITIES: &str = r#"
CREATE TABLE IF NOT EXISTS activities (
    activity_id     BIGSERIAL PRIMARY KEY,
    sku_id          BIGINT NOT NULL,
    name            TEXT NOT NULL,
    total_stock     BIGINT NOT NULL,
    per_user_limit  INT NOT NULL DEFAULT 1,
    start_ts        TIMESTAMPTZ NOT NULL,
    end_ts          TIMESTAMPTZ NOT NULL,
    status          SMALLINT NOT NULL DEFAULT 0,
    created_at      TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    updated_at      TIMESTAMPTZ NOT NULL DEFAULT NOW()
)
"#;

const CREATE_ORDERS: &str = r#"
CREATE TABLE IF NOT EXISTS orders (
    order_id        UUID PRIMARY KEY,
    user_id         BIGINT NOT NULL,
    sku_id          BIGINT NOT NULL,
    activity_id     BIGINT NOT NULL,
    qty             INT NOT NULL,
    status          SMALLINT NOT NULL,
    created_at      TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    paid_at         TIMESTAMPTZ,
    cancelled_at    TIMESTAMPTZ
)
"#;

const CREATE_ORDERS_IDX_SKU_STATUS: &str =
    "CREATE INDEX IF NOT EXISTS idx_orders_sku_status ON orders (sku_id, status)";

const CREATE_ORDERS_IDX_STATUS_CREATED: &str =
    "CREATE INDEX IF NOT EXISTS idx_orders_status_created ON orders (status, created_at)";

const CREATE_STOCK_LOGS: &str = r#"
CREATE TABLE IF NOT EXISTS stock_logs (
    id              BIGSERIAL PRIMARY KEY,
    sku_id          BIGINT NOT NULL,
    order_id        UUID NOT NULL,
    op              SMALLINT NOT NULL,
    qty             INT NOT NULL,
    stock_before    BIGINT NOT NULL,
    stock_after     BIGINT NOT NULL,
    ts              TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    UNIQUE (order_id, op)
)
"#;

const CREATE_STOCK_LOGS_IDX: &str =
    "CREATE INDEX IF NOT EXISTS idx_stock_logs_sku_ts ON stock_logs (sku_id, ts)";

const CREATE_RECONCILIATION_LOGS: &str = r#"
CREATE TABLE IF NOT EXISTS reconciliation_logs (
    id                  BIGSERIAL PRIMARY KEY,
    sku_id              BIGINT NOT NULL,
    redis_stock         BIGINT NOT NULL,
    redis_sold          BIGINT NOT NULL,
    durable_order_count BIGINT NOT NULL,
    discrepancies       JSONB NOT NULL DEFAULT '[]',
    status              SMALLINT NOT NULL,
    ts                  TIMESTAMPTZ NOT NULL DEFAULT NOW()
)
"#;

const CREATE_OFFLINE_MESSAGES: &str = r#"
CREATE TABLE IF NOT EXISTS offline_messages (
    msg_id          TEXT NOT NULL,
    user_id         BIGINT NOT NULL,
    sender_id       BIGINT NOT NULL,
    conv_id         TEXT NOT NULL,
    conv_type       TEXT NOT NULL,
    content         TEXT NOT NULL,
    seq             BIGINT NOT NULL,
    ts              TIMESTAMPTZ NOT NULL,
    created_at      TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    expires_at      TIMESTAMPTZ NOT NULL,
    PRIMARY KEY (user_id, msg_id)
) PARTITION BY HASH (user_id)
"#;

const CREATE_OFFLINE_MESSAGES_IDX: &str =
    "CREATE INDEX IF NOT EXISTS idx_offline_user_seq ON offline_messages (user_id, seq)";

const CREATE_COUNTER_SNAPSHOTS: &str = r#"
CREATE TABLE IF NOT EXISTS counter_snapshots (
    scope           TEXT NOT NULL,
    conv_id         TEXT NOT NULL,
    seq             BIGINT NOT NULL,
    snapshot_ts     TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    PRIMARY KEY (scope, conv_id)
)
"#;

const CREATE_READ_RECEIPTS: &str = r#"
CREATE TABLE IF NOT EXISTS read_receipts (
    msg_id          TEXT NOT NULL,
    reader_id       BIGINT NOT NULL,
    device_id       TEXT NOT NULL,
    sender_id       BIGINT NOT NULL,
    conv_id         TEXT NOT NULL,
    conv_type       TEXT NOT NULL,
    read_at         TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    PRIMARY KEY (msg_id, reader_id, device_id)
)
"#;
