//! PostgreSQL store

use super::{SpoolQuery, Store, TxFilter, TxOrder};
use crate::config::DatabaseConfig;
use crate::error::{RelayerError, RelayerResult};
use crate::model::{
    Account, Chain, ChainFamily, Dependency, Event, HistoryEntry, Secret, Transaction, TxKind,
    TxState,
};

use async_trait::async_trait;
use lazy_static::lazy_static;
use sqlx::postgres::{PgArguments, PgPool, PgPoolOptions, PgRow};
use sqlx::query::Query;
use sqlx::{Postgres, QueryBuilder, Row};
use tracing::{debug, info, warn};
use uuid::Uuid;

const TX_COLUMNS: [&str; 31] = [
    "id",
    "chain_id",
    "kind",
    "state",
    "name",
    "description",
    "created_at",
    "updated_at",
    "sender",
    "receiver",
    "contract",
    "caller",
    "address",
    "function",
    "args",
    "amount",
    "hash",
    "counter",
    "nonce",
    "level",
    "gas",
    "last_fail",
    "max_fails",
    "error",
    "history",
    "metadata",
    "payload",
    "has_code",
    "indexed",
    "normalized",
    "normalizer",
];

lazy_static! {
    static ref INSERT_TX: String = format!(
        "INSERT INTO transactions ({}) VALUES ({})",
        TX_COLUMNS.join(", "),
        (1..=TX_COLUMNS.len())
            .map(|i| format!("${}", i))
            .collect::<Vec<_>>()
            .join(", ")
    );
    static ref UPDATE_TX: String = format!(
        "UPDATE transactions SET {} WHERE id = $1",
        TX_COLUMNS
            .iter()
            .enumerate()
            .skip(1)
            .map(|(i, column)| format!("{} = ${}", column, i + 1))
            .collect::<Vec<_>>()
            .join(", ")
    );
}

/// Store backed by a PostgreSQL pool
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    /// Connect a new pool
    pub async fn new(config: &DatabaseConfig) -> RelayerResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .connect(&config.url)
            .await?;

        Ok(Self { pool })
    }

    /// Create tables and indexes
    pub async fn run_migrations(&self) -> RelayerResult<()> {
        let statements = [
            r#"
            CREATE TABLE IF NOT EXISTS chains (
                chain_id BIGINT PRIMARY KEY,
                name VARCHAR(100) NOT NULL,
                family VARCHAR(20) NOT NULL,
                is_active BOOLEAN NOT NULL DEFAULT TRUE,
                index_level BIGINT,
                min_level BIGINT,
                min_confirmations BIGINT NOT NULL DEFAULT 2,
                configuration JSONB NOT NULL DEFAULT 'null',
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS accounts (
                id UUID PRIMARY KEY,
                chain_id BIGINT NOT NULL REFERENCES chains (chain_id),
                name VARCHAR(100),
                address VARCHAR(255),
                balance NUMERIC(80, 18) NOT NULL DEFAULT 0,
                secret_key TEXT,
                revealed BOOLEAN NOT NULL DEFAULT FALSE,
                counter BIGINT,
                last_level BIGINT,
                indexed BOOLEAN NOT NULL DEFAULT TRUE,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                UNIQUE (chain_id, address)
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS transactions (
                id UUID PRIMARY KEY,
                chain_id BIGINT NOT NULL REFERENCES chains (chain_id),
                kind VARCHAR(8) NOT NULL,
                state VARCHAR(20) NOT NULL,
                name VARCHAR(100),
                description TEXT,
                created_at TIMESTAMPTZ NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL,
                sender UUID REFERENCES accounts (id),
                receiver UUID REFERENCES accounts (id),
                contract UUID REFERENCES transactions (id),
                caller UUID REFERENCES transactions (id),
                address VARCHAR(255),
                function VARCHAR(100),
                args JSONB NOT NULL DEFAULT 'null',
                amount NUMERIC(80, 18) NOT NULL DEFAULT 0,
                hash VARCHAR(255),
                counter BIGINT,
                nonce BIGINT NOT NULL DEFAULT -1,
                level BIGINT,
                gas BIGINT,
                last_fail TIMESTAMPTZ,
                max_fails INTEGER NOT NULL DEFAULT 10,
                error TEXT,
                history JSONB NOT NULL DEFAULT '[]',
                metadata JSONB NOT NULL DEFAULT 'null',
                payload JSONB NOT NULL DEFAULT 'null',
                has_code BOOLEAN NOT NULL DEFAULT FALSE,
                indexed BOOLEAN NOT NULL DEFAULT TRUE,
                normalized BOOLEAN NOT NULL DEFAULT FALSE,
                normalizer VARCHAR(100)
            )
            "#,
            r#"
            CREATE UNIQUE INDEX IF NOT EXISTS idx_transactions_operation
            ON transactions (chain_id, hash, COALESCE(counter, -1), nonce)
            WHERE hash IS NOT NULL
            "#,
            r#"
            CREATE INDEX IF NOT EXISTS idx_transactions_chain_state
            ON transactions (chain_id, state)
            "#,
            r#"
            CREATE INDEX IF NOT EXISTS idx_transactions_level
            ON transactions (chain_id, level)
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS dependencies (
                id UUID PRIMARY KEY,
                dependent UUID NOT NULL REFERENCES transactions (id),
                dependency UUID NOT NULL REFERENCES transactions (id),
                graph UUID NOT NULL REFERENCES transactions (id),
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                UNIQUE (dependent, dependency)
            )
            "#,
            r#"
            CREATE INDEX IF NOT EXISTS idx_dependencies_graph
            ON dependencies (graph)
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS events (
                id UUID PRIMARY KEY,
                chain_id BIGINT NOT NULL REFERENCES chains (chain_id),
                transaction_id UUID NOT NULL REFERENCES transactions (id) ON DELETE CASCADE,
                name VARCHAR(500) NOT NULL,
                args JSONB NOT NULL DEFAULT 'null',
                event_index BIGINT NOT NULL,
                normalized BOOLEAN NOT NULL DEFAULT FALSE,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                UNIQUE (transaction_id, event_index)
            )
            "#,
        ];

        for statement in statements {
            sqlx::query(statement).execute(&self.pool).await?;
        }

        info!("Database migrations complete");
        Ok(())
    }
}

fn chain_from_row(row: &PgRow) -> RelayerResult<Chain> {
    let family: String = row.try_get("family")?;
    Ok(Chain {
        id: row.try_get::<i64, _>("chain_id")? as u64,
        name: row.try_get("name")?,
        family: family.parse::<ChainFamily>().map_err(RelayerError::Internal)?,
        is_active: row.try_get("is_active")?,
        index_level: row.try_get::<Option<i64>, _>("index_level")?.map(|l| l as u64),
        min_level: row.try_get::<Option<i64>, _>("min_level")?.map(|l| l as u64),
        min_confirmations: row.try_get::<i64, _>("min_confirmations")? as u64,
        configuration: row.try_get("configuration")?,
    })
}

fn event_from_row(row: &PgRow) -> RelayerResult<Event> {
    Ok(Event {
        id: row.try_get("id")?,
        chain_id: row.try_get::<i64, _>("chain_id")? as u64,
        transaction: row.try_get("transaction_id")?,
        name: row.try_get("name")?,
        args: row.try_get("args")?,
        index: row.try_get::<i64, _>("event_index")? as u32,
        normalized: row.try_get("normalized")?,
        created_at: row.try_get("created_at")?,
    })
}

fn account_from_row(row: &PgRow) -> RelayerResult<Account> {
    let secret = row
        .try_get::<Option<String>, _>("secret_key")?
        .map(|hex| Secret::from_hex(&hex))
        .transpose()
        .map_err(|e| RelayerError::Internal(format!("corrupt secret key: {}", e)))?;

    Ok(Account {
        id: row.try_get("id")?,
        chain_id: row.try_get::<i64, _>("chain_id")? as u64,
        name: row.try_get("name")?,
        address: row.try_get("address")?,
        balance: row.try_get("balance")?,
        secret,
        revealed: row.try_get("revealed")?,
        counter: row.try_get::<Option<i64>, _>("counter")?.map(|c| c as u64),
        last_level: row.try_get::<Option<i64>, _>("last_level")?.map(|l| l as u64),
        index: row.try_get("indexed")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn tx_from_row(row: &PgRow) -> RelayerResult<Transaction> {
    let kind: String = row.try_get("kind")?;
    let state: String = row.try_get("state")?;
    let history: Vec<HistoryEntry> = serde_json::from_value(row.try_get("history")?)?;

    Ok(Transaction {
        id: row.try_get("id")?,
        chain_id: row.try_get::<i64, _>("chain_id")? as u64,
        kind: kind.parse::<TxKind>().map_err(RelayerError::Internal)?,
        state: state.parse::<TxState>().map_err(RelayerError::Internal)?,
        name: row.try_get("name")?,
        description: row.try_get("description")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
        sender: row.try_get("sender")?,
        receiver: row.try_get("receiver")?,
        contract: row.try_get("contract")?,
        caller: row.try_get("caller")?,
        address: row.try_get("address")?,
        function: row.try_get("function")?,
        args: row.try_get("args")?,
        amount: row.try_get("amount")?,
        hash: row.try_get("hash")?,
        counter: row.try_get::<Option<i64>, _>("counter")?.map(|c| c as u64),
        nonce: row.try_get("nonce")?,
        level: row.try_get::<Option<i64>, _>("level")?.map(|l| l as u64),
        gas: row.try_get("gas")?,
        last_fail: row.try_get("last_fail")?,
        max_fails: row.try_get::<i32, _>("max_fails")? as u32,
        error: row.try_get("error")?,
        history,
        metadata: row.try_get("metadata")?,
        payload: row.try_get("payload")?,
        has_code: row.try_get("has_code")?,
        index: row.try_get("indexed")?,
        normalized: row.try_get("normalized")?,
        normalizer: row.try_get("normalizer")?,
    })
}

fn dependency_from_row(row: &PgRow) -> RelayerResult<Dependency> {
    Ok(Dependency {
        id: row.try_get("id")?,
        dependent: row.try_get("dependent")?,
        dependency: row.try_get("dependency")?,
        graph: row.try_get("graph")?,
        created_at: row.try_get("created_at")?,
    })
}

/// Bind every column of [`TX_COLUMNS`] in order
fn bind_transaction<'q>(
    query: Query<'q, Postgres, PgArguments>,
    tx: &Transaction,
) -> RelayerResult<Query<'q, Postgres, PgArguments>> {
    let history = serde_json::to_value(&tx.history)?;

    Ok(query
        .bind(tx.id)
        .bind(tx.chain_id as i64)
        .bind(tx.kind.as_str())
        .bind(tx.state.as_str())
        .bind(tx.name.clone())
        .bind(tx.description.clone())
        .bind(tx.created_at)
        .bind(tx.updated_at)
        .bind(tx.sender)
        .bind(tx.receiver)
        .bind(tx.contract)
        .bind(tx.caller)
        .bind(tx.address.clone())
        .bind(tx.function.clone())
        .bind(tx.args.clone())
        .bind(tx.amount)
        .bind(tx.hash.clone())
        .bind(tx.counter.map(|c| c as i64))
        .bind(tx.nonce)
        .bind(tx.level.map(|l| l as i64))
        .bind(tx.gas)
        .bind(tx.last_fail)
        .bind(tx.max_fails as i32)
        .bind(tx.error.clone())
        .bind(history)
        .bind(tx.metadata.clone())
        .bind(tx.payload.clone())
        .bind(tx.has_code)
        .bind(tx.index)
        .bind(tx.normalized)
        .bind(tx.normalizer.clone()))
}

fn state_names(states: &[TxState]) -> Vec<String> {
    states.iter().map(|s| s.as_str().to_string()).collect()
}

fn push_order(qb: &mut QueryBuilder<'_, Postgres>, order: TxOrder, alias: &str) {
    let primary = match order {
        TxOrder::CreatedAt => None,
        TxOrder::LastFail => Some("last_fail"),
        TxOrder::Nonce => Some("nonce"),
        TxOrder::Level => Some("level"),
    };
    qb.push(" ORDER BY ");
    if let Some(column) = primary {
        qb.push(format!("{}{} ASC NULLS LAST, ", alias, column));
    }
    qb.push(format!("{}created_at ASC", alias));
}

#[async_trait]
impl Store for PgStore {
    async fn health_check(&self) -> RelayerResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    async fn save_chain(&self, chain: &Chain) -> RelayerResult<()> {
        sqlx::query(
            r#"
            INSERT INTO chains
                (chain_id, name, family, is_active, index_level, min_level,
                 min_confirmations, configuration, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, NOW())
            ON CONFLICT (chain_id)
            DO UPDATE SET name = $2, family = $3, is_active = $4, index_level = $5,
                min_level = $6, min_confirmations = $7, configuration = $8, updated_at = NOW()
            "#,
        )
        .bind(chain.id as i64)
        .bind(&chain.name)
        .bind(chain.family.as_str())
        .bind(chain.is_active)
        .bind(chain.index_level.map(|l| l as i64))
        .bind(chain.min_level.map(|l| l as i64))
        .bind(chain.min_confirmations as i64)
        .bind(chain.configuration.clone())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_chain(&self, chain_id: u64) -> RelayerResult<Chain> {
        let row = sqlx::query("SELECT * FROM chains WHERE chain_id = $1")
            .bind(chain_id as i64)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(RelayerError::ChainNotFound { chain_id })?;

        chain_from_row(&row)
    }

    async fn chains(&self, active_only: bool) -> RelayerResult<Vec<Chain>> {
        let rows = sqlx::query("SELECT * FROM chains WHERE is_active OR NOT $1 ORDER BY chain_id")
            .bind(active_only)
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(chain_from_row).collect()
    }

    async fn set_index_level(&self, chain_id: u64, level: u64) -> RelayerResult<()> {
        let result = sqlx::query(
            "UPDATE chains SET index_level = $2, updated_at = NOW() WHERE chain_id = $1",
        )
        .bind(chain_id as i64)
        .bind(level as i64)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(RelayerError::ChainNotFound { chain_id });
        }
        debug!("Saved index level for chain {}: {}", chain_id, level);
        Ok(())
    }

    async fn save_account(&self, account: &Account) -> RelayerResult<()> {
        sqlx::query(
            r#"
            INSERT INTO accounts
                (id, chain_id, name, address, balance, secret_key, revealed, counter,
                 last_level, indexed, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            ON CONFLICT (id)
            DO UPDATE SET name = $3, address = $4, balance = $5, secret_key = $6,
                revealed = $7, counter = $8, last_level = $9, indexed = $10, updated_at = $12
            "#,
        )
        .bind(account.id)
        .bind(account.chain_id as i64)
        .bind(account.name.clone())
        .bind(account.address.clone())
        .bind(account.balance)
        .bind(account.secret.as_ref().map(Secret::to_hex))
        .bind(account.revealed)
        .bind(account.counter.map(|c| c as i64))
        .bind(account.last_level.map(|l| l as i64))
        .bind(account.index)
        .bind(account.created_at)
        .bind(account.updated_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_account(&self, id: Uuid) -> RelayerResult<Account> {
        let row = sqlx::query("SELECT * FROM accounts WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| RelayerError::AccountNotFound {
                account: id.to_string(),
            })?;

        account_from_row(&row)
    }

    async fn find_account(&self, chain_id: u64, address: &str) -> RelayerResult<Option<Account>> {
        let row = sqlx::query("SELECT * FROM accounts WHERE chain_id = $1 AND address = $2")
            .bind(chain_id as i64)
            .bind(address)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(account_from_row).transpose()
    }

    async fn accounts(&self, chain_id: u64) -> RelayerResult<Vec<Account>> {
        let rows = sqlx::query("SELECT * FROM accounts WHERE chain_id = $1 ORDER BY created_at")
            .bind(chain_id as i64)
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(account_from_row).collect()
    }

    async fn insert_transaction(&self, tx: &Transaction) -> RelayerResult<()> {
        bind_transaction(sqlx::query(INSERT_TX.as_str()), tx)?
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn save_transaction(&self, tx: &Transaction) -> RelayerResult<()> {
        let result = bind_transaction(sqlx::query(UPDATE_TX.as_str()), tx)?
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(RelayerError::TransactionNotFound {
                tx_id: tx.id.to_string(),
            });
        }
        Ok(())
    }

    async fn get_transaction(&self, id: Uuid) -> RelayerResult<Transaction> {
        let row = sqlx::query("SELECT * FROM transactions WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| RelayerError::TransactionNotFound {
                tx_id: id.to_string(),
            })?;

        tx_from_row(&row)
    }

    async fn get_transactions(&self, ids: &[Uuid]) -> RelayerResult<Vec<Transaction>> {
        let rows = sqlx::query("SELECT * FROM transactions WHERE id = ANY($1)")
            .bind(ids.to_vec())
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(tx_from_row).collect()
    }

    async fn find_transactions(&self, filter: &TxFilter) -> RelayerResult<Vec<Transaction>> {
        let mut qb = QueryBuilder::<Postgres>::new("SELECT * FROM transactions WHERE TRUE");

        if let Some(chain_id) = filter.chain_id {
            qb.push(" AND chain_id = ").push_bind(chain_id as i64);
        }
        if let Some(kind) = filter.kind {
            qb.push(" AND kind = ").push_bind(kind.as_str());
        }
        if !filter.states.is_empty() {
            qb.push(" AND state = ANY(")
                .push_bind(state_names(&filter.states))
                .push(")");
        }
        if !filter.exclude_states.is_empty() {
            qb.push(" AND state <> ALL(")
                .push_bind(state_names(&filter.exclude_states))
                .push(")");
        }
        if let Some(hash) = &filter.hash {
            qb.push(" AND hash = ").push_bind(hash.clone());
        }
        match filter.has_hash {
            Some(true) => {
                qb.push(" AND COALESCE(hash, '') <> ''");
            }
            Some(false) => {
                qb.push(" AND COALESCE(hash, '') = ''");
            }
            None => {}
        }
        if let Some(address) = &filter.address {
            qb.push(" AND address = ").push_bind(address.clone());
        }
        match filter.has_address {
            Some(true) => {
                qb.push(" AND COALESCE(address, '') <> ''");
            }
            Some(false) => {
                qb.push(" AND COALESCE(address, '') = ''");
            }
            None => {}
        }
        match filter.counter {
            Some(Some(counter)) => {
                qb.push(" AND counter = ").push_bind(counter as i64);
            }
            Some(None) => {
                qb.push(" AND counter IS NULL");
            }
            None => {}
        }
        if let Some(nonce) = filter.nonce {
            qb.push(" AND nonce = ").push_bind(nonce);
        }
        match filter.caller {
            Some(Some(caller)) => {
                qb.push(" AND caller = ").push_bind(caller);
            }
            Some(None) => {
                qb.push(" AND caller IS NULL");
            }
            None => {}
        }
        if let Some(contract) = filter.contract {
            qb.push(" AND contract = ").push_bind(contract);
        }
        if let Some(index) = filter.index {
            qb.push(" AND indexed = ").push_bind(index);
        }
        if let Some(normalized) = filter.normalized {
            qb.push(" AND normalized = ").push_bind(normalized);
        }

        push_order(&mut qb, filter.order, "");
        if let Some(limit) = filter.limit {
            qb.push(" LIMIT ").push_bind(limit as i64);
        }

        let rows = qb.build().fetch_all(&self.pool).await?;
        rows.iter().map(tx_from_row).collect()
    }

    async fn spool_candidates(&self, query: &SpoolQuery) -> RelayerResult<Vec<Transaction>> {
        let mut qb = QueryBuilder::<Postgres>::new(
            r#"
            SELECT t.* FROM transactions t
            JOIN accounts s ON s.id = t.sender
            JOIN chains c ON c.chain_id = t.chain_id
            LEFT JOIN transactions k ON k.id = t.contract
            WHERE c.is_active AND t.hash IS NULL AND s.balance > 0
            "#,
        );
        qb.push(" AND t.chain_id = ").push_bind(query.chain_id as i64);
        qb.push(" AND t.kind = ").push_bind(query.kind.as_str());
        qb.push(" AND (s.last_level IS NULL OR s.last_level < ")
            .push_bind(query.head as i64)
            .push(")");
        qb.push(" AND t.state <> ALL(")
            .push_bind(state_names(&TxState::EXCLUDED))
            .push(")");
        qb.push(" AND (t.last_fail IS NOT NULL) = ").push_bind(query.failed);

        match query.kind {
            TxKind::Contract => {
                qb.push(" AND t.has_code AND COALESCE(t.address, '') = ''");
            }
            TxKind::Function => {
                qb.push(" AND COALESCE(k.address, '') <> ''");
            }
            TxKind::Transfer => {}
        }

        let order = if query.failed {
            TxOrder::LastFail
        } else {
            TxOrder::CreatedAt
        };
        push_order(&mut qb, order, "t.");
        if let Some(limit) = query.limit {
            qb.push(" LIMIT ").push_bind(limit as i64);
        }

        let rows = qb.build().fetch_all(&self.pool).await?;
        rows.iter().map(tx_from_row).collect()
    }

    async fn rollback_from(&self, chain_id: u64, level: u64, at: i64) -> RelayerResult<u64> {
        let mut db_tx = self.pool.begin().await?;

        let result = sqlx::query(
            r#"
            UPDATE transactions
            SET level = NULL, hash = NULL, address = NULL, state = 'deleted',
                history = history || jsonb_build_array(jsonb_build_array('deleted', $3::BIGINT)),
                updated_at = NOW()
            WHERE chain_id = $1 AND level IS NOT NULL AND level >= $2
            "#,
        )
        .bind(chain_id as i64)
        .bind(level as i64)
        .bind(at)
        .execute(&mut *db_tx)
        .await?;

        let chain = sqlx::query(
            "UPDATE chains SET index_level = $2, updated_at = NOW() WHERE chain_id = $1",
        )
        .bind(chain_id as i64)
        .bind(level as i64)
        .execute(&mut *db_tx)
        .await?;

        if chain.rows_affected() == 0 {
            warn!("Rollback requested for unknown chain {}", chain_id);
            db_tx.rollback().await?;
            return Err(RelayerError::ChainNotFound { chain_id });
        }

        db_tx.commit().await?;
        Ok(result.rows_affected())
    }

    async fn save_event(&self, event: &Event) -> RelayerResult<()> {
        sqlx::query(
            r#"
            INSERT INTO events
                (id, chain_id, transaction_id, name, args, event_index, normalized, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (transaction_id, event_index) DO UPDATE SET
                id = EXCLUDED.id, name = EXCLUDED.name, args = EXCLUDED.args,
                normalized = EXCLUDED.normalized
            "#,
        )
        .bind(event.id)
        .bind(event.chain_id as i64)
        .bind(event.transaction)
        .bind(&event.name)
        .bind(event.args.clone())
        .bind(event.index as i64)
        .bind(event.normalized)
        .bind(event.created_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn events_of(&self, tx_id: Uuid) -> RelayerResult<Vec<Event>> {
        let rows = sqlx::query("SELECT * FROM events WHERE transaction_id = $1 ORDER BY event_index")
            .bind(tx_id)
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(event_from_row).collect()
    }

    async fn insert_dependency(&self, dependency: &Dependency) -> RelayerResult<()> {
        sqlx::query(
            r#"
            INSERT INTO dependencies (id, dependent, dependency, graph, created_at)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (dependent, dependency) DO NOTHING
            "#,
        )
        .bind(dependency.id)
        .bind(dependency.dependent)
        .bind(dependency.dependency)
        .bind(dependency.graph)
        .bind(dependency.created_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn graph_of(&self, tx_id: Uuid) -> RelayerResult<Option<Uuid>> {
        let row = sqlx::query(
            "SELECT graph FROM dependencies WHERE dependent = $1 OR dependency = $1 LIMIT 1",
        )
        .bind(tx_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| r.try_get("graph")).transpose()?)
    }

    async fn graph_edges(&self, graph: Uuid) -> RelayerResult<Vec<Dependency>> {
        let rows = sqlx::query("SELECT * FROM dependencies WHERE graph = $1 ORDER BY created_at")
            .bind(graph)
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(dependency_from_row).collect()
    }

    async fn merge_graphs(&self, from: Uuid, into: Uuid) -> RelayerResult<()> {
        sqlx::query("UPDATE dependencies SET graph = $2 WHERE graph = $1")
            .bind(from)
            .bind(into)
            .execute(&self.pool)
            .await?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_update_statement_binds_id_first() {
        assert!(UPDATE_TX.starts_with("UPDATE transactions SET chain_id = $2, kind = $3"));
        assert!(UPDATE_TX.ends_with("normalizer = $31 WHERE id = $1"));
    }

    #[test]
    fn test_insert_statement_has_one_placeholder_per_column() {
        assert!(INSERT_TX.contains("$31)"));
        assert!(!INSERT_TX.contains("$32"));
    }
}
