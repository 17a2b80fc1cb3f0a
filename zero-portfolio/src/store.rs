//! SQLite persistence for portfolio ledgers.
//!
//! Saving a portfolio replaces every row it owns in one transaction, so a
//! load always sees one complete save.

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info};

use crate::execution::{OrderSide, Position};
use crate::portfolio::{DiagnosticEntry, EntryKind, Holdings, PortfolioSnapshot, TradeRecord};

/// SQLite store for portfolio snapshots
#[derive(Clone)]
pub struct PortfolioStore {
    conn: Arc<Mutex<Connection>>,
}

impl PortfolioStore {
    /// Open or create a store at the given path
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory {:?}", parent))?;
        }

        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open database at {:?}", path))?;

        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.init_schema()?;

        info!(path = ?path, "Portfolio store opened");
        Ok(store)
    }

    /// Create an in-memory store (for testing)
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;

        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.init_schema()?;

        debug!("In-memory portfolio store created");
        Ok(store)
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| anyhow!("portfolio store lock poisoned"))
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self.conn()?;

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS portfolios (
                name TEXT PRIMARY KEY,
                account_id TEXT NOT NULL,
                cash REAL NOT NULL,
                saved_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS positions (
                portfolio TEXT NOT NULL,
                symbol TEXT NOT NULL,
                avg_cost REAL NOT NULL,
                shares REAL NOT NULL,
                PRIMARY KEY (portfolio, symbol),
                FOREIGN KEY (portfolio) REFERENCES portfolios(name)
            );

            CREATE TABLE IF NOT EXISTS trades (
                portfolio TEXT NOT NULL,
                seq INTEGER NOT NULL,
                timestamp TEXT NOT NULL,
                side TEXT,
                symbol TEXT,
                price REAL NOT NULL,
                quantity REAL NOT NULL,
                kind TEXT NOT NULL,
                PRIMARY KEY (portfolio, seq),
                FOREIGN KEY (portfolio) REFERENCES portfolios(name)
            );

            CREATE TABLE IF NOT EXISTS diagnostics (
                portfolio TEXT NOT NULL,
                seq INTEGER NOT NULL,
                timestamp TEXT NOT NULL,
                code TEXT NOT NULL,
                message TEXT NOT NULL,
                PRIMARY KEY (portfolio, seq),
                FOREIGN KEY (portfolio) REFERENCES portfolios(name)
            );
            "#,
        )?;

        debug!("Database schema initialized");
        Ok(())
    }

    /// Write a snapshot, replacing any previous save of the same portfolio
    pub fn save(&self, snapshot: &PortfolioSnapshot) -> Result<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let name = &snapshot.name;

        for table in ["positions", "trades", "diagnostics"] {
            tx.execute(
                &format!("DELETE FROM {} WHERE portfolio = ?1", table),
                params![name],
            )?;
        }

        tx.execute(
            r#"
            INSERT INTO portfolios (name, account_id, cash, saved_at)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT(name) DO UPDATE SET
                account_id = excluded.account_id,
                cash = excluded.cash,
                saved_at = excluded.saved_at
            "#,
            params![
                name,
                snapshot.account_id,
                snapshot.holdings.cash,
                snapshot.saved_at.to_rfc3339(),
            ],
        )?;

        for (symbol, position) in &snapshot.holdings.positions {
            tx.execute(
                "INSERT INTO positions (portfolio, symbol, avg_cost, shares) VALUES (?1, ?2, ?3, ?4)",
                params![name, symbol, position.avg_cost, position.shares],
            )?;
        }

        for (seq, trade) in snapshot.trade_log.iter().enumerate() {
            tx.execute(
                r#"
                INSERT INTO trades (portfolio, seq, timestamp, side, symbol, price, quantity, kind)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                "#,
                params![
                    name,
                    seq as i64,
                    trade.timestamp.to_rfc3339(),
                    trade.side.map(|s| s.as_str()),
                    trade.symbol,
                    trade.price,
                    trade.quantity,
                    trade.kind.as_str(),
                ],
            )?;
        }

        for (seq, entry) in snapshot.diagnostics.iter().enumerate() {
            tx.execute(
                "INSERT INTO diagnostics (portfolio, seq, timestamp, code, message) VALUES (?1, ?2, ?3, ?4, ?5)",
                params![name, seq as i64, entry.timestamp.to_rfc3339(), entry.code, entry.message],
            )?;
        }

        tx.commit()
            .with_context(|| format!("Failed to commit save of portfolio {}", name))?;

        debug!(portfolio = %name, trades = snapshot.trade_log.len(), "Portfolio snapshot written");
        Ok(())
    }

    /// Load the last save of a portfolio
    pub fn load(&self, name: &str) -> Result<Option<PortfolioSnapshot>> {
        let conn = self.conn()?;

        let header = conn
            .query_row(
                "SELECT account_id, cash, saved_at FROM portfolios WHERE name = ?1",
                params![name],
                |row| {
                    let saved_str: String = row.get(2)?;
                    Ok((row.get::<_, String>(0)?, row.get::<_, f64>(1)?, parse_time(&saved_str)))
                },
            )
            .optional()?;

        let Some((account_id, cash, saved_at)) = header else {
            return Ok(None);
        };

        let mut holdings = Holdings::new(cash);
        let mut stmt = conn.prepare(
            "SELECT symbol, avg_cost, shares FROM positions WHERE portfolio = ?1 ORDER BY symbol",
        )?;
        let positions = stmt
            .query_map(params![name], |row| {
                Ok((row.get::<_, String>(0)?, Position::new(row.get(1)?, row.get(2)?)))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        holdings.positions.extend(positions);

        let mut stmt = conn.prepare(
            r#"
            SELECT timestamp, side, symbol, price, quantity, kind
            FROM trades
            WHERE portfolio = ?1
            ORDER BY seq
            "#,
        )?;
        let rows = stmt
            .query_map(params![name], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, Option<String>>(1)?,
                    row.get::<_, Option<String>>(2)?,
                    row.get::<_, f64>(3)?,
                    row.get::<_, f64>(4)?,
                    row.get::<_, String>(5)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        let trade_log = rows
            .into_iter()
            .map(|(timestamp, side, symbol, price, quantity, kind)| {
                let kind = EntryKind::parse(&kind)
                    .ok_or_else(|| anyhow!("unknown trade kind {:?} in portfolio {}", kind, name))?;
                Ok(TradeRecord {
                    timestamp: parse_time(&timestamp),
                    side: side.as_deref().and_then(OrderSide::parse),
                    symbol,
                    price,
                    quantity,
                    kind,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let mut stmt = conn.prepare(
            "SELECT timestamp, code, message FROM diagnostics WHERE portfolio = ?1 ORDER BY seq",
        )?;
        let diagnostics = stmt
            .query_map(params![name], |row| {
                let timestamp: String = row.get(0)?;
                Ok(DiagnosticEntry {
                    timestamp: parse_time(&timestamp),
                    code: row.get(1)?,
                    message: row.get(2)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Some(PortfolioSnapshot {
            name: name.to_string(),
            account_id,
            holdings,
            trade_log,
            diagnostics,
            saved_at,
        }))
    }

    /// Names of every saved portfolio
    pub fn list(&self) -> Result<Vec<String>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare("SELECT name FROM portfolios ORDER BY name")?;
        let names = stmt
            .query_map([], |row| row.get(0))?
            .collect::<Result<Vec<String>, _>>()?;
        Ok(names)
    }

    /// Remove a saved portfolio; returns whether it existed
    pub fn delete(&self, name: &str) -> Result<bool> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        for table in ["positions", "trades", "diagnostics"] {
            tx.execute(
                &format!("DELETE FROM {} WHERE portfolio = ?1", table),
                params![name],
            )?;
        }
        let removed = tx.execute("DELETE FROM portfolios WHERE name = ?1", params![name])?;
        tx.commit()?;

        debug!(portfolio = %name, removed, "Portfolio deleted from store");
        Ok(removed > 0)
    }
}

fn parse_time(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

// ============================================================================
// Tests
// ============================================================================
