//! Token database (C2): durable metadata and append-only change history.
//!
//! Every write to `token` happens in the same transaction as its
//! `token_change_history` row; a history-write failure rolls the token
//! write back. Reads are plain pool queries, not transactional.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};

use crate::error::{GatewayError, Result};
use crate::token::{HistoryAction, Token, TokenChangeHistoryEntry, TokenInfo, TokenType};

#[derive(Clone)]
pub struct TokenDatabase {
    pool: PgPool,
}

/// One page of change-history results plus the pagination metadata needed
/// to build `Link`/`X-Total-Count` response headers.
pub struct HistoryPage {
    pub entries: Vec<TokenChangeHistoryEntry>,
    pub count: i64,
    pub next_cursor: Option<String>,
    pub prev_cursor: Option<String>,
}

#[derive(Default)]
pub struct HistoryFilters {
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    pub username: Option<String>,
    pub actor: Option<String>,
    pub key: Option<String>,
    pub token_type: Option<TokenType>,
    pub ip_or_cidr: Option<String>,
    pub cursor: Option<String>,
    pub limit: Option<i64>,
}

struct Cursor {
    previous: bool,
    event_time: i64,
    id: i64,
}

impl Cursor {
    fn parse(raw: &str) -> Result<Cursor> {
        let (previous, rest) = match raw.strip_prefix('p') {
            Some(rest) => (true, rest),
            None => (false, raw),
        };
        let (time_part, id_part) = rest
            .split_once('_')
            .ok_or_else(|| GatewayError::BadCursor(format!("malformed cursor '{raw}'")))?;
        let event_time = time_part
            .parse::<i64>()
            .map_err(|_| GatewayError::BadCursor(format!("malformed cursor '{raw}'")))?;
        let id = id_part
            .parse::<i64>()
            .map_err(|_| GatewayError::BadCursor(format!("malformed cursor '{raw}'")))?;
        Ok(Cursor { previous, event_time, id })
    }

    fn encode(previous: bool, event_time: i64, id: i64) -> String {
        if previous {
            format!("p{event_time}_{id}")
        } else {
            format!("{event_time}_{id}")
        }
    }
}

/// Accepts a bare IP address or a CIDR block; rejects anything else.
pub fn validate_ip_or_cidr(value: &str) -> Result<()> {
    if value.parse::<std::net::IpAddr>().is_ok() {
        return Ok(());
    }
    if let Some((addr, prefix)) = value.split_once('/') {
        if addr.parse::<std::net::IpAddr>().is_ok() && prefix.parse::<u8>().is_ok() {
            return Ok(());
        }
    }
    Err(GatewayError::BadIpAddress(format!("invalid IP address or CIDR: {value}")))
}

impl TokenDatabase {
    pub fn new(pool: PgPool) -> TokenDatabase {
        TokenDatabase { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Insert the token row, its `create` history entry, and (for `internal`
    /// tokens) the idempotence fingerprint, all in one transaction.
    pub async fn insert_token(
        &self,
        token: &Token,
        token_name: Option<&str>,
        service: Option<&str>,
        internal_fingerprint: Option<&str>,
        actor: &str,
        ip: Option<&str>,
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "INSERT INTO token (token_key, username, token_type, token_name, scopes, \
             created_at, expires_at, parent_key, service) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)",
        )
        .bind(token.key())
        .bind(&token.username)
        .bind(token.token_type.as_str())
        .bind(token_name)
        .bind(scopes_vec(&token.scopes))
        .bind(token.created_at)
        .bind(token.expires_at)
        .bind(&token.parent_key)
        .bind(service)
        .execute(&mut *tx)
        .await
        .map_err(map_unique_violation)?;

        if let (Some(parent_key), Some(fingerprint)) = (&token.parent_key, internal_fingerprint) {
            sqlx::query(
                "INSERT INTO token_internal_fingerprint \
                 (token_key, parent_key, service, scope_fingerprint) VALUES ($1, $2, $3, $4)",
            )
            .bind(token.key())
            .bind(parent_key)
            .bind(service.unwrap_or_default())
            .bind(fingerprint)
            .execute(&mut *tx)
            .await
            .map_err(map_unique_violation)?;
        }

        insert_history(
            &mut tx,
            token.key(),
            &token.username,
            token.token_type,
            token_name,
            &token.scopes,
            token.expires_at,
            actor,
            HistoryAction::Create,
            ip,
            None,
            None,
            None,
        )
        .await?;

        tx.commit().await?;
        Ok(())
    }

    pub async fn find_internal_token_key(
        &self,
        parent_key: &str,
        service: &str,
        scope_fingerprint: &str,
    ) -> Result<Option<String>> {
        let row = sqlx::query(
            "SELECT f.token_key FROM token_internal_fingerprint f \
             JOIN token t ON t.token_key = f.token_key \
             WHERE f.parent_key = $1 AND f.service = $2 AND f.scope_fingerprint = $3 \
             AND t.revoked_at IS NULL",
        )
        .bind(parent_key)
        .bind(service)
        .bind(scope_fingerprint)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| r.get::<String, _>("token_key")))
    }

    pub async fn find_notebook_token_key(&self, parent_key: &str) -> Result<Option<String>> {
        let row = sqlx::query(
            "SELECT token_key FROM token WHERE parent_key = $1 AND token_type = 'notebook' \
             AND revoked_at IS NULL",
        )
        .bind(parent_key)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| r.get::<String, _>("token_key")))
    }

    pub async fn get_token_info(&self, key: &str) -> Result<Option<TokenInfo>> {
        let row = sqlx::query(
            "SELECT token_key, username, token_type, token_name, scopes, created_at, \
             expires_at, last_used_at, parent_key, service \
             FROM token WHERE token_key = $1 AND revoked_at IS NULL",
        )
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(row_to_token_info))
    }

    pub async fn list_tokens(&self, username: &str) -> Result<Vec<TokenInfo>> {
        let rows = sqlx::query(
            "SELECT token_key, username, token_type, token_name, scopes, created_at, \
             expires_at, last_used_at, parent_key, service \
             FROM token WHERE username = $1 AND revoked_at IS NULL ORDER BY created_at DESC",
        )
        .bind(username)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(row_to_token_info).collect())
    }

    pub async fn touch_last_used(&self, key: &str) -> Result<()> {
        sqlx::query("UPDATE token SET last_used_at = now() WHERE token_key = $1")
            .bind(key)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Update a `user` token's mutable fields, recording an `edit` history
    /// entry with `old_*` snapshots for whichever fields actually changed.
    #[allow(clippy::too_many_arguments)]
    pub async fn modify_user_token(
        &self,
        key: &str,
        new_name: Option<&str>,
        new_scopes: Option<&BTreeSet<String>>,
        new_expires: Option<Option<DateTime<Utc>>>,
        actor: &str,
        ip: Option<&str>,
    ) -> Result<Option<TokenInfo>> {
        let mut tx = self.pool.begin().await?;

        let current = sqlx::query(
            "SELECT username, token_type, token_name, scopes, expires_at FROM token \
             WHERE token_key = $1 AND revoked_at IS NULL FOR UPDATE",
        )
        .bind(key)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(current) = current else {
            tx.commit().await?;
            return Ok(None);
        };

        let username: String = current.get("username");
        let token_type: String = current.get("token_type");
        if token_type != TokenType::User.as_str() {
            return Err(GatewayError::PermissionDenied(
                "only user tokens are modifiable".into(),
            ));
        }
        let old_name: Option<String> = current.get("token_name");
        let old_scopes: Vec<String> = current.get("scopes");
        let old_scopes: BTreeSet<String> = old_scopes.into_iter().collect();
        let old_expires: Option<DateTime<Utc>> = current.get("expires_at");

        let name_to_set = new_name.unwrap_or(old_name.as_deref().unwrap_or(""));
        let scopes_to_set = new_scopes.cloned().unwrap_or_else(|| old_scopes.clone());
        let expires_to_set = new_expires.unwrap_or(old_expires);

        sqlx::query(
            "UPDATE token SET token_name = $2, scopes = $3, expires_at = $4 WHERE token_key = $1",
        )
        .bind(key)
        .bind(name_to_set)
        .bind(scopes_vec(&scopes_to_set))
        .bind(expires_to_set)
        .execute(&mut *tx)
        .await
        .map_err(map_unique_violation)?;

        insert_history(
            &mut tx,
            key,
            &username,
            TokenType::User,
            Some(name_to_set),
            &scopes_to_set,
            expires_to_set,
            actor,
            HistoryAction::Edit,
            ip,
            old_name.as_deref(),
            Some(&old_scopes),
            old_expires,
        )
        .await?;

        tx.commit().await?;
        self.get_token_info(key).await
    }

    /// Revoke a token and cascade to its live `notebook`/`internal` children,
    /// recording a `revoke` history entry for each. Returns every key that
    /// was revoked (parent first, then children) so the caller can evict all
    /// of them from the cache; an empty vec means the parent was already
    /// gone or already revoked.
    pub async fn revoke_token(&self, key: &str, actor: &str, ip: Option<&str>) -> Result<Vec<String>> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query(
            "SELECT username, token_type, token_name, scopes, expires_at FROM token \
             WHERE token_key = $1 AND revoked_at IS NULL FOR UPDATE",
        )
        .bind(key)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(row) = row else {
            tx.commit().await?;
            return Ok(Vec::new());
        };

        revoke_one(&mut tx, key, &row, actor, ip).await?;
        let mut revoked_keys = vec![key.to_string()];

        let children = sqlx::query(
            "SELECT token_key, username, token_type, token_name, scopes, expires_at FROM token \
             WHERE parent_key = $1 AND revoked_at IS NULL \
             AND token_type IN ('notebook', 'internal') FOR UPDATE",
        )
        .bind(key)
        .fetch_all(&mut *tx)
        .await?;

        for child in &children {
            let child_key: String = child.get("token_key");
            revoke_one(&mut tx, &child_key, child, actor, ip).await?;
            revoked_keys.push(child_key);
        }

        tx.commit().await?;
        Ok(revoked_keys)
    }

    pub async fn get_change_history(
        &self,
        filters: HistoryFilters,
    ) -> Result<HistoryPage> {
        if let Some(ip) = &filters.ip_or_cidr {
            validate_ip_or_cidr(ip)?;
        }

        let cursor = filters.cursor.as_deref().map(Cursor::parse).transpose()?;

        // Filter conditions are shared between the page query and the total
        // count; cursor and limit only bound the page, never the count.
        let mut filter_conditions = Vec::new();
        let mut idx = 1;
        macro_rules! next_param {
            () => {{
                let n = idx;
                idx += 1;
                n
            }};
        }

        if filters.since.is_some() {
            filter_conditions.push(format!(" AND event_time >= ${}", next_param!()));
        }
        if filters.until.is_some() {
            filter_conditions.push(format!(" AND event_time <= ${}", next_param!()));
        }
        if filters.username.is_some() {
            filter_conditions.push(format!(" AND username = ${}", next_param!()));
        }
        if filters.actor.is_some() {
            filter_conditions.push(format!(" AND actor = ${}", next_param!()));
        }
        if filters.key.is_some() {
            filter_conditions.push(format!(" AND token_key = ${}", next_param!()));
        }
        if filters.token_type.is_some() {
            filter_conditions.push(format!(" AND token_type = ${}", next_param!()));
        }
        if filters.ip_or_cidr.is_some() {
            filter_conditions.push(format!(" AND ip_address::inet <<= ${}::inet", next_param!()));
        }

        let mut sql = String::from(
            "SELECT token_key, username, token_type, token_name, scopes, expires_at, \
             actor, action, event_time, id, ip_address, old_token_name, old_scopes, old_expires_at \
             FROM token_change_history WHERE true",
        );
        sql.push_str(&filter_conditions.join(""));

        let mut page_conditions = Vec::new();
        if let Some(c) = &cursor {
            if c.previous {
                page_conditions.push(format!(
                    " AND (event_time, id) > (to_timestamp(${}), ${})",
                    next_param!(),
                    next_param!()
                ));
            } else {
                page_conditions.push(format!(
                    " AND (event_time, id) < (to_timestamp(${}), ${})",
                    next_param!(),
                    next_param!()
                ));
            }
        }
        sql.push_str(&page_conditions.join(""));
        sql.push_str(" ORDER BY event_time DESC, id DESC");
        if filters.limit.is_some() {
            sql.push_str(&format!(" LIMIT ${}", next_param!()));
        }

        let mut query = sqlx::query(&sql);
        if let Some(v) = filters.since {
            query = query.bind(v);
        }
        if let Some(v) = filters.until {
            query = query.bind(v);
        }
        if let Some(v) = &filters.username {
            query = query.bind(v);
        }
        if let Some(v) = &filters.actor {
            query = query.bind(v);
        }
        if let Some(v) = &filters.key {
            query = query.bind(v);
        }
        if let Some(v) = filters.token_type {
            query = query.bind(v.as_str());
        }
        if let Some(v) = &filters.ip_or_cidr {
            query = query.bind(v);
        }
        if let Some(c) = &cursor {
            query = query.bind(c.event_time as f64).bind(c.id);
        }
        if let Some(limit) = filters.limit {
            query = query.bind(limit);
        }

        let rows = query.fetch_all(&self.pool).await?;

        let count_sql = format!(
            "SELECT count(*) AS count FROM token_change_history WHERE true{}",
            filter_conditions.join("")
        );
        let mut count_query = sqlx::query(&count_sql);
        if let Some(v) = filters.since {
            count_query = count_query.bind(v);
        }
        if let Some(v) = filters.until {
            count_query = count_query.bind(v);
        }
        if let Some(v) = &filters.username {
            count_query = count_query.bind(v);
        }
        if let Some(v) = &filters.actor {
            count_query = count_query.bind(v);
        }
        if let Some(v) = &filters.key {
            count_query = count_query.bind(v);
        }
        if let Some(v) = filters.token_type {
            count_query = count_query.bind(v.as_str());
        }
        if let Some(v) = &filters.ip_or_cidr {
            count_query = count_query.bind(v);
        }
        let count: i64 = count_query.fetch_one(&self.pool).await?.get("count");

        let next_cursor = rows.last().map(|r| {
            let t: DateTime<Utc> = r.get("event_time");
            let id: i64 = r.get("id");
            Cursor::encode(false, t.timestamp(), id)
        });
        let prev_cursor = rows.first().map(|r| {
            let t: DateTime<Utc> = r.get("event_time");
            let id: i64 = r.get("id");
            Cursor::encode(true, t.timestamp(), id)
        });

        let entries = rows.into_iter().map(row_to_history_entry).collect();

        Ok(HistoryPage {
            entries,
            count,
            next_cursor,
            prev_cursor,
        })
    }

    pub async fn admins(&self) -> Result<Vec<String>> {
        let rows = sqlx::query("SELECT username FROM admin ORDER BY username")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(|r| r.get("username")).collect())
    }

    pub async fn is_admin(&self, username: &str) -> Result<bool> {
        let row = sqlx::query("SELECT 1 FROM admin WHERE username = $1")
            .bind(username)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.is_some())
    }

    pub async fn add_admin(&self, username: &str) -> Result<()> {
        sqlx::query("INSERT INTO admin (username) VALUES ($1) ON CONFLICT DO NOTHING")
            .bind(username)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn delete_admin(&self, username: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM admin WHERE username = $1")
            .bind(username)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Seed the admin table from configuration if it is currently empty.
    pub async fn bootstrap_admins(&self, initial_admins: &[String]) -> Result<()> {
        let existing = self.admins().await?;
        if !existing.is_empty() || initial_admins.is_empty() {
            return Ok(());
        }
        for username in initial_admins {
            self.add_admin(username).await?;
        }
        Ok(())
    }
}

async fn revoke_one(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    key: &str,
    row: &sqlx::postgres::PgRow,
    actor: &str,
    ip: Option<&str>,
) -> Result<()> {
    let username: String = row.get("username");
    let token_type: String = row.get("token_type");
    let token_name: Option<String> = row.get("token_name");
    let scopes: Vec<String> = row.get("scopes");
    let scopes: BTreeSet<String> = scopes.into_iter().collect();
    let expires_at: Option<DateTime<Utc>> = row.get("expires_at");

    sqlx::query("UPDATE token SET revoked_at = now() WHERE token_key = $1")
        .bind(key)
        .execute(&mut **tx)
        .await?;

    let token_type = match token_type.as_str() {
        "session" => TokenType::Session,
        "user" => TokenType::User,
        "notebook" => TokenType::Notebook,
        "internal" => TokenType::Internal,
        _ => TokenType::Service,
    };

    insert_history(
        tx,
        key,
        &username,
        token_type,
        token_name.as_deref(),
        &scopes,
        expires_at,
        actor,
        HistoryAction::Revoke,
        ip,
        None,
        None,
        None,
    )
    .await
}

#[allow(clippy::too_many_arguments)]
async fn insert_history(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    key: &str,
    username: &str,
    token_type: TokenType,
    token_name: Option<&str>,
    scopes: &BTreeSet<String>,
    expires_at: Option<DateTime<Utc>>,
    actor: &str,
    action: HistoryAction,
    ip: Option<&str>,
    old_token_name: Option<&str>,
    old_scopes: Option<&BTreeSet<String>>,
    old_expires_at: Option<DateTime<Utc>>,
) -> Result<()> {
    sqlx::query(
        "INSERT INTO token_change_history \
         (token_key, username, token_type, token_name, scopes, expires_at, actor, action, \
          ip_address, old_token_name, old_scopes, old_expires_at) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)",
    )
    .bind(key)
    .bind(username)
    .bind(token_type.as_str())
    .bind(token_name)
    .bind(scopes_vec(scopes))
    .bind(expires_at)
    .bind(actor)
    .bind(action.as_str())
    .bind(ip)
    .bind(old_token_name)
    .bind(old_scopes.map(scopes_vec))
    .bind(old_expires_at)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

fn scopes_vec(scopes: &BTreeSet<String>) -> Vec<String> {
    scopes.iter().cloned().collect()
}

fn row_to_token_info(row: sqlx::postgres::PgRow) -> TokenInfo {
    let scopes: Vec<String> = row.get("scopes");
    let token_type: String = row.get("token_type");
    TokenInfo {
        token: row.get("token_key"),
        username: row.get("username"),
        token_type: parse_token_type(&token_type),
        token_name: row.get("token_name"),
        scopes: scopes.into_iter().collect(),
        created: row.get("created_at"),
        expires: row.get("expires_at"),
        last_used: row.get("last_used_at"),
        parent: row.get("parent_key"),
        service: row.get("service"),
    }
}

fn row_to_history_entry(row: sqlx::postgres::PgRow) -> TokenChangeHistoryEntry {
    let scopes: Vec<String> = row.get("scopes");
    let old_scopes: Option<Vec<String>> = row.get("old_scopes");
    let token_type: String = row.get("token_type");
    let action: String = row.get("action");
    TokenChangeHistoryEntry {
        token: row.get("token_key"),
        username: row.get("username"),
        token_type: parse_token_type(&token_type),
        token_name: row.get("token_name"),
        scopes: scopes.into_iter().collect(),
        expires: row.get("expires_at"),
        actor: row.get("actor"),
        action: HistoryAction::parse(&action).unwrap_or(HistoryAction::Edit),
        event_time: row.get("event_time"),
        ip_address: row.get("ip_address"),
        old_token_name: row.get("old_token_name"),
        old_scopes: old_scopes.map(|v| v.into_iter().collect()),
        old_expires: row.get("old_expires_at"),
    }
}

fn parse_token_type(s: &str) -> TokenType {
    match s {
        "session" => TokenType::Session,
        "user" => TokenType::User,
        "notebook" => TokenType::Notebook,
        "internal" => TokenType::Internal,
        _ => TokenType::Service,
    }
}

fn map_unique_violation(err: sqlx::Error) -> GatewayError {
    if let sqlx::Error::Database(ref db_err) = err {
        if db_err.code().as_deref() == Some("23505") {
            return GatewayError::DuplicateTokenName;
        }
    }
    GatewayError::from(err)
}
