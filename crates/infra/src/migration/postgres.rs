//! Postgres-backed permanent order store.
//!
//! ## Error Mapping
//!
//! | SQLx Error | SQLSTATE | PermanentStoreError |
//! |------------|----------|---------------------|
//! | Database (data exception) | `22xxx` | `Rejected` |
//! | Database (integrity constraint) | `23xxx` | `Rejected` |
//! | Database (other) / Io / Pool* | any | `Unavailable` |
//!
//! A unique violation on `orders.staging_id` is not an error: a concurrent
//! writer already migrated the same staged order and its id is returned.

use async_trait::async_trait;
use sqlx::{PgPool, Postgres, Transaction};
use std::sync::Arc;
use tracing::{debug, instrument};

use orderflow_core::{PermanentOrderId, StagingId};

use super::store::{NewCustomer, NewPermanentOrder, PermanentStore, PermanentStoreError};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS customers (
    id          BIGSERIAL PRIMARY KEY,
    name        TEXT NOT NULL,
    email       TEXT NULL,
    phone       TEXT NULL,
    created_at  TIMESTAMPTZ NOT NULL DEFAULT now()
);
CREATE INDEX IF NOT EXISTS customers_email_idx ON customers (email);
CREATE INDEX IF NOT EXISTS customers_phone_idx ON customers (phone);

CREATE TABLE IF NOT EXISTS restaurants (
    id          BIGSERIAL PRIMARY KEY,
    name        TEXT NOT NULL UNIQUE
);

CREATE TABLE IF NOT EXISTS menu_items (
    id              BIGSERIAL PRIMARY KEY,
    restaurant_id   BIGINT NOT NULL REFERENCES restaurants (id),
    name            TEXT NOT NULL,
    price_cents     BIGINT NOT NULL CHECK (price_cents >= 0),
    UNIQUE (restaurant_id, name)
);

CREATE TABLE IF NOT EXISTS orders (
    id              BIGSERIAL PRIMARY KEY,
    staging_id      TEXT NOT NULL UNIQUE,
    customer_id     BIGINT NOT NULL REFERENCES customers (id),
    restaurant_id   BIGINT NOT NULL REFERENCES restaurants (id),
    subtotal_cents  BIGINT NOT NULL,
    tax_cents       BIGINT NOT NULL,
    fee_cents       BIGINT NOT NULL,
    total_cents     BIGINT NOT NULL,
    status          TEXT NOT NULL DEFAULT 'paid',
    paid_at         TIMESTAMPTZ NULL,
    placed_at       TIMESTAMPTZ NOT NULL
);

CREATE TABLE IF NOT EXISTS order_items (
    id                    BIGSERIAL PRIMARY KEY,
    order_id              BIGINT NOT NULL REFERENCES orders (id),
    menu_item_id          BIGINT NOT NULL REFERENCES menu_items (id),
    quantity              INTEGER NOT NULL CHECK (quantity > 0),
    unit_price_cents      BIGINT NOT NULL CHECK (unit_price_cents >= 0),
    special_instructions  TEXT NULL
);
"#;

/// Postgres-backed permanent store.
///
/// All writes for one order happen in a single transaction; any error rolls
/// the whole order back when the transaction is dropped.
#[derive(Debug, Clone)]
pub struct PostgresPermanentStore {
    pool: Arc<PgPool>,
}

impl PostgresPermanentStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool: Arc::new(pool) }
    }

    pub async fn ensure_schema(&self) -> Result<(), PermanentStoreError> {
        sqlx::raw_sql(SCHEMA)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("ensure_schema", e))?;
        Ok(())
    }

    async fn resolve_customer(
        tx: &mut Transaction<'_, Postgres>,
        customer: &NewCustomer,
    ) -> Result<i64, PermanentStoreError> {
        let lookups = [
            ("email", customer.email.as_deref()),
            ("phone", customer.phone.as_deref()),
            ("name", Some(customer.name.as_str())),
        ];
        for (column, value) in lookups {
            let Some(value) = value else { continue };
            let sql = format!("SELECT id FROM customers WHERE {column} = $1 ORDER BY id LIMIT 1");
            let found: Option<(i64,)> = sqlx::query_as(&sql)
                .bind(value)
                .fetch_optional(&mut **tx)
                .await
                .map_err(|e| map_sqlx_error("resolve_customer", e))?;
            if let Some((id,)) = found {
                return Ok(id);
            }
        }

        let (id,): (i64,) =
            sqlx::query_as("INSERT INTO customers (name, email, phone) VALUES ($1, $2, $3) RETURNING id")
                .bind(&customer.name)
                .bind(&customer.email)
                .bind(&customer.phone)
                .fetch_one(&mut **tx)
                .await
                .map_err(|e| map_sqlx_error("insert_customer", e))?;
        Ok(id)
    }

    async fn resolve_restaurant(
        tx: &mut Transaction<'_, Postgres>,
        name: &str,
    ) -> Result<i64, PermanentStoreError> {
        let (id,): (i64,) = sqlx::query_as(
            r#"
            INSERT INTO restaurants (name) VALUES ($1)
            ON CONFLICT (name) DO UPDATE SET name = EXCLUDED.name
            RETURNING id
            "#,
        )
        .bind(name)
        .fetch_one(&mut **tx)
        .await
        .map_err(|e| map_sqlx_error("resolve_restaurant", e))?;
        Ok(id)
    }

    async fn resolve_menu_item(
        tx: &mut Transaction<'_, Postgres>,
        restaurant_id: i64,
        name: &str,
        price_cents: i64,
    ) -> Result<i64, PermanentStoreError> {
        let (id,): (i64,) = sqlx::query_as(
            r#"
            INSERT INTO menu_items (restaurant_id, name, price_cents) VALUES ($1, $2, $3)
            ON CONFLICT (restaurant_id, name) DO UPDATE SET name = EXCLUDED.name
            RETURNING id
            "#,
        )
        .bind(restaurant_id)
        .bind(name)
        .bind(price_cents)
        .fetch_one(&mut **tx)
        .await
        .map_err(|e| map_sqlx_error("resolve_menu_item", e))?;
        Ok(id)
    }
}

#[async_trait]
impl PermanentStore for PostgresPermanentStore {
    #[instrument(skip(self, order), fields(staging_id = %order.staging_id), err)]
    async fn insert_order(&self, order: &NewPermanentOrder) -> Result<PermanentOrderId, PermanentStoreError> {
        if let Some(existing) = self.find_by_staging_id(&order.staging_id).await? {
            debug!(permanent_order_id = %existing, "order already migrated");
            return Ok(existing);
        }

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        let customer_id = Self::resolve_customer(&mut tx, &order.customer).await?;
        let restaurant_id = Self::resolve_restaurant(&mut tx, &order.restaurant_name).await?;

        let inserted: Result<(i64,), sqlx::Error> = sqlx::query_as(
            r#"
            INSERT INTO orders (
                staging_id, customer_id, restaurant_id,
                subtotal_cents, tax_cents, fee_cents, total_cents, paid_at, placed_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            RETURNING id
            "#,
        )
        .bind(order.staging_id.as_str())
        .bind(customer_id)
        .bind(restaurant_id)
        .bind(order.pricing.subtotal.cents())
        .bind(order.pricing.tax.cents())
        .bind(order.pricing.fee.cents())
        .bind(order.pricing.total.cents())
        .bind(order.paid_at)
        .bind(order.placed_at)
        .fetch_one(&mut *tx)
        .await;

        let order_id = match inserted {
            Ok((id,)) => id,
            Err(e) if is_unique_violation(&e) => {
                // Lost the race to a concurrent migration of the same staged order.
                drop(tx);
                return self
                    .find_by_staging_id(&order.staging_id)
                    .await?
                    .ok_or_else(|| {
                        PermanentStoreError::Unavailable("order vanished after unique violation".into())
                    });
            }
            Err(e) => return Err(map_sqlx_error("insert_order", e)),
        };

        for line in &order.lines {
            let quantity = i32::try_from(line.quantity).map_err(|_| {
                PermanentStoreError::Rejected(format!(
                    "quantity {} of {:?} does not fit the order_items column",
                    line.quantity, line.item_name
                ))
            })?;
            let menu_item_id = Self::resolve_menu_item(
                &mut tx,
                restaurant_id,
                &line.item_name,
                line.unit_price.cents(),
            )
            .await?;

            sqlx::query(
                r#"
                INSERT INTO order_items (order_id, menu_item_id, quantity, unit_price_cents, special_instructions)
                VALUES ($1, $2, $3, $4, $5)
                "#,
            )
            .bind(order_id)
            .bind(menu_item_id)
            .bind(quantity)
            .bind(line.unit_price.cents())
            .bind(&line.special_instructions)
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("insert_order_item", e))?;
        }

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;

        Ok(PermanentOrderId(order_id))
    }

    async fn find_by_staging_id(
        &self,
        staging_id: &StagingId,
    ) -> Result<Option<PermanentOrderId>, PermanentStoreError> {
        let row: Option<(i64,)> = sqlx::query_as("SELECT id FROM orders WHERE staging_id = $1")
            .bind(staging_id.as_str())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("find_by_staging_id", e))?;
        Ok(row.map(|(id,)| PermanentOrderId(id)))
    }
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    if let sqlx::Error::Database(db_err) = err {
        if let Some(code) = db_err.code() {
            return code.as_ref() == "23505";
        }
    }
    false
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> PermanentStoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {}: {}", operation, db_err.message());
            match db_err.code() {
                Some(code) if code.starts_with("22") || code.starts_with("23") => {
                    PermanentStoreError::Rejected(msg)
                }
                _ => PermanentStoreError::Unavailable(msg),
            }
        }
        sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) => {
            PermanentStoreError::Rejected(format!("decode error in {}: {}", operation, err))
        }
        sqlx::Error::PoolClosed => {
            PermanentStoreError::Unavailable(format!("connection pool closed in {}", operation))
        }
        _ => PermanentStoreError::Unavailable(format!("sqlx error in {}: {}", operation, err)),
    }
}
