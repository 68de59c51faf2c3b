//! Voucher Repository

use super::{RepoError, RepoResult};
use crate::db::models::Voucher;
use crate::utils::now_millis;
use sqlx::SqlitePool;

/// 新建优惠券的入参
#[derive(Debug, Clone)]
pub struct VoucherCreate {
    pub id: i64,
    pub shop_id: i64,
    pub title: String,
    pub stock: i64,
    pub active_from: i64,
    pub active_until: i64,
}

pub async fn find_by_id(pool: &SqlitePool, id: i64) -> RepoResult<Option<Voucher>> {
    let voucher = sqlx::query_as::<_, Voucher>(
        "SELECT id, shop_id, title, stock, active_from, active_until, created_at FROM voucher WHERE id = ?",
    )
    .bind(id)
    .fetch_optional(pool)
    .await?;
    Ok(voucher)
}

pub async fn create(pool: &SqlitePool, data: VoucherCreate) -> RepoResult<Voucher> {
    if data.stock < 0 {
        return Err(RepoError::Validation(format!(
            "Stock cannot be negative: {}",
            data.stock
        )));
    }
    if data.active_until <= data.active_from {
        return Err(RepoError::Validation(
            "Active window must end after it starts".into(),
        ));
    }

    let now = now_millis();
    sqlx::query(
        "INSERT INTO voucher (id, shop_id, title, stock, active_from, active_until, created_at) VALUES (?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(data.id)
    .bind(data.shop_id)
    .bind(&data.title)
    .bind(data.stock)
    .bind(data.active_from)
    .bind(data.active_until)
    .bind(now)
    .execute(pool)
    .await?;

    find_by_id(pool, data.id)
        .await?
        .ok_or_else(|| RepoError::Database("Failed to create voucher".into()))
}

/// CAS 扣减权威库存
///
/// `stock > 0` 作为比较条件，行数为 0 表示比较失败（库存已尽或
/// 行不存在）。这是落库路径唯一允许的库存写入。
pub async fn decrement_stock(
    conn: &mut sqlx::SqliteConnection,
    id: i64,
) -> RepoResult<bool> {
    let rows = sqlx::query("UPDATE voucher SET stock = stock - 1 WHERE id = ? AND stock > 0")
        .bind(id)
        .execute(conn)
        .await?;
    Ok(rows.rows_affected() > 0)
}
