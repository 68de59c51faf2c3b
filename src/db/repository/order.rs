//! Voucher Order Repository

use super::RepoResult;
use crate::db::models::VoucherOrder;
use sqlx::SqlitePool;

pub async fn find_by_id(pool: &SqlitePool, id: i64) -> RepoResult<Option<VoucherOrder>> {
    let order = sqlx::query_as::<_, VoucherOrder>(
        "SELECT id, user_id, voucher_id, created_at FROM voucher_order WHERE id = ?",
    )
    .bind(id)
    .fetch_optional(pool)
    .await?;
    Ok(order)
}

/// 一人一单的存在性检查（幂等落库的快速短路）
pub async fn exists_by_user_and_voucher(
    conn: &mut sqlx::SqliteConnection,
    user_id: i64,
    voucher_id: i64,
) -> RepoResult<bool> {
    let count: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM voucher_order WHERE user_id = ? AND voucher_id = ?",
    )
    .bind(user_id)
    .bind(voucher_id)
    .fetch_one(conn)
    .await?;
    Ok(count > 0)
}

pub async fn insert(conn: &mut sqlx::SqliteConnection, order: &VoucherOrder) -> RepoResult<()> {
    sqlx::query(
        "INSERT INTO voucher_order (id, user_id, voucher_id, created_at) VALUES (?, ?, ?, ?)",
    )
    .bind(order.id)
    .bind(order.user_id)
    .bind(order.voucher_id)
    .bind(order.created_at)
    .execute(conn)
    .await?;
    Ok(())
}

pub async fn count_by_voucher(pool: &SqlitePool, voucher_id: i64) -> RepoResult<i64> {
    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM voucher_order WHERE voucher_id = ?")
        .bind(voucher_id)
        .fetch_one(pool)
        .await?;
    Ok(count)
}
