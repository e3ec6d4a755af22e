use uuid::Uuid;

use crate::auth::hash_password;
use crate::config::Config;
use crate::db::Db;

/// Seeds the admin account named by `ADMIN_USERNAME`.
/// Safe to call on every startup — existence is checked before inserting.
pub async fn seed_accounts(pool: &Db, config: &Config) -> anyhow::Result<()> {
    seed_admin(pool, config).await?;

    Ok(())
}

async fn seed_admin(pool: &Db, config: &Config) -> anyhow::Result<()> {
    let existing: Option<String> = sqlx::query_scalar(
        "SELECT id FROM users WHERE username = ? AND role = 'admin' LIMIT 1",
    )
    .bind(&config.admin_username)
    .fetch_optional(pool)
    .await?;

    match existing {
        Some(id) => {
            // Keep the development login predictable; production passwords are left alone.
            if config.is_development() {
                let hash = hash_password(&config.admin_password)?;
                sqlx::query("UPDATE users SET password_hash = ?, updated_at = UTC_TIMESTAMP() WHERE id = ?")
                    .bind(hash)
                    .bind(&id)
                    .execute(pool)
                    .await?;
                tracing::debug!(username = %config.admin_username, "Refreshed development admin password");
            }
        }

        None => {
            let hash = hash_password(&config.admin_password)?;
            let id = Uuid::new_v4().to_string();
            sqlx::query(
                "INSERT INTO users (id, username, first_name, last_name, password_hash, role, cycle, school_grade, is_active, created_at, updated_at)
                 VALUES (?, ?, 'School', 'Admin', ?, 'admin', 'general', '', 1, UTC_TIMESTAMP(), UTC_TIMESTAMP())"
            )
            .bind(id)
            .bind(&config.admin_username)
            .bind(hash)
            .execute(pool)
            .await?;
            tracing::info!(username = %config.admin_username, "Seeded admin account");
        }
    }

    Ok(())
}
