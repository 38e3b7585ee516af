use std::sync::Arc;

use sqlx::MySqlPool;
use sqlx_transaction_engine::backend::mysql::MySqlConnector;
use sqlx_transaction_engine::backend::Value;
use sqlx_transaction_engine::{AfterStage, CallContext, TransactionConfig, TransactionManager};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // .env is optional
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    // DATABASE_URL or a local default
    let database_url = std::env::var("DATABASE_URL")
        .unwrap_or_else(|_| "mysql://localhost/test".to_string());
    let pool = MySqlPool::connect(&database_url).await?;

    // TX_* variables override the defaults
    let config = TransactionConfig::from_env()?;
    let manager = TransactionManager::new(Arc::new(MySqlConnector::new(pool.clone())), config)?;
    manager.hooks().add_after_hook(AfterStage::Commit, |_ctx, session| {
        println!("   (committed transaction {})", session.transaction_id());
    });
    let ctx = CallContext::new();

    println!("=== Basic Transaction Example ===\n");

    // Example 1: Simple INSERT
    println!("1. Creating a user...");
    manager
        .execute_in_transaction(&ctx, |ctx, tx| {
            Box::pin(async move {
                tx.execute(
                    ctx,
                    "INSERT INTO users (name, email) VALUES (?, ?)",
                    &["Alice".into(), "alice@example.com".into()],
                )
                .await?;
                Ok(())
            })
        })
        .await?;
    println!("   ✓ User created successfully\n");

    // Example 2: Multiple operations in one transaction
    println!("2. Creating user with profile...");
    let user_id = manager
        .execute_in_transaction(&ctx, |ctx, tx| {
            Box::pin(async move {
                tx.execute(
                    ctx,
                    "INSERT INTO users (name, email) VALUES (?, ?)",
                    &["Bob".into(), "bob@example.com".into()],
                )
                .await?;

                let rows = tx.query(ctx, "SELECT LAST_INSERT_ID() AS id", &[]).await?;
                let user_id = match rows.first().and_then(|row| row.get("id")) {
                    Some(Value::Int(id)) => *id,
                    _ => 0,
                };

                // Insert profile (same transaction)
                tx.execute(
                    ctx,
                    "INSERT INTO profiles (user_id, bio) VALUES (?, ?)",
                    &[user_id.into(), "Software Developer".into()],
                )
                .await?;

                Ok(user_id)
            })
        })
        .await?;
    println!("   ✓ User and profile created with ID: {}\n", user_id);

    // Example 3: Fatal errors roll back without retrying
    println!("3. Testing automatic rollback on error...");
    let result = manager
        .execute_in_transaction(&ctx, |ctx, tx| {
            Box::pin(async move {
                tx.execute(
                    ctx,
                    "INSERT INTO users (name, email) VALUES (?, ?)",
                    &["Charlie".into(), "charlie@example.com".into()],
                )
                .await?;

                // This will cause an error
                tx.execute(ctx, "SELECT * FROM non_existent_table", &[]).await?;
                Ok(())
            })
        })
        .await;

    match result {
        Ok(_) => println!("   ✗ Should have failed!"),
        Err(e) => println!("   ✓ Transaction rolled back: {}\n", e),
    }

    // Example 4: Returning values from transactions
    println!("4. Returning values from transaction...");
    let (user_count, profile_count) = manager
        .execute_in_transaction(&ctx, |ctx, tx| {
            Box::pin(async move {
                let users = tx.query(ctx, "SELECT COUNT(*) AS n FROM users", &[]).await?;
                let profiles = tx.query(ctx, "SELECT COUNT(*) AS n FROM profiles", &[]).await?;
                let count = |rows: &[sqlx_transaction_engine::backend::Row]| match rows
                    .first()
                    .and_then(|row| row.get("n"))
                {
                    Some(Value::Int(n)) => *n,
                    _ => 0,
                };
                Ok((count(&users), count(&profiles)))
            })
        })
        .await?;
    println!("   Users: {}, Profiles: {}\n", user_count, profile_count);

    let stats = manager.connection_stats();
    println!(
        "Pool: {} opened, {} reused, {} idle",
        stats.opened, stats.reused, stats.idle_connections
    );
    println!("=== All examples completed successfully ===");

    manager.pool().close().await;
    pool.close().await;
    Ok(())
}
