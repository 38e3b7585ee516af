use std::sync::Arc;
use std::time::Duration;

use sqlx::MySqlPool;
use sqlx_transaction_engine::backend::mysql::MySqlConnector;
use sqlx_transaction_engine::backend::Value;
use sqlx_transaction_engine::{CallContext, Session, TransactionConfig, TransactionManager};
use tracing_subscriber::EnvFilter;

async fn last_insert_id(ctx: &CallContext, tx: &Session) -> sqlx_transaction_engine::Result<i64> {
    let rows = tx.query(ctx, "SELECT LAST_INSERT_ID() AS id", &[]).await?;
    Ok(match rows.first().and_then(|row| row.get("id")) {
        Some(Value::Int(id)) => *id,
        _ => 0,
    })
}

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

    let manager = TransactionManager::new(
        Arc::new(MySqlConnector::new(pool.clone())),
        TransactionConfig::default()
            .with_tracing(true)
            .with_initial_delay(Duration::from_millis(50)),
    )?;
    let ctx = CallContext::new().with_timeout(Duration::from_secs(10));

    println!("=== Nested Transaction (Savepoint) Example ===\n");

    // Example 1: Successful nested transaction
    println!("1. Nested transaction - both succeed...");
    manager
        .execute_in_transaction(&ctx, |ctx, tx| {
            let manager = manager.clone();
            Box::pin(async move {
                // Outer transaction: create user
                tx.execute(
                    ctx,
                    "INSERT INTO users (name, email) VALUES (?, ?)",
                    &["David".into(), "david@example.com".into()],
                )
                .await?;
                let user_id = last_insert_id(ctx, tx).await?;
                println!("   Outer: Created user with ID {}", user_id);

                // Nested transaction: create audit log
                manager
                    .execute_in_transaction(ctx, |ctx, nested| {
                        Box::pin(async move {
                            nested
                                .execute(
                                    ctx,
                                    "INSERT INTO audit_log (user_id, action) VALUES (?, ?)",
                                    &[user_id.into(), "User created".into()],
                                )
                                .await?;
                            println!("   Nested: Created audit log (level {})", nested.nest_level());
                            Ok(())
                        })
                    })
                    .await?;

                println!("   ✓ Both transactions committed\n");
                Ok(())
            })
        })
        .await?;

    // Example 2: Nested transaction fails, outer succeeds
    println!("2. Nested transaction fails, outer succeeds...");
    manager
        .execute_in_transaction(&ctx, |ctx, tx| {
            let manager = manager.clone();
            Box::pin(async move {
                tx.execute(
                    ctx,
                    "INSERT INTO users (name, email) VALUES (?, ?)",
                    &["Eve".into(), "eve@example.com".into()],
                )
                .await?;
                let user_id = last_insert_id(ctx, tx).await?;
                println!("   Outer: Created user with ID {}", user_id);

                // Only the nested insert is rolled back to its savepoint
                let nested_result = manager
                    .execute_in_transaction(ctx, |ctx, nested| {
                        Box::pin(async move {
                            nested
                                .execute(ctx, "INSERT INTO non_existent_table VALUES (?)", &[user_id.into()])
                                .await?;
                            Ok(())
                        })
                    })
                    .await;

                match nested_result {
                    Ok(_) => println!("   ✗ Nested should have failed!"),
                    Err(e) => println!("   Nested: Failed ({})", e),
                }

                println!("   Outer: Continuing despite nested failure (state: {})...", tx.state());
                println!("   ✓ Outer transaction committed (user created)\n");
                Ok(())
            })
        })
        .await?;

    // Example 3: Multiple nested transactions, each with its own savepoint
    println!("3. Multiple nested transactions...");
    manager
        .execute_in_transaction(&ctx, |ctx, tx| {
            let manager = manager.clone();
            Box::pin(async move {
                tx.execute(
                    ctx,
                    "INSERT INTO users (name, email) VALUES (?, ?)",
                    &["Frank".into(), "frank@example.com".into()],
                )
                .await?;
                let user_id = last_insert_id(ctx, tx).await?;
                println!("   Outer: Created user with ID {}", user_id);

                manager
                    .execute_in_transaction(ctx, |ctx, nested| {
                        Box::pin(async move {
                            nested
                                .execute(
                                    ctx,
                                    "INSERT INTO profiles (user_id, bio) VALUES (?, ?)",
                                    &[user_id.into(), "Data Scientist".into()],
                                )
                                .await?;
                            println!("   Nested 1: Created profile");
                            Ok(())
                        })
                    })
                    .await?;

                manager
                    .execute_in_transaction(ctx, |ctx, nested| {
                        Box::pin(async move {
                            nested
                                .execute(
                                    ctx,
                                    "INSERT INTO audit_log (user_id, action) VALUES (?, ?)",
                                    &[user_id.into(), "Profile created".into()],
                                )
                                .await?;
                            println!("   Nested 2: Created audit log");
                            Ok(())
                        })
                    })
                    .await?;

                println!("   ✓ All transactions committed\n");
                Ok(())
            })
        })
        .await?;

    println!("=== All nested transaction examples completed ===");

    manager.pool().close().await;
    pool.close().await;
    Ok(())
}
