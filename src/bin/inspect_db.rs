use chrono::{DateTime, Utc};
use sqlx::Row;
use sqlx::sqlite::SqlitePoolOptions;
use std::env;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let args: Vec<String> = env::args().collect();
    if args.len() < 2 {
        eprintln!("Usage: {} <search_query> [database_url]", args[0]);
        eprintln!("Search query matches against sender, subject or Message-ID.");
        std::process::exit(1);
    }

    let query = &args[1];
    let search_term = format!("%{}%", query);

    let database_url = args
        .get(2)
        .cloned()
        .or_else(|| env::var("MAILSYNC_DATABASE_URL").ok())
        .unwrap_or_else(|| "sqlite:mailsync.db".to_string());
    let pool = SqlitePoolOptions::new()
        .connect(&database_url)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to connect to database: {}", e))?;

    let row = sqlx::query(
        "SELECT id, user_id, message_id, from_address, subject, received_at, ai_category, body_text
         FROM emails
         WHERE from_address LIKE ? OR subject LIKE ? OR message_id LIKE ?
         ORDER BY received_at DESC
         LIMIT 1",
    )
    .bind(&search_term)
    .bind(&search_term)
    .bind(&search_term)
    .fetch_optional(&pool)
    .await?;

    let Some(row) = row else {
        println!("No emails found matching '{}'", query);
        return Ok(());
    };

    let id: i64 = row.get("id");
    let user_id: i64 = row.get("user_id");
    let message_id: String = row.get("message_id");
    let from: String = row.get("from_address");
    let subject: String = row.get("subject");
    let received_at: DateTime<Utc> = row.get("received_at");
    let category: Option<String> = row.get("ai_category");
    let body_text: Option<String> = row.get("body_text");

    println!("Found Email:");
    println!("ID: {} (user {})", id, user_id);
    println!("Message-ID: {}", message_id);
    println!("From: {}", from);
    println!("Subject: {}", subject);
    println!("Received: {}", received_at.to_rfc3339());
    println!("Category: {:?}", category);
    println!(
        "--------------------------------------------------------------------------------"
    );
    match body_text {
        Some(text) => {
            println!("BODY ({} chars, raw debug):", text.chars().count());
            println!("{:?}", text);
            println!(
                "--------------------------------------------------------------------------------"
            );
            println!("BODY (display):");
            println!("{}", text);
        }
        None => println!("BODY: (None)"),
    }
    println!(
        "--------------------------------------------------------------------------------"
    );

    Ok(())
}
