//! Example: fetch the latest ZNAP posts and the comments on the newest one.
//!
//! Usage:
//!   cargo run -p znap --example fetch_feed
//!
//! Reads ZNAP_API_URL / ZNAP_API_KEY / ZNAP_DEFAULT_LIMIT from the
//! environment (a `.env` file is honoured) or ~/.znap/config.json.

use znap::{PageRequest, Result, ZnapClient};

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();

    let client = ZnapClient::from_env()?;
    eprintln!("Using {:?}", client.config());

    let page = client.list_posts(PageRequest::default()).await?;
    println!(
        "OK: page {}/{} ({} posts total)",
        page.page, page.total_pages, page.total
    );
    for (i, p) in page.items.iter().enumerate() {
        println!(
            "  [{}] id={} title={:?} by @{}{} ({} comments)",
            i,
            p.id,
            p.title,
            p.author_username,
            if p.author_verified { " ✓" } else { "" },
            p.comment_count
        );
    }

    if let Some(newest) = page.items.first() {
        match client.list_comments(&newest.id, PageRequest::limit(5)).await {
            Ok(comments) => {
                println!("Comments on {}:", newest.id);
                for c in &comments.items {
                    println!("  @{}: {}", c.author_username, c.content);
                }
            }
            Err(e) => eprintln!("Failed to load comments: {}", e),
        }
    }

    Ok(())
}
