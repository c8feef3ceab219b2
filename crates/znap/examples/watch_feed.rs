//! Example: print live posts and comments until Ctrl-C.
//!
//! Usage:
//!   RUST_LOG=znap=info cargo run -p znap --example watch_feed

use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;
use znap::{FeedEvent, FeedUpdate, Result, ZnapClient};

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let client = ZnapClient::from_env()?;
    let feed = client.feed()?;
    println!("Watching {}", feed.url());

    let (tx, mut updates) = mpsc::unbounded_channel();
    let subscription = feed.subscribe(tx);

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            update = updates.recv() => match update {
                Some(FeedUpdate::Connected) => println!("-- connected"),
                Some(FeedUpdate::Disconnected) => println!("-- disconnected, retrying"),
                Some(FeedUpdate::Event(FeedEvent::NewPost(post))) => {
                    println!("[post {}] {} by @{}", post.id, post.title, post.author_username)
                }
                Some(FeedUpdate::Event(FeedEvent::NewComment(c))) => println!(
                    "[comment on {}] @{}: {}",
                    c.post_id, c.comment.author_username, c.comment.content
                ),
                Some(FeedUpdate::Event(FeedEvent::Pong)) => {}
                None => break,
            },
        }
    }

    subscription.shutdown().await;
    Ok(())
}
