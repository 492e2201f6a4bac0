use axum::extract::Query;
use axum::routing::get;
use axum::{Json, Router};
use rand::Rng;
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;
use tracing_subscriber::EnvFilter;

const POSTS: u64 = 100;
const COMMENTS_PER_POST: u64 = 5;

#[derive(Deserialize)]
struct CommentsQuery {
    #[serde(rename = "postId")]
    post_id: Option<String>,
}

/// Comments for one post, or for every post when no id is given. Unknown
/// posts yield an empty array.
fn comments_for(post_id: Option<&str>) -> Vec<Value> {
    let posts = match post_id {
        None => 1..=POSTS,
        Some(id) => match id.parse::<u64>() {
            Ok(n) if (1..=POSTS).contains(&n) => n..=n,
            _ => return Vec::new(),
        },
    };

    posts
        .flat_map(|post| {
            (1..=COMMENTS_PER_POST).map(move |i| {
                let id = (post - 1) * COMMENTS_PER_POST + i;
                json!({
                    "postId": post,
                    "id": id,
                    "name": format!("comment {id} on post {post}"),
                    "email": format!("user{id}@example.com"),
                    "body": "x".repeat(128),
                })
            })
        })
        .collect()
}

async fn comments(Query(q): Query<CommentsQuery>) -> Json<Vec<Value>> {
    // Simulate upstream latency (20-80ms)
    let delay = rand::thread_rng().gen_range(20..=80);
    tokio::time::sleep(Duration::from_millis(delay)).await;

    let records = comments_for(q.post_id.as_deref());
    tracing::debug!(post_id = ?q.post_id, records = records.len(), latency_ms = delay, "served comments");
    Json(records)
}

async fn health() -> &'static str {
    "ok"
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let app = Router::new()
        .route("/comments", get(comments))
        .route("/health", get(health));

    let port = std::env::var("PORT").unwrap_or_else(|_| "3000".to_string());
    let addr = format!("0.0.0.0:{port}");
    tracing::info!(addr = %addr, "demo upstream starting");

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .unwrap_or_else(|e| panic!("failed to bind {addr}: {e}"));
    if let Err(e) = axum::serve(listener, app).await {
        tracing::error!(error = %e, "demo upstream stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_post_has_comments() {
        let records = comments_for(Some("3"));
        assert_eq!(records.len(), COMMENTS_PER_POST as usize);
        assert!(records.iter().all(|r| r["postId"] == 3));
        assert_eq!(records[0]["id"], 11);
    }

    #[test]
    fn unknown_post_is_empty() {
        assert!(comments_for(Some("0")).is_empty());
        assert!(comments_for(Some("101")).is_empty());
        assert!(comments_for(Some("abc")).is_empty());
    }

    #[test]
    fn no_filter_returns_everything() {
        assert_eq!(comments_for(None).len(), (POSTS * COMMENTS_PER_POST) as usize);
    }
}
