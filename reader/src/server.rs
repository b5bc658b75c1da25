use std::sync::Arc;

use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use rocket::futures::{SinkExt, StreamExt};
use rocket::http::Status;
use rocket::serde::json::Json;
use rocket::{delete, get, post, routes, Build, Rocket, State};
use rocket_ws::{Channel, Message, WebSocket};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use tracing::{debug, error, info};

use common::Config;

use crate::breaking::SchedulerState;
use crate::ingestion::PollReport;
use crate::model::{Feed, Item, Keyword, KeywordMode};
use crate::shutdown::Shutdown;
use crate::storage;
use crate::ticker::Ticker;
use crate::views::{UserHeadline, Views};
use crate::worker::Updater;

/// Upper bound for `limit` on item pages.
const MAX_PAGE_SIZE: i64 = 500;

/// Application state stored inside Rocket managed state.
#[derive(Clone)]
pub struct AppState {
    pub started_at: DateTime<Utc>,
    pub config: Arc<Config>,
    pub db: SqlitePool,
    pub views: Views,
    pub ticker: Ticker,
    pub updater: Updater,
    pub shutdown: Shutdown,
}

#[derive(Serialize)]
struct StatusResponse {
    status: &'static str,
    uptime_seconds: i64,
    items: i64,
    cached_views: usize,
    ticker_subscribers: usize,
    scoring: &'static str,
    scoring_tokens_spent: i64,
}

#[derive(Deserialize)]
struct FeedCreate {
    name: String,
    abbr: String,
    url: String,
}

#[derive(Deserialize)]
struct KeywordCreate {
    mode: KeywordMode,
    text: String,
    annotation: Option<String>,
}

fn internal(context: &'static str) -> impl FnOnce(anyhow::Error) -> Status {
    move |e| {
        error!("server: {}: {:#}", context, e);
        Status::InternalServerError
    }
}

#[get("/health")]
async fn health() -> &'static str {
    "OK"
}

#[get("/api/status")]
async fn status(state: &State<AppState>) -> Result<Json<StatusResponse>, Status> {
    let items = storage::count_items(&state.db)
        .await
        .map_err(internal("failed to count items"))?;
    let tokens = storage::scoring_tokens_spent(&state.db)
        .await
        .map_err(internal("failed to sum scoring tokens"))?;
    let scoring = match state.updater.scheduler().map(|s| s.state()) {
        None => "disabled",
        Some(SchedulerState::Idle) => "idle",
        Some(SchedulerState::Armed) => "armed",
        Some(SchedulerState::Scoring) => "scoring",
    };

    Ok(Json(StatusResponse {
        status: "ok",
        uptime_seconds: (Utc::now() - state.started_at).num_seconds(),
        items,
        cached_views: state.views.cache().len(),
        ticker_subscribers: state.ticker.subscriber_count(),
        scoring,
        scoring_tokens_spent: tokens,
    }))
}

#[get("/api/feeds")]
async fn list_feeds(state: &State<AppState>) -> Result<Json<Vec<Feed>>, Status> {
    let feeds = state
        .views
        .feeds()
        .await
        .map_err(internal("failed to load feeds"))?;
    Ok(Json(feeds.as_ref().clone()))
}

#[post("/api/feeds", data = "<body>")]
async fn create_feed(state: &State<AppState>, body: Json<FeedCreate>) -> Result<Json<Feed>, Status> {
    state
        .views
        .create_feed(&body.name, &body.abbr, &body.url)
        .await
        .map(Json)
        .map_err(|e| {
            info!("server: feed rejected: {:#}", e);
            Status::BadRequest
        })
}

#[delete("/api/feeds/<id>")]
async fn delete_feed(state: &State<AppState>, id: i64) -> Status {
    match state.views.delete_feed(id).await {
        Ok(true) => Status::NoContent,
        Ok(false) => Status::NotFound,
        Err(e) => internal("failed to delete feed")(e),
    }
}

/// One page of items, newest first. `page` starts at 1; `since` is a unix
/// timestamp (0 or absent = now). With `user`, items carry that user's
/// keyword match.
#[get("/api/items?<filter>&<page>&<limit>&<since>&<user>")]
async fn list_items(
    state: &State<AppState>,
    filter: Option<&str>,
    page: Option<i64>,
    limit: Option<i64>,
    since: Option<i64>,
    user: Option<&str>,
) -> Result<Json<Vec<UserHeadline>>, Status> {
    let filter = filter.unwrap_or_default();
    let limit = limit
        .unwrap_or(state.config.server.results_per_page)
        .clamp(1, MAX_PAGE_SIZE);
    let offset = (page.unwrap_or(1).max(1) - 1)
        .checked_mul(limit)
        .ok_or(Status::BadRequest)?;
    let since = since.unwrap_or(0).max(0);

    let headlines = match user {
        Some(user) => state
            .views
            .headlines_for_user(user, filter, limit, offset, since)
            .await,
        None => state.views.items(filter, limit, offset, since).await.map(|items| {
            items
                .iter()
                .map(|item| UserHeadline {
                    item: item.clone(),
                    keyword_mode: None,
                    keyword: None,
                })
                .collect()
        }),
    };
    headlines.map(Json).map_err(internal("failed to load items"))
}

/// Run one poll cycle now and report what it did.
#[post("/api/update")]
async fn trigger_update(state: &State<AppState>) -> Result<Json<PollReport>, Status> {
    info!("server: manual update requested");
    state
        .updater
        .run_update_cycle()
        .await
        .map(Json)
        .map_err(internal("update failed"))
}

#[get("/api/keywords/<user>")]
async fn list_keywords(state: &State<AppState>, user: &str) -> Result<Json<Vec<Keyword>>, Status> {
    let list = state
        .views
        .keywords(user)
        .await
        .map_err(internal("failed to load keywords"))?;
    Ok(Json(list.0.clone()))
}

#[post("/api/keywords/<user>", data = "<body>")]
async fn add_keyword(
    state: &State<AppState>,
    user: &str,
    body: Json<KeywordCreate>,
) -> Result<Json<Keyword>, Status> {
    let text = body.text.trim();
    if text.is_empty() {
        return Err(Status::BadRequest);
    }
    state
        .views
        .add_keyword(user, body.mode, text, body.annotation.as_deref())
        .await
        .map(Json)
        .map_err(internal("failed to add keyword"))
}

#[delete("/api/keywords/<user>/<id>")]
async fn delete_keyword(state: &State<AppState>, user: &str, id: i64) -> Status {
    match state.views.delete_keyword(user, id).await {
        Ok(true) => Status::NoContent,
        Ok(false) => Status::NotFound,
        Err(e) => internal("failed to delete keyword")(e),
    }
}

#[get("/api/saved/<user>")]
async fn list_saved(state: &State<AppState>, user: &str) -> Result<Json<Vec<Item>>, Status> {
    let items = state
        .views
        .saved(user)
        .await
        .map_err(internal("failed to load saved items"))?;
    Ok(Json(items.as_ref().clone()))
}

#[post("/api/saved/<user>/<item_id>")]
async fn save_item(state: &State<AppState>, user: &str, item_id: i64) -> Status {
    match state.views.save_item(user, item_id).await {
        Ok(true) => Status::NoContent,
        Ok(false) => Status::NotFound,
        Err(e) => internal("failed to save item")(e),
    }
}

#[delete("/api/saved/<user>/<item_id>")]
async fn delete_saved(state: &State<AppState>, user: &str, item_id: i64) -> Status {
    match state.views.delete_saved_item(user, item_id).await {
        Ok(true) => Status::NoContent,
        Ok(false) => Status::NotFound,
        Err(e) => internal("failed to remove saved item")(e),
    }
}

/// Live ticker: every newly stored item is pushed as a JSON text frame.
#[get("/ticker")]
fn ticker_websocket(ws: WebSocket, state: &State<AppState>) -> Channel<'static> {
    let ticker = state.ticker.clone();
    let shutdown = state.shutdown.clone();

    ws.channel(move |stream| {
        Box::pin(async move {
            let (mut sink, mut incoming) = stream.split();
            let id = uuid::Uuid::new_v4().to_string();
            let mut items = ticker.subscribe(id.clone());
            info!(subscriber = %id, "WebSocket ticker connected");

            loop {
                tokio::select! {
                    _ = shutdown.wait() => break,
                    item = items.recv() => {
                        let Some(item) = item else { break };
                        let frame = match serde_json::to_string(&item) {
                            Ok(frame) => frame,
                            Err(e) => {
                                error!("failed to encode ticker item: {}", e);
                                continue;
                            }
                        };
                        if let Err(e) = sink.send(Message::Text(frame)).await {
                            debug!(subscriber = %id, "ticker send failed: {}", e);
                            break;
                        }
                    }
                    frame = incoming.next() => match frame {
                        Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break,
                        Some(Ok(_)) => {}
                    }
                }
            }

            ticker.unsubscribe(&id);
            info!(subscriber = %id, "WebSocket ticker disconnected");
            Ok(())
        })
    })
}

/// Rocket instance with state and routes mounted, bound per `[server]`.
pub fn build_rocket(state: AppState) -> Rocket<Build> {
    let fig = rocket::Config::figment()
        .merge(("address", state.config.server.bind.clone()))
        .merge(("port", state.config.server.port));

    rocket::custom(fig)
        .manage(state)
        .mount(
            "/",
            routes![
                health,
                status,
                list_feeds,
                create_feed,
                delete_feed,
                list_items,
                trigger_update,
                list_keywords,
                add_keyword,
                delete_keyword,
                list_saved,
                save_item,
                delete_saved,
            ],
        )
        .mount("/ws", routes![ticker_websocket])
}

/// Build and launch the HTTP server. Returns once Rocket has shut down,
/// either on its own signal handling or when `state.shutdown` fires.
pub async fn launch_rocket(state: AppState) -> Result<()> {
    let shutdown = state.shutdown.clone();
    let rocket = build_rocket(state)
        .ignite()
        .await
        .map_err(|e| anyhow!("Rocket failed to ignite: {}", e))?;

    let handle = rocket.shutdown();
    tokio::spawn(async move {
        shutdown.wait().await;
        handle.notify();
    });

    info!("Starting Rocket HTTP server");
    rocket
        .launch()
        .await
        .map_err(|e| anyhow!("Rocket failed: {}", e))?;

    info!("Rocket HTTP server has shut down");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::TtlCache;
    use crate::gate::IngestGate;
    use crate::ingestion::FeedFetcher;
    use crate::storage::test_support::memory_pool;
    use rocket::http::ContentType;
    use rocket::local::asynchronous::Client;
    use std::time::Duration;
    use tokio::sync::mpsc;

    async fn client() -> Client {
        let pool = memory_pool().await;
        let config = Arc::new(Config::with_database_path(":memory:"));
        let cache = Arc::new(TtlCache::new(Duration::from_secs(config.cache.min_horizon_seconds)));
        let views = Views::new(pool.clone(), cache, &config.cache);
        let ticker = Ticker::new(config.ticker.subscriber_buffer);
        let (tx, _rx) = mpsc::channel(config.ticker.inbound_buffer);
        let shutdown = Shutdown::new();
        let updater = Updater::new(
            pool.clone(),
            Arc::new(FeedFetcher::new(&config.fetch).unwrap()),
            IngestGate::new(pool.clone(), tx),
            views.clone(),
            None,
            shutdown.clone(),
        );
        let state = AppState {
            started_at: Utc::now(),
            config,
            db: pool,
            views,
            ticker,
            updater,
            shutdown,
        };
        Client::tracked(build_rocket(state)).await.expect("valid rocket")
    }

    #[rocket::async_test]
    async fn health_and_status() {
        let client = client().await;
        let res = client.get("/health").dispatch().await;
        assert_eq!(res.status(), Status::Ok);
        assert_eq!(res.into_string().await.as_deref(), Some("OK"));

        let res = client.get("/api/status").dispatch().await;
        assert_eq!(res.status(), Status::Ok);
        let body: serde_json::Value = res.into_json().await.unwrap();
        assert_eq!(body["scoring"], "disabled");
        assert_eq!(body["items"], 0);
    }

    #[rocket::async_test]
    async fn keyword_round_trip_over_http() {
        let client = client().await;
        let res = client
            .post("/api/keywords/anna")
            .header(ContentType::JSON)
            .body(r#"{"mode": "highlight", "text": "ASML"}"#)
            .dispatch()
            .await;
        assert_eq!(res.status(), Status::Ok);
        let kw: Keyword = res.into_json().await.unwrap();

        let list: Vec<Keyword> = client
            .get("/api/keywords/anna")
            .dispatch()
            .await
            .into_json()
            .await
            .unwrap();
        assert_eq!(list.len(), 1);

        let res = client
            .delete(format!("/api/keywords/anna/{}", kw.id))
            .dispatch()
            .await;
        assert_eq!(res.status(), Status::NoContent);
        let res = client
            .delete(format!("/api/keywords/anna/{}", kw.id))
            .dispatch()
            .await;
        assert_eq!(res.status(), Status::NotFound);
    }

    #[rocket::async_test]
    async fn huge_page_numbers_are_rejected() {
        let client = client().await;
        let res = client
            .get(format!("/api/items?page={}", i64::MAX))
            .dispatch()
            .await;
        assert_eq!(res.status(), Status::BadRequest);

        let res = client.get("/api/items?page=2&limit=10").dispatch().await;
        assert_eq!(res.status(), Status::Ok);
    }

    #[rocket::async_test]
    async fn saved_items_over_http() {
        let client = client().await;
        let pool = &client.rocket().state::<AppState>().unwrap().db;
        let id = storage::insert_item_if_fingerprint_absent(
            pool,
            &crate::model::NewItem {
                feed_abbr: "NOS".into(),
                title: "Storm nadert de kust".into(),
                link: "https://nos.example/storm".into(),
                description: String::new(),
                content: String::new(),
                published_at: Utc::now(),
            },
        )
        .await
        .unwrap()
        .unwrap();

        let res = client.post(format!("/api/saved/anna/{}", id)).dispatch().await;
        assert_eq!(res.status(), Status::NoContent);
        let res = client.post(format!("/api/saved/anna/{}", id + 100)).dispatch().await;
        assert_eq!(res.status(), Status::NotFound);

        let saved: Vec<Item> = client
            .get("/api/saved/anna")
            .dispatch()
            .await
            .into_json()
            .await
            .unwrap();
        assert_eq!(saved.len(), 1);
        assert_eq!(saved[0].id, id);

        let res = client.delete(format!("/api/saved/anna/{}", id)).dispatch().await;
        assert_eq!(res.status(), Status::NoContent);
        let res = client.delete(format!("/api/saved/anna/{}", id)).dispatch().await;
        assert_eq!(res.status(), Status::NotFound);
    }

    #[rocket::async_test]
    async fn manual_update_without_feeds_is_an_error() {
        let client = client().await;
        let res = client.post("/api/update").dispatch().await;
        assert_eq!(res.status(), Status::InternalServerError);
    }
}
