//! feed-sync: offline-first feed cache with a local HTTP API.
//!
//! Mirrors the remote's posts and events into local stores, keeps them
//! fresh in the background and serves position-stable windows, optimistic
//! likes/participation and saves over HTTP.

use std::sync::Arc;
use std::time::Instant;

use clap::Parser;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use feed_sync::auth::{AuthContext, AuthState, SharedAuth};
use feed_sync::config::{Cli, Config};
use feed_sync::entity::{Comment, Event, Post, UserPreview};
use feed_sync::metrics::SyncMetrics;
use feed_sync::remote::http::HttpRemote;
use feed_sync::remote::media::HttpMediaUploader;
use feed_sync::repository::Repository;
use feed_sync::server::api::{build_router, AppState};
use feed_sync::store::EntityStore;

fn main() -> anyhow::Result<()> {
    // Parse CLI arguments.
    let cli = Cli::parse();

    // Initialize tracing/logging.
    let filter = if cli.verbose {
        "feed_sync=debug,tower_http=debug"
    } else {
        "feed_sync=info,tower_http=info"
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| filter.into()),
        )
        .with_target(true)
        .init();

    info!("feed-sync v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration.
    let config = Config::load(&cli.config)?.with_cli(&cli);

    let mut runtime = tokio::runtime::Builder::new_multi_thread();
    runtime.enable_all();
    if config.runtime.worker_threads > 0 {
        runtime.worker_threads(config.runtime.worker_threads);
    }
    runtime.build()?.block_on(run(cli, config))
}

async fn run(cli: Cli, config: Config) -> anyhow::Result<()> {
    let config = Arc::new(config);
    info!(
        remote = %config.remote.base_url,
        page_size = config.paging.page_size,
        initial_load_size = config.paging.initial_load_size,
        data_dir = ?config.store.data_dir,
        "Configuration loaded"
    );

    let auth = Arc::new(SharedAuth::new(match (cli.user_id, cli.token) {
        (Some(user_id), Some(token)) => AuthState::signed_in(user_id, token),
        (Some(user_id), None) => AuthState {
            user_id: Some(user_id),
            token: None,
        },
        _ => AuthState::anonymous(),
    }));
    let auth_ctx: Arc<dyn AuthContext> = auth.clone();

    let metrics = Arc::new(SyncMetrics::new()?);

    // Open local stores.
    let post_store = Arc::new(EntityStore::<Post>::open(&config.store).await?);
    let event_store = Arc::new(EntityStore::<Event>::open(&config.store).await?);
    let comment_store = Arc::new(EntityStore::<Comment>::open(&config.store).await?);
    let preview_store = Arc::new(EntityStore::<UserPreview>::open(&config.store).await?);

    // Remote endpoints.
    let post_remote = Arc::new(HttpRemote::<Post>::new(&config.remote, auth_ctx.clone())?);
    let event_remote = Arc::new(HttpRemote::<Event>::new(&config.remote, auth_ctx.clone())?);
    let uploader = Arc::new(HttpMediaUploader::new(&config.remote, auth_ctx.clone())?);

    let mut posts = Repository::builder(post_store, post_remote)
        .paging(config.paging)
        .previews(preview_store.clone())
        .uploader(uploader.clone())
        .cascade(comment_store)
        .metrics(metrics.clone());
    let mut events = Repository::builder(event_store, event_remote)
        .paging(config.paging)
        .previews(preview_store)
        .uploader(uploader)
        .metrics(metrics.clone());
    if config.newer.enabled {
        posts = posts.newer_every(config.newer.poll_interval());
        events = events.newer_every(config.newer.poll_interval());
    }
    let posts = posts.build();
    let events = events.build();

    // Background tasks.
    let shutdown = CancellationToken::new();
    let mut tasks = vec![
        posts.watch_auth(auth_ctx.clone(), shutdown.child_token()),
        events.watch_auth(auth_ctx, shutdown.child_token()),
    ];
    tasks.extend(posts.spawn_newer(shutdown.child_token()));
    tasks.extend(events.spawn_newer(shutdown.child_token()));

    // Build application state.
    let state = Arc::new(AppState {
        posts,
        events,
        metrics,
        config: config.clone(),
        start_time: Instant::now(),
        shutdown: shutdown.clone(),
    });

    // Build the HTTP router.
    let app = build_router(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive());

    // Start the server.
    let listen_addr = config.server.listen.clone();
    info!(addr = listen_addr, "Starting server");

    let listener = TcpListener::bind(&listen_addr).await?;
    info!("Listening on {listen_addr}");

    let signal = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutting down");
            signal.cancel();
        })
        .await?;

    shutdown.cancel();
    for task in tasks {
        let _ = task.await;
    }
    Ok(())
}
