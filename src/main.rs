mod config;
mod db;
mod handlers;
mod models;
mod routes;
mod services;
mod ws;

use axum::{http::HeaderValue, routing::get, Router};
use config::Config;
use routes::create_api_routes;
use std::panic;
use std::sync::Arc;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use ws::hub::RoomHub;

#[tokio::main(flavor = "current_thread")]
async fn main() {
    // Set panic hook for better error messages
    panic::set_hook(Box::new(|info| {
        eprintln!("PANIC: {info}");
    }));

    // Initialize tracing
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            // Default to info level, but allow debug for our app
            "coderoom=debug,tower_http=debug,axum::rejection=trace,info".into()
        }))
        .init();

    info!("Starting server...");

    // Load configuration
    let config = Config::load().unwrap_or_else(|e| {
        error!("Failed to load configuration: {}", e);
        warn!("Using default configuration");
        Config::default()
    });
    config::init_config(config.clone());

    if config.auth_jwt_secret.is_none() {
        warn!("No JWT secret configured - all connections will be rejected");
    }

    // Initialize database connection if URL is provided
    if let Some(db_url) = &config.db_url {
        match db::dbroom::init_db(db_url).await {
            Ok(_) => info!("Database initialized successfully"),
            Err(e) => {
                error!("Failed to initialize database: {}", e);
                warn!("Room membership, documents and chat will not be available");
            }
        }
    } else {
        warn!("No database URL configured - room membership, documents and chat will not be available");
    }

    // The room hub is the single owner of all presence and cursor state
    let hub = Arc::new(RoomHub::new());

    // CORS policy from configuration
    let cors = match &config.cors_origins {
        Some(origins) => {
            let origins: Vec<HeaderValue> = origins
                .split(',')
                .filter_map(|o| o.trim().parse().ok())
                .collect();
            CorsLayer::new()
                .allow_origin(AllowOrigin::list(origins))
                .allow_methods(Any)
                .allow_headers(Any)
        }
        None => CorsLayer::permissive(),
    };

    // Create API routes
    let api_routes = create_api_routes(hub.clone());

    // Combine all routes
    let app_routes = Router::new()
        // WebSocket endpoint for room sessions
        .route("/ws", get(ws::session::websocket_handler))
        .with_state(hub)
        // Mount API routes
        .nest("/api", api_routes)
        .layer(cors)
        // Add tracing layer
        .layer(TraceLayer::new_for_http());

    // Start the server
    let listener = tokio::net::TcpListener::bind(config.server_address())
        .await
        .unwrap_or_else(|_| panic!("Failed to bind to {}", config.server_address()));

    info!("Server running on http://{}", config.server_address());
    info!("WebSocket available at ws://{}/ws", config.server_address());

    axum::serve(listener, app_routes)
        .await
        .expect("Server failed to start");
}
