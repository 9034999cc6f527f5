use std::sync::Arc;

use courier_server::{db, routes, ServerState};

/// Command-line arguments for the server daemon.
struct Args {
    bind_addr: String,
    db_path: String,
}

fn parse_args() -> Args {
    let mut args = std::env::args().skip(1);
    let mut bind_addr = String::new();
    let mut db_path = String::new();

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--bind" => bind_addr = args.next().unwrap_or_default(),
            "--db" => db_path = args.next().unwrap_or_default(),
            _ => {}
        }
    }

    if bind_addr.is_empty() {
        bind_addr = "127.0.0.1:8080".to_string();
    }
    if db_path.is_empty() {
        db_path = dirs_fallback("courier/courier.db");
    }

    Args { bind_addr, db_path }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();
    tracing::info!("courier-server starting");

    let args = parse_args();

    if let Some(parent) = std::path::Path::new(&args.db_path).parent() {
        std::fs::create_dir_all(parent).expect("failed to create db dir");
    }
    let conn = db::open_db(&args.db_path).expect("failed to open server database");

    let state = Arc::new(ServerState::new(conn));
    let app = routes::router(state);

    let listener = tokio::net::TcpListener::bind(&args.bind_addr)
        .await
        .expect("failed to bind listen address");

    tracing::info!(addr = %args.bind_addr, db = %args.db_path, "courier-server ready");
    axum::serve(listener, app).await.expect("server error");
}

fn dirs_fallback(subpath: &str) -> String {
    let base = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    format!("{base}/.local/share/{subpath}")
}
