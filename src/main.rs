use log::{error, info};
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use actix_web::{App, HttpServer, middleware::Logger, web};

use raspctl::{AppConfig, AppState, GpioBackend, SqliteStore, GpioManager, InitContext};

#[cfg(feature = "hardware-gpio")]
use raspctl::LibgpiodBackend;
#[cfg(not(feature = "hardware-gpio"))]
use raspctl::MockGpioBackend;

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    env_logger::init();

    let config_path = std::env::args()
        .nth(1)
        .or_else(|| std::env::var("RASPCTL_CONFIG").ok())
        .unwrap_or_else(|| "config.json".to_string());
    let config = Arc::new(
        AppConfig::load_from_file(&config_path)
            .unwrap_or_else(|e| panic!("Failed to load config: {e}")),
    );

    let store = Arc::new(
        SqliteStore::open(&config.db_dir)
            .unwrap_or_else(|e| panic!("Failed to open store: {e}")),
    );
    info!("Persisting state to {}", store.path().display());

    let backend: Arc<dyn GpioBackend> = {
        #[cfg(feature = "hardware-gpio")]
        {
            Arc::new(LibgpiodBackend::new())
        }
        #[cfg(not(feature = "hardware-gpio"))]
        {
            Arc::new(MockGpioBackend::default())
        }
    };

    let manager = Arc::new(GpioManager::new(config.clone(), backend, store.clone()));

    // the API stays up without a chip; GPIO routes report it as uninitialized
    if let Err(e) = manager.initialize(&InitContext::new()) {
        error!("Failed to initialize GPIO: {e}");
    }

    let app_state = AppState::new(
        manager.clone(),
        store,
        Duration::from_secs(config.cache_ttl_secs),
    );

    let http_cfg = config.http.clone();
    let server = HttpServer::new(move || {
        let scope_path = http_cfg.path.clone();
        App::new()
            .wrap(Logger::default())
            .app_data(web::Data::new(app_state.clone()))
            .service(app_state.api_scope(&scope_path))
    });

    let bind_addrs: String;
    let http_cfg = config.http.clone();
    let server = match (&http_cfg.unix_socket, &http_cfg.host) {
        (Some(socket_path), Some(host)) => {
            if Path::new(socket_path).exists() {
                fs::remove_file(socket_path)?;
            }
            bind_addrs = format!("{} and {}", socket_path, host);

            server.bind_uds(socket_path)?.bind(host)?
        }
        (Some(socket_path), None) => {
            if Path::new(socket_path).exists() {
                fs::remove_file(socket_path)?;
            }
            bind_addrs = socket_path.clone();

            server.bind_uds(socket_path)?
        }
        (None, Some(host)) => {
            bind_addrs = host.clone();

            server.bind(host)?
        }
        (None, None) => unreachable!("listener presence is checked when loading config"),
    };

    info!("Starting {} on {}...", config.app_name, bind_addrs);

    let result = server.run().await;
    manager.shutdown();
    result
}
