use log::warn;
use std::collections::BTreeMap;
use std::env;
use std::ffi::OsString;
use std::sync::Arc;
use std::time::Duration;

use actix_web::{HttpRequest, HttpResponse, Responder, guard, http::Method, web};
use serde::Serialize;
use serde_json::json;

use crate::error::AppError;
use crate::gpio::{GpioManager, PinModePayload};
use crate::store::KvStore;
use crate::{telemetry, topology};

const GPIO_ALL_CACHE_KEY: &str = "cache:gpio/all";
const INFO_CACHE_KEY: &str = "cache:info";
const INFO_CPU_CACHE_KEY: &str = "cache:info/cpu";
const INFO_CACHE_TTL: Duration = Duration::from_secs(5);

#[derive(Clone)]
pub struct AppState {
    pub manager: Arc<GpioManager>,
    pub store: Arc<dyn KvStore>,
    pub cache_ttl: Duration,
    /// Search path for external tools, `PATH` when unset.
    pub tool_path: Option<Arc<OsString>>,
}

impl AppState {
    pub fn new(manager: Arc<GpioManager>, store: Arc<dyn KvStore>, cache_ttl: Duration) -> Self {
        Self {
            manager,
            store,
            cache_ttl,
            tool_path: None,
        }
    }

    pub fn with_tool_path(mut self, path: impl Into<OsString>) -> Self {
        self.tool_path = Some(Arc::new(path.into()));
        self
    }

    fn search_path(&self) -> OsString {
        match &self.tool_path {
            Some(path) => (**path).clone(),
            None => env::var_os("PATH").unwrap_or_default(),
        }
    }

    pub fn api_scope(&self, base_path: &str) -> actix_web::Scope {
        web::scope(base_path)
            .service(
                web::resource("")
                    .route(web::get().to(index))
                    .route(
                        web::route()
                            .guard(guard_not_methods(&[Method::GET]))
                            .to(method_not_allowed),
                    ),
            )
            .service(
                web::resource("/gpio")
                    .route(web::get().to(list_gpio))
                    .route(
                        web::route()
                            .guard(guard_not_methods(&[Method::GET]))
                            .to(method_not_allowed),
                    ),
            )
            .service(
                web::resource("/gpio/all")
                    .route(web::get().to(gpio_all))
                    .route(
                        web::route()
                            .guard(guard_not_methods(&[Method::GET]))
                            .to(method_not_allowed),
                    ),
            )
            .service(
                web::resource("/gpio/{pin}")
                    .route(web::patch().to(update_gpio))
                    .route(
                        web::route()
                            .guard(guard_not_methods(&[Method::PATCH]))
                            .to(method_not_allowed),
                    ),
            )
            .service(
                web::resource("/info")
                    .route(web::get().to(info))
                    .route(
                        web::route()
                            .guard(guard_not_methods(&[Method::GET]))
                            .to(method_not_allowed),
                    ),
            )
            .service(
                web::resource("/info/cpu")
                    .route(web::get().to(info_cpu))
                    .route(
                        web::route()
                            .guard(guard_not_methods(&[Method::GET]))
                            .to(method_not_allowed),
                    ),
            )
            .service(
                web::resource("/info/mem")
                    .route(web::get().to(info_mem))
                    .route(
                        web::route()
                            .guard(guard_not_methods(&[Method::GET]))
                            .to(method_not_allowed),
                    ),
            )
            .service(
                web::resource("/info/disk")
                    .route(web::get().to(info_disk))
                    .route(
                        web::route()
                            .guard(guard_not_methods(&[Method::GET]))
                            .to(method_not_allowed),
                    ),
            )
            .service(
                web::resource("/info/net")
                    .route(web::get().to(info_net))
                    .route(
                        web::route()
                            .guard(guard_not_methods(&[Method::GET]))
                            .to(method_not_allowed),
                    ),
            )
            .service(
                web::resource("/info/usb")
                    .route(web::get().to(info_usb))
                    .route(
                        web::route()
                            .guard(guard_not_methods(&[Method::GET]))
                            .to(method_not_allowed),
                    ),
            )
            .service(
                web::resource("/info/gpio")
                    .route(web::get().to(gpio_info))
                    .route(
                        web::route()
                            .guard(guard_not_methods(&[Method::GET]))
                            .to(method_not_allowed),
                    ),
            )
    }
}

async fn run_blocking<T, F>(f: F) -> Result<T, AppError>
where
    F: FnOnce() -> Result<T, AppError> + Send + 'static,
    T: Send + 'static,
{
    web::block(f)
        .await
        .map_err(|e| AppError::Gpio(format!("blocking task: {e}")))?
}

fn json_body(body: Vec<u8>) -> HttpResponse {
    HttpResponse::Ok()
        .content_type("application/json")
        .body(body)
}

/// Serves `key` from the store, or produces, stores and serves a fresh body.
async fn cached_json<T, F>(
    state: &AppState,
    key: &str,
    ttl: Duration,
    produce: F,
) -> Result<HttpResponse, AppError>
where
    F: FnOnce() -> Result<T, AppError> + Send + 'static,
    T: Serialize + Send + 'static,
{
    if let Some(body) = state.store.get(key)? {
        return Ok(json_body(body));
    }

    let value = run_blocking(produce).await?;
    let body = serde_json::to_vec(&value).map_err(|e| AppError::Encode(format!("{key}: {e}")))?;

    if let Err(e) = state.store.put_with_ttl(key, &body, ttl) {
        warn!("Error storing cache for {key}: {e}");
    }

    Ok(json_body(body))
}

async fn index(req: HttpRequest) -> impl Responder {
    let base = req.path().trim_end_matches('/');
    let routes: BTreeMap<String, &str> = [
        ("/gpio", "Returns the status of all configured GPIO pins."),
        ("/gpio/all", "Returns all GPIO lines claimed on the GPIO chip."),
        ("/gpio/{pin}", "Updates the mode of a GPIO pin (PATCH)."),
        ("/info", "Returns system information."),
        ("/info/cpu", "Returns CPU information."),
        ("/info/mem", "Returns memory information."),
        ("/info/disk", "Returns disk information."),
        ("/info/net", "Returns network information."),
        ("/info/usb", "Returns list of USB devices."),
        ("/info/gpio", "Returns list of available GPIOs."),
    ]
    .into_iter()
    .map(|(suffix, description)| (format!("{base}{suffix}"), description))
    .collect();

    web::Json(routes)
}

async fn list_gpio(state: web::Data<AppState>) -> Result<impl Responder, AppError> {
    let manager = state.manager.clone();
    let pins = run_blocking(move || manager.get_all()).await?;

    Ok(web::Json(pins))
}

async fn gpio_all(state: web::Data<AppState>) -> Result<HttpResponse, AppError> {
    let manager = state.manager.clone();
    cached_json(&state, GPIO_ALL_CACHE_KEY, state.cache_ttl, move || {
        manager.get_gpio_all()
    })
    .await
}

async fn update_gpio(
    req: HttpRequest,
    body: web::Bytes,
    state: web::Data<AppState>,
) -> Result<impl Responder, AppError> {
    let pin = parse_pin(&req)?;
    let mode = parse_mode_payload(&body)?.into_pin_mode(pin)?;

    let manager = state.manager.clone();
    let applied = mode.clone();
    run_blocking(move || manager.set_pin_mode(&applied)).await?;

    Ok(web::Json(mode))
}

async fn gpio_info(state: web::Data<AppState>) -> Result<impl Responder, AppError> {
    let tool_path = state.tool_path.clone();
    let chips = run_blocking(move || match tool_path {
        Some(path) => topology::discover_in(&path),
        None => topology::discover(),
    })
    .await?;

    Ok(web::Json(json!({ "gpio": chips })))
}

async fn info(state: web::Data<AppState>) -> Result<HttpResponse, AppError> {
    let search_path = state.search_path();
    cached_json(&state, INFO_CACHE_KEY, INFO_CACHE_TTL, move || {
        Ok(telemetry::overview(&search_path))
    })
    .await
}

async fn info_cpu(state: web::Data<AppState>) -> Result<HttpResponse, AppError> {
    let search_path = state.search_path();
    cached_json(&state, INFO_CPU_CACHE_KEY, INFO_CACHE_TTL, move || {
        Ok(telemetry::cpu_report(&search_path))
    })
    .await
}

async fn info_mem(state: web::Data<AppState>) -> Result<impl Responder, AppError> {
    let search_path = state.search_path();
    let report = run_blocking(move || Ok(telemetry::memory_report(&search_path))).await?;

    Ok(web::Json(report))
}

async fn info_disk() -> Result<impl Responder, AppError> {
    let report = run_blocking(|| Ok(telemetry::disk_report())).await?;

    Ok(web::Json(report))
}

async fn info_net() -> Result<impl Responder, AppError> {
    let report = run_blocking(|| Ok(telemetry::net_report())).await?;

    Ok(web::Json(report))
}

async fn info_usb(state: web::Data<AppState>) -> Result<impl Responder, AppError> {
    let search_path = state.search_path();
    let devices = run_blocking(move || telemetry::usb_devices(&search_path)).await?;

    Ok(web::Json(json!({ "usb": devices })))
}

fn parse_pin(req: &HttpRequest) -> Result<u32, AppError> {
    let pin = req
        .match_info()
        .get("pin")
        .ok_or_else(|| AppError::InvalidValue("Missing pin".into()))?;
    let pin = pin
        .parse::<u32>()
        .map_err(|_| AppError::InvalidValue("Invalid pin".into()))?;

    Ok(pin)
}

fn parse_mode_payload(body: &[u8]) -> Result<PinModePayload, AppError> {
    if body.is_empty() {
        return Err(AppError::InvalidValue("Empty pin mode payload".into()));
    }

    serde_json::from_slice(body)
        .map_err(|e| AppError::InvalidValue(format!("Invalid pin mode payload: {e}")))
}

async fn method_not_allowed() -> HttpResponse {
    HttpResponse::MethodNotAllowed().finish()
}

fn guard_not_methods(methods: &[Method]) -> impl guard::Guard {
    let allowed: Vec<Method> = methods.to_vec();
    guard::fn_guard(move |ctx| !allowed.iter().any(|m| m == ctx.head().method))
}
