use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use actix_web::{App, test, web};
use raspctl::{
    AppConfig, AppState, GPIO_LIST_KEY, GpioManager, InitContext, KvStore, MemoryStore,
    MockGpioBackend,
};
use serde_json::Value;

fn sample_config() -> AppConfig {
    AppConfig::from_json(
        r#"
        {
            "http": {
                "host": "localhost:8000",
                "path": "/api"
            },
            "app_name": "RaspController",
            "chip": "gpiochip0",
            "cache_ttl_secs": 60
        }
        "#,
    )
    .expect("valid sample config")
}

struct Harness {
    state: AppState,
    backend: MockGpioBackend,
    store: Arc<MemoryStore>,
}

fn harness(initialize: bool) -> Harness {
    let cfg = Arc::new(sample_config());
    let backend = MockGpioBackend::new(32);
    let store = Arc::new(MemoryStore::new());
    let manager = Arc::new(GpioManager::new(
        cfg.clone(),
        Arc::new(backend.clone()),
        store.clone(),
    ));
    if initialize {
        manager.initialize(&InitContext::new()).expect("mock chip opens");
    }
    let state = AppState::new(manager, store.clone(), Duration::from_secs(cfg.cache_ttl_secs))
        .with_tool_path("/nonexistent/raspctl-tools");

    Harness {
        state,
        backend,
        store,
    }
}

macro_rules! init_app {
    ($state:expr) => {
        test::init_service(
            App::new()
                .app_data(web::Data::new($state.clone()))
                .service($state.api_scope("/api")),
        )
        .await
    };
}

#[actix_rt::test]
async fn patch_then_list_round_trips() {
    let h = harness(true);
    let app = init_app!(h.state);

    let req = test::TestRequest::patch()
        .uri("/api/gpio/17")
        .set_payload(r#"{"pin":17,"value":1,"direction":"out","active":"high"}"#)
        .to_request();
    let applied: Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(applied["pin"], 17);
    assert_eq!(applied["direction"], "out");

    let req = test::TestRequest::get().uri("/api/gpio").to_request();
    let pins: HashMap<String, Value> = test::call_and_read_body_json(&app, req).await;
    assert_eq!(pins.len(), 1);
    assert_eq!(pins["17"]["value"], 1);
    assert_eq!(pins["17"]["direction"], "out");
    assert_eq!(pins["17"]["active"], "high");
    assert_eq!(h.backend.line_level(17), Some(1));
}

#[actix_rt::test]
async fn path_pin_wins_over_body_pin() {
    let h = harness(true);
    let app = init_app!(h.state);

    let req = test::TestRequest::patch()
        .uri("/api/gpio/4")
        .set_payload(r#"{"pin":9,"value":0,"direction":"in"}"#)
        .to_request();
    let applied: Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(applied["pin"], 4);
    assert_eq!(h.state.manager.open_lines(), vec![4]);
}

#[actix_rt::test]
async fn invalid_direction_returns_400_without_side_effects() {
    let h = harness(true);
    let app = init_app!(h.state);

    let req = test::TestRequest::patch()
        .uri("/api/gpio/3")
        .set_payload(r#"{"value":1,"direction":"sideways"}"#)
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 400);
    let body: Value = test::read_body_json(resp).await;
    assert!(body["error"].as_str().unwrap().contains("sideways"));

    assert!(h.state.manager.open_lines().is_empty());
    assert_eq!(h.backend.live_requests(3), 0);
    assert_eq!(h.store.get(GPIO_LIST_KEY).unwrap(), None);
}

#[actix_rt::test]
async fn invalid_pin_and_body_return_400() {
    let h = harness(true);
    let app = init_app!(h.state);

    let req = test::TestRequest::patch()
        .uri("/api/gpio/abc")
        .set_payload(r#"{"direction":"out"}"#)
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 400);

    let req = test::TestRequest::patch()
        .uri("/api/gpio/3")
        .set_payload("{not json")
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 400);

    let req = test::TestRequest::patch()
        .uri("/api/gpio/3")
        .set_payload(r#"{"direction":"out","active":"sometimes"}"#)
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 400);
}

#[actix_rt::test]
async fn uninitialized_chip_returns_500() {
    let h = harness(false);
    let app = init_app!(h.state);

    for uri in ["/api/gpio", "/api/gpio/all"] {
        let req = test::TestRequest::get().uri(uri).to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), 500);
        let body: Value = test::read_body_json(resp).await;
        assert_eq!(body["error"], "GPIO chip not initialized");
    }

    let req = test::TestRequest::patch()
        .uri("/api/gpio/3")
        .set_payload(r#"{"direction":"out","value":1}"#)
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 500);
}

#[actix_rt::test]
async fn busy_line_returns_500_with_pin() {
    let h = harness(true);
    h.backend.claim_external(12, "pigpio");
    let app = init_app!(h.state);

    let req = test::TestRequest::patch()
        .uri("/api/gpio/12")
        .set_payload(r#"{"direction":"out","value":1}"#)
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 500);
    let body: Value = test::read_body_json(resp).await;
    assert!(body["error"].as_str().unwrap().contains("pin 12"));
}

#[actix_rt::test]
async fn gpio_all_reports_claimed_lines_and_is_cached() {
    let h = harness(true);
    h.backend.claim_external(2, "spi0 CS0");
    let app = init_app!(h.state);

    let req = test::TestRequest::patch()
        .uri("/api/gpio/5")
        .set_payload(r#"{"direction":"out","value":0}"#)
        .to_request();
    assert!(test::call_service(&app, req).await.status().is_success());

    let req = test::TestRequest::get().uri("/api/gpio/all").to_request();
    let used: HashMap<String, String> = test::call_and_read_body_json(&app, req).await;
    assert_eq!(used.len(), 2);
    assert_eq!(used["2"], "spi0 CS0");
    assert_eq!(used["5"], "RaspController");

    // served from cache until the TTL elapses
    h.backend.claim_external(9, "late");
    let req = test::TestRequest::get().uri("/api/gpio/all").to_request();
    let used: HashMap<String, String> = test::call_and_read_body_json(&app, req).await;
    assert!(!used.contains_key("9"));
}

#[actix_rt::test]
async fn info_gpio_without_tools_returns_500() {
    let h = harness(true);
    let app = init_app!(h.state);

    let req = test::TestRequest::get().uri("/api/info/gpio").to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 500);
    let body: Value = test::read_body_json(resp).await;
    assert!(body["error"].as_str().unwrap().contains("not found"));
}

#[actix_rt::test]
async fn wrong_method_returns_405() {
    let h = harness(true);
    let app = init_app!(h.state);

    let req = test::TestRequest::get().uri("/api/gpio/3").to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 405);

    let req = test::TestRequest::post().uri("/api/gpio").to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 405);
}

#[actix_rt::test]
async fn index_lists_routes() {
    let h = harness(false);
    let app = init_app!(h.state);

    let req = test::TestRequest::get().uri("/api").to_request();
    let routes: HashMap<String, String> = test::call_and_read_body_json(&app, req).await;
    assert!(routes.contains_key("/api/gpio"));
    assert!(routes.contains_key("/api/info/gpio"));
    for suffix in ["", "/cpu", "/mem", "/disk", "/net", "/usb"] {
        assert!(routes.contains_key(&format!("/api/info{suffix}")), "{suffix}");
    }
}

#[actix_rt::test]
async fn info_reports_system_and_is_cached() {
    let h = harness(false);
    let app = init_app!(h.state);

    let req = test::TestRequest::get().uri("/api/info").to_request();
    let info: Value = test::call_and_read_body_json(&app, req).await;
    assert!(info["reading_date"].is_string());
    assert!(info["memory"]["total"].is_u64());
    assert!(info["disks"].is_array());
    assert!(info["net_stat"].is_array());
    // no vcgencmd on the tool path
    assert!(info.get("core_voltage").is_none());
    assert!(info.get("throttled").is_none());

    let cached = h.store.get("cache:info").unwrap().expect("info body cached");
    let cached: Value = serde_json::from_slice(&cached).unwrap();
    assert_eq!(cached, info);
}

#[actix_rt::test]
async fn info_sections_return_their_documents() {
    let h = harness(false);
    let app = init_app!(h.state);

    let req = test::TestRequest::get().uri("/api/info/cpu").to_request();
    let cpu: Value = test::call_and_read_body_json(&app, req).await;
    assert!(cpu["cpus"].is_array());
    assert!(cpu["load_average"]["one"].is_number());
    assert!(h.store.get("cache:info/cpu").unwrap().is_some());

    let req = test::TestRequest::get().uri("/api/info/mem").to_request();
    let mem: Value = test::call_and_read_body_json(&app, req).await;
    assert!(mem["memory"]["total"].is_u64());
    assert!(mem.get("arm_mem").is_none());

    let req = test::TestRequest::get().uri("/api/info/disk").to_request();
    let disk: Value = test::call_and_read_body_json(&app, req).await;
    assert!(disk["disks"].is_array());

    let req = test::TestRequest::get().uri("/api/info/net").to_request();
    let net: Value = test::call_and_read_body_json(&app, req).await;
    assert!(net["network"].is_array());
    assert!(net["reading_date"].is_string());
}

#[actix_rt::test]
async fn info_usb_without_lsusb_returns_500() {
    let h = harness(false);
    let app = init_app!(h.state);

    let req = test::TestRequest::get().uri("/api/info/usb").to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 500);
    let body: Value = test::read_body_json(resp).await;
    assert!(body["error"].as_str().unwrap().contains("lsusb"));

    let req = test::TestRequest::post().uri("/api/info/usb").to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 405);
}
