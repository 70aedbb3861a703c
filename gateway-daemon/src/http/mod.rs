//! The client-facing REST/WebSocket surface (§6 of the spec): a thin
//! `hyper` + `routerify` translation of the registry and engine, built
//! the way the teacher's `daemon/src/http/mod.rs` is -- a flat handler
//! module, a shared `App` read through the global [`crate::APP`] cell,
//! and a `routerify` error handler that serializes the typed [`Error`].

use std::{net::SocketAddr, time::Duration};

use anyhow::Context;
use hyper::{Body, Request, Response, Server, StatusCode};
use routerify::{Router, RouterService};
use routerify_query::{query_parser, RequestQueryExt};
use serde::Deserialize;
use serde_json::json;

mod error;
pub use error::{Error, FormattedError};

mod helpers;
use helpers::{parse_body, parse_param, serialize_response};

mod websocket;

/// Looks up a device snapshot by id, translating a missing entry into the
/// same `UnknownDevice` shape the router's own dispatch would produce.
async fn get_devices(_req: Request<Body>) -> Result<Response<Body>, Error> {
    let app = crate::app();
    let app = app.read().await;
    Ok(serialize_response(&app.engine.registry.list())?)
}

async fn get_device(req: Request<Body>) -> Result<Response<Body>, Error> {
    let id: String = parse_param(&req, "id")?;
    let app = crate::app();
    let app = app.read().await;
    let snapshot = app
        .engine
        .registry
        .get(&id)
        .ok_or(Error::UnknownDevice { id })?;
    Ok(serialize_response(&snapshot)?)
}

#[derive(Deserialize)]
struct CommandBody {
    /// The opaque command payload, sent as UTF-8 bytes on the device's
    /// current transport.
    payload: String,
}

async fn send_command(mut req: Request<Body>) -> Result<Response<Body>, Error> {
    let id: String = parse_param(&req, "id")?;
    let body: CommandBody = parse_body(&mut req).await?;

    let app = crate::app();
    let app = app.read().await;
    app.engine
        .router
        .dispatch(&id, body.payload.as_bytes())
        .await
        .map_err(|e| Error::for_device(&id, e))?;

    Ok(serialize_response(&json!({ "success": true }))?)
}

async fn use_network(req: Request<Body>) -> Result<Response<Body>, Error> {
    let id: String = parse_param(&req, "id")?;
    let app = crate::app();
    let app = app.read().await;
    app.engine
        .router
        .use_network(&id)
        .await
        .map_err(|e| Error::for_device(&id, e))?;
    Ok(serialize_response(&json!({ "success": true }))?)
}

async fn trigger_discovery(_req: Request<Body>) -> Result<Response<Body>, Error> {
    let app = crate::app();
    let app = app.read().await;
    app.engine.discovery.trigger().await;
    Ok(serialize_response(&json!({ "success": true }))?)
}

async fn list_serial_ports(_req: Request<Body>) -> Result<Response<Body>, Error> {
    Ok(serialize_response(
        &gateway_core::transport::SerialTransport::list_ports(),
    )?)
}

async fn connect_serial(req: Request<Body>) -> Result<Response<Body>, Error> {
    let port: String = parse_param(&req, "port")?;
    let id: String = parse_param(&req, "id")?;
    let app = crate::app();
    let app = app.read().await;
    app.engine
        .router
        .use_serial(&port, &id)
        .await
        .map_err(|e| Error::for_device(&id, e))?;
    Ok(serialize_response(&json!({ "success": true }))?)
}

async fn disconnect_serial(req: Request<Body>) -> Result<Response<Body>, Error> {
    let port: String = parse_param(&req, "port")?;
    let app = crate::app();
    let app = app.read().await;
    app.engine
        .serial
        .disconnect(&port)
        .await
        .map_err(|e| Error::from(anyhow::Error::from(e)))?;
    Ok(serialize_response(&json!({ "success": true }))?)
}

async fn detect_serial(req: Request<Body>) -> Result<Response<Body>, Error> {
    let port: String = parse_param(&req, "port")?;
    let app = crate::app();
    let app = app.read().await;
    let device_id = app.engine.serial.detect(&port, Duration::from_secs_f64(2.0)).await;
    Ok(serialize_response(&json!({ "device_id": device_id }))?)
}

/// `device_paths.json`: serial tty paths a user has manually registered,
/// on top of whatever `GET /serial/ports` enumerates (§6).
async fn list_device_paths(_req: Request<Body>) -> Result<Response<Body>, Error> {
    let app = crate::app();
    let app = app.read().await;
    Ok(serialize_response(&app.device_paths.all())?)
}

#[derive(Deserialize)]
struct AddDevicePathBody {
    path: String,
}

async fn add_device_path(mut req: Request<Body>) -> Result<Response<Body>, Error> {
    let body: AddDevicePathBody = parse_body(&mut req).await?;
    let app = crate::app();
    let app = app.read().await;
    app.device_paths
        .add(body.path)
        .map_err(|e| Error::from(anyhow::Error::from(e)))?;
    Ok(serialize_response(&app.device_paths.all())?)
}

/// `?levels=error,warning` restricts the returned history to matching
/// levels (comma-separated, matched case-insensitively against the log
/// entry's `level` field); omitted, every level is returned.
async fn read_logs(req: Request<Body>) -> Result<Response<Body>, Error> {
    let app = crate::app();
    let app = app.read().await;
    let entries = app.logs.all();

    let Some(levels) = req.query("levels") else {
        return Ok(serialize_response(&entries)?);
    };
    let wanted: Vec<String> = levels.split(',').map(|s| s.trim().to_lowercase()).collect();
    let filtered: Vec<_> = entries
        .into_iter()
        .filter(|entry| wanted.iter().any(|level| level == &entry.level.to_lowercase()))
        .collect();
    Ok(serialize_response(&filtered)?)
}

async fn clear_logs(_req: Request<Body>) -> Result<Response<Body>, Error> {
    let app = crate::app();
    let app = app.read().await;
    app.logs.clear();
    Ok(serialize_response(&json!({ "success": true }))?)
}

async fn list_definitions(_req: Request<Body>) -> Result<Response<Body>, Error> {
    let app = crate::app();
    let app = app.read().await;
    let definitions: Vec<gateway_core::DeviceDefinition> = app
        .engine
        .definitions
        .all()
        .iter()
        .map(|def| (**def).clone())
        .collect();
    Ok(serialize_response(&definitions)?)
}

/// Re-walks the definitions directory and swaps the store's contents
/// wholesale, per the "rebuildable on a `reload()` call" note in §4.9.
/// Newly-appearing ids get a registry entry; previously-known ones that
/// disappeared from disk keep their existing `DeviceState` untouched --
/// the registry never evicts a device once created.
async fn reload_definitions(_req: Request<Body>) -> Result<Response<Body>, Error> {
    let app = crate::app();
    let app = app.read().await;
    let definitions = crate::definitions_loader::load_dir(&app.definitions_dir);
    for definition in &definitions {
        app.engine.registry.ensure(definition);
    }
    let count = definitions.len();
    app.engine.definitions.reload(definitions);
    Ok(serialize_response(&json!({ "count": count }))?)
}

async fn websocket_upgrade(mut req: Request<Body>) -> Result<Response<Body>, Error> {
    if !hyper_tungstenite::is_upgrade_request(&req) {
        return Ok(Response::builder()
            .status(StatusCode::BAD_REQUEST)
            .body(Body::from("expected a websocket upgrade"))
            .expect("building a fixed response cannot fail"));
    }

    let (response, websocket) =
        hyper_tungstenite::upgrade(&mut req, None).context("websocket upgrade failed")?;

    let app = crate::app();
    let events = app.read().await.engine.events.clone();
    tokio::spawn(async move {
        if let Err(e) = websocket::websocket_event_bridge(websocket, events).await {
            log::warn!("websocket bridge closed with an error: {e}");
        }
    });

    Ok(response)
}

async fn error_handler(err: routerify::RouteError) -> Response<Body> {
    let body = match err.downcast_ref::<Error>() {
        Some(err) => {
            let formatted: FormattedError = err.clone().into();
            serde_json::to_string_pretty(&formatted)
                .unwrap_or_else(|e| format!("the error {err:?} couldn't be serialized as json: {e:?}"))
        }
        None => format!("something went wrong: {err}"),
    };

    Response::builder()
        .status(StatusCode::INTERNAL_SERVER_ERROR)
        .header("Content-Type", "application/json")
        .body(Body::from(body))
        .expect("building an error response from a fixed set of headers cannot fail")
}

fn router() -> Router<Body, Error> {
    Router::builder()
        .middleware(routerify_cors::enable_cors_all())
        .middleware(query_parser())
        .get("/devices", get_devices)
        .get("/devices/:id", get_device)
        .post("/devices/:id/command", send_command)
        .post("/devices/:id/use-network", use_network)
        .post("/discovery/trigger", trigger_discovery)
        .get("/serial/ports", list_serial_ports)
        .post("/serial/:port/connect/:id", connect_serial)
        .post("/serial/:port/disconnect", disconnect_serial)
        .post("/serial/:port/detect", detect_serial)
        .get("/device-paths", list_device_paths)
        .post("/device-paths", add_device_path)
        .get("/logs", read_logs)
        .delete("/logs", clear_logs)
        .get("/definitions", list_definitions)
        .post("/definitions/reload", reload_definitions)
        .any_method("/ws", websocket_upgrade)
        .err_handler(error_handler)
        .build()
        .expect("could not build http router")
}

/// Serves the REST/WebSocket surface on `addr` until `shutdown` fires.
pub async fn serve(addr: SocketAddr, mut shutdown: tokio::sync::broadcast::Receiver<()>) -> anyhow::Result<()> {
    let service = RouterService::new(router()).expect("while building router service");
    let server = Server::try_bind(&addr)?.serve(service);
    log::info!("HTTP/WebSocket surface listening on {addr}");

    server
        .with_graceful_shutdown(async move {
            let _ = shutdown.recv().await;
        })
        .await
        .context("HTTP server error")
}
