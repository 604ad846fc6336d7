// The HTTP surface. Handlers stay thin: parse, hand work to the core
// through cells and shuttles, render the JSON envelopes.
//
// Forwarding rule: a state-mutating endpoint hit on any node re-issues
// itself to every peer with `forwarded=true`; forwarded requests never
// re-forward. Queries fork instead: the originator asks every node to
// run its partitions, merges the internode replies, and re-forks with
// back-off when a fork overlapped a map change.

pub mod fork;

use crate::cells::{OpenLoopCustomer, PropertyFilter};
use crate::cluster::{self, sentinel, MapSnapshot, NodeState, RouteInfo};
use crate::error::{Error, ErrorCode, Result};
use crate::query::{self, SectionKind};
use crate::table::Subscriber;
use crate::Services;
use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post, put};
use axum::{Json, Router};
use std::collections::HashMap;
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::info;

type Params = Query<HashMap<String, String>>;

struct ApiError(Error);

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status =
            StatusCode::from_u16(self.0.http_status()).unwrap_or(StatusCode::BAD_REQUEST);
        (status, Json(self.0.to_json())).into_response()
    }
}

impl From<Error> for ApiError {
    fn from(error: Error) -> Self {
        ApiError(error)
    }
}

impl From<serde_json::Error> for ApiError {
    fn from(error: serde_json::Error) -> Self {
        ApiError(Error::from(error))
    }
}

type ApiResult = std::result::Result<Json<serde_json::Value>, ApiError>;

pub fn router(services: Arc<Services>) -> Router {
    Router::new()
        .route("/v1/cluster/init", put(cluster_init))
        .route("/v1/cluster/join", put(cluster_join))
        .route("/v1/table/{table}", post(table_create))
        .route("/v1/table/{table}", get(table_describe))
        .route("/v1/table/{table}", delete(table_drop))
        .route("/v1/table/{table}/property/{name}", put(property_add))
        .route("/v1/table/{table}/property/{name}", delete(property_drop))
        .route("/v1/insert/{table}", post(insert))
        .route("/v1/query/{table}/event", post(query_event))
        .route("/v1/query/{table}/segment", post(query_segment))
        .route("/v1/query/{table}/customer", get(query_customer))
        .route("/v1/query/{table}/property/{name}", get(query_property))
        .route("/v1/query/{table}/histogram/{name}", post(query_histogram))
        .route("/v1/query/{table}/batch", post(query_batch))
        .route(
            "/v1/subscription/{table}/{segment}/{sub}",
            put(subscription_add),
        )
        .route("/v1/internode/is_member", get(internode_is_member))
        .route("/v1/internode/join_to_cluster", post(internode_map_change))
        .route("/v1/internode/add_node", post(internode_map_change))
        .route("/v1/internode/map_change", post(internode_map_change))
        .route("/v1/internode/transfer", put(internode_transfer))
        .route("/v1/internode/push_transfer", post(internode_push_transfer))
        .route("/v1/internode/translog", post(internode_translog))
        .route("/v1/internode/query", post(internode_query))
        .layer(TraceLayer::new_for_http())
        .with_state(services)
}

pub async fn serve(services: Arc<Services>) -> Result<()> {
    let addr = format!("{}:{}", services.config.host, services.config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| Error::config(format!("cannot bind {addr}: {e}")))?;
    info!(%addr, "http listening");
    axum::serve(listener, router(services))
        .await
        .map_err(|e| Error::run_time(ErrorCode::GeneralError, format!("server: {e}")))?;
    Ok(())
}

fn is_forwarded(params: &HashMap<String, String>) -> bool {
    params.get("forwarded").map(|v| v == "true").unwrap_or(false)
}

/// Re-issue a mutating request to every peer with `forwarded=true`.
async fn forward(
    services: &Arc<Services>,
    method: reqwest::Method,
    path_and_query: &str,
    body: Option<Vec<u8>>,
) {
    let sep = if path_and_query.contains('?') { '&' } else { '?' };
    let client = reqwest::Client::new();
    for route in services.mapper.routes() {
        if route.node_id == services.mapper.node_id() || route.failed {
            continue;
        }
        let url = format!("{}{}{sep}forwarded=true", route.base_url(), path_and_query);
        let mut request = client.request(method.clone(), url);
        if let Some(body) = &body {
            request = request.body(body.clone());
        }
        let delivered = request
            .send()
            .await
            .map(|r| r.status().is_success())
            .unwrap_or(false);
        if !delivered {
            services.mapper.mark_route_failed(route.node_id);
        }
    }
}

// ---- cluster ------------------------------------------------------------

async fn cluster_init(State(services): State<Arc<Services>>, Query(params): Params) -> ApiResult {
    let partitions: usize = params
        .get("partitions")
        .and_then(|p| p.parse().ok())
        .ok_or_else(|| Error::config("partitions parameter required"))?;
    let cloned = services.clone();
    tokio::task::spawn_blocking(move || cloned.init_cluster(partitions))
        .await
        .map_err(|_| Error::run_time(ErrorCode::GeneralError, "init task failed"))??;
    Ok(Json(serde_json::json!({ "cluster": "initialized", "partitions": partitions })))
}

async fn cluster_join(State(services): State<Arc<Services>>, Query(params): Params) -> ApiResult {
    let host = params
        .get("host")
        .cloned()
        .ok_or_else(|| Error::config("host parameter required"))?;
    let port: u16 = params
        .get("port")
        .and_then(|p| p.parse().ok())
        .ok_or_else(|| Error::config("port parameter required"))?;

    let node_id = crate::common::hash_str(&format!("{host}:{port}"));
    services.mapper.add_route(RouteInfo {
        node_id,
        name: format!("{host}:{port}"),
        host,
        port,
        failed: false,
        failed_since: 0,
    });

    let cloned = services.clone();
    let ok = tokio::task::spawn_blocking(move || {
        let client = reqwest::blocking::Client::new();
        sentinel::broadcast(&cloned, &client)
    })
    .await
    .unwrap_or(false);
    if !ok {
        return Err(Error::route_error("new node unreachable").into());
    }
    Ok(Json(serde_json::json!({ "cluster": "joined", "node": node_id })))
}

// ---- tables -------------------------------------------------------------

async fn table_create(
    State(services): State<Arc<Services>>,
    Path(table): Path<String>,
    Query(params): Params,
    body: Bytes,
) -> ApiResult {
    let spec: serde_json::Value = if body.is_empty() {
        serde_json::json!({})
    } else {
        serde_json::from_slice(&body)?
    };

    let created = services.db.create_table(&table)?;
    if let Some(props) = spec.get("properties").and_then(|p| p.as_array()) {
        let mut schema = created.properties.write();
        for prop in props {
            let name = prop.get("name").and_then(|n| n.as_str()).unwrap_or("");
            let ptype = crate::table::properties::PropType::parse(
                prop.get("type").and_then(|t| t.as_str()).unwrap_or("text"),
            )?;
            let is_set = prop.get("is_set").and_then(|v| v.as_bool()).unwrap_or(false);
            let is_customer = prop
                .get("is_customer")
                .and_then(|v| v.as_bool())
                .unwrap_or(false);
            schema.add(name, ptype, is_set, is_customer)?;
        }
    }
    if let Some(settings) = spec.get("settings") {
        if let Ok(parsed) = serde_json::from_value(settings.clone()) {
            *created.settings.write() = parsed;
        }
    }
    if let Some(order) = spec.get("event_order").and_then(|o| o.as_array()) {
        created.settings.write().event_order = order
            .iter()
            .filter_map(|v| v.as_str().map(|s| s.to_string()))
            .collect();
    }
    services.db.save_table_config(&created)?;

    // new tables need partition objects on every mapped partition
    for partition in services
        .mapper
        .partition_map
        .partitions_by_node(services.mapper.node_id())
    {
        created.get_partition_objects(&services, partition, true);
    }

    if !is_forwarded(&params) {
        forward(
            &services,
            reqwest::Method::POST,
            &format!("/v1/table/{table}"),
            Some(body.to_vec()),
        )
        .await;
    }
    Ok(Json(serde_json::json!({ "table": table, "created": true })))
}

async fn table_describe(
    State(services): State<Arc<Services>>,
    Path(table): Path<String>,
) -> ApiResult {
    let table = services.db.require_table(&table)?;
    Ok(Json(table.describe()))
}

async fn table_drop(
    State(services): State<Arc<Services>>,
    Path(table): Path<String>,
    Query(params): Params,
) -> ApiResult {
    {
        let services = services.clone();
        let name = table.clone();
        tokio::task::spawn_blocking(move || {
            services.pool.suspend_async();
            services.pool.purge_by_table(&name);
            let dropped = services.db.drop_table(&name);
            services.pool.resume_async();
            dropped
        })
        .await
        .map_err(|_| Error::run_time(ErrorCode::GeneralError, "drop task failed"))??;
    }
    if !is_forwarded(&params) {
        forward(
            &services,
            reqwest::Method::DELETE,
            &format!("/v1/table/{table}"),
            None,
        )
        .await;
    }
    Ok(Json(serde_json::json!({ "table": table, "dropped": true })))
}

async fn property_add(
    State(services): State<Arc<Services>>,
    Path((table, name)): Path<(String, String)>,
    Query(params): Params,
) -> ApiResult {
    let found = services.db.require_table(&table)?;
    let ptype = crate::table::properties::PropType::parse(
        params.get("type").map(|s| s.as_str()).unwrap_or("text"),
    )?;
    let is_set = params.contains_key("is_set");
    let is_customer = params.contains_key("is_customer");
    found
        .properties
        .write()
        .add(&name, ptype, is_set, is_customer)?;
    services.db.save_table_config(&found)?;

    if !is_forwarded(&params) {
        let mut path = format!("/v1/table/{table}/property/{name}?type={}", params
            .get("type")
            .map(|s| s.as_str())
            .unwrap_or("text"));
        if is_set {
            path.push_str("&is_set");
        }
        if is_customer {
            path.push_str("&is_customer");
        }
        forward(&services, reqwest::Method::PUT, &path, None).await;
    }
    Ok(Json(serde_json::json!({ "property": name, "added": true })))
}

async fn property_drop(
    State(services): State<Arc<Services>>,
    Path((table, name)): Path<(String, String)>,
    Query(params): Params,
) -> ApiResult {
    let found = services.db.require_table(&table)?;
    found.properties.write().soft_delete(&name)?;
    services.db.save_table_config(&found)?;
    if !is_forwarded(&params) {
        forward(
            &services,
            reqwest::Method::DELETE,
            &format!("/v1/table/{table}/property/{name}"),
            None,
        )
        .await;
    }
    Ok(Json(serde_json::json!({ "property": name, "dropped": true })))
}

// ---- insert -------------------------------------------------------------

async fn insert(
    State(services): State<Arc<Services>>,
    Path(table): Path<String>,
    Query(params): Params,
    body: Bytes,
) -> ApiResult {
    let found = services.db.require_table(&table)?;
    let rows: Vec<serde_json::Value> = serde_json::from_slice(&body)
        .map_err(|_| Error::insert("insert body must be a JSON array"))?;

    let partition_max = services.pool.partition_max();
    if partition_max == 0 {
        return Err(Error::config("cluster not initialized").into());
    }

    let node_id = services.mapper.node_id();
    let mut by_partition: HashMap<usize, Vec<Vec<u8>>> = HashMap::new();
    let mut accepted = 0usize;
    for row in &rows {
        let id = row
            .get("person")
            .or_else(|| row.get("id"))
            .or_else(|| row.get("profile"));
        let id_text = match id {
            Some(serde_json::Value::String(s)) if !s.is_empty() => s.to_lowercase(),
            Some(serde_json::Value::Number(n)) => n.to_string(),
            _ => continue, // malformed rows are skipped
        };
        if !row.get("_").map(|a| a.is_object()).unwrap_or(false) {
            continue;
        }
        let partition =
            crate::common::partition_for(crate::common::hash_customer_id(&id_text), partition_max);
        // owners and clones both log the row; other partitions are
        // covered by peers when the batch forwards
        let state = services.mapper.partition_map.get_state(partition, node_id);
        if state == NodeState::ActiveOwner || state == NodeState::ActiveClone {
            by_partition
                .entry(partition)
                .or_default()
                .push(serde_json::to_vec(row)?);
            accepted += 1;
        } else if services.mapper.partition_map.owner_of(partition).is_some() {
            accepted += 1; // a peer will log it
        }
    }

    let mut touched = Vec::new();
    for (partition, batch) in by_partition {
        services.log.append(found.name(), partition, &batch)?;
        touched.push(partition);
    }

    if !is_forwarded(&params) {
        forward(
            &services,
            reqwest::Method::POST,
            &format!("/v1/insert/{table}"),
            Some(body.to_vec()),
        )
        .await;
    }

    // back-pressure: hold the reply until the local backlog drains
    let limit = services.config.insert_backlog_limit;
    loop {
        let worst = touched
            .iter()
            .map(|p| services.log.backlog(found.name(), *p))
            .max()
            .unwrap_or(0);
        if worst <= limit {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    }

    if accepted > 0 {
        Ok(Json(serde_json::json!({ "message": "yummy" })))
    } else {
        Err(Error::insert("no insertable rows (missing id or '_')").into())
    }
}

// ---- queries ------------------------------------------------------------

async fn query_event(
    State(services): State<Arc<Services>>,
    Path(table): Path<String>,
    Query(params): Params,
    body: Bytes,
) -> ApiResult {
    let source = String::from_utf8_lossy(&body).into_owned();
    let segments = fork::segment_list(&params);
    let doc = fork::fork_event_query(&services, &table, &source, &segments, &params).await?;
    Ok(Json(doc))
}

async fn query_segment(
    State(services): State<Arc<Services>>,
    Path(table): Path<String>,
    Query(params): Params,
    body: Bytes,
) -> ApiResult {
    let found = services.db.require_table(&table)?;
    let source = String::from_utf8_lossy(&body).into_owned();
    let sections = query::parse_sections(&source)?;

    let mut installed = Vec::new();
    {
        let schema = found.properties.read().clone();
        for section in &sections {
            if section.kind != SectionKind::Segment {
                continue;
            }
            let macros = query::compile_section(section, &schema)?;
            found.set_segment(&section.name, &section.body, macros, section.flags.clone());
            installed.push(section.name.clone());
        }
    }
    if installed.is_empty() {
        return Err(Error::parse(
            ErrorCode::SyntaxError,
            "no @segment sections in document",
        )
        .into());
    }
    services.db.save_table_config(&found)?;

    if !is_forwarded(&params) {
        forward(
            &services,
            reqwest::Method::POST,
            &format!("/v1/query/{table}/segment"),
            Some(body.to_vec()),
        )
        .await;
    }
    Ok(Json(serde_json::json!({ "segments": installed })))
}

async fn query_customer(
    State(services): State<Arc<Services>>,
    Path(table): Path<String>,
    Query(params): Params,
) -> ApiResult {
    let id = params
        .get("id")
        .cloned()
        .ok_or_else(|| Error::config("id parameter required"))?;
    let partition_max = services.pool.partition_max();
    if partition_max == 0 {
        return Err(Error::config("cluster not initialized").into());
    }
    let partition = OpenLoopCustomer::home_partition(&id, partition_max);

    // not ours: proxy to the owner
    let owner = services.mapper.partition_map.owner_of(partition);
    if owner != Some(services.mapper.node_id()) {
        let Some(route) = owner.and_then(|node| services.mapper.get_route(node)) else {
            return Err(Error::route_error(format!("partition {partition} unowned")).into());
        };
        let url = format!(
            "{}/v1/query/{}/customer?id={}&forwarded=true",
            route.base_url(),
            table,
            id
        );
        let response = reqwest::Client::new()
            .get(url)
            .send()
            .await
            .map_err(|e| Error::route_error(e.to_string()))?;
        let doc: serde_json::Value = response
            .json()
            .await
            .map_err(|e| Error::internode(ErrorCode::InternodeError, e.to_string()))?;
        return Ok(Json(doc));
    }

    let (tx, rx) = tokio::sync::oneshot::channel();
    services
        .pool
        .queue_cell(partition, Box::new(OpenLoopCustomer::new(&table, &id, tx)));
    let doc = rx
        .await
        .map_err(|_| Error::run_time(ErrorCode::GeneralError, "customer cell dropped"))??;
    Ok(Json(doc))
}

async fn query_property(
    State(services): State<Arc<Services>>,
    Path((table, name)): Path<(String, String)>,
    Query(params): Params,
) -> ApiResult {
    let filter = PropertyFilter {
        gt: params.get("gt").and_then(|v| v.parse().ok()),
        gte: params.get("gte").and_then(|v| v.parse().ok()),
        lt: params.get("lt").and_then(|v| v.parse().ok()),
        lte: params.get("lte").and_then(|v| v.parse().ok()),
        eq: params.get("eq").and_then(|v| v.parse().ok()),
        between: params.get("between").and_then(|v| {
            let (lo, hi) = v.split_once(',')?;
            let and = params.get("and");
            let hi = if hi.is_empty() {
                and.and_then(|a| a.parse().ok())?
            } else {
                hi.parse().ok()?
            };
            Some((lo.parse().ok()?, hi))
        }),
        rx: params.get("rx").cloned(),
        sub: params.get("sub").cloned(),
        bucket: params.get("bucket").and_then(|v| v.parse().ok()),
    };
    let segments = fork::segment_list(&params);
    let doc = fork::fork_property_query(&services, &table, &name, &filter, &segments).await?;
    Ok(Json(doc))
}

async fn query_histogram(
    State(services): State<Arc<Services>>,
    Path((table, name)): Path<(String, String)>,
    Query(params): Params,
    body: Bytes,
) -> ApiResult {
    let source = String::from_utf8_lossy(&body).into_owned();
    let doc = fork::fork_histogram_query(&services, &table, &name, &source, &params).await?;
    Ok(Json(doc))
}

async fn query_batch(
    State(services): State<Arc<Services>>,
    Path(table): Path<String>,
    Query(params): Params,
    body: Bytes,
) -> ApiResult {
    let source = String::from_utf8_lossy(&body).into_owned();
    let sections = query::parse_sections(&source)?;
    let found = services.db.require_table(&table)?;

    let mut out = serde_json::Map::new();
    for section in &sections {
        match section.kind {
            SectionKind::Segment => {
                let schema = found.properties.read().clone();
                let macros = query::compile_section(section, &schema)?;
                found.set_segment(&section.name, &section.body, macros, section.flags.clone());
                out.insert(section.name.clone(), serde_json::json!({ "segment": true }));
            }
            SectionKind::Query => {
                let segments = fork::segment_list(&params);
                let doc = fork::fork_event_query(
                    &services,
                    &table,
                    &section.body,
                    &segments,
                    &params,
                )
                .await?;
                out.insert(section.name.clone(), doc);
            }
        }
    }
    services.db.save_table_config(&found)?;
    Ok(Json(serde_json::Value::Object(out)))
}

// ---- subscriptions ------------------------------------------------------

async fn subscription_add(
    State(services): State<Arc<Services>>,
    Path((table, segment, sub)): Path<(String, String, String)>,
    Query(params): Params,
    body: Bytes,
) -> ApiResult {
    let found = services.db.require_table(&table)?;
    let spec: serde_json::Value = serde_json::from_slice(&body)?;
    let subscriber = Subscriber {
        segment: segment.clone(),
        name: sub.clone(),
        host: spec
            .get("host")
            .and_then(|h| h.as_str())
            .ok_or_else(|| Error::config("subscriber host required"))?
            .to_string(),
        port: spec.get("port").and_then(|p| p.as_u64()).unwrap_or(80) as u16,
        path: spec
            .get("path")
            .and_then(|p| p.as_str())
            .unwrap_or("/")
            .to_string(),
        retention_ms: spec
            .get("retention")
            .and_then(|r| r.as_i64())
            .unwrap_or(3_600_000),
    };
    {
        let mut subscribers = found.subscribers.write();
        subscribers.retain(|s| !(s.segment == segment && s.name == sub));
        subscribers.push(subscriber);
    }
    services.db.save_table_config(&found)?;

    if !is_forwarded(&params) {
        forward(
            &services,
            reqwest::Method::PUT,
            &format!("/v1/subscription/{table}/{segment}/{sub}"),
            Some(body.to_vec()),
        )
        .await;
    }
    Ok(Json(serde_json::json!({ "subscription": sub, "segment": segment })))
}

// ---- internode ----------------------------------------------------------

async fn internode_is_member(State(services): State<Arc<Services>>) -> ApiResult {
    Ok(Json(serde_json::json!({
        "member": true,
        "node": services.mapper.node_name(),
    })))
}

async fn internode_map_change(
    State(services): State<Arc<Services>>,
    Json(snapshot): Json<MapSnapshot>,
) -> ApiResult {
    let cloned = services.clone();
    tokio::task::spawn_blocking(move || cluster::apply_map_snapshot(&cloned, &snapshot))
        .await
        .map_err(|_| Error::run_time(ErrorCode::GeneralError, "map apply failed"))?;
    Ok(Json(serde_json::json!({ "map": "applied" })))
}

async fn internode_transfer(
    State(services): State<Arc<Services>>,
    body: Bytes,
) -> ApiResult {
    let (doc, _): (sentinel::TransferDoc, usize) =
        bincode::serde::decode_from_slice(&body, bincode::config::standard())
            .map_err(|e| Error::internode(ErrorCode::InternodeError, e.to_string()))?;
    let cloned = services.clone();
    tokio::task::spawn_blocking(move || sentinel::apply_transfer(&cloned, doc))
        .await
        .map_err(|_| Error::run_time(ErrorCode::GeneralError, "transfer apply failed"))?;
    Ok(Json(serde_json::json!({ "transfer": "applied" })))
}

async fn internode_push_transfer(
    State(services): State<Arc<Services>>,
    Query(params): Params,
) -> ApiResult {
    let partition: usize = params
        .get("partition")
        .and_then(|p| p.parse().ok())
        .ok_or_else(|| Error::config("partition required"))?;
    let target: i64 = params
        .get("target")
        .and_then(|t| t.parse().ok())
        .ok_or_else(|| Error::config("target required"))?;

    let cloned = services.clone();
    let ok = tokio::task::spawn_blocking(move || {
        let client = reqwest::blocking::Client::new();
        sentinel::transfer(&cloned, &client, partition, cloned.mapper.node_id(), target)
    })
    .await
    .unwrap_or(false);
    if ok {
        Ok(Json(serde_json::json!({ "pushed": true })))
    } else {
        Err(Error::internode(ErrorCode::InternodeError, "push transfer failed").into())
    }
}

async fn internode_translog(
    State(services): State<Arc<Services>>,
    Query(params): Params,
    body: Bytes,
) -> ApiResult {
    let table = params
        .get("table")
        .cloned()
        .ok_or_else(|| Error::config("table required"))?;
    let partition: usize = params
        .get("partition")
        .and_then(|p| p.parse().ok())
        .ok_or_else(|| Error::config("partition required"))?;
    services.log.append_block(&table, partition, &body)?;
    Ok(Json(serde_json::json!({ "translog": "appended" })))
}

/// Peer-side of a query fork: run the local partitions and reply in the
/// internode binary format.
async fn internode_query(
    State(services): State<Arc<Services>>,
    Json(request): Json<fork::InternodeQuery>,
) -> std::result::Result<Vec<u8>, ApiError> {
    let buffer = fork::run_internode_query(&services, request).await?;
    Ok(buffer)
}
