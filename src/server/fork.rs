// Query forking. The originator compiles the query, asks every node
// (itself included) to run its owned partitions, and sort-merges the
// replies. Forks that overlap a map change, or that hit a migrated
// partition or dead route, are re-issued with quadratic back-off.

use crate::cells::{
    Collector, OpenLoopHistogram, OpenLoopProperty, OpenLoopQuery, PropertyFilter,
};
use crate::common::{now_ms, scale_double};
use crate::error::{Error, ErrorCode, Result};
use crate::query::{self, Macro, Modifier};
use crate::result::muxdemux::{self, ColumnMeta, SortOrder};
use crate::result::{merge_sets, ResultSet};
use crate::scheduler::Cell;
use crate::table::properties::PropType;
use crate::Services;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

const MAX_FORK_RETRIES: u32 = 8;
const BACKOFF_UNIT_MS: u64 = 20;
const BACKOFF_CAP_MS: u64 = 10_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryMode {
    Event,
    Histogram,
    Property,
}

/// The fork payload a peer executes against its owned partitions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InternodeQuery {
    pub table: String,
    pub mode: QueryMode,
    #[serde(default)]
    pub query: Option<String>,
    #[serde(default)]
    pub segments: Vec<String>,
    #[serde(default)]
    pub property: Option<String>,
    #[serde(default)]
    pub filter: Option<PropertyFilter>,
    #[serde(default)]
    pub bucket: Option<f64>,
    #[serde(default)]
    pub foreach: Option<String>,
}

pub fn segment_list(params: &HashMap<String, String>) -> Vec<String> {
    params
        .get("segments")
        .map(|s| {
            s.split(',')
                .map(|name| name.trim().to_string())
                .filter(|name| !name.is_empty())
                .collect()
        })
        .unwrap_or_default()
}

/// Accumulator layout for one compiled query: per-column modifiers
/// repeated across segment lanes, plus the emit metadata.
fn event_layout(macros: &Macro, lane_count: usize) -> (usize, Vec<Modifier>, Vec<ColumnMeta>) {
    let columns: Vec<ColumnMeta> = macros
        .aggs
        .iter()
        .map(|agg| ColumnMeta {
            name: agg.name.clone(),
            modifier: agg.modifier,
            is_double: agg
                .prop
                .map(|slot| macros.props[slot as usize].ptype == PropType::Double)
                .unwrap_or(false),
        })
        .collect();
    let width = columns.len() * lane_count;
    let modifiers: Vec<Modifier> = (0..lane_count)
        .flat_map(|_| columns.iter().map(|c| c.modifier))
        .collect();
    (width, modifiers, columns)
}

fn count_layout(lane_count: usize) -> (usize, Vec<Modifier>, Vec<ColumnMeta>) {
    let columns = vec![ColumnMeta {
        name: "count".to_string(),
        modifier: Modifier::Count,
        is_double: false,
    }];
    (lane_count, vec![Modifier::Count; lane_count], columns)
}

fn layout_for(services: &Arc<Services>, request: &InternodeQuery) -> Result<(usize, Vec<Modifier>)> {
    match request.mode {
        QueryMode::Event => {
            let table = services.db.require_table(&request.table)?;
            let schema = table.properties.read().clone();
            let source = request.query.as_deref().unwrap_or("");
            let macros = query::compile(source, &schema)?;
            let (width, modifiers, _) = event_layout(&macros, 1 + request.segments.len());
            Ok((width, modifiers))
        }
        QueryMode::Histogram => Ok((1, vec![Modifier::Count])),
        QueryMode::Property => {
            let lanes = 1 + request.segments.len();
            Ok((lanes, vec![Modifier::Count; lanes]))
        }
    }
}

fn owned_partitions(services: &Arc<Services>) -> Vec<usize> {
    let node = services.mapper.node_id();
    services
        .mapper
        .partition_map
        .partitions_by_node(node)
        .into_iter()
        .filter(|&p| {
            services.mapper.partition_map.get_state(p, node)
                == crate::cluster::NodeState::ActiveOwner
        })
        .collect()
}

/// Run a fork request against this node's owned partitions and merge
/// the per-partition results.
async fn run_local(services: &Arc<Services>, request: &InternodeQuery) -> Result<ResultSet> {
    let (width, modifiers) = layout_for(services, request)?;
    let partitions = owned_partitions(services);
    if partitions.is_empty() {
        let mut empty = ResultSet::new(width);
        empty.is_premerged = true;
        return Ok(empty);
    }

    let macros: Option<Arc<Macro>> = match request.mode {
        QueryMode::Property => None,
        _ => {
            let table = services.db.require_table(&request.table)?;
            let schema = table.properties.read().clone();
            Some(query::compile(
                request.query.as_deref().unwrap_or(""),
                &schema,
            )?)
        }
    };

    let (tx, rx) = tokio::sync::oneshot::channel();
    let collector = Collector::new(partitions.len(), tx);

    for &partition in &partitions {
        let cell: Box<dyn Cell> = match request.mode {
            QueryMode::Event => Box::new(OpenLoopQuery::new(
                &request.table,
                macros.clone().unwrap(),
                request.segments.clone(),
                collector.clone(),
            )),
            QueryMode::Histogram => Box::new(OpenLoopHistogram::new(
                &request.table,
                macros.clone().unwrap(),
                request.bucket.map(scale_double).unwrap_or(0),
                request.foreach.clone(),
                collector.clone(),
            )),
            QueryMode::Property => Box::new(OpenLoopProperty::new(
                &request.table,
                request.property.as_deref().unwrap_or(""),
                request.filter.clone().unwrap_or_default(),
                request.segments.clone(),
                collector.clone(),
            )),
        };
        services.pool.queue_cell(partition, cell);
    }

    rx.await
        .map_err(|_| Error::run_time(ErrorCode::GeneralError, "query collector dropped"))?;
    let (sets, error) = collector.take();
    if let Some(error) = error {
        return Err(error);
    }
    Ok(merge_sets(sets, width, &modifiers))
}

/// Peer entry point: run locally and encode for the wire.
pub async fn run_internode_query(
    services: &Arc<Services>,
    request: InternodeQuery,
) -> Result<Vec<u8>> {
    let (width, _) = layout_for(services, &request)?;
    let mut merged = run_local(services, &request).await?;
    Ok(muxdemux::multiset_to_internode(
        std::slice::from_mut(&mut merged),
        width,
    ))
}

/// Fork to every node, retrying when the dispatch overlapped a map
/// change or hit a retryable internode error.
async fn fork(services: &Arc<Services>, request: &InternodeQuery) -> Result<ResultSet> {
    let (width, modifiers) = layout_for(services, request)?;
    let client = reqwest::Client::new();

    let mut attempt: u32 = 0;
    loop {
        let started = now_ms();
        let mut sets: Vec<ResultSet> = Vec::new();
        let mut retryable: Option<Error> = None;

        match run_local(services, request).await {
            Ok(set) => sets.push(set),
            Err(e) if e.is_retryable() => retryable = Some(e),
            Err(e) => return Err(e),
        }

        if retryable.is_none() {
            let self_id = services.mapper.node_id();
            let peers: Vec<_> = services
                .mapper
                .routes()
                .into_iter()
                .filter(|r| r.node_id != self_id && !r.failed)
                .collect();
            let calls = peers.iter().map(|route| {
                let client = client.clone();
                let url = format!("{}/v1/internode/query", route.base_url());
                let body = request.clone();
                async move {
                    let response = client.post(url).json(&body).send().await?;
                    response.bytes().await
                }
            });
            let responses = futures::future::join_all(calls).await;
            for (route, response) in peers.iter().zip(responses) {
                match response {
                    Ok(bytes) if muxdemux::is_internode(&bytes) => {
                        sets.push(muxdemux::internode_to_result_set(&bytes, width)?);
                    }
                    Ok(bytes) => {
                        // a JSON error envelope instead of binary
                        let error = parse_error_envelope(&bytes).unwrap_or_else(|| {
                            Error::internode(
                                ErrorCode::InternodeError,
                                "malformed internode reply",
                            )
                        });
                        if error.is_retryable() {
                            retryable = Some(error);
                        } else {
                            return Err(error);
                        }
                    }
                    Err(e) => {
                        services.mapper.mark_route_failed(route.node_id);
                        retryable = Some(Error::route_error(e.to_string()));
                    }
                }
            }
        }

        let overlapped = services.mapper.was_during_map_change(started, now_ms());
        if retryable.is_none() && !overlapped {
            return Ok(merge_sets(sets, width, &modifiers));
        }

        attempt += 1;
        if attempt > MAX_FORK_RETRIES {
            return Err(retryable.unwrap_or_else(|| {
                Error::internode(ErrorCode::InternodeError, "fork retries exhausted")
            }));
        }
        let backoff = (BACKOFF_UNIT_MS * (attempt as u64).pow(2)).min(BACKOFF_CAP_MS);
        tokio::time::sleep(std::time::Duration::from_millis(backoff)).await;
    }
}

fn parse_error_envelope(bytes: &[u8]) -> Option<Error> {
    let value: serde_json::Value = serde_json::from_slice(bytes).ok()?;
    let inner = value.get("error")?;
    let class = serde_json::from_value(inner.get("class")?.clone()).ok()?;
    let code = serde_json::from_value(inner.get("code")?.clone()).ok()?;
    let detail = inner.get("detail")?.as_str()?.to_string();
    Some(Error::new(class, code, detail))
}

fn apply_output_params(
    doc: &mut serde_json::Value,
    columns: &[ColumnMeta],
    params: &HashMap<String, String>,
) {
    let order = match params.get("order").map(|s| s.as_str()) {
        Some("desc") => SortOrder::Desc,
        _ => SortOrder::Asc,
    };
    match params.get("sort").map(|s| s.as_str()) {
        Some("group") | Some("key") => muxdemux::json_sort_by_group(doc, order),
        Some(column) => muxdemux::json_sort_by_column(doc, columns, column, order),
        None => {}
    }
    if let (Some(bucket), Some(min), Some(max)) = (
        params.get("bucket").and_then(|v| v.parse::<f64>().ok()),
        params.get("min").and_then(|v| v.parse::<f64>().ok()),
        params.get("max").and_then(|v| v.parse::<f64>().ok()),
    ) {
        muxdemux::json_histogram_fill(doc, bucket, min, max);
    }
    if let Some(trim) = params.get("trim").and_then(|v| v.parse::<usize>().ok()) {
        muxdemux::json_trim(doc, trim);
    }
}

pub async fn fork_event_query(
    services: &Arc<Services>,
    table: &str,
    source: &str,
    segments: &[String],
    params: &HashMap<String, String>,
) -> Result<serde_json::Value> {
    // compile once up front so parse errors surface before any fork
    let found = services.db.require_table(table)?;
    let schema = found.properties.read().clone();
    let macros = query::compile(source, &schema)?;
    let lane_count = 1 + segments.len();
    let (_, _, columns) = event_layout(&macros, lane_count);

    let request = InternodeQuery {
        table: table.to_string(),
        mode: QueryMode::Event,
        query: Some(source.to_string()),
        segments: segments.to_vec(),
        property: None,
        filter: None,
        bucket: None,
        foreach: None,
    };
    let merged = fork(services, &request).await?;
    let mut doc = muxdemux::result_set_to_json(&merged, &columns, lane_count);
    apply_output_params(&mut doc, &columns, params);
    Ok(doc)
}

pub async fn fork_histogram_query(
    services: &Arc<Services>,
    table: &str,
    name: &str,
    source: &str,
    params: &HashMap<String, String>,
) -> Result<serde_json::Value> {
    let found = services.db.require_table(table)?;
    let schema = found.properties.read().clone();
    let macros = query::compile(source, &schema)?;
    if !macros.capture_return {
        return Err(Error::parse(
            ErrorCode::MissingFunctionEntryPoint,
            "histogram script must return a value",
        ));
    }

    let request = InternodeQuery {
        table: table.to_string(),
        mode: QueryMode::Histogram,
        query: Some(source.to_string()),
        segments: Vec::new(),
        property: None,
        filter: None,
        bucket: params.get("bucket").and_then(|v| v.parse().ok()),
        foreach: params.get("foreach").cloned(),
    };
    let merged = fork(services, &request).await?;
    let (_, _, columns) = count_layout(1);
    let mut doc = muxdemux::result_set_to_json(&merged, &columns, 1);
    apply_output_params(&mut doc, &columns, params);
    let mut out = serde_json::Map::new();
    out.insert(name.to_string(), doc);
    Ok(serde_json::Value::Object(out))
}

pub async fn fork_property_query(
    services: &Arc<Services>,
    table: &str,
    property: &str,
    filter: &PropertyFilter,
    segments: &[String],
) -> Result<serde_json::Value> {
    let request = InternodeQuery {
        table: table.to_string(),
        mode: QueryMode::Property,
        query: None,
        segments: segments.to_vec(),
        property: Some(property.to_string()),
        filter: Some(filter.clone()),
        bucket: None,
        foreach: None,
    };
    let merged = fork(services, &request).await?;
    let lane_count = 1 + segments.len();
    let (_, _, columns) = count_layout(lane_count);
    let mut doc = muxdemux::result_set_to_json(&merged, &columns, lane_count);
    if let Some(bucket) = filter.bucket {
        // dense fill across the observed range
        let rows = doc.get("_").and_then(|v| v.as_array());
        let (min, max) = rows
            .map(|rows| {
                let keys: Vec<f64> = rows
                    .iter()
                    .filter_map(|r| r.get("g").and_then(|g| g.as_f64()))
                    .collect();
                (
                    keys.iter().cloned().fold(f64::INFINITY, f64::min),
                    keys.iter().cloned().fold(f64::NEG_INFINITY, f64::max),
                )
            })
            .unwrap_or((f64::INFINITY, f64::NEG_INFINITY));
        if min.is_finite() && max.is_finite() {
            muxdemux::json_histogram_fill(&mut doc, bucket, min, max);
        }
    }
    let mut out = serde_json::Map::new();
    out.insert(property.to_string(), doc);
    Ok(serde_json::Value::Object(out))
}
