// DANS : src/monitoring/metrics.rs

use lazy_static::lazy_static;
use prometheus::{
    Encoder, Histogram, IntCounter, IntCounterVec, IntGauge, TextEncoder, register_histogram,
    register_int_counter, register_int_counter_vec, register_int_gauge,
};
use warp::Filter;

lazy_static! {
    // --- Ingestion ---
    pub static ref EVENTS_RECEIVED: IntCounterVec = register_int_counter_vec!(
        "sniper_events_received_total", "Événements bruts reçus, par source",
        &["source"]
    ).unwrap();
    pub static ref SOURCE_RECONNECTS: IntCounterVec = register_int_counter_vec!(
        "sniper_source_reconnects_total", "Reconnexions des sources de flux",
        &["source"]
    ).unwrap();
    pub static ref SOURCE_STATE_TRANSITIONS: IntCounterVec = register_int_counter_vec!(
        "sniper_source_state_transitions_total", "Transitions de la machine à états des sources",
        &["source", "state"]
    ).unwrap();

    // --- Fan-in & déduplication ---
    pub static ref DUPLICATES_DROPPED: IntCounterVec = register_int_counter_vec!(
        "sniper_duplicates_dropped_total", "Signatures écartées par la fenêtre de déduplication",
        &["source"]
    ).unwrap();
    pub static ref EVENTS_FORWARDED: IntCounter = register_int_counter!(
        "sniper_events_forwarded_total", "Événements uniques transmis au dispatcher"
    ).unwrap();
    pub static ref LAST_EVENT_UNIX_SECONDS: IntGauge = register_int_gauge!(
        "sniper_last_event_unix_seconds", "Timestamp Unix du dernier événement transmis"
    ).unwrap();

    // --- Résolution & décision ---
    pub static ref RESOLUTION_FAILURES: IntCounter = register_int_counter!(
        "sniper_resolution_failures_total", "Tables de correspondance irrécupérables"
    ).unwrap();
    pub static ref DISPATCH_DROPS: IntCounterVec = register_int_counter_vec!(
        "sniper_dispatch_drops_total", "Événements abandonnés par le dispatcher",
        &["reason"] // "decode" / "resolution"
    ).unwrap();
    pub static ref DISPATCH_ACTIONS: IntCounterVec = register_int_counter_vec!(
        "sniper_dispatch_actions_total", "Décisions prises par le dispatcher",
        &["action"] // "buy", "delayed_buy", "burst_sell", "chunk_sell", "untrack"
    ).unwrap();
    pub static ref DISPATCH_SECONDS: Histogram = register_histogram!(
        "sniper_dispatch_seconds", "Latence de traitement d'un événement par le dispatcher"
    ).unwrap();

    // --- État des pools & trades ---
    pub static ref TRACKED_POOLS: IntGauge = register_int_gauge!(
        "sniper_tracked_pools", "Pools actuellement sous suivi"
    ).unwrap();
    pub static ref TRADE_TRANSITIONS: IntCounterVec = register_int_counter_vec!(
        "sniper_trade_transitions_total", "Transitions de statut des fiches de trade",
        &["status"]
    ).unwrap();

    // --- Soumission ---
    pub static ref SUBMISSIONS: IntCounterVec = register_int_counter_vec!(
        "sniper_submissions_total", "Soumissions de transactions, par canal et issue",
        &["channel", "status"]
    ).unwrap();
}

pub async fn start_metrics_server() {
    let metrics_route = warp::path!("metrics").map(|| {
        let encoder = TextEncoder::new();
        let mut buffer = vec![];
        encoder.encode(&prometheus::gather(), &mut buffer).unwrap();
        warp::reply::with_header(buffer, "content-type", "text/plain; version=0.0.4")
    });
    println!("[Monitoring] Serveur de métriques exposé sur http://0.0.0.0:9100/metrics");
    warp::serve(metrics_route).run(([0, 0, 0, 0], 9100)).await;
}
