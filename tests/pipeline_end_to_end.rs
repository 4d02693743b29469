use serde_json::json;

use copysentry::extract::{decode_envelope, marker_json, require_u64, ExtractPath};
use copysentry::store::{ingest, DealStore, IngestStatus, MemoryStore};

const SUCCESS_CODE: &str = "000000";
const MARKER_ID: &str = "__APP_DATA";
const APP_DATA_PATH: &str =
    "appState.loader.dataByRouteId.d6a9.dehydratedState.queries.1.state.data.data";

fn history_body() -> String {
    json!({
        "code": "000000",
        "message": null,
        "messageDetail": null,
        "data": {
            "list": [
                {"symbol": "BTCUSDT", "side": "BUY", "avgPrice": "42000.10", "executedQty": "0.50"},
                {"symbol": "ETHUSDT", "side": "SELL", "avgPrice": "3105.20", "executedQty": "1.20"},
            ]
        },
        "success": true
    })
    .to_string()
}

fn lead_page(count: u64) -> String {
    let app_data = json!({
        "appState": {
            "loader": {
                "dataByRouteId": {
                    "d6a9": {
                        "dehydratedState": {
                            "queries": [
                                {"state": {"data": {"data": {"futureType": "USDT"}}}},
                                {"state": {"data": {"data": {
                                    "currentCopyCount": count,
                                    "maxCopyCount": 2000,
                                    "nickname": "lead"
                                }}}},
                            ]
                        }
                    }
                }
            }
        }
    });
    format!(
        "<!DOCTYPE html><html><head><title>lead</title></head><body>\
         <div id=\"app\"></div>\
         <script id=\"__APP_DATA\" type=\"application/json\">{app_data}</script>\
         </body></html>"
    )
}

#[test]
fn history_page_ingests_once_then_deduplicates() {
    let mut store = MemoryStore::new();

    let rows = decode_envelope(&history_body(), SUCCESS_CODE).expect("decode history page");
    assert_eq!(rows.len(), 2);
    let first: Vec<IngestStatus> = rows
        .iter()
        .map(|r| ingest(&mut store, r).expect("ingest"))
        .collect();
    assert_eq!(first, vec![IngestStatus::Inserted, IngestStatus::Inserted]);
    assert_eq!(store.len(), 2);

    // The next poll returns the same page; nothing new may land.
    let rows = decode_envelope(&history_body(), SUCCESS_CODE).expect("decode history page again");
    let second: Vec<IngestStatus> = rows
        .iter()
        .map(|r| ingest(&mut store, r).expect("ingest"))
        .collect();
    assert_eq!(second, vec![IngestStatus::Duplicate, IngestStatus::Duplicate]);
    assert_eq!(store.len(), 2);
}

#[test]
fn lead_page_yields_the_copy_count() {
    let body = lead_page(1234);
    let root = marker_json(&body, MARKER_ID).expect("embedded payload");
    let leaf = ExtractPath::parse(APP_DATA_PATH).walk(&root).expect("walk route data");
    assert_eq!(require_u64(leaf, "currentCopyCount").expect("count"), 1234);
}

#[test]
fn each_parse_stage_fails_distinctly() {
    // Upstream served an error page: the marker is gone.
    let err = marker_json("<html><body>503 backend unavailable</body></html>", MARKER_ID)
        .expect_err("no marker");
    assert_eq!(err.stage(), "marker-not-found");

    // The marker survived but its payload was truncated.
    let err = marker_json("<script id=\"__APP_DATA\">{\"appState\":</script>", MARKER_ID)
        .expect_err("broken payload");
    assert_eq!(err.stage(), "json-decode");

    // Valid payload whose shape moved out from under the configured path.
    let body = lead_page(1234).replace("dataByRouteId", "dataByRoute");
    let root = marker_json(&body, MARKER_ID).expect("embedded payload");
    let err = ExtractPath::parse(APP_DATA_PATH)
        .walk(&root)
        .expect_err("moved shape");
    assert_eq!(err.stage(), "path-traversal");
}

#[test]
fn rejected_envelope_surfaces_the_upstream_code() {
    let body = json!({
        "code": "100002",
        "message": "system busy",
        "data": null,
        "success": false
    })
    .to_string();

    let err = decode_envelope(&body, SUCCESS_CODE).expect_err("non-success code");
    assert_eq!(err.stage(), "api");
    let text = err.to_string();
    assert!(text.contains("100002"), "code missing from: {text}");
    assert!(text.contains("system busy"), "message missing from: {text}");
}
