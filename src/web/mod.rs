use axum::{
    extract::{rejection::JsonRejection, Query, State},
    http::StatusCode,
    response::{Html, IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::json;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tracing::error;

use crate::db::models::StoredRun;
use crate::db::Database;
use crate::model::convert::{correction_percentage, format_correction, format_time};
use crate::model::stats::VenueGenderStat;
use crate::model::{ConvertError, Gender, TimeConverter, VenueStatistics};

#[derive(Clone)]
pub struct AppState {
    pub db: Database,
}

/// Build the Axum router for the converter.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(index_handler))
        .route("/api/venues", get(venues_handler))
        .route("/api/convert", post(convert_handler))
        .route("/api/run", get(run_handler))
        .route("/api/stats", get(stats_handler))
        .layer(CorsLayer::permissive())
        .with_state(Arc::new(state))
}

impl IntoResponse for ConvertError {
    fn into_response(self) -> Response {
        let body = Json(json!({ "error": self.to_string(), "kind": self.kind() }));
        (StatusCode::BAD_REQUEST, body).into_response()
    }
}

pub enum ApiError {
    Convert(ConvertError),
    /// Body that is not a JSON object at all.
    BadRequest(String),
    NotFound(&'static str),
    Internal(anyhow::Error),
}

impl From<ConvertError> for ApiError {
    fn from(e: ConvertError) -> Self {
        ApiError::Convert(e)
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(e: anyhow::Error) -> Self {
        ApiError::Internal(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::Convert(e) => e.into_response(),
            ApiError::BadRequest(msg) => (
                StatusCode::BAD_REQUEST,
                Json(json!({ "error": msg, "kind": "InvalidRequest" })),
            )
                .into_response(),
            ApiError::NotFound(what) => (
                StatusCode::NOT_FOUND,
                Json(json!({ "error": what, "kind": "NotFound" })),
            )
                .into_response(),
            ApiError::Internal(e) => {
                error!("Request failed: {:#}", e);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(json!({ "error": e.to_string(), "kind": "Internal" })),
                )
                    .into_response()
            }
        }
    }
}

/// Serve the converter page.
async fn index_handler() -> impl IntoResponse {
    Html(CONVERTER_HTML)
}

#[derive(Debug, Deserialize)]
pub struct VenueQuery {
    pub gender: Option<String>,
}

#[derive(Debug, Serialize, PartialEq)]
pub struct VenueEntry {
    pub name: String,
    pub correction_seconds: f64,
    pub correction_percentage: f64,
    pub label: String,
}

/// GET /api/venues?gender=M
async fn venues_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<VenueQuery>,
) -> Result<Json<Vec<VenueEntry>>, ApiError> {
    let gender = match query.gender.as_deref() {
        None => Gender::Men,
        Some(g) => g.parse().map_err(|_| ConvertError::MissingGender)?,
    };
    let table = state.db.load_corrections()?;
    let baseline = table.baseline(gender);
    let baseline_median = baseline.map(|b| b.median_seconds).unwrap_or(0.0);

    let venues = table
        .for_gender(gender)
        .map(|r| {
            let pct = correction_percentage(r.correction_seconds, baseline_median);
            let label = if baseline.is_some_and(|b| b.venue == r.venue) {
                "Baseline".to_string()
            } else {
                format_correction(pct)
            };
            VenueEntry {
                name: r.venue.clone(),
                correction_seconds: r.correction_seconds,
                correction_percentage: pct,
                label,
            }
        })
        .collect();
    Ok(Json(venues))
}

/// Accepts any JSON scalar for a text field. Non-strings keep their JSON text
/// so `4200` reaches the time parser and fails there as a format error.
fn text_field<'de, D: Deserializer<'de>>(de: D) -> Result<Option<String>, D::Error> {
    let value = Option::<serde_json::Value>::deserialize(de)?;
    Ok(value.map(|v| match v {
        serde_json::Value::String(s) => s,
        other => other.to_string(),
    }))
}

#[derive(Debug, Default, Deserialize)]
pub struct ConvertRequest {
    #[serde(default, deserialize_with = "text_field")]
    pub finish_time: Option<String>,
    #[serde(default, deserialize_with = "text_field")]
    pub from_venue: Option<String>,
    /// Absent means "normalized".
    #[serde(default, deserialize_with = "text_field")]
    pub to_venue: Option<String>,
    #[serde(default, deserialize_with = "text_field")]
    pub gender: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ConvertResponse {
    pub original_time: String,
    pub original_seconds: f64,
    pub gender: Gender,
    pub from_venue: String,
    pub to_venue: String,
    pub converted_time: String,
    pub converted_seconds: f64,
    /// Unsigned, formatted; see `faster` for the direction.
    pub time_difference: String,
    pub time_difference_seconds: f64,
    pub faster: bool,
}

/// POST /api/convert
async fn convert_handler(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<ConvertRequest>, JsonRejection>,
) -> Result<Json<ConvertResponse>, ApiError> {
    let Json(req) = payload.map_err(|e| ApiError::BadRequest(e.body_text()))?;
    let finish_time = req.finish_time.unwrap_or_default();
    let table = state.db.load_corrections()?;
    let conv = TimeConverter::new(&table).convert_str(
        &finish_time,
        req.from_venue.as_deref().unwrap_or_default(),
        req.to_venue.as_deref().unwrap_or("normalized"),
        req.gender.as_deref(),
    )?;
    let diff = conv.difference_seconds();
    Ok(Json(ConvertResponse {
        original_time: finish_time.trim().to_string(),
        original_seconds: conv.original_seconds,
        gender: conv.gender,
        faster: conv.faster(),
        converted_time: format_time(conv.converted_seconds),
        converted_seconds: conv.converted_seconds,
        time_difference: format_time(diff.abs()),
        time_difference_seconds: diff,
        from_venue: conv.from_venue,
        to_venue: conv.to_venue,
    }))
}

/// GET /api/run
async fn run_handler(State(state): State<Arc<AppState>>) -> Result<Json<StoredRun>, ApiError> {
    state
        .db
        .latest_run()?
        .map(Json)
        .ok_or(ApiError::NotFound("no model run has been published"))
}

/// GET /api/stats
async fn stats_handler(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<VenueGenderStat>>, ApiError> {
    let results = state.db.load_results()?;
    let stats = VenueStatistics::compute(&results);
    Ok(Json(stats.all().cloned().collect()))
}

/// Embedded single-file converter (HTML + CSS + JS)
const CONVERTER_HTML: &str = r#"<!DOCTYPE html>
<html lang="en">
<head>
<meta charset="UTF-8">
<meta name="viewport" content="width=device-width, initial-scale=1.0">
<title>Course Correction Converter</title>
<style>
  :root {
    --bg: #0f1117;
    --card: #1a1d27;
    --border: #2a2d3a;
    --accent: #6c63ff;
    --green: #00c896;
    --red: #ff4f6a;
    --text: #e0e0e0;
    --muted: #8888aa;
  }
  * { box-sizing: border-box; margin: 0; padding: 0; }
  body { background: var(--bg); color: var(--text); font-family: 'Segoe UI', system-ui, sans-serif; }
  header { padding: 1rem 2rem; border-bottom: 1px solid var(--border); }
  header h1 { font-size: 1.4rem; font-weight: 700; }
  main { padding: 1.5rem 2rem; display: grid; gap: 1.5rem; grid-template-columns: 1fr 1fr; }
  @media (max-width: 768px) { main { grid-template-columns: 1fr; } }
  .panel { background: var(--card); border: 1px solid var(--border); border-radius: 10px; overflow: hidden; }
  .panel-header { padding: .9rem 1.2rem; border-bottom: 1px solid var(--border); font-weight: 600; }
  form { padding: 1.2rem; display: grid; gap: .9rem; }
  label { color: var(--muted); font-size: .8rem; text-transform: uppercase; letter-spacing: .06em; }
  input, select, button { width: 100%; padding: .55rem .7rem; border-radius: 6px; border: 1px solid var(--border); background: var(--bg); color: var(--text); font-size: .95rem; }
  button { background: var(--accent); border: none; font-weight: 700; cursor: pointer; }
  #result { padding: 1.2rem; font-size: 1.1rem; min-height: 3rem; }
  .big { font-size: 2rem; font-weight: 700; }
  .pos { color: var(--green); }
  .neg { color: var(--red); }
  table { width: 100%; border-collapse: collapse; }
  th { padding: .7rem 1rem; text-align: left; font-size: .75rem; text-transform: uppercase; color: var(--muted); border-bottom: 1px solid var(--border); }
  td { padding: .65rem 1rem; font-size: .88rem; border-bottom: 1px solid #1e2130; }
  .empty { color: var(--muted); text-align: center; padding: 2rem; font-size: .9rem; }
</style>
</head>
<body>
<header><h1>Course Correction Converter</h1></header>
<main>
  <div class="panel">
    <div class="panel-header">Convert a finish time</div>
    <form id="convert-form">
      <label for="gender">Gender</label>
      <select id="gender"><option value="M">Men</option><option value="W">Women</option></select>
      <label for="finish">Finish time (H:MM:SS or MM:SS)</label>
      <input id="finish" placeholder="1:10:00" required>
      <label for="from">Raced at</label>
      <select id="from"></select>
      <label for="to">Convert to</label>
      <select id="to"></select>
      <button type="submit">Convert</button>
    </form>
    <div id="result"></div>
  </div>
  <div class="panel">
    <div class="panel-header">Venues</div>
    <table>
      <thead><tr><th>Venue</th><th>Correction</th><th>Seconds</th></tr></thead>
      <tbody id="venue-tbody"><tr><td colspan="3" class="empty">Loading…</td></tr></tbody>
    </table>
  </div>
</main>
<script>
function esc(s) { return String(s).replace(/[&<>"]/g, c => ({'&':'&amp;','<':'&lt;','>':'&gt;','"':'&quot;'}[c])); }

async function loadVenues() {
  const gender = document.getElementById('gender').value;
  const r = await fetch('/api/venues?gender=' + gender);
  const venues = r.ok ? await r.json() : [];
  const tbody = document.getElementById('venue-tbody');
  tbody.innerHTML = venues.length
    ? venues.map(v => `<tr><td>${esc(v.name)}</td><td>${esc(v.label)}</td><td>${v.correction_seconds.toFixed(0)}</td></tr>`).join('')
    : '<tr><td colspan="3" class="empty">No corrections published</td></tr>';
  const opts = venues.map(v => `<option>${esc(v.name)}</option>`).join('');
  document.getElementById('from').innerHTML = opts;
  document.getElementById('to').innerHTML = '<option value="normalized">Normalized (baseline)</option>' + opts;
}

document.getElementById('gender').addEventListener('change', loadVenues);
document.getElementById('convert-form').addEventListener('submit', async (e) => {
  e.preventDefault();
  const body = {
    finish_time: document.getElementById('finish').value,
    from_venue: document.getElementById('from').value,
    to_venue: document.getElementById('to').value,
    gender: document.getElementById('gender').value,
  };
  const r = await fetch('/api/convert', { method: 'POST', headers: {'Content-Type': 'application/json'}, body: JSON.stringify(body) });
  const data = await r.json();
  const out = document.getElementById('result');
  if (!r.ok) { out.innerHTML = `<span class="neg">${esc(data.error)}</span>`; return; }
  const cls = data.faster ? 'pos' : 'neg';
  out.innerHTML = `<div class="big">${esc(data.converted_time)}</div>
    <div>${esc(data.to_venue)}: <span class="${cls}">${data.faster ? '−' : '+'}${esc(data.time_difference)}</span></div>`;
});

loadVenues();
</script>
</body>
</html>"#;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::baseline::BaselineSelection;
    use crate::model::correction::{CorrectionRecord, Strategy};
    use crate::model::{CorrectionTable, ResultRecord, RunDiagnostics};
    use approx::assert_relative_eq;

    fn state() -> Arc<AppState> {
        let db = Database::open(":memory:").unwrap();
        let rec = |venue: &str, corr| CorrectionRecord {
            venue: venue.to_string(),
            gender: Gender::Men,
            correction_seconds: corr,
            ci_low: None,
            ci_high: None,
            p_value: None,
            sample_size: 30,
            strategy: Strategy::Percentile,
        };
        let table = CorrectionTable::new(
            vec![rec("London", -754.0), rec("Maastricht", 0.0), rec("Atlanta", 421.5)],
            vec![BaselineSelection {
                venue: "Maastricht".into(),
                gender: Gender::Men,
                median_seconds: 4800.0,
                position: 1,
                candidates: 3,
                warning: None,
            }],
        );
        db.replace_corrections(&table, &RunDiagnostics::default()).unwrap();
        db.insert_results(&[ResultRecord::new("London", Gender::Men, "a", 4100.0)], false)
            .unwrap();
        Arc::new(AppState { db })
    }

    fn request(finish: &str, from: &str, to: &str, gender: Option<&str>) -> ConvertRequest {
        ConvertRequest {
            finish_time: Some(finish.into()),
            from_venue: Some(from.into()),
            to_venue: Some(to.into()),
            gender: gender.map(String::from),
        }
    }

    #[tokio::test]
    async fn venues_sorted_with_baseline_label() {
        let Json(venues) = venues_handler(State(state()), Query(VenueQuery { gender: None }))
            .await
            .unwrap_or_else(|_| panic!("venues failed"));
        let names: Vec<&str> = venues.iter().map(|v| v.name.as_str()).collect();
        assert_eq!(names, ["London", "Maastricht", "Atlanta"]);
        assert_eq!(venues[0].label, "+15.7%");
        assert_eq!(venues[1].label, "Baseline");
        assert_eq!(venues[2].label, "-8.8%");
    }

    #[tokio::test]
    async fn women_have_no_venues_yet() {
        let Json(venues) = venues_handler(
            State(state()),
            Query(VenueQuery {
                gender: Some("W".into()),
            }),
        )
        .await
        .unwrap_or_else(|_| panic!("venues failed"));
        assert!(venues.is_empty());
    }

    #[tokio::test]
    async fn converts_to_normalized() {
        let Json(resp) = convert_handler(
            State(state()),
            Ok(Json(request("1:07:26", "London", "normalized", Some("M")))),
        )
        .await
        .unwrap_or_else(|_| panic!("convert failed"));
        assert_relative_eq!(resp.converted_seconds, 4046.0 + 754.0);
        assert_eq!(resp.converted_time, "1:20:00");
        assert_eq!(resp.time_difference, "0:12:34");
        assert!(!resp.faster);
    }

    #[tokio::test]
    async fn unknown_venue_is_bad_request() {
        let err = convert_handler(
            State(state()),
            Ok(Json(request("1:10:00", "Nowhere", "normalized", Some("M")))),
        )
        .await
        .err()
        .unwrap();
        assert!(matches!(err, ApiError::Convert(ConvertError::UnknownVenue { .. })));
        assert_eq!(err.into_response().status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn missing_gender_is_bad_request() {
        let err = convert_handler(
            State(state()),
            Ok(Json(request("1:10:00", "London", "Atlanta", None))),
        )
        .await
            .err()
            .unwrap();
        assert!(matches!(err, ApiError::Convert(ConvertError::MissingGender)));
    }

    /// POST a raw body to a live router and return (status, parsed JSON body).
    async fn post_convert(body: &str) -> (u16, serde_json::Value) {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = router((*state()).clone());
        tokio::spawn(async move { axum::serve(listener, app).await });

        let mut stream = tokio::net::TcpStream::connect(addr).await.unwrap();
        let req = format!(
            "POST /api/convert HTTP/1.1\r\nHost: {addr}\r\nContent-Type: application/json\r\n\
             Content-Length: {}\r\nConnection: close\r\n\r\n{body}",
            body.len()
        );
        stream.write_all(req.as_bytes()).await.unwrap();
        let mut raw = String::new();
        stream.read_to_string(&mut raw).await.unwrap();

        let status = raw.split_whitespace().nth(1).unwrap().parse().unwrap();
        let (_, payload) = raw.split_once("\r\n\r\n").unwrap();
        (status, serde_json::from_str(payload).unwrap_or(serde_json::Value::Null))
    }

    #[tokio::test]
    async fn malformed_convert_bodies_get_json_error_kinds() {
        let (status, body) = post_convert(r#"{"from_venue": "London", "gender": "M"}"#).await;
        assert_eq!(status, 400);
        assert_eq!(body["kind"], "InvalidTimeFormat");

        let (status, body) = post_convert(r#"{"finish_time": "1:10:00", "gender": "M"}"#).await;
        assert_eq!(status, 400);
        assert_eq!(body["kind"], "UnknownVenue");

        let (status, body) =
            post_convert(r#"{"finish_time": 4200, "from_venue": "London", "gender": "M"}"#).await;
        assert_eq!(status, 400);
        assert_eq!(body["kind"], "InvalidTimeFormat");

        let (status, body) = post_convert("not json").await;
        assert_eq!(status, 400);
        assert_eq!(body["kind"], "InvalidRequest");
    }

    #[tokio::test]
    async fn live_router_converts_well_formed_body() {
        let (status, body) = post_convert(
            r#"{"finish_time": "1:07:26", "from_venue": "London", "gender": "M"}"#,
        )
        .await;
        assert_eq!(status, 200);
        assert_eq!(body["converted_time"], "1:20:00");
        assert_eq!(body["to_venue"], "Normalized (Maastricht)");
    }

    #[tokio::test]
    async fn run_and_stats_endpoints() {
        let s = state();
        let Json(run) = run_handler(State(s.clone()))
            .await
            .unwrap_or_else(|_| panic!("run failed"));
        assert_eq!(run.baseline_venue.as_deref(), Some("Maastricht"));
        let Json(stats) = stats_handler(State(s))
            .await
            .unwrap_or_else(|_| panic!("stats failed"));
        assert_eq!(stats.len(), 1);
        assert_eq!(stats[0].count, 1);
    }
}
