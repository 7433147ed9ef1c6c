use std::sync::Arc;

use contribution_leaderboard_server::{
    pipeline::Engine,
    scheduler::{CronReport, CronRequest, Scheduler},
};
use rocket::{fairing::AdHoc, serde::json::Json, State};
use tracing::instrument;

use super::{
    auth::Admin,
    types::{ApiError, BackfillBody, RefreshDayBody, RefreshResponse},
};

fn today() -> chrono::NaiveDate {
    chrono::Utc::now().date_naive()
}

#[utoipa::path(context_path = "/api", request_body = RefreshDayBody, responses(
    (status = 200, description = "Refresh a short range of days for one user", body = RefreshResponse),
    (status = 400, description = "Invalid request", body = ErrorBody),
    (status = 401, description = "Missing or invalid bearer token", body = ErrorBody),
    (status = 409, description = "A refresh is already in progress", body = ErrorBody)
))]
#[post("/refresh-day", data = "<body>")]
#[instrument(skip(_admin, engine, body), fields(user = %body.user_id))]
pub async fn refresh_day(
    _admin: Admin,
    engine: &State<Arc<Engine>>,
    body: Json<RefreshDayBody>,
) -> Result<Json<RefreshResponse>, ApiError> {
    let today = today();
    let range = body.range(today)?;
    let report = engine
        .refresh_day(body.identity(), range, body.concurrency, today)
        .await?;
    Ok(Json(report.into()))
}

#[utoipa::path(context_path = "/api", request_body = BackfillBody, responses(
    (status = 200, description = "Refresh up to a year of history for one user", body = RefreshResponse),
    (status = 400, description = "Invalid request", body = ErrorBody),
    (status = 401, description = "Missing or invalid bearer token", body = ErrorBody),
    (status = 409, description = "A refresh is already in progress", body = ErrorBody)
))]
#[post("/backfill", data = "<body>")]
#[instrument(skip(_admin, engine, body), fields(user = %body.user_id))]
pub async fn backfill(
    _admin: Admin,
    engine: &State<Arc<Engine>>,
    body: Json<BackfillBody>,
) -> Result<Json<RefreshResponse>, ApiError> {
    let report = engine
        .backfill(body.identity(), body.days, body.concurrency, today())
        .await?;
    Ok(Json(report.into()))
}

#[utoipa::path(context_path = "/api", responses(
    (status = 200, description = "Refresh yesterday and today for a slice of known users", body = CronReport),
    (status = 401, description = "Missing or invalid bearer token", body = ErrorBody)
))]
#[get("/cron-daily?<limit>&<concurrency>&<dry>")]
pub async fn cron_daily(
    _admin: Admin,
    scheduler: &State<Arc<Scheduler>>,
    limit: Option<u64>,
    concurrency: Option<usize>,
    dry: Option<bool>,
) -> Result<Json<CronReport>, ApiError> {
    let request = CronRequest {
        limit,
        concurrency,
        dry: dry.unwrap_or(false),
    };
    Ok(Json(scheduler.run_daily(request, today()).await?))
}

pub fn stage() -> AdHoc {
    AdHoc::on_ignite("Installing refresh entrypoints", |rocket| async {
        rocket.mount("/api", rocket::routes![refresh_day, backfill, cron_daily])
    })
}
