use contribution_leaderboard_server::{
    error::ProviderError,
    leaderboard::{LeaderboardEntry, LeaderboardPage, PageSource, UserBreakdown, UserPlace},
    refresher::ProviderRefresh,
    scheduler::{CronReport, PlannedRefresh, UserError, UserErrorKind},
};
use rocket::{fairing::AdHoc, serde::json::Json, Catcher, Request};
use utoipa::OpenApi;

pub mod auth;
pub mod leaderboard;
pub mod refresh;
pub mod types;

use types::{
    BackfillBody, BoardSize, DetailsBody, ErrorBody, RangeResponse, RebuildResponse,
    RefreshDayBody, RefreshResponse,
};

#[derive(OpenApi)]
#[openapi(
    info(
        title = "Contribution leaderboard",
        description = "Refreshes per-day GitHub and GitLab contribution counts and serves the rankings"
    ),
    paths(
        refresh::refresh_day,
        refresh::backfill,
        refresh::cron_daily,
        leaderboard::get_page,
        leaderboard::get_user_place,
        leaderboard::post_details,
        leaderboard::get_export,
        leaderboard::post_rebuild,
    ),
    components(schemas(
        RefreshDayBody,
        BackfillBody,
        RefreshResponse,
        RangeResponse,
        ProviderError,
        ProviderRefresh,
        CronReport,
        UserError,
        UserErrorKind,
        PlannedRefresh,
        LeaderboardPage,
        LeaderboardEntry,
        PageSource,
        UserPlace,
        DetailsBody,
        UserBreakdown,
        RebuildResponse,
        BoardSize,
        ErrorBody,
    ))
)]
pub struct ApiDoc;

fn error_body(error: &str, message: &str) -> Json<ErrorBody> {
    Json(ErrorBody {
        error: error.to_string(),
        message: message.to_string(),
    })
}

#[catch(401)]
fn unauthorized() -> Json<ErrorBody> {
    error_body("unauthorized", "missing or invalid bearer token")
}

#[catch(404)]
fn not_found(req: &Request<'_>) -> Json<ErrorBody> {
    error_body("not_found", &format!("nothing found at {}", req.uri()))
}

#[catch(422)]
fn unprocessable() -> Json<ErrorBody> {
    error_body("bad_request", "request body does not match the expected shape")
}

#[catch(500)]
fn internal() -> Json<ErrorBody> {
    error_body("internal", "internal server error")
}

pub fn catchers() -> Vec<Catcher> {
    catchers![unauthorized, not_found, unprocessable, internal]
}

pub fn stage() -> AdHoc {
    AdHoc::on_ignite("Installing entrypoints", |rocket| async {
        rocket
            .attach(refresh::stage())
            .attach(leaderboard::stage())
            .register("/", catchers())
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn openapi_lists_every_route() {
        let doc = ApiDoc::openapi();
        for path in [
            "/api/refresh-day",
            "/api/backfill",
            "/api/cron-daily",
            "/api/leaderboard/details",
            "/api/leaderboard/export",
            "/api/leaderboard/rebuild",
        ] {
            assert!(doc.paths.paths.contains_key(path), "{path} is missing");
        }
    }
}
