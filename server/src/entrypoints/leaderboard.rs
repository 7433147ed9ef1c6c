use std::{io::Cursor, sync::Arc};

use contribution_leaderboard_server::{
    leaderboard::{ExportPage, LeaderboardPage, PageQuery, Reader, UserBreakdown, UserPlace},
    pipeline::Engine,
};
use rocket::{
    fairing::AdHoc,
    http::{ContentType, Header},
    response::{self, Responder},
    serde::json::Json,
    Request, Response, State,
};
use shared::{ProviderSelector, Window};

use super::{
    auth::Admin,
    types::{
        parse_selector, parse_window, ApiError, BoardSize, DetailsBody, RebuildResponse,
    },
};

/// CSV download. The cursor for the next chunk travels in `X-Next-Cursor`.
pub struct CsvExport(ExportPage);

impl<'r> Responder<'r, 'static> for CsvExport {
    fn respond_to(self, _req: &'r Request<'_>) -> response::Result<'static> {
        let ExportPage {
            csv,
            next_cursor,
            source,
        } = self.0;
        let mut response = Response::build();
        response
            .header(ContentType::CSV)
            .header(Header::new(
                "Content-Disposition",
                "attachment; filename=\"leaderboard.csv\"",
            ))
            .header(Header::new("X-Leaderboard-Source", source.to_string()));
        if let Some(cursor) = next_cursor {
            response.header(Header::new("X-Next-Cursor", cursor));
        }
        response.sized_body(csv.len(), Cursor::new(csv)).ok()
    }
}

#[utoipa::path(context_path = "/api/leaderboard", responses(
    (status = 200, description = "Ranked page for a window and provider", body = LeaderboardPage),
    (status = 400, description = "Unknown window, provider or cursor", body = ErrorBody)
))]
#[get("/<window>/<selector>?<limit>&<cursor>")]
pub async fn get_page(
    window: &str,
    selector: &str,
    limit: Option<u64>,
    cursor: Option<String>,
    reader: &State<Arc<Reader>>,
) -> Result<Json<LeaderboardPage>, ApiError> {
    let mut query = PageQuery::new(parse_window(window)?, parse_selector(selector)?).cursor(cursor);
    query.limit = limit;
    Ok(Json(reader.get_page(&query).await?))
}

#[utoipa::path(context_path = "/api/leaderboard", responses(
    (status = 200, description = "Place of one user", body = UserPlace),
    (status = 404, description = "User is not ranked")
))]
#[get("/<window>/<selector>/users/<user_id>")]
pub async fn get_user_place(
    window: &str,
    selector: &str,
    user_id: &str,
    reader: &State<Arc<Reader>>,
) -> Result<Option<Json<UserPlace>>, ApiError> {
    let place = reader
        .rank_of(user_id, parse_window(window)?, parse_selector(selector)?)
        .await?;
    Ok(place.map(Json))
}

#[utoipa::path(context_path = "/api/leaderboard", request_body = DetailsBody, responses(
    (status = 200, description = "Per-provider scores for the given users", body = [UserBreakdown]),
    (status = 400, description = "Too many users", body = ErrorBody)
))]
#[post("/details", data = "<body>")]
pub async fn post_details(
    body: Json<DetailsBody>,
    reader: &State<Arc<Reader>>,
) -> Result<Json<Vec<UserBreakdown>>, ApiError> {
    let window = body.window.unwrap_or(Window::AllTime);
    Ok(Json(reader.details(&body.user_ids, window).await?))
}

#[utoipa::path(context_path = "/api/leaderboard", responses(
    (status = 200, description = "Ranked page as CSV", content_type = "text/csv", body = String),
    (status = 400, description = "Unknown window, provider or cursor", body = ErrorBody)
))]
#[get("/export?<provider>&<window>&<limit>&<cursor>")]
pub async fn get_export(
    provider: Option<&str>,
    window: Option<&str>,
    limit: Option<u64>,
    cursor: Option<String>,
    reader: &State<Arc<Reader>>,
) -> Result<CsvExport, ApiError> {
    let selector = provider
        .map(parse_selector)
        .transpose()?
        .unwrap_or(ProviderSelector::Combined);
    let window = window
        .map(parse_window)
        .transpose()?
        .unwrap_or(Window::AllTime);
    let mut query = PageQuery::new(window, selector).cursor(cursor);
    query.limit = limit;
    Ok(CsvExport(reader.export(&query).await?))
}

#[utoipa::path(context_path = "/api/leaderboard", responses(
    (status = 200, description = "Ranking index rebuilt from the relational totals", body = RebuildResponse),
    (status = 401, description = "Missing or invalid bearer token", body = ErrorBody)
))]
#[post("/rebuild")]
pub async fn post_rebuild(
    _admin: Admin,
    engine: &State<Arc<Engine>>,
) -> Result<Json<RebuildResponse>, ApiError> {
    let synchronizer = engine.synchronizer();
    let users = synchronizer.rebuild().await?;
    let boards = synchronizer
        .board_sizes()
        .await?
        .into_iter()
        .map(|(window, selector, entries)| BoardSize {
            window: window.to_string(),
            selector: selector.to_string(),
            entries,
        })
        .collect();
    rocket::info!("Rebuilt the ranking index for {users} users");
    Ok(Json(RebuildResponse { users, boards }))
}

pub fn stage() -> AdHoc {
    AdHoc::on_ignite("Installing leaderboard entrypoints", |rocket| async {
        rocket.mount(
            "/api/leaderboard",
            rocket::routes![get_page, get_user_place, post_details, get_export, post_rebuild],
        )
    })
}
