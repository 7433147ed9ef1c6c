use chrono::NaiveDate;
use contribution_leaderboard_server::{
    error::{ProviderError, RefreshError},
    leaderboard::ReadError,
    pipeline::CycleReport,
    refresher::ProviderRefresh,
};
use rocket::{
    http::Status,
    response::{self, Responder},
    serde::json::Json,
    Request, Response,
};
use serde::{Deserialize, Serialize};
use shared::{DayRange, Provider, ProviderSelector, UserIdentity, Window};
use utoipa::ToSchema;

#[derive(Clone, Debug, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct RefreshDayBody {
    pub user_id: String,
    pub github_login: Option<String>,
    pub gitlab_username: Option<String>,
    #[schema(value_type = Option<String>, example = "2024-06-01")]
    pub from_day_utc: Option<NaiveDate>,
    #[schema(value_type = Option<String>, example = "2024-06-02")]
    pub to_day_utc: Option<NaiveDate>,
    pub concurrency: Option<usize>,
}

impl RefreshDayBody {
    pub fn identity(&self) -> UserIdentity {
        identity(&self.user_id, &self.github_login, &self.gitlab_username)
    }

    /// `None` leaves the default "yesterday to today" range to the engine.
    /// A lone end day refreshes just that day.
    pub fn range(&self, today: NaiveDate) -> Result<Option<DayRange>, RefreshError> {
        match (self.from_day_utc, self.to_day_utc) {
            (None, None) => Ok(None),
            (from, to) => {
                let to = to.unwrap_or(today);
                Ok(Some(DayRange::new(from.unwrap_or(to), to)?))
            }
        }
    }
}

#[derive(Clone, Debug, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct BackfillBody {
    pub user_id: String,
    pub github_login: Option<String>,
    pub gitlab_username: Option<String>,
    /// Trailing days ending today, 1 to 365. Defaults to 365.
    pub days: Option<u32>,
    pub concurrency: Option<usize>,
}

impl BackfillBody {
    pub fn identity(&self) -> UserIdentity {
        identity(&self.user_id, &self.github_login, &self.gitlab_username)
    }
}

fn identity(user_id: &str, github: &Option<String>, gitlab: &Option<String>) -> UserIdentity {
    UserIdentity {
        user_id: user_id.trim().to_string(),
        github_login: github.clone(),
        gitlab_username: gitlab.clone(),
    }
}

#[derive(Clone, Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct RangeResponse {
    #[schema(value_type = String)]
    pub from: NaiveDate,
    #[schema(value_type = String)]
    pub to: NaiveDate,
}

impl From<DayRange> for RangeResponse {
    fn from(range: DayRange) -> Self {
        Self {
            from: range.from(),
            to: range.to(),
        }
    }
}

#[derive(Clone, Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct RefreshResponse {
    pub ok: bool,
    pub user_id: String,
    #[schema(value_type = Vec<String>)]
    pub providers: Vec<Provider>,
    pub range: RangeResponse,
    pub days_refreshed: usize,
    pub per_provider: Vec<ProviderRefresh>,
    pub concurrency: usize,
    pub errors: Vec<ProviderError>,
    pub skipped: Vec<ProviderError>,
    pub index_synced: bool,
}

impl From<CycleReport> for RefreshResponse {
    fn from(report: CycleReport) -> Self {
        Self {
            ok: true,
            user_id: report.user_id,
            providers: report.providers,
            range: report.range.into(),
            days_refreshed: report.days_refreshed,
            per_provider: report.per_provider,
            concurrency: report.concurrency,
            errors: report.errors,
            skipped: report.skipped,
            index_synced: report.index_synced,
        }
    }
}

#[derive(Clone, Debug, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct DetailsBody {
    pub user_ids: Vec<String>,
    /// `all`, `30d` or `365d`. Defaults to `all`.
    #[schema(value_type = Option<String>)]
    pub window: Option<Window>,
}

#[derive(Clone, Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct BoardSize {
    pub window: String,
    pub selector: String,
    pub entries: u64,
}

#[derive(Clone, Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct RebuildResponse {
    pub users: usize,
    pub boards: Vec<BoardSize>,
}

#[derive(Clone, Debug, Serialize, Deserialize, ToSchema)]
pub struct ErrorBody {
    pub error: String,
    pub message: String,
}

/// Failure of an API call, rendered as JSON with the matching status.
#[derive(Debug)]
pub enum ApiError {
    Usage(String),
    Conflict(String),
    Fatal(String),
}

impl ApiError {
    pub fn status(&self) -> Status {
        match self {
            ApiError::Usage(_) => Status::BadRequest,
            ApiError::Conflict(_) => Status::Conflict,
            ApiError::Fatal(_) => Status::InternalServerError,
        }
    }

    pub fn body(&self) -> ErrorBody {
        let (error, message) = match self {
            ApiError::Usage(message) => ("bad_request", message.as_str()),
            ApiError::Conflict(message) => ("conflict", message.as_str()),
            ApiError::Fatal(_) => ("internal", "internal server error"),
        };
        ErrorBody {
            error: error.to_string(),
            message: message.to_string(),
        }
    }
}

impl From<RefreshError> for ApiError {
    fn from(error: RefreshError) -> Self {
        match error {
            RefreshError::Usage(message) => ApiError::Usage(message),
            RefreshError::Conflict(conflict) => ApiError::Conflict(conflict.to_string()),
            RefreshError::Fatal(e) => ApiError::Fatal(format!("{e:#}")),
        }
    }
}

impl From<ReadError> for ApiError {
    fn from(error: ReadError) -> Self {
        if error.is_usage() {
            ApiError::Usage(error.to_string())
        } else {
            ApiError::Fatal(error.to_string())
        }
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(error: anyhow::Error) -> Self {
        ApiError::Fatal(format!("{error:#}"))
    }
}

impl<'r> Responder<'r, 'static> for ApiError {
    fn respond_to(self, req: &'r Request<'_>) -> response::Result<'static> {
        if let ApiError::Fatal(message) = &self {
            rocket::error!("{} {} failed: {message}", req.method(), req.uri());
        }
        Response::build_from(Json(self.body()).respond_to(req)?)
            .status(self.status())
            .ok()
    }
}

pub fn parse_window(raw: &str) -> Result<Window, ApiError> {
    raw.parse()
        .map_err(|_| ApiError::Usage(format!("unknown window {raw:?}, expected all, 30d or 365d")))
}

pub fn parse_selector(raw: &str) -> Result<ProviderSelector, ApiError> {
    raw.parse().map_err(|_| {
        ApiError::Usage(format!(
            "unknown provider {raw:?}, expected github, gitlab or combined"
        ))
    })
}
