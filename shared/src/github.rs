use async_trait::async_trait;
use chrono::NaiveDate;
use octocrab::Octocrab;
use serde::Deserialize;
use tracing::instrument;

use crate::{
    fetcher::{
        classify_status, with_retry, AttemptError, ContributionFetcher, DailyCounts, FetchError,
        RetryPolicy,
    },
    DayRange, Provider, UserIdentity,
};

const CONTRIBUTION_CALENDAR_QUERY: &str = r#"
query($login: String!, $from: DateTime!, $to: DateTime!) {
  user(login: $login) {
    contributionsCollection(from: $from, to: $to) {
      contributionCalendar {
        weeks {
          contributionDays {
            date
            contributionCount
          }
        }
      }
    }
  }
}
"#;

#[derive(Debug, Deserialize)]
struct GraphqlResponse {
    data: Option<GraphqlData>,
    #[serde(default)]
    errors: Vec<GraphqlError>,
}

#[derive(Debug, Deserialize)]
struct GraphqlError {
    message: String,
}

#[derive(Debug, Deserialize)]
struct GraphqlData {
    user: Option<GraphqlUser>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GraphqlUser {
    contributions_collection: ContributionsCollection,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ContributionsCollection {
    contribution_calendar: ContributionCalendar,
}

#[derive(Debug, Deserialize)]
struct ContributionCalendar {
    weeks: Vec<CalendarWeek>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CalendarWeek {
    contribution_days: Vec<CalendarDay>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CalendarDay {
    date: NaiveDate,
    contribution_count: u32,
}

/// Reads the GitHub contribution calendar through the GraphQL API.
///
/// The calendar is only served to authenticated clients, so without a token
/// every fetch is reported as skipped instead of failed.
pub struct GithubFetcher {
    octocrab: Option<Octocrab>,
    retry: RetryPolicy,
}

impl GithubFetcher {
    pub fn new(github_token: Option<String>) -> anyhow::Result<Self> {
        let octocrab = match github_token.filter(|token| !token.trim().is_empty()) {
            Some(token) => Some(Octocrab::builder().personal_token(token).build()?),
            None => None,
        };
        Ok(Self {
            octocrab,
            retry: RetryPolicy::default(),
        })
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    async fn query_calendar(
        octocrab: &Octocrab,
        login: &str,
        range: DayRange,
    ) -> Result<DailyCounts, AttemptError> {
        let payload = serde_json::json!({
            "query": CONTRIBUTION_CALENDAR_QUERY,
            "variables": {
                "login": login,
                "from": format!("{}T00:00:00Z", range.from()),
                "to": format!("{}T23:59:59Z", range.to()),
            }
        });
        let response: GraphqlResponse = octocrab
            .graphql(&payload)
            .await
            .map_err(classify_octocrab)?;
        counts_from_response(response, login, range)
    }
}

fn classify_octocrab(error: octocrab::Error) -> AttemptError {
    match &error {
        octocrab::Error::GitHub { source, .. } => {
            let status = source.status_code.as_u16();
            // Secondary rate limits come back as 403
            if status == 403 && source.message.to_lowercase().contains("rate limit") {
                AttemptError::Transient(source.message.clone())
            } else {
                classify_status(status, source.message.clone())
            }
        }
        _ => AttemptError::Transient(error.to_string()),
    }
}

fn counts_from_response(
    response: GraphqlResponse,
    login: &str,
    range: DayRange,
) -> Result<DailyCounts, AttemptError> {
    if let Some(error) = response.errors.first() {
        return Err(AttemptError::Permanent(error.message.clone()));
    }
    let user = response
        .data
        .and_then(|data| data.user)
        .ok_or_else(|| AttemptError::Permanent(format!("GitHub user {login} not found")))?;

    let mut counts: DailyCounts = range.days().map(|day| (day, 0)).collect();
    for day in user
        .contributions_collection
        .contribution_calendar
        .weeks
        .into_iter()
        .flat_map(|week| week.contribution_days)
        .filter(|day| range.contains(day.date))
    {
        counts.insert(day.date, day.contribution_count);
    }
    Ok(counts)
}

#[async_trait]
impl ContributionFetcher for GithubFetcher {
    fn provider(&self) -> Provider {
        Provider::Github
    }

    #[instrument(skip(self, identity), fields(user = %identity.user_id))]
    async fn fetch_daily_counts(
        &self,
        identity: &UserIdentity,
        range: DayRange,
    ) -> Result<DailyCounts, FetchError> {
        let Some(login) = identity.login(Provider::Github) else {
            return Err(FetchError::Skipped {
                provider: Provider::Github,
                reason: "no GitHub login linked".to_string(),
            });
        };
        let Some(octocrab) = &self.octocrab else {
            return Err(FetchError::Skipped {
                provider: Provider::Github,
                reason: "no GitHub token configured".to_string(),
            });
        };

        with_retry(Provider::Github, self.retry, move || {
            Self::query_calendar(octocrab, login, range)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 7, d).unwrap()
    }

    #[test]
    fn calendar_is_trimmed_to_range() {
        let response: GraphqlResponse = serde_json::from_value(serde_json::json!({
            "data": {"user": {"contributionsCollection": {"contributionCalendar": {"weeks": [
                {"contributionDays": [
                    {"date": "2024-07-01", "contributionCount": 4},
                    {"date": "2024-07-02", "contributionCount": 0},
                ]},
                {"contributionDays": [
                    {"date": "2024-07-08", "contributionCount": 9},
                ]}
            ]}}}}
        }))
        .unwrap();
        let range = DayRange::new(date(1), date(3)).unwrap();
        let counts = counts_from_response(response, "octocat", range).unwrap();
        assert_eq!(counts.len(), 3);
        assert_eq!(counts[&date(1)], 4);
        assert_eq!(counts[&date(2)], 0);
        assert_eq!(counts[&date(3)], 0);
    }

    #[test]
    fn graphql_errors_are_permanent() {
        let response: GraphqlResponse = serde_json::from_value(serde_json::json!({
            "data": {"user": null},
            "errors": [{"message": "Could not resolve to a User"}]
        }))
        .unwrap();
        let range = DayRange::single(date(1));
        assert_eq!(
            counts_from_response(response, "ghost", range),
            Err(AttemptError::Permanent(
                "Could not resolve to a User".to_string()
            ))
        );
    }

    #[tokio::test]
    async fn missing_token_is_skipped() {
        let fetcher = GithubFetcher::new(None).unwrap();
        let identity = UserIdentity::new("1").with_github("octocat");
        let result = fetcher
            .fetch_daily_counts(&identity, DayRange::single(date(1)))
            .await;
        assert!(matches!(result, Err(FetchError::Skipped { .. })));
    }
}
