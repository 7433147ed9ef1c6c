use std::time::Duration;

#[derive(Debug, Clone, serde::Deserialize)]
pub struct Env {
    /// Shared secret for every write endpoint.
    pub admin_token: String,
    /// Ranking index and locks live in process memory without it, which only
    /// suits a single instance.
    pub redis_url: Option<String>,
    pub github_token: Option<String>,
    pub gitlab_token: Option<String>,
    pub gitlab_base_url: Option<String>,
    pub cron_interval_minutes: Option<u64>,
    pub cron_limit: Option<u64>,
}

impl Env {
    pub fn cron_interval(&self) -> Duration {
        Duration::from_secs(self.cron_interval_minutes.unwrap_or(24 * 60).max(1) * 60)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn optional_settings_default() {
        let env: Env = envy::from_iter([("ADMIN_TOKEN".to_string(), "secret".to_string())]).unwrap();
        assert_eq!(env.admin_token, "secret");
        assert!(env.redis_url.is_none());
        assert_eq!(env.cron_interval(), Duration::from_secs(86_400));
    }

    #[test]
    fn reads_every_setting() {
        let env: Env = envy::from_iter(
            [
                ("ADMIN_TOKEN", "secret"),
                ("REDIS_URL", "redis://localhost:6379"),
                ("GITHUB_TOKEN", "ghp"),
                ("GITLAB_BASE_URL", "https://gitlab.example.com"),
                ("CRON_INTERVAL_MINUTES", "15"),
                ("CRON_LIMIT", "50"),
            ]
            .map(|(k, v)| (k.to_string(), v.to_string())),
        )
        .unwrap();
        assert_eq!(env.cron_interval(), Duration::from_secs(900));
        assert_eq!(env.cron_limit, Some(50));
        assert_eq!(env.gitlab_token, None);
    }

    #[test]
    fn admin_token_is_required() {
        assert!(envy::from_iter::<_, Env>(Vec::<(String, String)>::new()).is_err());
    }
}
