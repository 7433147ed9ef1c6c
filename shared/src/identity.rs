use serde::{Deserialize, Serialize};

use crate::Provider;

pub type UserId = String;

/// Which external accounts belong to a user.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserIdentity {
    pub user_id: UserId,
    pub github_login: Option<String>,
    pub gitlab_username: Option<String>,
}

impl UserIdentity {
    pub fn new(user_id: impl Into<UserId>) -> Self {
        Self {
            user_id: user_id.into(),
            ..Default::default()
        }
    }

    pub fn with_github(mut self, login: impl Into<String>) -> Self {
        self.github_login = Some(login.into());
        self
    }

    pub fn with_gitlab(mut self, username: impl Into<String>) -> Self {
        self.gitlab_username = Some(username.into());
        self
    }

    /// Login for the provider, ignoring blank values.
    pub fn login(&self, provider: Provider) -> Option<&str> {
        let login = match provider {
            Provider::Github => self.github_login.as_deref(),
            Provider::Gitlab => self.gitlab_username.as_deref(),
        };
        login.map(str::trim).filter(|login| !login.is_empty())
    }

    /// Providers this user has linked, in a fixed order.
    pub fn providers(&self) -> Vec<Provider> {
        Provider::all()
            .into_iter()
            .filter(|provider| self.login(*provider).is_some())
            .collect()
    }

    pub fn has_any_login(&self) -> bool {
        !self.providers().is_empty()
    }

    /// Fills logins missing from `self` with the ones known from `other`.
    pub fn merged_with(mut self, other: &UserIdentity) -> Self {
        if self.login(Provider::Github).is_none() {
            self.github_login = other.github_login.clone();
        }
        if self.login(Provider::Gitlab).is_none() {
            self.gitlab_username = other.gitlab_username.clone();
        }
        self
    }
}
