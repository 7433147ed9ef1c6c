use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumIter, EnumString, IntoEnumIterator};

/// External code-hosting backend that contributions are pulled from.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    EnumIter,
    EnumString,
    Display,
    AsRefStr,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum Provider {
    Github,
    Gitlab,
}

impl Provider {
    pub fn all() -> Vec<Provider> {
        Provider::iter().collect()
    }
}

/// Axis along which the rankings are split.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    EnumIter,
    EnumString,
    Display,
    AsRefStr,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum ProviderSelector {
    Github,
    Gitlab,
    Combined,
}

impl ProviderSelector {
    /// Providers whose scores are summed for this selector.
    pub fn providers(&self) -> Vec<Provider> {
        match self {
            ProviderSelector::Github => vec![Provider::Github],
            ProviderSelector::Gitlab => vec![Provider::Gitlab],
            ProviderSelector::Combined => Provider::all(),
        }
    }
}

impl From<Provider> for ProviderSelector {
    fn from(provider: Provider) -> Self {
        match provider {
            Provider::Github => ProviderSelector::Github,
            Provider::Gitlab => ProviderSelector::Gitlab,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use super::*;

    #[test]
    fn parses_case_insensitive() {
        assert_eq!(Provider::from_str("GitHub").unwrap(), Provider::Github);
        assert_eq!(
            ProviderSelector::from_str("combined").unwrap(),
            ProviderSelector::Combined
        );
        assert!(Provider::from_str("bitbucket").is_err());
    }

    #[test]
    fn combined_covers_every_provider() {
        assert_eq!(
            ProviderSelector::Combined.providers(),
            vec![Provider::Github, Provider::Gitlab]
        );
        assert_eq!(Provider::Gitlab.to_string(), "gitlab");
    }
}
