use std::fmt;

use crate::{DayRange, Provider, UserId};

/// Key guarding one (provider, user) aggregation.
///
/// The string form is only ever produced by [`LockKey::canonical`], so every
/// call site agrees on what collides with what: identical day ranges share a
/// key and two backfills for the same provider and user always do. Every
/// cycle also holds the [`LockKey::Write`] key of each provider it touches,
/// which serializes day, totals and index writes for that (provider, user)
/// and makes enclosing ranges and backfills collide with refreshes.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum LockKey {
    DayRange {
        provider: Provider,
        user_id: UserId,
        range: DayRange,
    },
    Backfill {
        provider: Provider,
        user_id: UserId,
    },
    Write {
        provider: Provider,
        user_id: UserId,
    },
}

impl LockKey {
    pub fn day_range(provider: Provider, user_id: impl Into<UserId>, range: DayRange) -> Self {
        LockKey::DayRange {
            provider,
            user_id: user_id.into(),
            range,
        }
    }

    pub fn backfill(provider: Provider, user_id: impl Into<UserId>) -> Self {
        LockKey::Backfill {
            provider,
            user_id: user_id.into(),
        }
    }

    pub fn write(provider: Provider, user_id: impl Into<UserId>) -> Self {
        LockKey::Write {
            provider,
            user_id: user_id.into(),
        }
    }

    pub fn provider(&self) -> Provider {
        match self {
            LockKey::DayRange { provider, .. }
            | LockKey::Backfill { provider, .. }
            | LockKey::Write { provider, .. } => *provider,
        }
    }

    pub fn user_id(&self) -> &str {
        match self {
            LockKey::DayRange { user_id, .. }
            | LockKey::Backfill { user_id, .. }
            | LockKey::Write { user_id, .. } => user_id,
        }
    }

    pub fn canonical(&self) -> String {
        match self {
            LockKey::DayRange {
                provider,
                user_id,
                range,
            } => format!(
                "lock:refresh-day:{provider}:{user_id}:{}:{}",
                range.from(),
                range.to()
            ),
            LockKey::Backfill { provider, user_id } => {
                format!("lock:backfill:{provider}:{user_id}")
            }
            LockKey::Write { provider, user_id } => format!("lock:write:{provider}:{user_id}"),
        }
    }
}

impl fmt::Display for LockKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.canonical())
    }
}

#[cfg(test)]
mod tests {
    use chrono::NaiveDate;

    use super::*;

    fn range(from: u32, to: u32) -> DayRange {
        DayRange::new(
            NaiveDate::from_ymd_opt(2024, 5, from).unwrap(),
            NaiveDate::from_ymd_opt(2024, 5, to).unwrap(),
        )
        .unwrap()
    }

    #[test]
    fn canonical_forms() {
        assert_eq!(
            LockKey::day_range(Provider::Github, "42", range(1, 2)).canonical(),
            "lock:refresh-day:github:42:2024-05-01:2024-05-02"
        );
        assert_eq!(
            LockKey::backfill(Provider::Gitlab, "42").canonical(),
            "lock:backfill:gitlab:42"
        );
        assert_eq!(
            LockKey::write(Provider::Github, "42").canonical(),
            "lock:write:github:42"
        );
    }

    #[test]
    fn different_ranges_do_not_collide() {
        let a = LockKey::day_range(Provider::Github, "42", range(1, 2));
        let b = LockKey::day_range(Provider::Github, "42", range(2, 3));
        let c = LockKey::day_range(Provider::Github, "42", range(1, 2));
        assert_ne!(a.canonical(), b.canonical());
        assert_eq!(a.canonical(), c.canonical());
        assert_eq!(a.provider(), Provider::Github);
        assert_eq!(a.user_id(), "42");
    }
}
