use std::sync::Arc;

use shared::{fetcher::ContributionFetcher, github::GithubFetcher, gitlab::GitlabFetcher};
use tracing::{info, warn};

pub mod aggregator;
pub mod config;
pub mod db;
pub mod error;
pub mod leaderboard;
pub mod lock;
pub mod memory;
pub mod pipeline;
pub mod ranking;
pub mod refresher;
pub mod scheduler;
pub mod store;

#[cfg(test)]
pub mod test_utils;

use config::Env;
use db::DB;
use leaderboard::Reader;
use lock::{LockBackend, RedisLocks};
use pipeline::Engine;
use ranking::{RankingStore, RedisRanking};
use scheduler::Scheduler;

/// Everything the routes and the periodic refresh share.
pub struct Services {
    pub engine: Arc<Engine>,
    pub reader: Arc<Reader>,
    pub scheduler: Arc<Scheduler>,
}

pub fn fetchers(env: &Env) -> anyhow::Result<Vec<Arc<dyn ContributionFetcher>>> {
    if env.github_token.is_none() {
        warn!("GITHUB_TOKEN is not set, GitHub contributions will be skipped");
    }
    let github: Arc<dyn ContributionFetcher> =
        Arc::new(GithubFetcher::new(env.github_token.clone())?);
    let gitlab: Arc<dyn ContributionFetcher> = Arc::new(GitlabFetcher::new(
        env.gitlab_base_url.clone(),
        env.gitlab_token.clone(),
    )?);
    Ok(vec![github, gitlab])
}

fn index_backends(env: &Env) -> anyhow::Result<(Arc<dyn RankingStore>, Arc<dyn LockBackend>)> {
    let ranking: Arc<dyn RankingStore>;
    let locks: Arc<dyn LockBackend>;
    match &env.redis_url {
        Some(url) => {
            let pool = ranking::create_pool(url)?;
            info!("Using Redis for the ranking index and locks");
            ranking = Arc::new(RedisRanking::new(pool.clone()));
            locks = Arc::new(RedisLocks::new(pool));
        }
        None => {
            warn!("REDIS_URL is not set, keeping the ranking index and locks in memory");
            ranking = Arc::new(memory::MemoryRanking::default());
            locks = Arc::new(memory::MemoryLocks::default());
        }
    }
    Ok((ranking, locks))
}

pub fn services(env: &Env, db: DB) -> anyhow::Result<Services> {
    let (ranking, locks) = index_backends(env)?;
    let store = Arc::new(db);
    let engine = Arc::new(Engine::new(
        fetchers(env)?,
        store.clone(),
        store.clone(),
        ranking.clone(),
        locks,
    ));
    let reader = Arc::new(Reader::new(store.clone(), ranking, store));
    let scheduler = Arc::new(Scheduler::new(engine.clone(), env.cron_limit));
    Ok(Services {
        engine,
        reader,
        scheduler,
    })
}
