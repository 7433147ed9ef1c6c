#[macro_use]
extern crate rocket;

mod entrypoints;

use rocket::fairing::AdHoc;
use rocket_db_pools::Database;
use rocket_prometheus::PrometheusMetrics;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::EnvFilter;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use contribution_leaderboard_server::{
    config::Env,
    db::{self, DB},
    scheduler, services,
};
use entrypoints::{auth::AdminToken, ApiDoc};

/// Builds the refresh services once the database pool exists and hands them
/// to the routes and to the daily refresh.
fn services_stage(env: Env) -> AdHoc {
    AdHoc::on_ignite("Refresh services", |rocket| async move {
        rocket.attach(AdHoc::try_on_ignite(
            "Build refresh services",
            move |rocket| async move {
                let Some(db) = DB::fetch(&rocket).cloned() else {
                    error!("Database pool is not initialized");
                    return Err(rocket);
                };
                let services = match services(&env, db) {
                    Ok(services) => services,
                    Err(e) => {
                        error!("Failed to build refresh services: {e:#}");
                        return Err(rocket);
                    }
                };
                let daily = scheduler::stage(services.scheduler.clone(), env.cron_interval());
                Ok(rocket
                    .manage(services.engine)
                    .manage(services.reader)
                    .manage(services.scheduler)
                    .manage(AdminToken::new(env.admin_token))
                    .attach(daily))
            },
        ))
    })
}

#[launch]
async fn rocket() -> _ {
    dotenv::dotenv().ok();

    let subscriber = tracing_subscriber::registry()
        .with(EnvFilter::from_default_env())
        .with(tracing_subscriber::fmt::layer().pretty());
    tracing::subscriber::set_global_default(subscriber).expect("Failed to set subscriber");

    let env = envy::from_env::<Env>().expect("Failed to load environment variables");
    let cors = rocket_cors::CorsOptions::default()
        .to_cors()
        .expect("Failed to build CORS options");
    let prometheus = PrometheusMetrics::new();

    let span = tracing::info_span!("Starting Rocket");
    let _enter = span.enter();

    rocket::build()
        .attach(db::stage())
        .attach(services_stage(env))
        .attach(entrypoints::stage())
        .attach(cors)
        .attach(prometheus.clone())
        .mount("/metrics", prometheus)
        .mount(
            "/",
            SwaggerUi::new("/swagger-ui/<_..>").url("/api-docs/openapi.json", ApiDoc::openapi()),
        )
}
