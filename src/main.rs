//! Process entry point: loads configuration, constructs the IM back-ends and
//! the home-server client, spins up the main loop on its own thread, and
//! serves the Application Service HTTP frontend until shutdown.

use std::collections::HashMap;
use std::rc::Rc;
use std::time::Duration;

use pumaduct::config::Config;
use pumaduct::db::Db;
use pumaduct::im_client::{ImClient, UnconfiguredClient};
use pumaduct::mainloop::MainLoop;
use pumaduct::matrix_client::{HttpMatrixClient, MatrixClient};

#[rocket::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config_path = std::env::var("PUMADUCT_CONFIG").unwrap_or_else(|_| "pumaduct.yaml".to_string());
    let config = match Config::load(&config_path) {
        Ok(c) => c,
        Err(e) => {
            tracing::error!(error = %e, path = %config_path, "failed to load configuration");
            std::process::exit(1);
        }
    };

    let main_loop = MainLoop::new();
    let handle = main_loop.handle();

    let spawn_config = config.clone();
    let join_handle = main_loop.spawn(move |loop_handle| {
        let db = match Db::new(&spawn_config.db_path) {
            Ok(db) => Rc::new(db),
            Err(e) => {
                tracing::error!(error = %e, "failed to open database, starting with none persisted");
                std::process::exit(1);
            }
        };
        let matrix: Rc<dyn MatrixClient> = Rc::new(HttpMatrixClient::new(
            spawn_config.hs_server.clone(),
            spawn_config.hs_access_token.clone(),
        ));
        let clients = build_clients(&spawn_config);
        let mut backend = pumaduct::backend::Backend::new(&spawn_config, matrix, clients, db, loop_handle);
        backend.start();
        backend
    });

    spawn_timers(&config, &handle);

    let (address, port) = parse_bind(&config.http_frontend.bind);
    let rocket_config = rocket::Config {
        address,
        port,
        ..rocket::Config::default()
    };

    let rocket = rocket::custom(rocket_config)
        .manage(config.clone())
        .manage(handle.clone())
        .register(
            "/",
            rocket::catchers![
                pumaduct::http_frontend::unauthorized,
                pumaduct::http_frontend::forbidden,
                pumaduct::http_frontend::not_found,
                pumaduct::http_frontend::bad_request,
            ],
        )
        .mount(
            "/",
            rocket::routes![
                pumaduct::http_frontend::query_user,
                pumaduct::http_frontend::push_transaction,
            ],
        );

    tokio::select! {
        result = rocket.launch() => {
            if let Err(e) = result {
                tracing::error!(error = %e, "http frontend exited with an error");
            }
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutdown signal received");
        }
    }

    handle.post(|backend| backend.request_stop());
    let shutdown_timeout = Duration::from_secs(config.shutdown_timeout_secs);
    let joined = tokio::task::spawn_blocking(move || join_handle.join());
    if tokio::time::timeout(shutdown_timeout, joined).await.is_err() {
        tracing::warn!("main loop did not exit within the shutdown timeout");
    }
}

fn parse_bind(bind: &str) -> (std::net::IpAddr, u16) {
    let default_addr = std::net::IpAddr::from([127, 0, 0, 1]);
    let Some((host, port)) = bind.rsplit_once(':') else {
        return (default_addr, 8090);
    };
    let addr = host.parse().unwrap_or(default_addr);
    let port = port.parse().unwrap_or(8090);
    (addr, port)
}

/// Builds one `ImClient` per distinct `client` key named in the
/// configuration's networks. No protocol back-end ships with this crate;
/// every key resolves to `UnconfiguredClient` until a real implementation is
/// linked in by whoever assembles a deployment.
fn build_clients(config: &Config) -> HashMap<String, Rc<dyn ImClient>> {
    let mut clients: HashMap<String, Rc<dyn ImClient>> = HashMap::new();
    for net_conf in config.networks.values() {
        clients.entry(net_conf.client.clone()).or_insert_with(|| {
            Rc::new(UnconfiguredClient::new(net_conf.client.clone())) as Rc<dyn ImClient>
        });
    }
    clients
}

fn spawn_timers(config: &Config, handle: &pumaduct::mainloop::MainLoopHandle) {
    let retry_handle = handle.clone();
    let retry_secs = config.offline_retry_secs;
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(retry_secs.max(1)));
        loop {
            interval.tick().await;
            retry_handle.post(|backend| backend.on_retry_tick());
        }
    });

    let presence_handle = handle.clone();
    let presence_secs = config.presence_refresh_secs;
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(presence_secs.max(1)));
        loop {
            interval.tick().await;
            presence_handle.post(|backend| backend.on_presence_refresh_tick());
        }
    });
}
