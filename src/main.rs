use std::{env, io::Error, io::ErrorKind, path::PathBuf, process::exit, rc::Rc};

use tokio::task::LocalSet;
use tracing::info;

use revgate::{
    client::TttClient,
    config,
    runtime::Runtime,
    server::TttServer,
};

enum StartupMode {
    Server(PathBuf),
    Client(PathBuf),
}

fn parse_arguments(mut args: env::Args) -> Result<StartupMode, String> {
    let program = args.next().unwrap_or_else(|| String::from("revgate"));
    let mode = args.next();
    let config_path = args.next();

    match (mode.as_deref(), config_path) {
        (Some("server"), Some(path)) => Ok(StartupMode::Server(PathBuf::from(path))),
        (Some("client"), Some(path)) => Ok(StartupMode::Client(PathBuf::from(path))),
        _ => Err(format!("Usage: {program} <server|client> <config.json>")),
    }
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let mode = match parse_arguments(env::args()) {
        Ok(mode) => mode,
        Err(err) => {
            eprintln!("{err}");
            exit(1);
        }
    };

    let runtime_result = tokio::runtime::Builder::new_current_thread().enable_all().build();

    let result = match runtime_result {
        Ok(runtime) => LocalSet::new().block_on(&runtime, async_main(mode)),
        Err(err) => {
            eprintln!("Failed to start Tokio runtime: {err}");
            exit(1);
        }
    };

    if let Err(error) = result {
        eprintln!("Program finished with error: {error}");
        exit(1);
    }
}

async fn async_main(mode: StartupMode) -> Result<(), Error> {
    let spill_dir = env::temp_dir().join("revgate-spill");
    std::fs::create_dir_all(&spill_dir)?;

    match mode {
        StartupMode::Server(config_path) => {
            let option = config::load_server_option(&config_path)?;
            let runtime = Runtime::new(spill_dir);
            runtime.memory().set_max(option.global_memory_limit_mib * 1024 * 1024);

            let server = TttServer::new(runtime, option);
            server.start().await?;

            wait_for_shutdown().await?;
            info!("shutting down");
            server.stop();
        }
        StartupMode::Client(config_path) => {
            let option = config::load_client_option(&config_path)?;
            let runtime = Runtime::new(spill_dir);
            runtime.memory().set_max(option.global_memory_limit_mib * 1024 * 1024);

            let client = TttClient::new(runtime, option);
            client.start();

            wait_for_shutdown().await?;
            info!("shutting down");
            client.stop();
        }
    }

    Ok(())
}

async fn wait_for_shutdown() -> Result<(), Error> {
    tokio::signal::ctrl_c()
        .await
        .map_err(|e| Error::new(ErrorKind::Other, format!("could not listen for ctrl-c: {e}")))
}
