use std::env;

use tracing::error;
use tracing_subscriber::EnvFilter;

const USAGE: &str = "Usage: nickel serve --config <path> | nickel verify-audit <path> [--mirror <path>]";

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let mut args = env::args().skip(1);
    let cmd = args.next().unwrap_or_default();
    match cmd.as_str() {
        "serve" => serve(args).await,
        "verify-audit" => verify_audit(args),
        _ => {
            eprintln!("{USAGE}");
            std::process::exit(2);
        }
    }
}

async fn serve(mut args: impl Iterator<Item = String>) {
    let mut config_path = String::from("./config/example-config.yaml");
    while let Some(arg) = args.next() {
        if arg == "--config" {
            if let Some(v) = args.next() {
                config_path = v;
            }
        }
    }

    let cfg = match nickel_config::load_and_validate(&config_path) {
        Ok(v) => v,
        Err(e) => {
            error!(path = %config_path, "failed to load config: {e}");
            std::process::exit(1);
        }
    };

    if let Err(e) = nickel_server::serve(cfg).await {
        error!("server exited with error: {e}");
        std::process::exit(1);
    }
}

fn verify_audit(mut args: impl Iterator<Item = String>) {
    let Some(path) = args.next() else {
        eprintln!("{USAGE}");
        std::process::exit(2);
    };
    let mut mirror = None;
    while let Some(arg) = args.next() {
        if arg == "--mirror" {
            mirror = args.next();
        }
    }

    match nickel_server::verify_audit_chain_with_mirror(&path, mirror.as_deref()) {
        Ok(summary) => println!("{summary}"),
        Err(e) => {
            eprintln!("audit verification failed: {e}");
            std::process::exit(1);
        }
    }
}
