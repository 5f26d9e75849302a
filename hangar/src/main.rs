//! Hangar - Entry Point
//!
//! Control plane that runs one agent container per tenant deployment and
//! routes `<subdomain>.<domain>` traffic to it.

use std::collections::HashMap;
use std::env;

use hangar::app::options::AppOptions;
use hangar::app::run::run;
use hangar::logs::{init_logging, LogOptions};
use hangar::secrets::codec::SecretsCodec;
use hangar::storage::layout::StorageLayout;
use hangar::storage::settings::{Settings, MASTER_KEY_ENV};
use hangar::utils::version_info;

use secrecy::{ExposeSecret, SecretString};
use tracing::{error, info};

#[tokio::main]
async fn main() {
    // Parse command line arguments
    let args: Vec<String> = env::args().collect();
    let mut cli_args: HashMap<String, String> = HashMap::new();

    for arg in args.iter().skip(1) {
        if let Some((key, value)) = arg.split_once('=') {
            // Handle --key=value format
            let clean_key = key.trim_start_matches('-');
            cli_args.insert(clean_key.to_string(), value.to_string());
        } else if arg.starts_with("--") {
            // Handle standalone flags like --version
            let clean_key = arg.trim_start_matches('-');
            cli_args.insert(clean_key.to_string(), "true".to_string());
        }
    }

    // Print version and exit
    let version = version_info();
    if cli_args.contains_key("version") {
        match serde_json::to_string_pretty(&version) {
            Ok(json) => println!("{json}"),
            Err(e) => eprintln!("Failed to serialize version: {e}"),
        }
        return;
    }

    // Print a fresh master key and exit
    if cli_args.contains_key("generate-key") {
        println!("{}", SecretsCodec::generate_master_key().expose_secret());
        return;
    }

    let layout = match cli_args.get("base-dir") {
        Some(dir) => StorageLayout::new(dir),
        None => StorageLayout::default(),
    };

    // Retrieve the settings file, falling back to defaults
    let settings_file = layout.settings_file();
    let settings = if settings_file.exists().await {
        match settings_file.read_json::<Settings>().await {
            Ok(settings) => settings,
            Err(e) => {
                eprintln!("Unable to read settings file: {e}");
                return;
            }
        }
    } else {
        Settings::default()
    };

    if cli_args.contains_key("print-settings") {
        match serde_json::to_string_pretty(&settings) {
            Ok(json) => println!("{json}"),
            Err(e) => eprintln!("Failed to serialize settings: {e}"),
        }
        return;
    }

    // Initialize logging
    let log_options = LogOptions {
        log_level: settings.log_level.clone(),
        json_format: settings.log_json,
        log_dir: settings
            .log_to_file
            .then(|| layout.logs_dir().path().to_path_buf()),
    };
    let _log_guard = match init_logging(log_options) {
        Ok(guard) => guard,
        Err(e) => {
            println!("Failed to initialize logging: {e}");
            None
        }
    };

    // Load the master key
    let master_key = match env::var(MASTER_KEY_ENV) {
        Ok(value) if !value.trim().is_empty() => SecretString::from(value),
        _ => {
            error!("{} is not set", MASTER_KEY_ENV);
            error!("Generate one with: hangar --generate-key");
            return;
        }
    };

    // Run the control plane
    let options = AppOptions::from_settings(&settings, layout);

    info!("Running Hangar {} with options: {:?}", version.version, options);
    let result = run(options, master_key, await_shutdown_signal()).await;
    if let Err(e) = result {
        error!("Failed to run hangar: {e}");
        std::process::exit(1);
    }
}

async fn await_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let (mut sigterm, mut sigint) =
            match (signal(SignalKind::terminate()), signal(SignalKind::interrupt())) {
                (Ok(sigterm), Ok(sigint)) => (sigterm, sigint),
                _ => {
                    error!("Failed to install signal handlers, falling back to Ctrl+C");
                    let _ = tokio::signal::ctrl_c().await;
                    return;
                }
            };

        tokio::select! {
            _ = sigterm.recv() => {
                info!("SIGTERM received, shutting down...");
            }
            _ = sigint.recv() => {
                info!("SIGINT received, shutting down...");
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        info!("Ctrl+C received, shutting down...");
    }
}
