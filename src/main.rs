//! Entry point: argument parsing, configuration loading, and handoff to the
//! event loop in [`pvdd::server`].
//!
//! Grounded on `main()` in `examples/yaleman-goatns/src/main.rs` for the
//! clap-parse-then-dispatch shape, and on `main()` in
//! `examples/original_source/src/pvdd.c` for the SIGPIPE-ignore startup step
//! (writes to a client that has gone away must not kill the daemon) and the
//! single current-thread runtime (see SPEC_FULL.md section 4.6).

use clap::Parser;
use pvdd::cli::{default_config, Cli};
use pvdd::config::ConfigFile;
use pvdd::server::Server;

fn ignore_sigpipe() {
    unsafe {
        libc::signal(libc::SIGPIPE, libc::SIG_IGN);
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> std::process::ExitCode {
    let cli = Cli::parse();

    if cli.is_export_config() {
        default_config();
        return std::process::ExitCode::SUCCESS;
    }

    let config = match ConfigFile::try_from_path(cli.config_path().as_deref()) {
        Ok(config) => cli.apply_overrides(config),
        Err(err) => {
            eprintln!("failed to load configuration: {err}");
            return std::process::ExitCode::FAILURE;
        }
    };

    if cli.is_config_check() {
        println!("{}", config.as_json_pretty());
        return std::process::ExitCode::SUCCESS;
    }

    pvdd::logging::init(config.verbose || cli.verbose());
    ignore_sigpipe();

    tracing::info!("starting pvdd: {config}");

    let mut server = match Server::bind(&config).await {
        Ok(server) => server,
        Err(err) => {
            tracing::error!("failed to start: {err}");
            return std::process::ExitCode::FAILURE;
        }
    };

    if let Err(err) = server.run().await {
        tracing::error!("event loop exited: {err}");
        return std::process::ExitCode::FAILURE;
    }

    std::process::ExitCode::SUCCESS
}
