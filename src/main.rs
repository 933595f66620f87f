use asyncweb::{Config, Server};
use clap::Parser;
use log::{error, info};
use std::process::ExitCode;

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = Config::parse();
    info!(
        "static files under /{}, dynamic files under /{}, chunk size {} bytes",
        config.static_folder, config.dynamic_folder, config.chunk_size
    );

    let result = Server::bind(config).and_then(|mut server| server.run());
    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{}", e);
            ExitCode::FAILURE
        }
    }
}
