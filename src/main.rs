#[macro_use]
extern crate log;

mod config;
mod connection;
mod error;
mod event;
mod framing;
mod playlist;
mod ready;
mod room;
mod room_manager;
mod server;
mod sync;
mod wire;

#[cfg(test)]
mod tests;

use std::env;

use config::Features;

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    env_logger::init_from_env(env_logger::Env::new().filter_or("LOG", "info"));

    let cli_port = env::args().nth(1);
    let port = config::resolve_port(cli_port.as_deref());
    let features = Features::from_env();

    if let Err(e) = server::serve(port, features).await {
        error!("failed to start server on port {port}: {e}");
        std::process::exit(1);
    }
}
