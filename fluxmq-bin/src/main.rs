#![deny(unsafe_code)]

use std::process;

use structopt::StructOpt;

use fluxmq::conf::{Options, Settings};
use fluxmq::logger::logger_init;
use fluxmq::Server;

#[tokio::main]
async fn main() {
    //init config
    let settings = match Settings::init(Options::from_args()) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("settings init failed, {}", e);
            process::exit(1);
        }
    };

    //init log
    if let Err(e) = logger_init(&settings.log) {
        eprintln!("logger init failed, {}", e);
        process::exit(1);
    }
    let _ = Settings::logs();

    let server = match Server::new(settings.clone()) {
        Ok(s) => s,
        Err(e) => {
            log::error!("server init failed, {}", e);
            process::exit(1);
        }
    };

    let handle = server.handle();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            log::error!("signal listener failed, {}", e);
            return;
        }
        log::info!("ctrl-c received, shutting down");
        if let Err(e) = handle.stop(None, false).await {
            log::warn!("stop failed, {}", e);
        }
    });

    if let Err(e) = server.listen().await {
        log::error!("fluxmqd failed, {}", e);
        process::exit(1);
    }
    log::info!("fluxmqd stopped");
}
