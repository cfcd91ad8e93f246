use std::io::{self, BufRead};
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use log::{error, info};

use ftpring::{Config, Server};

#[derive(Parser)]
#[command(version, about = "Anonymous FTP server driven by io_uring completion rings")]
struct Args {
    /// Address to bind the control listener to
    #[clap(long, default_value = "0.0.0.0")]
    bind: Ipv4Addr,

    /// Control channel port
    #[clap(long, default_value_t = 2121)]
    port: u16,

    /// Directory tree to serve
    #[clap(long, default_value = ".")]
    root: PathBuf,

    /// Worker threads driving the completion queue (default: one per CPU)
    #[clap(long)]
    threads: Option<usize>,
}

fn main() -> ExitCode {
    env_logger::init();
    let args = Args::parse();

    let mut config = Config::new(args.root).bind(args.bind).port(args.port);
    if let Some(threads) = args.threads {
        config = config.threads(threads);
    }

    let server = match Server::new(config) {
        Ok(server) => server,
        Err(err) => {
            error!("cannot start server: {}", err);
            return ExitCode::FAILURE;
        }
    };
    server.start();
    info!("press Enter (or close stdin) to shut down");

    let mut line = String::new();
    let _ = io::stdin().lock().read_line(&mut line);

    server.stop();
    ExitCode::SUCCESS
}
