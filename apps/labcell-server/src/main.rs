use std::net::SocketAddr;
use std::path::PathBuf;

use clap::Parser;

#[derive(Debug, Parser)]
#[command(name = "labcell-server")]
struct Args {
    #[arg(long, default_value = "config/labcell.yaml")]
    config: PathBuf,
    /// Override http.listen from the config file.
    #[arg(long)]
    listen: Option<SocketAddr>,
    #[arg(long, default_value = "labcell.lock")]
    lock_file: PathBuf,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    if let Err(err) = labcell_server::run_server(args.config, args.listen, args.lock_file).await {
        eprintln!("labcell-server: {err}");
        std::process::exit(err.exit_code());
    }
}
