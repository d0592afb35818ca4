use camera_server::camera_server::{run_server, ServerArgs};
use clap::Parser;
use tracing::Level;

#[derive(Parser, Debug)]
#[command(author, version, about = "Camera aggregation server with live multipart streaming")]
struct Args {
    #[command(flatten)]
    server: ServerArgs,

    /// Maximum log level (error, warn, info, debug, trace)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: Level,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    tracing_subscriber::fmt().with_max_level(args.log_level).init();

    run_server(args.server).await
}
