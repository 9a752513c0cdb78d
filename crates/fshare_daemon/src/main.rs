use clap::Parser;
use fshare::{
    activity::ACTIVITY_TARGET, config::Config, daemon::Daemon, error::Error,
    peer::PeerId,
};
use tracing::Level;
use tracing_subscriber::{
    filter::{LevelFilter, Targets},
    fmt,
    layer::SubscriberExt,
    util::SubscriberInitExt,
    Layer,
};

use args::Args;

mod args;

#[tokio::main]
async fn main() -> Result<(), Error> {
    let args = Args::parse();

    let config = Config::load(
        &args.common,
        &args.peer_info,
        args.cli_config(),
        PeerId(args.peer_id),
        args.work_dir.clone(),
    )?;

    // the activity log of the peer goes to its own file, everything else to
    // stdout.
    let file_appender =
        tracing_appender::rolling::never(&config.work_dir, config.log_file_name());
    let (file_writer, _guard) = tracing_appender::non_blocking(file_appender);

    let level = if args.verbose { Level::DEBUG } else { Level::INFO };

    let stdout_layer = fmt::layer()
        .with_target(false)
        .with_file(false)
        .with_filter(LevelFilter::from_level(level));

    let activity_layer = fmt::layer()
        .with_writer(file_writer)
        .with_ansi(false)
        .with_target(false)
        .with_level(false)
        .with_filter(Targets::new().with_target(ACTIVITY_TARGET, Level::INFO));

    tracing_subscriber::registry()
        .with(stdout_layer)
        .with(activity_layer)
        .init();

    tracing::info!("config: {config:?}");

    Daemon::new(config)?.run().await
}
