use color_eyre::Result;
use kagami::{
    args::{parse_args, SubCommand},
    commands::update::run_update,
    config::Config,
};
use pretty_env_logger::formatted_timed_builder;

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    let mut log_builder = formatted_timed_builder();
    log_builder.parse_filters("kagami=info");
    if let Ok(filters) = std::env::var("RUST_LOG") {
        log_builder.parse_filters(&filters);
    }
    log_builder.try_init()?;

    let args = parse_args();
    let config = Config::from_path(&args.config).await?;

    match args.subcmd {
        SubCommand::Update(update_args) => run_update(update_args, &config).await?,
    }

    Ok(())
}
