use clap::Parser;

#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    #[clap(
        short,
        long,
        default_value = "kagami.yaml",
        help = "Path to the configuration file."
    )]
    pub config: String,

    #[clap(subcommand)]
    pub subcmd: SubCommand,
}

#[derive(Parser, Debug, Clone)]
pub enum SubCommand {
    #[clap(name = "update")]
    Update(UpdateArgs),
}

#[derive(Parser, Debug, Clone)]
pub struct UpdateArgs {
    #[clap(help = "Mirror ids to update. Updates every configured mirror when empty.")]
    pub ids: Vec<String>,
}

#[must_use]
pub fn parse_args() -> Args {
    Args::parse()
}
