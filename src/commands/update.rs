use chrono::Local;
use color_eyre::eyre::{bail, Result};
use futures::future::try_join_all;
use tokio_util::sync::CancellationToken;

use crate::{args::UpdateArgs, config::Config, mirror::Mirror};

pub async fn run_update(args: UpdateArgs, config: &Config) -> Result<()> {
    config.check()?;

    let mut ids: Vec<String> = if args.ids.is_empty() {
        config.mirrors.keys().cloned().collect()
    } else {
        args.ids
    };
    ids.sort();
    if ids.is_empty() {
        bail!("no mirrors configured");
    }

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupted, cancelling update");
                cancel.cancel();
            }
        });
    }

    let now = Local::now();
    let mirrors = try_join_all(ids.iter().map(|id| Mirror::new(now, id, config))).await?;
    try_join_all(mirrors.iter().map(|m| m.update(&cancel))).await?;

    Ok(())
}
