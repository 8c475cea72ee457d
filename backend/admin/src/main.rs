//! Operator commands against the configured store.
//!
//! Reads the same environment as the server.
use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use server::{
    config::Config,
    init_tracing,
    store::{log_latest_statuses, open_store},
};
use tracing::info;

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Last status of every badge ever seen.
    List,

    /// Visits recorded for one badge.
    Visits { nfcid: String },

    /// Remove every status and visit.
    Drop {
        #[arg(long)]
        yes: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let args = Args::parse();

    let config = Config::load().context("Environment misconfigured")?;
    let store = open_store(&config).await.context("Failed to open store")?;

    match args.command {
        Command::List => log_latest_statuses(store.as_ref()).await,
        Command::Visits { nfcid } => {
            let visits = store.list_visits(&nfcid).await?;
            info!("{} visits for {nfcid}", visits.len());

            for visit in visits {
                println!(
                    "{}\t{:.0}s\t{}",
                    visit.datetime,
                    visit.duration_secs,
                    visit.ip.as_deref().unwrap_or("-")
                );
            }
        }
        Command::Drop { yes } => {
            if !yes {
                bail!("Refusing to drop the store without --yes");
            }

            store.drop_all().await?;
            println!("Store dropped");
        }
    }

    store.close().await;
    Ok(())
}
