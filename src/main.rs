use std::{path::PathBuf, sync::Arc, time::Duration};

use anyhow::{Context, Result};
use clap::Parser;
use tracing::warn;
use tracing_subscriber::{EnvFilter, fmt};

use anthive::{
    compute_api::ComputeApiClient,
    config::{Cli, Command, OrderArgs, UpArgs},
    dispatch::{DispatchOptions, Dispatcher, OrderOutcome},
    executor::{self, SshExecutor},
    fleet::{EnsureFleetRequest, FleetReconciler, region_for_zone},
    roster::{RosterError, RosterStore},
};

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let cli = Cli::parse();
    let store = RosterStore::new(roster_path(cli.roster.clone())?);

    match cli.command {
        Command::Up(ref args) => cmd_up(&cli, &store, args.clone()).await,
        Command::Order(ref args) => cmd_order(&cli, &store, args.clone()).await,
        Command::Down => cmd_down(&cli, &store).await,
        Command::Report => cmd_report(&cli, &store).await,
    }
}

async fn cmd_up(cli: &Cli, store: &RosterStore, args: UpArgs) -> Result<()> {
    let pem = executor::key_path(&ssh_dir()?, &args.key);
    if !pem.is_file() {
        warn!(
            path = %pem.display(),
            "no key file found; you will need this key in your ssh agent to reach members"
        );
    }

    let client = api_client(cli, &args.zone);
    let reconciler = FleetReconciler::new(store, &client);
    let outcome = reconciler
        .ensure_fleet(EnsureFleetRequest {
            desired_count: args.servers,
            owner_username: args.login,
            credential_key_name: args.key,
            zone: args.zone,
            image: args.image,
            instance_type: args.instance_type,
            group: args.group,
            subnet: args.subnet,
            bid: args.bid,
        })
        .await
        .context("fleet-up aborted")?;

    println!(
        "Fleet ready: {} member(s) ({} reused, {} new, {} dropped).",
        outcome.roster.member_ids.len(),
        outcome.reused,
        outcome.created,
        outcome.dropped
    );
    Ok(())
}

async fn cmd_order(cli: &Cli, store: &RosterStore, args: OrderArgs) -> Result<()> {
    let Some(roster) = store.load()? else {
        println!("No members are ready for orders.");
        return Ok(());
    };

    let client = api_client(cli, &roster.zone);
    let executor = Arc::new(SshExecutor::new(ssh_dir()?));
    let options = DispatchOptions {
        per_member_timeout: (args.timeout > 0).then(|| Duration::from_secs(args.timeout)),
    };
    let dispatcher = Dispatcher::with_options(store, &client, executor, options);

    let report = dispatcher
        .dispatch(&args.orders, &args.files)
        .await
        .context("dispatch aborted")?;

    if report.targets == 0 {
        println!("No members are ready for orders.");
        return Ok(());
    }

    for round in &report.rounds {
        println!("Order: {}", round.order.label());
        let mut succeeded = 0usize;
        let mut failed = 0usize;
        for (instance_id, outcome) in &round.results {
            match outcome {
                OrderOutcome::Completed { output } => {
                    succeeded += 1;
                    println!("  {instance_id}: ok");
                    for line in output.lines() {
                        println!("    {line}");
                    }
                }
                OrderOutcome::TransportFailed { message } => {
                    failed += 1;
                    println!("  {instance_id}: transport failure: {message}");
                }
                OrderOutcome::Failed { message } => {
                    failed += 1;
                    println!("  {instance_id}: failed: {message}");
                }
            }
        }
        println!("Round complete: {succeeded} succeeded, {failed} failed.");
    }
    println!("All orders dispatched; the fleet is awaiting new ones.");
    Ok(())
}

async fn cmd_down(cli: &Cli, store: &RosterStore) -> Result<()> {
    let loaded = match store.load() {
        Ok(loaded) => loaded,
        Err(err @ RosterError::Corrupt { .. }) => {
            // Surface the bad state, then treat it as "no fleet" so the
            // operator can start over.
            warn!(error = %err, "roster is unreadable; clearing it");
            store.clear()?;
            println!("Stood down 0 members.");
            return Ok(());
        }
        Err(err) => return Err(err.into()),
    };
    let Some(roster) = loaded else {
        println!("No members have been mobilized.");
        return Ok(());
    };

    let client = api_client(cli, &roster.zone);
    let reconciler = FleetReconciler::new(store, &client);
    let count = reconciler
        .terminate_fleet()
        .await
        .context("fleet-down aborted")?;
    println!("Stood down {count} members.");
    Ok(())
}

async fn cmd_report(cli: &Cli, store: &RosterStore) -> Result<()> {
    let Some(roster) = store.load()? else {
        println!("No members have been mobilized.");
        return Ok(());
    };

    let client = api_client(cli, &roster.zone);
    let reconciler = FleetReconciler::new(store, &client);
    let members = reconciler
        .report_fleet()
        .await
        .context("fleet report aborted")?;

    if members.is_empty() {
        println!("No members have been mobilized.");
        return Ok(());
    }
    for member in &members {
        println!(
            "Member {}: {} @ {}",
            member.instance_id, member.lifecycle_state, member.network_address
        );
    }
    Ok(())
}

fn api_client(cli: &Cli, zone: &str) -> ComputeApiClient {
    ComputeApiClient::new(
        cli.api_url.clone(),
        cli.api_token.clone(),
        region_for_zone(zone).to_string(),
    )
}

fn roster_path(overridden: Option<PathBuf>) -> Result<PathBuf> {
    if let Some(path) = overridden {
        return Ok(path);
    }
    Ok(home_dir()?.join(".anthive"))
}

fn ssh_dir() -> Result<PathBuf> {
    Ok(home_dir()?.join(".ssh"))
}

fn home_dir() -> Result<PathBuf> {
    let home = std::env::var_os("HOME").context("HOME is not set")?;
    Ok(PathBuf::from(home))
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt().with_env_filter(filter).compact().init();
}
