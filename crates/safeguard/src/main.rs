//! `safeguard` - CLI for the emergency core
//!
//! This binary manages emergency contacts and runs SOS sessions in the
//! terminal, printing each session snapshot as it changes.

#![warn(missing_debug_implementations)]
#![deny(unsafe_code)]

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;

use safeguard::cli::{
    wait_for_resolution, Cli, Command, ConfigCommand, ContactsCommand, HistoryCommand, SosCommand,
};
use safeguard::{init_logging, Config, ContactId, SafetyContext, SessionSnapshot, Storage};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_logging(cli.verbosity());

    match cli.command {
        Command::Config(cmd) => handle_config(cli.config, cmd),
        Command::Contacts(cmd) => handle_contacts(&open_context(cli.config)?, cmd).await,
        Command::Sos(cmd) => handle_sos(open_context(cli.config)?, &cmd).await,
        Command::History(cmd) => handle_history(&open_context(cli.config)?, &cmd),
    }
}

fn open_context(config_path: Option<PathBuf>) -> Result<SafetyContext> {
    let config = Config::load_from(config_path).context("loading configuration")?;
    SafetyContext::build(config).context("starting safeguard")
}

async fn handle_contacts(ctx: &SafetyContext, cmd: ContactsCommand) -> Result<()> {
    let service = ctx.service();
    match cmd {
        ContactsCommand::List { json } => {
            let contacts = service.contacts().await;
            if json {
                println!("{}", serde_json::to_string_pretty(&contacts)?);
            } else if contacts.is_empty() {
                println!("No emergency contacts.");
            } else {
                println!("{:>4}  {:<20} {:<16} {:<12} flags", "id", "name", "phone", "relation");
                for c in contacts {
                    let mut flags = Vec::new();
                    if c.is_primary {
                        flags.push("primary");
                    }
                    if c.is_trusted {
                        flags.push("trusted");
                    }
                    println!(
                        "{:>4}  {:<20} {:<16} {:<12} {}",
                        c.id,
                        c.name,
                        c.phone_number,
                        c.relationship,
                        flags.join(",")
                    );
                }
            }
        }
        ContactsCommand::Add(args) => {
            let contact = service.add_contact(&args.draft()).await?;
            if args.primary {
                service.set_primary_contact(contact.id).await?;
            }
            println!("Added contact {} ({})", contact.id, contact.name);
        }
        ContactsCommand::Update(args) => {
            let contact = service
                .update_contact(args.contact_id(), &args.update())
                .await?;
            println!("Updated contact {} ({})", contact.id, contact.name);
        }
        ContactsCommand::Remove { id } => {
            let removed = service.delete_contact(ContactId(id)).await?;
            println!("Removed contact {} ({})", removed.id, removed.name);
            if removed.is_primary {
                println!("No primary contact is set now.");
            }
        }
        ContactsCommand::Primary { id } => {
            service.set_primary_contact(ContactId(id)).await?;
            println!("Contact {id} is now the primary contact");
        }
    }
    Ok(())
}

async fn handle_sos(mut ctx: SafetyContext, cmd: &SosCommand) -> Result<()> {
    ctx.start_countdown();
    let service = Arc::clone(ctx.service());
    let mut updates = service.subscribe();

    print_snapshot(&service.activate().await, cmd.json)?;
    if cmd.siren {
        service.toggle_siren().await?;
    }

    let deadline = cmd.duration_secs.map(Duration::from_secs);
    let finished = wait_for_resolution(deadline, tokio::signal::ctrl_c());
    tokio::pin!(finished);

    loop {
        tokio::select! {
            () = &mut finished => break,
            changed = updates.changed() => {
                if changed.is_err() {
                    break;
                }
                let snapshot = updates.borrow_and_update().clone();
                print_snapshot(&snapshot, cmd.json)?;
            }
        }
    }

    println!("I'm safe - resolving session.");
    print_snapshot(&service.deactivate().await, cmd.json)?;
    ctx.shutdown().await;
    Ok(())
}

fn print_snapshot(snapshot: &SessionSnapshot, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string(snapshot)?);
        return Ok(());
    }

    let mut line = format!("[{}]", snapshot.status);
    if let Some(countdown) = snapshot.countdown {
        if countdown.expired {
            line.push_str(" countdown elapsed");
        } else {
            line.push_str(&format!(" cancel in {}s", countdown.remaining_secs()));
        }
    }
    if snapshot.siren_enabled {
        line.push_str(" siren ON");
    }
    if !snapshot.notified_contact_ids.is_empty() {
        let ids: Vec<String> = snapshot
            .notified_contact_ids
            .iter()
            .map(ToString::to_string)
            .collect();
        line.push_str(&format!(" notified [{}]", ids.join(",")));
    }
    if !snapshot.failed_contact_ids.is_empty() {
        line.push_str(&format!(" failed {}", snapshot.failed_contact_ids.len()));
    }
    match (&snapshot.current_location, &snapshot.location_advisory) {
        (Some(fix), _) => line.push_str(&format!(" at {}", fix.maps_url())),
        (None, Some(advisory)) => line.push_str(&format!(" ({advisory})")),
        (None, None) => {}
    }
    println!("{line}");
    Ok(())
}

fn handle_history(ctx: &SafetyContext, cmd: &HistoryCommand) -> Result<()> {
    let records = ctx.service().history(cmd.limit)?;
    if cmd.json {
        println!("{}", serde_json::to_string_pretty(&records)?);
        return Ok(());
    }
    if records.is_empty() {
        println!("No past sessions.");
        return Ok(());
    }
    for record in records {
        println!(
            "{}  {}  {}s  {}  notified {}{}",
            record.id,
            record.activated_at.format("%Y-%m-%d %H:%M:%S"),
            record.duration().num_seconds(),
            record.resolution,
            record.notified_contact_ids.len(),
            if record.siren_used { "  siren" } else { "" }
        );
    }
    Ok(())
}

fn handle_config(config_path: Option<PathBuf>, cmd: ConfigCommand) -> Result<()> {
    match cmd {
        ConfigCommand::Show { json } => {
            let config = Config::load_from(config_path)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&config)?);
            } else {
                println!("Current Configuration");
                println!("=====================");
                println!();
                println!("[Session]");
                println!("  Auto-cancel window: {}s", config.session.auto_cancel_window_secs);
                println!("  Countdown tick:     {}ms", config.session.countdown_tick_ms);
                println!("  Record history:     {}", config.session.record_history);
                println!();
                println!("[Location]");
                println!("  Provider:           {:?}", config.location.provider);
                println!("  Sample interval:    {}s", config.location.sample_interval_secs);
                println!("  Distance filter:    {}m", config.location.distance_filter_m);
                println!();
                println!("[Notify]");
                println!("  Transport:          {:?}", config.notify.transport);
                println!("  Timeout:            {}ms", config.notify.timeout_ms);
                println!();
                println!("[Storage]");
                println!("  Database path:      {}", config.database_path().display());
                if let Ok(storage) = Storage::open(config.database_path()) {
                    if let Ok(stats) = storage.stats() {
                        println!(
                            "  Contacts:           {} ({} trusted)",
                            stats.contacts, stats.trusted_contacts
                        );
                        println!("  Sessions:           {}", stats.sessions);
                        println!("  Database size:      {} bytes", stats.db_size_bytes);
                    }
                }
            }
        }
        ConfigCommand::Path => {
            println!("{}", Config::default_config_path().display());
        }
        ConfigCommand::Validate { file } => {
            let path = file.or(config_path).unwrap_or_else(Config::default_config_path);
            println!("Validating configuration: {}", path.display());
            match Config::load_from(Some(path)) {
                Ok(_) => println!("Configuration is valid."),
                Err(e) => println!("Configuration error: {e}"),
            }
        }
    }
    Ok(())
}
