use std::collections::HashSet;

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use client_core::{
    load_settings, ChatView, OutgoingMessage, PlanSyncClient, SyncEvent, SyncSettings,
};
use futures::StreamExt;
use shared::domain::{GroupId, ItemId, MemberRef, MessageId, UserId};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_stream::wrappers::{errors::BroadcastStreamRecvError, BroadcastStream};
use tracing::info;

#[derive(Parser, Debug)]
#[command(about = "Group plan sync client")]
struct Args {
    /// Overrides `backend_url` from planner.toml / PLANNER_BACKEND_URL.
    #[arg(long)]
    backend_url: Option<String>,
    /// Overrides `cache_database_url`.
    #[arg(long)]
    cache_db: Option<String>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Follow a group chat; each stdin line is sent as a message.
    Chat {
        #[arg(long)]
        group: String,
        #[arg(long)]
        user: String,
        #[arg(long)]
        name: String,
    },
    /// Inspect or change a plan item's shared extras.
    Extras {
        #[arg(long)]
        group: String,
        #[arg(long)]
        item: String,
        #[command(subcommand)]
        action: ExtrasAction,
    },
}

#[derive(Subcommand, Debug)]
enum ExtrasAction {
    Show,
    AddItem { name: String },
    RemoveItem { name: String },
    Vote {
        #[arg(long)]
        user: String,
        name: String,
    },
    Deadline { minutes: i64 },
    About { text: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();
    let args = Args::parse();

    let mut settings = load_settings();
    apply_overrides(&mut settings, &args);
    let client = PlanSyncClient::connect(settings).await?;

    let result = match args.command {
        Command::Chat { group, user, name } => {
            run_chat(&client, GroupId::new(group), MemberRef::new(user, name)).await
        }
        Command::Extras {
            group,
            item,
            action,
        } => run_extras(&client, GroupId::new(group), ItemId::new(item), action).await,
    };

    client.shutdown().await?;
    result
}

fn apply_overrides(settings: &mut SyncSettings, args: &Args) {
    if let Some(url) = &args.backend_url {
        settings.backend_url = url.clone();
    }
    if let Some(url) = &args.cache_db {
        settings.cache_database_url = url.clone();
    }
}

async fn run_chat(client: &PlanSyncClient, group_id: GroupId, identity: MemberRef) -> Result<()> {
    let chat = client.chat();
    let mut events = BroadcastStream::new(chat.subscribe());
    chat.set_identity(Some(identity));
    chat.open(group_id.clone());
    chat.show();
    info!(%group_id, "planner: chat opened");

    let mut printed = HashSet::new();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            line = lines.next_line() => {
                let Some(line) = line? else {
                    break;
                };
                if let Some(command) = line.strip_prefix('/') {
                    run_chat_command(client, command).await;
                } else if let Err(error) = chat.send(OutgoingMessage::text(line)).await {
                    eprintln!("! {error}");
                }
            }
            event = events.next() => match event {
                Some(Ok(SyncEvent::ViewUpdated { view, .. })) => print_new_messages(&view, &mut printed),
                Some(Ok(SyncEvent::Notice(notice))) => {
                    eprintln!("! {:?}: {}", notice.action, notice.message)
                }
                Some(Ok(SyncEvent::NoticeDismissed { .. })) => {}
                Some(Err(BroadcastStreamRecvError::Lagged(skipped))) => {
                    info!(skipped, "planner: skipped stale view updates");
                }
                None => break,
            },
        }
    }

    chat.close();
    Ok(())
}

/// `/react <message-id> <emoji>`, `/vote <message-id> <option-id>`, `/who`.
async fn run_chat_command(client: &PlanSyncClient, command: &str) {
    let chat = client.chat();
    let parts: Vec<&str> = command.split_whitespace().collect();
    let outcome = match parts.as_slice() {
        ["react", message_id, emoji] => {
            chat.toggle_reaction(&MessageId::new(*message_id), emoji)
                .await
        }
        ["vote", message_id, option_id] => {
            chat.vote_poll(&MessageId::new(*message_id), option_id)
                .await
        }
        ["who"] => {
            let view = chat.view();
            for member in &view.members {
                let marker = if view.online.contains(&member.user_id) {
                    "*"
                } else {
                    " "
                };
                println!("{marker} {} ({})", member.name, member.user_id);
            }
            Ok(())
        }
        _ => {
            eprintln!("! unknown command '/{command}'");
            Ok(())
        }
    };
    if let Err(error) = outcome {
        eprintln!("! {error}");
    }
}

fn print_new_messages(view: &ChatView, printed: &mut HashSet<MessageId>) {
    for message in &view.messages {
        if !printed.insert(message.id.clone()) {
            continue;
        }
        let time = message.created_at.format("%H:%M");
        println!(
            "[{time}] {}: {}  ({})",
            message.created_by.name, message.text, message.id
        );
        if let Some(poll) = &message.poll {
            for (option_id, votes) in poll.tally() {
                println!("        {option_id}: {votes}");
            }
        }
    }
}

async fn run_extras(
    client: &PlanSyncClient,
    group_id: GroupId,
    item_id: ItemId,
    action: ExtrasAction,
) -> Result<()> {
    let extras = client.extras();
    extras.sync(&group_id, &item_id).await?;

    match action {
        ExtrasAction::Show => {}
        ExtrasAction::AddItem { name } => {
            if !extras.add_menu_item(&group_id, &item_id, &name) {
                bail!("'{name}' is empty or already on the menu");
            }
        }
        ExtrasAction::RemoveItem { name } => {
            if !extras.remove_menu_item(&group_id, &item_id, &name) {
                bail!("'{name}' is not on the menu");
            }
        }
        ExtrasAction::Vote { user, name } => {
            if !extras.vote_menu_item(&group_id, &item_id, &UserId::new(user), &name) {
                bail!("vote rejected: voting closed or '{name}' is not on the menu");
            }
        }
        ExtrasAction::Deadline { minutes } => {
            let closes_at = extras.set_dinner_deadline(&group_id, &item_id, minutes);
            println!("voting closes at {closes_at}");
        }
        ExtrasAction::About { text } => extras.set_about(&group_id, &item_id, &text),
    }

    extras.flush().await;
    let blob = extras.read(&group_id, &item_id);
    println!("{}", serde_json::to_string_pretty(&blob)?);
    Ok(())
}
