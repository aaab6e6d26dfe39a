//! Line-oriented chat shell over [`ChatClient`].
//!
//! Session identity comes from `CARECHAT_TOKEN`, `CARECHAT_USER_ID`,
//! `CARECHAT_USER_NAME` and `CARECHAT_USER_ROLE`; endpoints from the usual
//! client configuration variables.

use std::sync::Arc;

use anyhow::{bail, Context};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::info;
use tracing_subscriber::EnvFilter;

use carechat_client::{
    ChatClient, ChatUpdate, ClientConfig, ConnectionBanner, MessageView, RoleFilter, Session,
};
use carechat_shared::types::{ClientId, ConversationKey, Credential, Role, ServerMessageId, UserId};
use carechat_shared::ChatError;

const HELP: &str = "\
commands:
  list                     conversations, newest first
  who [role] [search]      people you can message
  open <user-id>           select a conversation
  send <text>              send in the open conversation
  reply <msg-id> <text>    reply to a message
  resend <client-id>       retry a failed message
  delete <client-id>       delete one of your saved messages
  history                  reload the open conversation
  older                    load earlier messages
  unread                   unread totals from the server
  away | back              presence shown to others
  quit";

fn required(key: &str) -> anyhow::Result<String> {
    std::env::var(key).with_context(|| format!("{key} is not set"))
}

fn session_from_env() -> anyhow::Result<Session> {
    let role: Role = required("CARECHAT_USER_ROLE")?
        .parse()
        .map_err(|e: String| anyhow::anyhow!(e))?;
    let id = required("CARECHAT_USER_ID")?;
    let name = std::env::var("CARECHAT_USER_NAME").unwrap_or_else(|_| id.clone());
    Ok(Session::new(id, name, role, Credential::new(required("CARECHAT_TOKEN")?)))
}

fn print_message(m: &MessageView) {
    let id = m
        .server_id
        .as_ref()
        .map(|s| s.to_string())
        .unwrap_or_else(|| "-".into());
    let quote = m
        .reply_preview
        .as_ref()
        .map(|r| format!(" [re: {}]", r.excerpt))
        .unwrap_or_default();
    println!(
        "{} {:<12} {:<9} {}{} ({id}, {})",
        m.created_at.format("%H:%M"),
        m.sender_display_name,
        format!("{:?}", m.status).to_lowercase(),
        m.content,
        quote,
        m.client_id,
    );
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("warn,carechat_client=info")),
        )
        .init();

    let session = session_from_env()?;
    let config = ClientConfig::from_env();
    info!(user = %session.user_id(), api = %config.api_url, "Starting console");

    let client = Arc::new(ChatClient::start(session, &config)?);
    if let Err(e) = client.connect().await {
        eprintln!("live connection unavailable: {e}");
    }
    if let Err(e) = client.refresh_directory().await {
        eprintln!("directory unavailable: {e}");
    }
    if let Err(e) = client.refresh_conversations().await {
        eprintln!("conversations unavailable: {e}");
    }

    let mut updates = client.subscribe_updates();
    let me = client.session().user_id().clone();
    tokio::spawn(async move {
        while let Ok(update) = updates.recv().await {
            match update {
                ChatUpdate::MessageAdded { message, .. } if !message.is_own => {
                    print_message(&message)
                }
                ChatUpdate::SendFailed { reason, client_id, .. } => {
                    println!("! not saved ({client_id}): {reason}")
                }
                ChatUpdate::MessageRemoved { client_id, .. } => println!("- deleted {client_id}"),
                ChatUpdate::Typing { user_id, is_typing: true } if user_id != me => {
                    println!("… {user_id} is typing")
                }
                ChatUpdate::Connection { state } => {
                    if let Some(text) = ConnectionBanner::for_state(state).text() {
                        println!("~ {text}");
                    }
                }
                _ => {}
            }
        }
    });

    println!("{HELP}");
    let mut active: Option<ConversationKey> = None;
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        let (cmd, rest) = line.split_once(' ').unwrap_or((line, ""));
        let result = run_command(&client, &mut active, cmd, rest.trim()).await;
        match result {
            Ok(true) => break,
            Ok(false) => {}
            Err(e) => println!("! {e}"),
        }
    }

    client.shutdown().await;
    Ok(())
}

/// Pass a send result through, pointing at `resend` when retrying can help.
fn sent(result: Result<MessageView, ChatError>) -> Result<MessageView, ChatError> {
    if let Err(e) = &result {
        if e.is_retryable() {
            println!("  (kept as failed; `resend <client-id>` tries again)");
        }
    }
    result
}

/// Returns `true` when the shell should exit.
async fn run_command(
    client: &ChatClient,
    active: &mut Option<ConversationKey>,
    cmd: &str,
    rest: &str,
) -> anyhow::Result<bool> {
    match cmd {
        "" => {}
        "quit" | "exit" => return Ok(true),
        "help" => println!("{HELP}"),
        "list" => {
            for c in client.conversations().await? {
                println!(
                    "{} {:<20} unread={} {}",
                    if c.is_online { "●" } else { "○" },
                    c.counterparty_name,
                    c.unread_count,
                    c.last_message_preview.unwrap_or_default(),
                );
            }
        }
        "who" => {
            let (first, search) = rest.split_once(' ').unwrap_or((rest, ""));
            let (filter, search) = match first.parse::<Role>() {
                Ok(role) => (RoleFilter::Only(role), search),
                Err(_) => (RoleFilter::All, rest),
            };
            for c in client.counterparties(filter, search).await? {
                println!("{:<12} {:<20} {:<10} {}", c.id, c.display_name, c.role, c.specialty);
            }
        }
        "open" => {
            if rest.is_empty() {
                bail!("usage: open <user-id>");
            }
            let key = client.select_conversation(&UserId::from(rest)).await?;
            for m in client.load_history(&key).await? {
                print_message(&m);
            }
            *active = Some(key);
        }
        "away" | "back" => client.set_away(cmd == "away").await?,
        "unread" => {
            let counts = client.unread_counts().await?;
            println!("{} unread", counts.total_unread);
            for (conversation, count) in counts.unread_by_conversation {
                println!("  {conversation:<24} {count}");
            }
        }
        "send" | "reply" | "history" | "older" => {
            let Some(key) = active.as_ref() else {
                bail!("open a conversation first");
            };
            match cmd {
                "send" => print_message(&sent(client.send(key, rest, None).await)?),
                "reply" => {
                    let (target, text) = rest
                        .split_once(' ')
                        .context("usage: reply <msg-id> <text>")?;
                    let view = sent(
                        client
                            .send(key, text, Some(ServerMessageId::new(target)))
                            .await,
                    )?;
                    print_message(&view);
                }
                "older" => {
                    for m in client.load_older(key).await? {
                        print_message(&m);
                    }
                }
                _ => {
                    for m in client.load_history(key).await? {
                        print_message(&m);
                    }
                }
            }
        }
        "resend" => {
            let id: ClientId = rest.parse().context("usage: resend <client-id>")?;
            print_message(&sent(client.resend(id).await)?);
        }
        "delete" => {
            let id: ClientId = rest.parse().context("usage: delete <client-id>")?;
            client.delete_message(id).await?;
        }
        other => println!("unknown command {other:?}, try help"),
    }
    Ok(false)
}
