use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};

use client_core::{
    channel::ConnectionState, conversations::MessageMeta, session::Session, EngineConfig,
    RenderSink, SyncEngine,
};
use shared::{
    domain::{DialogId, MessageId},
    protocol::DialogSummary,
};
use storage::SessionDb;

mod config;

#[derive(Parser, Debug)]
#[command(about = "Terminal shell for the dialog sync engine")]
struct Args {
    /// REST base url; overrides client.toml and environment.
    #[arg(long)]
    server_url: Option<String>,
    /// Sign in with this email when no persisted session exists.
    #[arg(long)]
    email: Option<String>,
    #[arg(long)]
    password: Option<String>,
    #[arg(long, default_value = "cli")]
    device_name: String,
}

struct TerminalSink;

impl RenderSink for TerminalSink {
    fn on_session_changed(&self, session: Option<&Session>) {
        match session {
            Some(session) => {
                if let Some(user_id) = session.user_id {
                    println!("* signed in as {user_id}");
                }
            }
            None => println!("* signed out"),
        }
    }

    fn on_conversation_list_changed(&self, dialogs: &[DialogSummary]) {
        println!("* {} dialog(s); /list to display", dialogs.len());
    }

    fn on_timeline_changed(&self, _dialog_id: DialogId) {
        println!("* timeline updated; /show to display");
    }

    fn on_connection_state_changed(&self, state: ConnectionState) {
        println!("* connection: {state:?}");
    }
}

fn print_dialogs(dialogs: &[DialogSummary]) {
    for (index, dialog) in dialogs.iter().enumerate() {
        let preview = dialog
            .last_message
            .as_ref()
            .map(|m| m.text.as_str())
            .unwrap_or("(no messages)");
        println!(
            "[{index}] {}: {preview} ({} unread)",
            dialog.title, dialog.unread_count
        );
    }
}

fn ticks(meta: &MessageMeta) -> &'static str {
    if meta.failed {
        "[failed]"
    } else if meta.pending {
        "[...]"
    } else if meta.read_by_peer {
        "[vv]"
    } else if meta.delivered_by_peer {
        "[v]"
    } else {
        "[.]"
    }
}

async fn print_timeline(engine: &Arc<SyncEngine>, dialog_id: DialogId) {
    let me = engine.session_snapshot().await.user_id;
    for (entry, meta) in engine.timeline(dialog_id).await {
        let time = entry.created_at.format("%H:%M:%S");
        if Some(entry.sender_id) == me {
            println!("{time}  me: {} {}", entry.text, ticks(&meta));
        } else {
            println!("{time}  {}: {}", entry.sender_id, entry.text);
        }
    }
}

/// Re-issue every failed send in the dialog; each retry reuses the original
/// provisional id.
async fn retry_failed(engine: &Arc<SyncEngine>, dialog_id: DialogId) {
    let failed: Vec<_> = engine
        .timeline(dialog_id)
        .await
        .into_iter()
        .filter(|(_, meta)| meta.failed)
        .filter_map(|(entry, _)| match entry.id {
            MessageId::Provisional(token) => Some(token),
            MessageId::Confirmed(_) => None,
        })
        .collect();

    if failed.is_empty() {
        println!("nothing to retry");
        return;
    }

    for token in failed {
        match engine.retry(dialog_id, token).await {
            Ok(_) => println!("retried ok"),
            Err(err) => println!("retry failed: {err}"),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();
    let args = Args::parse();

    let mut settings = config::load_settings();
    if let Some(server_url) = args.server_url.clone() {
        settings.server_url = server_url;
    }

    let db = SessionDb::open(&config::database_url(&settings.database_path))
        .await
        .context("failed to open session store")?;
    let engine = SyncEngine::new(
        EngineConfig::new(settings.server_url.clone()),
        Arc::new(db),
        Arc::new(TerminalSink),
    )?;

    if !engine.bootstrap().await {
        let (Some(email), Some(password)) = (args.email.as_deref(), args.password.as_deref())
        else {
            bail!("no persisted session; pass --email and --password to sign in");
        };
        engine
            .login(email, password, &args.device_name, "cli")
            .await
            .context("login failed")?;
    }

    let dialogs = engine.dialogs().await;
    print_dialogs(&dialogs);
    let mut open = dialogs.first().map(|dialog| dialog.id);
    if let Some(dialog_id) = open {
        engine.open_conversation(dialog_id).await?;
        print_timeline(&engine, dialog_id).await;
    }

    println!("commands: /list, /open <n>, /show, /retry, /quit; anything else sends");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim().to_owned();
        if line.is_empty() {
            continue;
        }

        if line == "/quit" {
            engine.logout().await;
            break;
        } else if line == "/list" {
            if let Err(err) = engine.load_dialogs().await {
                println!("dialog list load failed: {err}");
            }
            print_dialogs(&engine.dialogs().await);
        } else if let Some(raw) = line.strip_prefix("/open ") {
            let dialogs = engine.dialogs().await;
            let Some(dialog) = raw.trim().parse::<usize>().ok().and_then(|n| dialogs.get(n))
            else {
                println!("no such dialog");
                continue;
            };
            match engine.open_conversation(dialog.id).await {
                Ok(()) => {
                    open = Some(dialog.id);
                    print_timeline(&engine, dialog.id).await;
                }
                Err(err) => println!("history load failed: {err}"),
            }
        } else if line == "/show" {
            match open {
                Some(dialog_id) => print_timeline(&engine, dialog_id).await,
                None => println!("no open dialog"),
            }
        } else if line == "/retry" {
            match open {
                Some(dialog_id) => retry_failed(&engine, dialog_id).await,
                None => println!("no open dialog"),
            }
        } else {
            let Some(dialog_id) = open else {
                println!("no open dialog; /open <n> first");
                continue;
            };
            if let Err(err) = engine.send(dialog_id, &line).await {
                println!("send failed ({err}); /retry to try again");
            }
        }
    }

    Ok(())
}
