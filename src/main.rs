use std::io::Write;
use std::process::ExitCode;
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::task::JoinHandle;

use turnover_chat::app::{Identity, StaticIdentity};
use turnover_chat::config::{api_host, Config, ConfigNeedsInput, FileConfig, TokenBackend};
use turnover_chat::core::http::HttpMessageApi;
use turnover_chat::core::keyring;
use turnover_chat::core::models::Message;
use turnover_chat::core::store::CacheHandle;
use turnover_chat::{ChatEngine, Conversation, SendReport};

const HELP: &str = "\
/threads          list threads (cached, then fresh)
/open <thread>    open a thread
/older            load older messages
/online /offline  toggle connectivity
/sync             drain the outbox now
/quit             exit
anything else     send to the open thread";

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::init();

    let config = match Config::resolve() {
        Ok(config) => config,
        Err(ConfigNeedsInput::FullSetup) => {
            eprintln!(
                "No configuration. Set TURNOVER_API_URL, TURNOVER_VIEWER and TURNOVER_TOKEN, \
                 or write a config file."
            );
            return ExitCode::FAILURE;
        }
        Err(ConfigNeedsInput::TokenOnly { api_url, viewer_id, error }) => {
            if let Some(error) = error {
                eprintln!("{error}");
            }
            match prompt_token(&api_url, &viewer_id).await {
                Ok(config) => config,
                Err(e) => {
                    eprintln!("{e}");
                    return ExitCode::FAILURE;
                }
            }
        }
    };

    let cache = match CacheHandle::open() {
        Ok(cache) => Some(cache),
        Err(e) => {
            log::warn!("Failed to open cache, running without it: {}", e);
            None
        }
    };
    let api = match HttpMessageApi::new(&config.api_url, config.token.clone(), config.sync.page_size) {
        Ok(api) => Arc::new(api),
        Err(e) => {
            eprintln!("{e}");
            return ExitCode::FAILURE;
        }
    };
    let identity = Arc::new(StaticIdentity(Identity {
        viewer_id: config.viewer_id.clone(),
        tenant_id: config.tenant_id.clone(),
    }));

    let engine = ChatEngine::new(cache, api, identity, config.sync.clone(), true);
    match engine.start_session().await {
        Ok(start) => {
            // The previous viewer's token has no business outliving their cache.
            if let Some(previous) = start.replaced_viewer {
                if let Err(e) = keyring::delete_token(&previous, &api_host(&config.api_url)) {
                    log::warn!("Could not forget token for {}: {}", previous, e);
                }
            }
        }
        Err(e) => {
            eprintln!("Could not start session: {e}");
            return ExitCode::FAILURE;
        }
    }
    engine.start_sync();

    println!("{HELP}");
    run_repl(&engine).await;
    engine.shutdown();
    ExitCode::SUCCESS
}

/// The keyring had no token: ask for one and store it.
async fn prompt_token(api_url: &str, viewer_id: &str) -> Result<Config, String> {
    print!("API token for {viewer_id}: ");
    let _ = std::io::stdout().flush();
    let mut line = String::new();
    BufReader::new(tokio::io::stdin())
        .read_line(&mut line)
        .await
        .map_err(|e| format!("read token: {e}"))?;
    let token = line.trim().to_string();
    if token.is_empty() {
        return Err("no token given".into());
    }

    if let Err(e) = keyring::set_token(viewer_id, &api_host(api_url), &token) {
        log::warn!("Could not store token in keyring: {}", e);
    }
    let fc = FileConfig::load()?.unwrap_or_else(|| FileConfig {
        api_url: api_url.to_string(),
        viewer_id: viewer_id.to_string(),
        tenant_id: None,
        token: TokenBackend::Keyring,
        sync: Default::default(),
    });
    Ok(Config::from_file_config(&fc, token))
}

async fn run_repl(engine: &ChatEngine) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut open: Option<(Arc<Conversation>, JoinHandle<()>)> = None;

    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                log::warn!("stdin: {}", e);
                break;
            }
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let (command, arg) = line.split_once(' ').unwrap_or((line, ""));
        match command {
            "/quit" => break,
            "/help" => println!("{HELP}"),
            "/threads" => {
                for thread in engine.cached_threads().await {
                    println!("  {} [{}] (cached)", thread.id, thread.status);
                }
                match engine.refresh_threads().await {
                    Ok(threads) => {
                        for thread in threads {
                            println!("  {} [{}]", thread.id, thread.status);
                        }
                    }
                    Err(e) => println!("thread list unavailable: {e}"),
                }
            }
            "/open" if !arg.is_empty() => {
                if let Some((_, printer)) = open.take() {
                    printer.abort();
                }
                let conversation = engine.open_conversation(arg.trim()).await;
                let printer = spawn_printer(conversation.clone());
                open = Some((conversation, printer));
            }
            "/older" => match &open {
                Some((conversation, _)) => match conversation.load_older().await {
                    Ok(n) => println!("{n} older messages"),
                    Err(e) => println!("could not load older messages: {e}"),
                },
                None => println!("no thread open"),
            },
            "/online" => engine.set_online(true),
            "/offline" => engine.set_online(false),
            "/sync" => match engine.sync_now().await {
                Some(report) => println!(
                    "{} attempted, {} delivered, {} retrying, {} failed",
                    report.attempted, report.delivered, report.retrying, report.failed
                ),
                None => println!("a drain is already running"),
            },
            _ if command.starts_with('/') => println!("{HELP}"),
            _ => match &open {
                Some((conversation, _)) => match conversation.send(line).await {
                    Ok(SendReport::Delivered(_)) => {}
                    Ok(SendReport::Queued(_)) => println!("(queued)"),
                    Ok(SendReport::Rejected { error, .. }) => println!("not sent: {error}"),
                    Err(e) => println!("{e}"),
                },
                None => println!("open a thread first"),
            },
        }
    }

    if let Some((_, printer)) = open {
        printer.abort();
    }
}

/// Reprint the open thread whenever its list changes.
fn spawn_printer(conversation: Arc<Conversation>) -> JoinHandle<()> {
    let mut rx = conversation.subscribe();
    tokio::spawn(async move {
        while rx.changed().await.is_ok() {
            let messages = rx.borrow_and_update().clone();
            println!("--- {} ---", conversation.thread_id());
            for message in &messages {
                println!("{}", render(message));
            }
        }
    })
}

fn render(message: &Message) -> String {
    let mark = if message.shows_error() {
        "!"
    } else if message.shows_spinner() {
        "…"
    } else {
        " "
    };
    format!(
        "[{mark}] {}: {}",
        message.sender_id,
        message.body.as_deref().unwrap_or("<attachment>")
    )
}
