use chrono::Utc;
use clap::{Parser, ValueEnum};
use docchat_core::{
    load_paths, CharacterNgramEmbedder, ChatError, ChatOptions, DocChat, Embedder,
    GenerationProvider, IndexBackend, IndexScope, OpenAiEmbedder, OpenAiGenerator, SessionSummary,
    SkippedFile, TurnEvent, TurnOutcome, DEFAULT_CHAT_MODEL, DEFAULT_EMBEDDING_DIMENSIONS,
    DEFAULT_OPENAI_EMBEDDING_MODEL,
};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Clone, Copy, Debug, ValueEnum)]
enum EmbedderKind {
    /// Local hashed character tri-grams; no network needed.
    Ngram,
    /// An OpenAI-compatible embeddings endpoint.
    Openai,
}

#[derive(Parser)]
#[command(name = "docchat", version, about = "Chat with your DOCX documents in the terminal")]
struct Cli {
    /// API key for the OpenAI-compatible endpoint
    #[arg(long, env = "OPENAI_API_KEY", hide_env_values = true)]
    openai_api_key: String,

    /// Base URL of the OpenAI-compatible endpoint
    #[arg(long, env = "OPENAI_BASE_URL", default_value = "https://api.openai.com/v1")]
    openai_base_url: String,

    /// Chat completion model
    #[arg(long, env = "DOCCHAT_CHAT_MODEL", default_value = DEFAULT_CHAT_MODEL)]
    chat_model: String,

    /// Embedding provider
    #[arg(long, value_enum, default_value_t = EmbedderKind::Openai)]
    embedder: EmbedderKind,

    /// Embedding model used with `--embedder openai`
    #[arg(long, env = "DOCCHAT_EMBEDDING_MODEL", default_value = DEFAULT_OPENAI_EMBEDDING_MODEL)]
    embedding_model: String,

    /// Vector size returned by the embedding model
    #[arg(long, default_value = "1536")]
    embedding_dimensions: usize,

    /// Qdrant base URL; indexes are kept in memory when unset
    #[arg(long, env = "QDRANT_URL")]
    qdrant_url: Option<String>,

    /// Prefix for the Qdrant collections created per upload
    #[arg(long, default_value = "docchat")]
    qdrant_collection_prefix: String,

    /// Maximum characters per chunk
    #[arg(long, default_value = "800")]
    chunk_size: usize,

    /// Characters shared by consecutive chunks
    #[arg(long, default_value = "150")]
    chunk_overlap: usize,

    /// Passages retrieved per question
    #[arg(long, default_value = "4")]
    top_k: usize,

    /// Minimum classifier confidence for intent-based routing
    #[arg(long, default_value = "0.6")]
    confidence_threshold: f32,

    /// Compact the conversation once it holds more turns than this
    #[arg(long, default_value = "20")]
    compaction_threshold: usize,

    /// Turns kept verbatim after compaction
    #[arg(long, default_value = "10")]
    compaction_keep_recent: usize,

    /// Seconds to wait for any single provider call
    #[arg(long, default_value = "60")]
    timeout_secs: u64,

    /// Share uploaded documents across all sessions
    #[arg(long, default_value_t = false)]
    shared_index: bool,

    /// Print answers as they are generated
    #[arg(long, default_value_t = false)]
    stream: bool,

    /// Answer small talk with the fixed greeting instead of the model
    #[arg(long, default_value_t = false)]
    canned_small_talk: bool,

    /// Documents to upload before the first prompt
    files: Vec<PathBuf>,
}

impl Cli {
    fn options(&self) -> ChatOptions {
        ChatOptions {
            chunk_max_chars: self.chunk_size,
            chunk_overlap_chars: self.chunk_overlap,
            top_k: self.top_k,
            intent_confidence_threshold: self.confidence_threshold,
            compaction_threshold: self.compaction_threshold,
            compaction_keep_recent: self.compaction_keep_recent,
            provider_timeout: Duration::from_secs(self.timeout_secs),
            conversational_small_talk: !self.canned_small_talk,
            index_scope: if self.shared_index {
                IndexScope::Shared
            } else {
                IndexScope::PerSession
            },
            ..ChatOptions::default()
        }
    }

    fn build_chat(&self) -> anyhow::Result<DocChat> {
        let timeout = Duration::from_secs(self.timeout_secs);
        let generator: Arc<dyn GenerationProvider> = Arc::new(OpenAiGenerator::new(
            &self.openai_base_url,
            self.openai_api_key.clone(),
            self.chat_model.clone(),
            timeout,
        )?);
        let embedder: Arc<dyn Embedder> = match self.embedder {
            EmbedderKind::Ngram => Arc::new(CharacterNgramEmbedder {
                dimensions: DEFAULT_EMBEDDING_DIMENSIONS,
            }),
            EmbedderKind::Openai => Arc::new(OpenAiEmbedder::new(
                &self.openai_base_url,
                self.openai_api_key.clone(),
                self.embedding_model.clone(),
                self.embedding_dimensions,
                timeout,
            )?),
        };

        let backend = match &self.qdrant_url {
            Some(url) => IndexBackend::Qdrant {
                url: url.clone(),
                collection_prefix: self.qdrant_collection_prefix.clone(),
            },
            None => IndexBackend::Memory,
        };

        Ok(DocChat::new(embedder, generator, self.options()).with_backend(backend))
    }
}

#[derive(Debug, PartialEq, Eq)]
enum Command {
    Upload(Vec<PathBuf>),
    New,
    Switch(String),
    Sessions,
    History,
    Help,
    Quit,
    Ask(String),
    Empty,
    Unknown(String),
}

fn parse_command(line: &str) -> Command {
    let line = line.trim();
    if line.is_empty() {
        return Command::Empty;
    }
    let Some(rest) = line.strip_prefix('/') else {
        return Command::Ask(line.to_string());
    };

    let mut words = rest.split_whitespace();
    match words.next().unwrap_or_default() {
        "upload" => Command::Upload(words.map(PathBuf::from).collect()),
        "new" => Command::New,
        "switch" => Command::Switch(words.next().unwrap_or_default().to_string()),
        "sessions" => Command::Sessions,
        "history" => Command::History,
        "help" => Command::Help,
        "quit" | "exit" => Command::Quit,
        other => Command::Unknown(other.to_string()),
    }
}

/// Resolves `/switch` arguments: a 1-based position in the session list,
/// or a full or leading part of a session id.
fn resolve_session<'a>(sessions: &'a [SessionSummary], target: &str) -> Option<&'a SessionSummary> {
    if let Ok(position) = target.parse::<usize>() {
        return position.checked_sub(1).and_then(|index| sessions.get(index));
    }
    if target.is_empty() {
        return None;
    }
    let mut matches = sessions
        .iter()
        .filter(|session| session.id.to_string().starts_with(target));
    match (matches.next(), matches.next()) {
        (Some(session), None) => Some(session),
        _ => None,
    }
}

const HELP: &str = "\
commands:
  /upload <files...>  index documents for the active session
  /new                start a new session
  /switch <n|id>      switch to another session
  /sessions           list sessions
  /history            show this session's transcript
  /quit               leave";

fn thinking() {
    eprint!("thinking...");
    let _ = std::io::stderr().flush();
}

fn done_thinking() {
    eprint!("\r           \r");
    let _ = std::io::stderr().flush();
}

fn print_skipped(skipped: &[SkippedFile]) {
    for file in skipped {
        println!("  skipped {}: {}", file.name, file.reason);
    }
}

async fn upload(chat: &DocChat, paths: &[PathBuf]) -> anyhow::Result<()> {
    if paths.is_empty() {
        println!("usage: /upload <files...>");
        return Ok(());
    }

    let (files, unreadable) = load_paths(paths);
    thinking();
    let result = chat.upload(&files).await;
    done_thinking();

    match result {
        Ok(summary) => {
            println!(
                "indexed {} chunk(s) from {} ({:?} scope)",
                summary.chunk_count,
                summary.sources.join(", "),
                summary.scope
            );
            print_skipped(&unreadable);
            print_skipped(&summary.skipped_files);
        }
        Err(ChatError::NoChunks { skipped }) => {
            println!("nothing was indexed; the previous documents stay in use");
            print_skipped(&unreadable);
            print_skipped(&skipped);
        }
        Err(error) => {
            warn!(%error, "upload failed");
            println!("upload failed: {error}");
        }
    }
    Ok(())
}

async fn ask(chat: &DocChat, utterance: &str) -> anyhow::Result<()> {
    thinking();
    let outcome = chat.ask(utterance).await;
    done_thinking();
    let outcome = outcome?;
    println!("assistant> {}", outcome.reply);
    Ok(())
}

enum Step {
    Event(Option<TurnEvent>),
    Interrupted,
}

async fn ask_streaming(chat: &DocChat, utterance: &str) -> anyhow::Result<()> {
    thinking();
    let mut turn = chat.ask_streaming(utterance).await?;
    let mut streamed = String::new();

    loop {
        let step = tokio::select! {
            event = turn.next() => Step::Event(event),
            _ = tokio::signal::ctrl_c() => Step::Interrupted,
        };

        match step {
            Step::Interrupted => turn.cancel(),
            Step::Event(Some(TurnEvent::Fragment(fragment))) => {
                if streamed.is_empty() {
                    done_thinking();
                    print!("assistant> ");
                }
                streamed.push_str(&fragment);
                print!("{fragment}");
                std::io::stdout().flush()?;
            }
            Step::Event(Some(TurnEvent::Completed(outcome) | TurnEvent::Failed(outcome))) => {
                finish_streamed(&streamed, &outcome);
                return Ok(());
            }
            Step::Event(Some(TurnEvent::Cancelled)) => {
                done_thinking();
                println!("\n(cancelled)");
                return Ok(());
            }
            Step::Event(None) => return Ok(()),
        }
    }
}

/// Prints whatever part of the final reply was not streamed, such as the
/// source list or a failure notice.
fn finish_streamed(streamed: &str, outcome: &TurnOutcome) {
    match outcome.reply.strip_prefix(streamed) {
        Some(rest) if !streamed.is_empty() => println!("{rest}"),
        _ => {
            done_thinking();
            if !streamed.is_empty() {
                println!();
            }
            println!("assistant> {}", outcome.reply);
        }
    }
}

async fn print_sessions(chat: &DocChat) -> anyhow::Result<()> {
    for (position, session) in chat.sessions().iter().enumerate() {
        let marker = if session.active { "*" } else { " " };
        let documents = if chat.has_documents(session.id).await? {
            "documents ready"
        } else {
            "no documents"
        };
        println!(
            "{marker} {}. {} [{}] created {} ({documents})",
            position + 1,
            session.label,
            session.id,
            session.created_at.format("%Y-%m-%d %H:%M:%S")
        );
    }
    Ok(())
}

async fn print_history(chat: &DocChat) -> anyhow::Result<()> {
    let history = chat.history(chat.registry().active_id()).await?;
    if history.is_empty() {
        println!("(no turns yet)");
    }
    for turn in history {
        let at = turn
            .timestamp
            .map(|timestamp| timestamp.format("%H:%M:%S").to_string())
            .unwrap_or_default();
        println!("[{at}] {}: {}", turn.role, turn.text);
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with(fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    let chat = cli.build_chat()?;
    info!(
        version = env!("CARGO_PKG_VERSION"),
        started_at = %Utc::now().to_rfc3339(),
        chat_model = %cli.chat_model,
        embedder = ?cli.embedder,
        "docchat boot"
    );

    if !cli.files.is_empty() {
        upload(&chat, &cli.files).await?;
    }
    println!("{HELP}");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        print!("you> ");
        std::io::stdout().flush()?;
        let Some(line) = lines.next_line().await? else {
            break;
        };

        match parse_command(&line) {
            Command::Empty => {}
            Command::Quit => break,
            Command::Help => println!("{HELP}"),
            Command::Unknown(name) => println!("unknown command /{name}; try /help"),
            Command::Upload(paths) => upload(&chat, &paths).await?,
            Command::New => {
                chat.new_session();
                println!("started a new session");
                print_sessions(&chat).await?;
            }
            Command::Switch(target) => {
                let sessions = chat.sessions();
                match resolve_session(&sessions, &target) {
                    Some(session) => {
                        chat.switch_session(session.id)?;
                        println!("switched to {}", session.label);
                    }
                    None => println!("no session matches '{target}'; see /sessions"),
                }
            }
            Command::Sessions => print_sessions(&chat).await?,
            Command::History => print_history(&chat).await?,
            Command::Ask(utterance) if cli.stream => ask_streaming(&chat, &utterance).await?,
            Command::Ask(utterance) => ask(&chat, &utterance).await?,
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use docchat_core::SessionRegistry;

    #[test]
    fn commands_are_parsed() {
        assert_eq!(
            parse_command("/upload a.docx  b.docx"),
            Command::Upload(vec![PathBuf::from("a.docx"), PathBuf::from("b.docx")])
        );
        assert_eq!(parse_command("/switch 2"), Command::Switch("2".to_string()));
        assert_eq!(parse_command("  /quit "), Command::Quit);
        assert_eq!(parse_command(""), Command::Empty);
        assert_eq!(parse_command("/nope"), Command::Unknown("nope".to_string()));
        assert_eq!(
            parse_command("what is covered?"),
            Command::Ask("what is covered?".to_string())
        );
    }

    #[test]
    fn sessions_resolve_by_position_or_id_prefix() {
        let registry = SessionRegistry::new();
        registry.create_session();
        let sessions = registry.list_sessions();

        assert_eq!(resolve_session(&sessions, "2").map(|s| s.id), Some(sessions[1].id));
        assert!(resolve_session(&sessions, "0").is_none());
        assert!(resolve_session(&sessions, "3").is_none());

        let id = sessions[0].id.to_string();
        assert_eq!(resolve_session(&sessions, &id).map(|s| s.id), Some(sessions[0].id));
        assert!(resolve_session(&sessions, "").is_none());
        assert!(sessions[0].created_at <= Utc::now());
    }

    #[test]
    fn options_follow_flags() {
        let cli = Cli::parse_from([
            "docchat",
            "--openai-api-key",
            "test",
            "--shared-index",
            "--top-k",
            "6",
            "--canned-small-talk",
        ]);
        let options = cli.options();
        assert_eq!(options.index_scope, IndexScope::Shared);
        assert_eq!(options.top_k, 6);
        assert!(!options.conversational_small_talk);
        assert_eq!(options.chunk_max_chars, 800);
    }
}
