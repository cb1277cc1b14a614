use clap::{Args, Parser, Subcommand};
use coach_session::api::{ApiClient, ApiError};
use coach_session::config::{DEFAULT_API_BASE_URL, DEFAULT_WS_BASE_URL};
use coach_session::{ApiConfig, ConnectionStatus, SessionTransport, TransportConfig, TransportError};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;
use wire::{InboundMessage, SessionId, UserIdentity};

#[derive(Debug, thiserror::Error)]
enum CliError {
    #[error("missing identity; pass --user-id and --name, or --token / COACH_TOKEN")]
    MissingIdentity,
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Api(#[from] ApiError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Parser, Debug)]
#[command(name = "coach-cli", about = "Mock interview chat with the AI coach")]
struct Cli {
    #[arg(long, env = "COACH_WS_URL", default_value = DEFAULT_WS_BASE_URL)]
    ws_url: String,

    #[arg(long, env = "COACH_API_URL", default_value = DEFAULT_API_BASE_URL)]
    api_url: String,

    #[arg(long, env = "COACH_TOKEN")]
    token: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start or resume an interview and chat on stdin/stdout.
    Chat(ChatArgs),
    /// List recent interviews for the logged-in user.
    Interviews {
        #[arg(long, default_value_t = 10)]
        limit: u32,
    },
    /// Print the identity the token resolves to.
    Whoami,
}

#[derive(Args, Debug)]
struct ChatArgs {
    #[arg(long, requires = "name")]
    user_id: Option<String>,

    #[arg(long, requires = "user_id")]
    name: Option<String>,

    /// Interview to resume; falls back to a new one if the backend refuses.
    #[arg(long)]
    resume: Option<String>,
}

enum UiEvent {
    Message(InboundMessage),
    Connection(ConnectionStatus),
}

#[tokio::main]
async fn main() -> Result<(), CliError> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let api = api_client(&cli);

    match cli.command {
        Command::Chat(args) => {
            let config = TransportConfig::from_env().with_base_url(cli.ws_url);
            run_chat(config, &api, args).await
        }
        Command::Interviews { limit } => {
            for interview in api.list_interviews(Some(limit)).await? {
                println!("{}\t{}\t{}", interview.id, interview.status, interview.created_at);
            }
            Ok(())
        }
        Command::Whoami => {
            let user = api.current_user().await?;
            println!("{}\t{}\t{}", user.id, user.name, user.email);
            Ok(())
        }
    }
}

fn api_client(cli: &Cli) -> ApiClient {
    let config = ApiConfig { base_url: cli.api_url.clone(), ..ApiConfig::from_env() };
    let client = ApiClient::new(config);
    match &cli.token {
        Some(token) if !token.is_empty() => client.with_token(token.clone()),
        _ => client,
    }
}

async fn resolve_identity(api: &ApiClient, args: &ChatArgs) -> Result<UserIdentity, CliError> {
    if let (Some(id), Some(name)) = (&args.user_id, &args.name) {
        return Ok(UserIdentity::new(id.clone(), name.clone()));
    }
    if !api.has_token() {
        return Err(CliError::MissingIdentity);
    }
    Ok(api.current_user().await?.identity())
}

async fn run_chat(config: TransportConfig, api: &ApiClient, args: ChatArgs) -> Result<(), CliError> {
    let identity = resolve_identity(api, &args).await?;
    let transport = SessionTransport::websocket(config);

    let (tx, mut events) = mpsc::unbounded_channel();
    let message_tx = tx.clone();
    transport.on_message(move |msg| {
        let _ = message_tx.send(UiEvent::Message(msg.clone()));
    });
    transport.on_connection(move |status| {
        let _ = tx.send(UiEvent::Connection(status.clone()));
    });

    let session = start_session(&transport, &identity, args.resume.map(SessionId::from)).await?;
    println!("[session {session}] type your answers, /quit to leave");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                let text = line.trim();
                if text.is_empty() {
                    continue;
                }
                if text == "/quit" {
                    break;
                }
                match transport.send_user_message(text) {
                    Ok(()) => {}
                    Err(TransportError::NotConnected) => println!("[offline] message not sent, try again once online"),
                    Err(e) => return Err(e.into()),
                }
            }
            Some(event) = events.recv() => match event {
                UiEvent::Message(msg) => {
                    if let Some(rendered) = render_message(&msg) {
                        println!("{rendered}");
                    }
                    if msg.status().is_some_and(wire::InterviewStatus::is_terminal) && msg.kind() == "final" {
                        println!("[interview complete]");
                        break;
                    }
                }
                UiEvent::Connection(ConnectionStatus::SessionRejected(reason)) => {
                    tracing::warn!(%reason, "automatic resume refused; starting a new interview");
                    println!("[session lost: {reason}] starting a new interview");
                    let session = transport.connect_fresh(identity.clone()).await?;
                    println!("[session {session}]");
                }
                UiEvent::Connection(status) => println!("{}", render_status(&status)),
            },
        }
    }

    transport.disconnect();
    Ok(())
}

/// Resume `resume` if given, falling back to a fresh session when the
/// backend refuses it.
async fn start_session(
    transport: &SessionTransport,
    identity: &UserIdentity,
    resume: Option<SessionId>,
) -> Result<SessionId, CliError> {
    if let Some(session_id) = resume {
        transport.connect_raw().await?;
        match transport.resume_session(session_id.clone()).await {
            Ok(()) => return Ok(session_id),
            Err(TransportError::Handshake(reason)) => {
                tracing::warn!(%session_id, %reason, "resume refused; falling back to a new interview");
                println!("[could not resume {session_id}: {reason}] starting a new interview");
                transport.clear_current_session_id();
            }
            Err(e) => return Err(e.into()),
        }
    }
    let session_id = transport.connect_fresh(identity.clone()).await?;
    tracing::info!(%session_id, user = %identity.id, "interview started");
    Ok(session_id)
}

fn render_message(msg: &InboundMessage) -> Option<String> {
    match msg {
        InboundMessage::Final { answer, .. } => Some(format!("coach> {answer}")),
        InboundMessage::Error { error } => Some(format!("[error] {error}")),
        InboundMessage::Ready { status: Some(status), .. } => Some(format!("[phase] {status}")),
        InboundMessage::Ready { status: None, .. } => None,
    }
}

fn render_status(status: &ConnectionStatus) -> String {
    match status {
        ConnectionStatus::Connected => "[online]".to_owned(),
        ConnectionStatus::Disconnected => "[offline] reconnecting".to_owned(),
        ConnectionStatus::Error => "[connection error]".to_owned(),
        ConnectionStatus::SessionRejected(reason) => format!("[session lost: {reason}]"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wire::InterviewStatus;

    #[test]
    fn render_message_shows_answers_and_phases() {
        let final_msg = InboundMessage::Final { answer: "Hi Ann".to_owned(), status: None };
        assert_eq!(render_message(&final_msg).as_deref(), Some("coach> Hi Ann"));

        let ready = InboundMessage::Ready { interview_id: None, status: Some(InterviewStatus::Scoring) };
        assert_eq!(render_message(&ready).as_deref(), Some("[phase] scoring"));

        let bare = InboundMessage::Ready { interview_id: None, status: None };
        assert_eq!(render_message(&bare), None);
    }

    #[test]
    fn render_status_marks_online_offline() {
        assert_eq!(render_status(&ConnectionStatus::Connected), "[online]");
        assert!(render_status(&ConnectionStatus::Disconnected).starts_with("[offline]"));
    }

    #[test]
    fn chat_args_require_id_and_name_together() {
        let parsed = Cli::try_parse_from(["coach-cli", "chat", "--user-id", "u1"]);
        assert!(parsed.is_err());

        let parsed = Cli::try_parse_from(["coach-cli", "chat", "--user-id", "u1", "--name", "Ann", "--resume", "abc"])
            .expect("args should parse");
        let Command::Chat(args) = parsed.command else {
            panic!("expected chat");
        };
        assert_eq!(args.resume.as_deref(), Some("abc"));
    }
}
