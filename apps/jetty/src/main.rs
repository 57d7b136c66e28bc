use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::time::{sleep, timeout};
use tracing::info;
use tracing_subscriber::EnvFilter;

use jetty::chat::{ChatChannel, ChatError, LocalChatLink};
use jetty::negotiation::{Session, router::SessionDriver};
use jetty::signaling::LocalSignalingLink;
use jetty::transport::mock::MockTransport;
use jetty::transport::webrtc::WebRtcTransport;
use jetty::transport::{ConnectionState, Transport};

#[tokio::main]
async fn main() {
    if let Err(err) = run().await {
        eprintln!("❌ {err:#}");
        std::process::exit(1);
    }
}

async fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let filter = EnvFilter::try_new(&cli.log_filter)
        .with_context(|| format!("invalid log filter: {}", cli.log_filter))?;
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cli.command {
        Some(Command::Chat(args)) => run_chat(args).await,
        Some(Command::Glare(args)) => run_glare(args).await,
        None => run_chat(ChatArgs::default()).await,
    }
}

#[derive(Parser, Debug)]
#[command(
    name = "jetty",
    about = "Coordinate peer-to-peer sessions over a brokered signaling path",
    version
)]
struct Cli {
    #[arg(
        long,
        global = true,
        env = "JETTY_LOG",
        default_value = "info",
        help = "Log filter, e.g. info or jetty=debug"
    )]
    log_filter: String,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Chat between two in-process peers over a real connection engine
    Chat(ChatArgs),
    /// Demonstrate simultaneous-offer resolution on the in-memory engine
    Glare(GlareArgs),
}

#[derive(Args, Debug)]
struct ChatArgs {
    /// Simulated one-way signaling latency in milliseconds
    #[arg(long, default_value_t = 500)]
    signaling_delay_ms: u64,

    /// Messages to send once connected; with none given, lines are read from
    /// stdin until EOF
    #[arg(long = "message")]
    messages: Vec<String>,
}

impl Default for ChatArgs {
    fn default() -> Self {
        Self {
            signaling_delay_ms: 500,
            messages: Vec::new(),
        }
    }
}

#[derive(Args, Debug)]
struct GlareArgs {
    /// Simulated one-way signaling latency in milliseconds
    #[arg(long, default_value_t = 50)]
    signaling_delay_ms: u64,

    /// Simulated engine latency for description applies in milliseconds
    #[arg(long, default_value_t = 200)]
    apply_delay_ms: u64,
}

async fn run_chat(args: ChatArgs) -> anyhow::Result<()> {
    println!("starting connection...");
    let (offerer, answerer) = WebRtcTransport::vnet_pair()
        .await
        .context("building the peer pair")?;
    let (link_a, link_b) = LocalSignalingLink::pair(Duration::from_millis(args.signaling_delay_ms));

    let session_a = Session::new("a", offerer.clone() as Arc<dyn Transport>, link_a);
    let session_b = Session::new("b", answerer.clone() as Arc<dyn Transport>, link_b);
    let _driver_a = SessionDriver::spawn(Arc::clone(&session_a)).context("driving peer a")?;
    let _driver_b = SessionDriver::spawn(Arc::clone(&session_b)).context("driving peer b")?;

    session_a.negotiate().await.context("initial offer")?;
    println!("offer sent, waiting for answer...");

    wait_connected(&session_a, "a").await?;
    wait_connected(&session_b, "b").await?;
    println!("connected, ready to chat");

    // Surface everything peer b hears.
    let receiver = Arc::clone(&answerer);
    let printer = tokio::spawn(async move {
        while let Some(text) = receiver.recv_text().await {
            println!("peer: {text}");
        }
    });

    if args.messages.is_empty() {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        while let Some(line) = lines.next_line().await.context("reading stdin")? {
            if line.trim().is_empty() {
                continue;
            }
            send_when_open(offerer.as_ref(), &line).await?;
            println!("you: {line}");
        }
    } else {
        for message in &args.messages {
            send_when_open(offerer.as_ref(), message).await?;
            println!("you: {message}");
        }
        // Prove the other direction works too.
        send_when_open(answerer.as_ref(), "ack from the answering side").await?;
        if let Some(text) = timeout(Duration::from_secs(10), offerer.recv_text())
            .await
            .context("waiting for the answering side")?
        {
            println!("peer (to a): {text}");
        }
        // Let the last messages drain before tearing down.
        sleep(Duration::from_millis(200)).await;
    }

    printer.abort();
    session_a.close().await.ok();
    session_b.close().await.ok();
    Ok(())
}

async fn run_glare(args: GlareArgs) -> anyhow::Result<()> {
    let impolite = MockTransport::with_apply_latency(
        "a",
        Duration::from_millis(args.apply_delay_ms),
    );
    let polite = MockTransport::new("b");
    let (link_a, link_b) = LocalSignalingLink::pair(Duration::from_millis(args.signaling_delay_ms));

    let session_a = Session::new("a", impolite.clone() as Arc<dyn Transport>, link_a);
    let session_b = Session::new("b", polite.clone() as Arc<dyn Transport>, link_b);
    let _driver_a = SessionDriver::spawn(Arc::clone(&session_a)).context("driving peer a")?;
    let _driver_b = SessionDriver::spawn(Arc::clone(&session_b)).context("driving peer b")?;

    println!("both peers offering at once...");
    let (first, second) = tokio::join!(session_a.negotiate(), session_b.negotiate());
    first.context("peer a offer")?;
    second.context("peer b offer")?;

    // Let the colliding envelopes cross the link and settle.
    sleep(Duration::from_millis(args.apply_delay_ms + 4 * args.signaling_delay_ms + 200)).await;

    let stats_a = session_a.stats();
    let stats_b = session_b.stats();
    info!(
        rollbacks = stats_a.rollbacks,
        ignored = stats_b.ignored_offers,
        "glare resolved"
    );
    println!(
        "peer a: state={} rollbacks={} ignored_offers={}",
        impolite.signaling_state(),
        stats_a.rollbacks,
        stats_a.ignored_offers
    );
    println!(
        "peer b: state={} rollbacks={} ignored_offers={}",
        polite.signaling_state(),
        stats_b.rollbacks,
        stats_b.ignored_offers
    );
    println!(
        "connections: a={} b={}",
        impolite.connection_state(),
        polite.connection_state()
    );

    // The in-memory engine has no real data channel; stand one up so the
    // demo ends the way a session does, with a message across.
    let (chat_a, chat_b) = LocalChatLink::pair();
    chat_a
        .send_text("still here after the collision")
        .context("chat send")?;
    if let Some(text) = chat_b.recv_text().await {
        println!("peer: {text}");
    }
    Ok(())
}

async fn wait_connected(session: &Arc<Session>, label: &str) -> anyhow::Result<()> {
    timeout(Duration::from_secs(20), async {
        while session.connection_state() != ConnectionState::Connected {
            sleep(Duration::from_millis(50)).await;
        }
    })
    .await
    .with_context(|| format!("timed out waiting for peer {label} to connect"))?;
    Ok(())
}

/// The data channel opens a beat after the connection does; retry sends that
/// land in that gap.
async fn send_when_open(channel: &dyn ChatChannel, text: &str) -> anyhow::Result<()> {
    timeout(Duration::from_secs(10), async {
        loop {
            match channel.send_text(text) {
                Ok(()) => return Ok(()),
                Err(ChatError::NotOpen) => sleep(Duration::from_millis(100)).await,
                Err(err) => return Err(err),
            }
        }
    })
    .await
    .context("timed out waiting for the chat channel to open")?
    .context("sending chat message")
}
