use clap::{Parser, ValueEnum};
use log::{info, warn};
use peer::Node;
use session::{Player, SessionConfig, SessionEvent};
use shared::Policy;
use tokio::time::{sleep, Duration};

#[derive(Clone, Copy, Debug, ValueEnum)]
enum PolicyArg {
    Local,
    Clean,
    Dirty,
}

impl From<PolicyArg> for Policy {
    fn from(arg: PolicyArg) -> Self {
        match arg {
            PolicyArg::Local => Policy::Local,
            PolicyArg::Clean => Policy::Clean,
            PolicyArg::Dirty => Policy::Dirty,
        }
    }
}

/// Hosts or joins a replicated game session.
#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Args {
    /// Address to listen on when hosting
    #[clap(short = 'H', long, default_value = "127.0.0.1")]
    host: String,
    /// Port to listen on when hosting
    #[clap(short, long, default_value = "8080")]
    port: u16,
    /// Join the admin at this address instead of hosting
    #[clap(short, long)]
    connect: Option<String>,
    /// Application cookie; peers with different cookies refuse each other
    #[clap(long, default_value = "42")]
    cookie: i32,
    /// Default replication policy
    #[clap(long, value_enum, default_value = "clean")]
    policy: PolicyArg,
    /// Maximum number of active players, negative for no limit
    #[clap(long, default_value = "-1", allow_hyphen_values = true)]
    max_players: i32,
    /// Minimum number of players for the game to run
    #[clap(long, default_value = "0")]
    min_players: u32,
    /// Local players to create
    #[clap(long, default_value = "1")]
    players: u32,
    /// Name of the local players
    #[clap(short, long, default_value = "player")]
    name: String,
    /// Network priority of the local players
    #[clap(long, default_value = "0")]
    priority: i32,
    /// Initial random seed
    #[clap(long, default_value = "0")]
    seed: i32,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let config = SessionConfig {
        cookie: args.cookie,
        policy: args.policy.into(),
        max_players: args.max_players,
        min_players: args.min_players,
        seed: args.seed,
    };
    let mut node = Node::new(config);
    node.session_mut().subscribe(log_event);

    for n in 1..=args.players {
        let name = if args.players > 1 {
            format!("{}-{}", args.name, n)
        } else {
            args.name.clone()
        };
        let player = Player::new(0).with_name(&name).with_priority(args.priority);
        if node.session_mut().add_player(player).is_none() {
            warn!("No room for {}", name);
        }
    }
    node.drain();

    match &args.connect {
        Some(addr) => {
            let id = node.join(addr).await?;
            info!("Joined {} as {}", addr, id);
        }
        None => {
            node.listen(&format!("{}:{}", args.host, args.port)).await?;
        }
    }

    loop {
        tokio::select! {
            alive = node.step() => {
                if !alive {
                    break;
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Received Ctrl+C, shutting down");
                if node.session_mut().leave() {
                    node.drain();
                    // let the writer task flush the goodbye
                    sleep(Duration::from_millis(100)).await;
                }
                break;
            }
        }
    }

    Ok(())
}

fn log_event(event: &SessionEvent) {
    match event {
        SessionEvent::PlayerJoined(id) => info!("{} joined", id),
        SessionEvent::PlayerLeft(id) => info!("{} left", id),
        SessionEvent::PlayerIdChanged { old, new } => info!("{} is now {}", old, new),
        SessionEvent::ClientJoined(peer) => info!("{} joined the game", peer),
        SessionEvent::ClientLeft {
            client: Some(peer),
            previous_status,
        } => info!("{} left the game (status was {})", peer, previous_status),
        SessionEvent::ClientLeft {
            client: None,
            previous_status,
        } => info!("Admin lost (status was {}), playing alone", previous_status),
        SessionEvent::GameOver { result, player } => {
            info!("Game over: result {} by {}", result, player)
        }
        SessionEvent::SetupRefused { peer, reason } => warn!("Refused {}: {}", peer, reason),
        SessionEvent::RemoteError {
            sender,
            code,
            message,
        } => warn!("{} reported error {}: {}", sender, code, message),
        SessionEvent::Loaded => info!("Game state loaded"),
        SessionEvent::LoadFailed { kind, message } => warn!("Load failed ({}): {}", kind, message),
        other => log::debug!("{:?}", other),
    }
}
