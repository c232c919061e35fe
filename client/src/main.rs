use clap::Parser;
use client::entities::{EntityRegistry, Inventory};
use client::{Backend, GameplaySignal, SceneEvent, Session, SyncConfig, UdpBackend};
use log::{info, warn};
use rand::Rng;
use shared::{LockKind, ParticipantId, Pose, Vec3, SPAWN_POSITION};
use std::collections::HashMap;
use std::f32::consts::TAU;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;

/// Seconds per lap around the spawn point.
const LAP_SECONDS: f32 = 20.0;
const FRAME: Duration = Duration::from_millis(16);

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Store server address to connect to
    #[arg(short = 's', long, default_value = "127.0.0.1:8080")]
    server: String,

    /// Display name shown to other players
    #[arg(short = 'n', long, default_value = "bot")]
    name: String,

    /// Simulate network latency in milliseconds
    #[arg(short = 'l', long, default_value = "0")]
    fake_ping: u64,

    /// Radius of the circle the bot walks around spawn
    #[arg(short = 'r', long, default_value = "8.0")]
    wander_radius: f32,
}

/// Pose on the wander circle after `elapsed`.
fn wander_pose(phase: f32, radius: f32, elapsed: Duration) -> Pose {
    let angle = phase + elapsed.as_secs_f32() / LAP_SECONDS * TAU;
    let position = Vec3::new(
        SPAWN_POSITION.x + radius * angle.cos(),
        SPAWN_POSITION.y,
        SPAWN_POSITION.z + radius * angle.sin(),
    );
    // Face along the direction of travel
    Pose::new(position, -angle)
}

enum Command {
    Chat(String),
    Unlock(LockKind),
    Drop,
    Who,
    Quit,
}

fn parse_command(line: &str) -> Result<Command, String> {
    let line = line.trim();
    let Some(rest) = line.strip_prefix('/') else {
        return Ok(Command::Chat(line.to_string()));
    };

    let mut parts = rest.split_whitespace();
    match (parts.next(), parts.next()) {
        (Some("unlock"), Some(kind)) => LockKind::from_name(kind)
            .map(Command::Unlock)
            .ok_or_else(|| format!("unknown lock '{}', expected key, tool or code", kind)),
        (Some("unlock"), None) => Err("usage: /unlock <key|tool|code>".to_string()),
        (Some("drop"), _) => Ok(Command::Drop),
        (Some("who"), _) => Ok(Command::Who),
        (Some("quit"), _) => Ok(Command::Quit),
        _ => Err(format!("unknown command '{}'", line)),
    }
}

/// Walks to the item of `kind`, carries it to its lock and uses it.
fn unlock_with_item(
    registry: &mut EntityRegistry,
    inventory: &mut Inventory,
    kind: LockKind,
) -> Option<GameplaySignal> {
    if inventory.slot_of(kind).is_none() {
        let item = registry.item_of_kind(kind)?;
        if !inventory.pick_up(registry, item) {
            println!("* inventory full, /drop something first");
            return None;
        }
    }
    let slot = inventory.slot_of(kind)?;
    inventory.set_active_slot(slot);

    let lock = registry.lock_of_kind(kind)?;
    inventory.use_on_lock(registry, lock)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    if std::env::var("RUST_LOG").is_err() {
        eprintln!("Set RUST_LOG=info for detailed logging");
    }

    let args = Args::parse();

    info!("Starting bot...");
    info!("Connecting to: {}", args.server);
    if args.fake_ping > 0 {
        info!("Simulating {}ms latency", args.fake_ping);
    }
    info!("Type to chat; /unlock <key|tool|code>, /drop, /who, /quit");

    let config = SyncConfig::default();
    let backend = Arc::new(UdpBackend::connect(&args.server, &config, args.fake_ping).await?);
    let mut session = Session::new(backend.clone(), config);

    let mut avatars: HashMap<ParticipantId, String> = HashMap::new();
    for event in session.join(&args.name).await? {
        if let SceneEvent::AvatarSpawned(presence) = &event {
            avatars.insert(presence.id, presence.display_name.clone());
        }
    }
    println!("* joined as {} with {} other(s)", args.name, avatars.len());

    let (signal_tx, mut signal_rx) = mpsc::unbounded_channel();
    let (scene_tx, mut scene_rx) = mpsc::unbounded_channel();

    let session_task = tokio::spawn(async move {
        if let Err(e) = session.run(&mut signal_rx, &scene_tx).await {
            warn!("Session ended with error: {}", e);
        }
    });

    let phase = rand::thread_rng().gen_range(0.0..TAU);
    let radius = args.wander_radius;
    let started = Instant::now();
    let wander_tx = signal_tx.clone();
    let wander_task = tokio::spawn(async move {
        let mut frame = tokio::time::interval(FRAME);
        loop {
            frame.tick().await;
            let pose = wander_pose(phase, radius, started.elapsed());
            if wander_tx.send(GameplaySignal::Pose(pose)).is_err() {
                break;
            }
        }
    });

    let mut registry = EntityRegistry::with_default_layout();
    let mut inventory = Inventory::new();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let line = match line? {
                    Some(line) => line,
                    None => break,
                };
                if line.trim().is_empty() {
                    continue;
                }

                let signal = match parse_command(&line) {
                    Ok(Command::Chat(text)) => GameplaySignal::ChatSubmitted(text),
                    Ok(Command::Unlock(kind)) => {
                        match unlock_with_item(&mut registry, &mut inventory, kind) {
                            Some(signal) => signal,
                            None => {
                                println!("* can't use the {} lock right now", kind);
                                continue;
                            }
                        }
                    }
                    Ok(Command::Drop) => {
                        let pose = wander_pose(phase, radius, started.elapsed());
                        match inventory.drop_active(&mut registry, pose.position, pose.facing_yaw) {
                            Some((_, sound)) => sound,
                            None => {
                                println!("* nothing in hand");
                                continue;
                            }
                        }
                    }
                    Ok(Command::Who) => {
                        println!("* {} other(s) here", avatars.len());
                        for name in avatars.values() {
                            println!("*   {}", name);
                        }
                        continue;
                    }
                    Ok(Command::Quit) => break,
                    Err(message) => {
                        println!("* {}", message);
                        continue;
                    }
                };
                if signal_tx.send(signal).is_err() {
                    break;
                }
            }

            event = scene_rx.recv() => {
                let Some(event) = event else { break };
                match event {
                    SceneEvent::AvatarSpawned(presence) => {
                        println!("* {} joined", presence.display_name);
                        avatars.insert(presence.id, presence.display_name);
                    }
                    SceneEvent::AvatarRemoved(id) => {
                        if let Some(name) = avatars.remove(&id) {
                            println!("* {} left", name);
                        }
                    }
                    SceneEvent::ChatAppended(entry) => {
                        println!("{}: {}", entry.author_name, entry.text);
                    }
                    SceneEvent::LockEngaged(kind) => println!("* you used the {}", kind),
                    SceneEvent::LockOpened(kind) => println!("* the {} lock opened", kind),
                    SceneEvent::ExitReached => println!("* you escaped!"),
                    _ => {}
                }
            }

            _ = tokio::signal::ctrl_c() => {
                info!("Received Ctrl+C, leaving");
                break;
            }
        }
    }

    wander_task.abort();
    let _ = signal_tx.send(GameplaySignal::Leave);
    let _ = session_task.await;
    backend.close().await;

    Ok(())
}
