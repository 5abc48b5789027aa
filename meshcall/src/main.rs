use anyhow::{Context, Result};
use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use meshcall_core::{load_config, logging};
use meshcall_mesh::{
    CallSnapshot, Collaborators, JoinOptions, RoomCall, RtcConnectionFactory, SyntheticCapture,
};
use meshcall_signaling::RoomHub;

/// Runs a full mesh of participants in one process over real `webrtc`
/// connections, with an in-memory room channel standing in for signaling.
#[derive(Parser, Debug)]
#[command(name = "meshcall")]
#[command(about = "In-process full-mesh call demo", long_about = None)]
struct Args {
    /// Room to join
    #[arg(long, env = "MESHCALL_ROOM")]
    room: Option<String>,

    /// Number of participants
    #[arg(long, env = "MESHCALL_PARTICIPANTS")]
    participants: Option<usize>,

    /// First participant shares its screen once the mesh is up
    #[arg(long, env = "MESHCALL_SHARE_SCREEN")]
    share_screen: Option<bool>,

    /// Seconds to stay in the call; ctrl-c ends it early
    #[arg(long, env = "MESHCALL_RUN_SECS")]
    run_secs: Option<u64>,

    /// Print the final snapshot of every participant as JSON
    #[arg(long)]
    json: bool,
}

const NAMES: &[&str] = &["alice", "bob", "carol", "dave", "erin", "frank", "grace", "heidi"];

fn participant_name(index: usize) -> String {
    NAMES
        .get(index)
        .map_or_else(|| format!("guest-{index}"), |name| (*name).to_string())
}

fn log_links(call: &RoomCall, snapshot: &CallSnapshot) {
    for peer in &snapshot.peers {
        match &peer.link {
            Some(link) => info!(
                local = %call.identity(),
                remote = %peer.identity,
                state = %peer.state,
                rtt_ms = link.rtt_ms,
                grade = ?link.grade,
                "Link quality"
            ),
            None => info!(
                local = %call.identity(),
                remote = %peer.identity,
                state = %peer.state,
                "Link quality not sampled yet"
            ),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // 1. Load configuration, command-line flags win
    let mut config = load_config()?;
    if let Some(room) = args.room {
        config.demo.room = room;
    }
    if let Some(participants) = args.participants {
        config.demo.participants = participants.max(1);
    }
    if let Some(share_screen) = args.share_screen {
        config.demo.share_screen = share_screen;
    }
    if let Some(run_secs) = args.run_secs {
        config.demo.run_secs = run_secs;
    }

    // 2. Initialize logging
    logging::init_logging(&config.logging)?;
    info!(
        room = %config.demo.room,
        participants = config.demo.participants,
        ice_servers = config.mesh.ice_servers.len(),
        "meshcall demo starting"
    );

    // 3. Shared signaling and media engine
    let hub = RoomHub::new();
    let connections = Arc::new(
        RtcConnectionFactory::new(&config.mesh).context("Failed to build media engine")?,
    );

    // 4. Join everyone, one after another
    let mut calls = Vec::with_capacity(config.demo.participants);
    for index in 0..config.demo.participants {
        let name = participant_name(index);
        let capture = Arc::new(SyntheticCapture::default().with_sample_generation(true));
        let options = JoinOptions::new(config.demo.room.as_str(), name.as_str(), name.to_uppercase())
            .with_mesh_config(&config.mesh);
        let call = RoomCall::join(
            options,
            Collaborators::from_channel(hub.channel(config.demo.room.as_str()), connections.clone(), capture),
        )
        .await
        .with_context(|| format!("{name} failed to join"))?;
        calls.push(call);
    }

    // 5. Wait for the mesh to form
    let expected = calls.len() - 1;
    let connect_timeout = Duration::from_secs(config.demo.run_secs.max(1));
    for call in &calls {
        match tokio::time::timeout(connect_timeout, call.wait_for(|s| s.connected_peers() == expected)).await {
            Ok(Ok(_)) => info!(identity = %call.identity(), peers = expected, "Fully connected"),
            Ok(Err(e)) => warn!(identity = %call.identity(), error = %e, "Call ended before connecting"),
            Err(_) => warn!(identity = %call.identity(), "Timed out waiting for the mesh"),
        }
    }

    if config.demo.share_screen {
        if let Some(presenter) = calls.first() {
            match presenter.start_screen_share().await {
                Ok(()) => info!(identity = %presenter.identity(), "Screen share started"),
                Err(e) => warn!(identity = %presenter.identity(), error = %e, "Screen share failed"),
            }
        }
    }

    // 6. Report link quality until the run ends
    let mut report = tokio::time::interval(config.mesh.link_stats_interval());
    let deadline = tokio::time::sleep(Duration::from_secs(config.demo.run_secs));
    tokio::pin!(deadline);
    loop {
        tokio::select! {
            () = &mut deadline => {
                info!("Run time elapsed");
                break;
            }
            result = tokio::signal::ctrl_c() => {
                if let Err(e) = result {
                    warn!(error = %e, "Failed to listen for ctrl-c");
                }
                info!("Interrupted");
                break;
            }
            _ = report.tick() => {
                for call in &calls {
                    log_links(call, &call.snapshot());
                }
            }
        }
    }

    // 7. Leave in reverse join order
    let snapshots: Vec<CallSnapshot> = calls.iter().map(RoomCall::snapshot).collect();
    for call in calls.iter().rev() {
        call.leave().await;
        info!(identity = %call.identity(), "Left");
    }

    if args.json {
        println!("{}", serde_json::to_string_pretty(&snapshots)?);
    }

    Ok(())
}
