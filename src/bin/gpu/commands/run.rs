use crate::cli::RunArgs;
use anyhow::{bail, Context};
use gpuclaim::client::Connection;
use gpuclaim::config::Config;
use gpuclaim::protocol::{
    Card, ClaimRequest, ClaimResponse, CoRunRequest, ReleaseRequest, ReleaseResponse, Request,
    StatusRequest, StatusResponse,
};
use std::collections::HashSet;
use std::process::Command;
use std::time::Duration;

pub(crate) async fn handle_run(config: &Config, args: RunArgs) -> anyhow::Result<()> {
    // The full card table is needed up front to know which device nodes to
    // hide from the command.
    let conn = Connection::connect(&config.socket_path).await?;
    conn.send(&Request::Status(StatusRequest {})).await?;
    let status: StatusResponse = conn.receive_timeout(Duration::from_secs(5)).await?;
    drop(conn);

    let conn = Connection::connect(&config.socket_path).await?;
    let claimed: Vec<Card> = if !args.cards.is_empty() {
        conn.send(&Request::CoRun(CoRunRequest {
            card_indices: args.cards.clone(),
        }))
        .await?;
        let resp: ClaimResponse = conn.receive_timeout(Duration::from_secs(5)).await?;
        if !resp.error.is_empty() {
            bail!("Could not attach to cards: {}", resp.error);
        }
        resp.claimed_cards
    } else {
        let num_gpus = args.num_cards.unwrap_or(1);
        conn.send(&Request::Claim(ClaimRequest {
            num_gpus,
            wait: true,
        }))
        .await?;
        let resp: ClaimResponse = conn.receive().await?;
        if !resp.error.is_empty() {
            bail!("Could not claim GPUs: {}", resp.error);
        }
        resp.claimed_cards
    };
    drop(conn);

    let uuids = claimed
        .iter()
        .map(|c| c.uuid.as_str())
        .collect::<Vec<_>>()
        .join(",");
    let indices = claimed
        .iter()
        .map(|c| c.index.to_string())
        .collect::<Vec<_>>()
        .join(",");
    let prompt_marker = format!("GPU[{indices}]");

    let granted: HashSet<u32> = claimed.iter().map(|c| c.index).collect();
    let hidden: Vec<String> = status
        .cards
        .iter()
        .filter(|c| !granted.contains(&c.index))
        .map(|c| format!("nvidia{}", c.minor_id))
        .collect();

    let exit = if args.no_isolation || hidden.is_empty() {
        Command::new(&args.command[0])
            .args(&args.command[1..])
            .env("CUDA_VISIBLE_DEVICES", &uuids)
            .env("debian_chroot", &prompt_marker)
            .status()
            .with_context(|| format!("could not run {}", args.command[0]))?
    } else {
        Command::new("gpu-container")
            .args(&hidden)
            .arg("--")
            .args(&args.command)
            .env("CUDA_VISIBLE_DEVICES", &uuids)
            .env("debian_chroot", &prompt_marker)
            .status()
            .context("could not run gpu-container (is it installed set-uid root?)")?
    };

    // Hand the cards back right away; the daemon would reclaim them on our
    // exit anyway, this just skips the probe delay.
    let card_indices: Vec<u32> = claimed.iter().map(|c| c.index).collect();
    if !card_indices.is_empty() {
        if let Ok(conn) = Connection::connect(&config.socket_path).await {
            if conn
                .send(&Request::Release(ReleaseRequest { card_indices }))
                .await
                .is_ok()
            {
                let _ = conn
                    .receive_timeout::<ReleaseResponse>(Duration::from_secs(5))
                    .await;
            }
        }
    }

    std::process::exit(exit.code().unwrap_or(1));
}
