use crate::cli::ClaimArgs;
use gpuclaim::client::Connection;
use gpuclaim::config::Config;
use gpuclaim::protocol::{ClaimRequest, ClaimResponse, Request};

pub(crate) async fn handle_claim(config: &Config, args: ClaimArgs) -> anyhow::Result<()> {
    let conn = Connection::connect(&config.socket_path).await?;
    conn.send(&Request::Claim(ClaimRequest {
        num_gpus: args.num_cards,
        wait: true,
    }))
    .await?;

    // No deadline: the daemon answers once the queue reaches us.
    let resp: ClaimResponse = conn.receive().await?;
    if !resp.error.is_empty() {
        anyhow::bail!("Could not claim GPUs: {}", resp.error);
    }

    println!("Claimed {} GPU(s):", resp.claimed_cards.len());
    for card in &resp.claimed_cards {
        println!(" - {}", card.name);
    }
    println!();
    println!("Use with:");
    println!(
        "export CUDA_VISIBLE_DEVICES={}",
        resp.claimed_cards
            .iter()
            .map(|c| c.uuid.as_str())
            .collect::<Vec<_>>()
            .join(",")
    );

    Ok(())
}
