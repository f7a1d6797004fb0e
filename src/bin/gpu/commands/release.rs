use crate::cli::ReleaseArgs;
use gpuclaim::client::Connection;
use gpuclaim::config::Config;
use gpuclaim::protocol::{
    ReleaseRequest, ReleaseResponse, Request, StatusRequest, StatusResponse,
};
use std::time::Duration;

pub(crate) async fn handle_release(config: &Config, args: ReleaseArgs) -> anyhow::Result<()> {
    let card_indices = if args.all {
        let conn = Connection::connect(&config.socket_path).await?;
        conn.send(&Request::Status(StatusRequest {})).await?;
        let status: StatusResponse = conn.receive_timeout(Duration::from_secs(5)).await?;
        let uid = nix::unistd::getuid().as_raw();
        let mine: Vec<u32> = status
            .cards
            .iter()
            .filter(|c| c.reserved_by_uid == uid)
            .map(|c| c.index)
            .collect();
        if mine.is_empty() {
            println!("No cards are reserved by you.");
            return Ok(());
        }
        mine
    } else {
        args.cards
    };

    let conn = Connection::connect(&config.socket_path).await?;
    conn.send(&Request::Release(ReleaseRequest {
        card_indices: card_indices.clone(),
    }))
    .await?;
    let resp: ReleaseResponse = conn.receive_timeout(Duration::from_secs(5)).await?;

    if !resp.errors.is_empty() {
        anyhow::bail!("Some cards could not be released:\n{}", resp.errors.trim_end());
    }
    println!("Released {} card(s).", card_indices.len());
    Ok(())
}
