use gpuclaim::client::Connection;
use gpuclaim::config::Config;
use gpuclaim::protocol::{Request, StatusRequest, StatusResponse};
use gpuclaim::utils::{monotonic_ms, username_for_uid};
use std::time::Duration;

pub(crate) async fn handle_status(config: &Config) -> anyhow::Result<()> {
    let conn = Connection::connect(&config.socket_path).await?;
    conn.send(&Request::Status(StatusRequest {})).await?;
    let resp: StatusResponse = conn.receive_timeout(Duration::from_secs(5)).await?;

    if resp.maintenance {
        println!("NOTE: the server is in maintenance mode; new claims are rejected.\n");
    }

    let now_ms = monotonic_ms();
    for card in &resp.cards {
        print!(
            "[{}] {} | {:2}% | {:6} / {:6} MB |",
            card.index,
            card.name,
            card.compute_percent,
            card.memory_used / 1_000_000,
            card.memory_total / 1_000_000
        );

        match username_for_uid(card.reserved_by_uid).filter(|_| !card.is_free()) {
            None => print!("{:>24} |", "free"),
            Some(owner) => {
                let idle_min = now_ms.saturating_sub(card.last_usage_ms) / 60_000;
                if idle_min == 0 {
                    print!("{owner:>10}    (running) |");
                } else {
                    print!("{owner:>10} (idle {idle_min}min) |");
                }
            }
        }

        for proc in &card.processes {
            let user = username_for_uid(proc.uid).unwrap_or_else(|| proc.uid.to_string());
            print!(" {}({}M)", user, proc.memory / 1_000_000);
        }
        println!();
    }

    if !resp.queue.is_empty() {
        println!("\nWaiting jobs:");
        for job in resp.queue {
            let user = username_for_uid(job.uid).unwrap_or_else(|| job.uid.to_string());
            println!("  {} waiting for {} GPU(s)", user, job.num_gpus);
        }
    }

    Ok(())
}
