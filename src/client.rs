//! Typed client side of the daemon protocol, used by the front-end.

use crate::net::SeqPacketConn;
use crate::protocol::{self, ProtocolError, Request, MAX_RECORD};
use anyhow::{bail, Context};
use serde::de::DeserializeOwned;
use std::path::Path;
use std::time::Duration;

pub struct Connection {
    conn: SeqPacketConn,
}

impl Connection {
    pub async fn connect(socket_path: &Path) -> anyhow::Result<Self> {
        let conn = SeqPacketConn::connect(socket_path).await.context(
            "Could not connect to the GPU server. Please contact the system administrators.",
        )?;
        Ok(Self { conn })
    }

    pub async fn send(&self, request: &Request) -> anyhow::Result<()> {
        let bytes = protocol::encode(request)?;
        self.conn
            .send(&bytes)
            .await
            .context("Could not send request to the GPU server")
    }

    /// Wait for the next response record. Claims wait on this without a
    /// deadline: the daemon holds the connection until the queue decides.
    pub async fn receive<T: DeserializeOwned>(&self) -> anyhow::Result<T> {
        let mut buf = vec![0u8; MAX_RECORD];
        let record = self
            .conn
            .recv(&mut buf)
            .await
            .context("Could not receive response from the GPU server")?;
        if record.len == 0 {
            bail!("The GPU server closed the connection without a response");
        }
        if record.truncated {
            return Err(ProtocolError::Truncated)
                .context("Please contact the system administrators");
        }
        Ok(protocol::decode(&buf[..record.len])?)
    }

    /// Variant with a deadline, for requests that are answered immediately.
    pub async fn receive_timeout<T: DeserializeOwned>(
        &self,
        timeout: Duration,
    ) -> anyhow::Result<T> {
        tokio::time::timeout(timeout, self.receive())
            .await
            .context("Timed out waiting for the GPU server")?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::SeqPacketListener;
    use crate::protocol::{ClaimRequest, ClaimResponse};

    #[tokio::test]
    async fn typed_request_and_reply_round_trip() {
        let path = std::env::temp_dir().join(format!(
            "gpuclaim-client-roundtrip-{}.sock",
            std::process::id()
        ));
        let listener = SeqPacketListener::bind(&path).unwrap();

        let conn = Connection::connect(&path).await.unwrap();
        conn.send(&Request::Claim(ClaimRequest {
            num_gpus: 2,
            wait: true,
        }))
        .await
        .unwrap();

        let server = listener.accept().await.unwrap();
        let mut buf = vec![0u8; MAX_RECORD];
        let record = server.recv(&mut buf).await.unwrap();
        let request: Request = protocol::decode(&buf[..record.len]).unwrap();
        assert_eq!(
            request,
            Request::Claim(ClaimRequest {
                num_gpus: 2,
                wait: true,
            })
        );

        let reply = ClaimResponse::rejection("GPU per-user limit is reached");
        server.send(&protocol::encode(&reply).unwrap()).await.unwrap();

        let received: ClaimResponse = conn
            .receive_timeout(Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(received.error, "GPU per-user limit is reached");
        assert!(received.claimed_cards.is_empty());

        let _ = std::fs::remove_file(&path);
    }
}
