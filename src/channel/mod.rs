use crate::error::{Result, StationError};
use crate::model::ConnectionTarget;
use crate::protocol::{self, Command};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::time::timeout;

/// Opens a TCP connection to the station, bounded by `connect_timeout` if set.
pub async fn connect(
    target: &ConnectionTarget,
    connect_timeout: Option<Duration>,
) -> Result<TcpStream> {
    let connect = TcpStream::connect((target.host.as_str(), target.port));
    let res = match connect_timeout {
        Some(limit) => match timeout(limit, connect).await {
            Ok(res) => res,
            Err(_) => {
                return Err(StationError::Timeout {
                    target: target.clone(),
                    timeout_ms: limit.as_millis() as u64,
                })
            }
        },
        None => connect.await,
    };
    res.map_err(|source| StationError::Connect {
        target: target.clone(),
        source,
    })
}

/// Sends a single command on its own short-lived connection.
///
/// The socket is dropped on every path, so nothing outlives the call.
pub async fn send(
    target: &ConnectionTarget,
    command: Command,
    connect_timeout: Option<Duration>,
) -> Result<()> {
    let mut stream = connect(target, connect_timeout).await?;
    let send_err = |source| StationError::Send {
        target: target.clone(),
        command: command.token(),
        source,
    };

    stream
        .write_all(&protocol::encode(command))
        .await
        .map_err(send_err)?;
    stream.flush().await.map_err(send_err)?;
    stream.shutdown().await.map_err(send_err)?;

    tracing::info!(station = %target, command = command.token(), "command sent");
    Ok(())
}

/// Setup-time reachability check: connect, then close. No protocol exchange.
pub async fn check_reachable(target: &ConnectionTarget, connect_timeout: Option<Duration>) -> Result<()> {
    match connect(target, connect_timeout).await {
        Ok(mut stream) => {
            let _ = stream.shutdown().await;
            tracing::info!(station = %target, "successfully connected");
            Ok(())
        }
        Err(err) => Err(StationError::Unreachable {
            target: target.clone(),
            reason: err.to_string(),
        }),
    }
}
