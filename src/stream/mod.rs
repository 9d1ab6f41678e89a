//! Long-lived status connection to a command station.
//!
//! A session connects, asks for the current state with `<s>`, then reads
//! newline-delimited frames until the peer closes, an I/O error occurs, or
//! shutdown is requested. [`run`] supervises sessions and reconnects with
//! exponential backoff as configured.

use crate::channel;
use crate::config::ReconnectConfig;
use crate::error::StationError;
use crate::model::{CloseReason, ConnectionTarget, PowerState, SessionState};
use crate::protocol::{self, Command};
use rand::Rng;
use std::io;
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::watch;
use uuid::Uuid;

/// Longest line accepted from a station, not counting the terminator.
pub const MAX_LINE_LEN: usize = 4 * 1024;

#[derive(Debug, Clone, Default)]
pub struct StreamOptions {
    pub connect_timeout: Option<Duration>,
    pub reconnect: ReconnectConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionEnd {
    Closed(CloseReason),
    Cancelled,
}

#[derive(Debug, Clone, Copy)]
struct SessionOutcome {
    end: SessionEnd,
    /// Whether at least one line arrived before the session ended.
    received: bool,
}

/// Runs stream sessions until shutdown, or until reconnection gives up.
///
/// Every recognized power report is handed to `on_event` in arrival order.
/// Between attempts the published state is `Reconnecting`; `Closed` is only
/// published once the reader stops for good. Only a session that received
/// at least one line resets the attempt counter.
pub async fn run<F>(
    target: ConnectionTarget,
    options: StreamOptions,
    mut on_event: F,
    status: watch::Sender<SessionState>,
    mut shutdown: watch::Receiver<bool>,
) where
    F: FnMut(PowerState),
{
    let mut attempt: u32 = 0;

    loop {
        let outcome = run_session(
            &target,
            options.connect_timeout,
            &mut on_event,
            &status,
            &mut shutdown,
        )
        .await;

        let reason = match outcome.end {
            SessionEnd::Cancelled => {
                status.send_replace(SessionState::Cancelled);
                tracing::debug!(station = %target, "reader task cancelled");
                return;
            }
            SessionEnd::Closed(reason) => reason,
        };
        if outcome.received {
            attempt = 0;
        }
        if attempt >= options.reconnect.max_attempts {
            status.send_replace(SessionState::Closed { reason });
            if options.reconnect.max_attempts > 0 {
                tracing::warn!(
                    station = %target,
                    max_attempts = options.reconnect.max_attempts,
                    "stream reconnection limit reached, giving up"
                );
            }
            tracing::debug!(station = %target, "reader loop finished");
            return;
        }

        let delay = calculate_backoff(attempt, &options.reconnect);
        attempt += 1;
        status.send_replace(SessionState::Reconnecting { attempt });
        tracing::info!(
            station = %target,
            attempt,
            reason = ?reason,
            delay_ms = delay.as_millis() as u64,
            "waiting before stream reconnect"
        );

        tokio::select! {
            biased;
            _ = cancelled(&mut shutdown) => {
                status.send_replace(SessionState::Cancelled);
                tracing::debug!(station = %target, "reader task cancelled during backoff");
                return;
            }
            _ = tokio::time::sleep(delay) => {}
        }
    }
}

async fn run_session<F>(
    target: &ConnectionTarget,
    connect_timeout: Option<Duration>,
    on_event: &mut F,
    status: &watch::Sender<SessionState>,
    shutdown: &mut watch::Receiver<bool>,
) -> SessionOutcome
where
    F: FnMut(PowerState),
{
    let session = Uuid::new_v4();
    status.send_replace(SessionState::Connecting);

    let stream = tokio::select! {
        biased;
        _ = cancelled(shutdown) => {
            return SessionOutcome { end: SessionEnd::Cancelled, received: false };
        }
        res = open(target, connect_timeout) => match res {
            Ok(stream) => stream,
            Err(err) => {
                tracing::warn!(station = %target, %session, error = %err, "stream connect failed");
                return SessionOutcome {
                    end: SessionEnd::Closed(CloseReason::Error),
                    received: false,
                };
            }
        },
    };

    status.send_replace(SessionState::Streaming);
    tracing::debug!(station = %target, %session, "stream connected, state requested");

    let mut reader = BufReader::new(stream);
    let mut lines = 0u64;
    let end = tokio::select! {
        biased;
        _ = cancelled(shutdown) => SessionEnd::Cancelled,
        res = read_frames(&mut reader, target, &mut lines, on_event) => match res {
            Ok(()) => {
                tracing::debug!(station = %target, %session, "connection closed by peer");
                SessionEnd::Closed(CloseReason::Normal)
            }
            Err(source) => {
                let err = StationError::StreamRead { target: target.clone(), source };
                tracing::warn!(station = %target, %session, error = %err, "error in reader loop");
                SessionEnd::Closed(CloseReason::Error)
            }
        },
    };

    let _ = reader.get_mut().shutdown().await;
    tracing::debug!(station = %target, %session, lines, "stream session ended");
    SessionOutcome {
        end,
        received: lines > 0,
    }
}

async fn open(
    target: &ConnectionTarget,
    connect_timeout: Option<Duration>,
) -> Result<TcpStream, StationError> {
    let mut stream = channel::connect(target, connect_timeout).await?;
    let send_err = |source| StationError::Send {
        target: target.clone(),
        command: Command::QueryState.token(),
        source,
    };
    stream
        .write_all(&protocol::encode(Command::QueryState))
        .await
        .map_err(send_err)?;
    stream.flush().await.map_err(send_err)?;
    Ok(stream)
}

/// Reads frames until end of stream. Returns `Ok` only on a clean peer close.
///
/// `lines` counts every line taken off the wire, recognized or not. A line
/// longer than [`MAX_LINE_LEN`] fails the read with `InvalidData`.
async fn read_frames<R, F>(
    reader: &mut R,
    target: &ConnectionTarget,
    lines: &mut u64,
    on_event: &mut F,
) -> io::Result<()>
where
    R: AsyncBufRead + Unpin,
    F: FnMut(PowerState),
{
    let mut line = Vec::with_capacity(64);
    loop {
        line.clear();
        let n = (&mut *reader)
            .take(MAX_LINE_LEN as u64 + 1)
            .read_until(b'\n', &mut line)
            .await?;
        if n == 0 {
            return Ok(());
        }
        if line.len() > MAX_LINE_LEN && line.last() != Some(&b'\n') {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("line too large: more than {MAX_LINE_LEN} bytes without a newline"),
            ));
        }
        *lines += 1;
        tracing::debug!(station = %target, line = %protocol::display_line(&line), "received line");

        match protocol::decode_line(&line).power_state() {
            Some(state) => {
                tracing::info!(station = %target, state = %state, "received track power state");
                on_event(state);
            }
            None => {
                tracing::debug!(
                    station = %target,
                    line = %protocol::display_line(&line),
                    "unknown response"
                );
            }
        }
    }
}

/// Resolves once shutdown is requested or the controller side is gone.
async fn cancelled(shutdown: &mut watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow_and_update() {
            return;
        }
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}

fn calculate_backoff(attempt: u32, config: &ReconnectConfig) -> Duration {
    let base = config
        .initial_delay_ms
        .saturating_mul(1u64 << attempt.min(16))
        .min(config.max_delay_ms);
    let jitter = rand::thread_rng().gen_range(0..=base / 10);
    Duration::from_millis(base.saturating_add(jitter).min(config.max_delay_ms))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    const WAIT: Duration = Duration::from_secs(2);

    fn target() -> ConnectionTarget {
        ConnectionTarget::new("127.0.0.1", 2560)
    }

    async fn listener() -> (TcpListener, ConnectionTarget) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        (listener, ConnectionTarget::new("127.0.0.1", port))
    }

    fn options(max_attempts: u32) -> StreamOptions {
        StreamOptions {
            connect_timeout: Some(WAIT),
            reconnect: ReconnectConfig {
                max_attempts,
                initial_delay_ms: 10,
                max_delay_ms: 50,
            },
        }
    }

    struct Harness {
        events: Arc<Mutex<Vec<PowerState>>>,
        status: watch::Receiver<SessionState>,
        shutdown: watch::Sender<bool>,
        task: tokio::task::JoinHandle<()>,
    }

    fn spawn_reader(target: ConnectionTarget, options: StreamOptions) -> Harness {
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        let (status_tx, status) = watch::channel(SessionState::Idle);
        let (shutdown, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(run(
            target,
            options,
            move |state| sink.lock().unwrap().push(state),
            status_tx,
            shutdown_rx,
        ));
        Harness {
            events,
            status,
            shutdown,
            task,
        }
    }

    async fn read_query(socket: &mut TcpStream) {
        let mut buf = [0u8; 4];
        socket.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"<s>\n");
    }

    #[tokio::test]
    async fn frame_loop_forwards_recognized_events_in_order() {
        let (mut client, server) = tokio::io::duplex(1024);
        client
            .write_all(b"<p1>\n<iDCC-EX V-5.0.0>\n\xff<p0>\r\n<p0>\n")
            .await
            .unwrap();
        drop(client);

        let mut events = Vec::new();
        let mut reader = BufReader::new(server);
        read_frames(&mut reader, &target(), &mut 0, &mut |state| events.push(state))
            .await
            .unwrap();

        assert_eq!(events, vec![PowerState::On, PowerState::Off, PowerState::Off]);
    }

    #[tokio::test]
    async fn frame_loop_handles_final_line_without_newline() {
        let (mut client, server) = tokio::io::duplex(64);
        client.write_all(b"<p1>").await.unwrap();
        drop(client);

        let mut events = Vec::new();
        let mut reader = BufReader::new(server);
        read_frames(&mut reader, &target(), &mut 0, &mut |state| events.push(state))
            .await
            .unwrap();
        assert_eq!(events, vec![PowerState::On]);
    }

    #[tokio::test]
    async fn frame_loop_rejects_line_without_newline_past_the_limit() {
        let (mut client, server) = tokio::io::duplex(1024);
        let writer = tokio::spawn(async move {
            let _ = client.write_all(&vec![b'x'; MAX_LINE_LEN * 2]).await;
            let _ = client.write_all(b"\n<p1>\n").await;
        });

        let mut events = Vec::new();
        let mut lines = 0;
        let mut reader = BufReader::new(server);
        let err = read_frames(&mut reader, &target(), &mut lines, &mut |state| events.push(state))
            .await
            .unwrap_err();
        drop(reader);
        writer.await.unwrap();

        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
        assert!(events.is_empty());
        assert_eq!(lines, 0);
    }

    #[tokio::test]
    async fn frame_loop_accepts_line_at_the_limit() {
        let (mut client, server) = tokio::io::duplex(1024);
        let writer = tokio::spawn(async move {
            let mut payload = vec![b' '; MAX_LINE_LEN - 4];
            payload.extend_from_slice(b"<p1>\n<p0>\n");
            client.write_all(&payload).await.unwrap();
        });

        let mut events = Vec::new();
        let mut lines = 0;
        let mut reader = BufReader::new(server);
        read_frames(&mut reader, &target(), &mut lines, &mut |state| events.push(state))
            .await
            .unwrap();
        writer.await.unwrap();

        assert_eq!(events, vec![PowerState::On, PowerState::Off]);
        assert_eq!(lines, 2);
    }

    #[tokio::test]
    async fn session_queries_state_and_closes_normally_when_peer_closes() {
        let (listener, target) = listener().await;
        let peer = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            read_query(&mut socket).await;
            socket.write_all(b"<p1>\n").await.unwrap();
        });

        let mut h = spawn_reader(target, options(0));
        tokio::time::timeout(WAIT, &mut h.task).await.unwrap().unwrap();
        peer.await.unwrap();

        assert_eq!(*h.events.lock().unwrap(), vec![PowerState::On]);
        assert_eq!(
            *h.status.borrow_and_update(),
            SessionState::Closed {
                reason: CloseReason::Normal
            }
        );
    }

    #[tokio::test]
    async fn connect_failure_ends_session_with_error() {
        let (listener, target) = listener().await;
        drop(listener);

        let mut h = spawn_reader(target, options(0));
        tokio::time::timeout(WAIT, &mut h.task).await.unwrap().unwrap();

        assert!(h.events.lock().unwrap().is_empty());
        assert_eq!(
            *h.status.borrow(),
            SessionState::Closed {
                reason: CloseReason::Error
            }
        );
    }

    #[tokio::test]
    async fn cancellation_during_blocked_read_closes_socket() {
        let (listener, target) = listener().await;
        let (accepted_tx, accepted_rx) = tokio::sync::oneshot::channel();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            read_query(&mut socket).await;
            let _ = accepted_tx.send(socket);
        });

        let mut h = spawn_reader(target, options(3));
        let mut peer_socket = tokio::time::timeout(WAIT, accepted_rx)
            .await
            .unwrap()
            .unwrap();
        tokio::time::timeout(WAIT, h.status.wait_for(|s| *s == SessionState::Streaming))
            .await
            .unwrap()
            .unwrap();

        h.shutdown.send(true).unwrap();
        tokio::time::timeout(WAIT, &mut h.task).await.unwrap().unwrap();
        assert_eq!(*h.status.borrow(), SessionState::Cancelled);

        // The reader's side is gone, so the peer sees end of stream.
        let mut buf = [0u8; 8];
        let n = tokio::time::timeout(WAIT, peer_socket.read(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(n, 0);
    }

    #[tokio::test]
    async fn reconnects_after_peer_close_and_keeps_streaming() {
        let (listener, target) = listener().await;
        let peer = tokio::spawn(async move {
            let (mut first, _) = listener.accept().await.unwrap();
            read_query(&mut first).await;
            first.write_all(b"<p0>\n").await.unwrap();
            drop(first);

            let (mut second, _) = listener.accept().await.unwrap();
            read_query(&mut second).await;
            second.write_all(b"<p1>\n").await.unwrap();
            second
        });

        let mut h = spawn_reader(target, options(2));
        let second = tokio::time::timeout(WAIT, peer).await.unwrap().unwrap();
        tokio::time::timeout(WAIT, async {
            while h.events.lock().unwrap().len() < 2 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        assert_eq!(*h.events.lock().unwrap(), vec![PowerState::Off, PowerState::On]);

        h.shutdown.send(true).unwrap();
        tokio::time::timeout(WAIT, &mut h.task).await.unwrap().unwrap();
        drop(second);
    }

    #[tokio::test]
    async fn gives_up_after_max_attempts() {
        let (listener, target) = listener().await;
        drop(listener);

        let mut h = spawn_reader(target, options(2));
        let mut saw_reconnecting = Vec::new();
        let collect = async {
            loop {
                if h.status.changed().await.is_err() {
                    break;
                }
                if let SessionState::Reconnecting { attempt } = *h.status.borrow_and_update() {
                    saw_reconnecting.push(attempt);
                }
            }
        };
        tokio::time::timeout(WAIT, collect).await.unwrap();
        tokio::time::timeout(WAIT, &mut h.task).await.unwrap().unwrap();

        assert_eq!(saw_reconnecting.last(), Some(&2));
        assert_eq!(
            *h.status.borrow(),
            SessionState::Closed {
                reason: CloseReason::Error
            }
        );
    }

    #[tokio::test]
    async fn sessions_without_traffic_count_toward_the_retry_limit() {
        let (listener, target) = listener().await;
        let accepted = Arc::new(AtomicUsize::new(0));
        let counter = accepted.clone();
        let peer = tokio::spawn(async move {
            loop {
                let (socket, _) = listener.accept().await.unwrap();
                counter.fetch_add(1, Ordering::SeqCst);
                drop(socket);
            }
        });

        let mut h = spawn_reader(target, options(1));
        tokio::time::timeout(WAIT, &mut h.task).await.unwrap().unwrap();
        peer.abort();

        // Dropping a socket with the query still unread may reset it, so
        // the close reason is not pinned here.
        assert_eq!(accepted.load(Ordering::SeqCst), 2);
        assert!(h.events.lock().unwrap().is_empty());
        assert!(h.status.borrow().is_finished());
    }

    #[tokio::test]
    async fn retrying_reader_reports_closed_only_when_giving_up() {
        let (listener, target) = listener().await;
        let peer = tokio::spawn(async move {
            loop {
                let (socket, _) = listener.accept().await.unwrap();
                drop(socket);
            }
        });

        let mut h = spawn_reader(target, options(3));
        let mut seen = Vec::new();
        let collect = async {
            while h.status.changed().await.is_ok() {
                seen.push(*h.status.borrow_and_update());
            }
        };
        tokio::time::timeout(WAIT, collect).await.unwrap();
        tokio::time::timeout(WAIT, &mut h.task).await.unwrap().unwrap();
        peer.abort();

        let (last, before) = seen.split_last().unwrap();
        assert!(last.is_finished(), "{last:?}");
        assert!(before.iter().all(|s| !s.is_finished()), "{seen:?}");
        assert!(before.contains(&SessionState::Reconnecting { attempt: 3 }));
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let config = ReconnectConfig {
            max_attempts: 10,
            initial_delay_ms: 1000,
            max_delay_ms: 30_000,
        };
        let first = calculate_backoff(0, &config).as_millis();
        assert!((1000..=1100).contains(&first), "{first}");
        let third = calculate_backoff(2, &config).as_millis();
        assert!((4000..=4400).contains(&third), "{third}");
        assert_eq!(calculate_backoff(12, &config), Duration::from_millis(30_000));
        assert_eq!(calculate_backoff(u32::MAX, &config), Duration::from_millis(30_000));
    }
}
