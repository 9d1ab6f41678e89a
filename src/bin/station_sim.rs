//! Minimal stand-in for a command station, for trying the bridge without hardware.
//!
//! Answers `<s>` with a banner and the power state, applies `<1>` / `<0>`, and
//! broadcasts every power change to all connected clients the way the real
//! firmware does.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;

const DEFAULT_LISTEN: &str = "127.0.0.1:2560";
const BANNER: &str = "<iDCC-EX V-5.0.0 / SIMULATOR / STANDARD_MOTOR_SHIELD G-sim>";

struct Station {
    powered: AtomicBool,
    changes: broadcast::Sender<&'static str>,
}

impl Station {
    fn power_frame(&self) -> &'static str {
        if self.powered.load(Ordering::SeqCst) {
            "<p1>"
        } else {
            "<p0>"
        }
    }

    fn set_power(&self, on: bool) {
        self.powered.store(on, Ordering::SeqCst);
        let _ = self.changes.send(self.power_frame());
    }
}

async fn serve(socket: TcpStream, station: Arc<Station>) -> std::io::Result<()> {
    let peer = socket.peer_addr()?;
    let (read_half, mut write_half) = socket.into_split();
    let mut lines = BufReader::new(read_half).lines();
    let mut changes = station.changes.subscribe();

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else {
                    println!("{peer}: closed");
                    return Ok(());
                };
                let line = line.trim();
                println!("{peer} -> {line}");
                match line {
                    "<s>" => {
                        let reply = format!("{BANNER}\n{}\n", station.power_frame());
                        write_half.write_all(reply.as_bytes()).await?;
                    }
                    "<1>" => station.set_power(true),
                    "<0>" => station.set_power(false),
                    _ => {}
                }
            }
            frame = changes.recv() => {
                if let Ok(frame) = frame {
                    println!("{peer} <- {frame}");
                    write_half.write_all(format!("{frame}\n").as_bytes()).await?;
                }
            }
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let addr = std::env::args()
        .skip(1)
        .find(|a| !a.starts_with("--"))
        .unwrap_or_else(|| DEFAULT_LISTEN.to_string());
    let start_on = std::env::args().any(|a| a == "--on");

    let (changes, _) = broadcast::channel(16);
    let station = Arc::new(Station {
        powered: AtomicBool::new(start_on),
        changes,
    });

    let listener = TcpListener::bind(&addr).await?;
    println!("station-sim: listening on {addr}");

    loop {
        let (socket, _) = listener.accept().await?;
        let station = station.clone();
        tokio::spawn(async move {
            if let Err(err) = serve(socket, station).await {
                eprintln!("station-sim: connection error: {err}");
            }
        });
    }
}
