use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand};
use futures_util::{SinkExt, StreamExt};
use huddle_proto::{
    AuthenticatePayload, ClientMessage, Envelope, JoinPayload, LeavePayload, RoomType,
};
use tokio::time::{timeout, Duration};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, warn};

use crate::config::ServeArgs;

#[derive(Parser, Debug)]
#[command(name = "huddle-road", version)]
#[command(about = "Huddle session server and room watcher")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Command>,

    #[command(flatten)]
    pub serve: ServeArgs,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Join a room and print every frame the server sends
    Watch(WatchArgs),
}

#[derive(Args, Debug, Clone)]
pub struct WatchArgs {
    /// Websocket endpoint of the session server
    #[arg(short, long, default_value = "ws://localhost:3001/ws")]
    pub url: String,

    /// Room to join
    #[arg(short, long)]
    pub room: String,

    /// Access token (or user id when the server runs with auth bypass)
    #[arg(short, long, env = "HUDDLE_TOKEN")]
    pub token: String,

    /// Room type used if the room has no durable record yet
    #[arg(long, value_parser = parse_room_type)]
    pub room_type: Option<RoomType>,
}

fn parse_room_type(value: &str) -> Result<RoomType, String> {
    value.parse()
}

pub async fn run_watch_client(args: WatchArgs) -> Result<()> {
    debug!(url = %args.url, room = %args.room, "connecting watcher");
    let (stream, _) = timeout(Duration::from_secs(5), connect_async(args.url.as_str()))
        .await
        .map_err(|_| anyhow!("timed out connecting to {}", args.url))?
        .with_context(|| format!("failed to connect to {}", args.url))?;
    let (mut sink, mut source) = stream.split();

    let opening = [
        ClientMessage::Authenticate(AuthenticatePayload {
            token: args.token.clone(),
        }),
        ClientMessage::Join(JoinPayload {
            room_id: args.room.clone(),
            user: None,
            room_type: args.room_type,
        }),
    ];
    for message in &opening {
        sink.send(Message::Text(message.to_text()?.into())).await?;
    }

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                let leave = ClientMessage::Leave(LeavePayload::default()).to_text()?;
                let _ = sink.send(Message::Text(leave.into())).await;
                let _ = sink.close().await;
                break;
            }
            frame = source.next() => {
                let Some(frame) = frame else { break };
                match frame? {
                    Message::Text(text) => print_frame(text.as_str()),
                    Message::Close(_) => break,
                    _ => {}
                }
            }
        }
    }
    Ok(())
}

fn print_frame(text: &str) {
    match Envelope::parse(text) {
        Ok(envelope) => {
            let payload = serde_json::to_string_pretty(&envelope.payload)
                .unwrap_or_else(|_| envelope.payload.to_string());
            println!("<- {}\n{}", envelope.kind, payload);
        }
        Err(err) => warn!(error = %err, "server sent an unparseable frame"),
    }
}
