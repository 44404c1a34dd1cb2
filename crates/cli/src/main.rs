use anyhow::Context;
use clap::{Parser, Subcommand};
use futures::StreamExt;
use pvfll_core::{
    format_size, BoxNumber, BoxStatus, BroadcastNotifier, CoreConfig, DeviceId, FileName, Garden,
    Heartbeat, StoredFile,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "pvfll")]
#[command(about = "Four boxes, one file each: offer, receive and watch over them")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug, PartialEq)]
enum Commands {
    /// Show what every box holds
    Status,
    /// Put a local file into an empty box
    Offer {
        /// Box number (1-4)
        #[arg(value_parser = parse_box)]
        box_number: BoxNumber,
        /// File to upload
        path: PathBuf,
    },
    /// Take the file out of a box, emptying it
    Receive {
        /// Box number (1-4)
        #[arg(value_parser = parse_box)]
        box_number: BoxNumber,
        /// Directory to write the file into
        #[arg(long, default_value = ".")]
        out: PathBuf,
    },
    /// Report this device's connection state
    Heartbeat {
        /// Device identifier
        device_id: String,
        /// Report the device as disconnected
        #[arg(long)]
        disconnected: bool,
    },
    /// List device health
    Devices,
}

fn parse_box(raw: &str) -> Result<BoxNumber, String> {
    raw.parse().map_err(|e: pvfll_core::TypesError| e.to_string())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("pvfll_core=warn".parse()?),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    let Some(command) = cli.command else {
        println!("Use 'pvfll --help' for commands");
        return Ok(());
    };

    let cfg = Arc::new(CoreConfig::from_env().context("loading configuration")?);
    let garden = Garden::from_config(cfg, BroadcastNotifier::new())?;

    run(&garden, command).await
}

async fn run(garden: &Garden, command: Commands) -> anyhow::Result<()> {
    match command {
        Commands::Status => {
            for (box_number, status) in garden.garden().await? {
                println!("{}", describe(box_number, &status));
            }
        }
        Commands::Offer { box_number, path } => {
            let stored = offer(garden, box_number, &path).await?;
            println!(
                "Stored {} in box{} ({}, {})",
                stored.name,
                box_number,
                format_size(stored.size),
                stored.media_type
            );
        }
        Commands::Receive { box_number, out } => match receive(garden, box_number, &out).await? {
            Some(path) => println!("Received {}", path.display()),
            None => println!("box{box_number} is empty"),
        },
        Commands::Heartbeat {
            device_id,
            disconnected,
        } => {
            let heartbeat = Heartbeat {
                device_id: DeviceId::new(device_id)?,
                connected: !disconnected,
                timestamp: chrono::Utc::now(),
            };
            garden.record_heartbeat(&heartbeat).await?;
            println!("Recorded heartbeat for {}", heartbeat.device_id);
        }
        Commands::Devices => {
            let devices = garden.devices(chrono::Utc::now()).await?;
            if devices.is_empty() {
                println!("No devices have reported.");
            }
            for device in devices {
                println!(
                    "{}: {} (last seen {})",
                    device.device_id,
                    device.state_label(),
                    device.last_seen
                );
            }
        }
    }

    Ok(())
}

fn describe(box_number: BoxNumber, status: &BoxStatus) -> String {
    match status {
        BoxStatus::Empty => format!("box{box_number}: empty"),
        BoxStatus::Occupied { name, size, .. } => {
            format!("box{box_number}: {name} ({})", format_size(*size))
        }
    }
}

async fn offer(garden: &Garden, box_number: BoxNumber, path: &Path) -> anyhow::Result<StoredFile> {
    let name = path
        .file_name()
        .and_then(|n| n.to_str())
        .with_context(|| format!("no usable file name in {}", path.display()))?;
    let file_name = FileName::new(name)?;
    let body = tokio::fs::read(path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;

    Ok(garden
        .offer(box_number, &file_name, None, bytes::Bytes::from(body))
        .await?)
}

/// Write the box's file into `out`, then empty the box. Returns `None` for an empty box.
///
/// The box is only emptied after the local file has been fully written and flushed.
async fn receive(
    garden: &Garden,
    box_number: BoxNumber,
    out: &Path,
) -> anyhow::Result<Option<PathBuf>> {
    let BoxStatus::Occupied { name, .. } = garden.status(box_number).await? else {
        return Ok(None);
    };
    let file_name = FileName::new(name)?;

    let mut opened = garden.store().open(box_number, &file_name).await?;
    let target = out.join(file_name.as_str());
    let mut file = tokio::fs::File::create(&target)
        .await
        .with_context(|| format!("creating {}", target.display()))?;
    while let Some(chunk) = opened.stream.next().await {
        file.write_all(&chunk?).await?;
    }
    file.flush().await?;

    garden.discard(box_number, &file_name, opened.size).await?;
    Ok(Some(target))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn garden() -> Garden {
        Garden::from_config(Arc::new(CoreConfig::in_memory()), BroadcastNotifier::new()).unwrap()
    }

    #[test]
    fn parses_commands() {
        let cli = Cli::try_parse_from(["pvfll", "receive", "2", "--out", "/tmp"]).unwrap();
        assert_eq!(
            cli.command,
            Some(Commands::Receive {
                box_number: BoxNumber::new(2).unwrap(),
                out: PathBuf::from("/tmp"),
            })
        );

        let cli = Cli::try_parse_from(["pvfll", "heartbeat", "pi-1", "--disconnected"]).unwrap();
        assert_eq!(
            cli.command,
            Some(Commands::Heartbeat {
                device_id: "pi-1".into(),
                disconnected: true,
            })
        );
    }

    #[test]
    fn rejects_box_out_of_range() {
        assert!(Cli::try_parse_from(["pvfll", "offer", "5", "file.txt"]).is_err());
    }

    #[test]
    fn describes_boxes() {
        let box1 = BoxNumber::new(1).unwrap();
        assert_eq!(describe(box1, &BoxStatus::Empty), "box1: empty");
        let status = BoxStatus::Occupied {
            name: "song.mp3".into(),
            size: 3 * 1024 * 1024,
            last_modified: chrono::Utc::now(),
        };
        assert_eq!(describe(box1, &status), "box1: song.mp3 (3.0 MB)");
    }

    #[tokio::test]
    async fn offer_then_receive_moves_the_file() {
        let garden = garden();
        let box4 = BoxNumber::new(4).unwrap();
        let src = tempfile::TempDir::new().unwrap();
        let dst = tempfile::TempDir::new().unwrap();
        let path = src.path().join("letter.txt");
        std::fs::write(&path, b"dear garden").unwrap();

        let stored = offer(&garden, box4, &path).await.unwrap();
        assert_eq!(stored.key, "box4/letter.txt");
        assert_eq!(stored.size, 11);

        let received = receive(&garden, box4, dst.path()).await.unwrap().unwrap();
        assert_eq!(std::fs::read(&received).unwrap(), b"dear garden");
        assert!(garden.status(box4).await.unwrap().is_empty());

        assert!(receive(&garden, box4, dst.path()).await.unwrap().is_none());
    }
}
