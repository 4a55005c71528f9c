use core::time::Duration;
use std::path::PathBuf;

use anyhow::Context as _;
use clap::Parser;
use indi::{
    Client, ConnectionConfig,
    common::{blob::BlobPayload, xml::XmlElement},
};
use tokio::sync::mpsc;

#[derive(Parser)]
struct Args {
    /// Hub host
    #[arg(default_value = "localhost")]
    host: String,

    /// Hub port
    #[arg(default_value_t = 7624)]
    port: u16,

    /// Only watch this device
    #[arg(long)]
    device: Option<String>,

    /// Only watch this vector of --device
    #[arg(long, requires = "device")]
    property: Option<String>,

    /// Save received BLOBs into this directory
    #[arg(long)]
    blob_dir: Option<PathBuf>,

    /// Delay between reconnect attempts
    #[arg(long, default_value_t = 2000)]
    backoff_ms: u64,
}

fn print_element(el: &XmlElement) {
    match serde_json::to_string(el) {
        Ok(json) => println!("{json}"),
        Err(err) => tracing::warn!(%err, tag = %el.tag, "failed to encode element"),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    indi::log::init();

    let args = Args::parse();

    let config =
        ConnectionConfig::default().with_reconnect_backoff(Duration::from_millis(args.backoff_ms));
    let client = Client::connect(args.host.as_str(), args.port, config);

    client.on_message(print_element);

    // callbacks can't call back into the client, so new devices are watched from here
    let (device_tx, mut new_devices) = mpsc::unbounded_channel::<String>();

    match (&args.device, &args.property) {
        (Some(device), Some(property)) => {
            client.watch(device, property, print_element);
        }
        (Some(device), None) => {
            client.watch_all(device, print_element);
        }
        (None, _) => client.on_new_device(move |device| {
            let _ = device_tx.send(device.to_owned());
        }),
    }

    let (blob_tx, mut blobs) = mpsc::unbounded_channel::<BlobPayload>();
    if args.blob_dir.is_some() {
        client.on_blob(move |blob| {
            let _ = blob_tx.send(blob.clone());
        });
    }

    client
        .get_properties(args.device.as_deref(), args.property.as_deref())
        .context("failed to request properties")?;

    let mut saved = 0usize;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,

            Some(device) = new_devices.recv() => {
                client.watch_all(&device, print_element);
                // the definition that announced the device went by unwatched.
                // requests are kept and replayed, so a dropped link isn't fatal
                if let Err(err) = client.get_properties(Some(&device), None) {
                    tracing::warn!(%err, device, "failed to request properties");
                }
            }

            Some(blob) = blobs.recv() => {
                let Some(dir) = &args.blob_dir else { continue };

                saved += 1;
                let path = dir.join(blob_file_name(&blob, saved));
                tokio::fs::write(&path, &blob.data)
                    .await
                    .with_context(|| format!("failed to write {}", path.display()))?;

                tracing::info!(path = %path.display(), len = blob.data.len(), "saved BLOB");
            }
        }
    }

    client.shutdown();
    Ok(())
}

/// File name for the `n`th saved BLOB. Both parts come from the hub, so
/// anything that could name another directory is replaced.
fn blob_file_name(blob: &BlobPayload, n: usize) -> String {
    let prefix = match &blob.vector {
        Some(key) => format!("{}_{}", key.device, key.name),
        None => blob.name.to_string(),
    };

    let prefix = prefix.replace(|c: char| !c.is_ascii_alphanumeric() && c != '_' && c != '-', "_");
    let format = blob.format.replace(|c: char| !c.is_ascii_alphanumeric() && c != '.', "_");
    format!("{prefix}_{n:04}{format}")
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use indi::common::PropertyKey;

    use super::*;

    fn blob(format: &str) -> BlobPayload {
        BlobPayload {
            vector: Some(PropertyKey::new("CCD Simulator", "CCD1")),
            name: "CCD1".into(),
            format: format.into(),
            size: None,
            attributes: Vec::new(),
            data: Vec::new(),
        }
    }

    #[test]
    fn file_names_stay_in_the_blob_dir() {
        assert_eq!(blob_file_name(&blob(".fits.z"), 3), "CCD_Simulator_CCD1_0003.fits.z");

        let dir = Path::new("/data/blobs");
        for format in ["/../../../tmp/pwn", "\\..\\x", "/etc/passwd"] {
            let name = blob_file_name(&blob(format), 1);
            assert!(!name.contains(['/', '\\']), "{name}");
            assert_eq!(dir.join(&name).parent(), Some(dir), "{name}");
        }
    }
}
