use std::error::Error;

use ntrip_client::retry::ReconnectPolicy;
use ntrip_client::stream::client::{NtripClient, NtripConfig};
use ntrip_client::stream::sink::ChannelSink;
use secrecy::SecretString;

fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt::init();

    let config = NtripConfig {
        host: "REPLACE_WITH_CASTER_HOST".to_string(),
        port: 2101,
        mountpoint: "REPLACE_WITH_MOUNTPOINT".to_string(),
        username: "REPLACE_WITH_USER".to_string(),
        password: SecretString::new("REPLACE_WITH_PASSWORD".to_string()),
        // Optional: enables a virtual-reference-station stream for this
        // position.
        position_gga: None,
    };

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async {
        let (sink, mut frames) = ChannelSink::new();
        let client = NtripClient::new(config).with_reconnect_policy(ReconnectPolicy::steady());
        let connection = client.connect(sink).await?;

        while let Some((frame, received_at)) = frames.recv().await {
            match frame.message_type() {
                Some(message_type) => println!(
                    "rtcm {message_type} ({} bytes) at {received_at:?}",
                    frame.len()
                ),
                None => println!("rtcm frame without message number ({} bytes)", frame.len()),
            }
        }

        connection.closed().await?;
        Ok::<_, Box<dyn Error>>(())
    })
}
