use std::error::Error;
use std::time::Duration;

use portal_notify::{NotificationClient, NotificationEvent, StreamConfig};

fn main() -> Result<(), Box<dyn Error>> {
    let base_url = "ws://localhost:8000".to_string();
    let token = "REPLACE_WITH_ACCESS_TOKEN".to_string();

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async {
        let config = StreamConfig::new("/ws/notifications/")
            .with_base_url(base_url)
            .with_token(token);

        let client = NotificationClient::connect(config, |event: NotificationEvent| {
            println!("type={} payload={}", event.event_type(), event.to_value());
        })?;
        let mut states = client.state_changes();

        let watch_for = tokio::time::sleep(Duration::from_secs(60));
        tokio::pin!(watch_for);
        loop {
            tokio::select! {
                _ = &mut watch_for => break,
                changed = states.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let state = *states.borrow_and_update();
                    println!("connection state={state}");
                }
            }
        }

        client.close();
        Ok::<(), Box<dyn Error>>(())
    })
}
