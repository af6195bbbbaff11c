use swarm::{AddTorrentParams, Session, SessionSettings};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let mut settings = SessionSettings::default();
    settings.listen_interfaces = "0.0.0.0:6881".to_string();
    settings.active_downloads = 2;
    let session = Session::new(settings);

    let mut params = AddTorrentParams::with_info_hash([0x42; 20]);
    params.name = "demo".to_string();
    params.metadata = Some(vec![0u8; 64]);
    match session.add_torrent(params).await {
        Ok(ih) => println!("added torrent {}", hex::encode(ih)),
        Err(e) => eprintln!("add failed: {e}"),
    }

    for _ in 0..10 {
        tokio::time::sleep(std::time::Duration::from_secs(1)).await;
        for alert in session.pop_alerts().await {
            println!("alert: {alert:?}");
        }
    }

    session.abort().await;
}
