use ligolo_sdk::LigoloClient;
use ligolo_sdk::tonic::transport::Channel;
use tokio_stream::StreamExt;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let channel = Channel::from_static("https://127.0.0.1:58008").connect().await?;
    let mut client = LigoloClient::new(channel);

    for session in client.list_sessions().await? {
        println!("{} ({}) connected={} relaying={}", session.alias, session.id, session.is_connected, session.is_relaying);
    }

    let mut events = client.event_stream().await?;
    while let Some(event) = events.next().await {
        let event = event?;
        println!("[{}] {} {} {}", event.timestamp, event.kind, event.session_id, event.detail);
    }

    Ok(())
}
