//! Two ring nodes on loopback: join, route calls and watch a key move.

use bytes::Bytes;
use ringroute::{Call, CommandRegistry, NodeConfig, RingNode, TrackOptions};
use std::sync::Arc;
use std::time::Duration;

fn registry(name: &'static str) -> Arc<CommandRegistry> {
    let registry = CommandRegistry::new();
    registry.register_fn("whoami", move |call: Call| async move {
        Ok(Bytes::from(format!("{} handled {}", name, call.key)))
    });
    Arc::new(registry)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter("ringroute=debug,info")
        .init();

    println!("Starting two ring nodes...");
    let a = RingNode::start(NodeConfig::default(), registry("a")).await?;
    let b = RingNode::start(NodeConfig::default(), registry("b")).await?;
    println!("Node a: {}", a.whoami());
    println!("Node b: {}", b.whoami());

    // Before joining, a owns every key
    println!("\n--- Tracking ---");
    let keys: Vec<String> = (0..8).map(|i| format!("user:{}", i)).collect();
    let mut trackers = Vec::new();
    for key in &keys {
        let tracker = a.track(key, TrackOptions::replica())?;
        let name = key.clone();
        tracker.on_moved(move |to| match to {
            Some(peer) => println!("  {} moved to {}", name, peer.id),
            None => println!("  {} released", name),
        });
        trackers.push(tracker);
    }

    a.join(&[b.local_addr()]).await?;
    tokio::time::sleep(Duration::from_millis(200)).await;
    println!("Members seen by a: {}", a.peers().len() + 1);

    for tracker in &trackers {
        println!("  {} replica: {:?}", tracker.key(), tracker.replica());
    }

    // Calls go wherever the key lives now
    println!("\n--- Routing ---");
    for key in &keys {
        let reply = a.request(Call::new(key.clone(), "whoami")).await?;
        println!("  {}", String::from_utf8_lossy(&reply.payload));
    }

    a.close().await?;
    b.close().await?;
    println!("\nDone.");
    Ok(())
}
