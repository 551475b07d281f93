use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use messaging_core::{
    load_config,
    store::MemoryMessageStore,
    transport::{InstrumentedTransport, MemoryTransport},
    LocalProfile, MessagingContext, MessagingEvent, SendRequest,
};
use shared::domain::{ConversationId, MessageStatus, NetworkQuality, UserId};
use storage::OfflineStore;

#[derive(Parser, Debug)]
struct Args {
    #[arg(long, default_value_t = 1)]
    conversation: i64,
    #[arg(long, default_value = "alice")]
    username: String,
    /// Start offline to demonstrate queue-and-replay on reconnect.
    #[arg(long, default_value_t = false)]
    offline_first: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt().init();
    let args = Args::parse();

    let config = load_config();
    let transport = InstrumentedTransport::new(MemoryTransport::new());
    let store = MemoryMessageStore::new();
    let offline_store = OfflineStore::new(&config.database_url).await?;
    let context = MessagingContext::new(
        config,
        transport,
        store,
        offline_store,
        LocalProfile {
            user_id: UserId(1),
            display_name: args.username.clone(),
        },
    )
    .await;

    let mut events = context.subscribe_events();
    let conversation = ConversationId(args.conversation);
    let _subscription = context.subscribe(conversation).await;

    if args.offline_first {
        context.signals.set_network(NetworkQuality::Offline);
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    context.set_typing(conversation, true);
    let message = context
        .send_message(SendRequest::text(conversation, "hello world"))
        .await?;
    println!(
        "optimistic message shown immediately: id={:?} status={:?}",
        message.id, message.status
    );
    context.set_typing(conversation, false);

    if args.offline_first {
        println!(
            "offline: {} action(s) persisted to the queue",
            context.queue.count().await
        );
        context.signals.set_network(NetworkQuality::High);
        println!("back online, replaying…");
    }

    loop {
        let event = tokio::time::timeout(Duration::from_secs(5), events.recv()).await;
        match event {
            Ok(Ok(MessagingEvent::MessageStatusChanged {
                status, message_id, ..
            })) => {
                println!("status -> {status:?} (durable id {message_id:?})");
                if status == MessageStatus::Sent {
                    break;
                }
            }
            Ok(Ok(_)) => continue,
            _ => anyhow::bail!("message never settled"),
        }
    }

    context.shutdown().await;
    Ok(())
}
