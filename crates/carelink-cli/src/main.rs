use std::io::{self, Write};
use std::sync::Arc;

use color_eyre::eyre::{eyre, Context, Result};
use owo_colors::OwoColorize;
use tokio::sync::mpsc;

use carelink_messaging::{MessagingEvent, MessagingService, Topology};
use carelink_store::{Contact, FileStore, KvStore, MemoryStore};
use carelink_transport::{Transport, WsLink};

/// Gateway URL: checked at compile time via env!, falls back to runtime
/// env var, then default.
const DEFAULT_GATEWAY_URL: &str = "ws://localhost:9110";

fn env_setting(key: &'static str, build_time: Option<&'static str>, default: &str) -> String {
    build_time
        .map(String::from)
        .or_else(|| std::env::var(key).ok())
        .unwrap_or_else(|| default.to_string())
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::builder()
                .from_env_lossy()
                .add_directive("carelink_cli=info".parse().unwrap())
                .add_directive("carelink_messaging=info".parse().unwrap())
                .add_directive("carelink_transport=info".parse().unwrap())
                .add_directive("carelink_store=info".parse().unwrap()),
        )
        .init();

    let gateway_url = env_setting(
        "CARELINK_GATEWAY_URL",
        option_env!("CARELINK_GATEWAY_URL"),
        DEFAULT_GATEWAY_URL,
    );
    let self_id = std::env::var("CARELINK_USER_ID")
        .map_err(|_| eyre!("CARELINK_USER_ID must be set to your participant id"))?;
    let self_name = std::env::var("CARELINK_USER_NAME").unwrap_or_else(|_| self_id.clone());
    let topology = match std::env::var("CARELINK_TOPOLOGY").as_deref() {
        Ok("direct") => Topology::Direct,
        _ => Topology::Shared {
            channel: std::env::var("CARELINK_SHARED_CHANNEL")
                .unwrap_or_else(|_| carelink_messaging::DEFAULT_SHARED_CHANNEL.to_string()),
        },
    };

    let kv: Arc<dyn KvStore> = match FileStore::new() {
        Ok(store) => Arc::new(store),
        Err(e) => {
            tracing::warn!(error = %e, "No data directory, contacts will not persist");
            Arc::new(MemoryStore::new())
        }
    };

    let (intake_tx, intake_rx) = mpsc::unbounded_channel();
    let link = WsLink::connect(&gateway_url, intake_tx)
        .await
        .wrap_err("Failed to connect to the messaging gateway")?;
    let transport = Arc::new(Transport::new(Box::new(link), intake_rx));

    let mut service = MessagingService::new(transport, kv, &self_id, &self_name, topology);
    let mut event_rx = service
        .take_event_receiver()
        .ok_or_else(|| eyre!("Failed to get event receiver"))?;
    let service = Arc::new(service);

    tokio::spawn(async move {
        while let Some(event) = event_rx.recv().await {
            handle_event(event);
        }
    });

    service.start().await.wrap_err("Failed to start messaging")?;

    loop {
        print_menu();
        let choice = read_line("Choice: ")?;

        match choice.trim() {
            "1" => list_contacts(&service),
            "2" => show_conversation(&service)?,
            "3" => send_message(&service).await?,
            "4" => toggle_star(&service)?,
            "5" => add_contact(&service)?,
            "6" => {
                service.refresh().await;
                println!("🔄 Refreshed");
            }
            "7" => println!("📡 Connection: {}", service.connection_status()),
            "0" => {
                println!("👋 Shutting down...");
                service.stop();
                break;
            }
            _ => println!("❌ Invalid choice"),
        }
    }

    Ok(())
}

fn print_menu() {
    println!();
    println!("╔════════════════════════════════════╗");
    println!("║        CARELINK - Messages         ║");
    println!("╠════════════════════════════════════╣");
    println!("║  1. List Contacts                  ║");
    println!("║  2. Show Conversation              ║");
    println!("║  3. Send Message                   ║");
    println!("║  4. Star / Unstar Contact          ║");
    println!("║  5. Add Contact                    ║");
    println!("║  6. Refresh Now                    ║");
    println!("║  7. Connection Status              ║");
    println!("║  0. Exit                           ║");
    println!("╚════════════════════════════════════╝");
}

fn handle_event(event: MessagingEvent) {
    match event {
        MessagingEvent::Ready => {
            println!("\n🚀 Messaging is ready!");
        }
        MessagingEvent::MessageReceived { contact_id, message } => {
            println!(
                "\n💬 {} ({}): {}",
                message.sender_name.green(),
                contact_id,
                message.text
            );
        }
        MessagingEvent::HistoryLoaded { contact_id, count } => {
            println!("\n📜 Loaded {} messages for contact {}", count, contact_id);
        }
        MessagingEvent::StatusChanged(status) => {
            println!("\n📡 Gateway {}", status.yellow());
        }
        MessagingEvent::ContactsUpdated => {}
    }
}

fn list_contacts(service: &MessagingService) {
    let contacts = service.contacts();
    if contacts.is_empty() {
        println!("📭 No contacts yet");
        return;
    }
    println!("\n📇 Contacts ({}):", contacts.len());
    for contact in contacts {
        let star = if contact.is_starred { "⭐" } else { "  " };
        println!(
            "  {} {} - {}: {}",
            star,
            contact.id,
            contact.name.cyan(),
            contact.last_message
        );
    }
}

fn show_conversation(service: &MessagingService) -> Result<()> {
    let id = read_line("Contact ID: ")?;
    let messages = service.messages_with(id.trim());
    if messages.is_empty() {
        println!("📭 No messages");
        return Ok(());
    }
    println!("\n💬 Messages ({}):", messages.len());
    for message in messages {
        println!("  [{}] {}: {}", message.timestamp, message.sender_name, message.text);
    }
    Ok(())
}

async fn send_message(service: &MessagingService) -> Result<()> {
    let to = read_line("To (contact id): ")?;
    let text = read_line("Message: ")?;

    match service.send_to(to.trim(), text.trim()).await {
        Ok(_) => println!("📤 Message sent!"),
        Err(e) => {
            // The input is echoed back so the user can retry it.
            println!("❌ Send failed: {}", e);
            println!("   Your message was: {}", text.trim());
        }
    }
    Ok(())
}

fn add_contact(service: &MessagingService) -> Result<()> {
    let id = read_line("Contact ID: ")?;
    let name = read_line("Display name: ")?;
    service
        .add_contact(Contact::new(id.trim(), name.trim()))
        .wrap_err("Failed to add contact")?;
    println!("✅ Added contact {}", id.trim());
    Ok(())
}

fn toggle_star(service: &MessagingService) -> Result<()> {
    let id = read_line("Contact ID: ")?;
    let id = id.trim();
    let starred = service
        .contacts()
        .iter()
        .find(|c| c.id == id)
        .map(|c| c.is_starred);
    match starred {
        Some(current) => {
            service.set_starred(id, !current);
            println!("{} Contact {}", if current { "☆" } else { "⭐" }, id);
        }
        None => println!("❌ No contact with id {}", id),
    }
    Ok(())
}

fn read_line(prompt: &str) -> Result<String> {
    print!("{}", prompt);
    io::stdout().flush()?;
    let mut input = String::new();
    io::stdin().read_line(&mut input)?;
    Ok(input.trim().to_string())
}
