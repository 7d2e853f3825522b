//! Watches the order channel of a Supabase project and rings the terminal
//! bell when an order the viewer cares about shows up or changes status.

use std::io::Write;

use anyhow::Result;
use betty_realtime::prelude::*;
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use validator::Validate;

#[tokio::main]
async fn main() -> Result<()> {
    // Install global collector configured based on RUST_LOG env var.
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    let config = RealtimeConfig::load_from_env()?;
    config.validate()?;
    info!("Config loaded: {} ({})", config.supabase_url, config.table);

    let endpoint = SupabaseEndpoint::from_config(&config)?;
    let transport = RealtimeClient::new(endpoint.clone(), &config);
    let source = RestClient::new(endpoint)?;

    let viewer = args.identity()?;
    let provider = RealtimeProvider::new(config, transport, source);
    provider.set_identity(Some(viewer.clone()));
    if args.poll_only {
        provider.start_polling();
    } else {
        provider.open_channel(provider.config().channel_for(Some(&viewer)));
    }

    let bell = NotificationBell::new(viewer).with_alert_hook(|alert| {
        info!(
            "[{}] order {} is {} -> {}",
            alert.event_type,
            alert.label,
            alert.status,
            alert.route()
        );
        ring(&mut std::io::stdout());
    });
    bell.load(provider.hydrate().await);
    let _attached = bell.attach(&provider);

    let mut status = provider.watch_status();
    loop {
        tokio::select! {
            changed = status.changed() => {
                if changed.is_err() {
                    break;
                }
                let current = status.borrow_and_update().clone();
                match current.connection_status {
                    ConnectionState::ChannelError | ConnectionState::TimedOut => {
                        warn!("Realtime connection is {}", current.connection_status)
                    }
                    state => info!("Realtime connection is {state}"),
                }
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    info!("Shutting down with {} unread notifications", bell.badge_count());
    provider.teardown();
    Ok(())
}

#[derive(Parser, Debug)]
#[command(author, version)]
#[command(about = "Watch order notifications in real time.", long_about = None)]
struct Args {
    /// Id of the viewing user.
    user_id: String,

    /// customer, sales or admin.
    #[arg(short, long, default_value = "admin")]
    role: String,

    /// Skip the push channel and poll right away.
    #[arg(long)]
    poll_only: bool,
}

impl Args {
    fn identity(&self) -> Result<Identity> { Ok(Identity::new(&self.user_id, self.role.parse()?)) }
}

/// Writes BEL to `out`. A terminal that can't take it only costs the sound.
fn ring(out: &mut impl Write) -> bool {
    match out.write_all(b"\x07").and_then(|_| out.flush()) {
        Ok(()) => true,
        Err(e) => {
            warn!("Couldn't ring the terminal bell: {e}");
            false
        }
    }
}
