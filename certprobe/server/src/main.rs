#![deny(
    missing_docs,
    missing_debug_implementations,
    missing_copy_implementations,
    trivial_casts,
    trivial_numeric_casts,
    unsafe_code,
    unstable_features,
    unused_import_braces,
    unused_qualifications
)]

//! Answer certificate probe requests published on a NATS subject

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use async_nats::{Client, ConnectOptions, Event, Message};
use certprobe::{ProbeRequest, ProbeResult, Prober, ProtocolRange, TlsVersion};
use clap::Parser;
use env_logger::Env;
use futures::{FutureExt, StreamExt};
use log::{debug, error, info, warn};

#[derive(Debug, Parser)]
#[command(author, about, version)]
struct Opts {
    /// NATS server URL
    #[arg(long, env = "NATS_URL", default_value = "nats://127.0.0.1:4222")]
    nats_url: String,
    /// Subject to receive probe requests on
    #[arg(long, env = "NATS_CHANNEL", default_value = "get.CERT.*")]
    channel: String,
    /// Queue group shared by all instances
    #[arg(long, env = "NATS_QUEUE_GROUP", default_value = "certprobe_group")]
    queue_group: String,
    /// Timeout in seconds for requests without one
    #[arg(long, env = "DEFAULT_TIMEOUT", default_value = "10")]
    timeout: u64,
    /// Lowest TLS version offered
    #[arg(long, env = "TLS_MIN_VERSION", default_value = "1.0")]
    tls_min: TlsVersion,
    /// Highest TLS version offered
    #[arg(long, env = "TLS_MAX_VERSION", default_value = "1.3")]
    tls_max: TlsVersion,
}

impl Opts {
    fn build_prober(&self) -> anyhow::Result<Prober> {
        let prober = Prober::builder()
            .default_timeout(Duration::from_secs(self.timeout))
            .protocols(ProtocolRange {
                min: self.tls_min,
                max: self.tls_max,
            })
            .build()?;
        Ok(prober)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();

    let opts = Opts::parse();
    let prober = Arc::new(opts.build_prober()?);
    debug!("{prober:?}");

    info!("connecting to {}", opts.nats_url);
    let client = ConnectOptions::new()
        .name("certprobe")
        .retry_on_initial_connect()
        .max_reconnects(None::<usize>)
        .reconnect_delay_callback(|_| Duration::from_secs(1))
        .event_callback(|event| async move {
            match event {
                Event::Connected => info!("connected to NATS"),
                Event::Disconnected => warn!("disconnected from NATS"),
                event => warn!("NATS event: {event}"),
            }
        })
        .connect(opts.nats_url.as_str())
        .await?;

    let mut subscriber = client
        .queue_subscribe(opts.channel.clone(), opts.queue_group.clone())
        .await?;
    info!(
        "listening on {} in queue group {}",
        opts.channel, opts.queue_group
    );

    loop {
        tokio::select! {
            message = subscriber.next() => {
                let Some(message) = message else {
                    warn!("subscription to {} closed", opts.channel);
                    break;
                };
                spawn_probe(client.clone(), prober.clone(), message);
            }
            _ = tokio::signal::ctrl_c() => {
                info!("shutting down");
                break;
            }
        }
    }

    if let Err(e) = subscriber.unsubscribe().await {
        warn!("failed to unsubscribe from {}: {e}", opts.channel);
    }
    client.flush().await?;
    Ok(())
}

/// Probe in a task of its own so a panic never reaches the subscription loop
fn spawn_probe(client: Client, prober: Arc<Prober>, message: Message) {
    tokio::spawn(async move {
        let subject = message.subject.clone();
        let handled = AssertUnwindSafe(handle(client, prober, message))
            .catch_unwind()
            .await;
        if let Err(panic) = handled {
            error!("probe for {subject} panicked: {}", panic_message(&*panic));
        }
    });
}

async fn handle(client: Client, prober: Arc<Prober>, message: Message) {
    let result = respond(&prober, &message.payload).await;

    let Some(reply) = message.reply else {
        debug!("no reply subject for {result}");
        return;
    };
    let payload = match result.to_json() {
        Ok(payload) => payload,
        Err(e) => {
            error!("failed to encode result of {}: {e}", result.hostname);
            return;
        }
    };
    if let Err(e) = client.publish(reply.clone(), payload.into()).await {
        error!("failed to publish result to {reply}: {e}");
    }
}

async fn respond(prober: &Prober, payload: &[u8]) -> ProbeResult {
    prober.probe(&decode_request(payload)).await
}

/// Malformed payloads are still answered, as a probe of an empty request
fn decode_request(payload: &[u8]) -> ProbeRequest {
    match serde_json::from_slice(payload) {
        Ok(request) => request,
        Err(e) => {
            warn!(
                "malformed request {:?}: {e}",
                String::from_utf8_lossy(payload)
            );
            ProbeRequest::default()
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s
    } else {
        "unknown panic"
    }
}
