use chrono::Utc;
use clap::{Parser, ValueEnum};
use rand::Rng;
use rumqttc::{AsyncClient, MqttOptions, QoS};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tracing::{error, info, warn};

/// Fake-device traffic generator: logs in as a registered device and
/// pushes readings over MQTT or HTTP at a fixed interval.
#[derive(Debug, Parser)]
struct Args {
    /// Base URL of the hub HTTP API
    #[arg(long, env = "HUB_URL", default_value = "http://localhost:8080")]
    hub_url: String,

    /// MQTT broker host
    #[arg(long, env = "MQTT_BROKER", default_value = "localhost")]
    broker: String,

    /// MQTT broker port
    #[arg(long, env = "MQTT_PORT", default_value_t = 1883)]
    port: u16,

    /// Registered device id
    #[arg(long, env = "DEVICE_ID")]
    device_id: i64,

    /// Plaintext device key
    #[arg(long, env = "DEVICE_KEY")]
    device_key: String,

    /// Seconds between readings
    #[arg(long, default_value_t = 5)]
    interval_secs: u64,

    /// Reading type reported with every value
    #[arg(long, default_value = "temperature")]
    reading_type: String,

    /// Transport to push readings over
    #[arg(long, value_enum, default_value_t = Transport::Mqtt)]
    transport: Transport,

    /// Seconds before the device token is refreshed
    #[arg(long, default_value_t = 600)]
    token_refresh_secs: u64,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Transport {
    Mqtt,
    Http,
}

#[derive(Debug, Serialize)]
struct Reading {
    reading_type: String,
    value: f64,
    timestamp: chrono::DateTime<Utc>,
}

#[derive(Debug, Serialize)]
struct Envelope<'a> {
    token: &'a str,
    data: Reading,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();

    info!(
        "Starting device simulator: device {} over {:?}, every {}s",
        args.device_id, args.transport, args.interval_secs
    );

    let http = reqwest::Client::new();

    let mut token = match login(&http, &args).await {
        Ok(token) => token,
        Err(e) => {
            error!("Device login failed: {}", e);
            std::process::exit(1);
        }
    };
    let mut minted_at = Instant::now();
    info!("Device {} authenticated", args.device_id);

    let mqtt_client = match args.transport {
        Transport::Mqtt => Some(connect_mqtt(&args).await),
        Transport::Http => None,
    };

    let mut rng = rand::thread_rng();
    let interval = Duration::from_secs(args.interval_secs);

    loop {
        if minted_at.elapsed() >= Duration::from_secs(args.token_refresh_secs) {
            match login(&http, &args).await {
                Ok(fresh) => {
                    token = fresh;
                    minted_at = Instant::now();
                    info!("Refreshed device token");
                }
                Err(e) => warn!("Token refresh failed, keeping old token: {}", e),
            }
        }

        let reading = Reading {
            reading_type: args.reading_type.clone(),
            value: (rng.gen_range(20.0..30.0_f64) * 100.0).round() / 100.0,
            timestamp: Utc::now(),
        };

        let result = match (&mqtt_client, args.transport) {
            (Some(client), Transport::Mqtt) => {
                publish_mqtt(client, args.device_id, &token, reading).await
            }
            _ => post_http(&http, &args, &token, reading).await,
        };

        if let Err(e) = result {
            warn!("Failed to send reading: {}", e);
        }

        sleep(interval).await;
    }
}

async fn login(http: &reqwest::Client, args: &Args) -> Result<String, reqwest::Error> {
    let response = http
        .post(format!("{}/device/token", args.hub_url))
        .form(&[
            ("device_id", args.device_id.to_string()),
            ("device_key", args.device_key.clone()),
        ])
        .send()
        .await?
        .error_for_status()?;

    Ok(response.json::<TokenResponse>().await?.access_token)
}

async fn connect_mqtt(args: &Args) -> AsyncClient {
    let client_id = format!("sim-{}-{}", args.device_id, uuid::Uuid::new_v4());
    let mut mqtt_options = MqttOptions::new(client_id, &args.broker, args.port);
    mqtt_options.set_keep_alive(Duration::from_secs(30));
    mqtt_options.set_clean_session(true);

    let (client, mut eventloop) = AsyncClient::new(mqtt_options, 100);

    tokio::spawn(async move {
        loop {
            if let Err(e) = eventloop.poll().await {
                error!("MQTT eventloop error: {}", e);
                sleep(Duration::from_secs(1)).await;
            }
        }
    });

    client
}

async fn publish_mqtt(
    client: &AsyncClient,
    device_id: i64,
    token: &str,
    reading: Reading,
) -> Result<(), Box<dyn std::error::Error>> {
    let topic = format!("devices/{}", device_id);
    let payload = serde_json::to_string(&Envelope {
        token,
        data: reading,
    })?;

    client.publish(&topic, QoS::AtMostOnce, false, payload).await?;
    Ok(())
}

async fn post_http(
    http: &reqwest::Client,
    args: &Args,
    token: &str,
    reading: Reading,
) -> Result<(), Box<dyn std::error::Error>> {
    http.post(format!("{}/devices/data", args.hub_url))
        .bearer_auth(token)
        .json(&reading)
        .send()
        .await?
        .error_for_status()?;

    Ok(())
}
